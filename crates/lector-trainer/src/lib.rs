//! # Lector Trainer
//!
//! Command-line training driver for bag-of-embeddings machine readers.
//! Loads JSON reader datasets, builds vocabularies with `lector-core`,
//! trains a candle model over length-bucketed batches and reports loss,
//! throughput and evaluation metrics through hooks.

pub mod config;
pub mod context;
pub mod data;
pub mod graph;
pub mod hooks;
pub mod model;
pub mod trainer;

pub use config::{TrainArgs, TrainConfig};
pub use context::RunContext;
pub use data::{AnswerMode, LoadOptions, QuestionMode, SupportMode};
pub use graph::{
    EmbeddingStats, GraphConfig, ReaderModel, TargetField, TrainableGraph, UnknownModel,
    build_graph,
};
pub use hooks::{Hook, Metric, evaluate};
pub use trainer::{PreparedData, TrainSummary, prepare_data, prepare_instances, run_training, train};
