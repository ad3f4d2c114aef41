//! # Lector Core
//!
//! Vocabulary building and length-bucketed batching for machine reader
//! training. Raw question/support/answer instances are tokenized, encoded
//! against shared vocabularies and grouped into padded mini-batches of
//! similar length.
//!
//! ## Quick Start
//!
//! ```rust
//! use lector_core::{
//!     BatchConfig, BucketField, BucketedBatches, Pipeline, PipelineOptions, RawInstance,
//!     Vocabularies,
//! };
//!
//! let instances = vec![
//!     RawInstance::new("Is it raining?").with_support("It rains.").with_answer("yes"),
//!     RawInstance::new("Is the sky green?").with_support("The sky is blue.").with_answer("no"),
//! ];
//!
//! let pipeline = Pipeline::new(PipelineOptions::default()).unwrap();
//! let (dataset, mut vocabs) = pipeline.build(&instances, Vocabularies::new()).unwrap();
//! vocabs.freeze();
//!
//! let config = BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![1]);
//! let batches = BucketedBatches::new(&dataset, config).unwrap();
//! let batch = batches.epoch(0).next().unwrap();
//! assert_eq!(batch.len(), 2);
//! assert_eq!(batch.question.shape(), &[2, 5]);
//! ```
pub mod batching;
pub mod error;
pub mod pipeline;
pub mod types;
pub mod vocab;

// Re-export primary API
pub use batching::{BatchConfig, BucketField, BucketTraversal, BucketedBatches, EpochBatches};
pub use error::{LectorError, Result};
pub use pipeline::{
    CandidateMode, EncodeMode, Pipeline, PipelineOptions, PipelineOutput, Tokenizer, Vocabularies,
};
pub use types::{Batch, EncodedDataset, EncodedInstance, PaddedIds, Placeholders, RawInstance};
pub use vocab::{
    EmbeddingLookup, OOV_ID, PAD_ID, PretrainedEmbeddings, TokenId, Vocabulary,
};
