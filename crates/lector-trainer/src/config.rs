//! Command-line arguments and the run configuration derived from them.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser};
use lector_core::{BatchConfig, BucketField, BucketTraversal, CandidateMode, PipelineOptions};
use serde::{Deserialize, Serialize};

use crate::data::{AnswerMode, LoadOptions, QuestionMode, SupportMode};

const DEFAULT_DATA: &str = "data/overfit.json";

/// Train and evaluate a machine reader.
#[derive(Parser, Debug, Clone)]
#[command(name = "train", version, about = "Train and evaluate a machine reader")]
pub struct TrainArgs {
    /// Use the first `debug_examples` training instances for train, dev and test
    #[arg(long, action = ArgAction::SetTrue)]
    pub debug: bool,

    /// Number of instances loaded in debug mode
    #[arg(long = "debug_examples", default_value_t = 10)]
    pub debug_examples: usize,

    /// Training file
    #[arg(long, default_value = DEFAULT_DATA)]
    pub train: PathBuf,

    /// Development file
    #[arg(long, default_value = DEFAULT_DATA)]
    pub dev: PathBuf,

    /// Test file
    #[arg(long, default_value = DEFAULT_DATA)]
    pub test: PathBuf,

    /// Supporting passages per instance
    #[arg(long, value_enum, default_value_t = SupportMode::Single)]
    pub supports: SupportMode,

    /// Questions per file instance
    #[arg(long, value_enum, default_value_t = QuestionMode::Single)]
    pub questions: QuestionMode,

    /// Open, per-instance, or fixed candidates
    #[arg(long, default_value = "fixed")]
    pub candidates: CandidateMode,

    /// Gold answers per instance
    #[arg(long, value_enum, default_value_t = AnswerMode::Single)]
    pub answers: AnswerMode,

    #[arg(long = "batch_size", default_value_t = 128)]
    pub batch_size: usize,

    #[arg(long = "dev_batch_size", default_value_t = 128)]
    pub dev_batch_size: usize,

    /// Size of the input embeddings
    #[arg(long = "repr_dim_input", default_value_t = 100)]
    pub repr_dim_input: usize,

    /// Size of the hidden representation
    #[arg(long = "repr_dim_output", default_value_t = 100)]
    pub repr_dim_output: usize,

    /// Initialize the embedding table from pretrained vectors
    #[arg(long, action = ArgAction::SetTrue)]
    pub pretrain: bool,

    /// Keep updating pretrained vectors during training
    #[arg(long = "train_pretrain", action = ArgAction::SetTrue)]
    pub train_pretrain: bool,

    /// Scale pretrained vectors to unit length
    #[arg(long = "normalize_pretrain", action = ArgAction::SetTrue)]
    pub normalize_pretrain: bool,

    /// JSON object mapping tokens to pretrained vectors
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// Maximum vocabulary size when pruning
    #[arg(long = "vocab_maxsize", default_value_t = usize::MAX)]
    pub vocab_maxsize: usize,

    /// Minimum token frequency when pruning
    #[arg(long = "vocab_minfreq", default_value_t = 2)]
    pub vocab_minfreq: usize,

    /// Reader model
    #[arg(long, default_value = "boe_reader")]
    pub model: String,

    #[arg(long = "learning_rate", default_value_t = 0.001)]
    pub learning_rate: f64,

    /// Weight decay
    #[arg(long, default_value_t = 0.0)]
    pub l2: f64,

    /// Clip gradients to [-clip_value, clip_value]; 0 disables clipping
    #[arg(long = "clip_value", default_value_t = 0.0)]
    pub clip_value: f64,

    /// Keep probability of dropout
    #[arg(long = "drop_keep_prob", default_value_t = 0.9)]
    pub drop_keep_prob: f64,

    #[arg(long, default_value_t = 5)]
    pub epochs: usize,

    /// Split text on punctuation (default)
    #[arg(long, overrides_with = "no_tokenize", action = ArgAction::SetTrue)]
    pub tokenize: bool,

    /// Treat text as pre-tokenized
    #[arg(long = "no-tokenize", overrides_with = "tokenize", action = ArgAction::SetTrue)]
    pub no_tokenize: bool,

    /// Negative candidates sampled per instance with open candidates
    #[arg(long, default_value_t = 0)]
    pub negsamples: usize,

    /// Append evaluation metrics as JSON lines to this file
    #[arg(long = "write_metrics_to")]
    pub write_metrics_to: Option<PathBuf>,

    /// Prune the vocabulary to frequent tokens when `True`
    #[arg(long, default_value = "False")]
    pub prune: String,

    /// Summary folder; accepted for compatibility, nothing is written there
    #[arg(long = "tensorboard_folder", default_value = "./.tb/")]
    pub tensorboard_folder: PathBuf,

    #[arg(long, default_value_t = 1337)]
    pub seed: u64,

    /// Fields to bucket on, e.g. `question,support`
    #[arg(long = "bucket_order", value_delimiter = ',')]
    pub bucket_order: Vec<BucketField>,

    /// Bands per bucket field, e.g. `4,4`
    #[arg(long = "bucket_structure", value_delimiter = ',')]
    pub bucket_structure: Vec<usize>,

    /// Visit buckets in a per-epoch random order (default)
    #[arg(long = "shuffle_buckets", overrides_with = "fixed_buckets", action = ArgAction::SetTrue)]
    pub shuffle_buckets: bool,

    /// Visit buckets in ascending key order
    #[arg(long = "fixed_buckets", overrides_with = "shuffle_buckets", action = ArgAction::SetTrue)]
    pub fixed_buckets: bool,
}

/// Resolved run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub debug: bool,
    pub debug_examples: usize,
    pub train: PathBuf,
    pub dev: PathBuf,
    pub test: PathBuf,
    pub supports: SupportMode,
    pub questions: QuestionMode,
    pub candidates: CandidateMode,
    pub answers: AnswerMode,
    pub batch_size: usize,
    pub dev_batch_size: usize,
    pub repr_dim_input: usize,
    pub repr_dim_output: usize,
    pub pretrain: bool,
    pub train_pretrain: bool,
    pub normalize_pretrain: bool,
    pub embeddings: Option<PathBuf>,
    pub vocab_maxsize: usize,
    pub vocab_minfreq: usize,
    pub model: String,
    pub learning_rate: f64,
    pub l2: f64,
    pub clip_value: f64,
    pub drop_keep_prob: f64,
    pub epochs: usize,
    pub tokenize: bool,
    pub negsamples: usize,
    pub write_metrics_to: Option<PathBuf>,
    pub prune: bool,
    pub tensorboard_folder: PathBuf,
    pub seed: u64,
    pub bucket_order: Vec<BucketField>,
    pub bucket_structure: Vec<usize>,
    pub traversal: BucketTraversal,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        let (bucket_order, bucket_structure) =
            if a.bucket_order.is_empty() && a.bucket_structure.is_empty() {
                default_buckets(a.supports)
            } else {
                (a.bucket_order, a.bucket_structure)
            };
        Self {
            debug: a.debug,
            debug_examples: a.debug_examples,
            train: a.train,
            dev: a.dev,
            test: a.test,
            supports: a.supports,
            questions: a.questions,
            candidates: a.candidates,
            answers: a.answers,
            batch_size: a.batch_size,
            dev_batch_size: a.dev_batch_size,
            repr_dim_input: a.repr_dim_input,
            repr_dim_output: a.repr_dim_output,
            pretrain: a.pretrain,
            train_pretrain: a.train_pretrain,
            normalize_pretrain: a.normalize_pretrain,
            embeddings: a.embeddings,
            vocab_maxsize: a.vocab_maxsize,
            vocab_minfreq: a.vocab_minfreq,
            model: a.model,
            learning_rate: a.learning_rate,
            l2: a.l2,
            clip_value: a.clip_value,
            drop_keep_prob: a.drop_keep_prob,
            epochs: a.epochs,
            tokenize: !a.no_tokenize,
            negsamples: a.negsamples,
            write_metrics_to: a.write_metrics_to,
            prune: a.prune == "True",
            tensorboard_folder: a.tensorboard_folder,
            seed: a.seed,
            bucket_order,
            bucket_structure,
            traversal: if a.fixed_buckets {
                BucketTraversal::Fixed
            } else {
                BucketTraversal::Shuffled
            },
        }
    }
}

impl Default for TrainConfig {
    /// The configuration of a run without any command-line flags.
    fn default() -> Self {
        TrainArgs::parse_from(["train"]).into()
    }
}

/// Question and support bands when passages are used, question bands otherwise.
fn default_buckets(supports: SupportMode) -> (Vec<BucketField>, Vec<usize>) {
    match supports {
        SupportMode::None => (vec![BucketField::Question], vec![4]),
        _ => (vec![BucketField::Question, BucketField::Support], vec![4, 4]),
    }
}

impl TrainConfig {
    /// Rejects values no run can start with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.dev_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if !(self.drop_keep_prob > 0.0 && self.drop_keep_prob <= 1.0) {
            bail!("drop_keep_prob must be in (0, 1], got {}", self.drop_keep_prob);
        }
        if self.learning_rate <= 0.0 {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.bucket_order.len() != self.bucket_structure.len() {
            bail!(
                "bucket_order has {} fields but bucket_structure has {}",
                self.bucket_order.len(),
                self.bucket_structure.len()
            );
        }
        if self.pretrain && self.embeddings.is_none() {
            bail!("--pretrain needs --embeddings");
        }
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            supports: self.supports,
            questions: self.questions,
            candidates: self.candidates,
            answers: self.answers,
            max_count: self.debug.then_some(self.debug_examples),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            tokenize: self.tokenize,
            normalize: true,
            markers: false,
            negsamples: self.negsamples,
            candidate_mode: self.candidates,
            seed: self.seed,
        }
    }

    pub fn batch_config(&self, batch_size: usize) -> BatchConfig {
        BatchConfig::new(batch_size)
            .with_buckets(self.bucket_order.clone(), self.bucket_structure.clone())
            .with_traversal(self.traversal)
            .with_seed(self.seed)
    }

    /// Vocabularies are built in two passes unless both thresholds are off.
    pub fn two_pass_vocab(&self) -> bool {
        self.vocab_minfreq != 0 && self.vocab_maxsize != 0
    }

    /// Pruning size cap; `None` when effectively unbounded.
    pub fn max_vocab_size(&self) -> Option<usize> {
        (self.vocab_maxsize != usize::MAX).then_some(self.vocab_maxsize)
    }

    /// Symmetric gradient clip bound, if clipping is on.
    pub fn clip(&self) -> Option<f64> {
        (self.clip_value != 0.0).then(|| self.clip_value.abs())
    }
}
