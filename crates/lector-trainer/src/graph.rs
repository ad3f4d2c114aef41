//! The trainable-graph capability and the closed registry of reader models.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use lector_core::{Batch, EmbeddingLookup, Vocabularies};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BoeReader, ReaderInputs};

/// Which batch field holds the labels a graph predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetField {
    /// First gold answer, an id of the answer vocabulary.
    Answers,
    /// The gold candidate, an id of the candidate vocabulary.
    Candidates,
}

impl TargetField {
    /// Gold label per batch row.
    pub fn gold(self, batch: &Batch) -> Vec<u32> {
        (0..batch.len())
            .map(|row| match self {
                Self::Answers => batch.answers.row(row).first().copied().unwrap_or(0),
                Self::Candidates => {
                    let position = batch.first_target(row).unwrap_or(0);
                    batch.candidates.row(row).get(position).copied().unwrap_or(0)
                }
            })
            .collect()
    }
}

/// Summary of a graph's embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStats {
    pub rows: usize,
    pub dim: usize,
    /// Rows initialized from pretrained vectors.
    pub pretrained: usize,
    pub trainable: bool,
    pub min: f32,
    pub max: f32,
    pub mean_abs: f32,
}

/// A model that can be optimized on and predict from padded batches.
pub trait TrainableGraph {
    /// One optimization step; returns the batch loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f32>;

    /// Predicted label per batch row, comparable with [`TargetField::gold`].
    fn predict(&self, batch: &Batch) -> Result<Vec<u32>>;

    fn target_field(&self) -> TargetField;

    fn embedding_stats(&self) -> Result<EmbeddingStats>;
}

/// Raised when a configured model name is not registered.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown model {name:?}; registered models: {}", ReaderModel::names().join(", "))]
pub struct UnknownModel {
    pub name: String,
}

/// Registered reader architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderModel {
    /// Bag of embeddings over question and support, classifies the answer.
    BoeReader,
    /// Bag of embeddings over the question only.
    BoeNosupportReader,
    /// Bag of embeddings scoring the instance's candidates.
    BoeCandsReader,
}

impl ReaderModel {
    pub const ALL: [ReaderModel; 3] = [
        ReaderModel::BoeReader,
        ReaderModel::BoeNosupportReader,
        ReaderModel::BoeCandsReader,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BoeReader => "boe_reader",
            Self::BoeNosupportReader => "boe_nosupport_reader",
            Self::BoeCandsReader => "boe_cands_reader",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|m| m.name()).collect()
    }

    pub fn target_field(self) -> TargetField {
        match self {
            Self::BoeCandsReader => TargetField::Candidates,
            _ => TargetField::Answers,
        }
    }
}

impl FromStr for ReaderModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownModel> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| UnknownModel { name: s.to_string() })
    }
}

impl fmt::Display for ReaderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hyperparameters shared by all registered models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub repr_dim_input: usize,
    pub repr_dim_output: usize,
    pub drop_keep_prob: f64,
    pub learning_rate: f64,
    pub l2: f64,
    pub clip: Option<f64>,
    pub pretrain: bool,
    pub train_pretrain: bool,
    pub normalize_pretrain: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            repr_dim_input: 100,
            repr_dim_output: 100,
            drop_keep_prob: 0.9,
            learning_rate: 0.001,
            l2: 0.0,
            clip: None,
            pretrain: false,
            train_pretrain: false,
            normalize_pretrain: false,
        }
    }
}

/// Builds the graph of `model` for the given vocabularies.
pub fn build_graph(
    model: ReaderModel,
    config: &GraphConfig,
    vocabs: &Vocabularies,
) -> Result<Box<dyn TrainableGraph>> {
    let embeddings: Option<Arc<dyn EmbeddingLookup>> = if config.pretrain {
        vocabs.text.embeddings().cloned()
    } else {
        None
    };
    let inputs = match model {
        ReaderModel::BoeReader => ReaderInputs::QuestionSupport,
        ReaderModel::BoeNosupportReader => ReaderInputs::Question,
        ReaderModel::BoeCandsReader => ReaderInputs::QuestionSupportCandidates,
    };
    let graph = BoeReader::new(inputs, config, vocabs, embeddings.as_deref())?;
    Ok(Box::new(graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lector_core::{EncodedInstance, PAD_ID};

    #[test]
    fn test_registry_round_trip() {
        for model in ReaderModel::ALL {
            assert_eq!(model.name().parse::<ReaderModel>().unwrap(), model);
        }
        assert_eq!(ReaderModel::BoeCandsReader.target_field(), TargetField::Candidates);
    }

    #[test]
    fn test_unknown_model_lists_registered_names() {
        let err = "lstm_reader".parse::<ReaderModel>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("lstm_reader"));
        assert!(message.contains("boe_reader"));
        assert!(message.contains("boe_cands_reader"));
    }

    #[test]
    fn test_gold_labels() {
        let a = EncodedInstance {
            candidates: vec![4, 5, 6],
            targets: vec![0, 0, 1],
            answers: vec![3],
            ..Default::default()
        };
        let b = EncodedInstance {
            candidates: vec![7],
            targets: vec![1],
            answers: vec![2, 9],
            ..Default::default()
        };
        let batch = Batch::collate(vec![0, 1], vec![0], &[&a, &b]);
        assert_eq!(TargetField::Answers.gold(&batch), vec![3, 2]);
        assert_eq!(TargetField::Candidates.gold(&batch), vec![6, 7]);
        assert_eq!(batch.candidates.row(1), &[7, PAD_ID, PAD_ID]);
    }
}
