use serde::{Deserialize, Serialize};

use crate::vocab::TokenId;

/// A raw reader instance as produced by a data loader.
///
/// `question` is optional so that loaders can report what they found and
/// leave validation to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstance {
    /// Identifier carried through from the source file.
    pub id: Option<String>,
    /// Question text. Required.
    pub question: Option<String>,
    /// Supporting passages, possibly none.
    pub support: Vec<String>,
    /// Candidate answers.
    pub candidates: Vec<String>,
    /// Gold answers.
    pub answers: Vec<String>,
}

impl RawInstance {
    /// Creates an instance with only a question.
    #[must_use]
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: Some(question.into()),
            ..Self::default()
        }
    }

    /// Sets the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds a supporting passage.
    #[must_use]
    pub fn with_support(mut self, passage: impl Into<String>) -> Self {
        self.support.push(passage.into());
        self
    }

    /// Adds candidate answers.
    #[must_use]
    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates.extend(candidates.into_iter().map(Into::into));
        self
    }

    /// Adds a gold answer.
    #[must_use]
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answers.push(answer.into());
        self
    }
}

/// An instance whose token sequences have been replaced by ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedInstance {
    /// Identifier carried through from the raw instance.
    pub id: Option<String>,
    /// Question token ids.
    pub question: Vec<TokenId>,
    /// Token ids of each supporting passage.
    pub support: Vec<Vec<TokenId>>,
    /// Candidate ids (candidate vocabulary), negatives included.
    pub candidates: Vec<TokenId>,
    /// Gold answer ids (answer vocabulary).
    pub answers: Vec<TokenId>,
    /// `1` where the candidate at the same position is a gold answer.
    pub targets: Vec<u32>,
}

impl EncodedInstance {
    /// Length of the longest supporting passage, or `0` without support.
    pub fn max_support_len(&self) -> usize {
        self.support.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// An encoded dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedDataset {
    instances: Vec<EncodedInstance>,
}

impl EncodedDataset {
    /// Wraps encoded instances.
    pub fn new(instances: Vec<EncodedInstance>) -> Self {
        Self { instances }
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` if there are no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance at `index`.
    pub fn get(&self, index: usize) -> Option<&EncodedInstance> {
        self.instances.get(index)
    }

    /// All instances, in input order.
    pub fn instances(&self) -> &[EncodedInstance] {
        &self.instances
    }

    /// Iterates over instances in input order.
    pub fn iter(&self) -> std::slice::Iter<'_, EncodedInstance> {
        self.instances.iter()
    }

    /// Returns `true` if any instance has at least one supporting passage.
    pub fn has_support(&self) -> bool {
        self.instances.iter().any(|i| !i.support.is_empty())
    }

    /// Returns `true` if any instance has candidates.
    pub fn has_candidates(&self) -> bool {
        self.instances.iter().any(|i| !i.candidates.is_empty())
    }
}

impl<'a> IntoIterator for &'a EncodedDataset {
    type Item = &'a EncodedInstance;
    type IntoIter = std::slice::Iter<'a, EncodedInstance>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

impl FromIterator<EncodedInstance> for EncodedDataset {
    fn from_iter<T: IntoIterator<Item = EncodedInstance>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
