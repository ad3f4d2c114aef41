use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::instance::{EncodedDataset, EncodedInstance};
use crate::error::{LectorError, Result};
use crate::vocab::{PAD_ID, TokenId};

/// A dense, row-major integer array padded with [`PAD_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddedIds {
    shape: Vec<usize>,
    data: Vec<u32>,
}

impl PaddedIds {
    /// Pads rows to the longest row: shape `[rows, max_len]`.
    pub fn from_rows(rows: &[&[u32]]) -> Self {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut data = vec![PAD_ID; rows.len() * width];
        for (i, row) in rows.iter().enumerate() {
            data[i * width..i * width + row.len()].copy_from_slice(row);
        }
        Self {
            shape: vec![rows.len(), width],
            data,
        }
    }

    /// Pads a list of row groups: shape `[groups, max_rows, max_len]`.
    pub fn from_groups(groups: &[&[Vec<u32>]]) -> Self {
        let rows = groups.iter().map(|g| g.len()).max().unwrap_or(0);
        let width = groups
            .iter()
            .flat_map(|g| g.iter().map(Vec::len))
            .max()
            .unwrap_or(0);
        let mut data = vec![PAD_ID; groups.len() * rows * width];
        for (g, group) in groups.iter().enumerate() {
            for (r, row) in group.iter().enumerate() {
                let start = (g * rows + r) * width;
                data[start..start + row.len()].copy_from_slice(row);
            }
        }
        Self {
            shape: vec![groups.len(), rows, width],
            data,
        }
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Flat row-major data.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    /// Consumes the array, returning the flat data.
    pub fn into_data(self) -> Vec<u32> {
        self.data
    }

    /// The slice belonging to the `index`-th entry of the leading dimension.
    pub fn row(&self, index: usize) -> &[u32] {
        let stride: usize = self.shape.iter().skip(1).product();
        &self.data[index * stride..(index + 1) * stride]
    }
}

/// A padded mini-batch drawn from a single bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Positions of the batch's instances in the encoded dataset.
    pub indices: Vec<usize>,
    /// Bucket key the instances were drawn from.
    pub bucket: Vec<usize>,
    /// `[batch, question_len]`
    pub question: PaddedIds,
    /// `[batch]`
    pub question_lengths: Vec<u32>,
    /// `[batch, passages, passage_len]`
    pub support: PaddedIds,
    /// `[batch, passages]`
    pub support_lengths: PaddedIds,
    /// `[batch, candidates]`
    pub candidates: PaddedIds,
    /// `[batch]`
    pub candidate_lengths: Vec<u32>,
    /// `[batch, candidates]`, `1` marks a gold candidate.
    pub targets: PaddedIds,
    /// `[batch, answers]`
    pub answers: PaddedIds,
    /// `[batch]`
    pub answer_lengths: Vec<u32>,
}

impl Batch {
    /// Collates instances into a padded batch. Each field is padded to the
    /// longest value of that field among `instances`.
    pub fn collate(
        indices: Vec<usize>,
        bucket: Vec<usize>,
        instances: &[&EncodedInstance],
    ) -> Self {
        let question_rows: Vec<&[TokenId]> =
            instances.iter().map(|i| i.question.as_slice()).collect();
        let support_groups: Vec<&[Vec<TokenId>]> =
            instances.iter().map(|i| i.support.as_slice()).collect();
        let support_length_rows: Vec<Vec<u32>> = instances
            .iter()
            .map(|i| i.support.iter().map(|p| p.len() as u32).collect())
            .collect();
        let support_length_refs: Vec<&[u32]> =
            support_length_rows.iter().map(Vec::as_slice).collect();
        let candidate_rows: Vec<&[TokenId]> =
            instances.iter().map(|i| i.candidates.as_slice()).collect();
        let target_rows: Vec<&[u32]> = instances.iter().map(|i| i.targets.as_slice()).collect();
        let answer_rows: Vec<&[TokenId]> = instances.iter().map(|i| i.answers.as_slice()).collect();

        Self {
            indices,
            bucket,
            question: PaddedIds::from_rows(&question_rows),
            question_lengths: lengths(&question_rows),
            support: PaddedIds::from_groups(&support_groups),
            support_lengths: PaddedIds::from_rows(&support_length_refs),
            candidates: PaddedIds::from_rows(&candidate_rows),
            candidate_lengths: lengths(&candidate_rows),
            targets: PaddedIds::from_rows(&target_rows),
            answers: PaddedIds::from_rows(&answer_rows),
            answer_lengths: lengths(&answer_rows),
        }
    }

    /// Number of instances in the batch.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns `true` for a batch without instances.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Shape of the named field, or `None` for an unknown name.
    pub fn shape_of(&self, field: &str) -> Option<Vec<usize>> {
        let shape = match field {
            "question" => self.question.shape().to_vec(),
            "question_lengths" => vec![self.question_lengths.len()],
            "support" => self.support.shape().to_vec(),
            "support_lengths" => self.support_lengths.shape().to_vec(),
            "candidates" => self.candidates.shape().to_vec(),
            "candidate_lengths" => vec![self.candidate_lengths.len()],
            "targets" => self.targets.shape().to_vec(),
            "answers" => self.answers.shape().to_vec(),
            "answer_lengths" => vec![self.answer_lengths.len()],
            _ => return None,
        };
        Some(shape)
    }

    /// Candidate position of the first gold target of the `row`-th instance.
    pub fn first_target(&self, row: usize) -> Option<usize> {
        self.targets.row(row).iter().position(|&t| t == 1)
    }

    /// The unpadded question of the `row`-th instance.
    pub fn unpadded_question(&self, row: usize) -> &[u32] {
        &self.question.row(row)[..self.question_lengths[row] as usize]
    }
}

fn lengths(rows: &[&[u32]]) -> Vec<u32> {
    rows.iter().map(|r| r.len() as u32).collect()
}

/// Element type of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    /// Unsigned 32-bit integers.
    U32,
}

/// Expected rank and element type of one batch field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub rank: usize,
    pub dtype: IdType,
}

impl PlaceholderSpec {
    const fn ids(rank: usize) -> Self {
        Self {
            rank,
            dtype: IdType::U32,
        }
    }
}

/// The contract between batches and a model graph: which fields a batch
/// carries and their shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholders {
    fields: BTreeMap<String, PlaceholderSpec>,
}

impl Placeholders {
    /// Derives the placeholders a dataset's batches will fill.
    pub fn from_dataset(dataset: &EncodedDataset) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("question".to_string(), PlaceholderSpec::ids(2));
        fields.insert("question_lengths".to_string(), PlaceholderSpec::ids(1));
        fields.insert("answers".to_string(), PlaceholderSpec::ids(2));
        fields.insert("answer_lengths".to_string(), PlaceholderSpec::ids(1));
        if dataset.has_support() {
            fields.insert("support".to_string(), PlaceholderSpec::ids(3));
            fields.insert("support_lengths".to_string(), PlaceholderSpec::ids(2));
        }
        if dataset.has_candidates() {
            fields.insert("candidates".to_string(), PlaceholderSpec::ids(2));
            fields.insert("candidate_lengths".to_string(), PlaceholderSpec::ids(1));
            fields.insert("targets".to_string(), PlaceholderSpec::ids(2));
        }
        Self { fields }
    }

    /// Spec of the named field.
    pub fn get(&self, field: &str) -> Option<&PlaceholderSpec> {
        self.fields.get(field)
    }

    /// Returns `true` if the named field is part of the contract.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Iterates over `(field, spec)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PlaceholderSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Verifies that every field of the contract has the expected rank and
    /// the batch's leading dimension.
    pub fn check(&self, batch: &Batch) -> Result<()> {
        for (field, spec) in &self.fields {
            let shape = batch.shape_of(field).ok_or_else(|| {
                LectorError::Configuration(format!("batch has no field `{field}`"))
            })?;
            if shape.len() != spec.rank {
                return Err(LectorError::Configuration(format!(
                    "field `{field}` has rank {}, expected {}",
                    shape.len(),
                    spec.rank
                )));
            }
            if shape[0] != batch.len() {
                return Err(LectorError::Configuration(format!(
                    "field `{field}` has leading dimension {}, expected {}",
                    shape[0],
                    batch.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(question: Vec<u32>, support: Vec<Vec<u32>>) -> EncodedInstance {
        EncodedInstance {
            question,
            support,
            candidates: vec![2, 3],
            answers: vec![2],
            targets: vec![1, 0],
            ..Default::default()
        }
    }

    #[test]
    fn test_pad_rows() {
        let padded = PaddedIds::from_rows(&[&[5, 6, 7], &[8]]);
        assert_eq!(padded.shape(), &[2, 3]);
        assert_eq!(padded.data(), &[5, 6, 7, 8, PAD_ID, PAD_ID]);
        assert_eq!(padded.row(1), &[8, PAD_ID, PAD_ID]);
    }

    #[test]
    fn test_pad_groups() {
        let a = vec![vec![2, 3]];
        let b = vec![vec![4], vec![5, 6, 7]];
        let padded = PaddedIds::from_groups(&[a.as_slice(), b.as_slice()]);
        assert_eq!(padded.shape(), &[2, 2, 3]);
        assert_eq!(padded.row(0), &[2, 3, 0, 0, 0, 0]);
        assert_eq!(padded.row(1), &[4, 0, 0, 5, 6, 7]);
    }

    #[test]
    fn test_collate_pads_to_local_max() {
        let a = instance(vec![2, 3, 4], vec![vec![5]]);
        let b = instance(vec![6], vec![vec![7, 8], vec![9]]);
        let batch = Batch::collate(vec![0, 1], vec![0], &[&a, &b]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.question.shape(), &[2, 3]);
        assert_eq!(batch.question_lengths, vec![3, 1]);
        assert_eq!(batch.unpadded_question(1), &[6]);
        assert_eq!(batch.support.shape(), &[2, 2, 2]);
        assert_eq!(batch.support_lengths.row(0), &[1, 0]);
        assert_eq!(batch.support_lengths.row(1), &[2, 1]);
    }

    #[test]
    fn test_first_target_skips_padding() {
        let mut a = instance(vec![2], Vec::new());
        a.candidates = vec![3, 4, 5];
        a.targets = vec![0, 0, 1];
        let mut b = instance(vec![2], Vec::new());
        b.candidates = vec![3];
        b.targets = vec![0];
        let batch = Batch::collate(vec![0, 1], vec![0], &[&a, &b]);

        assert_eq!(batch.first_target(0), Some(2));
        assert_eq!(batch.targets.row(1), &[0, PAD_ID, PAD_ID]);
        assert_eq!(batch.first_target(1), None);
    }

    #[test]
    fn test_placeholders_match_batches() {
        let dataset: EncodedDataset = vec![
            instance(vec![2, 3], vec![vec![4]]),
            instance(vec![5], vec![]),
        ]
        .into_iter()
        .collect();
        let placeholders = Placeholders::from_dataset(&dataset);
        assert_eq!(placeholders.get("support").map(|s| s.rank), Some(3));
        assert!(placeholders.contains("targets"));

        let refs: Vec<&EncodedInstance> = dataset.iter().collect();
        let batch = Batch::collate(vec![0, 1], vec![0], &refs);
        assert!(placeholders.check(&batch).is_ok());
    }

    #[test]
    fn test_placeholders_without_support_or_candidates() {
        let dataset: EncodedDataset = vec![EncodedInstance {
            question: vec![2],
            answers: vec![3],
            ..Default::default()
        }]
        .into_iter()
        .collect();
        let placeholders = Placeholders::from_dataset(&dataset);
        assert!(!placeholders.contains("support"));
        assert!(!placeholders.contains("candidates"));
        assert_eq!(placeholders.iter().count(), 4);
    }
}
