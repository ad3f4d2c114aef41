use std::collections::BTreeMap;

use oorandom::Rand64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::buckets::{BucketField, band_edges, band_of};
use crate::error::{LectorError, Result};
use crate::types::{Batch, EncodedDataset, EncodedInstance};

/// Order in which buckets are visited within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketTraversal {
    /// Ascending bucket key.
    Fixed,
    /// Permuted with the epoch's RNG.
    #[default]
    Shuffled,
}

/// Batching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Fields whose lengths make up the bucket key, in key order.
    pub bucket_order: Vec<BucketField>,
    /// Number of bands per field of `bucket_order`.
    pub bucket_structure: Vec<usize>,
    pub traversal: BucketTraversal,
    pub seed: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            bucket_order: vec![BucketField::Question],
            bucket_structure: vec![4],
            traversal: BucketTraversal::default(),
            seed: 1337,
        }
    }
}

impl BatchConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_buckets(mut self, order: Vec<BucketField>, structure: Vec<usize>) -> Self {
        self.bucket_order = order;
        self.bucket_structure = structure;
        self
    }

    #[must_use]
    pub fn with_traversal(mut self, traversal: BucketTraversal) -> Self {
        self.traversal = traversal;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LectorError::Configuration(
                "batch size must be positive".into(),
            ));
        }
        if self.bucket_order.len() != self.bucket_structure.len() {
            return Err(LectorError::Configuration(format!(
                "bucket order has {} fields but bucket structure has {} entries",
                self.bucket_order.len(),
                self.bucket_structure.len()
            )));
        }
        if let Some(pos) = self.bucket_structure.iter().position(|&n| n == 0) {
            return Err(LectorError::Configuration(format!(
                "bucket field {} has zero bands",
                self.bucket_order[pos]
            )));
        }
        for (i, field) in self.bucket_order.iter().enumerate() {
            if self.bucket_order[..i].contains(field) {
                return Err(LectorError::Configuration(format!(
                    "bucket field {field} appears more than once"
                )));
            }
        }
        Ok(())
    }
}

/// Length-bucketed batch source over an encoded dataset.
///
/// Bucket assignment happens once, at construction; every epoch reuses it.
#[derive(Debug, Clone)]
pub struct BucketedBatches<'a> {
    dataset: &'a EncodedDataset,
    config: BatchConfig,
    edges: Vec<Vec<usize>>,
    /// Bucket key to member indices, in ascending key order.
    buckets: Vec<(Vec<usize>, Vec<usize>)>,
}

impl<'a> BucketedBatches<'a> {
    pub fn new(dataset: &'a EncodedDataset, config: BatchConfig) -> Result<Self> {
        config.validate()?;

        let edges: Vec<Vec<usize>> = config
            .bucket_order
            .iter()
            .zip(&config.bucket_structure)
            .map(|(&field, &bands)| {
                let lengths: Vec<usize> = dataset.iter().map(|i| field.length_of(i)).collect();
                band_edges(&lengths, bands)
            })
            .collect();

        let mut grouped: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
        for (index, instance) in dataset.iter().enumerate() {
            let key = config
                .bucket_order
                .iter()
                .zip(&edges)
                .map(|(&field, field_edges)| band_of(field.length_of(instance), field_edges))
                .collect();
            grouped.entry(key).or_default().push(index);
        }

        let buckets: Vec<_> = grouped.into_iter().collect();
        debug!(
            instances = dataset.len(),
            buckets = buckets.len(),
            batch_size = config.batch_size,
            "assigned instances to buckets"
        );

        Ok(Self {
            dataset,
            config,
            edges,
            buckets,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn dataset(&self) -> &'a EncodedDataset {
        self.dataset
    }

    /// Number of non-empty buckets.
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// `(bucket key, instance count)` in ascending key order.
    pub fn bucket_sizes(&self) -> Vec<(Vec<usize>, usize)> {
        self.buckets
            .iter()
            .map(|(key, members)| (key.clone(), members.len()))
            .collect()
    }

    /// Band edges computed for `field`, if it is a bucket field.
    pub fn band_edges(&self, field: BucketField) -> Option<&[usize]> {
        let pos = self.config.bucket_order.iter().position(|&f| f == field)?;
        Some(&self.edges[pos])
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.buckets
            .iter()
            .map(|(_, members)| members.len().div_ceil(self.config.batch_size))
            .sum()
    }

    /// The batch stream of epoch `epoch`.
    ///
    /// The stream depends only on the dataset, the configuration and
    /// `epoch`, so calling this twice with the same epoch yields identical
    /// batches.
    pub fn epoch(&self, epoch: u64) -> EpochBatches<'a> {
        let mut rng = Rand64::new((u128::from(self.config.seed) << 64) | u128::from(epoch));

        let mut order: Vec<usize> = (0..self.buckets.len()).collect();
        if self.config.traversal == BucketTraversal::Shuffled {
            shuffle(&mut order, &mut rng);
        }

        let mut runs = Vec::with_capacity(self.num_batches());
        for bucket in order {
            let (key, members) = &self.buckets[bucket];
            let mut members = members.clone();
            shuffle(&mut members, &mut rng);
            for chunk in members.chunks(self.config.batch_size) {
                runs.push((key.clone(), chunk.to_vec()));
            }
        }

        EpochBatches {
            dataset: self.dataset,
            runs: runs.into_iter(),
        }
    }
}

fn shuffle<T>(items: &mut [T], rng: &mut Rand64) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

/// One epoch of batches. Batches are padded when pulled.
#[derive(Debug)]
pub struct EpochBatches<'a> {
    dataset: &'a EncodedDataset,
    runs: std::vec::IntoIter<(Vec<usize>, Vec<usize>)>,
}

impl Iterator for EpochBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let (key, indices) = self.runs.next()?;
        let instances: Vec<&EncodedInstance> = indices
            .iter()
            .filter_map(|&i| self.dataset.get(i))
            .collect();
        Some(Batch::collate(indices, key, &instances))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.runs.size_hint()
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Placeholders;
    use crate::vocab::PAD_ID;

    fn dataset_with_question_lengths(lengths: &[usize]) -> EncodedDataset {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| EncodedInstance {
                question: vec![2 + i as u32; len],
                support: vec![vec![7; 1 + i % 3]],
                answers: vec![2],
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_six_instances_two_bands() {
        let dataset = dataset_with_question_lengths(&[1, 2, 3, 4, 5, 6]);
        let config = BatchConfig::new(3).with_buckets(vec![BucketField::Question], vec![2]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();

        assert_eq!(batches.num_buckets(), 2);
        assert_eq!(batches.num_batches(), 2);
        assert_eq!(batches.band_edges(BucketField::Question), Some(&[4][..]));

        let epoch: Vec<Batch> = batches.epoch(0).collect();
        assert_eq!(epoch.len(), 2);
        for batch in &epoch {
            assert_eq!(batch.len(), 3);
            let low = batch.indices.iter().all(|&i| i < 3);
            let high = batch.indices.iter().all(|&i| i >= 3);
            assert!(low || high);
        }
    }

    #[test]
    fn test_same_epoch_is_deterministic() {
        let dataset = dataset_with_question_lengths(&[3, 8, 1, 5, 5, 2, 9, 4, 7, 6, 1, 3]);
        let config = BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![3]);
        let batches = BucketedBatches::new(&dataset, config.clone()).unwrap();

        let first: Vec<Batch> = batches.epoch(4).collect();
        let second: Vec<Batch> = batches.epoch(4).collect();
        assert_eq!(first, second);

        let rebuilt = BucketedBatches::new(&dataset, config).unwrap();
        assert_eq!(first, rebuilt.epoch(4).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_instance_appears_once() {
        let lengths: Vec<usize> = (0..23).map(|i| 1 + (i * 7) % 11).collect();
        let dataset = dataset_with_question_lengths(&lengths);
        let config = BatchConfig::new(4)
            .with_buckets(vec![BucketField::Question, BucketField::Support], vec![3, 2]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();

        for epoch in 0..3 {
            let mut seen: Vec<usize> = batches
                .epoch(epoch)
                .flat_map(|b| {
                    assert!(b.len() <= 4 && !b.is_empty());
                    b.indices
                })
                .collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..23).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_partial_batch_is_emitted() {
        let dataset = dataset_with_question_lengths(&[2, 2, 2, 2, 2]);
        let config = BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![1]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();
        let sizes: Vec<usize> = batches.epoch(0).map(|b| b.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().filter(|&&s| s == 1).count(), 1);
    }

    #[test]
    fn test_padding_matches_batch_max() {
        let dataset = dataset_with_question_lengths(&[1, 4, 2, 3]);
        let config = BatchConfig::new(4).with_buckets(vec![BucketField::Question], vec![1]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();
        let placeholders = Placeholders::from_dataset(&dataset);

        let batch = batches.epoch(0).next().unwrap();
        placeholders.check(&batch).unwrap();
        assert_eq!(batch.question.shape(), &[4, 4]);
        for (row, &index) in batch.indices.iter().enumerate() {
            let original = &dataset.get(index).unwrap().question;
            assert_eq!(batch.unpadded_question(row), original.as_slice());
            assert!(batch.question.row(row)[original.len()..].iter().all(|&id| id == PAD_ID));
        }
    }

    #[test]
    fn test_fixed_traversal_ascends() {
        let dataset = dataset_with_question_lengths(&[1, 1, 5, 5, 9, 9]);
        let config = BatchConfig::new(8)
            .with_buckets(vec![BucketField::Question], vec![3])
            .with_traversal(BucketTraversal::Fixed);
        let batches = BucketedBatches::new(&dataset, config).unwrap();
        for epoch in 0..4 {
            let keys: Vec<Vec<usize>> = batches.epoch(epoch).map(|b| b.bucket).collect();
            assert_eq!(keys, vec![vec![0], vec![1], vec![2]]);
        }
    }

    #[test]
    fn test_bucket_members_reshuffle_each_epoch() {
        let dataset = dataset_with_question_lengths(&[3; 8]);
        let config = BatchConfig::new(8).with_buckets(vec![BucketField::Question], vec![1]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();

        let orders: Vec<Vec<usize>> = (0..4)
            .map(|epoch| batches.epoch(epoch).flat_map(|b| b.indices).collect())
            .collect();
        assert_ne!(orders[0], orders[1]);
        for order in &orders {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..8).collect::<Vec<_>>());
        }
        assert!(orders.iter().any(|o| *o != (0..8).collect::<Vec<_>>()));
    }

    #[test]
    fn test_shuffled_traversal_varies_between_epochs() {
        let dataset = dataset_with_question_lengths(&[1, 1, 3, 3, 5, 5, 7, 7]);
        let config = BatchConfig::new(8)
            .with_buckets(vec![BucketField::Question], vec![4])
            .with_traversal(BucketTraversal::Shuffled);
        let batches = BucketedBatches::new(&dataset, config).unwrap();
        assert_eq!(batches.num_buckets(), 4);

        let keys = |epoch| -> Vec<Vec<usize>> {
            batches.epoch(epoch).map(|b| b.bucket).collect()
        };
        let mut distinct = std::collections::BTreeSet::new();
        for epoch in 0..8 {
            let order = keys(epoch);
            assert_eq!(order, keys(epoch));
            let mut sorted = order.clone();
            sorted.sort();
            assert_eq!(sorted, vec![vec![0], vec![1], vec![2], vec![3]]);
            distinct.insert(order);
        }
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_exact_size() {
        let dataset = dataset_with_question_lengths(&[1, 2, 3, 4, 5, 6, 7]);
        let config = BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![2]);
        let batches = BucketedBatches::new(&dataset, config).unwrap();
        let mut epoch = batches.epoch(1);
        assert_eq!(epoch.len(), batches.num_batches());
        epoch.next();
        assert_eq!(epoch.len(), batches.num_batches() - 1);
    }

    #[test]
    fn test_invalid_configurations() {
        let dataset = dataset_with_question_lengths(&[1, 2]);
        let cases = [
            BatchConfig::new(0),
            BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![2, 2]),
            BatchConfig::new(2).with_buckets(vec![BucketField::Question], vec![0]),
            BatchConfig::new(2).with_buckets(
                vec![BucketField::Question, BucketField::Question],
                vec![2, 2],
            ),
        ];
        for config in cases {
            assert!(matches!(
                BucketedBatches::new(&dataset, config),
                Err(LectorError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_empty_dataset() {
        let dataset = EncodedDataset::default();
        let batches = BucketedBatches::new(&dataset, BatchConfig::default()).unwrap();
        assert_eq!(batches.num_batches(), 0);
        assert_eq!(batches.epoch(0).count(), 0);
    }
}
