pub mod buckets;
pub mod iterator;

pub use buckets::{BucketField, band_edges, band_of};
pub use iterator::{BatchConfig, BucketTraversal, BucketedBatches, EpochBatches};
