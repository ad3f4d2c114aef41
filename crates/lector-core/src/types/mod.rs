pub mod batch;
pub mod instance;

pub use batch::{Batch, IdType, PaddedIds, PlaceholderSpec, Placeholders};
pub use instance::{EncodedDataset, EncodedInstance, RawInstance};
