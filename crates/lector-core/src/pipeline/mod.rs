pub mod encoder;
pub mod tokenizer;

pub use encoder::{
    CandidateMode, EOS_TOKEN, EncodeMode, Pipeline, PipelineOptions, PipelineOutput, SOS_TOKEN,
    Vocabularies,
};
pub use tokenizer::Tokenizer;
