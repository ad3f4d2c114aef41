//! # Instance encoder
//!
//! Turns raw instances into id sequences. In build mode tokens are
//! registered into three independent vocabularies (question and support
//! text, answers, candidates); in frozen mode the vocabularies are only read.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use oorandom::Rand64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tokenizer::Tokenizer;
use crate::error::{LectorError, Result};
use crate::types::{EncodedDataset, EncodedInstance, RawInstance};
use crate::vocab::{EmbeddingLookup, OOV_ID, TokenId, Vocabulary};

/// Marker token prepended to questions and passages.
pub const SOS_TOKEN: &str = "<SOS>";
/// Marker token appended to questions and passages.
pub const EOS_TOKEN: &str = "<EOS>";

/// Where an instance's candidate answers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateMode {
    /// No candidate list: the gold answers stand in, negatives are sampled.
    Open,
    /// Every question carries its own candidate list.
    PerInstance,
    /// One global candidate list shared by all instances.
    #[default]
    Fixed,
}

impl FromStr for CandidateMode {
    type Err = LectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "per-instance" => Ok(Self::PerInstance),
            "fixed" => Ok(Self::Fixed),
            other => Err(LectorError::Configuration(format!(
                "unknown candidate mode {other:?} (expected open, per-instance or fixed)"
            ))),
        }
    }
}

impl fmt::Display for CandidateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::PerInstance => "per-instance",
            Self::Fixed => "fixed",
        })
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Split on punctuation; otherwise the text is taken as pre-tokenized.
    pub tokenize: bool,
    /// Lowercase and trim tokens, answers and candidates.
    pub normalize: bool,
    /// Wrap question and passages in [`SOS_TOKEN`] / [`EOS_TOKEN`].
    pub markers: bool,
    /// Negative candidates drawn per instance in [`CandidateMode::Open`].
    pub negsamples: usize,
    /// Candidate source of the instances being encoded.
    pub candidate_mode: CandidateMode,
    /// Seed for negative sampling.
    pub seed: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tokenize: true,
            normalize: true,
            markers: false,
            negsamples: 0,
            candidate_mode: CandidateMode::default(),
            seed: 1337,
        }
    }
}

/// The three vocabularies an encoded dataset refers to.
#[derive(Debug, Clone, Default)]
pub struct Vocabularies {
    /// Question and support tokens.
    pub text: Vocabulary,
    /// Whole answer strings.
    pub answers: Vocabulary,
    /// Whole candidate strings.
    pub candidates: Vocabulary,
}

impl Vocabularies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches pretrained embeddings to the text vocabulary.
    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingLookup>) -> Self {
        self.text = self.text.with_embeddings(embeddings);
        self
    }

    pub fn freeze(&mut self) {
        self.text.freeze();
        self.answers.freeze();
        self.candidates.freeze();
    }

    pub fn unfreeze(&mut self) {
        self.text.unfreeze();
        self.answers.unfreeze();
        self.candidates.unfreeze();
    }

    /// `true` when all three vocabularies are frozen.
    pub fn is_frozen(&self) -> bool {
        self.text.is_frozen() && self.answers.is_frozen() && self.candidates.is_frozen()
    }

    /// Prunes the text vocabulary. Answer and candidate vocabularies are
    /// label spaces and are kept whole.
    pub fn prune(&self, min_frequency: u64, max_size: Option<usize>) -> Self {
        Self {
            text: self.text.prune(min_frequency, max_size),
            answers: self.answers.clone(),
            candidates: self.candidates.clone(),
        }
    }
}

/// How a pipeline run treats its vocabularies.
#[derive(Debug)]
pub enum EncodeMode<'a> {
    /// Register every token into the given vocabularies.
    Build(Vocabularies),
    /// Look tokens up only.
    Frozen(&'a Vocabularies),
}

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub dataset: EncodedDataset,
    /// The grown vocabularies; `None` for frozen runs.
    pub vocabularies: Option<Vocabularies>,
    /// Distinct question/support tokens that were mapped to OOV during a
    /// frozen run.
    pub unseen_tokens: usize,
}

/// Receives every string the pipeline needs an id for.
trait TokenSink {
    fn text(&mut self, token: &str) -> TokenId;
    fn answer(&mut self, answer: &str) -> TokenId;
    fn candidate(&mut self, candidate: &str) -> TokenId;
}

struct Registrar<'a>(&'a mut Vocabularies);

impl TokenSink for Registrar<'_> {
    fn text(&mut self, token: &str) -> TokenId {
        self.0.text.register(token)
    }

    fn answer(&mut self, answer: &str) -> TokenId {
        self.0.answers.register(answer)
    }

    fn candidate(&mut self, candidate: &str) -> TokenId {
        self.0.candidates.register(candidate)
    }
}

struct Lookup<'a> {
    vocabs: &'a Vocabularies,
    unseen: HashSet<String>,
}

impl TokenSink for Lookup<'_> {
    fn text(&mut self, token: &str) -> TokenId {
        let id = self.vocabs.text.id_of(token);
        if id == OOV_ID && !self.unseen.contains(token) {
            self.unseen.insert(token.to_string());
        }
        id
    }

    fn answer(&mut self, answer: &str) -> TokenId {
        self.vocabs.answers.id_of(answer)
    }

    fn candidate(&mut self, candidate: &str) -> TokenId {
        self.vocabs.candidates.id_of(candidate)
    }
}

/// Encodes raw instances into id sequences.
#[derive(Debug, Clone)]
pub struct Pipeline {
    tokenizer: Tokenizer,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Result<Self> {
        let tokenizer = Tokenizer::new(options.tokenize, options.normalize)?;
        Ok(Self { tokenizer, options })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encodes `instances` in the given mode.
    ///
    /// Fails with [`LectorError::DataFormat`] on the first instance without a
    /// question; nothing is returned for a failed run.
    pub fn run(&self, instances: &[RawInstance], mode: EncodeMode<'_>) -> Result<PipelineOutput> {
        match mode {
            EncodeMode::Build(mut vocabs) => {
                let (mut encoded, golds) = {
                    let mut sink = Registrar(&mut vocabs);
                    self.encode_all(instances, &mut sink)?
                };
                self.sample_negatives(&mut encoded, &golds, &vocabs.candidates);
                debug!(
                    instances = encoded.len(),
                    text_vocab = vocabs.text.len(),
                    answer_vocab = vocabs.answers.len(),
                    candidate_vocab = vocabs.candidates.len(),
                    "built vocabularies"
                );
                Ok(PipelineOutput {
                    dataset: EncodedDataset::new(encoded),
                    vocabularies: Some(vocabs),
                    unseen_tokens: 0,
                })
            }
            EncodeMode::Frozen(vocabs) => {
                let mut sink = Lookup {
                    vocabs,
                    unseen: HashSet::new(),
                };
                let (mut encoded, golds) = self.encode_all(instances, &mut sink)?;
                self.sample_negatives(&mut encoded, &golds, &vocabs.candidates);
                debug!(
                    instances = encoded.len(),
                    unseen = sink.unseen.len(),
                    "encoded with frozen vocabularies"
                );
                Ok(PipelineOutput {
                    dataset: EncodedDataset::new(encoded),
                    vocabularies: None,
                    unseen_tokens: sink.unseen.len(),
                })
            }
        }
    }

    /// Build-and-encode: grows `vocabs` and returns them with the dataset.
    pub fn build(
        &self,
        instances: &[RawInstance],
        vocabs: Vocabularies,
    ) -> Result<(EncodedDataset, Vocabularies)> {
        let output = self.run(instances, EncodeMode::Build(vocabs))?;
        let vocabs = output.vocabularies.unwrap_or_default();
        Ok((output.dataset, vocabs))
    }

    /// Encode-only: `vocabs` are read, never modified.
    pub fn encode(
        &self,
        instances: &[RawInstance],
        vocabs: &Vocabularies,
    ) -> Result<EncodedDataset> {
        Ok(self.run(instances, EncodeMode::Frozen(vocabs))?.dataset)
    }

    fn encode_all(
        &self,
        instances: &[RawInstance],
        sink: &mut impl TokenSink,
    ) -> Result<(Vec<EncodedInstance>, Vec<Vec<TokenId>>)> {
        let mut encoded = Vec::with_capacity(instances.len());
        let mut golds = Vec::with_capacity(instances.len());
        for (position, raw) in instances.iter().enumerate() {
            let (instance, gold) = self.encode_one(position, raw, sink)?;
            encoded.push(instance);
            golds.push(gold);
        }
        Ok((encoded, golds))
    }

    fn encode_one(
        &self,
        position: usize,
        raw: &RawInstance,
        sink: &mut impl TokenSink,
    ) -> Result<(EncodedInstance, Vec<TokenId>)> {
        let question = raw.question.as_deref().ok_or_else(|| LectorError::DataFormat {
            instance: raw.id.clone().unwrap_or_else(|| position.to_string()),
            field: "question",
        })?;

        let question = self.encode_text(question, sink);
        let support = raw
            .support
            .iter()
            .map(|passage| self.encode_text(passage, sink))
            .collect();

        let answer_texts: Vec<String> = raw
            .answers
            .iter()
            .map(|a| self.tokenizer.normalize(a))
            .collect();
        let answers = answer_texts.iter().map(|a| sink.answer(a)).collect();

        let mut candidates = Vec::with_capacity(raw.candidates.len());
        let mut targets = Vec::with_capacity(raw.candidates.len());
        for candidate in &raw.candidates {
            let text = self.tokenizer.normalize(candidate);
            targets.push(u32::from(answer_texts.contains(&text)));
            candidates.push(sink.candidate(&text));
        }
        let gold = answer_texts.iter().map(|a| sink.candidate(a)).collect();

        Ok((
            EncodedInstance {
                id: raw.id.clone(),
                question,
                support,
                candidates,
                answers,
                targets,
            },
            gold,
        ))
    }

    fn encode_text(&self, text: &str, sink: &mut impl TokenSink) -> Vec<TokenId> {
        let tokens = self.tokenizer.tokenize(text);
        let mut ids = Vec::with_capacity(tokens.len() + 2);
        if self.options.markers {
            ids.push(sink.text(SOS_TOKEN));
        }
        ids.extend(tokens.iter().map(|t| sink.text(t)));
        if self.options.markers {
            ids.push(sink.text(EOS_TOKEN));
        }
        ids
    }

    /// Appends up to `negsamples` distinct non-gold candidates per instance,
    /// drawn from the complete candidate vocabulary.
    fn sample_negatives(
        &self,
        encoded: &mut [EncodedInstance],
        golds: &[Vec<TokenId>],
        candidates: &Vocabulary,
    ) {
        if self.options.negsamples == 0 || self.options.candidate_mode != CandidateMode::Open {
            return;
        }
        let mut rng = Rand64::new(self.options.seed as u128);
        for (instance, gold) in encoded.iter_mut().zip(golds) {
            let mut pool: Vec<TokenId> = candidates
                .token_ids()
                .filter(|id| !gold.contains(id) && !instance.candidates.contains(id))
                .collect();
            let k = self.options.negsamples.min(pool.len());
            for i in 0..k {
                let j = i + rng.rand_range(0..(pool.len() - i) as u64) as usize;
                pool.swap(i, j);
            }
            instance.candidates.extend_from_slice(&pool[..k]);
            instance.targets.extend(std::iter::repeat_n(0, k));
        }
    }
}
