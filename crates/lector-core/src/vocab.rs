//! # Vocabulary
//!
//! Frequency-tracking token vocabulary with pruning, freezing and
//! pretrained-embedding bookkeeping.
//!
//! Every vocabulary reserves two ids before any token is registered:
//! [`PAD_ID`] for padding and [`OOV_ID`] for out-of-vocabulary tokens.
//! Registered tokens are numbered contiguously from [`FIRST_TOKEN_ID`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{LectorError, Result};

/// Integer id assigned to a token.
pub type TokenId = u32;

/// Reserved id used only for padding. Never assigned to a token.
pub const PAD_ID: TokenId = 0;
/// Reserved id every unknown token maps to.
pub const OOV_ID: TokenId = 1;
/// First id handed out to a registered token.
pub const FIRST_TOKEN_ID: TokenId = 2;

/// Placeholder string decoded for [`PAD_ID`].
pub const PAD_TOKEN: &str = "<PAD>";
/// Placeholder string decoded for [`OOV_ID`].
pub const OOV_TOKEN: &str = "<UNK>";

/// Source of pretrained token vectors.
pub trait EmbeddingLookup: Send + Sync {
    /// Dimension of every vector returned by [`EmbeddingLookup::lookup`].
    fn dim(&self) -> usize;

    /// Returns the vector for `token`, if one is available.
    fn lookup(&self, token: &str) -> Option<&[f32]>;

    /// Returns `true` if a vector is available for `token`.
    fn contains(&self, token: &str) -> bool {
        self.lookup(token).is_some()
    }
}

/// In-memory pretrained embeddings keyed by token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PretrainedEmbeddings {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl PretrainedEmbeddings {
    /// Creates an empty store for vectors of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
        }
    }

    /// Adds a vector, rejecting one whose length differs from the store's dimension.
    pub fn insert(&mut self, token: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(LectorError::Configuration(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        self.vectors.insert(token.into(), vector);
        Ok(())
    }

    /// Parses a JSON object mapping tokens to vectors.
    ///
    /// The dimension is taken from the first vector; all vectors must agree.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<f32>> = serde_json::from_str(json)?;
        let dim = raw.values().next().map_or(0, Vec::len);
        let mut embeddings = Self::new(dim);
        for (token, vector) in raw {
            embeddings.insert(token, vector)?;
        }
        Ok(embeddings)
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Returns `true` if no vectors are stored.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl EmbeddingLookup for PretrainedEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    fn lookup(&self, token: &str) -> Option<&[f32]> {
        self.vectors.get(token).map(Vec::as_slice)
    }
}

/// Token vocabulary.
///
/// Ids are dense and stable: once a token has an id it keeps it until the
/// vocabulary is pruned, which produces a new, renumbered vocabulary.
#[derive(Clone)]
pub struct Vocabulary {
    token_to_id: HashMap<String, TokenId>,
    id_to_token: Vec<String>,
    frequencies: Vec<u64>,
    pretrained: Vec<bool>,
    oov_tokens: HashSet<String>,
    frozen: bool,
    embeddings: Option<Arc<dyn EmbeddingLookup>>,
}

impl Vocabulary {
    /// Creates an empty vocabulary holding only the reserved ids.
    pub fn new() -> Self {
        Self {
            token_to_id: HashMap::new(),
            id_to_token: vec![PAD_TOKEN.to_string(), OOV_TOKEN.to_string()],
            frequencies: vec![0, 0],
            pretrained: vec![false, false],
            oov_tokens: HashSet::new(),
            frozen: false,
            embeddings: None,
        }
    }

    /// Attaches a pretrained embedding lookup.
    ///
    /// Tokens registered from now on are flagged when the lookup knows them;
    /// tokens already present are flagged immediately.
    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingLookup>) -> Self {
        for id in FIRST_TOKEN_ID as usize..self.id_to_token.len() {
            self.pretrained[id] = embeddings.contains(&self.id_to_token[id]);
        }
        self.embeddings = Some(embeddings);
        self
    }

    /// The attached embedding lookup, if any.
    pub fn embeddings(&self) -> Option<&Arc<dyn EmbeddingLookup>> {
        self.embeddings.as_ref()
    }

    /// Registers one occurrence of `token` and returns its id.
    ///
    /// On a frozen vocabulary this degrades to a lookup: no id is assigned and
    /// no frequency changes, but an unseen token is remembered as OOV.
    pub fn register(&mut self, token: &str) -> TokenId {
        if let Some(&id) = self.token_to_id.get(token) {
            if !self.frozen {
                self.frequencies[id as usize] += 1;
            }
            return id;
        }

        if self.frozen {
            trace!(token, "frozen vocabulary routed unseen token to OOV");
            if !self.oov_tokens.contains(token) {
                self.oov_tokens.insert(token.to_string());
            }
            return OOV_ID;
        }

        let id = self.id_to_token.len() as TokenId;
        let pretrained = self
            .embeddings
            .as_ref()
            .is_some_and(|emb| emb.contains(token));
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.push(token.to_string());
        self.frequencies.push(1);
        self.pretrained.push(pretrained);
        self.oov_tokens.remove(token);
        id
    }

    /// Strict form of [`Vocabulary::register`] that refuses any registration
    /// once the vocabulary is frozen.
    pub fn try_register(&mut self, token: &str) -> Result<TokenId> {
        if self.frozen {
            return Err(LectorError::VocabularyFrozen {
                token: token.to_string(),
            });
        }
        Ok(self.register(token))
    }

    /// Returns the id of `token`, or [`OOV_ID`] if it has none.
    pub fn id_of(&self, token: &str) -> TokenId {
        self.token_to_id.get(token).copied().unwrap_or(OOV_ID)
    }

    /// Returns `true` if `token` has its own id.
    pub fn contains(&self, token: &str) -> bool {
        self.token_to_id.contains_key(token)
    }

    /// Decodes an id. Reserved ids decode to their placeholder strings.
    pub fn token_of(&self, id: TokenId) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    /// Number of ids, reserved ids included. This is the embedding table size.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    /// Returns `true` if no token has been registered.
    pub fn is_empty(&self) -> bool {
        self.num_tokens() == 0
    }

    /// Number of registered tokens, reserved ids excluded.
    pub fn num_tokens(&self) -> usize {
        self.id_to_token.len() - FIRST_TOKEN_ID as usize
    }

    /// Frequency recorded for `id`; zero for unknown ids.
    pub fn frequency(&self, id: TokenId) -> u64 {
        self.frequencies.get(id as usize).copied().unwrap_or(0)
    }

    /// Sum of all recorded frequencies, including counts folded into OOV by pruning.
    pub fn total_frequency(&self) -> u64 {
        self.frequencies.iter().sum()
    }

    /// Returns `true` if a pretrained vector was available for `id`'s token.
    pub fn is_pretrained(&self, id: TokenId) -> bool {
        self.pretrained.get(id as usize).copied().unwrap_or(false)
    }

    /// Number of distinct tokens that ended up mapped to [`OOV_ID`].
    pub fn count_oov(&self) -> usize {
        self.oov_tokens.len()
    }

    /// Number of ids flagged as having a pretrained embedding.
    pub fn count_pretrained(&self) -> usize {
        self.pretrained.iter().filter(|&&p| p).count()
    }

    /// Registered token ids, in id order.
    pub fn token_ids(&self) -> impl Iterator<Item = TokenId> + '_ {
        FIRST_TOKEN_ID..self.id_to_token.len() as TokenId
    }

    /// Registered `(id, token)` pairs, in id order.
    pub fn tokens(&self) -> impl Iterator<Item = (TokenId, &str)> + '_ {
        self.token_ids()
            .map(move |id| (id, self.id_to_token[id as usize].as_str()))
    }

    /// Stops further id assignment.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Re-enables id assignment.
    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    /// Returns `true` if the vocabulary is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns a new vocabulary that keeps only frequent tokens.
    ///
    /// Tokens with a frequency below `min_frequency` are dropped (`0`
    /// disables this), then the survivors are capped to the `max_size` most
    /// frequent (`None` or `Some(0)` disables this). Ties are broken by the
    /// order in which tokens were first seen. Survivors are renumbered by
    /// frequency rank; dropped tokens route to [`OOV_ID`] and their counts
    /// are folded into its frequency.
    pub fn prune(&self, min_frequency: u64, max_size: Option<usize>) -> Vocabulary {
        let mut survivors: Vec<TokenId> = self
            .token_ids()
            .filter(|&id| self.frequency(id) >= min_frequency)
            .collect();
        survivors.sort_by(|&a, &b| {
            self.frequency(b)
                .cmp(&self.frequency(a))
                .then_with(|| a.cmp(&b))
        });
        if let Some(max_size) = max_size.filter(|&m| m > 0) {
            survivors.truncate(max_size);
        }

        let mut pruned = Vocabulary::new();
        pruned.frozen = self.frozen;
        pruned.embeddings = self.embeddings.clone();
        pruned.oov_tokens = self.oov_tokens.clone();
        pruned.frequencies[OOV_ID as usize] = self.frequency(OOV_ID);

        let mut kept = vec![false; self.len()];
        for &old_id in &survivors {
            kept[old_id as usize] = true;
            let token = &self.id_to_token[old_id as usize];
            let new_id = pruned.id_to_token.len() as TokenId;
            pruned.token_to_id.insert(token.clone(), new_id);
            pruned.id_to_token.push(token.clone());
            pruned.frequencies.push(self.frequency(old_id));
            pruned.pretrained.push(self.is_pretrained(old_id));
        }

        for id in self.token_ids() {
            if !kept[id as usize] {
                pruned
                    .oov_tokens
                    .insert(self.id_to_token[id as usize].clone());
                pruned.frequencies[OOV_ID as usize] += self.frequency(id);
            }
        }

        debug!(
            kept = pruned.num_tokens(),
            dropped = self.num_tokens() - pruned.num_tokens(),
            min_frequency,
            ?max_size,
            "pruned vocabulary"
        );
        pruned
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("tokens", &self.num_tokens())
            .field("oov", &self.count_oov())
            .field("pretrained", &self.count_pretrained())
            .field("frozen", &self.frozen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(tokens: &[&str]) -> Vocabulary {
        let mut vocab = Vocabulary::new();
        for token in tokens {
            vocab.register(token);
        }
        vocab
    }

    #[test]
    fn test_first_seen_ids() {
        let vocab = build(&["the", "cat", "the", "sat"]);
        assert_eq!(vocab.id_of("the"), FIRST_TOKEN_ID);
        assert_eq!(vocab.id_of("cat"), FIRST_TOKEN_ID + 1);
        assert_eq!(vocab.id_of("sat"), FIRST_TOKEN_ID + 2);
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.frequency(vocab.id_of("the")), 2);
    }

    #[test]
    fn test_frequency_sums_to_occurrences() {
        let tokens = ["a", "b", "a", "c", "d", "a", "b"];
        let vocab = build(&tokens);
        assert_eq!(vocab.total_frequency(), tokens.len() as u64);
        assert_eq!(vocab.count_oov() + vocab.num_tokens(), 4);

        let pruned = vocab.prune(2, None);
        assert_eq!(pruned.total_frequency(), tokens.len() as u64);
        assert_eq!(pruned.count_oov() + pruned.num_tokens(), 4);
    }

    #[test]
    fn test_prune_min_frequency_scenario() {
        let vocab = build(&["a", "a", "b", "c"]).prune(2, Some(10));
        assert_eq!(vocab.num_tokens(), 1);
        assert_eq!(vocab.id_of("a"), FIRST_TOKEN_ID);
        assert_eq!(vocab.id_of("b"), OOV_ID);
        assert_eq!(vocab.id_of("c"), OOV_ID);
        assert_eq!(vocab.count_oov(), 2);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let vocab = build(&["x", "y", "y", "z", "z", "z", "w", "w", "v"]);
        let once = vocab.prune(2, Some(2));
        let twice = once.prune(2, Some(2));

        let once_ids: Vec<_> = once.tokens().map(|(id, t)| (id, t.to_string())).collect();
        let twice_ids: Vec<_> = twice.tokens().map(|(id, t)| (id, t.to_string())).collect();
        assert_eq!(once_ids, twice_ids);
        assert_eq!(once.count_oov(), twice.count_oov());
    }

    #[test]
    fn test_prune_max_size_ties_follow_first_seen() {
        let vocab = build(&["p", "q", "r", "q", "p", "r", "s"]);
        let pruned = vocab.prune(0, Some(2));
        assert_eq!(pruned.id_of("p"), FIRST_TOKEN_ID);
        assert_eq!(pruned.id_of("q"), FIRST_TOKEN_ID + 1);
        assert_eq!(pruned.id_of("r"), OOV_ID);
        assert_eq!(pruned.id_of("s"), OOV_ID);
    }

    #[test]
    fn test_prune_disabled_keeps_everything() {
        let vocab = build(&["a", "b", "b"]);
        let pruned = vocab.prune(0, Some(0));
        assert_eq!(pruned.num_tokens(), 2);
        assert_eq!(pruned.count_oov(), 0);
        // renumbered by frequency rank
        assert_eq!(pruned.id_of("b"), FIRST_TOKEN_ID);
    }

    #[test]
    fn test_empty_vocabulary_lookups() {
        let vocab = Vocabulary::new();
        assert!(vocab.is_empty());
        assert_eq!(vocab.id_of(""), OOV_ID);
        assert_eq!(vocab.id_of("anything"), OOV_ID);
        assert_eq!(vocab.token_of(OOV_ID), Some(OOV_TOKEN));
        assert_eq!(vocab.token_of(PAD_ID), Some(PAD_TOKEN));
        assert_eq!(vocab.token_of(99), None);
    }

    #[test]
    fn test_frozen_register_routes_to_oov() {
        let mut vocab = build(&["known"]);
        vocab.freeze();

        assert_eq!(vocab.register("known"), FIRST_TOKEN_ID);
        assert_eq!(vocab.frequency(FIRST_TOKEN_ID), 1);
        assert_eq!(vocab.register("unseen"), OOV_ID);
        assert_eq!(vocab.register("unseen"), OOV_ID);
        assert_eq!(vocab.num_tokens(), 1);
        assert_eq!(vocab.count_oov(), 1);
        assert_eq!(vocab.id_of("unseen"), OOV_ID);
    }

    #[test]
    fn test_try_register_rejects_when_frozen() {
        let mut vocab = Vocabulary::new();
        assert!(vocab.try_register("a").is_ok());
        vocab.freeze();
        let err = vocab.try_register("b").unwrap_err();
        assert!(matches!(err, LectorError::VocabularyFrozen { .. }));

        vocab.unfreeze();
        assert_eq!(vocab.try_register("b").unwrap(), FIRST_TOKEN_ID + 1);
    }

    #[test]
    fn test_reregistering_pruned_token_leaves_oov() {
        let mut pruned = build(&["a", "a", "b"]).prune(2, None);
        assert_eq!(pruned.count_oov(), 1);
        let id = pruned.register("b");
        assert_ne!(id, OOV_ID);
        assert_eq!(pruned.count_oov(), 0);
    }

    #[test]
    fn test_decode_round_trip() {
        let vocab = build(&["alpha", "beta", "gamma"]);
        for token in ["alpha", "beta", "gamma"] {
            assert_eq!(vocab.token_of(vocab.id_of(token)), Some(token));
        }
        assert_eq!(vocab.token_of(vocab.id_of("delta")), Some(OOV_TOKEN));
    }

    #[test]
    fn test_pretrained_flags() {
        let mut emb = PretrainedEmbeddings::new(2);
        emb.insert("cat", vec![0.1, 0.2]).unwrap();
        emb.insert("dog", vec![0.3, 0.4]).unwrap();

        let mut vocab = Vocabulary::new().with_embeddings(Arc::new(emb));
        for token in ["cat", "mouse", "dog", "cat"] {
            vocab.register(token);
        }
        assert_eq!(vocab.count_pretrained(), 2);
        assert!(vocab.is_pretrained(vocab.id_of("cat")));
        assert!(!vocab.is_pretrained(vocab.id_of("mouse")));

        let pruned = vocab.prune(2, None);
        assert_eq!(pruned.count_pretrained(), 1);
    }

    #[test]
    fn test_embeddings_from_json() {
        let emb = PretrainedEmbeddings::from_json_str(r#"{"a": [1.0, 2.0], "b": [3.0, 4.0]}"#)
            .unwrap();
        assert_eq!(emb.dim(), 2);
        assert_eq!(emb.len(), 2);
        assert_eq!(emb.lookup("b"), Some(&[3.0, 4.0][..]));

        let err = PretrainedEmbeddings::from_json_str(r#"{"a": [1.0], "b": [3.0, 4.0]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_vocabulary_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Vocabulary>();
    }
}
