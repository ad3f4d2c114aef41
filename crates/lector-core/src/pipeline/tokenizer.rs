//! # Tokenizer
//!
//! Splits question and support strings into tokens before vocabulary lookup.

use regex::Regex;

use crate::error::Result;

/// Word runs or single punctuation characters.
const TOKEN_PATTERN: &str = r"\w+|[^\w\s]";

/// String tokenizer with optional punctuation splitting and normalization.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    pattern: Option<Regex>,
    normalize: bool,
}

impl Tokenizer {
    /// Create a tokenizer.
    ///
    /// # Arguments
    /// * `split_punctuation` - split on words and punctuation; when `false`
    ///   the input is treated as pre-tokenized and split on whitespace only
    /// * `normalize` - lowercase and trim every token
    pub fn new(split_punctuation: bool, normalize: bool) -> Result<Self> {
        let pattern = if split_punctuation {
            Some(Regex::new(TOKEN_PATTERN)?)
        } else {
            None
        };
        Ok(Self { pattern, normalize })
    }

    /// Tokenize a string.
    ///
    /// # Examples
    /// ```
    /// use lector_core::pipeline::Tokenizer;
    ///
    /// let tokenizer = Tokenizer::new(true, true).unwrap();
    /// assert_eq!(tokenizer.tokenize("Where's Bob?"), vec!["where", "'", "s", "bob", "?"]);
    /// ```
    pub fn tokenize(&self, input: &str) -> Vec<String> {
        let raw: Vec<&str> = match &self.pattern {
            Some(pattern) => pattern.find_iter(input).map(|m| m.as_str()).collect(),
            None => input.split_whitespace().collect(),
        };

        raw.into_iter()
            .map(|token| self.normalize(token))
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Normalize a single token (or a whole answer/candidate string).
    pub fn normalize(&self, text: &str) -> String {
        if self.normalize {
            text.trim().to_lowercase()
        } else {
            text.to_string()
        }
    }
}
