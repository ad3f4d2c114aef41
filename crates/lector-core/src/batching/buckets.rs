use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LectorError, Result};
use crate::types::EncodedInstance;

/// An instance field whose length can drive bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketField {
    Question,
    /// Length of the longest supporting passage.
    Support,
    Candidates,
    Answers,
}

impl BucketField {
    /// Length of this field in `instance`.
    pub fn length_of(self, instance: &EncodedInstance) -> usize {
        match self {
            Self::Question => instance.question.len(),
            Self::Support => instance.max_support_len(),
            Self::Candidates => instance.candidates.len(),
            Self::Answers => instance.answers.len(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Support => "support",
            Self::Candidates => "candidates",
            Self::Answers => "answers",
        }
    }
}

impl FromStr for BucketField {
    type Err = LectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "question" => Ok(Self::Question),
            "support" => Ok(Self::Support),
            "candidates" => Ok(Self::Candidates),
            "answers" => Ok(Self::Answers),
            other => Err(LectorError::UnknownBucketField(other.to_string())),
        }
    }
}

impl fmt::Display for BucketField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equal-frequency band edges for `bands` bands over `lengths`.
///
/// Edge `b` (for `b` in `1..bands`) is the length at sorted rank
/// `b * n / bands`. Duplicate edges are kept so that band indices always
/// range over `0..bands`.
pub fn band_edges(lengths: &[usize], bands: usize) -> Vec<usize> {
    if lengths.is_empty() || bands < 2 {
        return Vec::new();
    }
    let mut sorted = lengths.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    (1..bands).map(|b| sorted[(b * n / bands).min(n - 1)]).collect()
}

/// Band of `length`: the number of edges it reaches.
pub fn band_of(length: usize, edges: &[usize]) -> usize {
    edges.iter().take_while(|&&edge| length >= edge).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        assert_eq!("support".parse::<BucketField>().unwrap(), BucketField::Support);
        assert_eq!(BucketField::Answers.to_string(), "answers");
        assert!(matches!(
            "passage".parse::<BucketField>(),
            Err(LectorError::UnknownBucketField(name)) if name == "passage"
        ));
    }

    #[test]
    fn test_support_length_is_longest_passage() {
        let instance = EncodedInstance {
            support: vec![vec![2; 3], vec![2; 7], vec![2]],
            ..Default::default()
        };
        assert_eq!(BucketField::Support.length_of(&instance), 7);
    }

    #[test]
    fn test_two_equal_frequency_bands() {
        let edges = band_edges(&[1, 2, 3, 4, 5, 6], 2);
        assert_eq!(edges, vec![4]);
        let bands: Vec<usize> = (1..=6).map(|l| band_of(l, &edges)).collect();
        assert_eq!(bands, vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_equal_lengths_share_a_band() {
        let lengths = [3, 3, 3, 3, 3, 9];
        let edges = band_edges(&lengths, 4);
        let bands: Vec<usize> = lengths.iter().map(|&l| band_of(l, &edges)).collect();
        assert!(bands[..5].iter().all(|&b| b == bands[0]));
        assert!(bands.iter().all(|&b| b < 4));
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(band_edges(&[], 4).is_empty());
        assert!(band_edges(&[1, 2, 3], 1).is_empty());
        assert_eq!(band_of(100, &[]), 0);
    }
}
