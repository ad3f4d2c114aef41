//! Data loading for reader datasets in the JSON instance format.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use clap::ValueEnum;
use lector_core::{CandidateMode, RawInstance, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many supporting passages an instance keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportMode {
    None,
    #[default]
    Single,
    Multiple,
}

/// How many questions of a file instance become reader instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionMode {
    #[default]
    Single,
    Multiple,
}

/// How many gold answers an instance keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    #[default]
    Single,
    Multiple,
}

/// Loader settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub supports: SupportMode,
    pub questions: QuestionMode,
    pub candidates: CandidateMode,
    pub answers: AnswerMode,
    /// Stop after this many reader instances.
    pub max_count: Option<usize>,
}

/// A text value, either bare or wrapped in an object with a `text` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextField {
    Plain(String),
    Wrapped { text: String },
}

impl TextField {
    fn into_text(self) -> String {
        match self {
            Self::Plain(text) | Self::Wrapped { text } => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReaderFile {
    #[serde(default)]
    meta: Option<serde_json::Value>,
    #[serde(default)]
    globals: Globals,
    instances: Vec<FileInstance>,
}

#[derive(Debug, Default, Deserialize)]
struct Globals {
    #[serde(default)]
    candidates: Vec<TextField>,
}

#[derive(Debug, Deserialize)]
struct FileInstance {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    support: Vec<TextField>,
    #[serde(default)]
    questions: Vec<FileQuestion>,
}

#[derive(Debug, Deserialize)]
struct FileQuestion {
    #[serde(default)]
    question: Option<TextField>,
    #[serde(default)]
    candidates: Vec<TextField>,
    #[serde(default)]
    answers: Vec<TextField>,
}

impl LoadOptions {
    /// Loads a dataset file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Vec<RawInstance>> {
        let file = File::open(path)?;
        self.from_reader(BufReader::new(file))
    }

    /// Parses a dataset from any reader.
    pub fn from_reader<R: Read>(&self, reader: R) -> Result<Vec<RawInstance>> {
        let file: ReaderFile = serde_json::from_reader(reader)?;
        Ok(self.convert(file))
    }

    /// Parses a dataset from a JSON string.
    pub fn from_json_str(&self, json: &str) -> Result<Vec<RawInstance>> {
        let file: ReaderFile = serde_json::from_str(json)?;
        Ok(self.convert(file))
    }

    fn convert(&self, file: ReaderFile) -> Vec<RawInstance> {
        if let Some(meta) = &file.meta {
            debug!(%meta, "dataset meta");
        }
        let global_candidates: Vec<String> = file
            .globals
            .candidates
            .into_iter()
            .map(TextField::into_text)
            .collect();
        let limit = self.max_count.unwrap_or(usize::MAX);

        let mut instances = Vec::new();
        'outer: for entry in file.instances {
            let id = entry.id.map(|id| match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
            let support: Vec<String> = match self.supports {
                SupportMode::None => Vec::new(),
                SupportMode::Single => entry
                    .support
                    .into_iter()
                    .take(1)
                    .map(TextField::into_text)
                    .collect(),
                SupportMode::Multiple => {
                    entry.support.into_iter().map(TextField::into_text).collect()
                }
            };
            let questions = match self.questions {
                QuestionMode::Single => 1,
                QuestionMode::Multiple => usize::MAX,
            };

            for question in entry.questions.into_iter().take(questions) {
                if instances.len() >= limit {
                    break 'outer;
                }
                let answers: Vec<String> = match self.answers {
                    AnswerMode::Single => question
                        .answers
                        .into_iter()
                        .take(1)
                        .map(TextField::into_text)
                        .collect(),
                    AnswerMode::Multiple => {
                        question.answers.into_iter().map(TextField::into_text).collect()
                    }
                };
                let candidates = match self.candidates {
                    CandidateMode::Open => answers.clone(),
                    CandidateMode::PerInstance => question
                        .candidates
                        .into_iter()
                        .map(TextField::into_text)
                        .collect(),
                    CandidateMode::Fixed => global_candidates.clone(),
                };
                instances.push(RawInstance {
                    id: id.clone(),
                    question: question.question.map(TextField::into_text),
                    support: support.clone(),
                    candidates,
                    answers,
                });
            }
        }
        instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lector_core::LectorError;

    const SAMPLE: &str = r#"{
        "meta": "sentiment",
        "globals": {"candidates": [{"text": "positive"}, {"text": "negative"}, "neutral"]},
        "instances": [
            {
                "id": "a1",
                "support": [{"text": "The food was great."}, "Service was slow."],
                "questions": [
                    {
                        "question": {"text": "food"},
                        "candidates": ["good", "bad"],
                        "answers": [{"text": "positive"}, "neutral"]
                    },
                    {"question": "service", "answers": ["negative"]}
                ]
            },
            {
                "id": 7,
                "support": ["Nothing to say."],
                "questions": [{"question": "location", "answers": ["neutral"]}]
            }
        ]
    }"#;

    #[test]
    fn test_load_defaults() {
        let instances = LoadOptions::default().from_json_str(SAMPLE).unwrap();
        assert_eq!(instances.len(), 2);

        let first = &instances[0];
        assert_eq!(first.id.as_deref(), Some("a1"));
        assert_eq!(first.question.as_deref(), Some("food"));
        assert_eq!(first.support, vec!["The food was great."]);
        assert_eq!(first.answers, vec!["positive"]);
        assert_eq!(first.candidates, vec!["positive", "negative", "neutral"]);
        assert_eq!(instances[1].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_load_multiple() {
        let options = LoadOptions {
            supports: SupportMode::Multiple,
            questions: QuestionMode::Multiple,
            answers: AnswerMode::Multiple,
            candidates: CandidateMode::PerInstance,
            max_count: None,
        };
        let instances = options.from_json_str(SAMPLE).unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].support.len(), 2);
        assert_eq!(instances[0].answers, vec!["positive", "neutral"]);
        assert_eq!(instances[0].candidates, vec!["good", "bad"]);
        assert_eq!(instances[1].question.as_deref(), Some("service"));
        assert!(instances[1].candidates.is_empty());
    }

    #[test]
    fn test_open_candidates_and_no_support() {
        let options = LoadOptions {
            supports: SupportMode::None,
            candidates: CandidateMode::Open,
            ..LoadOptions::default()
        };
        let instances = options.from_json_str(SAMPLE).unwrap();
        assert!(instances.iter().all(|i| i.support.is_empty()));
        assert!(instances.iter().all(|i| i.candidates == i.answers));
    }

    #[test]
    fn test_max_count() {
        let options = LoadOptions {
            questions: QuestionMode::Multiple,
            max_count: Some(2),
            ..LoadOptions::default()
        };
        let instances = options.from_json_str(SAMPLE).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].question.as_deref(), Some("service"));
    }

    #[test]
    fn test_missing_question_is_kept_as_none() {
        let json = r#"{"instances": [{"questions": [{"answers": ["x"]}]}]}"#;
        let instances = LoadOptions::default().from_json_str(json).unwrap();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].question.is_none());
    }

    #[test]
    fn test_invalid_json() {
        let err = LoadOptions::default().from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, LectorError::Json(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = LoadOptions::default()
            .load("definitely/not/here.json")
            .unwrap_err();
        assert!(matches!(err, LectorError::Io(_)));
    }
}
