//! Named calibration datasets and where their records come from

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::{TemperError, TemperResult};

/// Environment variable overriding the root of [`LocalDatasetProvider::from_env`]
pub const DATASETS_DIR_ENV: &str = "TEMPER_DATASETS_DIR";

const DEFAULT_DATASETS_DIR: &str = "./datasets";

/// How samples are drawn from a dataset's documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Join every document into one stream and slice it contiguously
    Concatenate,
    /// Pick random windows out of individual long-enough documents
    RandomWindows,
}

/// A dataset resolved to its canonical location and reading policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub config: Option<String>,
    pub text_column: String,
    pub strategy: SamplingStrategy,
}

impl DatasetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            text_column: "text".to_string(),
            strategy: SamplingStrategy::Concatenate,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_text_column(mut self, column: impl Into<String>) -> Self {
        self.text_column = column.into();
        self
    }

    pub fn with_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Maps a dataset alias onto its canonical spec.
///
/// Unknown names are passed through with their default configuration.
pub fn resolve_alias(alias: &str) -> DatasetSpec {
    match alias {
        "wikitext2" => DatasetSpec::new("wikitext").with_config("wikitext-2-raw-v1"),
        "ptb" => DatasetSpec::new("ptb_text_only")
            .with_config("penn_treebank")
            .with_text_column("sentence"),
        "c4" => DatasetSpec::new("allenai/c4")
            .with_config("en")
            .with_strategy(SamplingStrategy::RandomWindows),
        other => {
            warn!(dataset = other, "No specific alias found; loading with its default configuration");
            DatasetSpec::new(other)
        }
    }
}

/// Source of raw text records for named datasets
pub trait DatasetProvider: Send + Sync {
    /// Reads the text column of up to `limit` records of `split`, in order.
    fn load_texts(&self, spec: &DatasetSpec, split: &str, limit: Option<usize>) -> TemperResult<Vec<String>>;
}

/// Reads JSON-lines files laid out as `<root>/<name>/<config or "default">/<split>.jsonl`
#[derive(Debug, Clone)]
pub struct LocalDatasetProvider {
    root: PathBuf,
}

impl LocalDatasetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var_os(DATASETS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASETS_DIR));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, spec: &DatasetSpec, split: &str) -> PathBuf {
        self.root
            .join(&spec.name)
            .join(spec.config.as_deref().unwrap_or("default"))
            .join(format!("{}.jsonl", split))
    }
}

impl DatasetProvider for LocalDatasetProvider {
    fn load_texts(&self, spec: &DatasetSpec, split: &str, limit: Option<usize>) -> TemperResult<Vec<String>> {
        let path = self.path_for(spec, split);
        if !path.is_file() {
            return Err(TemperError::config(format!(
                "Dataset '{}' has no local data at {}",
                spec.name,
                path.display()
            )));
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut texts = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            if limit.map_or(false, |limit| texts.len() >= limit) {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: serde_json::Value = serde_json::from_str(&line).map_err(|e| {
                TemperError::DatasetError(format!("{}:{}: {}", path.display(), line_number + 1, e))
            })?;
            let text = record
                .get(&spec.text_column)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    TemperError::DatasetError(format!(
                        "{}:{}: record has no string column '{}'",
                        path.display(),
                        line_number + 1,
                        spec.text_column
                    ))
                })?;
            texts.push(text.to_string());
        }

        debug!(dataset = %spec.name, records = texts.len(), path = %path.display(), "Loaded dataset records");
        Ok(texts)
    }
}
