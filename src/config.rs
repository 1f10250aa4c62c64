//! Configuration for GPTQ quantization runs

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{TemperError, TemperResult};

/// Where calibration text comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    /// A dataset alias (`wikitext2`, `ptb`, `c4`) or any name the provider can resolve
    Named(String),
    /// Raw documents, joined with a blank line before tokenization
    Texts(Vec<String>),
    /// Pre-tokenized records, flattened and concatenated in order
    Tokens(Vec<Vec<u32>>),
}

impl DatasetSource {
    pub fn named(name: impl Into<String>) -> Self {
        DatasetSource::Named(name.into())
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DatasetSource::Texts(texts.into_iter().map(Into::into).collect())
    }

    pub fn from_token_batches<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Vec<u32>>,
    {
        DatasetSource::Tokens(batches.into_iter().collect())
    }
}

impl Default for DatasetSource {
    fn default() -> Self {
        DatasetSource::Named("wikitext2".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GptqConfig {
    pub dataset: DatasetSource,
    pub wbits: u8,
    pub nsamples: usize,
    pub seqlen: usize,
    pub percdamp: f32,
    /// Columns per quantization group; `None` keeps one set of parameters per row
    pub group_size: Option<usize>,
    pub symmetric: bool,
    pub act_order: bool,
    /// Column block width of the lazy-batch update
    pub block_size: usize,
    pub seed: u64,
    /// Extra held-out samples scored for perplexity after quantization
    pub eval_samples: usize,
    pub ignore_token: Option<u32>,
    pub parallel_sublayers: bool,
}

impl Default for GptqConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetSource::default(),
            wbits: 4,
            nsamples: 128,
            seqlen: 512,
            percdamp: 0.01,
            group_size: Some(128),
            symmetric: false,
            act_order: false,
            block_size: 128,
            seed: 0,
            eval_samples: 0,
            ignore_token: Some(1),
            parallel_sublayers: false,
        }
    }
}

impl GptqConfig {
    pub fn new(dataset: DatasetSource) -> Self {
        Self {
            dataset,
            ..Self::default()
        }
    }

    /// Largest representable quantization level, `2^wbits - 1`
    pub fn maxq(&self) -> u32 {
        1u32.checked_shl(self.wbits as u32).map_or(u32::MAX, |v| v - 1)
    }

    /// Rejects settings the solver cannot honor, before any calibration work starts.
    pub fn validate(&self) -> TemperResult<()> {
        if !(2..=8).contains(&self.wbits) {
            return Err(TemperError::config(format!(
                "Unsupported bit-width {}; wbits must be between 2 and 8",
                self.wbits
            )));
        }
        if self.nsamples == 0 {
            return Err(TemperError::config("nsamples must be greater than zero"));
        }
        if self.seqlen == 0 {
            return Err(TemperError::config("seqlen must be greater than zero"));
        }
        if !(self.percdamp > 0.0) || !self.percdamp.is_finite() {
            return Err(TemperError::config(format!(
                "percdamp must be a positive finite number, got {}",
                self.percdamp
            )));
        }
        if self.group_size == Some(0) {
            return Err(TemperError::config("group_size must be greater than zero"));
        }
        if self.block_size == 0 {
            return Err(TemperError::config("block_size must be greater than zero"));
        }
        if let DatasetSource::Named(name) = &self.dataset {
            if name.trim().is_empty() {
                return Err(TemperError::config("dataset name is empty"));
            }
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> TemperResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: GptqConfig = serde_json::from_str(&content)
            .map_err(|e| TemperError::config(format!("Failed to parse config file {:?}: {}", path, e)))?;
        config.validate()?;

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> TemperResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }
}

/// Fluent construction of a validated [`GptqConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: GptqConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(mut self, dataset: DatasetSource) -> Self {
        self.config.dataset = dataset;
        self
    }

    pub fn wbits(mut self, wbits: u8) -> Self {
        self.config.wbits = wbits;
        self
    }

    pub fn nsamples(mut self, nsamples: usize) -> Self {
        self.config.nsamples = nsamples;
        self
    }

    pub fn seqlen(mut self, seqlen: usize) -> Self {
        self.config.seqlen = seqlen;
        self
    }

    pub fn percdamp(mut self, percdamp: f32) -> Self {
        self.config.percdamp = percdamp;
        self
    }

    pub fn group_size(mut self, group_size: Option<usize>) -> Self {
        self.config.group_size = group_size;
        self
    }

    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.config.symmetric = symmetric;
        self
    }

    pub fn act_order(mut self, act_order: bool) -> Self {
        self.config.act_order = act_order;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn eval_samples(mut self, eval_samples: usize) -> Self {
        self.config.eval_samples = eval_samples;
        self
    }

    pub fn ignore_token(mut self, ignore_token: Option<u32>) -> Self {
        self.config.ignore_token = ignore_token;
        self
    }

    pub fn parallel_sublayers(mut self, parallel: bool) -> Self {
        self.config.parallel_sublayers = parallel;
        self
    }

    /// Arbitrary edits in one closure
    pub fn configure(mut self, f: impl FnOnce(&mut GptqConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> TemperResult<GptqConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
