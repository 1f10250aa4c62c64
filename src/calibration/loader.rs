//! Turning a dataset source into fixed-length calibration samples

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    calibration::{
        datasets::{resolve_alias, DatasetProvider, SamplingStrategy},
        tokenizer::Tokenizer,
    },
    config::DatasetSource,
    error::{TemperError, TemperResult},
};

/// Split read from named datasets
const CALIBRATION_SPLIT: &str = "train";

/// Documents considered per requested sample under random-window sampling
const WINDOW_POOL_FACTOR: usize = 5;

const DOCUMENT_SEPARATOR: &str = "\n\n";

/// Token-id samples of shape `(nsamples, 1, seqlen)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    samples: Array3<u32>,
}

impl CalibrationSet {
    pub fn new(samples: Array3<u32>) -> TemperResult<Self> {
        if samples.dim().1 != 1 {
            return Err(TemperError::shape_error(
                "(nsamples, 1, seqlen)",
                &format!("{:?}", samples.dim()),
                None,
            ));
        }
        Ok(Self { samples })
    }

    /// Lays `tokens` out as `nsamples` consecutive samples of `seqlen` tokens.
    pub fn from_shape_vec(nsamples: usize, seqlen: usize, tokens: Vec<u32>) -> TemperResult<Self> {
        Ok(Self {
            samples: Array3::from_shape_vec((nsamples, 1, seqlen), tokens)?,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seqlen(&self) -> usize {
        self.samples.dim().2
    }

    /// Sample `index` as a `(1, seqlen)` view
    pub fn sample(&self, index: usize) -> Option<ArrayView2<'_, u32>> {
        (index < self.len()).then(|| self.samples.index_axis(Axis(0), index))
    }

    /// Owned `(1, seqlen)` copies of every sample, in order
    pub fn iter(&self) -> impl Iterator<Item = Array2<u32>> + '_ {
        self.samples.outer_iter().map(|sample| sample.to_owned())
    }

    /// Splits into the first `at` samples and the rest.
    pub fn split_at(&self, at: usize) -> TemperResult<(CalibrationSet, CalibrationSet)> {
        if at > self.len() {
            return Err(TemperError::InvalidInput(format!(
                "Cannot split {} samples at {}",
                self.len(),
                at
            )));
        }
        Ok((
            CalibrationSet {
                samples: self.samples.slice(s![..at, .., ..]).to_owned(),
            },
            CalibrationSet {
                samples: self.samples.slice(s![at.., .., ..]).to_owned(),
            },
        ))
    }

    pub fn as_array(&self) -> &Array3<u32> {
        &self.samples
    }

    pub fn into_array(self) -> Array3<u32> {
        self.samples
    }
}

/// Produces exactly `nsamples` calibration samples of `seqlen` tokens from `source`.
///
/// Text is joined into one stream and sliced contiguously; a stream shorter than
/// `nsamples * seqlen` is repeated until it is long enough. Datasets sampled by
/// random windows draw them from a `seed`ed generator, so identical arguments
/// always give identical samples.
pub fn get_dataloader(
    tokenizer: &dyn Tokenizer,
    seqlen: usize,
    source: &DatasetSource,
    nsamples: usize,
    seed: u64,
    provider: &dyn DatasetProvider,
) -> TemperResult<CalibrationSet> {
    if seqlen == 0 || nsamples == 0 {
        return Err(TemperError::config(format!(
            "Calibration needs at least one sample of at least one token (nsamples={}, seqlen={})",
            nsamples, seqlen
        )));
    }

    let tokens = match source {
        DatasetSource::Named(alias) => {
            let spec = resolve_alias(alias);
            info!(dataset = %alias, name = %spec.name, config = ?spec.config, "Loading calibration dataset");
            match spec.strategy {
                SamplingStrategy::RandomWindows => {
                    let documents =
                        provider.load_texts(&spec, CALIBRATION_SPLIT, Some(nsamples * WINDOW_POOL_FACTOR))?;
                    return random_windows(tokenizer, &documents, seqlen, nsamples, seed);
                }
                SamplingStrategy::Concatenate => {
                    let documents = provider.load_texts(&spec, CALIBRATION_SPLIT, None)?;
                    if documents.is_empty() {
                        return Err(TemperError::config(format!("Dataset '{}' is empty", alias)));
                    }
                    tokenizer.tokenize(&documents.join(DOCUMENT_SEPARATOR))
                }
            }
        }
        DatasetSource::Texts(texts) => {
            if texts.is_empty() {
                return Err(TemperError::config("Provided dataset is empty."));
            }
            debug!(documents = texts.len(), "Tokenizing provided texts");
            tokenizer.tokenize(&texts.join(DOCUMENT_SEPARATOR))
        }
        DatasetSource::Tokens(batches) => {
            if batches.is_empty() {
                return Err(TemperError::config("Provided dataset is empty."));
            }
            debug!(records = batches.len(), "Concatenating pre-tokenized records");
            batches.concat()
        }
    };

    contiguous_samples(tokens, seqlen, nsamples)
}

fn contiguous_samples(mut tokens: Vec<u32>, seqlen: usize, nsamples: usize) -> TemperResult<CalibrationSet> {
    if tokens.is_empty() {
        return Err(TemperError::config("Calibration dataset produced no tokens"));
    }

    let required = nsamples * seqlen;
    if tokens.len() < required {
        warn!(
            tokens = tokens.len(),
            nsamples, "Dataset is too short; repeating data to generate all samples"
        );
        let repeats = (required + tokens.len() - 1) / tokens.len();
        tokens = tokens.repeat(repeats);
    }
    tokens.truncate(required);

    CalibrationSet::from_shape_vec(nsamples, seqlen, tokens)
}

fn random_windows(
    tokenizer: &dyn Tokenizer,
    documents: &[String],
    seqlen: usize,
    nsamples: usize,
    seed: u64,
) -> TemperResult<CalibrationSet> {
    let pool: Vec<Vec<u32>> = documents
        .iter()
        .map(|doc| tokenizer.tokenize(doc))
        .filter(|tokens| tokens.len() > seqlen)
        .collect();
    if pool.is_empty() {
        return Err(TemperError::config(format!(
            "Could not find any document longer than {} tokens among the first {}",
            seqlen,
            documents.len()
        )));
    }
    debug!(documents = documents.len(), usable = pool.len(), "Sampling random windows");

    let mut rng = StdRng::seed_from_u64(seed);
    let mut tokens = Vec::with_capacity(nsamples * seqlen);
    for _ in 0..nsamples {
        let doc = &pool[rng.gen_range(0..pool.len())];
        let start = rng.gen_range(0..doc.len() - seqlen);
        tokens.extend_from_slice(&doc[start..start + seqlen]);
    }

    CalibrationSet::from_shape_vec(nsamples, seqlen, tokens)
}
