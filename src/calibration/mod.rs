//! Calibration data: tokenizers, dataset sources, and fixed-length sample sets

pub mod datasets;
pub mod loader;
pub mod tokenizer;

pub use crate::config::DatasetSource;
pub use datasets::{resolve_alias, DatasetProvider, DatasetSpec, LocalDatasetProvider, SamplingStrategy};
pub use loader::{get_dataloader, CalibrationSet};
pub use tokenizer::{CharTokenizer, Tokenizer, WordTokenizer};
