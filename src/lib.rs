//! Temper - post-training GPTQ weight quantization
//!
//! Features:
//! - Hessian-based column-sequential quantization of dense layers
//! - Group-wise and activation-ordered quantization grids
//! - Automatic discovery of embeddings and transformer blocks
//! - Calibration samples from named datasets, raw text, or token streams
//! - Block-by-block orchestration with scoped activation capture

pub mod calibration;
pub mod config;
pub mod error;
pub mod nn;
pub mod quantization;
pub mod tensor;

pub use calibration::{get_dataloader, CalibrationSet, CharTokenizer, DatasetProvider, LocalDatasetProvider, Tokenizer};
pub use config::{ConfigBuilder, DatasetSource, GptqConfig};
pub use error::{TemperError, TemperResult};
pub use nn::{Layer, Model, QuantizableLayer};
pub use quantization::{
    apply_gptq_layerwise, evaluate_perplexity, quantize_model, quantize_model_with_provider, Gptq, GptqPipeline,
    QuantizationSummary, Quantizer,
};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Calling it again once a subscriber is installed is a no-op.
pub fn init() -> TemperResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!(version = version(), "Temper initialized");
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
