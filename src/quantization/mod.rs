//! GPTQ post-training quantization
//!
//! [`quantizer`] holds the uniform affine grid, [`gptq`] the per-layer Hessian
//! solver, and [`pipeline`] drives both across the blocks of a model.

pub mod capture;
pub mod discovery;
pub mod evaluation;
pub mod gptq;
pub mod pipeline;
pub mod quantizer;

pub use capture::{capture_block_inputs, CapturedInputs, InputRecorder};
pub use discovery::{discover_structure, find_layers_in_block_mut, DiscoveredModel, LayerRegistry, StructureSource};
pub use evaluation::evaluate_perplexity;
pub use gptq::{FasterQuantOptions, Gptq, LayerReport};
pub use pipeline::{
    apply_gptq_layerwise, quantize_model, quantize_model_with_provider, BlockSummary, GptqPipeline, PipelineObserver,
    QuantizationSummary, Stage,
};
pub use quantizer::{group_ranges, quantize_value, GroupParams, QuantizationParams, QuantizationScheme, Quantizer};
