//! Block-by-block GPTQ over a whole model
//!
//! Blocks are processed strictly in forward order. For each block the inputs are
//! captured at every quantizable sub-layer, each sub-layer is quantized from its
//! own Hessian, and the block is then re-run with its quantized weights to
//! produce the next block's inputs.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    calibration::{get_dataloader, CalibrationSet, DatasetProvider, LocalDatasetProvider, Tokenizer},
    config::GptqConfig,
    error::{ErrorContext, TemperResult, WithContext},
    nn::{
        layers::{Layer, QuantizableLayer},
        models::Model,
    },
    quantization::{
        capture::capture_block_inputs,
        discovery::{discover_structure, find_layers_in_block_mut, DiscoveredModel, LayerRegistry},
        evaluation::evaluate_perplexity,
        gptq::{FasterQuantOptions, Gptq, LayerReport},
        quantizer::Quantizer,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Capture,
    BuildHessian,
    Quantize,
    Propagate,
    Done,
}

/// Callbacks fired while the pipeline runs
pub trait PipelineObserver {
    fn on_stage(&mut self, _block: Option<usize>, _stage: Stage) {}

    /// Inputs about to be fed to block `block`
    fn on_block_inputs(&mut self, _block: usize, _inputs: &[Array3<f32>]) {}

    fn on_layer_quantized(&mut self, _block: usize, _report: &LayerReport) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSummary {
    pub index: usize,
    pub name: String,
    pub layers: Vec<LayerReport>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantizationSummary {
    pub blocks: Vec<BlockSummary>,
    pub calibration_samples: usize,
    pub elapsed: Duration,
    /// Held-out perplexity after quantization, when evaluation samples were requested
    pub perplexity: Option<f32>,
}

impl QuantizationSummary {
    pub fn layers(&self) -> impl Iterator<Item = &LayerReport> {
        self.blocks.iter().flat_map(|b| b.layers.iter())
    }

    pub fn layers_quantized(&self) -> usize {
        self.layers().count()
    }

    pub fn total_loss(&self) -> f64 {
        self.layers().map(|l| l.loss).sum()
    }

    pub fn layer(&self, block: usize, name: &str) -> Option<&LayerReport> {
        self.blocks
            .iter()
            .find(|b| b.index == block)
            .and_then(|b| b.layers.iter().find(|l| l.name == name))
    }
}

fn quantizer_for(config: &GptqConfig) -> TemperResult<Quantizer> {
    let mut quantizer = Quantizer::new(config.wbits)?;
    quantizer.configure(config.wbits, true, config.symmetric, config.group_size)?;
    Ok(quantizer)
}

fn fasterquant_options(config: &GptqConfig) -> FasterQuantOptions {
    FasterQuantOptions {
        block_size: config.block_size,
        percdamp: config.percdamp,
        group_size: config.group_size,
        act_order: config.act_order,
    }
}

fn build_hessian(
    name: &str,
    layer: &dyn QuantizableLayer,
    rows: &Array2<f32>,
    config: &GptqConfig,
) -> TemperResult<Gptq> {
    let mut gptq = Gptq::new(name, layer, quantizer_for(config)?);
    gptq.add_batch(rows.view())?;
    debug!(layer = name, samples = gptq.nsamples(), "Accumulated Hessian");
    Ok(gptq)
}

fn quantize_and_free(
    mut gptq: Gptq,
    layer: &mut dyn QuantizableLayer,
    config: &GptqConfig,
) -> TemperResult<LayerReport> {
    let report = gptq.fasterquant(layer, &fasterquant_options(config));
    gptq.free();
    report
}

/// The per-block state machine
pub struct GptqPipeline<'o> {
    config: GptqConfig,
    stage: Stage,
    observer: Option<&'o mut dyn PipelineObserver>,
}

impl<'o> GptqPipeline<'o> {
    pub fn new(config: GptqConfig) -> Self {
        Self {
            config,
            stage: Stage::Init,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: &'o mut dyn PipelineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn config(&self) -> &GptqConfig {
        &self.config
    }

    fn transition(&mut self, block: Option<usize>, stage: Stage) {
        debug!(?block, from = ?self.stage, to = ?stage, "Pipeline stage");
        self.stage = stage;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_stage(block, stage);
        }
    }

    /// Quantizes every block of `model` in place from `calibration` samples.
    pub fn run(&mut self, model: &mut dyn Model, calibration: &CalibrationSet) -> TemperResult<QuantizationSummary> {
        self.config.validate()?;
        self.transition(None, Stage::Init);
        let tick = Instant::now();

        let DiscoveredModel {
            embedding, mut blocks, ..
        } = discover_structure(model)?;

        let mut inputs = calibration
            .iter()
            .map(|ids| embedding.embed(&ids))
            .collect::<TemperResult<Vec<_>>>()?;

        let num_blocks = blocks.len();
        info!(
            blocks = num_blocks,
            samples = inputs.len(),
            wbits = self.config.wbits,
            maxq = self.config.maxq(),
            group_size = ?self.config.group_size,
            "Starting GPTQ quantization"
        );

        let mut summary = QuantizationSummary {
            calibration_samples: inputs.len(),
            ..QuantizationSummary::default()
        };

        for (index, block) in blocks.iter_mut().enumerate() {
            let block: &mut dyn Layer = &mut **block;
            let block_name = block.name().to_string();
            if let Some(observer) = self.observer.as_mut() {
                observer.on_block_inputs(index, &inputs);
            }
            info!(block = index, name = %block_name, "Quantizing block {}/{}", index + 1, num_blocks);

            self.transition(Some(index), Stage::Capture);
            let captured = {
                let registry = LayerRegistry::for_block(&*block)
                    .with_context(|| ErrorContext::new("capture").with_block(index))?;
                if registry.is_empty() {
                    None
                } else {
                    Some(
                        capture_block_inputs(&*block, &registry, &inputs)
                            .with_context(|| ErrorContext::new("capture").with_block(index))?,
                    )
                }
            };

            let layers = match captured {
                Some(mut captured) => {
                    let layers = find_layers_in_block_mut(&mut *block);
                    let mut jobs = Vec::with_capacity(layers.len());
                    for (name, layer) in layers {
                        let rows = captured
                            .take_rows(&name, layer.in_features())
                            .with_context(|| ErrorContext::new("capture").with_block(index).with_layer(&name))?;
                        jobs.push((name, layer, rows));
                    }
                    drop(captured);
                    self.quantize_block(index, jobs)?
                }
                None => {
                    warn!(block = index, name = %block_name, "No quantizable layers found in block; skipping");
                    Vec::new()
                }
            };
            summary.blocks.push(BlockSummary {
                index,
                name: block_name,
                skipped: layers.is_empty(),
                layers,
            });

            self.transition(Some(index), Stage::Propagate);
            if index + 1 < num_blocks {
                inputs = inputs
                    .iter()
                    .map(|x| block.forward(x))
                    .collect::<TemperResult<Vec<_>>>()
                    .with_context(|| ErrorContext::new("propagate").with_block(index))?;
            }
            debug!(block = index, "Released block resources");
        }

        self.transition(None, Stage::Done);
        summary.elapsed = tick.elapsed();
        info!(
            layers = summary.layers_quantized(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "GPTQ quantization complete"
        );
        Ok(summary)
    }

    fn quantize_block(
        &mut self,
        index: usize,
        jobs: Vec<(String, &mut dyn QuantizableLayer, Array2<f32>)>,
    ) -> TemperResult<Vec<LayerReport>> {
        #[cfg(feature = "parallel")]
        {
            if self.config.parallel_sublayers && jobs.len() > 1 {
                return self.quantize_block_parallel(index, jobs);
            }
        }

        let mut reports = Vec::with_capacity(jobs.len());
        for (name, layer, rows) in jobs {
            let context = || ErrorContext::new("quantize").with_block(index).with_layer(&name);

            self.transition(Some(index), Stage::BuildHessian);
            let gptq = build_hessian(&name, &*layer, &rows, &self.config).with_context(context)?;
            drop(rows);

            self.transition(Some(index), Stage::Quantize);
            let report = quantize_and_free(gptq, layer, &self.config).with_context(context)?;
            if let Some(observer) = self.observer.as_mut() {
                observer.on_layer_quantized(index, &report);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Sub-layers of one block read disjoint inputs and write disjoint weights,
    /// so they can be solved concurrently.
    #[cfg(feature = "parallel")]
    fn quantize_block_parallel(
        &mut self,
        index: usize,
        jobs: Vec<(String, &mut dyn QuantizableLayer, Array2<f32>)>,
    ) -> TemperResult<Vec<LayerReport>> {
        use rayon::prelude::*;

        self.transition(Some(index), Stage::BuildHessian);
        self.transition(Some(index), Stage::Quantize);
        let config = &self.config;
        let reports = jobs
            .into_par_iter()
            .map(|(name, layer, rows)| {
                let gptq = build_hessian(&name, &*layer, &rows, config)?;
                drop(rows);
                quantize_and_free(gptq, layer, config)
                    .with_context(|| ErrorContext::new("quantize").with_block(index).with_layer(&name))
            })
            .collect::<TemperResult<Vec<_>>>()?;

        if let Some(observer) = self.observer.as_mut() {
            for report in &reports {
                observer.on_layer_quantized(index, report);
            }
        }
        Ok(reports)
    }
}

/// Runs the pipeline over already tokenized calibration samples.
pub fn apply_gptq_layerwise(
    model: &mut dyn Model,
    calibration: &CalibrationSet,
    config: &GptqConfig,
) -> TemperResult<QuantizationSummary> {
    GptqPipeline::new(config.clone()).run(model, calibration)
}

/// Quantizes `model` in place, reading named datasets from the default local provider.
pub fn quantize_model(
    model: &mut dyn Model,
    config: &GptqConfig,
    tokenizer: &dyn Tokenizer,
) -> TemperResult<QuantizationSummary> {
    quantize_model_with_provider(model, config, tokenizer, &LocalDatasetProvider::from_env())
}

/// Builds the calibration set, quantizes `model` in place, and optionally scores
/// held-out samples.
pub fn quantize_model_with_provider(
    model: &mut dyn Model,
    config: &GptqConfig,
    tokenizer: &dyn Tokenizer,
    provider: &dyn DatasetProvider,
) -> TemperResult<QuantizationSummary> {
    config.validate()?;
    let total = config.nsamples + config.eval_samples;
    let samples = get_dataloader(tokenizer, config.seqlen, &config.dataset, total, config.seed, provider)?;
    let (calibration, held_out) = samples.split_at(config.nsamples)?;

    let mut summary = apply_gptq_layerwise(model, &calibration, config)?;

    if !held_out.is_empty() {
        let perplexity = evaluate_perplexity(&*model, &held_out, config.ignore_token)?;
        info!(perplexity, samples = held_out.len(), "Perplexity after quantization");
        summary.perplexity = Some(perplexity);
    }
    Ok(summary)
}
