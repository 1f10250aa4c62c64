//! Recording the inputs that reach each quantizable layer of a block

use ndarray::{Array2, Array3};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    error::{TemperError, TemperResult},
    nn::{
        hooks::{ForwardHook, HookHandle},
        layers::Layer,
    },
    quantization::discovery::LayerRegistry,
    tensor::ops::{concat_batch, flatten_rows},
};

/// Hook that keeps a copy of every input it observes
#[derive(Default)]
pub struct InputRecorder {
    inputs: Mutex<Vec<Array3<f32>>>,
}

impl InputRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<Array3<f32>> {
        std::mem::take(&mut *self.inputs.lock())
    }
}

impl ForwardHook for InputRecorder {
    fn on_input(&self, _layer: &str, input: &Array3<f32>) {
        self.inputs.lock().push(input.clone());
    }
}

/// Inputs captured for every sub-layer of one block
#[derive(Default)]
pub struct CapturedInputs {
    by_layer: HashMap<String, Vec<Array3<f32>>>,
}

impl CapturedInputs {
    pub fn batches(&self, name: &str) -> Option<&[Array3<f32>]> {
        self.by_layer.get(name).map(|v| v.as_slice())
    }

    /// Removes the captured inputs of `name`, concatenated into one `(rows, features)` matrix.
    pub fn take_rows(&mut self, name: &str, features: usize) -> TemperResult<Array2<f32>> {
        let batches = self.by_layer.remove(name).ok_or_else(|| {
            TemperError::InvalidState(format!("No inputs were captured for layer '{}'", name))
        })?;
        if let Some(batch) = batches.iter().find(|b| b.dim().2 != features) {
            return Err(TemperError::model_structure(
                name,
                &format!(
                    "captured inputs have {} features but the weight expects {}",
                    batch.dim().2,
                    features
                ),
            ));
        }
        let joined = concat_batch(&batches)?;
        drop(batches);
        flatten_rows(joined.view(), features)
    }

    pub fn len(&self) -> usize {
        self.by_layer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_layer.is_empty()
    }
}

/// Runs every sample through `block` with recorders attached to each registered layer.
///
/// The recorders are detached before this returns, whether or not a forward pass failed.
pub fn capture_block_inputs(
    block: &dyn Layer,
    registry: &LayerRegistry<'_>,
    samples: &[Array3<f32>],
) -> TemperResult<CapturedInputs> {
    let recorders: Vec<(String, Arc<InputRecorder>)> = registry
        .names()
        .into_iter()
        .map(|name| (name.to_string(), Arc::new(InputRecorder::new())))
        .collect();

    let mut handles: Vec<HookHandle<'_>> = Vec::with_capacity(recorders.len());
    for ((_, layer), (_, recorder)) in registry.iter().zip(&recorders) {
        handles.push(layer.hooks().register(recorder.clone()));
    }

    for sample in samples {
        block.forward(sample)?;
    }
    drop(handles);

    let mut captured = CapturedInputs::default();
    for (name, recorder) in recorders {
        captured.by_layer.insert(name, recorder.take());
    }
    Ok(captured)
}
