//! GPTQ: Hessian-aware post-training quantization of one dense layer
//!
//! Inputs seen by the layer are accumulated into `H = 2/n Σ xᵀx`. Columns of the
//! weight are then quantized left to right; the rounding error of each column is
//! spread over the columns not yet quantized using rows of the upper Cholesky
//! factor of `H⁻¹`. Updates are applied lazily in column blocks.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    error::{TemperError, TemperResult},
    nn::layers::QuantizableLayer,
    quantization::quantizer::{GroupParams, Quantizer},
    tensor::{
        linalg::{argsort_descending, inverse_cholesky_upper, invert_permutation, permute_columns, permute_symmetric},
        ops::all_finite,
    },
};

/// Knobs of a single `fasterquant` call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FasterQuantOptions {
    pub block_size: usize,
    pub percdamp: f32,
    pub group_size: Option<usize>,
    pub act_order: bool,
}

impl Default for FasterQuantOptions {
    fn default() -> Self {
        Self {
            block_size: 128,
            percdamp: 0.01,
            group_size: None,
            act_order: false,
        }
    }
}

/// Outcome of quantizing one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerReport {
    pub name: String,
    pub rows: usize,
    pub columns: usize,
    /// Hessian-weighted squared rounding error, `Σ (w - q)² / d² / 2`
    pub loss: f64,
    /// Column ranges refer to processing order; map through `permutation` when set.
    pub groups: Vec<GroupParams>,
    pub permutation: Option<Vec<usize>>,
    pub dead_columns: usize,
    pub elapsed: Duration,
}

/// Per-layer Hessian accumulator and solver
#[derive(Debug)]
pub struct Gptq {
    name: String,
    rows: usize,
    columns: usize,
    hessian: Option<Array2<f32>>,
    nsamples: usize,
    pub quantizer: Quantizer,
}

impl Gptq {
    pub fn new(name: &str, layer: &dyn QuantizableLayer, quantizer: Quantizer) -> Self {
        let rows = layer.out_features();
        let columns = layer.in_features();
        Self {
            name: name.to_string(),
            rows,
            columns,
            hessian: Some(Array2::zeros((columns, columns))),
            nsamples: 0,
            quantizer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn hessian(&self) -> Option<&Array2<f32>> {
        self.hessian.as_ref()
    }

    pub fn has_hessian(&self) -> bool {
        self.hessian.is_some()
    }

    /// Folds a `(rows, in_features)` batch of layer inputs into the running Hessian.
    pub fn add_batch(&mut self, input: ArrayView2<f32>) -> TemperResult<()> {
        if input.ncols() != self.columns {
            return Err(TemperError::model_structure(
                &self.name,
                &format!(
                    "captured inputs have {} features but the weight expects {}",
                    input.ncols(),
                    self.columns
                ),
            ));
        }
        let batch_rows = input.nrows();
        if batch_rows == 0 {
            return Ok(());
        }

        let columns = self.columns;
        let hessian = self.hessian.get_or_insert_with(|| Array2::zeros((columns, columns)));
        let total = self.nsamples + batch_rows;
        *hessian *= self.nsamples as f32 / total as f32;
        self.nsamples = total;

        let factor = (2.0 / total as f32).sqrt();
        let scaled = input.mapv(|x| x * factor);
        *hessian += &scaled.t().dot(&scaled);
        Ok(())
    }

    /// Quantizes `layer`'s weight in place using the accumulated Hessian.
    ///
    /// The Hessian is consumed; a second call needs fresh batches.
    pub fn fasterquant(
        &mut self,
        layer: &mut dyn QuantizableLayer,
        options: &FasterQuantOptions,
    ) -> TemperResult<LayerReport> {
        let tick = Instant::now();
        if options.block_size == 0 {
            return Err(TemperError::config("block_size must be greater than zero"));
        }
        if self.nsamples == 0 {
            return Err(TemperError::InvalidState(format!(
                "No calibration batches were added for layer '{}'",
                self.name
            )));
        }
        let mut hessian = self.hessian.take().ok_or_else(|| {
            TemperError::InvalidState(format!("Hessian of layer '{}' was already consumed", self.name))
        })?;

        let mut weight = layer.weight().clone();
        if weight.dim() != (self.rows, self.columns) {
            return Err(TemperError::model_structure(
                &self.name,
                &format!(
                    "weight shape {:?} changed since accumulation began ({}x{})",
                    weight.dim(),
                    self.rows,
                    self.columns
                ),
            ));
        }
        let (rows, columns) = (self.rows, self.columns);

        if !self.quantizer.is_ready() {
            self.quantizer
                .find_params(weight.view())
                .map_err(|e| TemperError::numeric(&self.name, &e.to_string()))?;
        }

        let mut dead_columns = 0;
        for i in 0..columns {
            if hessian[[i, i]] == 0.0 {
                hessian[[i, i]] = 1.0;
                weight.column_mut(i).fill(0.0);
                dead_columns += 1;
            }
        }
        if dead_columns > 0 {
            warn!(layer = %self.name, dead_columns, "Zeroing weights of input features never activated during calibration");
        }

        let permutation = if options.act_order {
            let diag: Vec<f32> = hessian.diag().to_vec();
            let perm = argsort_descending(&diag);
            weight = permute_columns(&weight, &perm);
            hessian = permute_symmetric(&hessian, &perm);
            Some(perm)
        } else {
            None
        };

        let damp = options.percdamp * hessian.diag().mean().unwrap_or(0.0);
        hessian.diag_mut().mapv_inplace(|d| d + damp);

        let hinv = inverse_cholesky_upper(hessian.view())
            .map_err(|e| TemperError::numeric(&self.name, &format!("Hessian inversion failed: {}", e)))?;
        drop(hessian);

        let mut quantized = Array2::<f32>::zeros((rows, columns));
        let mut groups = Vec::new();
        let mut loss = 0.0f64;

        if options.group_size.is_none() {
            if let Some(params) = self.quantizer.params() {
                groups.push(GroupParams {
                    columns: 0..columns,
                    params: params.clone(),
                });
            }
        }

        let mut i1 = 0;
        while i1 < columns {
            let i2 = (i1 + options.block_size).min(columns);
            let count = i2 - i1;

            let mut w1 = weight.slice(s![.., i1..i2]).to_owned();
            let mut err1 = Array2::<f32>::zeros((rows, count));
            let mut block_loss = 0.0f64;

            for i in 0..count {
                let col = i1 + i;
                if let Some(group_size) = options.group_size {
                    if col % group_size == 0 {
                        let end = (col + group_size).min(columns);
                        let params = self
                            .quantizer
                            .find_params(weight.slice(s![.., col..end]))
                            .map_err(|e| TemperError::numeric(&self.name, &e.to_string()))?
                            .clone();
                        groups.push(GroupParams { columns: col..end, params });
                    }
                }

                let w: Array1<f32> = w1.column(i).to_owned();
                let q = self.quantizer.quantize_column(w.view())?;
                let d = hinv[[col, col]];

                for r in 0..rows {
                    let diff = w[r] - q[r];
                    block_loss += (diff as f64 * diff as f64) / (d as f64 * d as f64);
                    err1[[r, i]] = diff / d;
                }
                quantized.column_mut(col).assign(&q);

                let err = err1.column(i).insert_axis(Axis(1));
                let coeffs = hinv.slice(s![col, col..i2]).insert_axis(Axis(0));
                let mut tail = w1.slice_mut(s![.., i..]);
                tail -= &err.dot(&coeffs);
            }

            loss += block_loss / 2.0;

            if i2 < columns {
                let update = err1.dot(&hinv.slice(s![i1..i2, i2..]));
                let mut rest = weight.slice_mut(s![.., i2..]);
                rest -= &update;
            }

            debug!(layer = %self.name, from = i1, to = i2, "Quantized column block");
            i1 = i2;
        }

        if let Some(ref perm) = permutation {
            quantized = permute_columns(&quantized, &invert_permutation(perm));
        }

        if !all_finite(&quantized) {
            return Err(TemperError::numeric(&self.name, "quantized weights contain non-finite values"));
        }
        layer.set_weight(quantized)?;

        let elapsed = tick.elapsed();
        info!(
            layer = %self.name,
            rows,
            columns,
            loss,
            elapsed_ms = elapsed.as_millis() as u64,
            "Quantized layer"
        );

        Ok(LayerReport {
            name: self.name.clone(),
            rows,
            columns,
            loss,
            groups,
            permutation,
            dead_columns,
            elapsed,
        })
    }

    /// Drops the Hessian and any derived parameters.
    pub fn free(&mut self) {
        self.hessian = None;
        self.nsamples = 0;
        self.quantizer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::layers::Dense;
    use ndarray::{arr2, Array2};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0))
    }

    fn quantizer(bits: u8, symmetric: bool, group_size: Option<usize>) -> Quantizer {
        let mut q = Quantizer::new(bits).unwrap();
        q.configure(bits, true, symmetric, group_size).unwrap();
        q
    }

    fn layer_with(rng: &mut StdRng, out: usize, inp: usize) -> Dense {
        Dense::from_weights("dense", random_matrix(out, inp, rng), None).unwrap()
    }

    fn output_error(original: &Array2<f32>, quantized: &Array2<f32>, inputs: &Array2<f32>) -> f32 {
        let diff = inputs.dot(&original.t()) - inputs.dot(&quantized.t());
        diff.iter().map(|v| v * v).sum()
    }

    #[test]
    fn test_hessian_symmetric_and_scaled() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = layer_with(&mut rng, 4, 6);
        let mut gptq = Gptq::new("dense", &layer, quantizer(4, false, None));

        let first = random_matrix(10, 6, &mut rng);
        let second = random_matrix(30, 6, &mut rng);
        gptq.add_batch(first.view()).unwrap();
        gptq.add_batch(second.view()).unwrap();
        assert_eq!(gptq.nsamples(), 40);

        let hessian = gptq.hessian().unwrap();
        for i in 0..6 {
            for j in 0..6 {
                assert!((hessian[[i, j]] - hessian[[j, i]]).abs() < 1e-5);
            }
        }

        let mut all = Array2::<f32>::zeros((40, 6));
        all.slice_mut(s![..10, ..]).assign(&first);
        all.slice_mut(s![10.., ..]).assign(&second);
        let expected = all.t().dot(&all) * (2.0 / 40.0);
        for (a, b) in hessian.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_add_batch_rejects_feature_mismatch() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = layer_with(&mut rng, 4, 6);
        let mut gptq = Gptq::new("block.att.query", &layer, quantizer(4, false, None));
        let err = gptq.add_batch(Array2::<f32>::zeros((3, 5)).view()).unwrap_err();
        match err {
            TemperError::ModelStructureError { component, .. } => assert_eq!(component, "block.att.query"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fasterquant_beats_round_to_nearest() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = layer_with(&mut rng, 16, 32);
        let original = layer.weight().clone();

        let mut inputs = random_matrix(256, 32, &mut rng);
        for c in 0..32 {
            let mix = inputs.column(c).to_owned() + &(inputs.column((c + 1) % 32).to_owned() * 0.8);
            inputs.column_mut(c).assign(&mix);
        }

        let mut gptq = Gptq::new("dense", &layer, quantizer(3, false, None));
        gptq.add_batch(inputs.view()).unwrap();
        let report = gptq.fasterquant(&mut layer, &FasterQuantOptions::default()).unwrap();
        gptq.free();

        let mut rtn = quantizer(3, false, None);
        rtn.find_params(original.view()).unwrap();
        let rounded = rtn.quantize(original.view()).unwrap();

        let gptq_error = output_error(&original, layer.weight(), &inputs);
        let rtn_error = output_error(&original, &rounded, &inputs);
        assert!(gptq_error < rtn_error, "gptq {} vs rtn {}", gptq_error, rtn_error);
        assert_ne!(layer.weight(), &original);
        assert!(report.loss.is_finite());
        assert_eq!(report.groups.len(), 1);
        assert!(!gptq.has_hessian());
    }

    #[test]
    fn test_quantized_values_sit_on_group_grids() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = layer_with(&mut rng, 4, 20);
        let inputs = random_matrix(64, 20, &mut rng);

        let mut gptq = Gptq::new("dense", &layer, quantizer(4, true, Some(8)));
        gptq.add_batch(inputs.view()).unwrap();
        let options = FasterQuantOptions {
            block_size: 6,
            group_size: Some(8),
            ..FasterQuantOptions::default()
        };
        let report = gptq.fasterquant(&mut layer, &options).unwrap();

        assert_eq!(
            report.groups.iter().map(|g| g.columns.clone()).collect::<Vec<_>>(),
            vec![0..8, 8..16, 16..20]
        );
        let weight = layer.weight();
        for group in &report.groups {
            for c in group.columns.clone() {
                for r in 0..4 {
                    let level = weight[[r, c]] / group.params.scale[r] + group.params.zero[r];
                    assert!((level - level.round()).abs() < 1e-3, "off-grid value at ({}, {})", r, c);
                    assert!(level.round() >= 0.0 && level.round() <= 15.0);
                }
            }
        }
    }

    #[test]
    fn test_act_order_restores_column_order() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = layer_with(&mut rng, 6, 12);
        let mut inputs = random_matrix(128, 12, &mut rng);
        inputs.column_mut(7).mapv_inplace(|v| v * 10.0);

        let mut gptq = Gptq::new("dense", &layer, quantizer(4, false, None));
        gptq.add_batch(inputs.view()).unwrap();
        let options = FasterQuantOptions {
            act_order: true,
            ..FasterQuantOptions::default()
        };
        let original = layer.weight().clone();
        let report = gptq.fasterquant(&mut layer, &options).unwrap();

        let perm = report.permutation.unwrap();
        assert_eq!(perm[0], 7);
        let params = &report.groups[0].params;
        for c in 0..12 {
            for r in 0..6 {
                let step = params.scale[r];
                assert!((layer.weight()[[r, c]] - original[[r, c]]).abs() < step * 16.0);
            }
        }
    }

    #[test]
    fn test_dead_columns_zeroed() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut layer = layer_with(&mut rng, 3, 5);
        let mut inputs = random_matrix(32, 5, &mut rng);
        inputs.column_mut(2).fill(0.0);

        let mut gptq = Gptq::new("dense", &layer, quantizer(4, false, None));
        gptq.add_batch(inputs.view()).unwrap();
        let report = gptq.fasterquant(&mut layer, &FasterQuantOptions::default()).unwrap();
        assert_eq!(report.dead_columns, 1);
        for r in 0..3 {
            assert!(layer.weight()[[r, 2]].abs() < 1e-6);
        }
    }

    #[test]
    fn test_fasterquant_requires_batches() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = layer_with(&mut rng, 2, 2);
        let mut gptq = Gptq::new("dense", &layer, quantizer(4, false, None));
        assert!(matches!(
            gptq.fasterquant(&mut layer, &FasterQuantOptions::default()),
            Err(TemperError::InvalidState(_))
        ));
    }

    #[test]
    fn test_non_finite_inputs_fail_numerically() {
        let mut layer = Dense::from_weights("dense", arr2(&[[0.5, -0.25], [1.0, 0.75]]), None).unwrap();
        let mut gptq = Gptq::new("block.dense", &layer, quantizer(4, false, None));
        gptq.add_batch(arr2(&[[f32::NAN, 1.0], [1.0, 2.0]]).view()).unwrap();
        match gptq.fasterquant(&mut layer, &FasterQuantOptions::default()) {
            Err(TemperError::NumericError { layer, .. }) => assert_eq!(layer, "block.dense"),
            other => panic!("expected a numeric error, got {other:?}"),
        }
    }

    #[test]
    fn test_free_clears_state() {
        let mut rng = StdRng::seed_from_u64(8);
        let layer = layer_with(&mut rng, 2, 3);
        let mut gptq = Gptq::new("dense", &layer, quantizer(4, false, None));
        gptq.add_batch(random_matrix(4, 3, &mut rng).view()).unwrap();
        assert!(gptq.has_hessian());
        gptq.free();
        assert!(!gptq.has_hessian());
        assert_eq!(gptq.nsamples(), 0);
        assert!(!gptq.quantizer.is_ready());
    }
}
