//! Uniform min/max quantizer with per-row parameters

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{TemperError, TemperResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationScheme {
    Symmetric,
    Asymmetric,
}

/// One `(scale, zero)` pair per output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub scale: Array1<f32>,
    pub zero: Array1<f32>,
}

impl QuantizationParams {
    pub fn rows(&self) -> usize {
        self.scale.len()
    }
}

/// Parameters of one column group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupParams {
    pub columns: Range<usize>,
    pub params: QuantizationParams,
}

/// Rounds `x` onto the grid defined by `scale`/`zero` and maps it back.
#[inline]
pub fn quantize_value(x: f32, scale: f32, zero: f32, maxq: f32) -> f32 {
    let q = ((x / scale).round() + zero).clamp(0.0, maxq);
    scale * (q - zero)
}

/// Partitions `columns` into contiguous groups of `group_size`; the last group may be short.
/// `None` yields a single group spanning every column.
pub fn group_ranges(columns: usize, group_size: Option<usize>) -> Vec<Range<usize>> {
    match group_size {
        Some(size) if size > 0 && size < columns => (0..columns)
            .step_by(size)
            .map(|start| start..(start + size).min(columns))
            .collect(),
        _ if columns == 0 => Vec::new(),
        _ => vec![0..columns],
    }
}

#[derive(Debug, Clone)]
pub struct Quantizer {
    bits: u8,
    maxq: f32,
    per_channel: bool,
    scheme: QuantizationScheme,
    group_size: Option<usize>,
    params: Option<QuantizationParams>,
}

impl Quantizer {
    /// Per-channel asymmetric quantizer with no grouping
    pub fn new(bits: u8) -> TemperResult<Self> {
        let mut quantizer = Self {
            bits,
            maxq: 0.0,
            per_channel: true,
            scheme: QuantizationScheme::Asymmetric,
            group_size: None,
            params: None,
        };
        quantizer.configure(bits, true, false, None)?;
        Ok(quantizer)
    }

    pub fn configure(
        &mut self,
        bits: u8,
        per_channel: bool,
        symmetric: bool,
        group_size: Option<usize>,
    ) -> TemperResult<()> {
        if !(1..=16).contains(&bits) {
            return Err(TemperError::config(format!("Unsupported quantizer bit-width {}", bits)));
        }
        if group_size == Some(0) {
            return Err(TemperError::config("Quantizer group size must be greater than zero"));
        }
        self.bits = bits;
        self.maxq = ((1u32 << bits) - 1) as f32;
        self.per_channel = per_channel;
        self.scheme = if symmetric {
            QuantizationScheme::Symmetric
        } else {
            QuantizationScheme::Asymmetric
        };
        self.group_size = group_size;
        self.params = None;
        Ok(())
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn maxq(&self) -> f32 {
        self.maxq
    }

    pub fn scheme(&self) -> QuantizationScheme {
        self.scheme
    }

    pub fn group_size(&self) -> Option<usize> {
        self.group_size
    }

    pub fn params(&self) -> Option<&QuantizationParams> {
        self.params.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.params.is_some()
    }

    pub fn reset(&mut self) {
        self.params = None;
    }

    /// Derives scale and zero point for every row of `weight` from its min/max.
    ///
    /// The range always includes zero. Rows that are entirely zero fall back to
    /// `[-1, 1]` so the scale stays positive.
    pub fn find_params(&mut self, weight: ArrayView2<f32>) -> TemperResult<&QuantizationParams> {
        let (rows, columns) = weight.dim();
        if rows == 0 || columns == 0 {
            return Err(TemperError::InvalidInput(format!(
                "Cannot derive quantization parameters from an empty {}x{} matrix",
                rows, columns
            )));
        }
        if !weight.iter().all(|v| v.is_finite()) {
            return Err(TemperError::InvalidInput(
                "Cannot derive quantization parameters from non-finite weights".to_string(),
            ));
        }

        let (mut xmin, mut xmax) = if self.per_channel {
            let mins = weight.map_axis(Axis(1), |row| row.fold(f32::INFINITY, |m, &x| m.min(x)));
            let maxs = weight.map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &x| m.max(x)));
            (mins, maxs)
        } else {
            let min = weight.fold(f32::INFINITY, |m, &x| m.min(x));
            let max = weight.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            (Array1::from_elem(rows, min), Array1::from_elem(rows, max))
        };
        xmin.mapv_inplace(|v| v.min(0.0));
        xmax.mapv_inplace(|v| v.max(0.0));

        let symmetric = self.scheme == QuantizationScheme::Symmetric;
        let maxq = self.maxq;
        let mut scale = Array1::<f32>::zeros(rows);
        let mut zero = Array1::<f32>::zeros(rows);

        for r in 0..rows {
            let (mut lo, mut hi) = (xmin[r], xmax[r]);
            if symmetric {
                hi = hi.max(lo.abs());
                lo = -hi;
            }
            if lo == 0.0 && hi == 0.0 {
                lo = -1.0;
                hi = 1.0;
            }
            scale[r] = (hi - lo) / maxq;
            zero[r] = if symmetric {
                (maxq + 1.0) / 2.0
            } else {
                (-lo / scale[r]).round()
            };
        }

        Ok(&*self.params.insert(QuantizationParams { scale, zero }))
    }

    fn ready_params(&self, rows: usize) -> TemperResult<&QuantizationParams> {
        let params = self.params.as_ref().ok_or_else(|| {
            TemperError::InvalidState("Quantizer parameters are not initialized; call find_params first".to_string())
        })?;
        if params.rows() != rows {
            return Err(TemperError::shape_error(
                &format!("{} rows", params.rows()),
                &format!("{} rows", rows),
                Some("Parameters were derived from a matrix with a different number of rows"),
            ));
        }
        Ok(params)
    }

    /// Quantizes one weight column (one value per row) with the current parameters.
    pub fn quantize_column(&self, column: ArrayView1<f32>) -> TemperResult<Array1<f32>> {
        let params = self.ready_params(column.len())?;
        let maxq = self.maxq;
        Ok(Array1::from_shape_fn(column.len(), |r| {
            quantize_value(column[r], params.scale[r], params.zero[r], maxq)
        }))
    }

    /// Quantizes a whole matrix row-wise with the current parameters.
    pub fn quantize(&self, weight: ArrayView2<f32>) -> TemperResult<Array2<f32>> {
        let params = self.ready_params(weight.nrows())?;
        let maxq = self.maxq;
        Ok(Array2::from_shape_fn(weight.dim(), |(r, c)| {
            quantize_value(weight[[r, c]], params.scale[r], params.zero[r], maxq)
        }))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_weight(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0))
    }

    #[test]
    fn test_group_ranges() {
        assert_eq!(group_ranges(10, Some(4)), vec![0..4, 4..8, 8..10]);
        assert_eq!(group_ranges(8, Some(4)), vec![0..4, 4..8]);
        assert_eq!(group_ranges(8, None), vec![0..8]);
        assert_eq!(group_ranges(3, Some(16)), vec![0..3]);
        assert!(group_ranges(0, Some(4)).is_empty());

        let ranges = group_ranges(130, Some(32));
        assert_eq!(ranges.len(), 5);
        let covered: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(covered, 130);
        assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn test_configure_rejects_bad_settings() {
        let mut quantizer = Quantizer::new(4).unwrap();
        assert!(quantizer.configure(0, true, false, None).is_err());
        assert!(quantizer.configure(4, true, false, Some(0)).is_err());
        assert!(Quantizer::new(17).is_err());
    }

    #[test]
    fn test_quantize_requires_params() {
        let quantizer = Quantizer::new(4).unwrap();
        let weight = random_weight(2, 3, 0);
        assert!(matches!(quantizer.quantize(weight.view()), Err(TemperError::InvalidState(_))));
    }

    #[test]
    fn test_round_trip_error_bounded_by_half_step() {
        for &symmetric in &[false, true] {
            let mut quantizer = Quantizer::new(4).unwrap();
            quantizer.configure(4, true, symmetric, None).unwrap();
            let weight = random_weight(8, 32, 3);
            let params = quantizer.find_params(weight.view()).unwrap().clone();
            let quantized = quantizer.quantize(weight.view()).unwrap();

            for r in 0..8 {
                let scale = params.scale[r];
                let lo = scale * (0.0 - params.zero[r]);
                let hi = scale * (quantizer.maxq() - params.zero[r]);
                for c in 0..32 {
                    let q = quantized[[r, c]];
                    assert!(q >= lo - 1e-5 && q <= hi + 1e-5);
                    let w = weight[[r, c]];
                    if w >= lo && w <= hi {
                        assert!((w - q).abs() <= scale / 2.0 + 1e-5, "w={} q={} scale={}", w, q, scale);
                    }
                }
            }
        }
    }

    #[test]
    fn test_quantization_is_deterministic() {
        let weight = random_weight(4, 16, 9);
        let mut a = Quantizer::new(3).unwrap();
        let mut b = Quantizer::new(3).unwrap();
        a.find_params(weight.view()).unwrap();
        b.find_params(weight.view()).unwrap();
        assert_eq!(a.quantize(weight.view()).unwrap(), b.quantize(weight.view()).unwrap());
    }

    #[test]
    fn test_symmetric_zero_point() {
        let mut quantizer = Quantizer::new(4).unwrap();
        quantizer.configure(4, true, true, None).unwrap();
        let params = quantizer.find_params(arr2(&[[-2.0, 1.0], [0.5, 3.0]]).view()).unwrap();
        assert_eq!(params.zero[0], 8.0);
        assert_eq!(params.zero[1], 8.0);
        assert!((params.scale[0] - 4.0 / 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_symmetric_non_negative_row_spans_both_signs() {
        let mut quantizer = Quantizer::new(4).unwrap();
        quantizer.configure(4, true, true, None).unwrap();
        let weight = arr2(&[[0.5, 1.0]]);
        let params = quantizer.find_params(weight.view()).unwrap().clone();
        assert_eq!(params.zero[0], 8.0);
        assert!((params.scale[0] - 2.0 / 15.0).abs() < 1e-6);

        let quantized = quantizer.quantize(weight.view()).unwrap();
        assert!((quantized[[0, 0]] - 0.5).abs() <= params.scale[0] / 2.0 + 1e-6);
        // 1.0 sits at 7.5 steps above zero; the top level is 7 steps
        assert!((quantized[[0, 1]] - 7.0 * 2.0 / 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_asymmetric_range_includes_zero() {
        let mut quantizer = Quantizer::new(2).unwrap();
        let params = quantizer.find_params(arr2(&[[1.0, 3.0]]).view()).unwrap().clone();
        assert_eq!(params.zero[0], 0.0);
        assert!((params.scale[0] - 1.0).abs() < 1e-6);
        let quantized = quantizer.quantize(arr2(&[[0.0, 3.0]]).view()).unwrap();
        assert_eq!(quantized[[0, 0]], 0.0);
        assert_eq!(quantized[[0, 1]], 3.0);
    }

    #[test]
    fn test_all_zero_row_uses_unit_range() {
        let mut quantizer = Quantizer::new(4).unwrap();
        let params = quantizer.find_params(Array2::<f32>::zeros((1, 4)).view()).unwrap();
        assert!((params.scale[0] - 2.0 / 15.0).abs() < 1e-6);
        let quantized = quantizer.quantize(Array2::<f32>::zeros((1, 4)).view()).unwrap();
        assert!(quantized.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_per_tensor_params_shared() {
        let mut quantizer = Quantizer::new(4).unwrap();
        quantizer.configure(4, false, false, None).unwrap();
        let params = quantizer.find_params(arr2(&[[-1.0, 0.5], [0.1, 2.0]]).view()).unwrap();
        assert_eq!(params.scale[0], params.scale[1]);
        assert_eq!(params.zero[0], params.zero[1]);
    }

    #[test]
    fn test_non_finite_weights_rejected() {
        let mut quantizer = Quantizer::new(4).unwrap();
        assert!(quantizer.find_params(arr2(&[[f32::NAN, 1.0]]).view()).is_err());
    }
}
