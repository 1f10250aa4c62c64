//! Dense tensor primitives used by the layer library and the GPTQ solver

use ndarray::{concatenate, Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, Zip};

use crate::error::{TemperError, TemperResult};

/// Elementwise activation applied after a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ActivationKind {
    Identity,
    Relu,
    Gelu,
}

impl ActivationKind {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Identity => x,
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Gelu => gelu(x),
        }
    }
}

/// Tanh approximation of GELU
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// Projects the last axis of `input` through `weight` (`[out, in]`), adding `bias`.
pub fn linear(
    input: &Array3<f32>,
    weight: &Array2<f32>,
    bias: Option<&Array1<f32>>,
) -> TemperResult<Array3<f32>> {
    let (batch, seq, features) = input.dim();
    let (out_features, in_features) = weight.dim();
    if features != in_features {
        return Err(TemperError::shape_error(
            &format!("[.., .., {}]", in_features),
            &format!("[{}, {}, {}]", batch, seq, features),
            Some("The last input axis must match the weight's input features"),
        ));
    }

    let rows = flatten_rows(input.view(), features)?;
    let mut projected = rows.dot(&weight.t());
    if let Some(bias) = bias {
        if bias.len() != out_features {
            return Err(TemperError::shape_error(
                &format!("bias of length {}", out_features),
                &format!("bias of length {}", bias.len()),
                None,
            ));
        }
        projected += bias;
    }

    Ok(projected.into_shape((batch, seq, out_features))?)
}

/// Reshapes an activation tensor to `(rows, features)`.
pub fn flatten_rows(input: ArrayView3<f32>, features: usize) -> TemperResult<Array2<f32>> {
    let total = input.len();
    if features == 0 || total % features != 0 {
        return Err(TemperError::shape_error(
            &format!("a multiple of {} elements", features),
            &format!("{} elements with shape {:?}", total, input.shape()),
            None,
        ));
    }
    let owned = input.as_standard_layout().into_owned();
    Ok(owned.into_shape((total / features, features))?)
}

/// Concatenates activation tensors along the batch axis
pub fn concat_batch(parts: &[Array3<f32>]) -> TemperResult<Array3<f32>> {
    if parts.is_empty() {
        return Err(TemperError::InvalidInput("Cannot concatenate an empty list of tensors".to_string()));
    }
    let views: Vec<ArrayView3<f32>> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Normalizes every vector along the last axis, then applies `gamma`/`beta`.
pub fn layer_norm(
    input: &Array3<f32>,
    gamma: &Array1<f32>,
    beta: &Array1<f32>,
    eps: f32,
) -> TemperResult<Array3<f32>> {
    let features = input.dim().2;
    if gamma.len() != features || beta.len() != features {
        return Err(TemperError::shape_error(
            &format!("normalization parameters of length {}", features),
            &format!("gamma {} / beta {}", gamma.len(), beta.len()),
            None,
        ));
    }

    let mut output = input.clone();
    for mut lane in output.lanes_mut(Axis(2)) {
        let n = lane.len() as f32;
        let mean = lane.sum() / n;
        let var = lane.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        Zip::from(&mut lane)
            .and(gamma)
            .and(beta)
            .for_each(|x, &g, &b| *x = (*x - mean) * inv_std * g + b);
    }
    Ok(output)
}

/// Row-wise softmax, numerically stabilized by the row maximum
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|x| x / sum);
        }
    }
}

/// Log-softmax of one logit vector
pub fn log_softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let log_sum = logits.iter().map(|&x| ((x - max) as f64).exp()).sum::<f64>().ln() as f32;
    logits.mapv(|x| x - max - log_sum)
}

pub fn all_finite<'a>(values: impl IntoIterator<Item = &'a f32>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array3};

    #[test]
    fn test_linear_projection() {
        let input = Array3::from_shape_vec((1, 2, 3), vec![1.0, 2.0, 3.0, 0.0, -1.0, 1.0]).unwrap();
        let weight = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]]);
        let bias = arr1(&[0.5, -0.5]);
        let out = linear(&input, &weight, Some(&bias)).unwrap();
        assert_eq!(out.dim(), (1, 2, 2));
        assert_eq!(out[[0, 0, 0]], 1.5);
        assert_eq!(out[[0, 0, 1]], 4.5);
        assert_eq!(out[[0, 1, 1]], -0.5);
    }

    #[test]
    fn test_linear_rejects_feature_mismatch() {
        let input = Array3::<f32>::zeros((1, 2, 4));
        let weight = Array2::<f32>::zeros((2, 3));
        assert!(matches!(linear(&input, &weight, None), Err(TemperError::ShapeError(_))));
    }

    #[test]
    fn test_flatten_rows() {
        let input = Array3::<f32>::ones((2, 5, 3));
        let rows = flatten_rows(input.view(), 3).unwrap();
        assert_eq!(rows.dim(), (10, 3));
        assert!(flatten_rows(input.view(), 4).is_err());
    }

    #[test]
    fn test_layer_norm_zero_mean() {
        let input = Array3::from_shape_vec((1, 1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = layer_norm(&input, &Array1::ones(4), &Array1::zeros(4), 1e-6).unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut scores = arr2(&[[1.0, 2.0, 3.0], [-5.0, 0.0, 5.0]]);
        softmax_rows(&mut scores);
        for row in scores.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(arr1(&[0.1f32, 2.0, -1.0]).view());
        let total: f32 = lp.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
