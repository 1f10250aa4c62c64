//! Cholesky-based inversion and permutation helpers for the Hessian solver

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Failure of a Cholesky factorization
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecompositionError {
    #[error("matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("matrix is not positive definite (pivot {pivot} = {value:e})")]
    NotPositiveDefinite { pivot: usize, value: f64 },
}

/// Lower-triangular `L` with `a = L Lᵀ`. Only the lower triangle of `a` is read.
pub fn cholesky_lower(a: ArrayView2<f32>) -> Result<Array2<f32>, DecompositionError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(DecompositionError::NotSquare { rows, cols });
    }
    let n = rows;
    let mut l = Array2::<f32>::zeros((n, n));

    for j in 0..n {
        let mut diag = a[[j, j]] as f64;
        for k in 0..j {
            let v = l[[j, k]] as f64;
            diag -= v * v;
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(DecompositionError::NotPositiveDefinite { pivot: j, value: diag });
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj as f32;

        for i in (j + 1)..n {
            let mut sum = a[[i, j]] as f64;
            for k in 0..j {
                sum -= l[[i, k]] as f64 * l[[j, k]] as f64;
            }
            l[[i, j]] = (sum / ljj) as f32;
        }
    }

    Ok(l)
}

/// Inverse of a lower-triangular matrix by forward substitution
pub fn invert_lower_triangular(l: ArrayView2<f32>) -> Array2<f32> {
    let n = l.nrows();
    let mut inv = Array2::<f32>::zeros((n, n));
    for col in 0..n {
        inv[[col, col]] = 1.0 / l[[col, col]];
        for i in (col + 1)..n {
            let mut sum = 0.0f64;
            for k in col..i {
                sum += l[[i, k]] as f64 * inv[[k, col]] as f64;
            }
            inv[[i, col]] = (-sum / l[[i, i]] as f64) as f32;
        }
    }
    inv
}

/// `A⁻¹` given the lower Cholesky factor of `A`
pub fn cholesky_inverse(l: ArrayView2<f32>) -> Array2<f32> {
    let l_inv = invert_lower_triangular(l);
    l_inv.t().dot(&l_inv)
}

/// Upper-triangular `U` with `H⁻¹ = Uᵀ U`.
///
/// Row `i` of `U` holds the coefficients used to spread the quantization error of
/// column `i` onto the columns after it.
pub fn inverse_cholesky_upper(h: ArrayView2<f32>) -> Result<Array2<f32>, DecompositionError> {
    let l = cholesky_lower(h)?;
    let h_inv = cholesky_inverse(l.view());
    let l_inv = cholesky_lower(h_inv.view())?;
    Ok(l_inv.reversed_axes())
}

/// Indices that sort `values` in descending order (stable for ties)
pub fn argsort_descending(values: &[f32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    indices
}

pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (position, &index) in perm.iter().enumerate() {
        inverse[index] = position;
    }
    inverse
}

/// `m[:, perm]`
pub fn permute_columns(m: &Array2<f32>, perm: &[usize]) -> Array2<f32> {
    Array2::from_shape_fn((m.nrows(), perm.len()), |(r, c)| m[[r, perm[c]]])
}

/// `m[perm][:, perm]`
pub fn permute_symmetric(m: &Array2<f32>, perm: &[usize]) -> Array2<f32> {
    Array2::from_shape_fn((perm.len(), perm.len()), |(r, c)| m[[perm[r], perm[c]]])
}
