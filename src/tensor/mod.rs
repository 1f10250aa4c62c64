//! Numeric primitives over `ndarray`
//!
//! - Projection, normalization and softmax kernels used by the layer library
//! - Cholesky factorization and inversion used by the GPTQ solver

pub mod linalg;
pub mod ops;

pub use linalg::{
    argsort_descending, cholesky_inverse, cholesky_lower, inverse_cholesky_upper, invert_permutation,
    permute_columns, permute_symmetric, DecompositionError,
};
pub use ops::{concat_batch, flatten_rows, layer_norm, linear, log_softmax, softmax_rows, ActivationKind};
