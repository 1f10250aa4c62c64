//! Next-token perplexity of a language model

use ndarray::s;
use tracing::{info, warn};

use crate::{
    calibration::CalibrationSet,
    error::{TemperError, TemperResult},
    nn::models::Model,
    tensor::ops::log_softmax,
};

/// `exp(mean NLL)` of predicting every token of each sample from its prefix.
///
/// Targets equal to `ignore_token` are excluded from the mean. Returns infinity
/// when no token was scored.
pub fn evaluate_perplexity(
    model: &dyn Model,
    samples: &CalibrationSet,
    ignore_token: Option<u32>,
) -> TemperResult<f32> {
    let mut total_nll = 0.0f64;
    let mut total_tokens = 0usize;

    for (index, ids) in samples.iter().enumerate() {
        if ids.ncols() < 2 {
            continue;
        }
        let inputs = ids.slice(s![.., ..ids.ncols() - 1]).to_owned();
        let targets = ids.slice(s![.., 1..]);
        let logits = model.forward(&inputs)?;

        let (batch, seq, vocab) = logits.dim();
        if (batch, seq) != targets.dim() {
            return Err(TemperError::shape_error(
                &format!("logits for {:?} positions", targets.dim()),
                &format!("{:?}", logits.dim()),
                None,
            ));
        }

        for ((b, t), &target) in targets.indexed_iter() {
            if Some(target) == ignore_token {
                continue;
            }
            if target as usize >= vocab {
                return Err(TemperError::InvalidInput(format!(
                    "Target token {} exceeds the model vocabulary of {}",
                    target, vocab
                )));
            }
            let log_probs = log_softmax(logits.slice(s![b, t, ..]));
            total_nll -= log_probs[target as usize] as f64;
            total_tokens += 1;
        }

        if (index + 1) % 16 == 0 {
            info!(samples = index + 1, "Scored perplexity samples");
        }
    }

    if total_tokens == 0 {
        warn!("No tokens were evaluated; perplexity is undefined");
        return Ok(f32::INFINITY);
    }

    Ok((total_nll / total_tokens as f64).exp() as f32)
}
