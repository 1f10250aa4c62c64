//! Attention and transformer blocks built from dense projections

use ndarray::{s, Array3};
use rand::Rng;

use crate::{
    error::{TemperError, TemperResult},
    nn::layers::{Dense, Layer, LayerNorm, Sequential},
    tensor::ops::{softmax_rows, ActivationKind},
};

/// Multi-head self-attention with dense query/key/value/output projections
#[derive(Debug, Clone)]
pub struct SelfAttention {
    name: String,
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
    num_heads: usize,
    causal: bool,
}

impl SelfAttention {
    pub fn new(name: &str, dim: usize, num_heads: usize, rng: &mut impl Rng) -> TemperResult<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(TemperError::config(format!(
                "Model dimension {} is not divisible by {} attention heads",
                dim, num_heads
            )));
        }
        Ok(Self {
            name: name.to_string(),
            query: Dense::new("query", dim, dim, rng),
            key: Dense::new("key", dim, dim, rng),
            value: Dense::new("value", dim, dim, rng),
            output: Dense::new("output", dim, dim, rng),
            num_heads,
            causal: true,
        })
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }
}

impl Layer for SelfAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        let q = self.query.forward(input)?;
        let k = self.key.forward(input)?;
        let v = self.value.forward(input)?;

        let (batch, seq, dim) = q.dim();
        let head_dim = dim / self.num_heads;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut context = Array3::<f32>::zeros((batch, seq, dim));

        for b in 0..batch {
            for h in 0..self.num_heads {
                let cols = h * head_dim..(h + 1) * head_dim;
                let qh = q.slice(s![b, .., cols.clone()]);
                let kh = k.slice(s![b, .., cols.clone()]);
                let vh = v.slice(s![b, .., cols.clone()]);

                let mut scores = qh.dot(&kh.t()) * scale;
                if self.causal {
                    for i in 0..seq {
                        for j in (i + 1)..seq {
                            scores[[i, j]] = f32::NEG_INFINITY;
                        }
                    }
                }
                softmax_rows(&mut scores);
                context.slice_mut(s![b, .., cols]).assign(&scores.dot(&vh));
            }
        }

        self.output.forward(&context)
    }

    fn children(&self) -> Vec<&dyn Layer> {
        vec![&self.query as &dyn Layer, &self.key, &self.value, &self.output]
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.query as &mut dyn Layer, &mut self.key, &mut self.value, &mut self.output]
    }
}

/// Post-norm transformer block: attention and a two-layer feed-forward, each residual
#[derive(Debug)]
pub struct TransformerBlock {
    name: String,
    attention: SelfAttention,
    norm1: LayerNorm,
    ffn: Sequential,
    norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(name: &str, dim: usize, num_heads: usize, ff_dim: usize, rng: &mut impl Rng) -> TemperResult<Self> {
        let attention = SelfAttention::new("attention", dim, num_heads, rng)?;
        let ffn = Sequential::new("ffn")
            .add(Dense::new("dense_0", dim, ff_dim, rng).with_activation(ActivationKind::Gelu))
            .add(Dense::new("dense_1", ff_dim, dim, rng));
        Ok(Self {
            name: name.to_string(),
            attention,
            norm1: LayerNorm::new("norm1", dim),
            ffn,
            norm2: LayerNorm::new("norm2", dim),
        })
    }

    pub fn attention(&self) -> &SelfAttention {
        &self.attention
    }
}

impl Layer for TransformerBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        let attended = self.attention.forward(input)?;
        let hidden = self.norm1.forward(&(input + &attended))?;
        let fed = self.ffn.forward(&hidden)?;
        self.norm2.forward(&(&hidden + &fed))
    }

    fn children(&self) -> Vec<&dyn Layer> {
        vec![&self.attention as &dyn Layer, &self.norm1, &self.ffn, &self.norm2]
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.attention as &mut dyn Layer, &mut self.norm1, &mut self.ffn, &mut self.norm2]
    }
}
