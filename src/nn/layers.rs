//! Neural network layers

use ndarray::{Array1, Array2, Array3, Axis};
use rand::Rng;
use std::fmt;

use crate::{
    error::{TemperError, TemperResult},
    nn::hooks::HookRegistry,
    tensor::ops::{layer_norm, linear, ActivationKind},
};

/// A node of the model graph.
///
/// Containers expose their sub-layers through `children`; leaves with a dense
/// weight expose it through `as_quantizable`. Discovery only relies on these
/// capabilities, never on concrete types.
pub trait Layer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>>;

    fn children(&self) -> Vec<&dyn Layer> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
        Vec::new()
    }

    fn has_children(&self) -> bool {
        !self.children().is_empty()
    }

    fn as_quantizable(&self) -> Option<&dyn QuantizableLayer> {
        None
    }

    fn as_quantizable_mut(&mut self) -> Option<&mut dyn QuantizableLayer> {
        None
    }

    fn is_quantizable(&self) -> bool {
        self.as_quantizable().is_some()
    }

    fn as_embedding(&self) -> Option<&Embedding> {
        None
    }
}

/// A dense-like layer whose `[out_features, in_features]` weight GPTQ can rewrite
pub trait QuantizableLayer: Send + Sync {
    fn layer_name(&self) -> &str;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    fn weight(&self) -> &Array2<f32>;

    /// Replaces the weight in place; the shape must not change.
    fn set_weight(&mut self, weight: Array2<f32>) -> TemperResult<()>;

    fn hooks(&self) -> &HookRegistry;
}

/// Fully connected projection `y = act(x Wᵀ + b)`
#[derive(Debug, Clone)]
pub struct Dense {
    name: String,
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    activation: ActivationKind,
    hooks: HookRegistry,
}

impl Dense {
    /// Glorot-uniform initialized layer with a zero bias
    pub fn new(name: &str, in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let limit = (6.0 / (in_features + out_features).max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-limit..limit));
        Self {
            name: name.to_string(),
            weight,
            bias: Some(Array1::zeros(out_features)),
            activation: ActivationKind::Identity,
            hooks: HookRegistry::new(),
        }
    }

    pub fn from_weights(name: &str, weight: Array2<f32>, bias: Option<Array1<f32>>) -> TemperResult<Self> {
        if let Some(ref b) = bias {
            if b.len() != weight.nrows() {
                return Err(TemperError::shape_error(
                    &format!("bias of length {}", weight.nrows()),
                    &format!("bias of length {}", b.len()),
                    Some("The bias needs one entry per output feature"),
                ));
            }
        }
        Ok(Self {
            name: name.to_string(),
            weight,
            bias,
            activation: ActivationKind::Identity,
            hooks: HookRegistry::new(),
        })
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn activation(&self) -> ActivationKind {
        self.activation
    }
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        self.hooks.dispatch(&self.name, input);
        let mut output = linear(input, &self.weight, self.bias.as_ref())?;
        if self.activation != ActivationKind::Identity {
            let activation = self.activation;
            output.mapv_inplace(|x| activation.apply(x));
        }
        Ok(output)
    }

    fn as_quantizable(&self) -> Option<&dyn QuantizableLayer> {
        Some(self)
    }

    fn as_quantizable_mut(&mut self) -> Option<&mut dyn QuantizableLayer> {
        Some(self)
    }
}

impl QuantizableLayer for Dense {
    fn layer_name(&self) -> &str {
        &self.name
    }

    fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    fn set_weight(&mut self, weight: Array2<f32>) -> TemperResult<()> {
        if weight.dim() != self.weight.dim() {
            return Err(TemperError::shape_error(
                &format!("{:?}", self.weight.dim()),
                &format!("{:?}", weight.dim()),
                Some("Quantized weights must keep the layer's shape"),
            ));
        }
        self.weight = weight;
        Ok(())
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }
}

/// Token lookup table `[vocab_size, dim]`
#[derive(Debug, Clone)]
pub struct Embedding {
    name: String,
    table: Array2<f32>,
}

impl Embedding {
    pub fn new(name: &str, vocab_size: usize, dim: usize, rng: &mut impl Rng) -> Self {
        let table = Array2::from_shape_fn((vocab_size, dim), |_| rng.gen_range(-0.05f32..0.05));
        Self {
            name: name.to_string(),
            table,
        }
    }

    pub fn from_table(name: &str, table: Array2<f32>) -> Self {
        Self {
            name: name.to_string(),
            table,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn table(&self) -> &Array2<f32> {
        &self.table
    }

    /// Looks up `(batch, seq)` token ids, producing `(batch, seq, dim)` activations.
    pub fn embed(&self, ids: &Array2<u32>) -> TemperResult<Array3<f32>> {
        let (batch, seq) = ids.dim();
        let dim = self.dim();
        let mut output = Array3::<f32>::zeros((batch, seq, dim));
        for ((b, s), &id) in ids.indexed_iter() {
            let id = id as usize;
            if id >= self.vocab_size() {
                return Err(TemperError::InvalidInput(format!(
                    "Token id {} is out of range for embedding '{}' with vocabulary {}",
                    id,
                    self.name,
                    self.vocab_size()
                )));
            }
            output
                .index_axis_mut(Axis(0), b)
                .index_axis_mut(Axis(0), s)
                .assign(&self.table.row(id));
        }
        Ok(output)
    }
}

impl Layer for Embedding {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, _input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        Err(TemperError::InvalidInput(format!(
            "Embedding '{}' consumes token ids; call `embed` instead",
            self.name
        )))
    }

    fn as_embedding(&self) -> Option<&Embedding> {
        Some(self)
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    name: String,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps: 1e-5,
        }
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }
}

impl Layer for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        layer_norm(input, &self.gamma, &self.beta, self.eps)
    }
}

/// Standalone elementwise activation
#[derive(Debug, Clone)]
pub struct Activation {
    name: String,
    kind: ActivationKind,
}

impl Activation {
    pub fn new(name: &str, kind: ActivationKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

impl Layer for Activation {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        let kind = self.kind;
        Ok(input.mapv(|x| kind.apply(x)))
    }
}

/// Ordered container applying its layers one after another
#[derive(Debug)]
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layers: Vec::new(),
        }
    }

    pub fn add(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Array3<f32>) -> TemperResult<Array3<f32>> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        Ok(hidden)
    }

    fn children(&self) -> Vec<&dyn Layer> {
        self.layers.iter().map(|l| l.as_ref()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
        self.layers.iter_mut().map(|l| l.as_mut() as &mut dyn Layer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_dense_forward_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let dense = Dense::new("proj", 8, 4, &mut rng);
        let out = dense.forward(&Array3::ones((2, 3, 8))).unwrap();
        assert_eq!(out.dim(), (2, 3, 4));
        assert_eq!(dense.in_features(), 8);
        assert_eq!(dense.out_features(), 4);
    }

    #[test]
    fn test_dense_relu() {
        let dense = Dense::from_weights("d", arr2(&[[1.0], [-1.0]]), None)
            .unwrap()
            .with_activation(ActivationKind::Relu);
        let out = dense.forward(&Array3::from_elem((1, 1, 1), 2.0)).unwrap();
        assert_eq!(out[[0, 0, 0]], 2.0);
        assert_eq!(out[[0, 0, 1]], 0.0);
    }

    #[test]
    fn test_set_weight_rejects_new_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut dense = Dense::new("d", 3, 2, &mut rng);
        assert!(dense.set_weight(Array2::zeros((3, 2))).is_err());
        dense.set_weight(Array2::ones((2, 3))).unwrap();
        assert_eq!(dense.weight().sum(), 6.0);
    }

    #[test]
    fn test_from_weights_checks_bias() {
        assert!(Dense::from_weights("d", Array2::zeros((2, 3)), Some(arr1(&[0.0]))).is_err());
    }

    #[test]
    fn test_embedding_lookup() {
        let table = arr2(&[[0.0, 0.0], [1.0, 2.0], [3.0, 4.0]]);
        let embedding = Embedding::from_table("tok", table);
        let out = embedding.embed(&arr2(&[[2, 1]])).unwrap();
        assert_eq!(out.dim(), (1, 2, 2));
        assert_eq!(out[[0, 0, 1]], 4.0);
        assert_eq!(out[[0, 1, 0]], 1.0);
        assert!(embedding.embed(&arr2(&[[3]])).is_err());
        assert!(embedding.as_embedding().is_some());
    }

    #[test]
    fn test_sequential_children() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut seq = Sequential::new("ffn")
            .add(Dense::new("dense_0", 4, 8, &mut rng).with_activation(ActivationKind::Relu))
            .add(Dense::new("dense_1", 8, 4, &mut rng));
        assert!(seq.has_children());
        assert!(!seq.is_quantizable());
        assert_eq!(seq.children_mut().len(), 2);
        let out = seq.forward(&Array3::ones((1, 5, 4))).unwrap();
        assert_eq!(out.dim(), (1, 5, 4));
    }
}
