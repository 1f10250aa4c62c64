//! Weight persistence for the dense layers of a model

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{
    error::{TemperError, TemperResult},
    nn::{
        models::Model,
        visit::{quantizable_leaves, quantizable_leaves_mut},
    },
};

/// Dense weights keyed by layer path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub model: String,
    pub tensors: BTreeMap<String, Array2<f32>>,
}

impl StateDict {
    pub fn from_model(model: &dyn Model) -> Self {
        let mut tensors = BTreeMap::new();
        for layer in model.layers() {
            for (name, dense) in quantizable_leaves(layer, layer.name().to_string()) {
                tensors.insert(name, dense.weight().clone());
            }
        }
        Self {
            model: model.name().to_string(),
            tensors,
        }
    }

    /// Overwrites every dense weight of `model` from this dictionary.
    ///
    /// Every dense layer must have an entry of the same shape; nothing is written
    /// unless all of them do.
    pub fn apply_to(&self, model: &mut dyn Model) -> TemperResult<usize> {
        let mut targets = Vec::new();
        for layer in model.layers_mut() {
            let path = layer.name().to_string();
            targets.extend(quantizable_leaves_mut(layer, path));
        }

        for (name, dense) in &targets {
            let tensor = self.tensors.get(name).ok_or_else(|| {
                TemperError::model_structure(name, "no tensor for this layer in the checkpoint")
            })?;
            if tensor.dim() != dense.weight().dim() {
                return Err(TemperError::shape_error(
                    &format!("{:?} for '{}'", dense.weight().dim(), name),
                    &format!("{:?}", tensor.dim()),
                    Some("The checkpoint was saved from a model with a different architecture"),
                ));
            }
        }

        let loaded = targets.len();
        for (name, dense) in targets {
            if let Some(tensor) = self.tensors.get(&name) {
                dense.set_weight(tensor.clone())?;
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

pub fn save_weights(model: &dyn Model, path: impl AsRef<Path>) -> TemperResult<usize> {
    let path = path.as_ref();
    let state = StateDict::from_model(model);
    let bytes = bincode::serialize(&state)?;
    std::fs::write(path, bytes)?;

    tracing::info!(tensors = state.len(), "Saved weights to {:?}", path);
    Ok(state.len())
}

pub fn load_weights(model: &mut dyn Model, path: impl AsRef<Path>) -> TemperResult<usize> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let state: StateDict = bincode::deserialize(&bytes)?;
    let loaded = state.apply_to(model)?;

    tracing::info!(tensors = loaded, "Loaded weights from {:?}", path);
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::models::{TransformerLm, TransformerLmConfig};
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::tempdir;

    fn config() -> TransformerLmConfig {
        TransformerLmConfig {
            vocab_size: 16,
            dim: 8,
            num_heads: 2,
            ff_dim: 16,
            num_blocks: 2,
        }
    }

    #[test]
    fn test_state_dict_names() {
        let model = TransformerLm::new("lm", &config(), &mut StdRng::seed_from_u64(0)).unwrap();
        let state = StateDict::from_model(&model);
        assert_eq!(state.len(), 13);
        assert!(state.tensors.contains_key("block_0.attention.query"));
        assert!(state.tensors.contains_key("block_1.ffn.dense_1"));
        assert!(state.tensors.contains_key("head"));
    }

    #[test]
    fn test_save_and_load_restore_outputs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let ids = Array2::from_shape_fn((1, 5), |(_, s)| (s * 3 % 16) as u32);

        let source = TransformerLm::new("lm", &config(), &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(save_weights(&source, &path).unwrap(), 13);

        let mut target = TransformerLm::new("lm", &config(), &mut StdRng::seed_from_u64(1)).unwrap();
        let mut other = TransformerLm::new("lm", &config(), &mut StdRng::seed_from_u64(2)).unwrap();
        assert_ne!(other.forward(&ids).unwrap(), source.forward(&ids).unwrap());

        load_weights(&mut other, &path).unwrap();
        load_weights(&mut target, &path).unwrap();
        assert_eq!(target.forward(&ids).unwrap(), source.forward(&ids).unwrap());
        assert_eq!(StateDict::from_model(&other), StateDict::from_model(&source));
    }

    #[test]
    fn test_load_rejects_other_architecture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let source = TransformerLm::new("lm", &config(), &mut StdRng::seed_from_u64(1)).unwrap();
        save_weights(&source, &path).unwrap();

        let wider = TransformerLmConfig { ff_dim: 32, ..config() };
        let mut target = TransformerLm::new("lm", &wider, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(matches!(load_weights(&mut target, &path), Err(TemperError::ShapeError(_))));
    }
}
