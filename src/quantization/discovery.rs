//! Mapping a model onto "embedding followed by transformer blocks"

use std::collections::HashSet;
use tracing::debug;

use crate::{
    error::{TemperError, TemperResult},
    nn::{
        layers::{Embedding, Layer, QuantizableLayer},
        models::Model,
        visit::{named_quantizable, named_quantizable_mut},
    },
};

/// Prefix given to every sub-layer path inside a block
pub const BLOCK_PREFIX: &str = "block";

/// How the structure was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureSource {
    Backbone,
    TopLevelLayers,
}

pub struct DiscoveredModel<'a> {
    pub embedding: &'a Embedding,
    pub blocks: Vec<&'a mut dyn Layer>,
    pub source: StructureSource,
}

/// Locates the token embedding and the ordered transformer blocks of `model`.
///
/// A model exposing a backbone is read from it directly. Otherwise the first
/// embedding among the top-level layers is taken, and every later top-level
/// layer with sub-layers becomes a block.
pub fn discover_structure<'a>(model: &'a mut dyn Model) -> TemperResult<DiscoveredModel<'a>> {
    let model_name = model.name().to_string();

    let (embedding, blocks, source) = if model.has_backbone() {
        let parts = model.backbone_mut().ok_or_else(|| {
            TemperError::model_structure(&model_name, "model reports a backbone but did not expose it")
        })?;
        (
            parts.token_embedding.or(parts.embedding),
            parts.transformer_layers,
            StructureSource::Backbone,
        )
    } else {
        let mut embedding: Option<&'a Embedding> = None;
        let mut blocks = Vec::new();
        for layer in model.layers_mut() {
            if embedding.is_none() {
                if layer.as_embedding().is_some() {
                    let shared: &'a dyn Layer = layer;
                    embedding = shared.as_embedding();
                }
            } else if layer.has_children() {
                blocks.push(layer);
            }
        }
        (embedding, blocks, StructureSource::TopLevelLayers)
    };

    let embedding = embedding.ok_or_else(|| {
        TemperError::model_structure(&model_name, "Could not automatically find an embedding layer in the model.")
    })?;
    if blocks.is_empty() {
        return Err(TemperError::model_structure(
            &model_name,
            "Could not automatically find any transformer-like blocks to quantize.",
        ));
    }

    debug!(model = %model_name, blocks = blocks.len(), ?source, "Discovered model structure");
    Ok(DiscoveredModel {
        embedding,
        blocks,
        source,
    })
}

/// Quantizable sub-layers of one block, keyed by path and in discovery order
pub struct LayerRegistry<'a> {
    entries: Vec<(String, &'a dyn QuantizableLayer)>,
}

impl<'a> LayerRegistry<'a> {
    /// Fails when two sub-layers resolve to the same path, since captured
    /// inputs are keyed by path.
    pub fn for_block(block: &'a dyn Layer) -> TemperResult<Self> {
        let entries = named_quantizable(block, BLOCK_PREFIX);
        let mut seen = HashSet::with_capacity(entries.len());
        for (name, _) in &entries {
            if !seen.insert(name.as_str()) {
                return Err(TemperError::model_structure(
                    name,
                    &format!("Block '{}' has more than one sub-layer at this path", block.name()),
                ));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&'a dyn QuantizableLayer> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, layer)| *layer)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &'a dyn QuantizableLayer)> + '_ {
        self.entries.iter().map(|(n, layer)| (n.as_str(), *layer))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable counterpart of [`LayerRegistry::for_block`]
pub fn find_layers_in_block_mut(block: &mut dyn Layer) -> Vec<(String, &mut dyn QuantizableLayer)> {
    named_quantizable_mut(block, BLOCK_PREFIX)
}
