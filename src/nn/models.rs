//! Language models assembled from the layer library

use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::TemperResult,
    nn::{
        blocks::TransformerBlock,
        layers::{Dense, Embedding, Layer, LayerNorm},
    },
};

/// Named pieces of a model that exposes a conventional backbone
pub struct BackboneParts<'a> {
    pub token_embedding: Option<&'a Embedding>,
    pub embedding: Option<&'a Embedding>,
    pub transformer_layers: Vec<&'a mut dyn Layer>,
}

/// A token-in, logits-out model
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Top-level layers in forward order
    fn layers(&self) -> Vec<&dyn Layer>;

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer>;

    fn has_backbone(&self) -> bool {
        false
    }

    fn backbone_mut(&mut self) -> Option<BackboneParts<'_>> {
        None
    }

    /// `(batch, seq)` token ids to `(batch, seq, vocab)` logits
    fn forward(&self, token_ids: &Array2<u32>) -> TemperResult<Array3<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerLmConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub num_heads: usize,
    pub ff_dim: usize,
    pub num_blocks: usize,
}

impl Default for TransformerLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            dim: 64,
            num_heads: 4,
            ff_dim: 128,
            num_blocks: 2,
        }
    }
}

fn build_blocks(config: &TransformerLmConfig, rng: &mut impl Rng) -> TemperResult<Vec<TransformerBlock>> {
    let mut blocks = Vec::with_capacity(config.num_blocks);
    for i in 0..config.num_blocks {
        let name = format!("block_{}", i);
        blocks.push(TransformerBlock::new(&name, config.dim, config.num_heads, config.ff_dim, rng)?);
    }
    Ok(blocks)
}

fn run_blocks<'a>(
    embedding: &Embedding,
    blocks: impl IntoIterator<Item = &'a TransformerBlock>,
    final_norm: &LayerNorm,
    head: &Dense,
    token_ids: &Array2<u32>,
) -> TemperResult<Array3<f32>> {
    let mut hidden = embedding.embed(token_ids)?;
    for block in blocks {
        hidden = block.forward(&hidden)?;
    }
    let hidden = final_norm.forward(&hidden)?;
    head.forward(&hidden)
}

/// Decoder-only transformer whose embedding, blocks and head are plain top-level layers
#[derive(Debug)]
pub struct TransformerLm {
    name: String,
    embedding: Embedding,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    head: Dense,
}

impl TransformerLm {
    pub fn new(name: &str, config: &TransformerLmConfig, rng: &mut impl Rng) -> TemperResult<Self> {
        Ok(Self {
            name: name.to_string(),
            embedding: Embedding::new("embedding", config.vocab_size, config.dim, rng),
            blocks: build_blocks(config, rng)?,
            final_norm: LayerNorm::new("final_norm", config.dim),
            head: Dense::new("head", config.dim, config.vocab_size, rng),
        })
    }

    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

impl Model for TransformerLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = vec![&self.embedding];
        layers.extend(self.blocks.iter().map(|b| b as &dyn Layer));
        layers.push(&self.final_norm);
        layers.push(&self.head);
        layers
    }

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        let mut layers: Vec<&mut dyn Layer> = vec![&mut self.embedding];
        layers.extend(self.blocks.iter_mut().map(|b| b as &mut dyn Layer));
        layers.push(&mut self.final_norm);
        layers.push(&mut self.head);
        layers
    }

    fn forward(&self, token_ids: &Array2<u32>) -> TemperResult<Array3<f32>> {
        run_blocks(&self.embedding, &self.blocks, &self.final_norm, &self.head, token_ids)
    }
}

#[derive(Debug)]
struct Backbone {
    token_embedding: Embedding,
    transformer_layers: Vec<TransformerBlock>,
    final_norm: LayerNorm,
}

/// Transformer language model organized as a backbone plus a projection head
#[derive(Debug)]
pub struct BackboneLm {
    name: String,
    backbone: Backbone,
    head: Dense,
}

impl BackboneLm {
    pub fn new(name: &str, config: &TransformerLmConfig, rng: &mut impl Rng) -> TemperResult<Self> {
        let backbone = Backbone {
            token_embedding: Embedding::new("token_embedding", config.vocab_size, config.dim, rng),
            transformer_layers: build_blocks(config, rng)?,
            final_norm: LayerNorm::new("final_norm", config.dim),
        };
        Ok(Self {
            name: name.to_string(),
            backbone,
            head: Dense::new("head", config.dim, config.vocab_size, rng),
        })
    }
}

impl Model for BackboneLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = vec![&self.backbone.token_embedding];
        layers.extend(self.backbone.transformer_layers.iter().map(|b| b as &dyn Layer));
        layers.push(&self.backbone.final_norm);
        layers.push(&self.head);
        layers
    }

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        let mut layers: Vec<&mut dyn Layer> = vec![&mut self.backbone.token_embedding];
        layers.extend(self.backbone.transformer_layers.iter_mut().map(|b| b as &mut dyn Layer));
        layers.push(&mut self.backbone.final_norm);
        layers.push(&mut self.head);
        layers
    }

    fn has_backbone(&self) -> bool {
        true
    }

    fn backbone_mut(&mut self) -> Option<BackboneParts<'_>> {
        let backbone = &mut self.backbone;
        Some(BackboneParts {
            token_embedding: Some(&backbone.token_embedding),
            embedding: None,
            transformer_layers: backbone
                .transformer_layers
                .iter_mut()
                .map(|b| b as &mut dyn Layer)
                .collect(),
        })
    }

    fn forward(&self, token_ids: &Array2<u32>) -> TemperResult<Array3<f32>> {
        run_blocks(
            &self.backbone.token_embedding,
            &self.backbone.transformer_layers,
            &self.backbone.final_norm,
            &self.head,
            token_ids,
        )
    }
}
