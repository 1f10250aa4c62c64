//! Walkers that find dense-like layers inside a layer tree
//!
//! A child's name is `{parent path}.{child name}`. A quantizable layer is a leaf
//! for the walk; any other layer with children is descended into.

use crate::nn::layers::{Layer, QuantizableLayer};

pub fn named_quantizable<'a>(root: &'a dyn Layer, prefix: &str) -> Vec<(String, &'a dyn QuantizableLayer)> {
    let mut found = Vec::new();
    for child in root.children() {
        let path = format!("{}.{}", prefix, child.name());
        visit(child, path, &mut found);
    }
    found
}

pub fn named_quantizable_mut<'a>(
    root: &'a mut dyn Layer,
    prefix: &str,
) -> Vec<(String, &'a mut dyn QuantizableLayer)> {
    let mut found = Vec::new();
    for child in root.children_mut() {
        let path = format!("{}.{}", prefix, child.name());
        visit_mut(child, path, &mut found);
    }
    found
}

/// Like [`named_quantizable`], but `layer` itself is reported when it is quantizable.
pub fn quantizable_leaves<'a>(layer: &'a dyn Layer, path: String) -> Vec<(String, &'a dyn QuantizableLayer)> {
    let mut found = Vec::new();
    visit(layer, path, &mut found);
    found
}

pub fn quantizable_leaves_mut<'a>(
    layer: &'a mut dyn Layer,
    path: String,
) -> Vec<(String, &'a mut dyn QuantizableLayer)> {
    let mut found = Vec::new();
    visit_mut(layer, path, &mut found);
    found
}

fn visit<'a>(layer: &'a dyn Layer, path: String, found: &mut Vec<(String, &'a dyn QuantizableLayer)>) {
    if let Some(quantizable) = layer.as_quantizable() {
        found.push((path, quantizable));
        return;
    }
    for child in layer.children() {
        let child_path = format!("{}.{}", path, child.name());
        visit(child, child_path, found);
    }
}

fn visit_mut<'a>(
    layer: &'a mut dyn Layer,
    path: String,
    found: &mut Vec<(String, &'a mut dyn QuantizableLayer)>,
) {
    if layer.is_quantizable() {
        if let Some(quantizable) = layer.as_quantizable_mut() {
            found.push((path, quantizable));
        }
        return;
    }
    for child in layer.children_mut() {
        let child_path = format!("{}.{}", path, child.name());
        visit_mut(child, child_path, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::blocks::TransformerBlock;
    use crate::nn::layers::{Dense, Sequential};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_block_layer_names() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut block = TransformerBlock::new("block_0", 8, 2, 16, &mut rng).unwrap();
        let names: Vec<String> = named_quantizable(&block, "block").into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "block.attention.query",
                "block.attention.key",
                "block.attention.value",
                "block.attention.output",
                "block.ffn.dense_0",
                "block.ffn.dense_1",
            ]
        );

        let mutable = named_quantizable_mut(&mut block, "block");
        assert_eq!(mutable.len(), 6);
        assert_eq!(mutable[4].1.out_features(), 16);
    }

    #[test]
    fn test_nested_containers() {
        let mut rng = StdRng::seed_from_u64(2);
        let inner = Sequential::new("inner").add(Dense::new("deep", 4, 4, &mut rng));
        let outer = Sequential::new("outer").add(inner).add(Dense::new("shallow", 4, 4, &mut rng));
        let names: Vec<String> = named_quantizable(&outer, "block").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["block.inner.deep", "block.shallow"]);
    }

    #[test]
    fn test_leaf_reports_itself() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut head = Dense::new("head", 4, 10, &mut rng);
        assert_eq!(quantizable_leaves(&head, "head".to_string()).len(), 1);
        assert!(named_quantizable(&head, "head").is_empty());
        assert_eq!(quantizable_leaves_mut(&mut head, "head".to_string())[0].0, "head");
    }
}
