//! Quantizes a small randomly initialized transformer language model to 4 bits
//! and compares its perplexity before and after.
//!
//! Run with `cargo run --example quantize_toy`; set `RUST_LOG=debug` for
//! per-layer detail.

use rand::{rngs::StdRng, SeedableRng};

use temper::{
    calibration::{get_dataloader, CharTokenizer, LocalDatasetProvider},
    config::{ConfigBuilder, DatasetSource},
    error::TemperResult,
    nn::{save_weights, TransformerLm, TransformerLmConfig},
    quantization::{evaluate_perplexity, quantize_model},
};

const CORPUS: &[&str] = &[
    "It was the best of times, it was the worst of times, it was the age of wisdom.",
    "It was the age of foolishness, it was the epoch of belief, it was the epoch of incredulity.",
    "It was the season of Light, it was the season of Darkness, it was the spring of hope.",
    "We had everything before us, we had nothing before us.",
];

fn main() -> TemperResult<()> {
    temper::init()?;

    let lm_config = TransformerLmConfig {
        vocab_size: 128,
        dim: 64,
        num_heads: 4,
        ff_dim: 128,
        num_blocks: 2,
    };
    let mut model = TransformerLm::new("toy_lm", &lm_config, &mut StdRng::seed_from_u64(7))?;
    let tokenizer = CharTokenizer::new(lm_config.vocab_size as u32);

    let config = ConfigBuilder::new()
        .dataset(DatasetSource::from_texts(CORPUS.iter().copied()))
        .nsamples(16)
        .seqlen(32)
        .wbits(4)
        .group_size(Some(16))
        .symmetric(true)
        .eval_samples(4)
        .build()?;

    let held_out = get_dataloader(
        &tokenizer,
        config.seqlen,
        &config.dataset,
        config.nsamples + config.eval_samples,
        config.seed,
        &LocalDatasetProvider::from_env(),
    )?
    .split_at(config.nsamples)?
    .1;
    let before = evaluate_perplexity(&model, &held_out, config.ignore_token)?;

    let summary = quantize_model(&mut model, &config, &tokenizer)?;

    println!("Quantized {} layers in {:?}", summary.layers_quantized(), summary.elapsed);
    for block in &summary.blocks {
        for layer in &block.layers {
            println!(
                "  {:>8} {:<24} {:>4}x{:<4} loss {:.4}",
                block.name, layer.name, layer.rows, layer.columns, layer.loss
            );
        }
    }
    println!("Perplexity before: {:.3}", before);
    if let Some(after) = summary.perplexity {
        println!("Perplexity after:  {:.3}", after);
    }

    let path = std::env::temp_dir().join("temper_toy_lm.bin");
    let tensors = save_weights(&model, &path)?;
    println!("Saved {} tensors to {}", tensors, path.display());
    Ok(())
}
