//! Text to token-id conversion used to build calibration samples

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Anything that maps text onto a flat sequence of token ids
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<u32>;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> Vec<u32> + Send + Sync,
{
    fn tokenize(&self, text: &str) -> Vec<u32> {
        self(text)
    }
}

/// Character-level tokenizer: each code point modulo the vocabulary size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharTokenizer {
    vocab_size: u32,
}

impl CharTokenizer {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
        }
    }

    pub fn vocab_size(&self) -> u32 {
        self.vocab_size
    }
}

impl Tokenizer for CharTokenizer {
    fn tokenize(&self, text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32 % self.vocab_size).collect()
    }
}

/// Whitespace-separated words looked up in a fixed vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    unk_id: u32,
    lowercase: bool,
}

impl WordTokenizer {
    pub fn new(vocab: HashMap<String, u32>, unk_id: u32) -> Self {
        Self {
            vocab,
            unk_id,
            lowercase: false,
        }
    }

    /// Builds a vocabulary of the `max_vocab` most frequent words of `corpus`.
    ///
    /// Id 0 is the unknown token; ties in frequency are broken alphabetically.
    pub fn from_corpus(corpus: &str, max_vocab: usize, lowercase: bool) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for word in corpus.split_whitespace() {
            let word = if lowercase { word.to_lowercase() } else { word.to_string() };
            *counts.entry(word).or_insert(0) += 1;
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let vocab = ranked
            .into_iter()
            .take(max_vocab.saturating_sub(1))
            .enumerate()
            .map(|(i, (word, _))| (word, i as u32 + 1))
            .collect();

        Self {
            vocab,
            unk_id: 0,
            lowercase,
        }
    }

    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    /// Number of ids this tokenizer can emit, the unknown id included
    pub fn vocab_size(&self) -> usize {
        let max_id = self.vocab.values().copied().max().unwrap_or(0).max(self.unk_id);
        max_id as usize + 1
    }
}

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| {
                let id = if self.lowercase {
                    self.vocab.get(&word.to_lowercase())
                } else {
                    self.vocab.get(word)
                };
                id.copied().unwrap_or(self.unk_id)
            })
            .collect()
    }
}
