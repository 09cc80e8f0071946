//! Document embedders: a token list in, one fixed-length vector out.

pub mod dictionary;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::fingerprint::stable_hash_str;

pub use dictionary::{Dictionary, OOV_TOKEN};

pub trait Embedder: Send + Sync {
    fn kind(&self) -> &'static str;
    fn dimension(&self) -> usize;
    /// Must be deterministic. An empty document is the zero vector.
    fn embed(&self, tokens: &[String]) -> Vec<f32>;
}

/// Feature hashing: every token lands in one signed bucket, and the bucket
/// sums are L2-normalized.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashedEmbedder {
    fn kind(&self) -> &'static str {
        "hashed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, tokens: &[String]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dimension];
        for token in tokens {
            let hash = stable_hash_str(token);
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            out[bucket] += sign;
        }
        normalize(&mut out);
        out
    }
}

/// Pre-trained word vectors in the plain text format: one `token v1 .. vD`
/// per line, optionally preceded by a `count dim` header.
#[derive(Debug, Clone)]
pub struct WordVectorEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl WordVectorEmbedder {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| PipelineError::input_format(path, format!("cannot read: {err}")))?;
        Self::parse(&content).map_err(|detail| PipelineError::input_format(path, detail))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut dimension = None;
        let mut vectors = HashMap::new();

        for (idx, line) in content.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let Some(token) = fields.next() else {
                continue;
            };
            let values = fields.collect::<Vec<_>>();

            if idx == 0 && values.len() == 1 {
                let header = (token.parse::<usize>(), values[0].parse::<usize>());
                if let (Ok(_), Ok(dim)) = header {
                    dimension = Some(dim);
                    continue;
                }
            }

            let vector = values
                .iter()
                .map(|value| value.parse::<f32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| format!("line {}: {err}", idx + 1))?;
            let expected = *dimension.get_or_insert(vector.len());
            if vector.len() != expected || expected == 0 {
                return Err(format!(
                    "line {}: expected {expected} values, found {}",
                    idx + 1,
                    vector.len()
                ));
            }
            vectors.entry(token.to_string()).or_insert(vector);
        }

        match dimension {
            Some(dimension) if !vectors.is_empty() => Ok(Self { dimension, vectors }),
            _ => Err("no word vectors found".to_string()),
        }
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vectors.len()
    }
}

impl Embedder for WordVectorEmbedder {
    fn kind(&self) -> &'static str {
        "word_vectors"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, tokens: &[String]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dimension];
        let mut known = 0usize;
        for vector in tokens.iter().filter_map(|token| self.vectors.get(token)) {
            for (slot, value) in out.iter_mut().zip(vector) {
                *slot += value;
            }
            known += 1;
        }
        if known > 0 {
            for slot in &mut out {
                *slot /= known as f32;
            }
        }
        out
    }
}

pub fn build_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match &config.model_path {
        Some(path) => {
            let embedder = WordVectorEmbedder::load(path)?;
            if embedder.dimension() != config.dimension {
                log::info!(
                    "word vectors in {} have dimension {}; ignoring embedding.dimension={}",
                    path.display(),
                    embedder.dimension(),
                    config.dimension
                );
            }
            log::info!(
                "loaded {} word vectors from {}",
                embedder.vocabulary_size(),
                path.display()
            );
            Ok(Box::new(embedder))
        }
        None => Ok(Box::new(HashedEmbedder::new(config.dimension))),
    }
}

fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in values {
            *value /= norm;
        }
    }
}
