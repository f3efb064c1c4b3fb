//! Deterministic in-process embedders for tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::embeddings::Embedder;
use crate::error::PipelineError;

/// Bag-of-words embedder over a fixed vocabulary: dimension `i` counts
/// occurrences of `vocabulary[i]` (case-insensitive, punctuation stripped).
pub struct KeywordEmbedder {
    vocabulary: Vec<String>,
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: &[&str]) -> Self {
        Self {
            vocabulary: vocabulary.iter().map(|w| w.to_lowercase()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.vocabulary.len()];
        for word in text.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if let Some(i) = self.vocabulary.iter().position(|v| *v == word) {
                vector[i] += 1.0;
            }
        }
        vector
    }
}

impl Embedder for KeywordEmbedder {
    fn model(&self) -> &str {
        "keyword-test"
    }

    fn dimension(&self) -> usize {
        self.vocabulary.len()
    }

    fn normalizes(&self) -> bool {
        false
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

/// Embedder whose every call fails.
pub struct FailingEmbedder {
    pub dimension: usize,
}

impl Embedder for FailingEmbedder {
    fn model(&self) -> &str {
        "failing-test"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn normalizes(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Err(PipelineError::EmbeddingProvider(
            "provider unavailable".to_string(),
        ))
    }
}
