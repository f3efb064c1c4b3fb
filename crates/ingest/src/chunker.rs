use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::ReviewChunk;
use crate::reader::ReviewRow;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkConfigError {
    #[error("chunk_max_chars must be greater than zero")]
    ZeroMaxChars,

    #[error("overlap_chars ({overlap}) must be smaller than chunk_max_chars ({max})")]
    OverlapTooLarge { overlap: usize, max: usize },
}

/// Sliding-window parameters, all measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub chunk_max_chars: usize,
    pub overlap_chars: usize,
    /// A trailing window covering this many characters or fewer is not emitted.
    pub min_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1000,
            overlap_chars: 200,
            min_chunk_chars: 150,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), ChunkConfigError> {
        if self.chunk_max_chars == 0 {
            return Err(ChunkConfigError::ZeroMaxChars);
        }
        if self.overlap_chars >= self.chunk_max_chars {
            return Err(ChunkConfigError::OverlapTooLarge {
                overlap: self.overlap_chars,
                max: self.chunk_max_chars,
            });
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.chunk_max_chars - self.overlap_chars
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Character spans of every window over a text of `len` characters.
    pub fn spans(&self, len: usize) -> Vec<Range<usize>> {
        let max = self.config.chunk_max_chars;

        if len == 0 {
            return Vec::new();
        }
        if len <= max {
            return vec![0..len];
        }

        let mut spans = vec![0..max];
        let mut prev_end = max;
        let mut start = self.config.step();

        while prev_end < len {
            // what the next window would cover, overlap included
            let remaining = len - start;
            if remaining <= self.config.min_chunk_chars {
                break;
            }

            let end = (start + max).min(len);
            spans.push(start..end);
            prev_end = end;
            start += self.config.step();
        }

        spans
    }

    /// Split `text` into its ordered windows.
    pub fn split(&self, text: &str) -> Vec<String> {
        // byte offset of every char boundary, including the end of the text
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let len = bounds.len() - 1;

        self.spans(len)
            .into_iter()
            .map(|span| text[bounds[span.start]..bounds[span.end]].to_string())
            .collect()
    }

    pub fn chunk_review(&self, row: &ReviewRow) -> Vec<ReviewChunk> {
        self.split(&row.text)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, text)| ReviewChunk::new(row, chunk_index, text))
            .collect()
    }

    pub fn chunk_reviews(&self, rows: &[ReviewRow]) -> Vec<ReviewChunk> {
        let chunks: Vec<ReviewChunk> = rows.iter().flat_map(|row| self.chunk_review(row)).collect();

        tracing::debug!(
            reviews = rows.len(),
            chunks = chunks.len(),
            max_chars = self.config.chunk_max_chars,
            "chunked reviews"
        );

        chunks
    }
}
