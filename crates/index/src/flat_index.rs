//! Exact in-memory similarity index over row-major `f32` vectors.
//!
//! Scores are "higher is better" for both metrics: inner product for cosine
//! (vectors are expected to be unit length), negative squared distance for l2.
//!
//! The file header carries the id of the build that wrote it, so a shard's
//! index and metadata can be matched up on load.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::PipelineError;

const MAGIC: &[u8; 4] = b"RVIX";
const FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 4 + 1 + 1 + 16 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    fn tag(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::L2 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::L2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::L2 => write!(f, "l2"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexFormatError {
    #[error("not an index file")]
    BadMagic,
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown metric tag {0}")]
    UnknownMetric(u8),
    #[error("index file truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// One search result: a score and the vector's insertion position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub score: f32,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    metric: Metric,
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(metric: Metric, dimension: usize) -> Result<Self, PipelineError> {
        if dimension == 0 {
            return Err(PipelineError::Configuration(
                "index dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            metric,
            dimension,
            data: Vec::new(),
        })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<(), PipelineError> {
        self.check_dimension(vector)?;
        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end)
    }

    /// Top-`k` hits, best first. Equal scores keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, PipelineError> {
        self.check_dimension(query)?;

        let mut hits: Vec<Hit> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, vector)| Hit {
                score: self.score(query, vector),
                position,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        });
        hits.truncate(k);

        Ok(hits)
    }

    fn score(&self, query: &[f32], vector: &[f32]) -> f32 {
        match self.metric {
            Metric::Cosine => query.iter().zip(vector).map(|(a, b)| a * b).sum(),
            Metric::L2 => -query
                .iter()
                .zip(vector)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>(),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), PipelineError> {
        if vector.len() != self.dimension {
            return Err(PipelineError::Configuration(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self, build_id: Uuid) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.push(self.metric.tag());
        bytes.extend_from_slice(build_id.as_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Decode an index file, returning the index and the build id it was
    /// written with.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, Uuid), IndexFormatError> {
        if bytes.len() < HEADER_LEN {
            if bytes.len() < 4 || &bytes[..4] != MAGIC {
                return Err(IndexFormatError::BadMagic);
            }
            return Err(IndexFormatError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        if &bytes[..4] != MAGIC {
            return Err(IndexFormatError::BadMagic);
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(IndexFormatError::UnsupportedVersion(bytes[4]));
        }
        let metric = Metric::from_tag(bytes[5]).ok_or(IndexFormatError::UnknownMetric(bytes[5]))?;

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&bytes[6..22]);
        let build_id = Uuid::from_bytes(id_bytes);

        let mut dim_bytes = [0u8; 4];
        dim_bytes.copy_from_slice(&bytes[22..26]);
        let dimension = u32::from_le_bytes(dim_bytes) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[26..34]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if bytes.len() != expected || dimension == 0 {
            return Err(IndexFormatError::Truncated {
                expected,
                found: bytes.len(),
            });
        }

        let data = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let index = Self {
            metric,
            dimension,
            data,
        };
        Ok((index, build_id))
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
