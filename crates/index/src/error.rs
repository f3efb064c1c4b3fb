use serde::Serialize;
use thiserror::Error;

use ingest::ChunkConfigError;

/// Failure kinds shared by the build and retrieval stages.
///
/// `Configuration` and `EmbeddingProvider` abort a whole run. The two index
/// variants are scoped to a single entity shard.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("index persistence error for entity {entity_id}: {reason}")]
    IndexPersistence { entity_id: String, reason: String },

    #[error("index/metadata mismatch for entity {entity_id}: {reason}")]
    IndexMetadataMismatch { entity_id: String, reason: String },

    #[error("summarizer error: {0}")]
    Summarizer(String),
}

impl PipelineError {
    pub fn persistence(entity_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::IndexPersistence {
            entity_id: entity_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn mismatch(entity_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::IndexMetadataMismatch {
            entity_id: entity_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::EmbeddingProvider(_) => "embedding_provider",
            Self::IndexPersistence { .. } => "index_persistence",
            Self::IndexMetadataMismatch { .. } => "index_metadata_mismatch",
            Self::Summarizer(_) => "summarizer",
        }
    }

    /// Whether the error must stop the current run rather than one shard.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::EmbeddingProvider(_) | Self::Summarizer(_)
        )
    }
}

/// A per-entity failure recorded in a stage report instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub entity_id: String,
    pub kind: String,
    pub message: String,
}

impl ShardFailure {
    pub fn new(entity_id: &str, err: &PipelineError) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ChunkConfigError> for PipelineError {
    fn from(err: ChunkConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
