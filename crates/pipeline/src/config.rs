use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use index::{EmbeddingConfig, IndexConfig, PipelineError, RetryConfig};
use ingest::{ChunkerConfig, CleanerConfig};
use query::{RetrievalConfig, SummarizerConfig, Topic, default_topics};

/// Every setting of a run. Missing keys in the config file fall back to the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub cleaning: CleanerConfig,
    pub chunking: ChunkerConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryConfig,
    pub topics: Vec<Topic>,
    pub summarizer: SummarizerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Review rows: a JSONL file or a directory of them.
    pub reviews: PathBuf,
    pub chunks: PathBuf,
    pub index_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            cleaning: CleanerConfig::default(),
            chunking: ChunkerConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryConfig::default(),
            topics: default_topics(),
            summarizer: SummarizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            reviews: PathBuf::from("data/raw/reviews.jsonl"),
            chunks: PathBuf::from("data/processed/review_chunks.jsonl"),
            index_dir: PathBuf::from("data/index"),
            output_dir: PathBuf::from("data/processed"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid with the JSON file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.chunking.validate()?;
        self.index.validate()?;
        self.retrieval.validate()?;

        if self.embedding.dimension == 0 {
            return Err(PipelineError::Configuration(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.topics.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        for (i, topic) in self.topics.iter().enumerate() {
            if topic.name.trim().is_empty() || topic.keywords.trim().is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "topic {} needs a name and keywords",
                    i + 1
                )));
            }
            if self.topics[..i].iter().any(|t| t.name == topic.name) {
                return Err(PipelineError::Configuration(format!(
                    "topic {} is defined twice",
                    topic.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::Metric;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();

        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_max_chars, 1000);
        assert_eq!(config.retrieval.top_k_per_topic, 25);
        assert_eq!(config.index.embed_batch_size, 64);
        assert_eq!(config.summarizer.model, "llama3.1:8b");
        assert_eq!(config.topics.len(), 3);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "index": { "metric": "l2" },
                "retrieval": { "max_chunks_per_topic": 5 },
                "topics": [{ "name": "price", "keywords": "price value expensive cheap" }]
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.index.metric, Metric::L2);
        assert_eq!(config.index.embed_batch_size, 64);
        assert_eq!(config.retrieval.max_chunks_per_topic, 5);
        assert_eq!(config.retrieval.max_chunks_per_review, 1);
        assert_eq!(config.topics, vec![Topic::new("price", "price value expensive cheap")]);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = AppConfig::default();
        config.chunking.overlap_chars = config.chunking.chunk_max_chars;
        assert!(matches!(config.validate(), Err(PipelineError::Configuration(_))));

        let mut config = AppConfig::default();
        config.retrieval.max_chunks_per_review = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.topics.push(Topic::new("food", "menu"));
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.topics.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(AppConfig::load(Some(&path)).is_err());
        assert!(AppConfig::load(Some(&dir.path().join("missing.json"))).is_err());
    }
}
