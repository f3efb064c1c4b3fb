use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ingest::ReviewChunk;

use crate::embeddings::{Embedder, embed_all};
use crate::error::{PipelineError, ShardFailure};
use crate::flat_index::{FlatIndex, Metric};
use crate::progress::{ProgressEvent, ProgressSender, emit};
use crate::retry::RetryPolicy;
use crate::store::{FileCounts, IndexManifest, ShardStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub metric: Metric,
    pub embed_batch_size: usize,
    /// Shards written at the same time.
    pub concurrency: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            embed_batch_size: 64,
            concurrency: 4,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.embed_batch_size == 0 {
            return Err(PipelineError::Configuration(
                "embed_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::Configuration(
                "index concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub entities: usize,
    pub indexes_built: usize,
    pub chunks_indexed: usize,
    pub files: FileCounts,
    pub failures: Vec<ShardFailure>,
}

/// A failed build. `report` is set when shards were already written, so the
/// per-entity failures survive the error.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct BuildError {
    pub report: Option<BuildReport>,
    pub source: PipelineError,
}

impl From<PipelineError> for BuildError {
    fn from(source: PipelineError) -> Self {
        Self {
            report: None,
            source,
        }
    }
}

/// One entity's chunks and their vectors, ready to persist.
struct BuiltShard {
    entity_id: String,
    index: FlatIndex,
    chunks: Vec<ReviewChunk>,
}

pub struct IndexBuilder<'a, E> {
    embedder: &'a E,
    store: &'a ShardStore,
    config: &'a IndexConfig,
    retry: &'a RetryPolicy,
    normalize: bool,
}

impl<'a, E: Embedder> IndexBuilder<'a, E> {
    pub fn new(
        embedder: &'a E,
        store: &'a ShardStore,
        config: &'a IndexConfig,
        retry: &'a RetryPolicy,
        normalize: bool,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
            retry,
            normalize,
        }
    }

    /// Whether vectors are unit-normalized before indexing; always for cosine.
    pub fn unit_normalize(&self) -> bool {
        self.normalize || self.config.metric == Metric::Cosine
    }

    pub fn manifest(&self) -> IndexManifest {
        IndexManifest {
            model: self.embedder.model().to_string(),
            dimension: self.embedder.dimension(),
            metric: self.config.metric,
            normalized: self.unit_normalize(),
        }
    }

    /// Build and persist one index per entity.
    ///
    /// Every shard is embedded before anything is written, so a provider
    /// failure leaves the directory untouched. Write failures are recorded per
    /// entity in the report; the build goes on with the other entities.
    pub async fn build(
        &self,
        chunks: Vec<ReviewChunk>,
        progress: Option<&ProgressSender>,
    ) -> Result<BuildReport, BuildError> {
        self.config.validate()?;

        let groups = group_by_entity(chunks);
        let total = groups.len();
        tracing::info!(
            entities = total,
            metric = %self.config.metric,
            model = self.embedder.model(),
            "building entity indexes"
        );

        let mut shards = Vec::with_capacity(total);
        for (entity_id, chunks) in groups {
            shards.push(self.embed_shard(entity_id, chunks).await?);
        }

        let mut report = BuildReport {
            entities: total,
            ..BuildReport::default()
        };

        let mut writes = stream::iter(shards.iter())
            .map(|shard| async move {
                let result = self
                    .store
                    .write_shard(&shard.entity_id, &shard.index, &shard.chunks)
                    .await;
                (shard, result)
            })
            .buffered(self.config.concurrency);

        let mut done = 0;
        while let Some((shard, result)) = writes.next().await {
            done += 1;
            let message = match result {
                Ok(()) => {
                    report.indexes_built += 1;
                    report.chunks_indexed += shard.chunks.len();
                    format!("indexed {} chunks", shard.chunks.len())
                }
                Err(err) => {
                    tracing::error!(entity_id = %shard.entity_id, error = %err, "failed to persist shard");
                    let message = format!("failed: {err}");
                    report.failures.push(ShardFailure::new(&shard.entity_id, &err));
                    message
                }
            };
            emit(
                progress,
                ProgressEvent {
                    stage: "index",
                    entity_index: done,
                    total,
                    message: format!("{}: {message}", shard.entity_id),
                },
            );
        }
        drop(writes);

        self.store.write_manifest(&self.manifest()).await?;

        report.files = self.store.count_files().await?;
        if report.files.index_files != report.files.metadata_files {
            let err = PipelineError::mismatch(
                "*",
                format!(
                    "{} index files but {} metadata files in {}",
                    report.files.index_files,
                    report.files.metadata_files,
                    self.store.dir().display()
                ),
            );
            tracing::error!(error = %err, failures = report.failures.len(), "index directory is inconsistent");
            return Err(BuildError {
                report: Some(report),
                source: err,
            });
        }

        tracing::info!(
            indexes_built = report.indexes_built,
            chunks_indexed = report.chunks_indexed,
            index_files = report.files.index_files,
            metadata_files = report.files.metadata_files,
            failures = report.failures.len(),
            "index build finished"
        );

        Ok(report)
    }

    async fn embed_shard(
        &self,
        entity_id: String,
        chunks: Vec<ReviewChunk>,
    ) -> Result<BuiltShard, PipelineError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(
            self.embedder,
            &texts,
            self.config.embed_batch_size,
            self.retry,
            self.unit_normalize(),
        )
        .await?;

        let mut index = FlatIndex::new(self.config.metric, self.embedder.dimension())?;
        for vector in &vectors {
            index.add(vector)?;
        }

        tracing::debug!(entity_id = %entity_id, vectors = index.len(), "embedded shard");
        Ok(BuiltShard {
            entity_id,
            index,
            chunks,
        })
    }
}

/// Group chunks by entity id. Entities come out sorted; chunks keep corpus order.
pub fn group_by_entity(chunks: Vec<ReviewChunk>) -> BTreeMap<String, Vec<ReviewChunk>> {
    let mut groups: BTreeMap<String, Vec<ReviewChunk>> = BTreeMap::new();
    for chunk in chunks {
        groups.entry(chunk.entity_id.clone()).or_default().push(chunk);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::progress_channel;
    use crate::testing::{FailingEmbedder, KeywordEmbedder};

    fn chunk(entity_id: &str, review_id: &str, text: &str) -> ReviewChunk {
        ReviewChunk {
            chunk_id: format!("{review_id}_0"),
            review_id: review_id.to_string(),
            entity_id: entity_id.to_string(),
            entity_name: format!("{entity_id} name"),
            text: text.to_string(),
            char_count: text.chars().count(),
            star_rating: 4.0,
            date: "2024-01-01".to_string(),
            chunk_index: 0,
        }
    }

    fn corpus() -> Vec<ReviewChunk> {
        vec![
            chunk("b", "r1", "pizza crust"),
            chunk("a", "r2", "rude waiter"),
            chunk("b", "r3", "loud music"),
            chunk("a", "r4", "pizza pizza"),
            chunk("a", "r5", "waiter music"),
        ]
    }

    fn embedder() -> KeywordEmbedder {
        KeywordEmbedder::new(&["pizza", "crust", "rude", "waiter", "loud", "music"])
    }

    #[test]
    fn test_group_by_entity_keeps_corpus_order() {
        let groups = group_by_entity(corpus());

        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
        let a: Vec<_> = groups["a"].iter().map(|c| c.review_id.as_str()).collect();
        assert_eq!(a, vec!["r2", "r4", "r5"]);
    }

    #[tokio::test]
    async fn test_build_writes_aligned_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let embedder = embedder();
        let config = IndexConfig {
            embed_batch_size: 2,
            ..IndexConfig::default()
        };
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);
        let (tx, mut rx) = progress_channel();

        let report = builder.build(corpus(), Some(&tx)).await.unwrap();

        assert_eq!(report.entities, 2);
        assert_eq!(report.indexes_built, 2);
        assert_eq!(report.chunks_indexed, 5);
        assert!(report.failures.is_empty());
        assert_eq!(report.files.index_files, 2);
        assert_eq!(report.files.metadata_files, 2);
        // entity a has 3 chunks in batches of 2, entity b has 2
        assert_eq!(embedder.calls(), 3);

        let files = store.discover().await.unwrap();
        let a = store.load_shard(&files[0]).await.unwrap();
        assert_eq!(a.entity_id, "a");
        assert_eq!(a.index.len(), a.metadata.len());
        // position 1 of entity a is "pizza pizza", normalized onto the pizza axis
        assert_eq!(a.metadata[1].review_id, "r4");
        assert_eq!(a.index.vector(1).unwrap()[0], 1.0);

        let manifest = store.read_manifest().await.unwrap().unwrap();
        assert_eq!(manifest.model, "keyword-test");
        assert_eq!(manifest.dimension, 6);
        assert!(manifest.normalized);

        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].entity_index, 2);
        assert_eq!(events[1].total, 2);
    }

    #[tokio::test]
    async fn test_provider_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let embedder = FailingEmbedder { dimension: 4 };
        let config = IndexConfig::default();
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);

        let err = builder.build(corpus(), None).await.unwrap_err();

        assert!(matches!(err.source, PipelineError::EmbeddingProvider(_)));
        assert!(err.report.is_none());
        assert_eq!(store.count_files().await.unwrap(), FileCounts::default());
        assert_eq!(store.read_manifest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated_to_one_entity() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        // a directory where b's index file should go makes its rename fail
        std::fs::create_dir(store.index_path("b")).unwrap();
        let embedder = embedder();
        let config = IndexConfig::default();
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);

        let report = builder.build(corpus(), None).await.unwrap();

        assert_eq!(report.indexes_built, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity_id, "b");
        assert_eq!(report.failures[0].kind, "index_persistence");
        assert_eq!(report.files.index_files, 1);
        assert_eq!(report.files.metadata_files, 1);
        assert!(!store.metadata_path("b").exists());

        let files = store.discover().await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(store.load_shard(&files[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_rebuild_over_existing_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let embedder = embedder();
        let config = IndexConfig::default();
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);
        builder.build(corpus(), None).await.unwrap();

        let mut rebuilt = corpus();
        rebuilt.retain(|c| c.review_id != "r2");
        rebuilt[0].text = "loud crust".to_string();
        let report = builder.build(rebuilt, None).await.unwrap();

        assert_eq!(report.indexes_built, 2);
        assert_eq!(report.files.index_files, 2);
        let files = store.discover().await.unwrap();
        let a = store.load_shard(&files[0]).await.unwrap();
        let ids: Vec<_> = a.metadata.iter().map(|c| c.review_id.as_str()).collect();
        assert_eq!(ids, vec!["r4", "r5"]);
        let b = store.load_shard(&files[1]).await.unwrap();
        assert_eq!(b.metadata[0].text, "loud crust");
        // "loud crust" sits between the crust and loud axes
        assert!(b.index.vector(0).unwrap()[1] > 0.7);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_report_and_previous_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        // b has metadata from an earlier run but its index path is blocked
        std::fs::write(store.metadata_path("b"), "earlier run\n").unwrap();
        std::fs::create_dir(store.index_path("b")).unwrap();
        let embedder = embedder();
        let config = IndexConfig::default();
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);

        let err = builder.build(corpus(), None).await.unwrap_err();

        assert!(matches!(
            &err.source,
            PipelineError::IndexMetadataMismatch { entity_id, .. } if entity_id == "*"
        ));
        let report = err.report.unwrap();
        assert_eq!(report.indexes_built, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity_id, "b");
        assert_eq!(report.files.metadata_files, 2);
        assert_eq!(
            std::fs::read_to_string(store.metadata_path("b")).unwrap(),
            "earlier run\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let embedder = embedder();
        let config = IndexConfig {
            embed_batch_size: 0,
            ..IndexConfig::default()
        };
        let retry = RetryPolicy::none();
        let builder = IndexBuilder::new(&embedder, &store, &config, &retry, true);

        let err = builder.build(corpus(), None).await.unwrap_err();

        assert!(matches!(err.source, PipelineError::Configuration(_)));
        assert_eq!(embedder.calls(), 0);
    }
}
