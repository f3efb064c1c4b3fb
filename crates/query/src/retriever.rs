use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use index::{
    EntityIndex, IndexManifest, PipelineError, ProgressEvent, ProgressSender, ShardFailure,
    ShardStore, emit,
};

use crate::ranking::rank_hits;
use crate::topics::TopicQuery;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k_per_topic: usize,
    pub max_chunks_per_topic: usize,
    pub max_chunks_per_review: usize,
    /// Entities searched at the same time.
    pub concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_per_topic: 25,
            max_chunks_per_topic: 12,
            max_chunks_per_review: 1,
            concurrency: 4,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fields = [
            ("top_k_per_topic", self.top_k_per_topic),
            ("max_chunks_per_topic", self.max_chunks_per_topic),
            ("max_chunks_per_review", self.max_chunks_per_review),
            ("retrieval concurrency", self.concurrency),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(PipelineError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// One chunk selected as evidence for a topic. `rank` is 1-based within its
/// (entity, topic) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub topic: String,
    pub entity_id: String,
    pub entity_name: String,
    pub chunk_id: String,
    pub review_id: String,
    pub score: f32,
    pub star_rating: f32,
    pub text: String,
    pub rank: usize,
}

/// An (entity, topic) pair that produced no chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPair {
    pub entity_id: String,
    pub topic: String,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    pub entities: usize,
    pub results: Vec<RetrievalResult>,
    pub empty_pairs: Vec<EmptyPair>,
    pub failures: Vec<ShardFailure>,
}

/// Summary written next to the result table.
#[derive(Debug, Serialize)]
pub struct RetrievalDiagnostics<'a> {
    pub entities_searched: usize,
    pub results: usize,
    pub empty_pair_count: usize,
    pub empty_pairs: &'a [EmptyPair],
    pub failures: &'a [ShardFailure],
}

impl RetrievalOutput {
    pub fn diagnostics(&self) -> RetrievalDiagnostics<'_> {
        RetrievalDiagnostics {
            entities_searched: self.entities,
            results: self.results.len(),
            empty_pair_count: self.empty_pairs.len(),
            empty_pairs: &self.empty_pairs,
            failures: &self.failures,
        }
    }
}

type EntityOutcome = (Vec<RetrievalResult>, Vec<EmptyPair>);

pub struct Retriever<'a> {
    store: &'a ShardStore,
    config: &'a RetrievalConfig,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a ShardStore, config: &'a RetrievalConfig) -> Self {
        Self { store, config }
    }

    /// Refuse to search indexes built with different embedding settings.
    /// A directory without a manifest is searched with a warning.
    pub async fn check_manifest(&self, expected: &IndexManifest) -> Result<(), PipelineError> {
        match self.store.read_manifest().await? {
            Some(found) if found != *expected => Err(PipelineError::Configuration(format!(
                "indexes in {} were built with {} ({}d, {}, normalized={}) but queries use {} ({}d, {}, normalized={})",
                self.store.dir().display(),
                found.model,
                found.dimension,
                found.metric,
                found.normalized,
                expected.model,
                expected.dimension,
                expected.metric,
                expected.normalized,
            ))),
            Some(_) => Ok(()),
            None => {
                tracing::warn!(
                    dir = %self.store.dir().display(),
                    "index directory has no manifest, embedding settings not checked"
                );
                Ok(())
            }
        }
    }

    /// Search every persisted entity for every topic.
    ///
    /// Results come out ordered by entity id, then topic order. An entity that
    /// fails to load or search is recorded and skipped.
    pub async fn retrieve(
        &self,
        topics: &[TopicQuery],
        expected: &IndexManifest,
        progress: Option<&ProgressSender>,
    ) -> Result<RetrievalOutput, PipelineError> {
        self.config.validate()?;
        if topics.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        self.check_manifest(expected).await?;

        let shards = self.store.discover().await?;
        let total = shards.len();
        tracing::info!(
            entities = total,
            topics = topics.len(),
            top_k = self.config.top_k_per_topic,
            "retrieving topic chunks"
        );

        let mut output = RetrievalOutput {
            entities: total,
            ..RetrievalOutput::default()
        };

        let mut searches = stream::iter(shards)
            .map(|files| async move {
                let outcome = match self.store.load_shard(&files).await {
                    Ok(entity) => self.search_entity(&entity, topics),
                    Err(err) => Err(err),
                };
                (files.entity_id, outcome)
            })
            .buffered(self.config.concurrency);

        let mut done = 0;
        while let Some((entity_id, outcome)) = searches.next().await {
            done += 1;
            let message = match outcome {
                Ok((results, empty)) => {
                    let message = format!("{}: {} chunks", entity_id, results.len());
                    output.results.extend(results);
                    output.empty_pairs.extend(empty);
                    message
                }
                Err(err) => {
                    tracing::error!(entity_id = %entity_id, error = %err, "skipping entity");
                    let message = format!("{entity_id}: failed: {err}");
                    output.failures.push(ShardFailure::new(&entity_id, &err));
                    message
                }
            };
            emit(
                progress,
                ProgressEvent {
                    stage: "retrieve",
                    entity_index: done,
                    total,
                    message,
                },
            );
        }

        tracing::info!(
            results = output.results.len(),
            empty_pairs = output.empty_pairs.len(),
            failures = output.failures.len(),
            "retrieval finished"
        );
        Ok(output)
    }

    fn search_entity(
        &self,
        entity: &EntityIndex,
        topics: &[TopicQuery],
    ) -> Result<EntityOutcome, PipelineError> {
        let entity_id = entity.entity_id.as_str();
        let mut results = Vec::new();
        let mut empty = Vec::new();

        for topic in topics {
            if topic.query_vector.len() != entity.index.dimension() {
                return Err(PipelineError::mismatch(
                    entity_id,
                    format!(
                        "index dimension {} does not match query dimension {}",
                        entity.index.dimension(),
                        topic.query_vector.len()
                    ),
                ));
            }

            let hits = entity
                .index
                .search(&topic.query_vector, self.config.top_k_per_topic)
                .map_err(|e| PipelineError::mismatch(entity_id, e))?;
            let ranked = rank_hits(
                entity_id,
                &hits,
                &entity.metadata,
                self.config.max_chunks_per_review,
                self.config.max_chunks_per_topic,
            )?;

            if ranked.is_empty() {
                tracing::debug!(entity_id, topic = %topic.topic_name, "no chunks for topic");
                empty.push(EmptyPair {
                    entity_id: entity_id.to_string(),
                    topic: topic.topic_name.clone(),
                });
                continue;
            }

            results.extend(ranked.into_iter().enumerate().map(|(i, r)| RetrievalResult {
                topic: topic.topic_name.clone(),
                entity_id: entity_id.to_string(),
                entity_name: r.chunk.entity_name.clone(),
                chunk_id: r.chunk.chunk_id.clone(),
                review_id: r.chunk.review_id.clone(),
                score: r.score,
                star_rating: r.chunk.star_rating,
                text: r.chunk.text.clone(),
                rank: i + 1,
            }));
        }

        Ok((results, empty))
    }
}
