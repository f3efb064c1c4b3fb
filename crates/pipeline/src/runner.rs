use std::path::PathBuf;

use anyhow::Context;

use index::{BuildError, Embedder, IndexBuilder, ProgressSender, RetryPolicy, ShardStore};
use ingest::{Chunker, FileReader, IngestOutput, ReviewChunk, ReviewCleaner, ingest_path};
use query::{RetrievalOutput, RetrievalResult, Retriever, ReviewSummarizer, TopicEncoder};

use crate::config::AppConfig;
use crate::report::{ChunkSummary, RetrievalSummary, RunReport, TimedOperation};

pub const RESULTS_FILE: &str = "topic_relevant_review_chunks.jsonl";
pub const DIAGNOSTICS_FILE: &str = "retrieval_diagnostics.json";
pub const SUMMARIES_FILE: &str = "summaries.jsonl";
pub const REPORT_FILE: &str = "run_report.json";

/// Runs pipeline stages against one validated configuration.
pub struct Pipeline<'a, E> {
    config: &'a AppConfig,
    embedder: &'a E,
    retry: RetryPolicy,
    progress: Option<ProgressSender>,
}

impl<'a, E: Embedder> Pipeline<'a, E> {
    pub fn new(config: &'a AppConfig, embedder: &'a E, progress: Option<ProgressSender>) -> Self {
        Self {
            config,
            embedder,
            retry: RetryPolicy::from(&config.retry),
            progress,
        }
    }

    fn store(&self) -> ShardStore {
        ShardStore::new(&self.config.paths.index_dir)
    }

    fn output_path(&self, file: &str) -> PathBuf {
        self.config.paths.output_dir.join(file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_path(REPORT_FILE)
    }

    /// Read, clean and chunk reviews, then write the chunk corpus.
    pub async fn chunk(&self, report: &mut RunReport) -> anyhow::Result<Vec<ReviewChunk>> {
        let timer = TimedOperation::start();
        let reviews = &self.config.paths.reviews;

        let chunker = Chunker::new(self.config.chunking)?;
        let cleaner = ReviewCleaner::new(self.config.cleaning.clone());

        let IngestOutput {
            chunks,
            clean_stats,
        } = ingest_path(reviews, &cleaner, &chunker)
            .await
            .with_context(|| format!("failed to read reviews from {}", reviews.display()))?;

        FileReader::write_jsonl(&self.config.paths.chunks, &chunks)
            .await
            .context("failed to write chunk corpus")?;

        tracing::info!(
            reviews_read = clean_stats.input,
            chunks = chunks.len(),
            path = %self.config.paths.chunks.display(),
            "chunk corpus written"
        );

        report.chunking = Some(ChunkSummary {
            reviews_read: clean_stats.input,
            cleaning: clean_stats,
            chunks_built: chunks.len(),
        });
        report.record_stage("chunk", &timer);
        Ok(chunks)
    }

    /// Embed and persist one index per entity. Reads the chunk corpus from
    /// disk when `chunks` is not given.
    pub async fn build(
        &self,
        chunks: Option<Vec<ReviewChunk>>,
        report: &mut RunReport,
    ) -> anyhow::Result<()> {
        let timer = TimedOperation::start();
        let chunks = match chunks {
            Some(chunks) => chunks,
            None => FileReader::read_jsonl(&self.config.paths.chunks)
                .await
                .context("failed to read chunk corpus; run the chunk stage first")?,
        };

        let store = self.store();
        let builder = IndexBuilder::new(
            self.embedder,
            &store,
            &self.config.index,
            &self.retry,
            self.config.embedding.normalize,
        );
        let result = builder.build(chunks, self.progress.as_ref()).await;
        report.record_stage("build", &timer);

        match result {
            Ok(built) => {
                report.index = Some(built);
                Ok(())
            }
            Err(BuildError {
                report: partial,
                source,
            }) => {
                report.index = partial;
                Err(source.into())
            }
        }
    }

    /// Search every entity index for every topic and write the result table
    /// and its diagnostics.
    pub async fn retrieve(&self, report: &mut RunReport) -> anyhow::Result<RetrievalOutput> {
        let timer = TimedOperation::start();

        let encoder = TopicEncoder::new(
            self.embedder,
            self.config.index.metric,
            self.config.embedding.normalize,
            &self.retry,
        );
        let queries = encoder.encode(&self.config.topics).await?;

        let store = self.store();
        let retriever = Retriever::new(&store, &self.config.retrieval);
        let output = retriever
            .retrieve(&queries, &encoder.expected_manifest(), self.progress.as_ref())
            .await?;

        FileReader::write_jsonl(&self.output_path(RESULTS_FILE), &output.results)
            .await
            .context("failed to write retrieval results")?;
        let diagnostics = serde_json::to_vec_pretty(&output.diagnostics())?;
        let diagnostics_path = self.output_path(DIAGNOSTICS_FILE);
        tokio::fs::write(&diagnostics_path, diagnostics)
            .await
            .with_context(|| format!("failed to write {}", diagnostics_path.display()))?;

        for pair in &output.empty_pairs {
            tracing::warn!(entity_id = %pair.entity_id, topic = %pair.topic, "no chunks retrieved");
        }

        report.retrieval = Some(RetrievalSummary::from(&output));
        report.record_stage("retrieve", &timer);
        Ok(output)
    }

    /// Summarize the result table with the LLM. Reads the table from disk
    /// when `results` is not given.
    pub async fn summarize(
        &self,
        results: Option<Vec<RetrievalResult>>,
        report: &mut RunReport,
    ) -> anyhow::Result<()> {
        let timer = TimedOperation::start();
        let results = match results {
            Some(results) => results,
            None => FileReader::read_jsonl(&self.output_path(RESULTS_FILE))
                .await
                .context("failed to read retrieval results; run the retrieve stage first")?,
        };

        let summarizer = ReviewSummarizer::new(&self.config.summarizer, self.retry.clone())?;
        let summaries = summarizer
            .summarize(&results, &self.config.topics, self.progress.as_ref())
            .await?;

        FileReader::write_jsonl(&self.output_path(SUMMARIES_FILE), &summaries)
            .await
            .context("failed to write summaries")?;

        report.summaries_written = Some(summaries.len());
        report.record_stage("summarize", &timer);
        Ok(())
    }

    /// Chunk, build, retrieve and summarize in one pass.
    pub async fn run(&self, report: &mut RunReport) -> anyhow::Result<()> {
        let chunks = self.chunk(report).await?;
        self.build(Some(chunks), report).await?;
        let output = self.retrieve(report).await?;
        self.summarize(Some(output.results), report).await
    }

    /// Remove every index, metadata and manifest file from the index directory.
    pub async fn clean(&self, report: &mut RunReport) -> anyhow::Result<()> {
        let timer = TimedOperation::start();
        let removed = self.store().clear().await?;
        report.files_removed = Some(removed);
        report.record_stage("clean", &timer);
        Ok(())
    }
}
