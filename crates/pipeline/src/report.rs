use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use index::{BuildReport, ShardFailure};
use ingest::CleanStats;
use query::RetrievalOutput;

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub reviews_read: usize,
    pub cleaning: CleanStats,
    pub chunks_built: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub entities_processed: usize,
    pub results: usize,
    pub empty_pairs: usize,
    pub failures: Vec<ShardFailure>,
}

impl From<&RetrievalOutput> for RetrievalSummary {
    fn from(output: &RetrievalOutput) -> Self {
        Self {
            entities_processed: output.entities,
            results: output.results.len(),
            empty_pairs: output.empty_pairs.len(),
            failures: output.failures.clone(),
        }
    }
}

/// What one invocation did, stage by stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<BuildReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summaries_written: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_removed: Option<usize>,
    pub stages: Vec<StageTiming>,
}

impl RunReport {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    pub fn record_stage(&mut self, stage: &'static str, timer: &TimedOperation) {
        let duration_ms = timer.elapsed().as_millis() as u64;
        tracing::info!(stage, duration_ms, "stage finished");
        self.stages.push(StageTiming { stage, duration_ms });
    }

    /// Every per-entity failure across stages.
    pub fn failures(&self) -> impl Iterator<Item = &ShardFailure> {
        let build = self.index.iter().flat_map(|r| r.failures.iter());
        let retrieval = self.retrieval.iter().flat_map(|r| r.failures.iter());
        build.chain(retrieval)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            command = %self.command,
            chunks_built = self.chunking.as_ref().map(|c| c.chunks_built),
            indexes_built = self.index.as_ref().map(|r| r.indexes_built),
            entities_processed = self.retrieval.as_ref().map(|r| r.entities_processed),
            empty_pairs = self.retrieval.as_ref().map(|r| r.empty_pairs),
            summaries_written = self.summaries_written,
            failures = self.failures().count(),
            "run complete"
        );
        for failure in self.failures() {
            tracing::warn!(
                entity_id = %failure.entity_id,
                kind = %failure.kind,
                "{}",
                failure.message
            );
        }
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write run report {}", path.display()))
    }
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
