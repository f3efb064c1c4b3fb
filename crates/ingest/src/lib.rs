pub mod chunk;
pub mod chunker;
pub mod cleaner;
pub mod reader;

pub use chunk::ReviewChunk;
pub use chunker::{ChunkConfigError, Chunker, ChunkerConfig};
pub use cleaner::{CleanStats, CleanerConfig, ReviewCleaner};
pub use reader::{FileReader, ReadError, ReviewRow};

use std::path::Path;

/// Outcome of turning a review file into a chunk corpus.
#[derive(Debug)]
pub struct IngestOutput {
    pub chunks: Vec<ReviewChunk>,
    pub clean_stats: CleanStats,
}

/// Main ingestion pipeline: read rows, clean them, chunk every review.
pub async fn ingest_path(
    path: &Path,
    cleaner: &ReviewCleaner,
    chunker: &Chunker,
) -> Result<IngestOutput, ReadError> {
    let rows: Vec<ReviewRow> = FileReader::read_path(path).await?;
    let (rows, clean_stats) = cleaner.clean(rows);
    let chunks = chunker.chunk_reviews(&rows);

    Ok(IngestOutput {
        chunks,
        clean_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ingest_path_cleans_then_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reviews.jsonl");
        let long_text = "The brisket was smoky and tender. ".repeat(10);
        let rows = vec![
            ReviewRow {
                entity_id: "biz-1".to_string(),
                entity_name: "Smoke House".to_string(),
                review_id: "r1".to_string(),
                star_rating: 5.0,
                date: "2023-03-03".to_string(),
                text: long_text.clone(),
            },
            ReviewRow {
                entity_id: "biz-1".to_string(),
                entity_name: "Smoke House".to_string(),
                review_id: "r2".to_string(),
                star_rating: 1.0,
                date: "2023-03-04".to_string(),
                text: "bad".to_string(),
            },
        ];
        FileReader::write_jsonl(&path, &rows).await.unwrap();

        let cleaner = ReviewCleaner::new(CleanerConfig { min_review_chars: 10 });
        let chunker = Chunker::new(ChunkerConfig {
            chunk_max_chars: 120,
            overlap_chars: 20,
            min_chunk_chars: 10,
        })
        .unwrap();

        let output = ingest_path(&path, &cleaner, &chunker).await.unwrap();

        assert_eq!(output.clean_stats.dropped_short, 1);
        assert!(output.chunks.len() > 1);
        assert!(output.chunks.iter().all(|c| c.review_id == "r1"));
        assert!(output.chunks.iter().all(|c| c.char_count <= 120));
    }
}
