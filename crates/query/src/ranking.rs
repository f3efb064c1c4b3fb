//! Turning raw top-K hits into a per-topic evidence set.

use std::collections::HashMap;

use index::{Hit, PipelineError};
use ingest::ReviewChunk;

/// A hit joined to the chunk it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedChunk<'a> {
    pub chunk: &'a ReviewChunk,
    pub score: f32,
}

/// Join hits to metadata, order best first, keep at most `max_per_review`
/// chunks of any one review, then keep the first `max_per_topic`.
///
/// Equal scores keep retrieval order. A hit whose position has no metadata
/// row means the shard is misaligned.
pub fn rank_hits<'a>(
    entity_id: &str,
    hits: &[Hit],
    metadata: &'a [ReviewChunk],
    max_per_review: usize,
    max_per_topic: usize,
) -> Result<Vec<RankedChunk<'a>>, PipelineError> {
    let mut joined = hits
        .iter()
        .map(|hit| {
            metadata
                .get(hit.position)
                .map(|chunk| RankedChunk {
                    chunk,
                    score: hit.score,
                })
                .ok_or_else(|| {
                    PipelineError::mismatch(
                        entity_id,
                        format!(
                            "hit at position {} but only {} metadata rows",
                            hit.position,
                            metadata.len()
                        ),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    joined.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut per_review: HashMap<&str, usize> = HashMap::new();
    let mut ranked = Vec::with_capacity(max_per_topic.min(joined.len()));
    for candidate in joined {
        if ranked.len() == max_per_topic {
            break;
        }
        let seen = per_review
            .entry(candidate.chunk.review_id.as_str())
            .or_insert(0);
        if *seen < max_per_review {
            *seen += 1;
            ranked.push(candidate);
        }
    }

    Ok(ranked)
}
