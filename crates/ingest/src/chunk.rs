use serde::{Deserialize, Serialize};

use crate::reader::ReviewRow;

/// One bounded span of a review, carrying the review's identity and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewChunk {
    pub chunk_id: String,
    pub review_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub text: String,
    pub char_count: usize,
    pub star_rating: f32,
    pub date: String,
    pub chunk_index: usize,
}

impl ReviewChunk {
    pub fn new(row: &ReviewRow, chunk_index: usize, text: String) -> Self {
        let chunk_id = Self::generate_chunk_id(&row.review_id, chunk_index);
        let char_count = text.chars().count();

        Self {
            chunk_id,
            review_id: row.review_id.clone(),
            entity_id: row.entity_id.clone(),
            entity_name: row.entity_name.clone(),
            text,
            char_count,
            star_rating: row.star_rating,
            date: row.date.clone(),
            chunk_index,
        }
    }

    /// `<review_id>_<chunk_index>`; unique as long as review ids are.
    pub fn generate_chunk_id(review_id: &str, chunk_index: usize) -> String {
        format!("{review_id}_{chunk_index}")
    }
}
