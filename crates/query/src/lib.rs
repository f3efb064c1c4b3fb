//! Topic encoding, per-entity retrieval and LLM summaries over the indexes
//! built by the `index` crate.

pub mod ranking;
pub mod retriever;
pub mod summarizer;
pub mod topics;

pub use ranking::{RankedChunk, rank_hits};
pub use retriever::{
    EmptyPair, RetrievalConfig, RetrievalDiagnostics, RetrievalOutput, RetrievalResult, Retriever,
};
pub use summarizer::{EntitySummary, ReviewSummarizer, SummarizerConfig, build_prompt};
pub use topics::{Topic, TopicEncoder, TopicQuery, default_topics};
