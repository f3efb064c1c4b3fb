//! Per-entity vector indexes: embedding, exact similarity search and the
//! on-disk shard layout shared by the build and retrieval stages.

pub mod builder;
pub mod embeddings;
pub mod error;
pub mod flat_index;
pub mod progress;
pub mod retry;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use builder::{BuildError, BuildReport, IndexBuilder, IndexConfig, group_by_entity};
pub use embeddings::{Embedder, EmbeddingClient, EmbeddingConfig, embed_all};
pub use error::{PipelineError, ShardFailure};
pub use flat_index::{FlatIndex, Hit, IndexFormatError, Metric, normalize};
pub use progress::{ProgressEvent, ProgressReceiver, ProgressSender, emit, progress_channel};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{EntityIndex, FileCounts, IndexManifest, ShardFiles, ShardStore};
