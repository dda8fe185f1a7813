//! TaskPilot memory crate - the Memory Gateway.
//!
//! Combines the durable SQLite store, a TTL working-context cache and an
//! owner-scoped cosine index for semantic recall behind one interface.

pub mod embedding;
pub mod gateway;
pub mod index;
pub mod working;

pub use embedding::{DynEmbeddingService, EmbeddingService, HashingEmbedding};
pub use gateway::MemoryGateway;
pub use index::{cosine_similarity, SearchHit, VectorIndex};
pub use working::{InMemoryWorkingStore, WorkingStore};
