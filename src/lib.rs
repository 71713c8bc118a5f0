//! ```text
//! Outline tree ──► outline::assign_node_ids / spans_from_page_markers
//!                                 │
//!                                 ▼
//!                  vectorize::vectorize_tree ──► EmbeddableUnits
//!                                 │
//!                                 ▼
//!        embeddings::EmbeddingProvider ──► stores::NodeVectorStore  (write path)
//!
//! Query ──► search::MultiKbSearcher ──► per-KB NodeVectorStore::search
//!                     │                    (embed, over-fetch, dedup)
//!                     ├──► merge + cross-KB dedup
//!                     └──► search::Reranker (optional) ──► ranked results
//! ```
//!
pub mod embeddings;
pub mod outline;
pub mod search;
pub mod stores;
pub mod types;
pub mod vectorize;

pub use embeddings::{EmbeddingConfig, EmbeddingProvider, HttpEmbeddingClient, MockEmbeddingProvider};
pub use outline::{FlatOutlineItem, StructureNode};
pub use search::{KbTarget, MultiKbSearcher, Reranker};
pub use stores::{DocFilter, KbStats, NodeVectorStore, SearchResult, StoreRegistry};
pub use types::TreedexError;
pub use vectorize::{DocumentDescriptor, EmbeddableUnit, UnitMetadata, VectorKind};
