//! Per-knowledge-base vector collections and the process-wide handle registry.
//!
//! Each knowledge base owns one isolated collection; [`sqlite::NodeVectorStore`]
//! is the SQLite + sqlite-vec implementation. [`StoreRegistry`] caches open
//! handles per kb_id for the life of the process; the cache is never
//! invalidated implicitly, so callers that relocate storage must call
//! [`StoreRegistry::clear`].

pub mod sqlite;

pub use sqlite::{KbStats, NodeVectorStore, OVER_FETCH_FACTOR};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingProvider;
use crate::types::TreedexError;
use crate::vectorize::VectorKind;

/// Restricts a search to one document or a set of documents.
#[derive(Clone, Debug)]
pub enum DocFilter {
    One(String),
    Many(Vec<String>),
}

impl DocFilter {
    pub fn matches(&self, doc_name: &str) -> bool {
        match self {
            DocFilter::One(name) => name == doc_name,
            DocFilter::Many(names) => names.iter().any(|name| name == doc_name),
        }
    }
}

/// One ranked hit from a vector search.
///
/// After deduplication no two results in a response share
/// `(doc_name, node_id)`; the surviving entry carries the best score.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub kb_id: String,
    pub doc_name: String,
    pub node_id: String,
    pub title: String,
    pub path: String,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub end_index: Option<u64>,
    #[serde(default)]
    pub summary: String,
    /// Monotone transform of vector distance into (0, 1].
    pub score: f32,
    pub vector_type: VectorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Collapses raw hits to one entry per (doc_name, node_id), keeping the best
/// score, and sorts the survivors by descending score. Ties are unordered.
pub(crate) fn dedup_by_node(hits: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut best: HashMap<(String, String), SearchResult> = HashMap::new();
    for hit in hits {
        match best.entry((hit.doc_name.clone(), hit.node_id.clone())) {
            Entry::Occupied(mut entry) => {
                if hit.score > entry.get().score {
                    entry.insert(hit);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(hit);
            }
        }
    }
    let mut results: Vec<SearchResult> = best.into_values().collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results
}

/// Process-lifetime cache of open store handles, keyed by kb_id.
///
/// Explicitly constructed and injected rather than hidden behind a global;
/// [`clear`](Self::clear) exists for test isolation and for callers that move
/// a knowledge base to a new location.
pub struct StoreRegistry {
    embedder: Arc<dyn EmbeddingProvider>,
    stores: Mutex<HashMap<String, Arc<NodeVectorStore>>>,
}

impl StoreRegistry {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    /// Returns the cached handle for `kb_id`, opening the collection at
    /// `location` on first use.
    pub async fn store_for(
        &self,
        location: &Path,
        kb_id: &str,
    ) -> Result<Arc<NodeVectorStore>, TreedexError> {
        if let Some(store) = self.stores.lock().get(kb_id) {
            return Ok(store.clone());
        }
        let store =
            Arc::new(NodeVectorStore::open(location, kb_id, self.embedder.clone()).await?);
        self.stores
            .lock()
            .insert(kb_id.to_string(), store.clone());
        Ok(store)
    }

    /// Drops every cached handle. Subsequent calls re-open collections.
    pub fn clear(&self) {
        self.stores.lock().clear();
    }
}
