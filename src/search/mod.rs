//! Cross-knowledge-base search orchestration.
//!
//! Fans a query out across any number of knowledge bases, merges the hits,
//! collapses duplicates across collections, and optionally re-scores the
//! shortlist with a cross-encoder. A broken knowledge base is skipped with a
//! warning; it never fails the aggregate query.

pub mod rerank;

pub use rerank::Reranker;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::embeddings::EmbeddingProvider;
use crate::stores::{SearchResult, StoreRegistry, dedup_by_node};
use crate::types::TreedexError;

/// One knowledge base to query: its id and storage location.
#[derive(Clone, Debug)]
pub struct KbTarget {
    pub kb_id: String,
    pub location: PathBuf,
}

impl KbTarget {
    pub fn new(kb_id: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            kb_id: kb_id.into(),
            location: location.into(),
        }
    }
}

/// Query-side composition root: owns the store handle cache, the embedding
/// provider, and the reranker service.
pub struct MultiKbSearcher {
    registry: StoreRegistry,
    reranker: Reranker,
}

impl MultiKbSearcher {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            registry: StoreRegistry::new(embedder),
            reranker: Reranker::new(),
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn reranker(&self) -> &Reranker {
        &self.reranker
    }

    /// Searches every target knowledge base and returns a merged, deduplicated
    /// ranking of at most `top_k` results.
    ///
    /// Per-KB recall is doubled when reranking so the cross-encoder sees a
    /// wider shortlist. Reranking is skipped when the deduplicated pool
    /// already fits in `top_k`; final order follows rerank scores when they
    /// were applied and raw similarity otherwise.
    pub async fn search_multi_kb(
        &self,
        targets: &[KbTarget],
        query: &str,
        top_k: usize,
        use_rerank: bool,
    ) -> Result<Vec<SearchResult>, TreedexError> {
        if top_k == 0 || targets.is_empty() {
            return Ok(Vec::new());
        }

        let recall = if use_rerank { top_k * 2 } else { top_k };
        let mut hits = Vec::new();
        for target in targets {
            match self.search_one(target, query, recall).await {
                Ok(mut kb_hits) => hits.append(&mut kb_hits),
                Err(err) => {
                    warn!(
                        kb_id = %target.kb_id,
                        error = %err,
                        "knowledge base query failed; skipping"
                    );
                }
            }
        }

        let mut merged = dedup_by_node(hits);
        if use_rerank && merged.len() > top_k {
            return Ok(self.reranker.rerank(query, merged, top_k).await);
        }
        merged.truncate(top_k);
        Ok(merged)
    }

    async fn search_one(
        &self,
        target: &KbTarget,
        query: &str,
        recall: usize,
    ) -> Result<Vec<SearchResult>, TreedexError> {
        let store = self
            .registry
            .store_for(&target.location, &target.kb_id)
            .await?;
        store.search(query, recall, None).await
    }
}
