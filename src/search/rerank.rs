//! Cross-encoder re-scoring of candidate shortlists.
//!
//! The model is loaded lazily on first use and cached for the life of the
//! service; loading is serialized so concurrent first calls cannot trigger
//! duplicate loads. When the `rerank` feature is disabled or the model fails
//! to load, reranking degrades to truncating the similarity order, never to
//! an error.

use crate::stores::SearchResult;

#[cfg(feature = "rerank")]
use std::sync::Arc;
#[cfg(feature = "rerank")]
use tokio::sync::Mutex;
#[cfg(feature = "rerank")]
use tracing::warn;

const DEFAULT_MODEL: &str = "bge-reranker-base";

#[cfg(feature = "rerank")]
enum LoadState {
    Unloaded,
    Ready(Arc<fastembed::TextRerank>),
    Failed,
}

/// Lazily-loaded cross-encoder reranker service.
pub struct Reranker {
    model_name: String,
    #[cfg(feature = "rerank")]
    state: Mutex<LoadState>,
}

impl Reranker {
    pub fn new() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_string(),
            #[cfg(feature = "rerank")]
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    /// Selects the model artifact to load by name. Unknown names leave the
    /// service permanently degraded after the first load attempt.
    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Forgets any loaded (or failed) model so the next call reloads. Exists
    /// for test isolation.
    pub async fn reset(&self) {
        #[cfg(feature = "rerank")]
        {
            *self.state.lock().await = LoadState::Unloaded;
        }
    }

    /// Re-scores `candidates` against `query` and returns the best `top_k`
    /// in descending rerank-score order.
    ///
    /// Every candidate is scored as a `(query, "{title}: {summary}")` pair in
    /// one batched model call. If no model is available the input order is
    /// truncated unchanged.
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<SearchResult>,
        top_k: usize,
    ) -> Vec<SearchResult> {
        #[cfg(feature = "rerank")]
        if let Some(model) = self.model().await {
            match score_candidates(model, query, &candidates).await {
                Ok(scores) => {
                    for (candidate, score) in candidates.iter_mut().zip(&scores) {
                        candidate.rerank_score = Some(*score);
                    }
                    candidates.sort_by(|a, b| {
                        b.rerank_score
                            .unwrap_or(f32::MIN)
                            .total_cmp(&a.rerank_score.unwrap_or(f32::MIN))
                    });
                    candidates.truncate(top_k);
                    return candidates;
                }
                Err(err) => {
                    warn!(error = %err, "rerank scoring failed; keeping similarity order");
                }
            }
        }

        #[cfg(not(feature = "rerank"))]
        let _ = query;

        candidates.truncate(top_k);
        candidates
    }

    #[cfg(feature = "rerank")]
    async fn model(&self) -> Option<Arc<fastembed::TextRerank>> {
        let mut state = self.state.lock().await;
        match &*state {
            LoadState::Ready(model) => Some(model.clone()),
            LoadState::Failed => None,
            LoadState::Unloaded => {
                let name = self.model_name.clone();
                let loaded = tokio::task::spawn_blocking(move || load_model(&name)).await;
                match loaded {
                    Ok(Ok(model)) => {
                        let model = Arc::new(model);
                        *state = LoadState::Ready(model.clone());
                        Some(model)
                    }
                    Ok(Err(err)) => {
                        warn!(
                            model = %self.model_name,
                            error = %err,
                            "cross-encoder load failed; reranking disabled"
                        );
                        *state = LoadState::Failed;
                        None
                    }
                    Err(err) => {
                        warn!(error = %err, "cross-encoder load task failed; reranking disabled");
                        *state = LoadState::Failed;
                        None
                    }
                }
            }
        }
    }
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rerank")]
fn load_model(name: &str) -> Result<fastembed::TextRerank, String> {
    use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

    let model = match name {
        "bge-reranker-base" => RerankerModel::BGERerankerBase,
        other => return Err(format!("unknown reranker model '{other}'")),
    };
    TextRerank::try_new(RerankInitOptions::new(model).with_show_download_progress(false))
        .map_err(|err| err.to_string())
}

#[cfg(feature = "rerank")]
async fn score_candidates(
    model: Arc<fastembed::TextRerank>,
    query: &str,
    candidates: &[SearchResult],
) -> Result<Vec<f32>, String> {
    let query = query.to_string();
    let documents: Vec<String> = candidates
        .iter()
        .map(|candidate| format!("{}: {}", candidate.title, candidate.summary))
        .collect();
    let expected = candidates.len();

    let ranked = tokio::task::spawn_blocking(move || {
        model
            .rerank(query, documents, false, None)
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| err.to_string())??;

    let mut scores = vec![f32::MIN; expected];
    for item in ranked {
        if let Some(slot) = scores.get_mut(item.index) {
            *slot = item.score;
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectorize::VectorKind;

    fn candidate(node: &str, score: f32) -> SearchResult {
        SearchResult {
            id: format!("doc_{node}_main"),
            kb_id: "kb".into(),
            doc_name: "doc".into(),
            node_id: node.into(),
            title: "Title".into(),
            path: "Title".into(),
            start_index: None,
            end_index: None,
            summary: "Summary.".into(),
            score,
            vector_type: VectorKind::Main,
            rerank_score: None,
        }
    }

    // Without the `rerank` feature (or without a model on disk) the service
    // must degrade to truncation of the incoming order.
    #[tokio::test]
    async fn degraded_rerank_truncates_input_order() {
        let reranker = Reranker::new().with_model_name("no-such-model");
        let candidates = vec![
            candidate("0001", 0.9),
            candidate("0002", 0.8),
            candidate("0003", 0.7),
        ];

        let results = reranker.rerank("query", candidates, 2).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node_id, "0001");
        assert_eq!(results[1].node_id, "0002");
    }

    #[tokio::test]
    async fn reset_clears_cached_state() {
        let reranker = Reranker::new().with_model_name("no-such-model");
        let _ = reranker.rerank("q", vec![candidate("0001", 0.5)], 1).await;
        reranker.reset().await;
        let results = reranker.rerank("q", vec![candidate("0002", 0.5)], 1).await;
        assert_eq!(results[0].node_id, "0002");
    }
}
