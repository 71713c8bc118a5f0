//! SQLite-backed vector collection for one knowledge base, using the
//! sqlite-vec extension for nearest-neighbor queries.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;

use serde::Serialize;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use tracing::{debug, warn};

use super::{DocFilter, SearchResult, dedup_by_node};
use crate::embeddings::EmbeddingProvider;
use crate::outline::StructureNode;
use crate::types::TreedexError;
use crate::vectorize::{self, DocumentDescriptor, VectorKind};

/// Raw neighbors requested per distinct result wanted.
///
/// A node can contribute one vector per summary, key point, and title
/// fallback, so `top_k` raw hits can collapse to far fewer distinct nodes
/// after per-node dedup. 3x is a client-side workaround for a store without
/// server-side grouping; tune it if node fan-out grows.
pub const OVER_FETCH_FACTOR: usize = 3;

/// Read-only collection statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KbStats {
    pub kb_id: String,
    pub unit_count: usize,
    pub document_count: usize,
}

/// One isolated vector collection for a knowledge base.
///
/// The collection lives in its own SQLite file, named deterministically from
/// the kb_id so repeated opens always resolve to the same storage. Writes for
/// a given (kb_id, doc_name) must be serialized by the caller; there is no
/// internal lock.
pub struct NodeVectorStore {
    kb_id: String,
    path: PathBuf,
    conn: Connection,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl std::fmt::Debug for NodeVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeVectorStore")
            .field("kb_id", &self.kb_id)
            .field("path", &self.path)
            .field("conn", &self.conn)
            .field("embedder", &"<dyn EmbeddingProvider>")
            .finish()
    }
}

/// Deterministic collection file name for a knowledge base.
pub fn collection_file_name(kb_id: &str) -> String {
    format!("kb_{kb_id}_nodes.sqlite")
}

fn validate_kb_id(kb_id: &str) -> Result<(), TreedexError> {
    let valid = !kb_id.is_empty()
        && kb_id.len() <= 128
        && kb_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TreedexError::Storage(format!(
            "invalid kb_id '{kb_id}': expected 1-128 chars of [A-Za-z0-9_-]"
        )))
    }
}

fn storage_err(err: impl std::fmt::Display) -> TreedexError {
    TreedexError::Storage(err.to_string())
}

fn register_sqlite_vec() -> Result<(), TreedexError> {
    use std::sync::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!(
                    "failed to register sqlite-vec extension (code {rc})"
                ))
            } else {
                Ok(())
            }
        };
        *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
    });

    INIT_RESULT
        .lock()
        .expect("init result mutex poisoned")
        .clone()
        .expect("init was called but result not set")
        .map_err(TreedexError::Storage)
}

/// Row shape moved into the write transaction.
struct InsertRow {
    id: String,
    doc_name: String,
    node_id: String,
    title: String,
    path: String,
    start_index: Option<i64>,
    end_index: Option<i64>,
    summary: String,
    vector_type: &'static str,
    metadata: String,
    content: String,
    embedding: String,
}

impl NodeVectorStore {
    /// Opens (or creates) the collection for `kb_id` under `location`.
    pub async fn open(
        location: impl AsRef<Path>,
        kb_id: &str,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, TreedexError> {
        validate_kb_id(kb_id)?;
        register_sqlite_vec()?;

        let location = location.as_ref();
        tokio::fs::create_dir_all(location).await?;
        let path = location.join(collection_file_name(kb_id));

        let conn = Connection::open(path.clone()).await.map_err(storage_err)?;
        conn.call(|conn| -> tokio_rusqlite::Result<()> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS nodes (
                    id TEXT PRIMARY KEY,
                    doc_name TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    path TEXT NOT NULL,
                    start_index INTEGER,
                    end_index INTEGER,
                    summary TEXT NOT NULL,
                    vector_type TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    content TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_nodes_doc_name ON nodes(doc_name)",
                [],
            )?;
            Ok(())
        })
        .await
        .map_err(storage_err)?;

        Ok(Self {
            kb_id: kb_id.to_string(),
            path,
            conn,
            embedder,
        })
    }

    pub fn kb_id(&self) -> &str {
        &self.kb_id
    }

    /// Path of the collection file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Indexes a document tree, replacing any previous index of the same
    /// document. Returns the number of stored units; a tree that yields no
    /// embeddable units writes nothing and returns 0.
    pub async fn add_document(
        &self,
        doc_name: &str,
        doc_description: &str,
        tree: &[StructureNode],
    ) -> Result<usize, TreedexError> {
        self.delete_document(doc_name).await;

        let descriptor = DocumentDescriptor::new(doc_name, &self.kb_id)
            .with_description(doc_description);
        let units = vectorize::vectorize_tree(tree, &descriptor)?;
        if units.is_empty() {
            debug!(kb_id = %self.kb_id, doc_name, "document produced no embeddable units");
            return Ok(0);
        }

        let texts: Vec<String> = units.iter().map(|unit| unit.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != units.len() {
            return Err(TreedexError::Embedding(format!(
                "embedding batch returned {} vectors for {} texts",
                vectors.len(),
                units.len()
            )));
        }
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 {
            return Err(TreedexError::Embedding(
                "embedding endpoint returned empty vectors".to_string(),
            ));
        }

        let mut rows = Vec::with_capacity(units.len());
        for (unit, vector) in units.iter().zip(&vectors) {
            rows.push(InsertRow {
                id: unit.id.clone(),
                doc_name: unit.metadata.doc_name.clone(),
                node_id: unit.metadata.node_id.clone(),
                title: unit.metadata.title.clone(),
                path: unit.metadata.path.clone(),
                start_index: unit.metadata.start_index.map(|v| v as i64),
                end_index: unit.metadata.end_index.map(|v| v as i64),
                summary: unit.metadata.summary.clone(),
                vector_type: unit.metadata.vector_type.as_str(),
                metadata: serde_json::to_string(&unit.metadata)
                    .map_err(|err| TreedexError::Storage(err.to_string()))?,
                content: unit.text.clone(),
                embedding: serde_json::to_string(vector)
                    .map_err(|err| TreedexError::Storage(err.to_string()))?,
            });
        }

        let count = rows.len();
        self.conn
            .call(move |conn| -> tokio_rusqlite::Result<()> {
                conn.execute(
                    &format!(
                        "CREATE VIRTUAL TABLE IF NOT EXISTS nodes_vec \
                         USING vec0(embedding float[{dim}])"
                    ),
                    [],
                )?;
                let tx = conn.transaction()?;
                for row in &rows {
                    tx.execute(
                        "INSERT INTO nodes (id, doc_name, node_id, title, path, start_index, \
                         end_index, summary, vector_type, metadata, content) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        (
                            &row.id,
                            &row.doc_name,
                            &row.node_id,
                            &row.title,
                            &row.path,
                            row.start_index,
                            row.end_index,
                            &row.summary,
                            row.vector_type,
                            &row.metadata,
                            &row.content,
                        ),
                    )?;
                    let rowid = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO nodes_vec (rowid, embedding) VALUES (?1, vec_f32(?2))",
                        (rowid, &row.embedding),
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(storage_err)?;

        debug!(kb_id = %self.kb_id, doc_name, units = count, "indexed document");
        Ok(count)
    }

    /// Removes every unit stored for `doc_name` and returns how many were
    /// deleted. Storage faults are logged and reported as 0, never raised.
    pub async fn delete_document(&self, doc_name: &str) -> usize {
        match self.try_delete_document(doc_name).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(kb_id = %self.kb_id, doc_name, error = %err, "document delete failed");
                0
            }
        }
    }

    async fn try_delete_document(&self, doc_name: &str) -> Result<usize, TreedexError> {
        let doc_name = doc_name.to_string();
        self.conn
            .call(move |conn| -> tokio_rusqlite::Result<usize> {
                let has_vectors = conn
                    .query_row(
                        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'nodes_vec'",
                        [],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                let tx = conn.transaction()?;
                if has_vectors {
                    tx.execute(
                        "DELETE FROM nodes_vec WHERE rowid IN \
                         (SELECT rowid FROM nodes WHERE doc_name = ?1)",
                        [&doc_name],
                    )?;
                }
                let removed = tx.execute("DELETE FROM nodes WHERE doc_name = ?1", [&doc_name])?;
                tx.commit()?;
                Ok(removed)
            })
            .await
            .map_err(storage_err)
    }

    /// Semantic search within this knowledge base.
    ///
    /// Over-fetches `OVER_FETCH_FACTOR * top_k` raw neighbors, applies the
    /// optional document filter, collapses to one hit per node keeping the
    /// best score, and returns at most `top_k` results in descending score
    /// order.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&DocFilter>,
    ) -> Result<Vec<SearchResult>, TreedexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(query).await?;
        let raw = self
            .fetch_raw_neighbors(&query_vector, top_k * OVER_FETCH_FACTOR)
            .await?;

        let filtered: Vec<SearchResult> = match filter {
            Some(filter) => raw
                .into_iter()
                .filter(|hit| filter.matches(&hit.doc_name))
                .collect(),
            None => raw,
        };

        let mut results = dedup_by_node(filtered);
        results.truncate(top_k);
        Ok(results)
    }

    async fn fetch_raw_neighbors(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchResult>, TreedexError> {
        let embedding = serde_json::to_string(query_vector)
            .map_err(|err| TreedexError::Storage(err.to_string()))?;
        let kb_id = self.kb_id.clone();

        self.conn
            .call(move |conn| -> tokio_rusqlite::Result<Vec<SearchResult>> {
                let has_vectors = conn
                    .query_row(
                        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'nodes_vec'",
                        [],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !has_vectors {
                    return Ok(Vec::new());
                }

                let mut stmt = conn.prepare(&format!(
                    "SELECT n.id, n.doc_name, n.node_id, n.title, n.path, n.start_index, \
                     n.end_index, n.summary, n.vector_type, \
                     vec_distance_cosine(v.embedding, vec_f32(?1)) AS distance \
                     FROM nodes n \
                     JOIN nodes_vec v ON v.rowid = n.rowid \
                     ORDER BY distance ASC \
                     LIMIT {limit}"
                ))?;

                let rows = stmt.query_map([&embedding], |row| {
                    let distance: f64 = row.get(9)?;
                    Ok(SearchResult {
                        id: row.get(0)?,
                        kb_id: kb_id.clone(),
                        doc_name: row.get(1)?,
                        node_id: row.get(2)?,
                        title: row.get(3)?,
                        path: row.get(4)?,
                        start_index: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                        end_index: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                        summary: row.get(7)?,
                        vector_type: VectorKind::parse(&row.get::<_, String>(8)?)
                            .unwrap_or_default(),
                        // Exponential decay keeps scores in (0, 1] and
                        // monotone in distance.
                        score: (-distance).exp() as f32,
                        rerank_score: None,
                    })
                })?;

                let mut results = Vec::new();
                for row in rows {
                    results.push(row?);
                }
                Ok(results)
            })
            .await
            .map_err(storage_err)
    }

    /// Names of all documents indexed in this collection. Faults degrade to
    /// an empty list.
    pub async fn all_documents(&self) -> Vec<String> {
        let outcome = self
            .conn
            .call(|conn| -> tokio_rusqlite::Result<Vec<String>> {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT doc_name FROM nodes ORDER BY doc_name")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row?);
                }
                Ok(names)
            })
            .await;
        match outcome {
            Ok(names) => names,
            Err(err) => {
                warn!(kb_id = %self.kb_id, error = %err, "document listing failed");
                Vec::new()
            }
        }
    }

    /// Stored unit ids for one document, in insertion order.
    pub async fn document_unit_ids(&self, doc_name: &str) -> Vec<String> {
        let doc_name = doc_name.to_string();
        let outcome = self
            .conn
            .call(move |conn| -> tokio_rusqlite::Result<Vec<String>> {
                let mut stmt = conn
                    .prepare("SELECT id FROM nodes WHERE doc_name = ?1 ORDER BY rowid")?;
                let rows = stmt.query_map([&doc_name], |row| row.get::<_, String>(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                Ok(ids)
            })
            .await;
        match outcome {
            Ok(ids) => ids,
            Err(err) => {
                warn!(kb_id = %self.kb_id, error = %err, "unit id listing failed");
                Vec::new()
            }
        }
    }

    /// Number of distinct outline nodes stored for `doc_name`. Faults degrade
    /// to 0.
    pub async fn document_node_count(&self, doc_name: &str) -> usize {
        let doc_name = doc_name.to_string();
        let outcome = self
            .conn
            .call(move |conn| -> tokio_rusqlite::Result<usize> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT node_id) FROM nodes WHERE doc_name = ?1",
                    [&doc_name],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await;
        match outcome {
            Ok(count) => count,
            Err(err) => {
                warn!(kb_id = %self.kb_id, error = %err, "node count failed");
                0
            }
        }
    }

    /// Collection statistics. Faults degrade to zeroed stats.
    pub async fn stats(&self) -> KbStats {
        let outcome = self
            .conn
            .call(|conn| -> tokio_rusqlite::Result<(usize, usize)> {
                let unit_count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
                let document_count: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT doc_name) FROM nodes",
                    [],
                    |row| row.get(0),
                )?;
                Ok((unit_count as usize, document_count as usize))
            })
            .await;
        match outcome {
            Ok((unit_count, document_count)) => KbStats {
                kb_id: self.kb_id.clone(),
                unit_count,
                document_count,
            },
            Err(err) => {
                warn!(kb_id = %self.kb_id, error = %err, "stats query failed");
                KbStats {
                    kb_id: self.kb_id.clone(),
                    ..Default::default()
                }
            }
        }
    }
}
