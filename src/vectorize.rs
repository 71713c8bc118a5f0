//! Per-node embedding-unit generation.
//!
//! A node can contribute several vectors: one for its summary, one per key
//! point, and a bare-title fallback when nothing else is available. Narrow
//! key-point phrases match specific queries while the main vector covers
//! broad topical ones; the fallback keeps a node searchable before
//! summarization has run.

use serde::{Deserialize, Serialize};

use crate::outline::StructureNode;
use crate::types::TreedexError;

/// Largest key-point ordinal the unit-id format accommodates per node.
pub const MAX_KEY_POINTS: usize = 999;

/// Which of a node's texts an embedding unit was derived from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorKind {
    #[default]
    Main,
    KeyPoint,
    TitleOnly,
}

impl VectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorKind::Main => "main",
            VectorKind::KeyPoint => "key_point",
            VectorKind::TitleOnly => "title_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(VectorKind::Main),
            "key_point" => Some(VectorKind::KeyPoint),
            "title_only" => Some(VectorKind::TitleOnly),
            _ => None,
        }
    }
}

/// Document-level context threaded into every generated unit.
#[derive(Clone, Debug)]
pub struct DocumentDescriptor {
    pub doc_name: String,
    pub kb_id: String,
    pub description: String,
}

impl DocumentDescriptor {
    pub fn new(doc_name: impl Into<String>, kb_id: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            kb_id: kb_id.into(),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Metadata stored alongside each unit's vector.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub doc_name: String,
    pub kb_id: String,
    pub node_id: String,
    pub title: String,
    /// Titles from the root to this node, joined with " > ".
    pub path: String,
    #[serde(default)]
    pub doc_description: String,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub end_index: Option<u64>,
    #[serde(default)]
    pub summary: String,
    pub vector_type: VectorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_point: Option<String>,
}

/// One (text, metadata) pair destined for embedding and storage.
///
/// Units are derived per indexing call and never persisted independently of
/// their vectors.
#[derive(Clone, Debug)]
pub struct EmbeddableUnit {
    /// `{doc_name}_{node_id}_{kind}[_{ordinal}]`; unique within a document.
    pub id: String,
    pub text: String,
    pub metadata: UnitMetadata,
}

/// Generates the embedding units for a single node.
///
/// Emission order: main summary unit, then one unit per non-empty key point,
/// then the bare-title fallback only if nothing else was produced. A node
/// with no summary, no key points, and no title yields nothing.
pub fn vectorize_node(
    node: &StructureNode,
    path: &str,
    doc: &DocumentDescriptor,
) -> Result<Vec<EmbeddableUnit>, TreedexError> {
    if node.key_points.len() > MAX_KEY_POINTS {
        return Err(TreedexError::IdSpace(format!(
            "node {} carries {} key points; the unit-id format supports at most {MAX_KEY_POINTS}",
            node.node_id,
            node.key_points.len()
        )));
    }

    let title = node.title.trim();
    let summary = node.summary.trim();
    let mut units = Vec::new();

    let metadata = |vector_type: VectorKind, key_point: Option<String>| UnitMetadata {
        doc_name: doc.doc_name.clone(),
        kb_id: doc.kb_id.clone(),
        node_id: node.node_id.clone(),
        title: title.to_string(),
        path: path.to_string(),
        doc_description: doc.description.clone(),
        start_index: node.start_index,
        end_index: node.end_index,
        summary: summary.to_string(),
        vector_type,
        key_point,
    };

    if !summary.is_empty() {
        units.push(EmbeddableUnit {
            id: format!("{}_{}_main", doc.doc_name, node.node_id),
            text: format!("{title}: {summary}"),
            metadata: metadata(VectorKind::Main, None),
        });
    }

    for (ordinal, key_point) in node.key_points.iter().enumerate() {
        let key_point = key_point.trim();
        if key_point.is_empty() {
            continue;
        }
        units.push(EmbeddableUnit {
            id: format!("{}_{}_kp_{}", doc.doc_name, node.node_id, ordinal),
            text: format!("{title}: {key_point}"),
            metadata: metadata(VectorKind::KeyPoint, Some(key_point.to_string())),
        });
    }

    if units.is_empty() && !title.is_empty() {
        units.push(EmbeddableUnit {
            id: format!("{}_{}_title", doc.doc_name, node.node_id),
            text: title.to_string(),
            metadata: metadata(VectorKind::TitleOnly, None),
        });
    }

    Ok(units)
}

/// Vectorizes an entire forest in pre-order, threading the title path.
pub fn vectorize_tree(
    nodes: &[StructureNode],
    doc: &DocumentDescriptor,
) -> Result<Vec<EmbeddableUnit>, TreedexError> {
    let mut units = Vec::new();
    let mut trail = Vec::new();
    vectorize_level(nodes, doc, &mut trail, &mut units)?;
    Ok(units)
}

fn vectorize_level(
    nodes: &[StructureNode],
    doc: &DocumentDescriptor,
    trail: &mut Vec<String>,
    units: &mut Vec<EmbeddableUnit>,
) -> Result<(), TreedexError> {
    for node in nodes {
        trail.push(node.title.trim().to_string());
        let path = trail.join(" > ");
        units.extend(vectorize_node(node, &path, doc)?);
        vectorize_level(&node.children, doc, trail, units)?;
        trail.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn doc() -> DocumentDescriptor {
        DocumentDescriptor::new("manual", "kb1").with_description("operations manual")
    }

    fn node(title: &str, summary: &str, key_points: &[&str]) -> StructureNode {
        StructureNode {
            title: title.to_string(),
            node_id: "0007".to_string(),
            summary: summary.to_string(),
            key_points: key_points.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn summary_and_key_points_each_produce_a_unit() {
        let units =
            vectorize_node(&node("Setup", "How to install.", &["needs sudo", "linux only"]),
                "Setup", &doc())
            .unwrap();

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].id, "manual_0007_main");
        assert_eq!(units[0].text, "Setup: How to install.");
        assert_eq!(units[0].metadata.vector_type, VectorKind::Main);
        assert_eq!(units[1].id, "manual_0007_kp_0");
        assert_eq!(units[1].text, "Setup: needs sudo");
        assert_eq!(units[1].metadata.key_point.as_deref(), Some("needs sudo"));
        assert_eq!(units[2].id, "manual_0007_kp_1");
    }

    #[test]
    fn title_only_fallback_emits_exactly_one_unit() {
        let units = vectorize_node(&node("Intro", "", &[]), "Intro", &doc()).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "Intro");
        assert_eq!(units[0].metadata.vector_type, VectorKind::TitleOnly);
        assert_eq!(units[0].id, "manual_0007_title");
    }

    #[test]
    fn fully_empty_node_emits_nothing() {
        let units = vectorize_node(&node("", "", &[]), "", &doc()).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn blank_key_points_are_skipped_but_keep_their_ordinal() {
        let units =
            vectorize_node(&node("T", "", &["first", "  ", "third"]), "T", &doc()).unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["manual_0007_kp_0", "manual_0007_kp_2"]);
    }

    #[test]
    fn too_many_key_points_is_surfaced_not_truncated() {
        let points: Vec<&str> = vec!["p"; MAX_KEY_POINTS + 1];
        let err = vectorize_node(&node("T", "", &points), "T", &doc()).unwrap_err();
        assert!(matches!(err, TreedexError::IdSpace(_)));
    }

    #[test]
    fn tree_walk_threads_title_paths_and_keeps_ids_unique() {
        let mut tree = vec![
            StructureNode::new("Guide")
                .with_summary("Top-level summary.")
                .with_children(vec![
                    StructureNode::new("Install")
                        .with_key_points(vec!["step one".into(), "step two".into()]),
                    StructureNode::new("Usage"),
                ]),
        ];
        crate::outline::assign_node_ids(&mut tree, 0).unwrap();

        let units = vectorize_tree(&tree, &doc()).unwrap();
        assert_eq!(units.len(), 4);

        let ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids.len(), units.len());

        let install_kp = units
            .iter()
            .find(|u| u.metadata.vector_type == VectorKind::KeyPoint)
            .unwrap();
        assert_eq!(install_kp.metadata.path, "Guide > Install");

        let usage = units
            .iter()
            .find(|u| u.metadata.vector_type == VectorKind::TitleOnly)
            .unwrap();
        assert_eq!(usage.metadata.path, "Guide > Usage");
    }

    #[test]
    fn vector_kind_round_trips_through_wire_names() {
        for kind in [VectorKind::Main, VectorKind::KeyPoint, VectorKind::TitleOnly] {
            assert_eq!(VectorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(VectorKind::parse("bogus"), None);
    }
}
