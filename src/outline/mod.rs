//! Document-outline trees and the utilities that canonicalize them.
//!
//! The upstream structuring pipeline produces outlines in two shapes: a
//! recursive [`StructureNode`] forest, and a flat list of [`FlatOutlineItem`]s
//! carrying dot-delimited structure codes and page markers. The helpers here
//! assign stable node ids, derive page spans, rebuild trees from flat lists,
//! and flatten trees back into processing order.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::TreedexError;

/// Width of the zero-padded decimal node id.
pub const NODE_ID_WIDTH: usize = 4;

/// Largest id representable in the fixed-width format.
pub const MAX_NODE_ID: u64 = 9999;

/// One entry in a document's hierarchical outline.
///
/// Children are exclusively owned by their parent; a node with an empty
/// `children` list is a leaf. `start_index`/`end_index` are page or character
/// bounds depending on the source document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StructureNode {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub end_index: Option<u64>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub children: Vec<StructureNode>,
    /// Transient span content; never persisted to the vector store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl StructureNode {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Returns `true` when this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    #[must_use]
    pub fn with_key_points(mut self, key_points: Vec<String>) -> Self {
        self.key_points = key_points;
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<StructureNode>) -> Self {
        self.children = children;
        self
    }

    #[must_use]
    pub fn with_span(mut self, start: u64, end: u64) -> Self {
        self.start_index = Some(start);
        self.end_index = Some(end);
        self
    }
}

/// Flat outline entry as emitted by the upstream parser.
///
/// `structure` is a dot-delimited code ("1.2.3"); `page_marker` is the page on
/// which the section heading appears; `appear_start` records whether the
/// heading sits at the start of that page (`"yes"`/`"no"`, upstream
/// convention).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlatOutlineItem {
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub page_marker: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appear_start: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub end_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl FlatOutlineItem {
    pub fn new(structure: impl Into<String>, title: impl Into<String>, page_marker: u64) -> Self {
        Self {
            structure: structure.into(),
            title: title.into(),
            page_marker,
            ..Default::default()
        }
    }

    fn into_node(self) -> StructureNode {
        StructureNode {
            title: self.title,
            node_id: String::new(),
            start_index: self.start_index,
            end_index: self.end_index,
            summary: self.summary,
            key_points: self.key_points,
            children: Vec::new(),
            text: self.text,
        }
    }
}

/// Assigns fixed-width pre-order node ids starting at `start_id`.
///
/// Returns the next free id so callers can chain assignment across multiple
/// trees or documents. Ids beyond [`MAX_NODE_ID`] do not fit the fixed-width
/// format and are rejected rather than truncated.
pub fn assign_node_ids(
    nodes: &mut [StructureNode],
    start_id: u64,
) -> Result<u64, TreedexError> {
    let mut next = start_id;
    for node in nodes {
        if next > MAX_NODE_ID {
            return Err(TreedexError::IdSpace(format!(
                "node id {next} exceeds the {NODE_ID_WIDTH}-digit id space"
            )));
        }
        node.node_id = format!("{next:0width$}", width = NODE_ID_WIDTH);
        next = assign_node_ids(&mut node.children, next + 1)?;
    }
    Ok(next)
}

/// Flattens a forest into pre-order with children stripped from each node.
pub fn flatten(nodes: &[StructureNode]) -> Vec<StructureNode> {
    let mut out = Vec::new();
    flatten_into(nodes, &mut out);
    out
}

fn flatten_into(nodes: &[StructureNode], out: &mut Vec<StructureNode>) {
    for node in nodes {
        let mut flat = node.clone();
        flat.children = Vec::new();
        out.push(flat);
        flatten_into(&node.children, out);
    }
}

/// Pre-order traversal that keeps each node's children intact.
pub fn flatten_with_children(nodes: &[StructureNode]) -> Vec<&StructureNode> {
    let mut out = Vec::new();
    collect_refs(nodes, &mut out, false);
    out
}

/// Nodes with an empty children list, in pre-order.
pub fn leaf_nodes(nodes: &[StructureNode]) -> Vec<&StructureNode> {
    let mut out = Vec::new();
    collect_refs(nodes, &mut out, true);
    out
}

fn collect_refs<'a>(
    nodes: &'a [StructureNode],
    out: &mut Vec<&'a StructureNode>,
    leaves_only: bool,
) {
    for node in nodes {
        if !leaves_only || node.is_leaf() {
            out.push(node);
        }
        collect_refs(&node.children, out, leaves_only);
    }
}

/// Derives start/end spans from page markers.
///
/// Each item's span starts at its own page marker. The end is the next item's
/// marker minus one when the next heading appears at the start of its page
/// (`appear_start == "yes"`), otherwise the next marker itself; the last item
/// ends at `last_page`. This is the upstream parser's convention and is
/// applied verbatim.
pub fn spans_from_page_markers(items: &mut [FlatOutlineItem], last_page: u64) {
    let len = items.len();
    for i in 0..len {
        let end = if i + 1 < len {
            let next = &items[i + 1];
            if next.appear_start.as_deref() == Some("yes") {
                next.page_marker.saturating_sub(1)
            } else {
                next.page_marker
            }
        } else {
            last_page
        };
        items[i].start_index = Some(items[i].page_marker);
        items[i].end_index = Some(end);
    }
}

/// Prepends a synthetic "Preface" entry when the first item starts past page 1.
///
/// Must run before id assignment so the preface receives an id like any other
/// node.
pub fn insert_preface_if_needed(items: &mut Vec<FlatOutlineItem>) {
    let Some(first) = items.first() else {
        return;
    };
    if first.page_marker > 1 {
        items.insert(0, FlatOutlineItem::new("0", "Preface", 1));
    }
}

/// Rebuilds a forest from a flat list of dot-coded items.
///
/// An item's parent is the entry whose code equals its own minus the last
/// segment ("1.2.3" links under "1.2"). Items whose parent code has not been
/// seen become additional roots; out-of-order input never fails. Duplicate
/// structure codes are rejected outright since they would silently mis-link
/// the tree.
pub fn build_tree_from_flat_list(
    items: Vec<FlatOutlineItem>,
) -> Result<Vec<StructureNode>, TreedexError> {
    let mut seen = HashSet::new();
    for item in &items {
        if !seen.insert(item.structure.clone()) {
            return Err(TreedexError::Structure(format!(
                "duplicate structure code '{}'",
                item.structure
            )));
        }
    }

    let mut roots: Vec<StructureNode> = Vec::new();
    // Structure code -> child-index path from the forest roots to the node.
    let mut paths: HashMap<String, Vec<usize>> = HashMap::new();

    for item in items {
        let code = item.structure.clone();
        let node = item.into_node();
        let parent_path = parent_code(&code).and_then(|parent| paths.get(parent).cloned());
        match parent_path {
            Some(mut path) => {
                let parent = node_at_mut(&mut roots, &path);
                parent.children.push(node);
                path.push(parent.children.len() - 1);
                paths.insert(code, path);
            }
            None => {
                roots.push(node);
                paths.insert(code, vec![roots.len() - 1]);
            }
        }
    }

    Ok(roots)
}

fn parent_code(code: &str) -> Option<&str> {
    code.rsplit_once('.').map(|(parent, _)| parent)
}

fn node_at_mut<'a>(roots: &'a mut [StructureNode], path: &[usize]) -> &'a mut StructureNode {
    let mut node = &mut roots[path[0]];
    for &index in &path[1..] {
        node = &mut node.children[index];
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Vec<StructureNode> {
        vec![
            StructureNode::new("Chapter 1").with_children(vec![
                StructureNode::new("Section 1.1"),
                StructureNode::new("Section 1.2")
                    .with_children(vec![StructureNode::new("Subsection 1.2.1")]),
            ]),
            StructureNode::new("Chapter 2"),
        ]
    }

    #[test]
    fn assigns_preorder_ids_and_returns_next_free() {
        let mut tree = sample_tree();
        let next = assign_node_ids(&mut tree, 0).unwrap();
        assert_eq!(next, 5);

        let flat = flatten(&tree);
        let ids: Vec<&str> = flat.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["0000", "0001", "0002", "0003", "0004"]);
    }

    #[test]
    fn id_assignment_chains_across_trees() {
        let mut first = sample_tree();
        let next = assign_node_ids(&mut first, 10).unwrap();
        let mut second = vec![StructureNode::new("Appendix")];
        let after = assign_node_ids(&mut second, next).unwrap();
        assert_eq!(second[0].node_id, "0015");
        assert_eq!(after, 16);
    }

    #[test]
    fn id_overflow_is_an_error_not_a_truncation() {
        let mut tree = vec![StructureNode::new("Last"), StructureNode::new("Over")];
        let err = assign_node_ids(&mut tree, MAX_NODE_ID).unwrap_err();
        assert!(matches!(err, TreedexError::IdSpace(_)));
    }

    #[test]
    fn flatten_preserves_preorder_and_strips_children() {
        let tree = sample_tree();
        let flat = flatten(&tree);
        assert_eq!(flat.len(), 5);
        assert!(flat.iter().all(|n| n.children.is_empty()));
        assert_eq!(flat[0].title, "Chapter 1");
        assert_eq!(flat[3].title, "Subsection 1.2.1");
    }

    #[test]
    fn leaf_nodes_skips_interior_nodes() {
        let tree = sample_tree();
        let leaves = leaf_nodes(&tree);
        let titles: Vec<&str> = leaves.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["Section 1.1", "Subsection 1.2.1", "Chapter 2"]);
    }

    #[test]
    fn flatten_with_children_keeps_subtrees() {
        let tree = sample_tree();
        let flat = flatten_with_children(&tree);
        assert_eq!(flat.len(), 5);
        assert_eq!(flat[0].children.len(), 2);
    }

    #[test]
    fn span_rule_matches_upstream_convention() {
        let mut items = vec![
            FlatOutlineItem::new("1", "Intro", 1),
            FlatOutlineItem {
                appear_start: Some("yes".into()),
                ..FlatOutlineItem::new("2", "Body", 5)
            },
            FlatOutlineItem {
                appear_start: Some("no".into()),
                ..FlatOutlineItem::new("3", "End", 9)
            },
        ];
        spans_from_page_markers(&mut items, 12);

        let ends: Vec<u64> = items.iter().map(|i| i.end_index.unwrap()).collect();
        assert_eq!(ends, vec![4, 9, 12]);
        let starts: Vec<u64> = items.iter().map(|i| i.start_index.unwrap()).collect();
        assert_eq!(starts, vec![1, 5, 9]);
    }

    #[test]
    fn builds_tree_from_dot_codes() {
        let items = vec![
            FlatOutlineItem::new("1", "Chapter 1", 1),
            FlatOutlineItem::new("1.1", "Section", 2),
            FlatOutlineItem::new("1.1.1", "Subsection", 3),
            FlatOutlineItem::new("2", "Chapter 2", 4),
        ];
        let roots = build_tree_from_flat_list(items).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].children[0].title, "Subsection");
    }

    #[test]
    fn orphaned_items_become_extra_roots() {
        let items = vec![
            FlatOutlineItem::new("1", "Chapter 1", 1),
            FlatOutlineItem::new("3.2", "Orphan", 5),
        ];
        let roots = build_tree_from_flat_list(items).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[1].title, "Orphan");
    }

    #[test]
    fn duplicate_structure_codes_fail_fast() {
        let items = vec![
            FlatOutlineItem::new("1", "First", 1),
            FlatOutlineItem::new("1", "Again", 2),
        ];
        let err = build_tree_from_flat_list(items).unwrap_err();
        assert!(matches!(err, TreedexError::Structure(_)));
    }

    #[test]
    fn preface_inserted_when_document_starts_late() {
        let mut items = vec![FlatOutlineItem::new("1", "Chapter 1", 4)];
        insert_preface_if_needed(&mut items);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Preface");
        assert_eq!(items[0].structure, "0");
        assert_eq!(items[0].page_marker, 1);
    }

    #[test]
    fn preface_skipped_when_document_starts_on_page_one() {
        let mut items = vec![FlatOutlineItem::new("1", "Chapter 1", 1)];
        insert_preface_if_needed(&mut items);
        assert_eq!(items.len(), 1);
    }
}
