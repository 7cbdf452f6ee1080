//! Read-only snapshot of the destination namespace.
//!
//! Built once per run from the entity service's space listing and never
//! mutated afterwards: writes of this run show up in the next snapshot.

use harvester_manifest::{ConnectionKind, EntityKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// `/SPACE/CODE`, `/SPACE/PROJECT/CODE`, or the code for data sets.
    pub identifier: String,
    pub perm_id: String,
    pub code: String,
    pub kind: EntityKind,
}

/// Directed edge between two node identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: ConnectionKind,
}

/// What the entity service reports for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceListing {
    pub space: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeNodePair<'a> {
    pub edge: &'a GraphEdge,
    pub node: &'a GraphNode,
}

#[derive(Debug, Clone, Default)]
pub struct LocalGraph {
    space: String,
    /// `false` when the destination has no such namespace yet.
    exists: bool,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    by_identifier: HashMap<String, usize>,
    by_perm_id: HashMap<String, usize>,
    /// identifier → indices into `edges`
    outgoing: HashMap<String, Vec<usize>>,
}

impl LocalGraph {
    /// A namespace that does not exist locally yet.
    pub fn empty(space: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            ..Self::default()
        }
    }

    pub fn from_listing(listing: SpaceListing) -> Self {
        let mut graph = Self::empty(listing.space);
        graph.exists = true;
        for node in listing.nodes {
            let idx = graph.nodes.len();
            graph.by_identifier.insert(node.identifier.clone(), idx);
            graph.by_perm_id.insert(node.perm_id.clone(), idx);
            graph.nodes.push(node);
        }
        for edge in listing.edges {
            let idx = graph.edges.len();
            graph.outgoing.entry(edge.from.clone()).or_default().push(idx);
            graph.edges.push(edge);
        }
        tracing::debug!(
            space = %graph.space,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "local graph loaded"
        );
        graph
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn space_exists(&self) -> bool {
        self.exists
    }

    pub fn contains_entity(&self, identifier: &str) -> bool {
        self.by_identifier.contains_key(identifier)
    }

    pub fn node_for_identifier(&self, identifier: &str) -> Option<&GraphNode> {
        self.by_identifier.get(identifier).map(|&idx| &self.nodes[idx])
    }

    pub fn node_for_perm_id(&self, perm_id: &str) -> Option<&GraphNode> {
        self.by_perm_id.get(perm_id).map(|&idx| &self.nodes[idx])
    }

    /// Outgoing edges of `identifier` (optionally of one kind) with their
    /// target nodes. Edges to nodes outside the snapshot are skipped.
    pub fn neighbours(&self, identifier: &str, kind: Option<ConnectionKind>) -> Vec<EdgeNodePair<'_>> {
        let Some(indices) = self.outgoing.get(identifier) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|&idx| &self.edges[idx])
            .filter(|edge| kind.map_or(true, |k| edge.kind == k))
            .filter_map(|edge| {
                self.node_for_identifier(&edge.to)
                    .map(|node| EdgeNodePair { edge, node })
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
