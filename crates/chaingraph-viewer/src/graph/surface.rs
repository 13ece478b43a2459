use chaingraph_core::{ChunkId, ContentId, EdgeKey, EventIndex, NodeKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const DEFAULT_NODE_SIZE: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Extent {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Extent {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub key: NodeKey,
    pub slot: Option<u64>,
    // Inferred from a forward reference; real data not seen yet.
    pub placeholder: bool,
    pub event_index: Option<EventIndex>,
    pub content: Option<ContentId>,
    // Chunk whose unload removes this node.
    pub chunk: Option<ChunkId>,
    pub parent: Option<NodeKey>,
    pub position: Point,
    pub width: f64,
    pub height: f64,
}

impl Node {
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            slot: None,
            placeholder: false,
            event_index: None,
            content: None,
            chunk: None,
            parent: None,
            position: Point::default(),
            width: DEFAULT_NODE_SIZE,
            height: DEFAULT_NODE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub event_index: Option<EventIndex>,
}

impl Edge {
    pub fn new(source: NodeKey, target: NodeKey) -> Self {
        Self {
            key: EdgeKey::new(source, target),
            event_index: None,
        }
    }

    pub fn source(&self) -> &NodeKey {
        &self.key.source
    }

    pub fn target(&self) -> &NodeKey {
        &self.key.target
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("edge {from} -> {to} references missing node {missing}")]
    MissingEndpoint {
        from: NodeKey,
        to: NodeKey,
        missing: NodeKey,
    },
}

// Mutations made between `begin_batch` and the matching `end_batch` are
// observed as one change.
pub trait Surface {
    fn begin_batch(&mut self);
    fn end_batch(&mut self);

    fn node(&self, key: &NodeKey) -> Option<&Node>;
    fn node_mut(&mut self, key: &NodeKey) -> Option<&mut Node>;
    // Returns false and leaves the surface untouched if the key exists.
    fn add_node(&mut self, node: Node) -> bool;
    fn remove_node(&mut self, key: &NodeKey) -> Option<(Node, Vec<Edge>)>;

    fn edge(&self, key: &EdgeKey) -> Option<&Edge>;
    // `Ok(false)` if the edge already exists.
    fn add_edge(&mut self, edge: Edge) -> Result<bool, SurfaceError>;
    fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge>;

    fn nodes(&self) -> Box<dyn Iterator<Item = &Node> + '_>;
    fn edges(&self) -> Box<dyn Iterator<Item = &Edge> + '_>;
    fn edges_for_node(&self, key: &NodeKey) -> Box<dyn Iterator<Item = &Edge> + '_>;
    fn node_count(&self) -> usize;
    fn edge_count(&self) -> usize;

    fn extent(&self) -> Extent;
    fn set_extent(&mut self, extent: Extent);
}

pub fn batch<S, R>(surface: &mut S, f: impl FnOnce(&mut S) -> R) -> R
where
    S: Surface + ?Sized,
{
    surface.begin_batch();
    let out = f(surface);
    surface.end_batch();
    out
}

#[derive(Debug, Default)]
pub struct MemorySurface {
    nodes: BTreeMap<NodeKey, Node>,
    edges: BTreeMap<EdgeKey, Edge>,
    adjacency: BTreeMap<NodeKey, BTreeSet<EdgeKey>>,
    viewport: Extent,
    batch_depth: u32,
    dirty: bool,
    revision: u64,
}

impl MemorySurface {
    pub fn new(viewport: Extent) -> Self {
        Self {
            viewport,
            ..Self::default()
        }
    }

    // Bumped once per committed change (once per outermost batch).
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.adjacency.clear();
        self.touch();
    }

    fn touch(&mut self) {
        if self.batch_depth > 0 {
            self.dirty = true;
        } else {
            self.revision += 1;
        }
    }
}

impl Surface for MemorySurface {
    fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 && self.dirty {
            self.dirty = false;
            self.revision += 1;
        }
    }

    fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    fn node_mut(&mut self, key: &NodeKey) -> Option<&mut Node> {
        if self.nodes.contains_key(key) {
            self.touch();
        }
        self.nodes.get_mut(key)
    }

    fn add_node(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.key) {
            return false;
        }
        self.nodes.insert(node.key.clone(), node);
        self.touch();
        true
    }

    fn remove_node(&mut self, key: &NodeKey) -> Option<(Node, Vec<Edge>)> {
        let node = self.nodes.remove(key)?;
        let mut removed = Vec::new();
        for ek in self.adjacency.remove(key).unwrap_or_default() {
            let other = if &ek.source == key {
                &ek.target
            } else {
                &ek.source
            };
            if let Some(set) = self.adjacency.get_mut(other) {
                set.remove(&ek);
            }
            if let Some(edge) = self.edges.remove(&ek) {
                removed.push(edge);
            }
        }
        self.touch();
        Some((node, removed))
    }

    // ----- Edges -----

    fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key)
    }

    fn add_edge(&mut self, edge: Edge) -> Result<bool, SurfaceError> {
        for end in [edge.source(), edge.target()] {
            if !self.nodes.contains_key(end) {
                return Err(SurfaceError::MissingEndpoint {
                    from: edge.source().clone(),
                    to: edge.target().clone(),
                    missing: end.clone(),
                });
            }
        }
        if self.edges.contains_key(&edge.key) {
            return Ok(false);
        }
        let key = edge.key.clone();
        self.adjacency
            .entry(key.source.clone())
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(key.target.clone())
            .or_default()
            .insert(key.clone());
        self.edges.insert(key, edge);
        self.touch();
        Ok(true)
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        for end in [&key.source, &key.target] {
            if let Some(set) = self.adjacency.get_mut(end) {
                set.remove(key);
            }
        }
        self.touch();
        Some(edge)
    }

    // ----- Iteration -----

    fn nodes(&self) -> Box<dyn Iterator<Item = &Node> + '_> {
        Box::new(self.nodes.values())
    }

    fn edges(&self) -> Box<dyn Iterator<Item = &Edge> + '_> {
        Box::new(self.edges.values())
    }

    fn edges_for_node(&self, key: &NodeKey) -> Box<dyn Iterator<Item = &Edge> + '_> {
        Box::new(
            self.adjacency
                .get(key)
                .into_iter()
                .flat_map(|keys| keys.iter())
                .filter_map(|k| self.edges.get(k)),
        )
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ----- Viewport -----

    fn extent(&self) -> Extent {
        self.viewport
    }

    fn set_extent(&mut self, extent: Extent) {
        self.viewport = extent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NodeKey {
        NodeKey(s.to_string())
    }

    #[test]
    fn edges_require_both_endpoints() {
        let mut s = MemorySurface::default();
        s.add_node(Node::new(key("a")));
        let err = s.add_edge(Edge::new(key("a"), key("b"))).unwrap_err();
        assert!(matches!(err, SurfaceError::MissingEndpoint { missing, .. } if missing == key("b")));

        s.add_node(Node::new(key("b")));
        assert_eq!(s.add_edge(Edge::new(key("a"), key("b"))), Ok(true));
        assert_eq!(s.add_edge(Edge::new(key("a"), key("b"))), Ok(false));
        assert_eq!(s.edge_count(), 1);
    }

    #[test]
    fn removing_a_node_cascades_to_its_edges() {
        let mut s = MemorySurface::default();
        for k in ["a", "b", "c"] {
            s.add_node(Node::new(key(k)));
        }
        s.add_edge(Edge::new(key("b"), key("a"))).unwrap();
        s.add_edge(Edge::new(key("c"), key("b"))).unwrap();

        let (_, removed) = s.remove_node(&key("b")).expect("node b");
        assert_eq!(removed.len(), 2);
        assert_eq!(s.edge_count(), 0);
        assert_eq!(s.edges_for_node(&key("a")).count(), 0);
        assert_eq!(s.edges_for_node(&key("c")).count(), 0);
    }

    #[test]
    fn batch_commits_one_revision() {
        let mut s = MemorySurface::default();
        let before = s.revision();
        batch(&mut s, |s| {
            s.add_node(Node::new(key("a")));
            s.add_node(Node::new(key("b")));
            assert!(s.in_batch());
            s.add_edge(Edge::new(key("a"), key("b"))).unwrap();
        });
        assert_eq!(s.revision(), before + 1);

        batch(&mut s, |s| {
            assert!(!s.add_node(Node::new(key("a"))));
        });
        assert_eq!(s.revision(), before + 1);
    }

    #[test]
    fn duplicate_node_is_rejected_without_change() {
        let mut s = MemorySurface::default();
        let mut n = Node::new(key("a"));
        n.slot = Some(3);
        assert!(s.add_node(n));
        let mut other = Node::new(key("a"));
        other.slot = Some(9);
        assert!(!s.add_node(other));
        assert_eq!(s.node(&key("a")).and_then(|n| n.slot), Some(3));
    }
}
