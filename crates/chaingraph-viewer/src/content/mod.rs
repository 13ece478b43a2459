use chaingraph_core::{ChunkId, ContentId, EventIndex, NodeKey, WireError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::graph::surface::{Node, Point, Surface, SurfaceError};
use crate::net::Transport;

pub mod headers;
pub mod markers;

pub use headers::BlockHeaders;
pub use markers::ChunkMarkers;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("{content} does not accept {what}")]
    Unsupported {
        content: &'static str,
        what: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentState {
    pub chunk: ChunkId,
    pub content: ContentId,
    pub known: BTreeSet<u64>,
    pub nodes: BTreeSet<NodeKey>,
    pub requests: u32,
}

impl ContentState {
    pub fn new(chunk: ChunkId, content: ContentId) -> Self {
        Self {
            chunk,
            content,
            known: BTreeSet::new(),
            nodes: BTreeSet::new(),
            requests: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub nodes_added: u32,
    pub placeholders_added: u32,
    pub placeholders_filled: u32,
    pub edges_added: u32,
    pub duplicates: u32,
    pub misplaced: u32,
}

impl Applied {
    pub fn merge(&mut self, other: Applied) {
        self.nodes_added += other.nodes_added;
        self.placeholders_added += other.placeholders_added;
        self.placeholders_filled += other.placeholders_filled;
        self.edges_added += other.edges_added;
        self.duplicates += other.duplicates;
        self.misplaced += other.misplaced;
    }

    pub fn changed(&self) -> bool {
        self.nodes_added + self.placeholders_added + self.placeholders_filled + self.edges_added > 0
    }
}

#[derive(Debug, Default)]
pub struct LayoutTrigger {
    requested: bool,
}

impl LayoutTrigger {
    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.requested)
    }
}

pub trait ContentHandler {
    fn id(&self) -> ContentId;
    fn name(&self) -> &'static str;

    fn init_state(&self, chunk: ChunkId) -> ContentState {
        ContentState::new(chunk, self.id())
    }

    fn load(&self, state: &mut ContentState, tx: &mut dyn Transport, surface: &mut dyn Surface);
    fn refresh(&self, state: &mut ContentState, tx: &mut dyn Transport);
    fn unload(&self, state: &mut ContentState, tx: &mut dyn Transport, surface: &mut dyn Surface);

    // Chunk-addressed payload. Must be idempotent under redelivery.
    fn handle_msg(
        &self,
        state: &mut ContentState,
        payload: &[u8],
        surface: &mut dyn Surface,
        layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError>;

    fn route_event(&self, payload: &[u8]) -> Result<ChunkId, ContentError>;

    // Indexed event payload. Must be idempotent under redelivery.
    fn handle_event(
        &self,
        state: &mut ContentState,
        payload: &[u8],
        index: EventIndex,
        surface: &mut dyn Surface,
        layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError>;

    fn transform(&self, node: &Node, pos: Point) -> Point;

    // Pinned nodes stay out of ranking and are always placed by `transform`.
    fn pinned(&self, _node: &Node) -> bool {
        false
    }
}

// Ownership follows the node's own `chunk` field, which moves when a
// placeholder is filled from another chunk. A node still pointed at by a
// child in another loaded chunk is demoted to that chunk's placeholder.
pub fn release_nodes(state: &mut ContentState, surface: &mut dyn Surface) -> usize {
    let owned = |n: &Node| n.chunk == Some(state.chunk) && n.content == Some(state.content);
    let mut release: BTreeSet<NodeKey> = std::mem::take(&mut state.nodes)
        .into_iter()
        .filter(|k| surface.node(k).is_some_and(|n| owned(n)))
        .collect();
    release.extend(surface.nodes().filter(|&n| owned(n)).map(|n| n.key.clone()));

    let heirs: Vec<(NodeKey, Option<ChunkId>)> = release
        .iter()
        .map(|key| {
            let heir = surface
                .edges_for_node(key)
                .filter(|e| e.target() == key && !release.contains(e.source()))
                .filter_map(|e| surface.node(e.source()).and_then(|n| n.chunk))
                .find(|&c| c != state.chunk);
            (key.clone(), heir)
        })
        .collect();

    let mut removed = 0;
    for (key, heir) in heirs {
        match heir {
            Some(chunk) => {
                if let Some(node) = surface.node_mut(&key) {
                    node.placeholder = true;
                    node.chunk = Some(chunk);
                }
            }
            None => {
                if surface.remove_node(&key).is_some() {
                    removed += 1;
                }
            }
        }
    }
    state.known.clear();
    removed
}

#[derive(Default)]
pub struct ContentRegistry {
    handlers: BTreeMap<ContentId, Box<dyn ContentHandler>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl ContentHandler + 'static) -> Self {
        let id = handler.id();
        if self.handlers.contains_key(&id) {
            tracing::warn!(content = %id, name = handler.name(), "content id registered twice, keeping first");
            return self;
        }
        self.handlers.insert(id, Box::new(handler));
        self
    }

    pub fn get(&self, id: ContentId) -> Option<&dyn ContentHandler> {
        self.handlers.get(&id).map(|h| h.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ContentHandler> + '_ {
        self.handlers.values().map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::axis::TimeAxis;
    use crate::graph::surface::{Edge, MemorySurface};

    #[test]
    fn registry_keeps_first_handler_per_id() {
        let axis = TimeAxis::default();
        let reg = ContentRegistry::new()
            .with(BlockHeaders::new(axis))
            .with(ChunkMarkers::new(axis))
            .with(BlockHeaders::new(axis));
        assert_eq!(reg.len(), 2);
        let ids: Vec<ContentId> = reg.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![ContentId::BLOCK_HEADERS, ContentId::CHUNK_MARKERS]);
    }

    #[test]
    fn release_skips_nodes_owned_elsewhere() {
        let mut surface = MemorySurface::default();
        let mut state = ContentState::new(ChunkId(1), ContentId(1));
        for (k, chunk) in [("a", 1), ("b", 2)] {
            let mut n = Node::new(NodeKey(k.to_string()));
            n.chunk = Some(ChunkId(chunk));
            n.content = Some(ContentId(1));
            surface.add_node(n);
            state.nodes.insert(NodeKey(k.to_string()));
        }

        assert_eq!(release_nodes(&mut state, &mut surface), 1);
        assert!(surface.node(&NodeKey("a".into())).is_none());
        assert!(surface.node(&NodeKey("b".into())).is_some());
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn parent_with_a_loaded_child_becomes_its_placeholder() {
        let mut surface = MemorySurface::default();
        let node = |k: &str, chunk: u32| {
            let mut n = Node::new(NodeKey(k.to_string()));
            n.chunk = Some(ChunkId(chunk));
            n.content = Some(ContentId(1));
            n
        };
        // grand <- parent in chunk 0, child in chunk 1 points at parent
        surface.add_node(node("grand", 0));
        surface.add_node(node("parent", 0));
        surface.add_node(node("child", 1));
        for (from, to) in [("parent", "grand"), ("child", "parent")] {
            surface
                .add_edge(Edge::new(NodeKey(from.into()), NodeKey(to.into())))
                .expect("edge");
        }

        let mut first = ContentState::new(ChunkId(0), ContentId(1));
        first.nodes.extend([NodeKey("grand".into()), NodeKey("parent".into())]);
        assert_eq!(release_nodes(&mut first, &mut surface), 1);
        assert!(surface.node(&NodeKey("grand".into())).is_none());
        let demoted = surface.node(&NodeKey("parent".into())).expect("demoted");
        assert!(demoted.placeholder);
        assert_eq!(demoted.chunk, Some(ChunkId(1)));
        assert_eq!(surface.edge_count(), 1);

        // the heir never listed it, ownership alone decides
        let mut second = ContentState::new(ChunkId(1), ContentId(1));
        second.nodes.insert(NodeKey("child".into()));
        assert_eq!(release_nodes(&mut second, &mut surface), 2);
        assert_eq!(surface.node_count(), 0);
        assert_eq!(surface.edge_count(), 0);
    }

    #[test]
    fn layout_trigger_is_taken_once() {
        let mut t = LayoutTrigger::default();
        assert!(!t.take());
        t.request();
        assert!(t.take());
        assert!(!t.take());
    }
}
