use chaingraph_core::{ChunkId, ContentId, EventIndex, NodeKey};

use crate::content::{
    release_nodes, Applied, ContentError, ContentHandler, ContentState, LayoutTrigger,
};
use crate::graph::axis::TimeAxis;
use crate::graph::surface::{Node, Point, Surface};
use crate::net::Transport;

const MARKER_WIDTH: f64 = 20.0;
const MARKER_HEIGHT: f64 = 1000.0;

#[derive(Debug, Clone, Copy)]
pub struct ChunkMarkers {
    axis: TimeAxis,
}

pub fn marker_key(chunk: ChunkId) -> NodeKey {
    NodeKey(format!("chunk_{}", chunk.0))
}

impl ChunkMarkers {
    pub fn new(axis: TimeAxis) -> Self {
        Self { axis }
    }

    fn unsupported(what: &'static str) -> ContentError {
        ContentError::Unsupported {
            content: "chunk markers",
            what,
        }
    }
}

impl ContentHandler for ChunkMarkers {
    fn id(&self) -> ContentId {
        ContentId::CHUNK_MARKERS
    }

    fn name(&self) -> &'static str {
        "chunk markers"
    }

    fn load(&self, state: &mut ContentState, _tx: &mut dyn Transport, surface: &mut dyn Surface) {
        let key = marker_key(state.chunk);
        let mut node = Node::new(key.clone());
        node.content = Some(self.id());
        node.chunk = Some(state.chunk);
        node.width = MARKER_WIDTH;
        node.height = MARKER_HEIGHT;
        node.position = Point::new(self.axis.chunk_x(state.chunk), 0.0);
        surface.add_node(node);
        state.nodes.insert(key);
    }

    fn refresh(&self, _state: &mut ContentState, _tx: &mut dyn Transport) {}

    fn unload(&self, state: &mut ContentState, _tx: &mut dyn Transport, surface: &mut dyn Surface) {
        release_nodes(state, surface);
    }

    fn handle_msg(
        &self,
        _state: &mut ContentState,
        _payload: &[u8],
        _surface: &mut dyn Surface,
        _layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError> {
        Err(Self::unsupported("network payloads"))
    }

    fn route_event(&self, _payload: &[u8]) -> Result<ChunkId, ContentError> {
        Err(Self::unsupported("events"))
    }

    fn handle_event(
        &self,
        _state: &mut ContentState,
        _payload: &[u8],
        _index: EventIndex,
        _surface: &mut dyn Surface,
        _layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError> {
        Err(Self::unsupported("events"))
    }

    fn transform(&self, node: &Node, pos: Point) -> Point {
        match node.chunk {
            Some(chunk) => Point::new(self.axis.chunk_x(chunk), 0.0),
            None => pos,
        }
    }

    fn pinned(&self, _node: &Node) -> bool {
        true
    }
}
