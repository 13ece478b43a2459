use chaingraph_core::{
    encode_content_request, ChunkId, ContentId, EdgeKey, EventIndex, HeaderData, KnownIndices,
    NodeKey, ProtocolVariant, Root,
};

use crate::content::{
    release_nodes, Applied, ContentError, ContentHandler, ContentState, LayoutTrigger,
};
use crate::graph::axis::TimeAxis;
use crate::graph::surface::{Edge, Node, Point, Surface};
use crate::net::Transport;

#[derive(Debug, Clone, Copy)]
pub struct BlockHeaders {
    axis: TimeAxis,
    variant: ProtocolVariant,
}

pub fn header_key(root: &Root) -> NodeKey {
    NodeKey(format!("header_{}", root.to_hex()))
}

pub fn header_edge_key(parent: &Root, root: &Root) -> EdgeKey {
    EdgeKey::new(header_key(root), header_key(parent))
}

impl BlockHeaders {
    pub fn new(axis: TimeAxis) -> Self {
        Self {
            axis,
            variant: ProtocolVariant::Chunks,
        }
    }

    // In the event variant the peer pushes headers unasked, so chunks only
    // gate which events are kept.
    pub fn with_variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self
    }

    fn request(&self, state: &mut ContentState, tx: &mut dyn Transport) {
        if self.variant == ProtocolVariant::Events {
            return;
        }
        let known = KnownIndices::from_sorted(state.known.iter().copied());
        tx.send(encode_content_request(self.id(), state.chunk, &known));
        state.requests += 1;
    }

    fn apply(
        &self,
        state: &mut ContentState,
        h: &HeaderData,
        index: Option<EventIndex>,
        surface: &mut dyn Surface,
        layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError> {
        let mut applied = Applied::default();
        let slot = h.header.slot;
        let key = header_key(&h.root);

        if surface.node(&key).is_some_and(|n| !n.placeholder) {
            applied.duplicates += 1;
            return Ok(applied);
        }

        let parent = if h.header.parent_root.is_zero() {
            None
        } else {
            Some(header_key(&h.header.parent_root))
        };

        if let Some(pk) = &parent {
            if surface.node(pk).is_none() {
                let guess = slot.saturating_sub(1);
                let mut ph = self.node(pk.clone(), guess, index, state.chunk);
                ph.placeholder = true;
                surface.add_node(ph);
                state.nodes.insert(pk.clone());
                applied.placeholders_added += 1;
            }
        }

        match surface.node_mut(&key) {
            Some(existing) => {
                existing.placeholder = false;
                existing.slot = Some(slot);
                existing.event_index = index.or(existing.event_index);
                existing.chunk = Some(state.chunk);
                existing.position.x = self.axis.slot_x(slot);
                applied.placeholders_filled += 1;
            }
            None => {
                let mut node = self.node(key.clone(), slot, index, state.chunk);
                if let Some(parent) = parent.as_ref().and_then(|pk| surface.node(pk)) {
                    node.position.y = parent.position.y;
                }
                surface.add_node(node);
                applied.nodes_added += 1;
            }
        }
        state.nodes.insert(key.clone());
        state.known.insert(slot);
        layout.request();

        if let Some(pk) = parent {
            let mut edge = Edge::new(key, pk);
            edge.event_index = index;
            if surface.add_edge(edge)? {
                applied.edges_added += 1;
            }
        }

        tracing::trace!(slot, root = %h.root, chunk = %state.chunk, "applied header");
        Ok(applied)
    }

    fn node(&self, key: NodeKey, slot: u64, index: Option<EventIndex>, chunk: ChunkId) -> Node {
        let mut node = Node::new(key);
        node.slot = Some(slot);
        node.event_index = index;
        node.content = Some(self.id());
        node.chunk = Some(chunk);
        node.position = Point::new(self.axis.slot_x(slot), 0.0);
        node
    }
}

impl ContentHandler for BlockHeaders {
    fn id(&self) -> ContentId {
        ContentId::BLOCK_HEADERS
    }

    fn name(&self) -> &'static str {
        "block headers"
    }

    fn load(&self, state: &mut ContentState, tx: &mut dyn Transport, _surface: &mut dyn Surface) {
        self.request(state, tx);
    }

    fn refresh(&self, state: &mut ContentState, tx: &mut dyn Transport) {
        tracing::debug!(chunk = %state.chunk, known = state.known.len(), "refreshing headers");
        self.request(state, tx);
    }

    fn unload(&self, state: &mut ContentState, _tx: &mut dyn Transport, surface: &mut dyn Surface) {
        let removed = release_nodes(state, surface);
        tracing::debug!(chunk = %state.chunk, removed, "unloaded headers");
    }

    fn handle_msg(
        &self,
        state: &mut ContentState,
        payload: &[u8],
        surface: &mut dyn Surface,
        layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError> {
        let headers = HeaderData::decode_many(payload)?;
        let mut applied = Applied::default();
        for h in &headers {
            if self.axis.chunk_of_slot(h.header.slot) != Some(state.chunk) {
                tracing::warn!(
                    slot = h.header.slot,
                    chunk = %state.chunk,
                    "dropping header outside its chunk"
                );
                applied.misplaced += 1;
                continue;
            }
            applied.merge(self.apply(state, h, None, surface, layout)?);
        }
        Ok(applied)
    }

    fn route_event(&self, payload: &[u8]) -> Result<ChunkId, ContentError> {
        let h = HeaderData::decode(payload)?;
        self.axis
            .chunk_of_slot(h.header.slot)
            .ok_or(ContentError::Unsupported {
                content: "block headers",
                what: "slots beyond the chunk range",
            })
    }

    fn handle_event(
        &self,
        state: &mut ContentState,
        payload: &[u8],
        index: EventIndex,
        surface: &mut dyn Surface,
        layout: &mut LayoutTrigger,
    ) -> Result<Applied, ContentError> {
        let h = HeaderData::decode(payload)?;
        self.apply(state, &h, Some(index), surface, layout)
    }

    fn transform(&self, node: &Node, pos: Point) -> Point {
        match node.slot {
            Some(slot) => Point::new(self.axis.slot_x(slot), pos.y),
            None => pos,
        }
    }
}
