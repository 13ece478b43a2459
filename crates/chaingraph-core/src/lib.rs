use serde::{Deserialize, Serialize};
use std::fmt;

pub mod header;
pub mod wire;

pub use header::{BeaconBlockHeader, HeaderData, Root, HEADER_DATA_LEN};
pub use wire::{
    decode_frame, decode_request, encode_content_request, encode_content_update, encode_cursor,
    encode_event_batch, EventBatch, EventRecord, Frame, KnownIndices, ProtocolVariant, Request,
    WireError,
};

/// Fixed-width slice of the horizontal (time) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Chunk containing canvas coordinate `x`. Negative coordinates have no chunk.
    pub fn containing(x: f64, chunk_width: f64) -> Option<Self> {
        let idx = (x / chunk_width).floor();
        if idx.is_finite() && idx >= 0.0 && idx <= u32::MAX as f64 {
            Some(Self(idx as u32))
        } else {
            None
        }
    }

    pub fn left_edge(self, chunk_width: f64) -> f64 {
        self.0 as f64 * chunk_width
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects a content handler. One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub u8);

impl ContentId {
    pub const BLOCK_HEADERS: ContentId = ContentId(1);
    pub const CHUNK_MARKERS: ContentId = ContentId(2);
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event in the globally ordered stream.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventIndex(pub u32);

impl EventIndex {
    pub fn offset(self, n: usize) -> Self {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        Self(self.0.saturating_add(n))
    }
}

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub String);

impl NodeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeKey,
    pub target: NodeKey,
}

impl EdgeKey {
    pub fn new(source: NodeKey, target: NodeKey) -> Self {
        Self { source, target }
    }
}

/// Spacing and compaction knobs for one layout run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutOptions {
    /// Ignore empty slots and pack nodes by adjacency only.
    pub compact: bool,
    /// Separation between adjacent nodes sharing a rank.
    pub node_sep: f64,
    /// Separation between adjacent edges sharing a rank.
    pub edge_sep: f64,
    /// Separation between ranks (slots).
    pub slot_sep: f64,
    /// Keep the ranker's x instead of the temporal placement.
    pub pull_latest: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            compact: false,
            node_sep: 10.0,
            edge_sep: 10.0,
            slot_sep: 5.0,
            pull_latest: false,
        }
    }
}

impl LayoutOptions {
    /// Whether content-specific placement overrides the ranker's coordinates.
    pub fn temporal(&self) -> bool {
        !self.compact && !self.pull_latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_containing_floors_and_rejects_negative() {
        assert_eq!(ChunkId::containing(0.0, 600.0), Some(ChunkId(0)));
        assert_eq!(ChunkId::containing(599.9, 600.0), Some(ChunkId(0)));
        assert_eq!(ChunkId::containing(600.0, 600.0), Some(ChunkId(1)));
        assert_eq!(ChunkId::containing(-1.0, 600.0), None);
        assert_eq!(ChunkId::containing(f64::NAN, 600.0), None);
    }

    #[test]
    fn event_index_offset_saturates() {
        assert_eq!(EventIndex(10).offset(3), EventIndex(13));
        assert_eq!(EventIndex(u32::MAX - 1).offset(5), EventIndex(u32::MAX));
    }

    #[test]
    fn temporal_placement_needs_both_flags_off() {
        let mut opts = LayoutOptions::default();
        assert!(opts.temporal());
        opts.compact = true;
        assert!(!opts.temporal());
        opts.compact = false;
        opts.pull_latest = true;
        assert!(!opts.temporal());
    }
}
