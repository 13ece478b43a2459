//! Binary framing shared by the viewer and the feed.
//!
//! All multi-byte fields are little-endian. Byte 0 of every frame is the
//! message type; type 1 has two layouts selected by [`ProtocolVariant`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChunkId, ContentId, EventIndex};

pub const MSG_BATCH: u8 = 1;
pub const MSG_STATUS: u8 = 2;

/// `[type][content:u8][chunk:u32]`
pub const CONTENT_HEADER_LEN: usize = 6;
/// `[type][start:u32]`
pub const EVENT_HEADER_LEN: usize = 5;
/// `[event type:u8][len:u32]`
pub const RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Type 1 frames address a (content, chunk) pair; the client sends load requests.
    #[default]
    Chunks,
    /// Type 1 frames carry indexed event batches; the client pushes its cursor.
    Events,
}

impl ProtocolVariant {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "chunks" => Some(Self::Chunks),
            "events" => Some(Self::Events),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("frame of type {msg_type} is {len} bytes, need at least {need}")]
    Short { msg_type: u8, len: usize, need: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("record {record} declares {declared} payload bytes, {available} available")]
    TruncatedRecord {
        record: usize,
        declared: usize,
        available: usize,
    },
    #[error("{what} truncated: need {need} bytes, {available} available")]
    Truncated {
        what: &'static str,
        need: usize,
        available: usize,
    },
    #[error("payload of {len} bytes is not a whole number of {record}-byte records")]
    Misaligned { len: usize, record: usize },
}

/// Checked little-endian reads over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn rest(self) -> &'a [u8] {
        self.buf
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                what: self.what,
                need: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord<'a> {
    pub kind: ContentId,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch<'a> {
    pub start: EventIndex,
    pub records: Vec<EventRecord<'a>>,
}

impl EventBatch<'_> {
    /// Cursor value after every record of this batch has been applied.
    pub fn end(&self) -> EventIndex {
        self.start.offset(self.records.len())
    }
}

/// A decoded peer-to-client frame borrowing from the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Content {
        content: ContentId,
        chunk: ChunkId,
        payload: &'a [u8],
    },
    Events(EventBatch<'a>),
    Status(&'a [u8]),
}

/// Decodes a full frame. Event batches are validated completely before
/// anything is returned, so a truncated record rejects the whole batch.
pub fn decode_frame(bytes: &[u8], variant: ProtocolVariant) -> Result<Frame<'_>, WireError> {
    let Some(&msg_type) = bytes.first() else {
        return Err(WireError::Empty);
    };
    match (msg_type, variant) {
        (MSG_BATCH, ProtocolVariant::Chunks) => {
            ensure_len(bytes, msg_type, CONTENT_HEADER_LEN)?;
            let mut r = Reader::new(&bytes[1..], "content header");
            let content = ContentId(r.u8()?);
            let chunk = ChunkId(r.u32()?);
            Ok(Frame::Content {
                content,
                chunk,
                payload: r.rest(),
            })
        }
        (MSG_BATCH, ProtocolVariant::Events) => {
            ensure_len(bytes, msg_type, EVENT_HEADER_LEN)?;
            let mut r = Reader::new(&bytes[1..], "event header");
            let start = EventIndex(r.u32()?);
            let records = decode_records(r.rest())?;
            Ok(Frame::Events(EventBatch { start, records }))
        }
        (MSG_STATUS, _) => Ok(Frame::Status(&bytes[1..])),
        (other, _) => Err(WireError::UnknownType(other)),
    }
}

fn ensure_len(bytes: &[u8], msg_type: u8, need: usize) -> Result<(), WireError> {
    if bytes.len() < need {
        return Err(WireError::Short {
            msg_type,
            len: bytes.len(),
            need,
        });
    }
    Ok(())
}

fn decode_records(mut buf: &[u8]) -> Result<Vec<EventRecord<'_>>, WireError> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        let record = records.len();
        if buf.len() < RECORD_HEADER_LEN {
            return Err(WireError::TruncatedRecord {
                record,
                declared: RECORD_HEADER_LEN,
                available: buf.len(),
            });
        }
        let mut r = Reader::new(buf, "record header");
        let kind = ContentId(r.u8()?);
        let declared = r.u32()? as usize;
        if r.remaining() < declared {
            return Err(WireError::TruncatedRecord {
                record,
                declared,
                available: r.remaining(),
            });
        }
        let payload = r.take(declared)?;
        records.push(EventRecord { kind, payload });
        buf = r.rest();
    }
    Ok(records)
}

/// Request payload: what a chunk already holds, so the peer answers with the delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownIndices {
    pub highest: u64,
    /// Sorted ascending, no duplicates.
    pub known: Vec<u64>,
}

impl KnownIndices {
    pub fn from_sorted<I: IntoIterator<Item = u64>>(indices: I) -> Self {
        let known: Vec<u64> = indices.into_iter().collect();
        let highest = known.last().copied().unwrap_or(0);
        Self { highest, known }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.known.binary_search(&index).is_ok()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.highest.to_le_bytes());
        let count = u32::try_from(self.known.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&count.to_le_bytes());
        for idx in self.known.iter().take(count as usize) {
            out.extend_from_slice(&idx.to_le_bytes());
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let highest = r.u64()?;
        let count = r.u32()? as usize;
        let need = count.saturating_mul(8);
        if r.remaining() < need {
            return Err(WireError::Truncated {
                what: "known indices",
                need,
                available: r.remaining(),
            });
        }
        let mut known = Vec::with_capacity(count);
        for _ in 0..count {
            known.push(r.u64()?);
        }
        Ok(Self { highest, known })
    }
}

/// `[1][content:u8][chunk:u32][highest:u64][count:u32][count x u64]`
pub fn encode_content_request(content: ContentId, chunk: ChunkId, known: &KnownIndices) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONTENT_HEADER_LEN + 12 + known.known.len() * 8);
    out.push(MSG_BATCH);
    out.push(content.0);
    out.extend_from_slice(&chunk.0.to_le_bytes());
    known.encode_into(&mut out);
    out
}

/// `[1][cursor:u32]`
pub fn encode_cursor(cursor: EventIndex) -> Vec<u8> {
    let mut out = Vec::with_capacity(EVENT_HEADER_LEN);
    out.push(MSG_BATCH);
    out.extend_from_slice(&cursor.0.to_le_bytes());
    out
}

/// Peer-side encoder for chunk-variant responses.
pub fn encode_content_update(content: ContentId, chunk: ChunkId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONTENT_HEADER_LEN + payload.len());
    out.push(MSG_BATCH);
    out.push(content.0);
    out.extend_from_slice(&chunk.0.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Peer-side encoder for event-variant batches.
pub fn encode_event_batch(start: EventIndex, records: &[(ContentId, &[u8])]) -> Vec<u8> {
    let body: usize = records
        .iter()
        .map(|(_, p)| RECORD_HEADER_LEN + p.len())
        .sum();
    let mut out = Vec::with_capacity(EVENT_HEADER_LEN + body);
    out.push(MSG_BATCH);
    out.extend_from_slice(&start.0.to_le_bytes());
    for (kind, payload) in records {
        out.push(kind.0);
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}

/// A decoded client-to-peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Load {
        content: ContentId,
        chunk: ChunkId,
        known: KnownIndices,
    },
    Cursor(EventIndex),
}

pub fn decode_request(bytes: &[u8], variant: ProtocolVariant) -> Result<Request, WireError> {
    let Some(&msg_type) = bytes.first() else {
        return Err(WireError::Empty);
    };
    if msg_type != MSG_BATCH {
        return Err(WireError::UnknownType(msg_type));
    }
    match variant {
        ProtocolVariant::Chunks => {
            ensure_len(bytes, msg_type, CONTENT_HEADER_LEN)?;
            let mut r = Reader::new(&bytes[1..], "load request");
            let content = ContentId(r.u8()?);
            let chunk = ChunkId(r.u32()?);
            let known = KnownIndices::decode(&mut r)?;
            Ok(Request::Load {
                content,
                chunk,
                known,
            })
        }
        ProtocolVariant::Events => {
            ensure_len(bytes, msg_type, EVENT_HEADER_LEN)?;
            let mut r = Reader::new(&bytes[1..], "cursor push");
            Ok(Request::Cursor(EventIndex(r.u32()?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_event_batch_records_in_order() {
        let frame = encode_event_batch(
            EventIndex(7),
            &[(ContentId(1), b"abc".as_slice()), (ContentId(9), b"".as_slice())],
        );
        let Frame::Events(batch) = decode_frame(&frame, ProtocolVariant::Events).expect("frame")
        else {
            panic!("expected event batch");
        };
        assert_eq!(batch.start, EventIndex(7));
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].kind, ContentId(1));
        assert_eq!(batch.records[0].payload, b"abc");
        assert_eq!(batch.records[1].kind, ContentId(9));
        assert_eq!(batch.end(), EventIndex(9));
    }

    #[test]
    fn truncated_record_rejects_whole_batch() {
        let mut frame = encode_event_batch(EventIndex(0), &[(ContentId(1), b"abcd".as_slice())]);
        frame.pop();
        let err = decode_frame(&frame, ProtocolVariant::Events).unwrap_err();
        assert!(matches!(err, WireError::TruncatedRecord { record: 0, .. }));
    }

    #[test]
    fn short_frames_are_rejected_per_variant() {
        assert_eq!(decode_frame(&[], ProtocolVariant::Events), Err(WireError::Empty));
        assert!(matches!(
            decode_frame(&[1, 0, 0], ProtocolVariant::Events),
            Err(WireError::Short { need: 5, .. })
        ));
        assert!(matches!(
            decode_frame(&[1, 1, 0, 0, 0], ProtocolVariant::Chunks),
            Err(WireError::Short { need: 6, .. })
        ));
        assert_eq!(
            decode_frame(&[7, 1, 2], ProtocolVariant::Chunks),
            Err(WireError::UnknownType(7))
        );
    }

    #[test]
    fn status_frames_accept_any_body() {
        assert_eq!(
            decode_frame(&[2, 0xff, 0x00, 0x13], ProtocolVariant::Events),
            Ok(Frame::Status(&[0xff, 0x00, 0x13]))
        );
        assert_eq!(
            decode_frame(&[2], ProtocolVariant::Chunks),
            Ok(Frame::Status(&[]))
        );
    }

    #[test]
    fn content_request_layout_matches_protocol() {
        let known = KnownIndices::from_sorted([3, 5, 8]);
        let bytes = encode_content_request(ContentId(1), ChunkId(0x0102), &known);
        assert_eq!(&bytes[..6], &[1, 1, 0x02, 0x01, 0, 0]);
        assert_eq!(&bytes[6..14], &8u64.to_le_bytes());
        assert_eq!(&bytes[14..18], &3u32.to_le_bytes());
        assert_eq!(bytes.len(), 18 + 3 * 8);

        let decoded = decode_request(&bytes, ProtocolVariant::Chunks).expect("request");
        assert_eq!(
            decoded,
            Request::Load {
                content: ContentId(1),
                chunk: ChunkId(0x0102),
                known,
            }
        );
    }

    #[test]
    fn cursor_push_is_five_bytes() {
        let bytes = encode_cursor(EventIndex(10));
        assert_eq!(bytes, vec![1, 10, 0, 0, 0]);
        assert_eq!(
            decode_request(&bytes, ProtocolVariant::Events),
            Ok(Request::Cursor(EventIndex(10)))
        );
    }

    #[test]
    fn request_with_lying_count_is_truncated() {
        let mut bytes = encode_content_request(ContentId(1), ChunkId(0), &KnownIndices::default());
        bytes[14..18].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            decode_request(&bytes, ProtocolVariant::Chunks),
            Err(WireError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_frame(&bytes, ProtocolVariant::Events);
            let _ = decode_frame(&bytes, ProtocolVariant::Chunks);
            let _ = decode_request(&bytes, ProtocolVariant::Chunks);
        }
    }
}
