use chaingraph_core::{
    decode_frame, encode_cursor, ChunkId, ContentId, EventIndex, Frame, ProtocolVariant,
    WireError,
};

use crate::net::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied,
    // Well-formed but not for us (unknown content, chunk not loaded).
    Ignored,
    Rejected,
}

pub trait RecordSink {
    fn apply_record(&mut self, kind: ContentId, index: EventIndex, payload: &[u8]) -> RecordOutcome;
    fn apply_content(&mut self, content: ContentId, chunk: ChunkId, payload: &[u8]) -> RecordOutcome;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub applied: u32,
    pub ignored: u32,
    pub rejected: u32,
}

impl Tally {
    fn count(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Applied => self.applied += 1,
            RecordOutcome::Ignored => self.ignored += 1,
            RecordOutcome::Rejected => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied { tally: Tally, cursor: EventIndex },
    Content(RecordOutcome),
    // Batch did not start at the cursor; the cursor was re-announced.
    Resync { start: EventIndex, cursor: EventIndex },
    Status,
    Dropped(WireError),
}

#[derive(Debug, Clone)]
pub struct EventStream {
    variant: ProtocolVariant,
    cursor: EventIndex,
}

impl EventStream {
    pub fn new(variant: ProtocolVariant) -> Self {
        Self {
            variant,
            cursor: EventIndex::default(),
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn cursor(&self) -> EventIndex {
        self.cursor
    }

    pub fn announce(&self, tx: &mut dyn Transport) {
        if self.variant == ProtocolVariant::Events {
            tx.send(encode_cursor(self.cursor));
        }
    }

    pub fn on_message(
        &mut self,
        frame: &[u8],
        sink: &mut dyn RecordSink,
        tx: &mut dyn Transport,
    ) -> Disposition {
        let decoded = match decode_frame(frame, self.variant) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(len = frame.len(), error = %e, "dropping malformed frame");
                return Disposition::Dropped(e);
            }
        };

        match decoded {
            Frame::Status(body) => {
                tracing::trace!(len = body.len(), "status frame");
                Disposition::Status
            }
            Frame::Content {
                content,
                chunk,
                payload,
            } => Disposition::Content(sink.apply_content(content, chunk, payload)),
            Frame::Events(batch) => {
                if batch.start != self.cursor {
                    tracing::info!(
                        start = batch.start.0,
                        cursor = self.cursor.0,
                        "batch does not start at cursor, resyncing"
                    );
                    tx.send(encode_cursor(self.cursor));
                    return Disposition::Resync {
                        start: batch.start,
                        cursor: self.cursor,
                    };
                }

                let mut tally = Tally::default();
                for (i, rec) in batch.records.iter().enumerate() {
                    tally.count(sink.apply_record(rec.kind, batch.start.offset(i), rec.payload));
                }
                self.cursor = self.cursor.max(batch.end());
                tx.send(encode_cursor(self.cursor));
                tracing::debug!(
                    start = batch.start.0,
                    cursor = self.cursor.0,
                    applied = tally.applied,
                    ignored = tally.ignored,
                    rejected = tally.rejected,
                    "event batch"
                );
                Disposition::Applied {
                    tally,
                    cursor: self.cursor,
                }
            }
        }
    }
}
