pub mod protocol;
pub mod stream;
pub mod tcp;

pub use protocol::{Incoming, IncomingKind};
pub use stream::{Disposition, EventStream, RecordOutcome, RecordSink, Tally};
pub use tcp::{spawn_connection, ConnectionHandle, NetTransport};

pub trait Transport {
    // Best effort; frames sent while disconnected are dropped.
    fn send(&mut self, frame: Vec<u8>);
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    pub sent: Vec<Vec<u8>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send(&mut self, frame: Vec<u8>) {
        self.sent.push(frame);
    }
}
