#[derive(Debug, Clone)]
pub struct Incoming {
    pub peer: String,
    pub kind: IncomingKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingKind {
    Opened,
    Closed,
    Frame(Vec<u8>),
    Error(String),
}

impl Incoming {
    pub fn opened(peer: String) -> Self {
        Self {
            peer,
            kind: IncomingKind::Opened,
        }
    }

    pub fn closed(peer: String) -> Self {
        Self {
            peer,
            kind: IncomingKind::Closed,
        }
    }

    pub fn frame(peer: String, bytes: Vec<u8>) -> Self {
        Self {
            peer,
            kind: IncomingKind::Frame(bytes),
        }
    }

    pub fn error(peer: String, msg: String) -> Self {
        Self {
            peer,
            kind: IncomingKind::Error(msg),
        }
    }
}
