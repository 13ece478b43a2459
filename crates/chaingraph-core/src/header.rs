//! Block header payloads, laid out as fixed-size SSZ containers.

use std::fmt;

use crate::wire::{Reader, WireError};

pub const ROOT_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 96;
/// slot + parent root + state root + body root + signature
pub const HEADER_LEN: usize = 8 + 3 * ROOT_LEN + SIGNATURE_LEN;
/// header + block root
pub const HEADER_DATA_LEN: usize = HEADER_LEN + ROOT_LEN;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Root(pub [u8; ROOT_LEN]);

impl Root {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({})", &self.to_hex()[..8])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconBlockHeader {
    pub slot: u64,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
    pub signature: [u8; SIGNATURE_LEN],
}

/// One header event: the header plus the root it hashes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderData {
    pub header: BeaconBlockHeader,
    pub root: Root,
}

impl HeaderData {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != HEADER_DATA_LEN {
            return Err(WireError::Truncated {
                what: "header data",
                need: HEADER_DATA_LEN,
                available: bytes.len(),
            });
        }
        let mut r = Reader::new(bytes, "header data");
        let header = BeaconBlockHeader {
            slot: r.u64()?,
            parent_root: Root(r.array()?),
            state_root: Root(r.array()?),
            body_root: Root(r.array()?),
            signature: r.array()?,
        };
        let root = Root(r.array()?);
        Ok(Self { header, root })
    }

    /// Splits a payload of back-to-back records. A trailing partial record
    /// rejects the whole payload.
    pub fn decode_many(bytes: &[u8]) -> Result<Vec<Self>, WireError> {
        if bytes.len() % HEADER_DATA_LEN != 0 {
            return Err(WireError::Misaligned {
                len: bytes.len(),
                record: HEADER_DATA_LEN,
            });
        }
        bytes.chunks_exact(HEADER_DATA_LEN).map(Self::decode).collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_DATA_LEN);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let h = &self.header;
        out.extend_from_slice(&h.slot.to_le_bytes());
        out.extend_from_slice(&h.parent_root.0);
        out.extend_from_slice(&h.state_root.0);
        out.extend_from_slice(&h.body_root.0);
        out.extend_from_slice(&h.signature);
        out.extend_from_slice(&self.root.0);
    }
}
