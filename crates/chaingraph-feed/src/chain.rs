use chaingraph_core::header::{ROOT_LEN, SIGNATURE_LEN};
use chaingraph_core::{BeaconBlockHeader, HeaderData, Root};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Slots where `slot % MISSED_EVERY == MISSED_AT` have no canonical block.
const MISSED_EVERY: u64 = 7;
const MISSED_AT: u64 = 3;

/// Deterministic header chain with periodic one-block forks and missed slots.
///
/// Headers are kept in production order, which is also their event index.
#[derive(Debug, Clone)]
pub struct Chain {
    headers: Vec<HeaderData>,
    by_slot: BTreeMap<u64, Vec<usize>>,
    fork_every: u64,
    next_slot: u64,
    tip: Root,
}

fn derive_root(slot: u64, branch: u8, parent: &Root) -> Root {
    let mut out = [0u8; ROOT_LEN];
    for (i, word) in out.chunks_exact_mut(8).enumerate() {
        let mut h = DefaultHasher::new();
        (slot, branch, parent.0, i).hash(&mut h);
        word.copy_from_slice(&h.finish().to_le_bytes());
    }
    Root(out)
}

impl Chain {
    pub fn new(fork_every: u64) -> Self {
        let mut chain = Self {
            headers: Vec::new(),
            by_slot: BTreeMap::new(),
            fork_every,
            next_slot: 0,
            tip: Root::default(),
        };
        chain.advance();
        chain
    }

    fn push(&mut self, slot: u64, branch: u8, parent: Root) -> Root {
        let root = derive_root(slot, branch, &parent);
        let header = BeaconBlockHeader {
            slot,
            parent_root: parent,
            state_root: derive_root(slot, branch.wrapping_add(1), &root),
            body_root: derive_root(slot, branch.wrapping_add(2), &root),
            signature: [branch; SIGNATURE_LEN],
        };
        self.by_slot.entry(slot).or_default().push(self.headers.len());
        self.headers.push(HeaderData { header, root });
        root
    }

    /// Produces the next slot. Returns how many headers it added.
    pub fn advance(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        let before = self.headers.len();

        if slot == 0 {
            self.tip = self.push(0, 0, Root::default());
            return self.headers.len() - before;
        }
        if slot % MISSED_EVERY == MISSED_AT {
            return 0;
        }

        let parent = self.tip;
        if self.fork_every > 0 && slot % self.fork_every == 0 {
            // competing block on the same parent; never extended
            self.push(slot, 1, parent);
        }
        self.tip = self.push(slot, 0, parent);
        self.headers.len() - before
    }

    pub fn advance_to(&mut self, slot: u64) -> usize {
        let mut added = 0;
        while self.next_slot <= slot {
            added += self.advance();
        }
        added
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn head_slot(&self) -> u64 {
        self.next_slot.saturating_sub(1)
    }

    /// Headers from event index `from` on, in production order.
    pub fn since(&self, from: usize) -> &[HeaderData] {
        self.headers.get(from..).unwrap_or(&[])
    }

    /// Headers whose slot is in `[first, last]`, ordered by slot.
    pub fn in_slots(&self, first: u64, last: u64) -> impl Iterator<Item = &HeaderData> + '_ {
        self.by_slot
            .range(first..=last)
            .flat_map(|(_, idx)| idx.iter().map(|&i| &self.headers[i]))
    }
}
