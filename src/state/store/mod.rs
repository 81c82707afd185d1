//! Content-addressed node storage for the state trie.
//!
//! Keys are the SHA3-256 of the RLP-encoded node; values are the
//! encodings. Reference counts prevent premature deletion of subtrees
//! shared between tries; a count that drops to zero only marks the
//! node for deletion, and the actual removal happens once the grace
//! window of `DEATH_ROW_OFFSET` batches has passed.

use std::collections::{HashMap, VecDeque};

use crate::crypto::sha3_256;

/// Grace window, in committed batches, between a node's reference
/// count reaching zero and its removal from the store.
pub const DEATH_ROW_OFFSET: u64 = 5000;

struct StoreEntry {
    bytes: Vec<u8>,
    refs: u64,
}

/// Reference-counted content store backing every trie head.
pub struct RefcountStore {
    entries: HashMap<[u8; 32], StoreEntry>,
    death_row: VecDeque<(u64, [u8; 32])>,
    batches_committed: u64,
}

impl RefcountStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            death_row: VecDeque::new(),
            batches_committed: 0,
        }
    }

    /// Stores `bytes` under its content hash, bumping the reference
    /// count, and returns the hash.
    pub fn inc_ref(&mut self, bytes: &[u8]) -> [u8; 32] {
        let hash = sha3_256(bytes);
        let entry = self.entries.entry(hash).or_insert_with(|| StoreEntry {
            bytes: bytes.to_vec(),
            refs: 0,
        });
        entry.refs += 1;
        hash
    }

    /// Drops one reference to `hash`. The node stays readable until
    /// the death-row sweep reaps it.
    pub fn dec_ref(&mut self, hash: &[u8; 32]) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                self.death_row.push_back((self.batches_committed, *hash));
            }
        }
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<&[u8]> {
        self.entries.get(hash).map(|e| e.bytes.as_slice())
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Called once per committed batch; reaps death-row entries whose
    /// grace window has elapsed and whose count is still zero.
    ///
    /// Revived nodes (re-referenced while on the row) are skipped.
    pub fn on_batch_committed(&mut self) {
        self.batches_committed += 1;
        while let Some((marked_at, hash)) = self.death_row.front().copied() {
            if self.batches_committed < marked_at + DEATH_ROW_OFFSET {
                break;
            }
            self.death_row.pop_front();
            if let Some(entry) = self.entries.get(&hash) {
                if entry.refs == 0 {
                    self.entries.remove(&hash);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_sweep(&mut self) {
        for _ in 0..DEATH_ROW_OFFSET + 1 {
            self.on_batch_committed();
        }
    }
}

impl Default for RefcountStore {
    fn default() -> Self {
        Self::new()
    }
}
