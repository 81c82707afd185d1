//! Authenticated replicated state: a Merkle-Patricia trie with a
//! committed head and an uncommitted head sharing one content store.
//!
//! The replica's event loop is the single writer. Batches are applied
//! to the uncommitted head to compute the state root a PrePrepare
//! commits to; ordering promotes the uncommitted head, a view change
//! rolls it back.

pub mod store;
pub mod trie;

use std::collections::BTreeMap;

use crate::error::*;

use store::RefcountStore;
use trie::Trie;

/// One ledger's state, with committed and uncommitted heads.
pub struct State {
    store: RefcountStore,
    committed: Trie,
    uncommitted: Trie,
}

impl State {
    pub fn new() -> Self {
        Self {
            store: RefcountStore::new(),
            committed: Trie::blank(),
            uncommitted: Trie::blank(),
        }
    }

    /// Root of the committed head.
    pub fn committed_root(&self) -> [u8; 32] {
        self.committed.root_hash()
    }

    /// Root of the uncommitted head; what the next PrePrepare commits to.
    pub fn uncommitted_root(&self) -> [u8; 32] {
        self.uncommitted.root_hash()
    }

    /// Reads through the uncommitted head, so a batch sees the writes
    /// of the batches applied before it.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.uncommitted.get(&self.store, key)
    }

    /// Reads the committed head only.
    pub fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.committed.get(&self.store, key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.uncommitted.update(&mut self.store, key, value)
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.uncommitted.delete(&mut self.store, key)
    }

    /// Promotes the uncommitted head; called when a batch orders.
    /// Returns the newly committed root.
    pub fn commit(&mut self) -> [u8; 32] {
        self.committed = self.uncommitted.clone();
        self.store.on_batch_committed();
        self.committed.root_hash()
    }

    /// Discards uncommitted writes; called when a view change resets
    /// in-flight batches.
    pub fn revert(&mut self) {
        self.uncommitted = self.committed.clone();
    }

    /// Inclusion (or absence) proof for `key` against the committed
    /// head.
    pub fn prove(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
        self.committed.prove(&self.store, key)
    }

    /// Proof for the whole mapping under `prefix` against the
    /// committed head.
    pub fn prove_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, Vec<Vec<u8>>)> {
        self.committed.prove_prefix(&self.store, prefix)
    }

    /// Verifies a proof against a bare 32-byte root commitment.
    pub fn verify(root: &[u8], key: &[u8], value: Option<&[u8]>, proof: &[Vec<u8>]) -> bool {
        Trie::verify(root, key, value, proof)
    }

    pub fn verify_prefix(
        root: &[u8],
        prefix: &[u8],
        mapping: &BTreeMap<Vec<u8>, Vec<u8>>,
        proof: &[Vec<u8>],
    ) -> bool {
        Trie::verify_prefix(root, prefix, mapping, proof)
    }

    /// Enumerates the committed mapping; read-only query handlers use
    /// this on snapshots.
    pub fn items(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.committed.items(&self.store)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
