//! Append-only transaction log with a Merkle tree over its leaves.
//!
//! On disk the ledger is a sequence of length-prefixed records:
//! a 4-byte big-endian length, the canonical transaction bytes, then
//! the 32-byte SHA-256 leaf hash. Sequence numbers start at 1.
//! Uncommitted appends form a suffix; the committed prefix is the
//! only stable view.

pub mod merkle;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::crypto::Digest;
use crate::error::*;

use merkle::{leaf_hash, MerkleTree};

const LENGTH_PREFIX: usize = 4;

/// One replicated transaction log.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
    /// When true, every append fsyncs; otherwise fsync is batched at
    /// commit.
    durability: bool,
    txns: Vec<Vec<u8>>,
    tree: MerkleTree,
    committed_size: u64,
    committed_bytes: u64,
}

impl Ledger {
    /// Opens (or creates) the record file at `path`, reconstructing
    /// the Merkle tree from its leaves. Records already on disk are
    /// part of the committed prefix.
    pub fn open(path: impl AsRef<Path>, durability: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut txns = Vec::new();
        let mut tree = MerkleTree::new();
        let mut offset = 0usize;
        while offset < raw.len() {
            if raw.len() - offset < LENGTH_PREFIX {
                return Err(Error::new(ErrorKind::Fatal, "truncated record length"));
            }
            let mut len_bytes = [0u8; LENGTH_PREFIX];
            len_bytes.copy_from_slice(&raw[offset..offset + LENGTH_PREFIX]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            offset += LENGTH_PREFIX;
            if raw.len() - offset < len + Digest::LENGTH {
                return Err(Error::new(ErrorKind::Fatal, "truncated record body"));
            }
            let txn = raw[offset..offset + len].to_vec();
            offset += len;
            let stored_hash = Digest::from_bytes(&raw[offset..offset + Digest::LENGTH])?;
            offset += Digest::LENGTH;
            if stored_hash != leaf_hash(&txn) {
                return Err(Error::new(ErrorKind::Fatal, "record hash does not match its payload"));
            }
            tree.append(stored_hash);
            txns.push(txn);
        }

        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;

        let committed_size = tree.size();
        let committed_bytes = raw.len() as u64;
        debug!(ledger = %path.display(), size = committed_size, "ledger opened");
        Ok(Self { path, file, durability, txns, tree, committed_size, committed_bytes })
    }

    /// Appends a transaction to the uncommitted suffix and returns
    /// its sequence number together with the new (uncommitted) root.
    pub fn append(&mut self, txn: &[u8]) -> Result<(u64, Digest)> {
        let hash = leaf_hash(txn);
        let mut record = Vec::with_capacity(LENGTH_PREFIX + txn.len() + Digest::LENGTH);
        record.extend_from_slice(&(txn.len() as u32).to_be_bytes());
        record.extend_from_slice(txn);
        record.extend_from_slice(hash.as_ref());
        self.file.write_all(&record)?;
        if self.durability {
            self.file.sync_data()?;
        }

        self.tree.append(hash);
        self.txns.push(txn.to_vec());
        Ok((self.tree.size(), self.tree.root()))
    }

    /// Promotes the uncommitted suffix up to `seq_no` into the stable
    /// prefix and returns the committed root.
    pub fn commit_to(&mut self, seq_no: u64) -> Result<Digest> {
        if seq_no < self.committed_size || seq_no > self.size() {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "commit point outside the uncommitted suffix",
            ));
        }
        if !self.durability {
            self.file.sync_data()?;
        }
        self.committed_bytes += self.txns[self.committed_size as usize..seq_no as usize]
            .iter()
            .map(|t| (LENGTH_PREFIX + t.len() + Digest::LENGTH) as u64)
            .sum::<u64>();
        self.committed_size = seq_no;
        Ok(self.root_hash())
    }

    /// Drops the uncommitted suffix, truncating the record file back
    /// to the committed prefix.
    pub fn discard_uncommitted(&mut self) -> Result<()> {
        self.file.set_len(self.committed_bytes)?;
        self.file.seek(SeekFrom::End(0))?;
        self.txns.truncate(self.committed_size as usize);
        self.tree.truncate(self.committed_size);
        Ok(())
    }

    /// Retrieves the transaction with the given 1-based sequence
    /// number.
    pub fn get(&self, seq_no: u64) -> Option<&[u8]> {
        if seq_no == 0 {
            return None;
        }
        self.txns.get(seq_no as usize - 1).map(|t| t.as_slice())
    }

    /// Total appended size, committed plus uncommitted.
    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    pub fn uncommitted_size(&self) -> u64 {
        self.size() - self.committed_size
    }

    /// Root of the committed prefix.
    pub fn root_hash(&self) -> Digest {
        self.tree.root_at(self.committed_size)
    }

    /// Root over committed and uncommitted records; what a PrePrepare
    /// commits to as `txn_root`.
    pub fn uncommitted_root_hash(&self) -> Digest {
        self.tree.root()
    }

    /// Audit path for `seq_no` within the first `tree_size` records.
    pub fn inclusion_proof(&self, seq_no: u64, tree_size: u64) -> Result<Vec<Digest>> {
        if seq_no == 0 {
            return Err(Error::new(ErrorKind::InputMalformed, "sequence numbers start at 1"));
        }
        self.tree.inclusion_proof(seq_no - 1, tree_size)
    }

    /// Consistency proof between two committed sizes.
    pub fn consistency_proof(&self, from_size: u64, to_size: u64) -> Result<Vec<Digest>> {
        self.tree.consistency_proof(from_size, to_size)
    }

    /// Root the committed prefix had at an earlier size.
    pub fn root_at(&self, size: u64) -> Result<Digest> {
        if size > self.size() {
            return Err(Error::new(ErrorKind::InputMalformed, "size beyond the ledger"));
        }
        Ok(self.tree.root_at(size))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle::{verify_consistency, verify_inclusion};

    fn scratch_ledger(durability: bool) -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("domain_transactions"), durability).unwrap();
        (dir, ledger)
    }

    #[test]
    fn appends_number_from_one() {
        let (_dir, mut ledger) = scratch_ledger(false);
        let (seq, _) = ledger.append(b"{\"op\":\"nym\"}").unwrap();
        assert_eq!(seq, 1);
        let (seq, _) = ledger.append(b"{\"op\":\"attrib\"}").unwrap();
        assert_eq!(seq, 2);
        assert_eq!(ledger.get(1), Some(&b"{\"op\":\"nym\"}"[..]));
        assert_eq!(ledger.get(0), None);
        assert_eq!(ledger.get(3), None);
    }

    #[test]
    fn committed_prefix_is_the_stable_view() {
        let (_dir, mut ledger) = scratch_ledger(false);
        for i in 0..5u32 {
            ledger.append(format!("txn-{}", i).as_bytes()).unwrap();
        }
        ledger.commit_to(3).unwrap();
        assert_eq!(ledger.committed_size(), 3);
        assert_eq!(ledger.uncommitted_size(), 2);
        let committed_root = ledger.root_hash();
        assert_ne!(committed_root, ledger.uncommitted_root_hash());

        ledger.discard_uncommitted().unwrap();
        assert_eq!(ledger.size(), 3);
        assert_eq!(ledger.uncommitted_root_hash(), committed_root);
        assert_eq!(ledger.get(4), None);
    }

    #[test]
    fn reopen_reconstructs_the_tree_from_the_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_transactions");
        let root = {
            let mut ledger = Ledger::open(&path, true).unwrap();
            for i in 0..9u32 {
                ledger.append(format!("node-txn-{}", i).as_bytes()).unwrap();
            }
            ledger.commit_to(9).unwrap()
        };

        let reopened = Ledger::open(&path, true).unwrap();
        assert_eq!(reopened.size(), 9);
        assert_eq!(reopened.committed_size(), 9);
        assert_eq!(reopened.root_hash(), root);
        assert_eq!(reopened.get(5), Some(&b"node-txn-4"[..]));
    }

    #[test]
    fn corrupted_records_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_transactions");
        {
            let mut ledger = Ledger::open(&path, true).unwrap();
            ledger.append(b"genuine").unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        let flip = LENGTH_PREFIX + 2;
        raw[flip] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = Ledger::open(&path, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn discard_truncates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_transactions");
        {
            let mut ledger = Ledger::open(&path, false).unwrap();
            ledger.append(b"stable").unwrap();
            ledger.commit_to(1).unwrap();
            ledger.append(b"doomed-1").unwrap();
            ledger.append(b"doomed-2").unwrap();
            ledger.discard_uncommitted().unwrap();
        }
        let reopened = Ledger::open(&path, false).unwrap();
        assert_eq!(reopened.size(), 1);
        assert_eq!(reopened.get(1), Some(&b"stable"[..]));
    }

    #[test]
    fn proofs_round_trip_through_the_verifiers() {
        let (_dir, mut ledger) = scratch_ledger(false);
        for i in 0..13u32 {
            ledger.append(format!("entry-{}", i).as_bytes()).unwrap();
        }
        ledger.commit_to(13).unwrap();

        let root = ledger.root_hash();
        let proof = ledger.inclusion_proof(7, 13).unwrap();
        let leaf = leaf_hash(b"entry-6");
        assert!(verify_inclusion(&leaf, 6, 13, &proof, &root));

        let old_root = ledger.root_at(8).unwrap();
        let proof = ledger.consistency_proof(8, 13).unwrap();
        assert!(verify_consistency(8, 13, &old_root, &root, &proof));
    }
}
