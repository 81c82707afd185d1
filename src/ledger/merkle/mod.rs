//! Compact Merkle tree over ledger leaves, RFC 6962 style.
//!
//! Leaf hashes are `SHA-256(0x00 || leaf)`, interior nodes
//! `SHA-256(0x01 || left || right)`. Audit paths prove one leaf's
//! inclusion in a tree of a given size; consistency proofs show one
//! tree size is a prefix of a later one.

use sha2::{Digest as _, Sha256};

use crate::crypto::Digest;
use crate::error::*;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Digest {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(data);
    Digest::from(<[u8; 32]>::from(h.finalize()))
}

fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left.as_ref());
    h.update(right.as_ref());
    Digest::from(<[u8; 32]>::from(h.finalize()))
}

/// Root of the empty tree: the hash of the empty string.
pub fn empty_root() -> Digest {
    Digest::of(&[])
}

/// Largest power of two strictly less than `n`; the canonical split
/// point of a tree of `n` leaves.
fn split_point(n: u64) -> u64 {
    debug_assert!(n > 1);
    1 << (63 - (n - 1).leading_zeros())
}

/// Merkle tree over an append-only sequence of leaf hashes.
///
/// All leaf hashes are retained so that audit and consistency proofs
/// can be produced for any earlier tree size; the record file
/// re-creates them on restart.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<Digest>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self { leaves: Vec::new() }
    }

    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn append(&mut self, leaf: Digest) {
        self.leaves.push(leaf);
    }

    /// Drops every leaf past `size`; used when uncommitted appends
    /// are discarded.
    pub fn truncate(&mut self, size: u64) {
        self.leaves.truncate(size as usize);
    }

    pub fn leaf(&self, index: u64) -> Option<Digest> {
        self.leaves.get(index as usize).copied()
    }

    /// Root over the whole tree.
    pub fn root(&self) -> Digest {
        self.root_at(self.size())
    }

    /// Root the tree had when it held `size` leaves.
    pub fn root_at(&self, size: u64) -> Digest {
        debug_assert!(size <= self.size());
        Self::subtree_hash(&self.leaves[..size as usize])
    }

    fn subtree_hash(leaves: &[Digest]) -> Digest {
        match leaves.len() {
            0 => empty_root(),
            1 => leaves[0],
            n => {
                let k = split_point(n as u64) as usize;
                node_hash(
                    &Self::subtree_hash(&leaves[..k]),
                    &Self::subtree_hash(&leaves[k..]),
                )
            }
        }
    }

    /// Audit path for the leaf at 0-based `index` within the first
    /// `tree_size` leaves.
    pub fn inclusion_proof(&self, index: u64, tree_size: u64) -> Result<Vec<Digest>> {
        if tree_size > self.size() || index >= tree_size {
            return Err(Error::new(ErrorKind::InputMalformed, "audit path outside the tree"));
        }
        Ok(Self::audit_path(index, &self.leaves[..tree_size as usize]))
    }

    fn audit_path(index: u64, leaves: &[Digest]) -> Vec<Digest> {
        if leaves.len() <= 1 {
            return Vec::new();
        }
        let k = split_point(leaves.len() as u64);
        if index < k {
            let mut path = Self::audit_path(index, &leaves[..k as usize]);
            path.push(Self::subtree_hash(&leaves[k as usize..]));
            path
        } else {
            let mut path = Self::audit_path(index - k, &leaves[k as usize..]);
            path.push(Self::subtree_hash(&leaves[..k as usize]));
            path
        }
    }

    /// Proof that the first `from_size` leaves are a prefix of the
    /// first `to_size`.
    pub fn consistency_proof(&self, from_size: u64, to_size: u64) -> Result<Vec<Digest>> {
        if from_size > to_size || to_size > self.size() {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "consistency bounds outside the tree",
            ));
        }
        if from_size == 0 || from_size == to_size {
            return Ok(Vec::new());
        }
        Ok(Self::subproof(from_size, &self.leaves[..to_size as usize], true))
    }

    fn subproof(m: u64, leaves: &[Digest], whole: bool) -> Vec<Digest> {
        let n = leaves.len() as u64;
        if m == n {
            return if whole { Vec::new() } else { vec![Self::subtree_hash(leaves)] };
        }
        let k = split_point(n);
        if m <= k {
            let mut proof = Self::subproof(m, &leaves[..k as usize], whole);
            proof.push(Self::subtree_hash(&leaves[k as usize..]));
            proof
        } else {
            let mut proof = Self::subproof(m - k, &leaves[k as usize..], false);
            proof.push(Self::subtree_hash(&leaves[..k as usize]));
            proof
        }
    }
}

/// Checks an audit path against a signed root.
pub fn verify_inclusion(
    leaf: &Digest,
    index: u64,
    tree_size: u64,
    proof: &[Digest],
    root: &Digest,
) -> bool {
    if index >= tree_size {
        return false;
    }
    let mut fnode = index;
    let mut snode = tree_size - 1;
    let mut hash = *leaf;
    for p in proof {
        if snode == 0 {
            return false;
        }
        if fnode % 2 == 1 || fnode == snode {
            hash = node_hash(p, &hash);
            if fnode % 2 == 0 {
                while fnode != 0 && fnode % 2 == 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            hash = node_hash(&hash, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && hash == *root
}

/// Checks a consistency proof between two signed roots.
pub fn verify_consistency(
    from_size: u64,
    to_size: u64,
    from_root: &Digest,
    to_root: &Digest,
    proof: &[Digest],
) -> bool {
    if from_size > to_size {
        return false;
    }
    if from_size == to_size {
        return proof.is_empty() && from_root == to_root;
    }
    if from_size == 0 {
        // any tree extends the empty one
        return proof.is_empty() && *from_root == empty_root();
    }

    // when the old size is an exact power of two, the old root itself
    // opens the proof
    let mut path = proof.iter();
    let first = if from_size.is_power_of_two() {
        *from_root
    } else {
        match path.next() {
            Some(p) => *p,
            None => return false,
        }
    };

    let mut fnode = from_size - 1;
    let mut snode = to_size - 1;
    while fnode % 2 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = first;
    let mut sr = first;
    for c in path {
        if snode == 0 {
            return false;
        }
        if fnode % 2 == 1 || fnode == snode {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            if fnode % 2 == 0 {
                while fnode != 0 && fnode % 2 == 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && fr == *from_root && sr == *to_root
}
