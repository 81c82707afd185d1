//! The Merkle-Patricia trie backing the replicated state.
//!
//! Keys are binary, traversed as nibble sequences; a terminator flag
//! in the hex-prefix packing distinguishes leaves from extensions.
//! Nodes are RLP-encoded and hashed with SHA3-256; a node shorter
//! than 32 encoded bytes is inlined into its parent, everything else
//! lives in the reference-counted content store. Proof production and
//! verification thread an explicit `ProofContext` through traversal
//! instead of flipping a process-wide mode.

use std::collections::{BTreeMap, HashSet};

use rlp::{Rlp, RlpStream};
use smallvec::SmallVec;

use crate::crypto::sha3_256;
use crate::error::*;
use crate::state::store::RefcountStore;

/// Nibble path; keys of 32 bytes fit without spilling.
pub type Nibbles = SmallVec<[u8; 64]>;

/// Marks the end of a leaf path in the hex-prefix encoding.
const FLAG_TERMINATOR: u8 = 2;
const FLAG_ODD: u8 = 1;

/// One trie node, decoded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Node {
    Blank,
    Leaf { path: Nibbles, value: Vec<u8> },
    Extension { path: Nibbles, child: NodeRef },
    Branch { children: Box<[NodeRef; 16]>, value: Option<Vec<u8>> },
}

/// How a parent refers to a child node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NodeRef {
    Blank,
    /// The child's encoding was 32 bytes or longer; it lives in the
    /// content store under this hash.
    Hash([u8; 32]),
    /// The child's encoding was shorter than 32 bytes and is embedded
    /// in the parent.
    Inline(Box<Node>),
}

/// Scoped replacement for the original process-wide proof mode stack.
///
/// Each request builds its own context, so concurrent proof work can
/// never contaminate another request's traversal.
pub enum ProofContext {
    /// Plain traversal; resolved nodes are not tracked.
    None,
    /// Every node resolved from the store is captured into the proof.
    Recording { nodes: Vec<Vec<u8>> },
    /// Every node resolved must appear in the supplied proof set.
    Verifying { allowed: HashSet<Vec<u8>> },
}

impl ProofContext {
    pub fn recording() -> Self {
        ProofContext::Recording { nodes: Vec::new() }
    }

    pub fn verifying(proof_nodes: &[Vec<u8>]) -> Self {
        ProofContext::Verifying { allowed: proof_nodes.iter().cloned().collect() }
    }

    fn observe(&mut self, encoded: &[u8]) -> Result<()> {
        match self {
            ProofContext::None => Ok(()),
            ProofContext::Recording { nodes } => {
                if !nodes.iter().any(|n| n == encoded) {
                    nodes.push(encoded.to_vec());
                }
                Ok(())
            }
            ProofContext::Verifying { allowed } => {
                if allowed.contains(encoded) {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::ProofInvalid, "traversed node missing from proof"))
                }
            }
        }
    }

    fn is_verifying(&self) -> bool {
        matches!(self, ProofContext::Verifying { .. })
    }

    pub fn into_nodes(self) -> Vec<Vec<u8>> {
        match self {
            ProofContext::Recording { nodes } => nodes,
            _ => Vec::new(),
        }
    }
}

/// An authenticated key-value map rooted at a 32-byte commitment.
///
/// The trie itself is only the root; all node storage lives in the
/// `RefcountStore` passed into each operation, so several heads
/// (committed and uncommitted) can share one store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Trie {
    root_hash: [u8; 32],
}

/// Root commitment of the empty trie: SHA3-256 of the RLP of the
/// empty byte string.
pub fn blank_root() -> [u8; 32] {
    sha3_256(&encode_node(&Node::Blank))
}

impl Trie {
    pub fn blank() -> Self {
        Trie { root_hash: blank_root() }
    }

    /// Roots must be 0 bytes (blank) or exactly 32.
    pub fn with_root(root: &[u8]) -> Result<Self> {
        match root.len() {
            0 => Ok(Self::blank()),
            32 => {
                let mut root_hash = [0; 32];
                root_hash.copy_from_slice(root);
                Ok(Trie { root_hash })
            }
            _ => Err(Error::new(
                ErrorKind::InputMalformed,
                "root hash length must be 0 or 32 bytes",
            )),
        }
    }

    pub fn root_hash(&self) -> [u8; 32] {
        self.root_hash
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&self, store: &RefcountStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut ctx = ProofContext::None;
        self.get_with(store, key, &mut ctx)
    }

    /// Lookup under an explicit proof context.
    pub fn get_with(
        &self,
        store: &RefcountStore,
        key: &[u8],
        ctx: &mut ProofContext,
    ) -> Result<Option<Vec<u8>>> {
        let root = self.resolve_root(store, ctx)?;
        get_node(store, &root, &bytes_to_nibbles(key), ctx)
    }

    /// Inserts or replaces `key`, moving the root commitment.
    pub fn update(&mut self, store: &mut RefcountStore, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "value must be a non-empty byte string",
            ));
        }
        let root = self.resolve_root(store, &mut ProofContext::None)?;
        let new_root = update_node(store, root, &bytes_to_nibbles(key), value)?;
        self.replace_root(store, new_root);
        Ok(())
    }

    /// Removes `key` if present, moving the root commitment.
    pub fn delete(&mut self, store: &mut RefcountStore, key: &[u8]) -> Result<()> {
        let root = self.resolve_root(store, &mut ProofContext::None)?;
        let new_root = delete_node(store, root, &bytes_to_nibbles(key))?;
        self.replace_root(store, new_root);
        Ok(())
    }

    /// Enumerates the whole mapping.
    pub fn items(&self, store: &RefcountStore) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut ctx = ProofContext::None;
        let root = self.resolve_root(store, &mut ctx)?;
        let mut out = BTreeMap::new();
        collect_items(store, &root, Nibbles::new(), &mut out, &mut ctx)?;
        Ok(out)
    }

    /// Produces an inclusion (or exclusion) proof for `key`: the value
    /// found, plus every stored node the traversal touched.
    pub fn prove(
        &self,
        store: &RefcountStore,
        key: &[u8],
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
        let mut ctx = ProofContext::recording();
        let value = self.get_with(store, key, &mut ctx)?;
        Ok((value, ctx.into_nodes()))
    }

    /// Checks a proof produced by `prove` against a bare root
    /// commitment. `value` of `None` asserts absence.
    pub fn verify(root: &[u8], key: &[u8], value: Option<&[u8]>, proof: &[Vec<u8>]) -> bool {
        let trie = match Trie::with_root(root) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let store = store_from_proof(proof);
        let mut ctx = ProofContext::verifying(proof);
        match trie.get_with(&store, key, &mut ctx) {
            Ok(found) => found.as_deref() == value,
            Err(_) => false,
        }
    }

    /// Produces a proof covering every key under `prefix`: the full
    /// mapping below it plus the nodes needed to re-derive it.
    pub fn prove_prefix(
        &self,
        store: &RefcountStore,
        prefix: &[u8],
    ) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, Vec<Vec<u8>>)> {
        let mut ctx = ProofContext::recording();
        let mapping = self.prefix_items(store, prefix, &mut ctx)?;
        Ok((mapping, ctx.into_nodes()))
    }

    /// Checks a prefix proof: the claimed mapping must be exactly the
    /// set of keys under `prefix` in the trie committed to by `root`.
    pub fn verify_prefix(
        root: &[u8],
        prefix: &[u8],
        mapping: &BTreeMap<Vec<u8>, Vec<u8>>,
        proof: &[Vec<u8>],
    ) -> bool {
        let trie = match Trie::with_root(root) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let store = store_from_proof(proof);
        let mut ctx = ProofContext::verifying(proof);
        match trie.prefix_items(&store, prefix, &mut ctx) {
            Ok(found) => &found == mapping,
            Err(_) => false,
        }
    }

    fn prefix_items(
        &self,
        store: &RefcountStore,
        prefix: &[u8],
        ctx: &mut ProofContext,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let root = self.resolve_root(store, ctx)?;
        let mut seen = Nibbles::new();
        let last = last_node_for_prefix(store, &root, &bytes_to_nibbles(prefix), &mut seen, ctx)?;
        let mut out = BTreeMap::new();
        if let Some(node) = last {
            collect_items(store, &node, seen, &mut out, ctx)?;
        }
        Ok(out)
    }

    fn resolve_root(&self, store: &RefcountStore, ctx: &mut ProofContext) -> Result<Node> {
        if self.root_hash == blank_root() {
            return Ok(Node::Blank);
        }
        resolve_hash(store, &self.root_hash, ctx)
    }

    fn replace_root(&mut self, store: &mut RefcountStore, new_root: Node) {
        let old = self.root_hash;
        self.root_hash = match new_root {
            Node::Blank => blank_root(),
            node => {
                // the root is always stored by hash, even when its
                // encoding is shorter than 32 bytes
                store.inc_ref(&encode_node(&node))
            }
        };
        if old != blank_root() {
            store.dec_ref(&old);
        }
    }
}

// -- nibble codec --

pub(crate) fn bytes_to_nibbles(key: &[u8]) -> Nibbles {
    let mut out = Nibbles::with_capacity(key.len() * 2);
    for b in key {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
    out
}

pub(crate) fn nibbles_to_bytes(nibbles: &[u8]) -> Result<Vec<u8>> {
    if nibbles.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::InputMalformed, "nibble path has odd length"));
    }
    Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

/// Hex-prefix packing: flag bits in the first nibble record the
/// terminator and odd-length adjustments.
fn pack_nibbles(path: &[u8], terminator: bool) -> Vec<u8> {
    let mut flags = if terminator { FLAG_TERMINATOR } else { 0 };
    let mut prefixed = Nibbles::with_capacity(path.len() + 2);
    if path.len() % 2 == 1 {
        flags |= FLAG_ODD;
        prefixed.push(flags);
    } else {
        prefixed.push(flags);
        prefixed.push(0);
    }
    prefixed.extend_from_slice(path);
    prefixed.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect()
}

fn unpack_nibbles(packed: &[u8]) -> Result<(Nibbles, bool)> {
    if packed.is_empty() {
        return Err(Error::new(ErrorKind::InputMalformed, "empty hex-prefix key"));
    }
    let raw = bytes_to_nibbles(packed);
    let flags = raw[0];
    let terminator = flags & FLAG_TERMINATOR != 0;
    let skip = if flags & FLAG_ODD != 0 { 1 } else { 2 };
    Ok((raw[skip..].iter().copied().collect(), terminator))
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn starts_with(full: &[u8], part: &[u8]) -> bool {
    full.len() >= part.len() && &full[..part.len()] == part
}

// -- node codec --

pub(crate) fn encode_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Blank => {
            let mut s = RlpStream::new();
            s.append_empty_data();
            s.out().to_vec()
        }
        Node::Leaf { path, value } => {
            let mut s = RlpStream::new_list(2);
            s.append(&pack_nibbles(path, true));
            s.append(value);
            s.out().to_vec()
        }
        Node::Extension { path, child } => {
            let mut s = RlpStream::new_list(2);
            s.append(&pack_nibbles(path, false));
            append_ref(&mut s, child);
            s.out().to_vec()
        }
        Node::Branch { children, value } => {
            let mut s = RlpStream::new_list(17);
            for child in children.iter() {
                append_ref(&mut s, child);
            }
            match value {
                Some(v) => s.append(v),
                None => s.append_empty_data(),
            };
            s.out().to_vec()
        }
    }
}

fn append_ref(s: &mut RlpStream, node_ref: &NodeRef) {
    match node_ref {
        NodeRef::Blank => {
            s.append_empty_data();
        }
        NodeRef::Hash(h) => {
            s.append(&h.to_vec());
        }
        NodeRef::Inline(node) => {
            s.append_raw(&encode_node(node), 1);
        }
    }
}

pub(crate) fn decode_node(encoded: &[u8]) -> Result<Node> {
    let r = Rlp::new(encoded);
    if r.is_data() {
        let data = r.data().or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
        return if data.is_empty() {
            Ok(Node::Blank)
        } else {
            Err(Error::new(ErrorKind::InputMalformed, "string trie node is not blank"))
        };
    }
    match r.item_count().or_fault(ErrorKind::InputMalformed, "malformed trie node")? {
        2 => {
            let packed = r.at(0).or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
            let raw_path =
                packed.data().or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
            let (path, terminator) = unpack_nibbles(raw_path)?;
            let second = r.at(1).or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
            if terminator {
                let value = second
                    .data()
                    .or_fault(ErrorKind::InputMalformed, "malformed trie node")?
                    .to_vec();
                Ok(Node::Leaf { path, value })
            } else {
                Ok(Node::Extension { path, child: decode_ref(&second)? })
            }
        }
        17 => {
            let mut children: Vec<NodeRef> = Vec::with_capacity(16);
            for i in 0..16 {
                let child = r.at(i).or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
                children.push(decode_ref(&child)?);
            }
            let children: Box<[NodeRef; 16]> = match children.try_into() {
                Ok(array) => Box::new(array),
                Err(_) => unreachable!("sixteen children collected"),
            };
            let value_item =
                r.at(16).or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
            let data =
                value_item.data().or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
            let value = if data.is_empty() { None } else { Some(data.to_vec()) };
            Ok(Node::Branch { children, value })
        }
        _ => Err(Error::new(
            ErrorKind::InputMalformed,
            "trie node is neither key-value nor branch",
        )),
    }
}

fn decode_ref(item: &Rlp<'_>) -> Result<NodeRef> {
    if item.is_list() {
        return Ok(NodeRef::Inline(Box::new(decode_node(item.as_raw())?)));
    }
    let data = item.data().or_fault(ErrorKind::InputMalformed, "malformed trie node")?;
    match data.len() {
        0 => Ok(NodeRef::Blank),
        32 => {
            let mut hash = [0; 32];
            hash.copy_from_slice(data);
            Ok(NodeRef::Hash(hash))
        }
        _ => Err(Error::new(
            ErrorKind::InputMalformed,
            "child reference is neither inline nor a hash",
        )),
    }
}

// -- storage discipline --

/// Encodes `node` and either inlines it (short) or stores it by hash
/// with one reference.
fn store_ref(store: &mut RefcountStore, node: Node) -> NodeRef {
    if matches!(node, Node::Blank) {
        return NodeRef::Blank;
    }
    let encoded = encode_node(&node);
    if encoded.len() < 32 {
        NodeRef::Inline(Box::new(node))
    } else {
        NodeRef::Hash(store.inc_ref(&encoded))
    }
}

fn unstore_ref(store: &mut RefcountStore, node_ref: &NodeRef) {
    if let NodeRef::Hash(h) = node_ref {
        store.dec_ref(h);
    }
}

fn resolve(store: &RefcountStore, node_ref: &NodeRef, ctx: &mut ProofContext) -> Result<Node> {
    match node_ref {
        NodeRef::Blank => Ok(Node::Blank),
        NodeRef::Inline(node) => Ok((**node).clone()),
        NodeRef::Hash(h) => resolve_hash(store, h, ctx),
    }
}

fn resolve_hash(store: &RefcountStore, hash: &[u8; 32], ctx: &mut ProofContext) -> Result<Node> {
    let encoded = match store.get(hash) {
        Some(bytes) => bytes.to_vec(),
        None => {
            let kind =
                if ctx.is_verifying() { ErrorKind::ProofInvalid } else { ErrorKind::Fatal };
            return Err(Error::new(kind, "trie node missing from content store"));
        }
    };
    ctx.observe(&encoded)?;
    decode_node(&encoded)
}

// -- traversal --

fn get_node(
    store: &RefcountStore,
    node: &Node,
    key: &[u8],
    ctx: &mut ProofContext,
) -> Result<Option<Vec<u8>>> {
    match node {
        Node::Blank => Ok(None),
        Node::Branch { children, value } => {
            if key.is_empty() {
                return Ok(value.clone());
            }
            let sub = resolve(store, &children[key[0] as usize], ctx)?;
            get_node(store, &sub, &key[1..], ctx)
        }
        Node::Leaf { path, value } => {
            Ok(if key == path.as_slice() { Some(value.clone()) } else { None })
        }
        Node::Extension { path, child } => {
            if !starts_with(key, path) {
                return Ok(None);
            }
            let sub = resolve(store, child, ctx)?;
            get_node(store, &sub, &key[path.len()..], ctx)
        }
    }
}

fn update_node(store: &mut RefcountStore, node: Node, key: &[u8], value: &[u8]) -> Result<Node> {
    match node {
        Node::Blank => {
            Ok(Node::Leaf { path: key.iter().copied().collect(), value: value.to_vec() })
        }
        Node::Branch { mut children, value: branch_value } => {
            if key.is_empty() {
                return Ok(Node::Branch { children, value: Some(value.to_vec()) });
            }
            let slot = key[0] as usize;
            let old = children[slot].clone();
            let sub = resolve(store, &old, &mut ProofContext::None)?;
            let new_sub = update_node(store, sub, &key[1..], value)?;
            children[slot] = store_ref(store, new_sub);
            unstore_ref(store, &old);
            Ok(Node::Branch { children, value: branch_value })
        }
        node @ (Node::Leaf { .. } | Node::Extension { .. }) => {
            update_kv_node(store, node, key, value)
        }
    }
}

fn update_kv_node(
    store: &mut RefcountStore,
    node: Node,
    key: &[u8],
    value: &[u8],
) -> Result<Node> {
    let path: Nibbles = match &node {
        Node::Leaf { path, .. } | Node::Extension { path, .. } => path.clone(),
        _ => unreachable!("key-value node expected"),
    };
    let cp = common_prefix_len(&path, key);
    let remain_key = &key[cp..];
    let remain_cur: Nibbles = path[cp..].iter().copied().collect();

    // the node's whole path matches; descend or replace in place
    if remain_cur.is_empty() {
        match node {
            Node::Extension { path, child } => {
                let sub = resolve(store, &child, &mut ProofContext::None)?;
                let new_sub = update_node(store, sub, remain_key, value)?;
                let new_ref = store_ref(store, new_sub);
                unstore_ref(store, &child);
                return Ok(Node::Extension { path, child: new_ref });
            }
            Node::Leaf { path, .. } if remain_key.is_empty() => {
                return Ok(Node::Leaf { path, value: value.to_vec() });
            }
            // the key extends past this leaf; fall through and split
            // into a branch holding the old value
            node @ Node::Leaf { .. } => {
                let inner = split_into_branch(store, node, remain_key, &remain_cur, value)?;
                return wrap_with_prefix(store, inner, &key[..cp]);
            }
            _ => unreachable!("key-value node expected"),
        }
    }

    // paths diverge after the common prefix
    let inner = split_into_branch(store, node, remain_key, &remain_cur, value)?;
    wrap_with_prefix(store, inner, &key[..cp])
}

/// Re-attaches the shared path prefix above a freshly built branch.
fn wrap_with_prefix(store: &mut RefcountStore, inner: Node, prefix: &[u8]) -> Result<Node> {
    if prefix.is_empty() {
        return Ok(inner);
    }
    let child = store_ref(store, inner);
    Ok(Node::Extension { path: prefix.iter().copied().collect(), child })
}

/// Builds the branch replacing a key-value node whose path diverges
/// from (or is extended by) the inserted key.
fn split_into_branch(
    store: &mut RefcountStore,
    node: Node,
    remain_key: &[u8],
    remain_cur: &[u8],
    value: &[u8],
) -> Result<Node> {
    let mut children: Box<[NodeRef; 16]> = Box::new(std::array::from_fn(|_| NodeRef::Blank));
    let mut branch_value = None;

    match node {
        Node::Leaf { value: old_value, .. } => {
            if remain_cur.is_empty() {
                branch_value = Some(old_value);
            } else {
                let trimmed = Node::Leaf {
                    path: remain_cur[1..].iter().copied().collect(),
                    value: old_value,
                };
                children[remain_cur[0] as usize] = store_ref(store, trimmed);
            }
        }
        Node::Extension { child, .. } => {
            debug_assert!(!remain_cur.is_empty(), "extension fully matched is handled earlier");
            if remain_cur.len() == 1 {
                // the extension collapses away; its child takes the slot
                children[remain_cur[0] as usize] = child;
            } else {
                let trimmed = Node::Extension {
                    path: remain_cur[1..].iter().copied().collect(),
                    child,
                };
                children[remain_cur[0] as usize] = store_ref(store, trimmed);
            }
        }
        _ => unreachable!("key-value node expected"),
    }

    if remain_key.is_empty() {
        branch_value = Some(value.to_vec());
    } else {
        let leaf = Node::Leaf {
            path: remain_key[1..].iter().copied().collect(),
            value: value.to_vec(),
        };
        children[remain_key[0] as usize] = store_ref(store, leaf);
    }

    Ok(Node::Branch { children, value: branch_value })
}

fn delete_node(store: &mut RefcountStore, node: Node, key: &[u8]) -> Result<Node> {
    match node {
        Node::Blank => Ok(Node::Blank),
        Node::Branch { mut children, value } => {
            if key.is_empty() {
                return normalize_branch(store, Node::Branch { children, value: None });
            }
            let slot = key[0] as usize;
            let old = children[slot].clone();
            let sub = resolve(store, &old, &mut ProofContext::None)?;
            let new_sub = delete_node(store, sub, &key[1..])?;
            let blanked = matches!(new_sub, Node::Blank);
            children[slot] =
                if blanked { NodeRef::Blank } else { store_ref(store, new_sub) };
            unstore_ref(store, &old);
            let branch = Node::Branch { children, value };
            if blanked {
                normalize_branch(store, branch)
            } else {
                Ok(branch)
            }
        }
        Node::Leaf { path, value } => {
            if key == path.as_slice() {
                Ok(Node::Blank)
            } else {
                Ok(Node::Leaf { path, value })
            }
        }
        Node::Extension { path, child } => {
            if !starts_with(key, &path) {
                return Ok(Node::Extension { path, child });
            }
            let sub = resolve(store, &child, &mut ProofContext::None)?;
            let new_sub = delete_node(store, sub, &key[path.len()..])?;
            unstore_ref(store, &child);
            Ok(match new_sub {
                Node::Blank => Node::Blank,
                Node::Leaf { path: sub_path, value } => {
                    let mut merged = path;
                    merged.extend_from_slice(&sub_path);
                    Node::Leaf { path: merged, value }
                }
                Node::Extension { path: sub_path, child: sub_child } => {
                    let mut merged = path;
                    merged.extend_from_slice(&sub_path);
                    Node::Extension { path: merged, child: sub_child }
                }
                branch => Node::Extension { path, child: store_ref(store, branch) },
            })
        }
    }
}

/// A branch left with a single occupant collapses into a key-value
/// node so the encoding stays canonical.
fn normalize_branch(store: &mut RefcountStore, branch: Node) -> Result<Node> {
    let (children, value) = match branch {
        Node::Branch { children, value } => (children, value),
        _ => unreachable!("branch expected"),
    };
    let occupied: Vec<usize> = children
        .iter()
        .enumerate()
        .filter(|(_, c)| !matches!(c, NodeRef::Blank))
        .map(|(i, _)| i)
        .collect();
    let occupancy = occupied.len() + usize::from(value.is_some());

    if occupancy > 1 {
        return Ok(Node::Branch { children, value });
    }
    if occupancy == 0 {
        return Ok(Node::Blank);
    }
    if let Some(v) = value {
        return Ok(Node::Leaf { path: Nibbles::new(), value: v });
    }

    let slot = occupied[0];
    let child_ref = children[slot].clone();
    let sub = resolve(store, &child_ref, &mut ProofContext::None)?;
    Ok(match sub {
        Node::Leaf { path, value } => {
            unstore_ref(store, &child_ref);
            let mut merged = Nibbles::new();
            merged.push(slot as u8);
            merged.extend_from_slice(&path);
            Node::Leaf { path: merged, value }
        }
        Node::Extension { path, child } => {
            unstore_ref(store, &child_ref);
            let mut merged = Nibbles::new();
            merged.push(slot as u8);
            merged.extend_from_slice(&path);
            Node::Extension { path: merged, child }
        }
        _ => {
            let mut path = Nibbles::new();
            path.push(slot as u8);
            Node::Extension { path, child: child_ref }
        }
    })
}

fn collect_items(
    store: &RefcountStore,
    node: &Node,
    prefix: Nibbles,
    out: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ctx: &mut ProofContext,
) -> Result<()> {
    match node {
        Node::Blank => Ok(()),
        Node::Leaf { path, value } => {
            let mut full = prefix;
            full.extend_from_slice(path);
            out.insert(nibbles_to_bytes(&full)?, value.clone());
            Ok(())
        }
        Node::Extension { path, child } => {
            let sub = resolve(store, child, ctx)?;
            let mut full = prefix;
            full.extend_from_slice(path);
            collect_items(store, &sub, full, out, ctx)
        }
        Node::Branch { children, value } => {
            for (i, child) in children.iter().enumerate() {
                if matches!(child, NodeRef::Blank) {
                    continue;
                }
                let sub = resolve(store, child, ctx)?;
                let mut full = prefix.clone();
                full.push(i as u8);
                collect_items(store, &sub, full, out, ctx)?;
            }
            if let Some(v) = value {
                out.insert(nibbles_to_bytes(&prefix)?, v.clone());
            }
            Ok(())
        }
    }
}

/// Walks down until the remaining prefix is exhausted or provably
/// absent; `seen` accumulates the nibbles consumed on the way down.
fn last_node_for_prefix(
    store: &RefcountStore,
    node: &Node,
    prefix: &[u8],
    seen: &mut Nibbles,
    ctx: &mut ProofContext,
) -> Result<Option<Node>> {
    match node {
        Node::Blank => Ok(None),
        Node::Branch { children, .. } => {
            if prefix.is_empty() {
                return Ok(Some(node.clone()));
            }
            let sub = resolve(store, &children[prefix[0] as usize], ctx)?;
            seen.push(prefix[0]);
            last_node_for_prefix(store, &sub, &prefix[1..], seen, ctx)
        }
        Node::Leaf { path, .. } => {
            // the node has the whole prefix; `seen` stays put
            Ok(if starts_with(path, prefix) { Some(node.clone()) } else { None })
        }
        Node::Extension { path, child } => {
            if prefix.len() > path.len() {
                if starts_with(prefix, path) {
                    let sub = resolve(store, child, ctx)?;
                    seen.extend_from_slice(path);
                    last_node_for_prefix(store, &sub, &prefix[path.len()..], seen, ctx)
                } else {
                    Ok(None)
                }
            } else if starts_with(path, prefix) {
                Ok(Some(node.clone()))
            } else {
                Ok(None)
            }
        }
    }
}

fn store_from_proof(proof: &[Vec<u8>]) -> RefcountStore {
    let mut store = RefcountStore::new();
    for node in proof {
        store.inc_ref(node);
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Trie, RefcountStore) {
        (Trie::blank(), RefcountStore::new())
    }

    #[test]
    fn update_get_delete_round_trip() {
        let (mut trie, mut store) = fresh();
        trie.update(&mut store, b"do", b"verb").unwrap();
        trie.update(&mut store, b"dog", b"puppy").unwrap();
        trie.update(&mut store, b"doge", b"coin").unwrap();
        trie.update(&mut store, b"horse", b"stallion").unwrap();

        assert_eq!(trie.get(&store, b"do").unwrap().as_deref(), Some(&b"verb"[..]));
        assert_eq!(trie.get(&store, b"dog").unwrap().as_deref(), Some(&b"puppy"[..]));
        assert_eq!(trie.get(&store, b"doge").unwrap().as_deref(), Some(&b"coin"[..]));
        assert_eq!(trie.get(&store, b"horse").unwrap().as_deref(), Some(&b"stallion"[..]));
        assert_eq!(trie.get(&store, b"dodge").unwrap(), None);

        trie.update(&mut store, b"dog", b"hound").unwrap();
        assert_eq!(trie.get(&store, b"dog").unwrap().as_deref(), Some(&b"hound"[..]));

        trie.delete(&mut store, b"dog").unwrap();
        assert_eq!(trie.get(&store, b"dog").unwrap(), None);
        assert_eq!(trie.get(&store, b"doge").unwrap().as_deref(), Some(&b"coin"[..]));
    }

    #[test]
    fn root_is_a_function_of_the_mapping() {
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"alpha", b"1"),
            (b"beta", b"2"),
            (b"al", b"3"),
            (b"betamax", b"4"),
            (b"gamma", b"5"),
        ];
        let (mut forward, mut store_a) = fresh();
        for (k, v) in &pairs {
            forward.update(&mut store_a, k, v).unwrap();
        }
        let (mut backward, mut store_b) = fresh();
        for (k, v) in pairs.iter().rev() {
            backward.update(&mut store_b, k, v).unwrap();
        }
        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn deleting_restores_the_previous_root() {
        let (mut trie, mut store) = fresh();
        trie.update(&mut store, b"k1", b"v1").unwrap();
        let root_before = trie.root_hash();
        trie.update(&mut store, b"k2", b"v2").unwrap();
        assert_ne!(trie.root_hash(), root_before);
        trie.delete(&mut store, b"k2").unwrap();
        assert_eq!(trie.root_hash(), root_before);
    }

    #[test]
    fn deleting_everything_yields_the_blank_root() {
        let (mut trie, mut store) = fresh();
        trie.update(&mut store, b"only", b"one").unwrap();
        trie.delete(&mut store, b"only").unwrap();
        assert_eq!(trie.root_hash(), blank_root());
        assert_eq!(trie.get(&store, b"only").unwrap(), None);
    }

    #[test]
    fn rejects_bad_roots_and_values() {
        assert!(Trie::with_root(&[0u8; 7]).is_err());
        assert!(Trie::with_root(&[]).is_ok());
        assert!(Trie::with_root(&[0u8; 32]).is_ok());

        let (mut trie, mut store) = fresh();
        let err = trie.update(&mut store, b"key", b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputMalformed);
    }

    #[test]
    fn inclusion_proofs_verify_against_the_bare_root() {
        let (mut trie, mut store) = fresh();
        for i in 0u32..40 {
            let key = format!("key-{:03}", i);
            let value = format!("value-{}", i * i);
            trie.update(&mut store, key.as_bytes(), value.as_bytes()).unwrap();
        }
        let root = trie.root_hash();

        let (value, proof) = trie.prove(&store, b"key-017").unwrap();
        assert_eq!(value.as_deref(), Some(&b"value-289"[..]));
        assert!(Trie::verify(&root, b"key-017", Some(b"value-289"), &proof));
        assert!(!Trie::verify(&root, b"key-017", Some(b"value-290"), &proof));
        assert!(!Trie::verify(&root, b"key-017", None, &proof));
    }

    #[test]
    fn absence_proofs_verify() {
        let (mut trie, mut store) = fresh();
        trie.update(&mut store, b"present", b"here").unwrap();
        let root = trie.root_hash();
        let (value, proof) = trie.prove(&store, b"absent").unwrap();
        assert_eq!(value, None);
        assert!(Trie::verify(&root, b"absent", None, &proof));
        assert!(!Trie::verify(&root, b"absent", Some(b"anything"), &proof));
    }

    #[test]
    fn tampered_proofs_fail_verification() {
        let (mut trie, mut store) = fresh();
        for i in 0u32..20 {
            trie.update(&mut store, format!("acct:{}", i).as_bytes(), b"balance").unwrap();
        }
        let root = trie.root_hash();
        let (_, mut proof) = trie.prove(&store, b"acct:7").unwrap();
        // drop a node the traversal needs
        proof.pop();
        assert!(!Trie::verify(&root, b"acct:7", Some(b"balance"), &proof));
    }

    #[test]
    fn prefix_proofs_enumerate_the_subtree() {
        let (mut trie, mut store) = fresh();
        trie.update(&mut store, b"did:alpha", b"1").unwrap();
        trie.update(&mut store, b"did:beta", b"2").unwrap();
        trie.update(&mut store, b"did:gamma", b"3").unwrap();
        trie.update(&mut store, b"txn:1", b"x").unwrap();
        let root = trie.root_hash();

        let (mapping, proof) = trie.prove_prefix(&store, b"did:").unwrap();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.get(&b"did:beta"[..]).map(|v| v.as_slice()), Some(&b"2"[..]));
        assert!(Trie::verify_prefix(&root, b"did:", &mapping, &proof));

        let mut fake = mapping.clone();
        fake.insert(b"did:delta".to_vec(), b"4".to_vec());
        assert!(!Trie::verify_prefix(&root, b"did:", &fake, &proof));
    }

    #[test]
    fn items_enumerates_the_whole_mapping() {
        let (mut trie, mut store) = fresh();
        let mut expected = BTreeMap::new();
        for i in 0u32..25 {
            let key = format!("entry/{}", i).into_bytes();
            let value = format!("{}", i * 7).into_bytes();
            trie.update(&mut store, &key, &value).unwrap();
            expected.insert(key, value);
        }
        assert_eq!(trie.items(&store).unwrap(), expected);
    }

    #[test]
    fn old_roots_are_pruned_but_the_live_root_survives() {
        let (mut trie, mut store) = fresh();
        for round in 0u32..30 {
            for i in 0u32..10 {
                let key = format!("slot-{}", i);
                let value = format!("generation-{}-{}", round, i);
                trie.update(&mut store, key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
        store.force_sweep();
        for i in 0u32..10 {
            let key = format!("slot-{}", i);
            let value = trie.get(&store, key.as_bytes()).unwrap();
            assert_eq!(value.unwrap(), format!("generation-29-{}", i).into_bytes());
        }
    }

    #[test]
    fn nibble_codec_round_trips() {
        let nibbles = bytes_to_nibbles(b"hello");
        assert_eq!(nibbles.as_slice(), &[6, 8, 6, 5, 6, 12, 6, 12, 6, 15]);
        assert_eq!(nibbles_to_bytes(&nibbles).unwrap(), b"hello".to_vec());
        assert!(nibbles_to_bytes(&[1, 2, 3]).is_err());

        for (path, terminator) in [(&[1u8, 2, 3][..], true), (&[10, 11][..], false), (&[][..], true)] {
            let packed = pack_nibbles(path, terminator);
            let (unpacked, t) = unpack_nibbles(&packed).unwrap();
            assert_eq!(unpacked.as_slice(), path);
            assert_eq!(t, terminator);
        }
    }
}
