//! This module contains types associated with messages traded
//! between the replicas of the pool.
//!
//! Every message is one variant of the `Message` sum type, routed by
//! its type tag. The wire encoding is a canonical JSON form: keys
//! sorted, no insignificant whitespace, integers decimal, byte
//! strings base58. Digests are computed over this canonical form, so
//! it must round-trip bit-exact across nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Digest;
use crate::error::*;
use crate::ordering::{LedgerId, NodeId, SeqNo, ViewNo};

/// Seconds since the epoch, as proposed by primaries and compared
/// against local clocks.
pub type Timestamp = u64;

/// The client-unique key of a request: `(identifier, req_id)`.
pub type RequestKey = (String, u64);

/// Represents a request from a client.
///
/// The operation is an opaque canonical value; the core validates and
/// orders it without interpreting it beyond the target ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub identifier: String,
    pub req_id: u64,
    pub ledger_id: LedgerId,
    pub operation: serde_json::Value,
    /// Signer identifier to base58 Ed25519 signature over the
    /// canonical form of the unsigned request.
    pub signatures: BTreeMap<String, String>,
}

impl Request {
    pub fn key(&self) -> RequestKey {
        (self.identifier.clone(), self.req_id)
    }

    /// Digest over the canonical form with signatures stripped, so
    /// that all replicas agree on it regardless of signature
    /// accumulation order.
    pub fn digest(&self) -> Result<Digest> {
        let unsigned = Request { signatures: BTreeMap::new(), ..self.clone() };
        Ok(Digest::of(&canonical_bytes(&unsigned)?))
    }

    /// The byte string clients actually sign.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = Request { signatures: BTreeMap::new(), ..self.clone() };
        canonical_bytes(&unsigned)
    }
}

/// The value a BLS multi-signature commits to: the state of one
/// ledger at one point in time.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MultiSignatureValue {
    pub ledger_id: LedgerId,
    pub state_root: Digest,
    pub pool_state_root: Digest,
    pub txn_root: Digest,
    pub timestamp: Timestamp,
}

impl MultiSignatureValue {
    /// The canonical byte string each replica signs.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }
}

/// An aggregate BLS signature over identical `MultiSignatureValue`s
/// signed by distinct validators.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlsMultiSignature {
    /// base58 compressed G2 signature.
    pub signature: String,
    pub participants: Vec<NodeId>,
    pub value: MultiSignatureValue,
}

/// Batch proposal multicast by a primary.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub inst_id: usize,
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    /// The primary's proposed commit time; non-primaries accept it
    /// only within `acceptable_deviation_preprepare` of their clock.
    pub pp_time: Timestamp,
    pub ledger_id: LedgerId,
    pub req_idr: Vec<RequestKey>,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
    pub sub_seq_no: u64,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub audit_txn_root: Option<Digest>,
    /// Legacy single-signature slot, kept for wire compatibility.
    pub bls_multi_sig: Option<BlsMultiSignature>,
    /// One multi-signature per ledger whose aggregation completed
    /// since the previous batch.
    pub bls_multi_sigs: Vec<BlsMultiSignature>,
}

impl PrePrepare {
    /// A freshness batch orders no requests; it exists to advance the
    /// signed `(state_root, timestamp)` of an idle ledger.
    pub fn is_freshness_batch(&self) -> bool {
        self.req_idr.is_empty()
    }

    /// The digest replicas echo in Prepare and Commit; computed over
    /// the canonical form minus the aggregated signatures (which vary
    /// by arrival timing on the primary).
    pub fn batch_digest(&self) -> Result<Digest> {
        let stripped = PrePrepare {
            digest: Digest::blank(),
            bls_multi_sig: None,
            bls_multi_sigs: Vec::new(),
            ..self.clone()
        };
        Ok(Digest::of(&canonical_bytes(&stripped)?))
    }
}

/// Echo of a PrePrepare's commitments, without the payload.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub inst_id: usize,
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
}

/// Commit vote, carrying the sender's BLS share over the canonical
/// multi-signature value.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub inst_id: usize,
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    /// base58 compressed G2 share.
    pub bls_sig_share: Option<String>,
}

/// Periodic digest of a replica's ordered prefix; stable once `n - f`
/// matching ones are observed.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub inst_id: usize,
    pub view_no: ViewNo,
    pub seq_no_start: SeqNo,
    pub seq_no_end: SeqNo,
    pub digest: Digest,
}

/// Identifies one batch inside view-change evidence.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
}

/// A replica's vote to replace the primary, carrying everything the
/// new primary needs to preserve ordered history.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ViewChange {
    pub view_no: ViewNo,
    pub stable_checkpoint: SeqNo,
    pub prepared: Vec<BatchId>,
    pub preprepared: Vec<BatchId>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Confirms receipt of a specific ViewChange by digest, addressed to
/// the new view's primary.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ViewChangeAck {
    pub view_no: ViewNo,
    pub name: NodeId,
    /// `view_change_digest` of the acknowledged message.
    pub digest: String,
}

/// The new primary's binding evidence: the certificate of ViewChanges
/// it collected, the selected stable checkpoint and the deterministic
/// list of batches to re-order.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewView {
    pub view_no: ViewNo,
    /// `(sender, view_change_digest)` per certified contributor.
    pub view_changes: Vec<(NodeId, String)>,
    pub checkpoint: Checkpoint,
    pub batches: Vec<BatchId>,
}

/// Advisory proposal to change views, published when the monitor
/// detects master degradation or a primary goes silent.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceChange {
    pub view_no: ViewNo,
    pub reason: String,
}

/// A replica's summary of one ledger, exchanged to detect lag.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub ledger_id: LedgerId,
    pub txn_seq_no: u64,
    pub view_no: Option<ViewNo>,
    pub pp_seq_no: Option<SeqNo>,
    pub merkle_root: Digest,
}

/// Proves that a peer's smaller ledger is a prefix of the sender's.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyProof {
    pub ledger_id: LedgerId,
    pub seq_no_start: u64,
    pub seq_no_end: u64,
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    pub old_merkle_root: Digest,
    pub new_merkle_root: Digest,
    pub hashes: Vec<Digest>,
}

/// Request for a range of transactions during catch-up.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CatchupReq {
    pub ledger_id: LedgerId,
    pub seq_no_start: u64,
    pub seq_no_end: u64,
    pub catchup_till: u64,
}

/// Reply carrying a contiguous run of transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchupRep {
    pub ledger_id: LedgerId,
    /// `(seq_no, canonical transaction)` pairs in ascending order.
    pub txns: Vec<(u64, serde_json::Value)>,
    pub cons_proof: Vec<Digest>,
}

/// Everything a replica may receive from a peer, routed by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Message {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    ViewChangeAck(ViewChangeAck),
    NewView(NewView),
    InstanceChange(InstanceChange),
    LedgerStatus(LedgerStatus),
    ConsistencyProof(ConsistencyProof),
    CatchupReq(CatchupReq),
    CatchupRep(CatchupRep),
}

/// Where an outbound message is headed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Target {
    Broadcast,
    Node(NodeId),
}

/// An addressed outbound message, handed to the transport layer.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: Target,
    pub message: Message,
}

impl Envelope {
    pub fn broadcast(message: Message) -> Self {
        Self { to: Target::Broadcast, message }
    }

    pub fn to_node(to: NodeId, message: Message) -> Self {
        Self { to: Target::Node(to), message }
    }
}

/// Serializes `value` into the canonical wire form.
///
/// `serde_json` maps are BTree-backed, so object keys come out
/// sorted; routing every value through `serde_json::Value` first
/// erases struct field declaration order as well.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)
        .or_fault(ErrorKind::InputMalformed, "value does not canonicalize")?;
    serde_json::to_vec(&value).or_fault(ErrorKind::InputMalformed, "canonical encoding failed")
}

/// Parses a canonical payload into a `Message`.
pub fn decode_message(raw: &[u8]) -> Result<Message> {
    serde_json::from_slice(raw).or_fault(ErrorKind::InputMalformed, "unparseable message")
}

/// The 256-bit lowercase-hex digest identifying a ViewChange inside
/// acks and NewView certificates.
pub fn view_change_digest(vc: &ViewChange) -> Result<String> {
    Ok(Digest::of(&canonical_bytes(vc)?).to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint(view_no: u64) -> Checkpoint {
        Checkpoint {
            inst_id: 0,
            view_no: ViewNo::from(view_no),
            seq_no_start: SeqNo::ZERO,
            seq_no_end: SeqNo::from(4),
            digest: Digest::of(b"some"),
        }
    }

    fn sample_view_change(view_no: u64) -> ViewChange {
        ViewChange {
            view_no: ViewNo::from(view_no),
            stable_checkpoint: SeqNo::from(4),
            prepared: vec![],
            preprepared: vec![],
            checkpoints: vec![sample_checkpoint(view_no)],
        }
    }

    #[test]
    fn canonical_form_is_stable_and_compact() {
        let msg = Message::Prepare(Prepare {
            inst_id: 0,
            view_no: ViewNo::from(1),
            pp_seq_no: SeqNo::from(8),
            digest: Digest::of(b"d"),
            state_root: Digest::of(b"s"),
            txn_root: Digest::of(b"t"),
        });
        let a = canonical_bytes(&msg).unwrap();
        let b = canonical_bytes(&msg).unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a.clone()).unwrap();
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
        // keys come out sorted
        assert!(text.find("\"digest\"").unwrap() < text.find("\"inst_id\"").unwrap());
        assert_eq!(decode_message(&a).unwrap(), msg);
    }

    #[test]
    fn view_change_digest_is_256_bit_hexdigest() {
        let digest = view_change_digest(&sample_view_change(3)).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_view_change_messages_have_different_digests() {
        let a = view_change_digest(&sample_view_change(3)).unwrap();
        let b = view_change_digest(&sample_view_change(4)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn request_digest_ignores_signatures() {
        let mut req = Request {
            identifier: "client1".into(),
            req_id: 77,
            ledger_id: LedgerId::DOMAIN,
            operation: serde_json::json!({"type": "nym", "dest": "abc"}),
            signatures: BTreeMap::new(),
        };
        let before = req.digest().unwrap();
        req.signatures.insert("client1".into(), "sig".into());
        assert_eq!(req.digest().unwrap(), before);
    }

    #[test]
    fn batch_digest_ignores_attached_multi_sigs() {
        let pp = PrePrepare {
            inst_id: 0,
            view_no: ViewNo::from(0),
            pp_seq_no: SeqNo::ONE,
            pp_time: 1_499_906_903,
            ledger_id: LedgerId::DOMAIN,
            req_idr: vec![("client1".into(), 1)],
            digest: Digest::blank(),
            state_root: Digest::of(b"state"),
            txn_root: Digest::of(b"txn"),
            sub_seq_no: 0,
            is_final: true,
            audit_txn_root: None,
            bls_multi_sig: None,
            bls_multi_sigs: vec![],
        };
        let digest = pp.batch_digest().unwrap();
        let with_sig = PrePrepare {
            digest,
            bls_multi_sigs: vec![BlsMultiSignature {
                signature: "sig".into(),
                participants: vec![NodeId::from("Alpha")],
                value: MultiSignatureValue {
                    ledger_id: LedgerId::DOMAIN,
                    state_root: Digest::of(b"state"),
                    pool_state_root: Digest::of(b"pool"),
                    txn_root: Digest::of(b"txn"),
                    timestamp: 1_499_906_903,
                },
            }],
            ..pp.clone()
        };
        assert_eq!(with_sig.batch_digest().unwrap(), digest);
    }

    #[test]
    fn freshness_batches_have_empty_req_idr() {
        let pp = PrePrepare {
            inst_id: 0,
            view_no: ViewNo::from(0),
            pp_seq_no: SeqNo::ONE,
            pp_time: 0,
            ledger_id: LedgerId::POOL,
            req_idr: vec![],
            digest: Digest::blank(),
            state_root: Digest::blank(),
            txn_root: Digest::blank(),
            sub_seq_no: 0,
            is_final: true,
            audit_txn_root: None,
            bls_multi_sig: None,
            bls_multi_sigs: vec![],
        };
        assert!(pp.is_freshness_batch());
    }
}
