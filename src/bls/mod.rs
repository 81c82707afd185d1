//! Per-ledger BLS signature aggregation.
//!
//! Each replica signs the canonical `MultiSignatureValue` of a batch
//! with its BLS key and ships the share inside its Commit. The
//! aggregator collects shares keyed by `(view_no, pp_seq_no,
//! ledger_id)` and forms a multi-signature once a strong quorum of
//! them agrees. Verification always consults the pool key register,
//! which reflects the *uncommitted* pool ledger so a just-added
//! validator's key is usable immediately.

use std::collections::HashMap;

use blst::min_pk::{AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use tracing::{debug, warn};

use crate::error::*;
use crate::messages::{BlsMultiSignature, MultiSignatureValue};
use crate::ordering::{LedgerId, NodeId, SeqNo, ViewNo};
use crate::view::Quorums;

/// Domain separation tag for all pool signatures.
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// A replica's BLS signing key.
pub struct BlsSigner {
    secret: SecretKey,
    public_b58: String,
}

impl BlsSigner {
    /// Derives a keypair from seed material; at least 32 bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let secret = SecretKey::key_gen(seed, &[])
            .map_err(|e| Error::new(ErrorKind::InputMalformed, format!("{:?}", e)))?;
        let public_b58 = bs58::encode(secret.sk_to_pk().to_bytes()).into_string();
        Ok(Self { secret, public_b58 })
    }

    pub fn public_key(&self) -> &str {
        &self.public_b58
    }

    /// Signs `message`, returning the base58 compressed share.
    pub fn sign(&self, message: &[u8]) -> String {
        let sig = self.secret.sign(message, BLS_DST, &[]);
        bs58::encode(sig.to_bytes()).into_string()
    }
}

/// Maps each validator to its current BLS public key.
///
/// Updated by the single writer whenever a pool transaction is
/// applied to the uncommitted pool state.
#[derive(Debug, Clone, Default)]
pub struct BlsKeyRegister {
    keys: HashMap<NodeId, String>,
}

impl BlsKeyRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_key(&mut self, node: NodeId, public_b58: impl Into<String>) {
        self.keys.insert(node, public_b58.into());
    }

    pub fn remove_key(&mut self, node: &NodeId) {
        self.keys.remove(node);
    }

    pub fn key_of(&self, node: &NodeId) -> Option<&str> {
        self.keys.get(node).map(|s| s.as_str())
    }
}

fn decode_public_key(b58: &str) -> Result<PublicKey> {
    let raw = bs58::decode(b58)
        .into_vec()
        .or_fault(ErrorKind::ProofInvalid, "public key is not base58")?;
    PublicKey::from_bytes(&raw)
        .map_err(|e| Error::new(ErrorKind::ProofInvalid, format!("{:?}", e)))
}

fn decode_signature(b58: &str) -> Result<Signature> {
    let raw = bs58::decode(b58)
        .into_vec()
        .or_fault(ErrorKind::ProofInvalid, "signature is not base58")?;
    Signature::from_bytes(&raw)
        .map_err(|e| Error::new(ErrorKind::ProofInvalid, format!("{:?}", e)))
}

/// Verifies a single share against one registered key.
pub fn verify_share(
    register: &BlsKeyRegister,
    node: &NodeId,
    message: &[u8],
    share_b58: &str,
) -> bool {
    let key = match register.key_of(node) {
        Some(key) => key,
        None => return false,
    };
    let (pk, sig) = match (decode_public_key(key), decode_signature(share_b58)) {
        (Ok(pk), Ok(sig)) => (pk, sig),
        _ => return false,
    };
    sig.verify(true, message, BLS_DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

/// Verifies an aggregate signature against the registered keys of its
/// participants; the participant set must itself be a strong quorum.
pub fn verify_multi_sig(
    register: &BlsKeyRegister,
    multi_sig: &BlsMultiSignature,
    quorums: Quorums,
) -> bool {
    if multi_sig.participants.len() < quorums.strong() {
        return false;
    }
    let message = match multi_sig.value.signable_bytes() {
        Ok(m) => m,
        Err(_) => return false,
    };
    let mut keys = Vec::with_capacity(multi_sig.participants.len());
    for node in &multi_sig.participants {
        let key = match register.key_of(node) {
            Some(key) => key,
            None => return false,
        };
        match decode_public_key(key) {
            Ok(pk) => keys.push(pk),
            Err(_) => return false,
        }
    }
    let sig = match decode_signature(&multi_sig.signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let key_refs: Vec<&PublicKey> = keys.iter().collect();
    sig.fast_aggregate_verify(true, &message, BLS_DST, &key_refs) == BLST_ERROR::BLST_SUCCESS
}

/// Aggregates validated shares into one signature.
pub fn create_multi_sig(shares: &[&str]) -> Result<String> {
    let mut sigs = Vec::with_capacity(shares.len());
    for share in shares {
        sigs.push(decode_signature(share)?);
    }
    let sig_refs: Vec<&Signature> = sigs.iter().collect();
    let aggregate = AggregateSignature::aggregate(&sig_refs, true)
        .map_err(|e| Error::new(ErrorKind::ProofInvalid, format!("{:?}", e)))?;
    Ok(bs58::encode(aggregate.to_signature().to_bytes()).into_string())
}

type ShareKey = (ViewNo, SeqNo, LedgerId);

/// Collects shares per batch and hands finished multi-signatures to
/// the ordering service.
pub struct BlsAggregator {
    signer: Option<BlsSigner>,
    shares: HashMap<ShareKey, HashMap<NodeId, String>>,
    values: HashMap<ShareKey, MultiSignatureValue>,
    /// Per ledger, the newest completed multi-signature, attached to
    /// the next PrePrepare.
    latest: HashMap<LedgerId, BlsMultiSignature>,
}

impl BlsAggregator {
    pub fn new(signer: Option<BlsSigner>) -> Self {
        Self {
            signer,
            shares: HashMap::new(),
            values: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    /// The share this replica contributes for a batch, if it has a
    /// signing key.
    pub fn sign_value(&self, value: &MultiSignatureValue) -> Result<Option<String>> {
        match &self.signer {
            Some(signer) => Ok(Some(signer.sign(&value.signable_bytes()?))),
            None => Ok(None),
        }
    }

    /// Remembers the canonical value a batch's shares must sign.
    pub fn track_value(&mut self, view_no: ViewNo, pp_seq_no: SeqNo, value: MultiSignatureValue) {
        let key = (view_no, pp_seq_no, value.ledger_id);
        self.values.insert(key, value);
    }

    pub fn value_of(
        &self,
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        ledger_id: LedgerId,
    ) -> Option<&MultiSignatureValue> {
        self.values.get(&(view_no, pp_seq_no, ledger_id))
    }

    /// Validates and stores a Commit's share. An invalid share is
    /// dropped without affecting the carrying Commit's vote.
    pub fn add_share(
        &mut self,
        register: &BlsKeyRegister,
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        ledger_id: LedgerId,
        from: NodeId,
        share_b58: &str,
    ) -> Result<()> {
        let key = (view_no, pp_seq_no, ledger_id);
        let value = self
            .values
            .get(&key)
            .ok_or_else(|| Error::new(ErrorKind::ProofInvalid, "share for unknown batch"))?;
        let message = value.signable_bytes()?;
        if !verify_share(register, &from, &message, share_b58) {
            warn!(%from, view = %view_no, seq = %pp_seq_no, "commit carries a wrong bls share");
            return Err(Error::new(ErrorKind::ProofInvalid, "bls share does not verify"));
        }
        self.shares.entry(key).or_default().insert(from, share_b58.to_owned());
        Ok(())
    }

    /// Once a strong quorum of shares agrees, builds the aggregate,
    /// records it as the ledger's latest and returns it.
    pub fn try_aggregate(
        &mut self,
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        ledger_id: LedgerId,
        quorums: Quorums,
    ) -> Result<Option<BlsMultiSignature>> {
        let key = (view_no, pp_seq_no, ledger_id);
        let collected = match self.shares.get(&key) {
            Some(collected) if collected.len() >= quorums.strong() => collected,
            _ => return Ok(None),
        };
        let value = self
            .values
            .get(&key)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "shares without a tracked value"))?
            .clone();

        let mut participants: Vec<NodeId> = collected.keys().cloned().collect();
        participants.sort();
        let shares: Vec<&str> = participants
            .iter()
            .filter_map(|node| collected.get(node).map(|s| s.as_str()))
            .collect();
        let signature = create_multi_sig(&shares)?;
        let multi_sig = BlsMultiSignature { signature, participants, value };
        debug!(ledger = ?ledger_id, view = %view_no, seq = %pp_seq_no, "bls multi-signature formed");
        self.latest.insert(ledger_id, multi_sig.clone());
        Ok(Some(multi_sig))
    }

    /// The newest multi-signature per ledger, in ledger order.
    pub fn latest_multi_sigs(&self) -> Vec<BlsMultiSignature> {
        let mut sigs: Vec<_> = self.latest.values().cloned().collect();
        sigs.sort_by_key(|ms| ms.value.ledger_id);
        sigs
    }

    pub fn latest_for(&self, ledger_id: LedgerId) -> Option<&BlsMultiSignature> {
        self.latest.get(&ledger_id)
    }

    /// Drops shares and values for batches at or below the stable
    /// checkpoint.
    pub fn gc_below(&mut self, view_no: ViewNo, pp_seq_no: SeqNo) {
        let superseded =
            |v: ViewNo, s: SeqNo| v < view_no || (v == view_no && s <= pp_seq_no);
        self.shares.retain(|(v, s, _), _| !superseded(*v, *s));
        self.values.retain(|(v, s, _), _| !superseded(*v, *s));
    }
}
