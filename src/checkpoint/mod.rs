//! Stable checkpoints and the watermark window they anchor.
//!
//! Every `chk_freq` ordered batches a replica emits a Checkpoint
//! summarizing its ordered prefix. A checkpoint becomes *stable* once
//! a strong quorum of matching ones is observed; the stable
//! checkpoint advances the low watermark, and everything keyed by a
//! superseded `(view_no, pp_seq_no)` is garbage collected.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};

use crate::crypto::Digest;
use crate::messages::Checkpoint;
use crate::ordering::{NodeId, SeqNo, ViewNo};
use crate::view::Quorums;

/// Tracks own and peer checkpoints for one replica instance.
pub struct CheckpointService {
    inst_id: usize,
    chk_freq: u64,
    log_size: u64,
    stable: SeqNo,
    /// Own checkpoints not yet superseded, by end sequence.
    own: BTreeMap<SeqNo, Checkpoint>,
    /// Peer votes per `(seq_no_end, digest)`.
    received: HashMap<(SeqNo, Digest), HashSet<NodeId>>,
}

impl CheckpointService {
    pub fn new(inst_id: usize, chk_freq: u64, log_size: u64) -> Self {
        Self {
            inst_id,
            chk_freq,
            log_size,
            stable: SeqNo::ZERO,
            own: BTreeMap::new(),
            received: HashMap::new(),
        }
    }

    /// Low watermark: the stable checkpoint sequence.
    pub fn low_watermark(&self) -> SeqNo {
        self.stable
    }

    /// High watermark: `log_size` sequence numbers above the stable
    /// checkpoint.
    pub fn high_watermark(&self) -> SeqNo {
        SeqNo::from(u64::from(self.stable) + self.log_size)
    }

    /// Whether a batch sequence number falls inside the watermark
    /// window `(low, high]`.
    pub fn in_watermarks(&self, pp_seq_no: SeqNo) -> bool {
        pp_seq_no.index(self.stable, self.log_size).is_right()
    }

    pub fn stable_seq(&self) -> SeqNo {
        self.stable
    }

    /// Called after each ordered batch; returns the Checkpoint to
    /// broadcast when a checkpoint boundary is crossed.
    ///
    /// `summary` digests the ordered prefix (the audit ledger root in
    /// practice), so matching digests imply matching histories.
    pub fn on_batch_ordered(
        &mut self,
        own_id: &NodeId,
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        summary: Digest,
    ) -> Option<Checkpoint> {
        let seq = u64::from(pp_seq_no);
        if seq == 0 || seq % self.chk_freq != 0 {
            return None;
        }
        let checkpoint = Checkpoint {
            inst_id: self.inst_id,
            view_no,
            seq_no_start: self.stable,
            seq_no_end: pp_seq_no,
            digest: summary,
        };
        self.own.insert(pp_seq_no, checkpoint.clone());
        // our own vote counts toward stability
        self.received
            .entry((pp_seq_no, summary))
            .or_default()
            .insert(own_id.clone());
        debug!(seq = %pp_seq_no, "checkpoint emitted");
        Some(checkpoint)
    }

    /// Accumulates a peer's checkpoint; returns the new stable
    /// sequence if this vote made one stable.
    ///
    /// Stability is prefix-monotonic: a checkpoint below the current
    /// stable one can never become stable again.
    pub fn process_checkpoint(
        &mut self,
        from: NodeId,
        checkpoint: &Checkpoint,
        quorums: Quorums,
    ) -> Option<SeqNo> {
        if checkpoint.inst_id != self.inst_id || checkpoint.seq_no_end <= self.stable {
            return None;
        }
        let key = (checkpoint.seq_no_end, checkpoint.digest);
        let votes = self.received.entry(key).or_default();
        votes.insert(from);
        if votes.len() < quorums.strong() {
            return None;
        }
        self.mark_stable(checkpoint.seq_no_end);
        Some(self.stable)
    }

    fn mark_stable(&mut self, seq: SeqNo) {
        debug_assert!(seq > self.stable);
        self.stable = seq;
        self.own.retain(|end, _| *end >= seq);
        self.received.retain(|(end, _), _| *end > seq);
        info!(stable = %seq, "checkpoint stabilized");
    }

    /// Installs a stable checkpoint decided elsewhere (NewView or
    /// catch-up), skipping the quorum count.
    pub fn install_stable(&mut self, seq: SeqNo) {
        if seq > self.stable {
            self.mark_stable(seq);
        }
    }

    /// The own checkpoint covering the stable sequence, if still held.
    pub fn stable_checkpoint_message(&self) -> Option<&Checkpoint> {
        self.own.get(&self.stable)
    }

    /// Own checkpoints carried as evidence inside a ViewChange.
    pub fn own_checkpoints(&self) -> Vec<Checkpoint> {
        self.own.values().cloned().collect()
    }
}
