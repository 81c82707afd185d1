//! Catch-up hand-off: the contract between the replica and the bulk
//! ledger fetcher.
//!
//! When `f + 1` peers report larger ledgers, the replica pauses
//! ordering and delegates to catch-up. The service asks peers for
//! consistency proofs and transaction ranges, verifies everything
//! against the advertised roots, and reports completion so the
//! replica can replay the 3PC history above its stable checkpoint
//! and resume. Every retry deadline it schedules is cancelled by
//! token the moment the round completes or is cancelled.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::crypto::Digest;
use crate::error::*;
use crate::ledger::merkle::verify_consistency;
use crate::ledger::Ledger;
use crate::messages::{
    canonical_bytes, CatchupRep, CatchupReq, ConsistencyProof, Envelope, LedgerStatus, Message,
};
use crate::ordering::{LedgerId, NodeId, SeqNo, ViewNo};
use crate::timeouts::{Instant, TimerKind, TimerService, TimerToken};
use crate::view::Quorums;

/// What one ledger still needs.
#[derive(Debug, Clone, Eq, PartialEq)]
enum LedgerPhase {
    /// Waiting for a consistency proof covering our prefix.
    AwaitingProof { target_size: u64, target_root: Digest },
    /// Fetching the missing transactions.
    Fetching { target_size: u64, target_root: Digest },
    Synced,
}

/// Reported back to the replica after each input.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CatchupEvent {
    Nil,
    /// The pool is ahead of us; ordering should pause and catch-up
    /// should start with these target sizes.
    Behind(BTreeMap<LedgerId, u64>),
    /// All ledgers match their targets; the replica replays 3PC
    /// history and resumes from `(view_no, pp_seq_no)`.
    CaughtUp { view_no: ViewNo, pp_seq_no: SeqNo },
}

/// Drives one catch-up round at a time.
pub struct CatchupService {
    node_id: NodeId,
    consistency_proofs_timeout: Duration,
    catchup_transactions_timeout: Duration,

    running: bool,
    ledgers: HashMap<LedgerId, LedgerPhase>,
    reask_tokens: Vec<TimerToken>,
    /// Peer-reported sizes per ledger, for lag detection.
    peer_sizes: HashMap<LedgerId, HashMap<NodeId, LedgerStatus>>,
    /// The newest 3PC point advertised by the peers we synced to.
    resume_point: (ViewNo, SeqNo),

    pub out_box: Vec<Envelope>,
}

impl CatchupService {
    pub fn new(
        node_id: NodeId,
        consistency_proofs_timeout: Duration,
        catchup_transactions_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            consistency_proofs_timeout,
            catchup_transactions_timeout,
            running: false,
            ledgers: HashMap::new(),
            reask_tokens: Vec::new(),
            peer_sizes: HashMap::new(),
            resume_point: (ViewNo::ZERO, SeqNo::ZERO),
            out_box: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Accumulates a peer's LedgerStatus; once a weak quorum agrees
    /// some ledger is longer than ours, reports `Behind`.
    pub fn process_ledger_status(
        &mut self,
        status: LedgerStatus,
        from: NodeId,
        own_sizes: &BTreeMap<LedgerId, u64>,
        quorums: Quorums,
    ) -> CatchupEvent {
        if let (Some(view_no), Some(pp_seq_no)) = (status.view_no, status.pp_seq_no) {
            if (view_no, pp_seq_no) > self.resume_point {
                self.resume_point = (view_no, pp_seq_no);
            }
        }
        self.peer_sizes.entry(status.ledger_id).or_default().insert(from, status);
        if self.running {
            return CatchupEvent::Nil;
        }

        let mut targets = BTreeMap::new();
        for (ledger_id, own_size) in own_sizes {
            let ahead: Vec<u64> = self
                .peer_sizes
                .get(ledger_id)
                .map(|per_peer| {
                    per_peer.values().map(|s| s.txn_seq_no).filter(|size| size > own_size).collect()
                })
                .unwrap_or_default();
            if ahead.len() >= quorums.weak() {
                // the weak quorum's agreed floor is a safe target
                if let Some(target) = ahead.iter().min().copied() {
                    targets.insert(*ledger_id, target);
                }
            }
        }
        if targets.is_empty() {
            CatchupEvent::Nil
        } else {
            CatchupEvent::Behind(targets)
        }
    }

    /// Starts a round toward `target_sizes`: sends our LedgerStatus
    /// for every lagging ledger and schedules the cancellable reask
    /// deadlines.
    pub fn start(
        &mut self,
        target_sizes: &BTreeMap<LedgerId, u64>,
        own: &HashMap<LedgerId, Ledger>,
        timers: &mut TimerService,
        now: Instant,
    ) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        self.ledgers.clear();
        info!(node = %self.node_id, ?target_sizes, "catch-up started");
        for (ledger_id, target_size) in target_sizes {
            let ledger = own
                .get(ledger_id)
                .ok_or_else(|| Error::new(ErrorKind::Fatal, "unknown ledger in catch-up"))?;
            let target_root = self.agreed_root(*ledger_id, *target_size);
            self.ledgers.insert(
                *ledger_id,
                LedgerPhase::AwaitingProof {
                    target_size: *target_size,
                    target_root: target_root.unwrap_or_else(Digest::blank),
                },
            );
            self.out_box.push(Envelope::broadcast(Message::LedgerStatus(LedgerStatus {
                ledger_id: *ledger_id,
                txn_seq_no: ledger.committed_size(),
                view_no: None,
                pp_seq_no: None,
                merkle_root: ledger.root_hash(),
            })));
            self.reask_tokens.push(timers.schedule(
                now,
                self.consistency_proofs_timeout,
                TimerKind::ReaskLedgerStatus { ledger_id: *ledger_id },
            ));
            self.reask_tokens.push(timers.schedule(
                now,
                self.catchup_transactions_timeout,
                TimerKind::ReaskConsistencyProof { ledger_id: *ledger_id },
            ));
        }
        Ok(())
    }

    /// The root the weak quorum advertised for a ledger at
    /// `target_size`, if any peer reported exactly that size.
    fn agreed_root(&self, ledger_id: LedgerId, target_size: u64) -> Option<Digest> {
        self.peer_sizes.get(&ledger_id).and_then(|per_peer| {
            per_peer
                .values()
                .find(|s| s.txn_seq_no == target_size)
                .map(|s| s.merkle_root)
        })
    }

    /// Verifies that our committed prefix is consistent with the
    /// peer's larger ledger, then requests the missing range.
    pub fn process_consistency_proof(
        &mut self,
        proof: ConsistencyProof,
        from: NodeId,
        own: &HashMap<LedgerId, Ledger>,
    ) -> Result<CatchupEvent> {
        if !self.running {
            return Ok(CatchupEvent::Nil);
        }
        let phase = match self.ledgers.get(&proof.ledger_id) {
            Some(LedgerPhase::AwaitingProof { target_size, target_root }) => {
                (*target_size, *target_root)
            }
            _ => return Ok(CatchupEvent::Nil),
        };
        let (target_size, _) = phase;
        let ledger = own
            .get(&proof.ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "unknown ledger in catch-up"))?;

        if proof.seq_no_start != ledger.committed_size()
            || proof.old_merkle_root != ledger.root_hash()
        {
            return Ok(CatchupEvent::Nil);
        }
        if !verify_consistency(
            proof.seq_no_start,
            proof.seq_no_end,
            &proof.old_merkle_root,
            &proof.new_merkle_root,
            &proof.hashes,
        ) {
            warn!(node = %from, ledger = ?proof.ledger_id, "consistency proof does not verify");
            return Err(Error::new(ErrorKind::ProofInvalid, "consistency proof does not verify"));
        }
        if (proof.view_no, proof.pp_seq_no) > self.resume_point {
            self.resume_point = (proof.view_no, proof.pp_seq_no);
        }

        debug!(ledger = ?proof.ledger_id, from_size = proof.seq_no_start,
               to_size = proof.seq_no_end, "consistency proof accepted");
        self.ledgers.insert(
            proof.ledger_id,
            LedgerPhase::Fetching {
                target_size,
                target_root: proof.new_merkle_root,
            },
        );
        self.out_box.push(Envelope::to_node(
            from,
            Message::CatchupReq(CatchupReq {
                ledger_id: proof.ledger_id,
                seq_no_start: ledger.committed_size() + 1,
                seq_no_end: target_size,
                catchup_till: target_size,
            }),
        ));
        Ok(CatchupEvent::Nil)
    }

    /// Serves a peer's CatchupReq from our committed prefix.
    pub fn serve_catchup_req(
        &mut self,
        req: &CatchupReq,
        from: NodeId,
        own: &HashMap<LedgerId, Ledger>,
    ) -> Result<()> {
        let ledger = match own.get(&req.ledger_id) {
            Some(ledger) => ledger,
            None => return Ok(()),
        };
        let end = req.seq_no_end.min(ledger.committed_size());
        let mut txns = Vec::new();
        for seq_no in req.seq_no_start..=end {
            if let Some(raw) = ledger.get(seq_no) {
                let value = serde_json::from_slice(raw)
                    .or_fault(ErrorKind::Fatal, "stored txn is not canonical")?;
                txns.push((seq_no, value));
            }
        }
        let cons_proof = ledger.consistency_proof(req.seq_no_start.saturating_sub(1), end)?;
        self.out_box.push(Envelope::to_node(
            from,
            Message::CatchupRep(CatchupRep { ledger_id: req.ledger_id, txns, cons_proof }),
        ));
        Ok(())
    }

    /// Applies a contiguous reply; completion of the last ledger
    /// finishes the round and cancels every reask deadline.
    pub fn process_catchup_rep(
        &mut self,
        rep: CatchupRep,
        own: &mut HashMap<LedgerId, Ledger>,
        timers: &mut TimerService,
    ) -> Result<CatchupEvent> {
        if !self.running {
            return Ok(CatchupEvent::Nil);
        }
        let (target_size, target_root) = match self.ledgers.get(&rep.ledger_id) {
            Some(LedgerPhase::Fetching { target_size, target_root }) => {
                (*target_size, *target_root)
            }
            _ => return Ok(CatchupEvent::Nil),
        };
        let ledger = own
            .get_mut(&rep.ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "unknown ledger in catch-up"))?;

        for (seq_no, txn) in &rep.txns {
            if *seq_no != ledger.size() + 1 {
                continue; // out-of-order entry; wait for the gap
            }
            if *seq_no > target_size {
                break;
            }
            ledger.append(&canonical_bytes(txn)?)?;
        }

        if ledger.size() < target_size {
            return Ok(CatchupEvent::Nil);
        }
        // the fetched suffix must reproduce the advertised root
        if ledger.root_at(target_size)? != target_root {
            ledger.discard_uncommitted()?;
            return Err(Error::new(
                ErrorKind::ProofInvalid,
                "caught-up ledger does not match the advertised root",
            ));
        }
        ledger.commit_to(target_size)?;
        self.ledgers.insert(rep.ledger_id, LedgerPhase::Synced);
        info!(ledger = ?rep.ledger_id, size = target_size, "ledger caught up");

        if self.ledgers.values().all(|phase| *phase == LedgerPhase::Synced) {
            self.finish(timers);
            let (view_no, pp_seq_no) = self.resume_point;
            return Ok(CatchupEvent::CaughtUp { view_no, pp_seq_no });
        }
        Ok(CatchupEvent::Nil)
    }

    fn finish(&mut self, timers: &mut TimerService) {
        for token in self.reask_tokens.drain(..) {
            timers.cancel(token);
        }
        self.running = false;
        self.ledgers.clear();
        info!("catch-up complete, ordering resumes");
    }

    /// Aborts the round, cancelling every reask deadline.
    pub fn cancel(&mut self, timers: &mut TimerService) {
        if self.running {
            self.finish(timers);
        }
    }

    /// Our own status answer for a peer's LedgerStatus probe.
    pub fn own_status(
        ledger_id: LedgerId,
        ledger: &Ledger,
        last_3pc: (ViewNo, SeqNo),
    ) -> LedgerStatus {
        LedgerStatus {
            ledger_id,
            txn_seq_no: ledger.committed_size(),
            view_no: Some(last_3pc.0),
            pp_seq_no: Some(last_3pc.1),
            merkle_root: ledger.root_hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: usize) -> NodeId {
        NodeId::new(format!("Node{}", i))
    }

    fn service() -> CatchupService {
        CatchupService::new(node(1), Duration::from_secs(5), Duration::from_secs(6))
    }

    fn ledger_with(dir: &std::path::Path, name: &str, n: u64) -> Ledger {
        let mut ledger = Ledger::open(dir.join(name), false).unwrap();
        for i in 0..n {
            ledger
                .append(&canonical_bytes(&serde_json::json!({"seq": i, "op": "nym"})).unwrap())
                .unwrap();
        }
        ledger.commit_to(n).unwrap();
        ledger
    }

    fn status_for(ledger: &Ledger, ledger_id: LedgerId, seq: u64) -> LedgerStatus {
        LedgerStatus {
            ledger_id,
            txn_seq_no: ledger.committed_size(),
            view_no: Some(ViewNo::ZERO),
            pp_seq_no: Some(SeqNo::from(seq)),
            merkle_root: ledger.root_hash(),
        }
    }

    #[test]
    fn lag_is_detected_only_with_a_weak_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let ahead = ledger_with(dir.path(), "peer", 10);
        let mut svc = service();
        let quorums = Quorums::new(4).unwrap();
        let own_sizes: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 8u64)].into();

        let event = svc.process_ledger_status(
            status_for(&ahead, LedgerId::DOMAIN, 10),
            node(2),
            &own_sizes,
            quorums,
        );
        assert_eq!(event, CatchupEvent::Nil, "one peer is not a quorum");

        let event = svc.process_ledger_status(
            status_for(&ahead, LedgerId::DOMAIN, 10),
            node(3),
            &own_sizes,
            quorums,
        );
        assert_eq!(event, CatchupEvent::Behind([(LedgerId::DOMAIN, 10u64)].into()));
    }

    #[test]
    fn full_round_catches_up_and_cancels_reask_timers() {
        let dir = tempfile::tempdir().unwrap();
        let peer_ledger = ledger_with(dir.path(), "peer", 10);
        let mut own: HashMap<LedgerId, Ledger> =
            [(LedgerId::DOMAIN, ledger_with(dir.path(), "own", 8))].into();

        let mut svc = service();
        let mut timers = TimerService::new();
        let quorums = Quorums::new(4).unwrap();
        let own_sizes: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 8u64)].into();

        for peer in [2, 3] {
            svc.process_ledger_status(
                status_for(&peer_ledger, LedgerId::DOMAIN, 10),
                node(peer),
                &own_sizes,
                quorums,
            );
        }
        let targets: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 10u64)].into();
        svc.start(&targets, &own, &mut timers, 0).unwrap();
        assert!(svc.is_running());
        assert!(timers.has_pending(|k| matches!(k, TimerKind::ReaskLedgerStatus { .. })));

        // a peer answers with a consistency proof over 8 -> 10
        let proof = ConsistencyProof {
            ledger_id: LedgerId::DOMAIN,
            seq_no_start: 8,
            seq_no_end: 10,
            view_no: ViewNo::ZERO,
            pp_seq_no: SeqNo::from(10),
            old_merkle_root: own[&LedgerId::DOMAIN].root_hash(),
            new_merkle_root: peer_ledger.root_hash(),
            hashes: peer_ledger.consistency_proof(8, 10).unwrap(),
        };
        svc.process_consistency_proof(proof, node(2), &own).unwrap();
        let reqs: Vec<_> = svc
            .out_box
            .iter()
            .filter_map(|e| match &e.message {
                Message::CatchupReq(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].seq_no_start, 9);
        assert_eq!(reqs[0].seq_no_end, 10);

        // and serves the transactions
        let mut txns = Vec::new();
        for seq_no in 9..=10u64 {
            txns.push((
                seq_no,
                serde_json::from_slice(peer_ledger.get(seq_no).unwrap()).unwrap(),
            ));
        }
        let rep = CatchupRep { ledger_id: LedgerId::DOMAIN, txns, cons_proof: vec![] };
        let event = svc.process_catchup_rep(rep, &mut own, &mut timers).unwrap();

        assert_eq!(
            event,
            CatchupEvent::CaughtUp { view_no: ViewNo::ZERO, pp_seq_no: SeqNo::from(10) }
        );
        assert!(!svc.is_running());
        assert_eq!(own[&LedgerId::DOMAIN].committed_size(), 10);
        assert_eq!(own[&LedgerId::DOMAIN].root_hash(), peer_ledger.root_hash());
        // scenario: after catch-up, no reask deadline stays scheduled
        assert!(!timers.has_pending(|k| matches!(
            k,
            TimerKind::ReaskLedgerStatus { .. } | TimerKind::ReaskConsistencyProof { .. }
        )));
    }

    #[test]
    fn forged_catchup_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let peer_ledger = ledger_with(dir.path(), "peer", 10);
        let mut own: HashMap<LedgerId, Ledger> =
            [(LedgerId::DOMAIN, ledger_with(dir.path(), "own", 8))].into();

        let mut svc = service();
        let mut timers = TimerService::new();
        let targets: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 10u64)].into();
        svc.peer_sizes
            .entry(LedgerId::DOMAIN)
            .or_default()
            .insert(node(2), status_for(&peer_ledger, LedgerId::DOMAIN, 10));
        svc.start(&targets, &own, &mut timers, 0).unwrap();

        let proof = ConsistencyProof {
            ledger_id: LedgerId::DOMAIN,
            seq_no_start: 8,
            seq_no_end: 10,
            view_no: ViewNo::ZERO,
            pp_seq_no: SeqNo::from(10),
            old_merkle_root: own[&LedgerId::DOMAIN].root_hash(),
            new_merkle_root: peer_ledger.root_hash(),
            hashes: peer_ledger.consistency_proof(8, 10).unwrap(),
        };
        svc.process_consistency_proof(proof, node(2), &own).unwrap();

        let txns = vec![
            (9u64, serde_json::json!({"seq": 999, "op": "forged"})),
            (10u64, serde_json::json!({"seq": 1000, "op": "forged"})),
        ];
        let rep = CatchupRep { ledger_id: LedgerId::DOMAIN, txns, cons_proof: vec![] };
        let err = svc.process_catchup_rep(rep, &mut own, &mut timers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProofInvalid);
        assert_eq!(own[&LedgerId::DOMAIN].committed_size(), 8);
    }

    #[test]
    fn cancel_clears_every_reask_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let own: HashMap<LedgerId, Ledger> =
            [(LedgerId::DOMAIN, ledger_with(dir.path(), "own", 3))].into();
        let mut svc = service();
        let mut timers = TimerService::new();
        let targets: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 9u64)].into();
        svc.start(&targets, &own, &mut timers, 0).unwrap();
        assert!(timers.has_pending(|_| true));

        svc.cancel(&mut timers);
        assert!(!svc.is_running());
        assert!(!timers.has_pending(|_| true));
    }

    #[test]
    fn bad_consistency_proof_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let peer_ledger = ledger_with(dir.path(), "peer", 10);
        let own: HashMap<LedgerId, Ledger> =
            [(LedgerId::DOMAIN, ledger_with(dir.path(), "own", 8))].into();
        let mut svc = service();
        let mut timers = TimerService::new();
        let targets: BTreeMap<LedgerId, u64> = [(LedgerId::DOMAIN, 10u64)].into();
        svc.start(&targets, &own, &mut timers, 0).unwrap();

        let proof = ConsistencyProof {
            ledger_id: LedgerId::DOMAIN,
            seq_no_start: 8,
            seq_no_end: 10,
            view_no: ViewNo::ZERO,
            pp_seq_no: SeqNo::from(10),
            old_merkle_root: own[&LedgerId::DOMAIN].root_hash(),
            new_merkle_root: peer_ledger.root_hash(),
            hashes: vec![Digest::of(b"junk"), Digest::of(b"junk2")],
        };
        let err = svc.process_consistency_proof(proof, node(2), &own).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProofInvalid);
    }
}
