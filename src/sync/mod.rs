//! The view-change protocol: replacing a faulty primary while
//! preserving every batch the old view prepared.
//!
//! A node broadcasts a ViewChange carrying its stable checkpoint and
//! its prepared/preprepared history. Everyone else confirms receipt
//! to the new primary with a ViewChangeAck keyed by the message
//! digest. Once a strong quorum of ViewChanges is certified the new
//! primary derives the stable checkpoint and the deterministic batch
//! list, and broadcasts them in a NewView that every recipient
//! re-derives and checks for byte equality.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use tracing::{info, warn};

use crate::crypto::Digest;
use crate::error::*;
use crate::messages::{
    canonical_bytes, view_change_digest, BatchId, Checkpoint, Envelope, Message, NewView,
    Timestamp, ViewChange, ViewChangeAck,
};
use crate::ordering::{NodeId, SeqNo, ViewNo};
use crate::view::ViewInfo;

/// History snapshot the ordering service contributes to a ViewChange.
#[derive(Debug, Clone, Default)]
pub struct ViewChangeInput {
    pub stable_checkpoint: SeqNo,
    pub prepared: Vec<BatchId>,
    pub preprepared: Vec<BatchId>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Outcome of feeding a message into the service.
#[derive(Debug, Clone)]
pub enum SyncStatus {
    Nil,
    /// A NewView checked out; the replica installs it.
    NewViewAccepted(NewView),
    /// The primary's selection did not match the certificate; the
    /// next view change is due.
    NewViewMismatch(ViewNo),
}

/// Drives view changes for one replica.
pub struct ViewChangeService {
    node_id: NodeId,
    view: ViewInfo,
    view_change_window: Duration,
    stash_limit: usize,

    waiting_for_new_view: bool,
    /// Received ViewChanges per target view and sender.
    view_changes: HashMap<ViewNo, HashMap<NodeId, ViewChange>>,
    /// Ack senders per target view and `(author, digest)`.
    acks: HashMap<ViewNo, HashMap<(NodeId, String), HashSet<NodeId>>>,
    new_view_sent: HashSet<ViewNo>,
    last_sent_for_view: HashMap<ViewNo, Timestamp>,
    stashed: usize,

    pub out_box: VecDeque<Envelope>,
    /// Set when we, as the new primary, just broadcast a NewView; the
    /// replica installs it exactly like a received one.
    pub own_new_view: Option<NewView>,
}

impl ViewChangeService {
    pub fn new(
        node_id: NodeId,
        view: ViewInfo,
        view_change_window: Duration,
        stash_limit: usize,
    ) -> Self {
        Self {
            node_id,
            view,
            view_change_window,
            stash_limit,
            waiting_for_new_view: false,
            view_changes: HashMap::new(),
            acks: HashMap::new(),
            new_view_sent: HashSet::new(),
            last_sent_for_view: HashMap::new(),
            stashed: 0,
            out_box: VecDeque::new(),
            own_new_view: None,
        }
    }

    pub fn view(&self) -> &ViewInfo {
        &self.view
    }

    pub fn waiting_for_new_view(&self) -> bool {
        self.waiting_for_new_view
    }

    pub fn primary_name(&self) -> &NodeId {
        self.view.primary()
    }

    /// Moves to the next view and broadcasts our ViewChange; at most
    /// one per target view within the rate window.
    pub fn start_view_change(&mut self, input: ViewChangeInput, now: Timestamp) -> Result<()> {
        self.start_view_change_for(self.view.view_no().next(), input, now)
    }

    /// Targets an explicit view, used when NewView timers expire and
    /// the protocol escalates past a broken primary.
    pub fn start_view_change_for(
        &mut self,
        target: ViewNo,
        input: ViewChangeInput,
        now: Timestamp,
    ) -> Result<()> {
        if let Some(sent_at) = self.last_sent_for_view.get(&target) {
            if now.saturating_sub(*sent_at) < self.view_change_window.as_secs() {
                return Ok(());
            }
        }
        self.view = self.view.for_view(target);
        self.waiting_for_new_view = true;
        self.last_sent_for_view.insert(target, now);

        let view_change = ViewChange {
            view_no: target,
            stable_checkpoint: input.stable_checkpoint,
            prepared: input.prepared,
            preprepared: input.preprepared,
            checkpoints: input.checkpoints,
        };
        info!(view = %target, "view change started");
        // our own vote participates like anyone else's
        self.store_view_change(self.node_id.clone(), view_change.clone());
        self.out_box.push_back(Envelope::broadcast(Message::ViewChange(view_change)));
        self.try_send_new_view()?;
        Ok(())
    }

    fn store_view_change(&mut self, from: NodeId, view_change: ViewChange) {
        if self.stashed >= self.stash_limit {
            // bounded stash: evict the oldest target view wholesale
            if let Some(oldest) = self.view_changes.keys().min().copied() {
                warn!(view = %oldest, "view change stash overflow, evicting oldest view");
                if let Some(evicted) = self.view_changes.remove(&oldest) {
                    self.stashed -= evicted.len();
                }
                self.acks.remove(&oldest);
            }
        }
        let per_view = self.view_changes.entry(view_change.view_no).or_default();
        if per_view.insert(from, view_change).is_none() {
            self.stashed += 1;
        }
    }

    /// Handles a peer's ViewChange: store it, and unless we are the
    /// new primary (who already holds it) or its author, confirm it
    /// to the new primary with an ack.
    pub fn process_view_change(
        &mut self,
        view_change: ViewChange,
        from: NodeId,
    ) -> Result<SyncStatus> {
        if view_change.view_no <= self.view.view_no() && !self.waiting_for_new_view {
            return Ok(SyncStatus::Nil);
        }
        let digest = view_change_digest(&view_change)?;
        let target = view_change.view_no;
        self.store_view_change(from.clone(), view_change);

        let primary = self.view.validators().primary(target, 0).clone();
        if primary != self.node_id && from != self.node_id {
            let ack = ViewChangeAck { view_no: target, name: from, digest };
            self.out_box.push_back(Envelope::to_node(primary, Message::ViewChangeAck(ack)));
        }
        self.try_send_new_view()?;
        Ok(SyncStatus::Nil)
    }

    /// Accumulates an ack addressed to us as the new primary.
    pub fn process_view_change_ack(&mut self, ack: ViewChangeAck, from: NodeId) -> Result<()> {
        let primary = self.view.validators().primary(ack.view_no, 0);
        if *primary != self.node_id {
            return Ok(());
        }
        self.acks
            .entry(ack.view_no)
            .or_default()
            .entry((ack.name, ack.digest))
            .or_default()
            .insert(from);
        self.try_send_new_view()
    }

    /// A ViewChange is certified for the new primary when it is the
    /// primary's own, or when enough acks witness that its held copy
    /// is what the author actually sent.
    fn certified_view_changes(&self, target: ViewNo) -> Result<Vec<(NodeId, ViewChange)>> {
        let held = match self.view_changes.get(&target) {
            Some(held) => held,
            None => return Ok(Vec::new()),
        };
        let ack_quorum = self.view.quorums().view_change_ack();
        let acks = self.acks.get(&target);
        let mut certified = Vec::new();
        for (sender, view_change) in held {
            let digest = view_change_digest(view_change)?;
            let witnessed = acks
                .and_then(|a| a.get(&(sender.clone(), digest)))
                .map(|votes| votes.len() >= ack_quorum)
                .unwrap_or(false);
            if *sender == self.node_id || witnessed {
                certified.push((sender.clone(), view_change.clone()));
            }
        }
        certified.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(certified)
    }

    fn try_send_new_view(&mut self) -> Result<()> {
        let target = self.view.view_no();
        if !self.waiting_for_new_view
            || self.view.primary() != &self.node_id
            || self.new_view_sent.contains(&target)
        {
            return Ok(());
        }
        let certified = self.certified_view_changes(target)?;
        if certified.len() < self.view.quorums().strong() {
            return Ok(());
        }
        let votes: Vec<&ViewChange> = certified.iter().map(|(_, vc)| vc).collect();
        let checkpoint = match calc_checkpoint(&votes, self.view.quorums().weak()) {
            Some(checkpoint) => checkpoint,
            None => return Ok(()), // no agreed checkpoint yet
        };
        let batches = calc_batches(&checkpoint, &votes);
        let mut view_changes = Vec::new();
        for (sender, vc) in &certified {
            view_changes.push((sender.clone(), view_change_digest(vc)?));
        }
        let new_view = NewView { view_no: target, view_changes, checkpoint, batches };
        info!(view = %target, batches = new_view.batches.len(), "new view broadcast");
        self.new_view_sent.insert(target);
        self.waiting_for_new_view = false;
        self.own_new_view = Some(new_view.clone());
        self.out_box.push_back(Envelope::broadcast(Message::NewView(new_view)));
        Ok(())
    }

    /// Validates a primary's NewView by re-deriving the selection
    /// from the certificate and comparing byte-for-byte.
    pub fn process_new_view(&mut self, new_view: NewView, from: NodeId) -> Result<SyncStatus> {
        let target = new_view.view_no;
        if target < self.view.view_no() {
            return Ok(SyncStatus::Nil);
        }
        if self.view.validators().primary(target, 0) != &from {
            warn!(node = %from, view = %target, "new view from a non-primary");
            return Ok(SyncStatus::Nil);
        }

        // every certified ViewChange must be held and match its digest
        let held = self.view_changes.get(&target);
        let mut votes = Vec::new();
        for (sender, digest) in &new_view.view_changes {
            let vc = held.and_then(|h| h.get(sender));
            match vc {
                Some(vc) if view_change_digest(vc)? == *digest => votes.push(vc),
                // a missing or mismatched ViewChange means we cannot
                // recompute; the replica stashes and waits
                _ => return Ok(SyncStatus::Nil),
            }
        }
        if votes.len() < self.view.quorums().strong() {
            return Ok(SyncStatus::Nil);
        }

        let expected_checkpoint = calc_checkpoint(&votes, self.view.quorums().weak());
        let expected_batches =
            expected_checkpoint.as_ref().map(|cp| calc_batches(cp, &votes));
        let matches = match (&expected_checkpoint, &expected_batches) {
            (Some(cp), Some(batches)) => {
                canonical_bytes(cp)? == canonical_bytes(&new_view.checkpoint)?
                    && canonical_bytes(batches)? == canonical_bytes(&new_view.batches)?
            }
            _ => false,
        };
        if !matches {
            warn!(node = %from, view = %target, "new view selection mismatch");
            return Ok(SyncStatus::NewViewMismatch(target.next()));
        }

        self.view = self.view.for_view(target);
        self.waiting_for_new_view = false;
        info!(view = %target, "new view accepted");
        Ok(SyncStatus::NewViewAccepted(new_view))
    }

    /// Installs a view decided outside the protocol (catch-up).
    pub fn install_view(&mut self, view: ViewInfo) {
        self.view = view;
        self.waiting_for_new_view = false;
    }
}

/// Picks the highest checkpoint present in at least `weak` of the
/// certified ViewChanges.
pub fn calc_checkpoint(votes: &[&ViewChange], weak: usize) -> Option<Checkpoint> {
    let mut counts: BTreeMap<&Checkpoint, usize> = BTreeMap::new();
    for vc in votes {
        for checkpoint in &vc.checkpoints {
            *counts.entry(checkpoint).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= weak)
        .map(|(checkpoint, _)| checkpoint.clone())
        .max_by_key(|cp| cp.seq_no_end)
}

/// The deterministic batch selection: a batch is carried over iff
/// some certified ViewChange prepared it and a *different* one
/// preprepared the same digest. Gaps are filled with no-op batches so
/// the sequence stays contiguous.
pub fn calc_batches(checkpoint: &Checkpoint, votes: &[&ViewChange]) -> Vec<BatchId> {
    let mut selected: BTreeMap<SeqNo, BatchId> = BTreeMap::new();
    for (i, vc) in votes.iter().enumerate() {
        for batch in &vc.prepared {
            if batch.pp_seq_no <= checkpoint.seq_no_end {
                continue;
            }
            let preprepared_elsewhere = votes.iter().enumerate().any(|(j, other)| {
                j != i && other.preprepared.iter().any(|b| b.digest == batch.digest)
            });
            if !preprepared_elsewhere {
                continue;
            }
            selected
                .entry(batch.pp_seq_no)
                .and_modify(|existing| {
                    if batch.view_no > existing.view_no {
                        *existing = batch.clone();
                    }
                })
                .or_insert_with(|| batch.clone());
        }
    }

    let max_seq = match selected.keys().max() {
        Some(max_seq) => *max_seq,
        None => return Vec::new(),
    };
    let mut batches = Vec::new();
    let mut seq = checkpoint.seq_no_end.next();
    while seq <= max_seq {
        match selected.get(&seq) {
            Some(batch) => batches.push(batch.clone()),
            None => batches.push(BatchId {
                view_no: ViewNo::ZERO,
                pp_seq_no: seq,
                digest: Digest::blank(),
                state_root: Digest::blank(),
                txn_root: Digest::blank(),
            }),
        }
        seq = seq.next();
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::ValidatorSet;

    fn validators() -> ValidatorSet {
        ValidatorSet::new(
            (0..4).map(|i| NodeId::new(format!("Node{}", i + 1))).collect(),
        )
        .unwrap()
    }

    fn view(view_no: u64) -> ViewInfo {
        ViewInfo::new(ViewNo::from(view_no), validators()).unwrap()
    }

    fn service(name: &str) -> ViewChangeService {
        ViewChangeService::new(
            NodeId::from(name),
            view(0),
            Duration::from_secs(60),
            1_000,
        )
    }

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

    fn batch(view_no: u64, seq: u64, tag: &str) -> BatchId {
        BatchId {
            view_no: ViewNo::from(view_no),
            pp_seq_no: SeqNo::from(seq),
            digest: Digest::of(tag.as_bytes()),
            state_root: Digest::of(b"sr"),
            txn_root: Digest::of(b"tr"),
        }
    }

    #[test]
    fn start_view_change_increments_view_and_broadcasts() {
        // Node2 is the view-1 primary (validators sorted by name);
        // pick a non-primary so only the ViewChange goes out
        let mut svc = service("Node3");
        let old_primary = svc.primary_name().clone();

        svc.start_view_change(
            ViewChangeInput { stable_checkpoint: SeqNo::from(4), ..Default::default() },
            0,
        )
        .unwrap();

        assert_eq!(svc.view().view_no(), ViewNo::from(1));
        assert!(svc.waiting_for_new_view());
        assert_ne!(svc.primary_name(), &old_primary);

        assert_eq!(svc.out_box.len(), 1);
        let envelope = svc.out_box.pop_front().unwrap();
        assert!(matches!(envelope.to, crate::messages::Target::Broadcast));
        match envelope.message {
            Message::ViewChange(vc) => {
                assert_eq!(vc.view_no, ViewNo::from(1));
                assert_eq!(vc.stable_checkpoint, SeqNo::from(4));
            }
            other => panic!("expected a ViewChange, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_blocks_a_second_view_change_in_the_window() {
        let mut svc = service("Node3");
        svc.start_view_change(ViewChangeInput::default(), 0).unwrap();
        svc.out_box.clear();
        svc.start_view_change_for(ViewNo::from(1), ViewChangeInput::default(), 30).unwrap();
        assert!(svc.out_box.is_empty());
        svc.start_view_change_for(ViewNo::from(1), ViewChangeInput::default(), 61).unwrap();
        assert_eq!(svc.out_box.len(), 1);
    }

    #[test]
    fn non_primary_acks_to_the_new_primary() {
        // view 1's primary is Node2; Node4 is neither primary nor author
        let mut svc = service("Node4");
        svc.start_view_change(ViewChangeInput::default(), 0).unwrap();
        svc.out_box.clear();

        let vc = sample_view_change(1);
        let digest = view_change_digest(&vc).unwrap();
        svc.process_view_change(vc, NodeId::from("Node3")).unwrap();

        assert_eq!(svc.out_box.len(), 1);
        let envelope = svc.out_box.pop_front().unwrap();
        assert_eq!(envelope.to, crate::messages::Target::Node(NodeId::from("Node2")));
        match envelope.message {
            Message::ViewChangeAck(ack) => {
                assert_eq!(ack.view_no, ViewNo::from(1));
                assert_eq!(ack.name, NodeId::from("Node3"));
                assert_eq!(ack.digest, digest);
            }
            other => panic!("expected a ViewChangeAck, got {:?}", other),
        }
    }

    #[test]
    fn the_new_primary_does_not_ack() {
        let mut svc = service("Node2");
        let vc = sample_view_change(1);
        svc.process_view_change(vc, NodeId::from("Node3")).unwrap();
        assert!(svc.out_box.is_empty());
    }

    /// Routes the acks the two non-author, non-primary peers would
    /// send for `author`'s ViewChange.
    fn witness(svc: &mut ViewChangeService, author: &str, exclude: &[&str]) {
        let digest = view_change_digest(&sample_view_change(1)).unwrap();
        for peer in ["Node1", "Node2", "Node3", "Node4"] {
            if peer == author || exclude.contains(&peer) {
                continue;
            }
            let ack = ViewChangeAck {
                view_no: ViewNo::from(1),
                name: NodeId::from(author),
                digest: digest.clone(),
            };
            svc.process_view_change_ack(ack, NodeId::from(peer)).unwrap();
        }
    }

    #[test]
    fn new_view_sent_once_when_the_certificate_is_reached() {
        let mut svc = service("Node2"); // view-1 primary
        svc.start_view_change(
            ViewChangeInput {
                stable_checkpoint: SeqNo::from(4),
                checkpoints: vec![sample_checkpoint(1)],
                ..Default::default()
            },
            0,
        )
        .unwrap();
        svc.out_box.clear();

        for peer in ["Node1", "Node3", "Node4"] {
            svc.process_view_change(sample_view_change(1), NodeId::from(peer)).unwrap();
            witness(&mut svc, peer, &["Node2"]);
        }

        let new_views: Vec<_> = svc
            .out_box
            .iter()
            .filter_map(|e| match &e.message {
                Message::NewView(nv) => Some(nv.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(new_views.len(), 1);
        assert_eq!(new_views[0].view_no, ViewNo::from(1));
        assert_eq!(new_views[0].checkpoint, sample_checkpoint(1));
    }

    #[test]
    fn checkpoint_selection_needs_a_weak_quorum() {
        let lone = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![],
            preprepared: vec![],
            checkpoints: vec![sample_checkpoint(1)],
        };
        let empty = ViewChange { checkpoints: vec![], ..lone.clone() };
        // one vote carries the checkpoint, one does not; weak = 2
        assert_eq!(calc_checkpoint(&[&lone, &empty], 2), None);
        assert_eq!(
            calc_checkpoint(&[&lone, &lone, &empty], 2),
            Some(sample_checkpoint(1))
        );
    }

    #[test]
    fn highest_weakly_supported_checkpoint_wins() {
        let low = sample_checkpoint(1);
        let high = Checkpoint { seq_no_end: SeqNo::from(8), ..sample_checkpoint(1) };
        let vc = |cps: Vec<Checkpoint>| ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![],
            preprepared: vec![],
            checkpoints: cps,
        };
        let a = vc(vec![low.clone(), high.clone()]);
        let b = vc(vec![low.clone(), high.clone()]);
        let c = vc(vec![low.clone()]);
        assert_eq!(calc_checkpoint(&[&a, &b, &c], 2), Some(high));
    }

    #[test]
    fn batch_selection_requires_prepared_once_and_preprepared_elsewhere() {
        let checkpoint = Checkpoint {
            inst_id: 0,
            view_no: ViewNo::ZERO,
            seq_no_start: SeqNo::ZERO,
            seq_no_end: SeqNo::ZERO,
            digest: Digest::blank(),
        };
        let carried = batch(0, 1, "batch-1");
        let lonely = batch(0, 2, "batch-2-prepared-nowhere-else");

        let prepared_vc = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![carried.clone(), lonely.clone()],
            preprepared: vec![carried.clone(), lonely.clone()],
            checkpoints: vec![],
        };
        let witness_vc = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![],
            preprepared: vec![carried.clone()],
            checkpoints: vec![],
        };
        let empty_vc = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![],
            preprepared: vec![],
            checkpoints: vec![],
        };

        let batches = calc_batches(&checkpoint, &[&prepared_vc, &witness_vc, &empty_vc]);
        // batch 1 survives; batch 2 was preprepared by nobody else
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], carried);
    }

    #[test]
    fn gaps_are_filled_with_no_op_batches() {
        let checkpoint = Checkpoint {
            inst_id: 0,
            view_no: ViewNo::ZERO,
            seq_no_start: SeqNo::ZERO,
            seq_no_end: SeqNo::ZERO,
            digest: Digest::blank(),
        };
        let b1 = batch(0, 1, "one");
        let b3 = batch(0, 3, "three");
        let prepared_vc = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![b1.clone(), b3.clone()],
            preprepared: vec![b1.clone(), b3.clone()],
            checkpoints: vec![],
        };
        let witness_vc = ViewChange {
            view_no: ViewNo::from(1),
            stable_checkpoint: SeqNo::ZERO,
            prepared: vec![],
            preprepared: vec![b1.clone(), b3.clone()],
            checkpoints: vec![],
        };

        let batches = calc_batches(&checkpoint, &[&prepared_vc, &witness_vc]);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], b1);
        assert_eq!(batches[1].digest, Digest::blank());
        assert_eq!(batches[1].pp_seq_no, SeqNo::from(2));
        assert_eq!(batches[2], b3);
    }

    #[test]
    fn recipients_recompute_and_accept_a_faithful_new_view() {
        let mut primary = service("Node2");
        let mut replica = service("Node3");

        let input = ViewChangeInput {
            stable_checkpoint: SeqNo::from(4),
            checkpoints: vec![sample_checkpoint(1)],
            ..Default::default()
        };
        primary.start_view_change(input.clone(), 0).unwrap();
        replica.start_view_change(input, 0).unwrap();
        replica.out_box.clear();

        // both see the same three ViewChanges; the primary also
        // collects the witnessing acks
        for peer in ["Node1", "Node3", "Node4"] {
            primary.process_view_change(sample_view_change(1), NodeId::from(peer)).unwrap();
            witness(&mut primary, peer, &["Node2"]);
            if peer != "Node3" {
                replica.process_view_change(sample_view_change(1), NodeId::from(peer)).unwrap();
            }
        }
        let new_view = primary
            .out_box
            .iter()
            .find_map(|e| match &e.message {
                Message::NewView(nv) => Some(nv.clone()),
                _ => None,
            })
            .expect("primary built a new view");

        // the replica's own vote differs from sample_view_change, so
        // align the certificate by feeding it the same one
        replica.process_view_change(sample_view_change(1), NodeId::from("Node2")).unwrap();

        let status = replica.process_new_view(new_view, NodeId::from("Node2")).unwrap();
        match status {
            SyncStatus::NewViewAccepted(nv) => {
                assert_eq!(nv.view_no, ViewNo::from(1));
                assert!(!replica.waiting_for_new_view());
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn tampered_new_view_selection_is_a_protocol_fault() {
        let mut primary = service("Node2");
        let mut replica = service("Node3");
        let input = ViewChangeInput {
            stable_checkpoint: SeqNo::from(4),
            checkpoints: vec![sample_checkpoint(1)],
            ..Default::default()
        };
        primary.start_view_change(input.clone(), 0).unwrap();
        replica.start_view_change(input, 0).unwrap();

        for peer in ["Node1", "Node3", "Node4"] {
            primary.process_view_change(sample_view_change(1), NodeId::from(peer)).unwrap();
            witness(&mut primary, peer, &["Node2"]);
            if peer != "Node3" {
                replica.process_view_change(sample_view_change(1), NodeId::from(peer)).unwrap();
            }
        }
        replica.process_view_change(sample_view_change(1), NodeId::from("Node2")).unwrap();

        let mut new_view = primary
            .out_box
            .iter()
            .find_map(|e| match &e.message {
                Message::NewView(nv) => Some(nv.clone()),
                _ => None,
            })
            .expect("primary built a new view");
        // the primary smuggles in a batch the certificate never saw
        new_view.batches.push(batch(1, 9, "smuggled"));

        let status = replica.process_new_view(new_view, NodeId::from("Node2")).unwrap();
        assert!(matches!(status, SyncStatus::NewViewMismatch(v) if v == ViewNo::from(2)));
    }

    #[test]
    fn new_view_from_a_non_primary_is_ignored() {
        let mut replica = service("Node3");
        replica.start_view_change(ViewChangeInput::default(), 0).unwrap();
        let forged = NewView {
            view_no: ViewNo::from(1),
            view_changes: vec![],
            checkpoint: sample_checkpoint(1),
            batches: vec![],
        };
        let status = replica.process_new_view(forged, NodeId::from("Node4")).unwrap();
        assert!(matches!(status, SyncStatus::Nil));
        assert!(replica.waiting_for_new_view());
    }
}
