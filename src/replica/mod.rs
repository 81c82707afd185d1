//! The replica event loop.
//!
//! Single-threaded and cooperative: the loop is fed by inbound peer
//! messages, expiring timers, and internal events from the monitor
//! and the view-change service. Nothing here blocks; the
//! replica consumes one event, pushes whatever it produced into its
//! out box, and returns to the caller (the transport driver).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::consensus::{
    OrderedEvent, OrderingService, Suspicion, FRESHNESS_LEDGER_IDS, LEDGER_IDS,
};
use crate::crypto::Digest;
use crate::cst::{CatchupEvent, CatchupService};
use crate::error::*;
use crate::messages::{
    Checkpoint, ConsistencyProof, Envelope, InstanceChange, Message, Request, Timestamp,
};
use crate::monitor::Monitor;
use crate::ordering::{LedgerId, NodeId, ViewNo};
use crate::sync::{SyncStatus, ViewChangeInput, ViewChangeService};
use crate::timeouts::{TimerKind, TimerService};
use crate::view::{ValidatorSet, ViewInfo};

/// Protocol violations tolerated from one peer before the replica
/// proposes a view change over it.
const SUSPICION_THRESHOLD: usize = 10;

/// Cadence of the batching and stash-retry housekeeping.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const PERF_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// One validator process: the master ordering instance, its backups,
/// and the control services around them.
pub struct Replica {
    node_id: NodeId,
    config: Config,
    /// Instance 0 is the master; the rest are monitoring backups.
    instances: Vec<OrderingService>,
    view_changer: ViewChangeService,
    catchup: CatchupService,
    monitor: Monitor,
    timers: TimerService,

    /// Bounded stash for messages that cannot be processed yet.
    stash: VecDeque<(NodeId, Message)>,
    suspicion_counts: HashMap<NodeId, usize>,
    instance_change_votes: HashMap<ViewNo, HashSet<NodeId>>,
    last_primary_seen: Timestamp,
    paused_for_catchup: bool,
    catchup_baseline: HashMap<LedgerId, u64>,
    ordered_since_perf_check: u64,

    /// Addressed messages awaiting the transport.
    pub out_box: VecDeque<Envelope>,
    /// Master-instance ordered events, for the driver and tests.
    pub ordered: Vec<OrderedEvent>,
}

impl Replica {
    pub fn new(
        node_id: NodeId,
        validators: ValidatorSet,
        config: Config,
        dir: &Path,
        bls_seed: Option<&[u8]>,
        now: Timestamp,
    ) -> Result<Self> {
        let view = ViewInfo::new(ViewNo::ZERO, validators)?;
        let num_instances = 1 + view.quorums().f();
        let mut instances = Vec::with_capacity(num_instances);
        for inst_id in 0..num_instances {
            let signer = match (inst_id, bls_seed) {
                (0, Some(seed)) => Some(crate::bls::BlsSigner::from_seed(seed)?),
                _ => None,
            };
            instances.push(OrderingService::new(
                node_id.clone(),
                inst_id,
                view.clone(),
                config.clone(),
                dir,
                signer,
            )?);
        }
        let view_changer = ViewChangeService::new(
            node_id.clone(),
            view.clone(),
            config.view_change_window,
            config.view_change_service_stash_limit,
        );
        let catchup = CatchupService::new(
            node_id.clone(),
            config.consistency_proofs_timeout,
            config.catchup_transactions_timeout,
        );
        let monitor = Monitor::new(
            num_instances,
            config.delta,
            config.lambda,
            config.acc_monitor_timeout,
        );

        let mut replica = Self {
            node_id,
            config,
            instances,
            view_changer,
            catchup,
            monitor,
            timers: TimerService::new(),
            stash: VecDeque::new(),
            suspicion_counts: HashMap::new(),
            instance_change_votes: HashMap::new(),
            last_primary_seen: now,
            paused_for_catchup: false,
            catchup_baseline: HashMap::new(),
            ordered_since_perf_check: 0,
            out_box: VecDeque::new(),
            ordered: Vec::new(),
        };
        replica.bootstrap_timers(now);
        replica.announce_ledger_statuses();
        Ok(replica)
    }

    fn bootstrap_timers(&mut self, now: Timestamp) {
        let now_ms = now * 1000;
        self.timers.schedule(now_ms, HOUSEKEEPING_INTERVAL, TimerKind::Batch3Pc);
        self.timers.schedule(
            now_ms,
            self.config.process_stashed_out_of_order_commits_interval,
            TimerKind::ProcessStashedCommits,
        );
        self.timers.schedule(now_ms, REQUEST_SCAN_INTERVAL, TimerKind::RequestLifecycle);
        self.timers.schedule(
            now_ms,
            self.config.tolerate_primary_disconnection,
            TimerKind::PrimaryDisconnected,
        );
        self.timers.schedule(now_ms, PERF_CHECK_INTERVAL, TimerKind::PerfCheck);
    }

    /// On start (and restart) a replica advertises where its ledgers
    /// stand, so a lagging node learns it must catch up.
    fn announce_ledger_statuses(&mut self) {
        let last_3pc = self.instances[0].last_ordered_3pc();
        for ledger_id in LEDGER_IDS {
            if let Some(ledger) = self.instances[0].ledger(ledger_id) {
                self.out_box.push_back(Envelope::broadcast(Message::LedgerStatus(
                    CatchupService::own_status(ledger_id, ledger, last_3pc),
                )));
            }
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn view_no(&self) -> ViewNo {
        self.instances[0].view().view_no()
    }

    pub fn primary_name(&self) -> NodeId {
        self.instances[0].view().primary().clone()
    }

    pub fn master(&self) -> &OrderingService {
        &self.instances[0]
    }

    pub fn is_paused_for_catchup(&self) -> bool {
        self.paused_for_catchup
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// A client submits a request; every instance queues it.
    pub fn submit_request(&mut self, request: Request, now: Timestamp) -> Result<()> {
        for instance in &mut self.instances {
            instance.receive_request(request.clone(), now)?;
        }
        Ok(())
    }

    /// One inbound peer message. Only `Fatal` errors surface; they
    /// halt the replica and require the operator.
    pub fn handle_message(&mut self, from: NodeId, message: Message, now: Timestamp) -> Result<()> {
        if from == self.primary_name() {
            self.last_primary_seen = now;
        }
        if let Err(e) = self.dispatch(from.clone(), message, now) {
            if !e.is_recoverable() {
                return Err(e);
            }
            debug!(node = %from, error = %e, "message rejected");
        }
        self.collect_outputs(now);
        Ok(())
    }

    /// The timer event source; also retries the stash.
    pub fn tick(&mut self, now: Timestamp) -> Result<()> {
        for (_, kind) in self.timers.advance(now * 1000) {
            if let Err(e) = self.handle_timer(kind, now) {
                if !e.is_recoverable() {
                    return Err(e);
                }
                debug!(error = %e, "timer handler failed");
            }
        }
        self.retry_stash(now);
        self.collect_outputs(now);
        Ok(())
    }

    fn dispatch(&mut self, from: NodeId, message: Message, now: Timestamp) -> Result<()> {
        if self.should_stash(&message) {
            self.stash_message(from, message);
            return Ok(());
        }
        match message {
            Message::Request(request) => self.submit_request(request, now),
            Message::PrePrepare(pp) => {
                let inst = self.instance_mut(pp.inst_id)?;
                inst.process_pre_prepare(pp, from, now)
            }
            Message::Prepare(prepare) => {
                let inst = self.instance_mut(prepare.inst_id)?;
                inst.process_prepare(prepare, from)
            }
            Message::Commit(commit) => {
                let inst = self.instance_mut(commit.inst_id)?;
                inst.process_commit(commit, from)
            }
            Message::Checkpoint(checkpoint) => {
                let inst = self.instance_mut(checkpoint.inst_id)?;
                inst.process_checkpoint(&checkpoint, from)
            }
            Message::ViewChange(vc) => {
                let status = self.view_changer.process_view_change(vc, from)?;
                self.apply_sync_status(status, now)
            }
            Message::ViewChangeAck(ack) => self.view_changer.process_view_change_ack(ack, from),
            Message::NewView(nv) => {
                let status = self.view_changer.process_new_view(nv, from)?;
                self.apply_sync_status(status, now)
            }
            Message::InstanceChange(ic) => self.process_instance_change(ic, from, now),
            Message::LedgerStatus(status) => self.process_ledger_status(status, from, now),
            Message::ConsistencyProof(proof) => {
                let ledgers = self.instances[0].ledgers();
                self.catchup.process_consistency_proof(proof, from, ledgers)?;
                Ok(())
            }
            Message::CatchupReq(req) => {
                let ledgers = self.instances[0].ledgers();
                self.catchup.serve_catchup_req(&req, from, ledgers)
            }
            Message::CatchupRep(rep) => {
                let event = {
                    let (master, timers) = (&mut self.instances[0], &mut self.timers);
                    self.catchup.process_catchup_rep(rep, master.ledgers_mut(), timers)?
                };
                self.apply_catchup_event(event, now)
            }
        }
    }

    fn instance_mut(&mut self, inst_id: usize) -> Result<&mut OrderingService> {
        self.instances
            .get_mut(inst_id)
            .ok_or_else(|| Error::new(ErrorKind::InputMalformed, "unknown instance"))
    }

    /// 3PC traffic that cannot be consumed yet is stashed: future
    /// views, sequence numbers outside the watermarks, votes without
    /// their PrePrepare, batches whose requests have not propagated.
    fn should_stash(&self, message: &Message) -> bool {
        let master = &self.instances[0];
        match message {
            Message::PrePrepare(pp) => {
                if pp.inst_id != 0 {
                    return false;
                }
                pp.view_no > self.view_no()
                    || !master.checkpoints.in_watermarks(pp.pp_seq_no)
                    || !master.has_all_requests(pp)
            }
            Message::Prepare(p) => {
                p.inst_id == 0
                    && (p.view_no > self.view_no() || !master.has_batch(p.view_no, p.pp_seq_no))
            }
            Message::Commit(c) => {
                c.inst_id == 0
                    && (c.view_no > self.view_no() || !master.has_batch(c.view_no, c.pp_seq_no))
            }
            _ => false,
        }
    }

    fn stash_message(&mut self, from: NodeId, message: Message) {
        if self.stash.len() >= self.config.replica_stash_limit {
            // bounded: evict the oldest entry
            warn!("replica stash overflow, evicting oldest");
            self.stash.pop_front();
        }
        self.stash.push_back((from, message));
    }

    fn retry_stash(&mut self, now: Timestamp) {
        let mut pending: VecDeque<_> = std::mem::take(&mut self.stash);
        while let Some((from, message)) = pending.pop_front() {
            if self.should_stash(&message) {
                self.stash.push_back((from, message));
            } else if let Err(e) = self.dispatch(from.clone(), message, now) {
                debug!(node = %from, error = %e, "stashed message rejected on retry");
            }
        }
    }

    fn handle_timer(&mut self, kind: TimerKind, now: Timestamp) -> Result<()> {
        let now_ms = now * 1000;
        match kind {
            TimerKind::Batch3Pc => {
                self.timers.schedule(now_ms, HOUSEKEEPING_INTERVAL, TimerKind::Batch3Pc);
                if !self.paused_for_catchup {
                    for instance in &mut self.instances {
                        instance.send_3pc_batch(now)?;
                    }
                }
                Ok(())
            }
            TimerKind::ProcessStashedCommits => {
                self.timers.schedule(
                    now_ms,
                    self.config.process_stashed_out_of_order_commits_interval,
                    TimerKind::ProcessStashedCommits,
                );
                for instance in &mut self.instances {
                    instance.process_stashed_out_of_order_commits()?;
                }
                Ok(())
            }
            TimerKind::RequestLifecycle => {
                self.timers.schedule(now_ms, REQUEST_SCAN_INTERVAL, TimerKind::RequestLifecycle);
                for instance in &mut self.instances {
                    instance.check_request_timeouts(now);
                }
                Ok(())
            }
            TimerKind::PrimaryDisconnected => {
                self.timers.schedule(
                    now_ms,
                    self.config.tolerate_primary_disconnection,
                    TimerKind::PrimaryDisconnected,
                );
                let silent_for = now.saturating_sub(self.last_primary_seen);
                if silent_for >= self.config.tolerate_primary_disconnection.as_secs()
                    && !self.view_changer.waiting_for_new_view()
                {
                    self.propose_instance_change(
                        self.view_no().next(),
                        "primary disconnected",
                        now,
                    )?;
                }
                Ok(())
            }
            TimerKind::NewViewWait { view_no } => {
                if self.view_changer.waiting_for_new_view() && self.view_no() <= view_no {
                    // no NewView arrived; escalate to the next view
                    self.start_view_change(view_no.next(), now)?;
                }
                Ok(())
            }
            TimerKind::ProposeViewChange { view_no } => {
                if self.view_no() < view_no {
                    self.propose_instance_change(view_no, "initial propose timeout", now)?;
                }
                Ok(())
            }
            TimerKind::ReaskLedgerStatus { ledger_id: _ }
            | TimerKind::ReaskConsistencyProof { ledger_id: _ } => {
                if self.catchup.is_running() {
                    self.announce_ledger_statuses();
                }
                Ok(())
            }
            TimerKind::PerfCheck => {
                self.timers.schedule(now_ms, PERF_CHECK_INTERVAL, TimerKind::PerfCheck);
                if self.monitor.is_master_degraded(now) {
                    self.propose_instance_change(self.view_no().next(), "master degraded", now)?;
                }
                Ok(())
            }
        }
    }

    // -- view change glue --

    fn view_change_input(&self) -> ViewChangeInput {
        let master = &self.instances[0];
        let stable = master.checkpoints.stable_seq();
        let mut checkpoints = master.checkpoints.own_checkpoints();
        if checkpoints.is_empty() {
            // a pool that has not crossed its first checkpoint agrees
            // on the implicit genesis one
            checkpoints.push(Checkpoint {
                inst_id: 0,
                view_no: ViewNo::ZERO,
                seq_no_start: stable,
                seq_no_end: stable,
                digest: Digest::blank(),
            });
        }
        ViewChangeInput {
            stable_checkpoint: stable,
            prepared: master.prepared_certificates(),
            preprepared: master.preprepared_certificates(),
            checkpoints,
        }
    }

    /// Votes for replacing the primary; the view change itself starts
    /// only on a strong quorum of such votes.
    fn propose_instance_change(
        &mut self,
        target: ViewNo,
        reason: &str,
        now: Timestamp,
    ) -> Result<()> {
        info!(view = %target, reason, "proposing instance change");
        let ic = InstanceChange { view_no: target, reason: reason.to_owned() };
        self.out_box.push_back(Envelope::broadcast(Message::InstanceChange(ic)));
        let own = self.node_id.clone();
        self.record_instance_change_vote(target, own, now)
    }

    fn process_instance_change(
        &mut self,
        ic: InstanceChange,
        from: NodeId,
        now: Timestamp,
    ) -> Result<()> {
        if ic.view_no <= self.view_no() {
            return Ok(());
        }
        self.record_instance_change_vote(ic.view_no, from, now)
    }

    fn record_instance_change_vote(
        &mut self,
        target: ViewNo,
        from: NodeId,
        now: Timestamp,
    ) -> Result<()> {
        let votes = self.instance_change_votes.entry(target).or_default();
        votes.insert(from);
        let quorum = self.instances[0].view().quorums().strong();
        if votes.len() >= quorum && self.view_no() < target {
            self.start_view_change(target, now)?;
        }
        Ok(())
    }

    fn start_view_change(&mut self, target: ViewNo, now: Timestamp) -> Result<()> {
        let input = self.view_change_input();
        self.view_changer.start_view_change_for(target, input, now)?;
        self.timers.schedule(
            now * 1000,
            self.config.new_view_timeout,
            TimerKind::NewViewWait { view_no: target },
        );
        Ok(())
    }

    fn apply_sync_status(&mut self, status: SyncStatus, now: Timestamp) -> Result<()> {
        match status {
            SyncStatus::Nil => Ok(()),
            SyncStatus::NewViewMismatch(next) => {
                self.bump_suspicion(self.primary_name(), Suspicion::NvSelectionMismatch);
                self.start_view_change(next, now)
            }
            SyncStatus::NewViewAccepted(new_view) => {
                let target = new_view.view_no;
                let view = self.instances[0].view().for_view(target);
                for instance in &mut self.instances {
                    instance.install_new_view(
                        view.clone(),
                        new_view.checkpoint.seq_no_end,
                        &new_view.batches,
                    )?;
                }
                // a view change cancels every pending 3PC deadline
                // above the checkpoint and every view-change timer
                self.timers.cancel_matching(|k| {
                    matches!(
                        k,
                        TimerKind::NewViewWait { .. } | TimerKind::ProposeViewChange { .. }
                    )
                });
                self.instance_change_votes.retain(|v, _| *v > target);
                self.last_primary_seen = now;
                info!(view = %target, primary = %self.primary_name(), "view installed");
                Ok(())
            }
        }
    }

    fn bump_suspicion(&mut self, node: NodeId, suspicion: Suspicion) {
        warn!(node = %node, ?suspicion, "suspicion raised");
        let count = self.suspicion_counts.entry(node).or_insert(0);
        *count += 1;
    }

    // -- catch-up glue --

    fn process_ledger_status(
        &mut self,
        status: crate::messages::LedgerStatus,
        from: NodeId,
        now: Timestamp,
    ) -> Result<()> {
        // a peer that is behind gets a consistency proof over our
        // longer prefix
        if let Some(ledger) = self.instances[0].ledger(status.ledger_id) {
            if status.txn_seq_no < ledger.committed_size() {
                let last_3pc = self.instances[0].last_ordered_3pc();
                let proof = ConsistencyProof {
                    ledger_id: status.ledger_id,
                    seq_no_start: status.txn_seq_no,
                    seq_no_end: ledger.committed_size(),
                    view_no: last_3pc.0,
                    pp_seq_no: last_3pc.1,
                    old_merkle_root: ledger.root_at(status.txn_seq_no)?,
                    new_merkle_root: ledger.root_hash(),
                    hashes: ledger.consistency_proof(status.txn_seq_no, ledger.committed_size())?,
                };
                self.out_box.push_back(Envelope::to_node(
                    from.clone(),
                    Message::ConsistencyProof(proof),
                ));
                let own = CatchupService::own_status(status.ledger_id, ledger, last_3pc);
                self.out_box
                    .push_back(Envelope::to_node(from.clone(), Message::LedgerStatus(own)));
            }
        }

        let own_sizes: BTreeMap<LedgerId, u64> = LEDGER_IDS
            .iter()
            .filter_map(|lid| self.instances[0].ledger(*lid).map(|l| (*lid, l.committed_size())))
            .collect();
        let quorums = self.instances[0].view().quorums();
        let event = self.catchup.process_ledger_status(status, from, &own_sizes, quorums);
        self.apply_catchup_event(event, now)
    }

    fn apply_catchup_event(&mut self, event: CatchupEvent, now: Timestamp) -> Result<()> {
        match event {
            CatchupEvent::Nil => Ok(()),
            CatchupEvent::Behind(targets) => {
                info!(?targets, "pool is ahead; pausing ordering for catch-up");
                self.paused_for_catchup = true;
                self.catchup_baseline = targets
                    .keys()
                    .filter_map(|lid| {
                        self.instances[0].ledger(*lid).map(|l| (*lid, l.committed_size()))
                    })
                    .collect();
                let (master, timers) = (&self.instances[0], &mut self.timers);
                self.catchup.start(&targets, master.ledgers(), timers, now * 1000)
            }
            CatchupEvent::CaughtUp { view_no, pp_seq_no } => {
                // rebuild the tries from the fetched suffixes, then
                // resume ordering where the pool is
                let baseline = std::mem::take(&mut self.catchup_baseline);
                for ledger_id in FRESHNESS_LEDGER_IDS {
                    if let Some(from_size) = baseline.get(&ledger_id) {
                        self.instances[0].replay_ledger_into_state(ledger_id, *from_size)?;
                    }
                }
                self.instances[0].sync_to(view_no, pp_seq_no);
                self.paused_for_catchup = false;
                info!(view = %view_no, seq = %pp_seq_no, "catch-up finished, ordering resumed");
                // re-advertise where we stand; a ledger that was
                // still lagging when this round started gets its own
                // round now
                self.announce_ledger_statuses();
                Ok(())
            }
        }
    }

    // -- output plumbing --

    /// Moves sub-service output into the replica out box and feeds
    /// the monitor with freshly ordered batches.
    fn collect_outputs(&mut self, now: Timestamp) {
        // as the new primary we install the NewView we just built,
        // exactly like a received one
        if let Some(new_view) = self.view_changer.own_new_view.take() {
            if let Err(e) = self.apply_sync_status(SyncStatus::NewViewAccepted(new_view), now) {
                warn!(error = %e, "installing own new view failed");
            }
        }
        for inst_id in 0..self.instances.len() {
            let envelopes: Vec<Envelope> =
                self.instances[inst_id].out_box.drain(..).collect();
            self.out_box.extend(envelopes);

            let events: Vec<OrderedEvent> =
                self.instances[inst_id].ordered_events.drain(..).collect();
            for event in events {
                let count = event.req_idr.len().max(1) as u64;
                self.monitor.request_ordered(inst_id, now, count);
                for (identifier, _) in &event.req_idr {
                    let latency = now.saturating_sub(event.pp_time) as f64;
                    self.monitor.request_latency(inst_id, identifier, latency);
                }
                if inst_id == 0 {
                    self.ordered.push(event);
                    self.ordered_since_perf_check += 1;
                }
            }

            let suspicions: Vec<(NodeId, Suspicion)> =
                self.instances[inst_id].suspicions.drain(..).collect();
            for (node, suspicion) in suspicions {
                self.bump_suspicion(node.clone(), suspicion);
                if self.suspicion_counts.get(&node).copied().unwrap_or(0) >= SUSPICION_THRESHOLD
                {
                    let target = self.view_no().next();
                    let _ = self.propose_instance_change(target, "sustained violations", now);
                    self.suspicion_counts.remove(&node);
                }
            }
        }
        // the performance comparison runs every `perf_check_freq`
        // ordered batches; the periodic timer covers the case where
        // the master orders nothing at all
        if self.ordered_since_perf_check >= self.config.perf_check_freq {
            self.ordered_since_perf_check = 0;
            if self.monitor.is_master_degraded(now) {
                let target = self.view_no().next();
                let _ = self.propose_instance_change(target, "master degraded", now);
            }
        }

        let envelopes: Vec<Envelope> = self.view_changer.out_box.drain(..).collect();
        self.out_box.extend(envelopes);
        let envelopes: Vec<Envelope> = self.catchup.out_box.drain(..).collect();
        self.out_box.extend(envelopes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request, Target};
    use crate::ordering::SeqNo;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use std::collections::BTreeMap as StdBTreeMap;

    const T0: Timestamp = 1_499_906_903;

    fn signed_request(seed: u8, req_id: u64, ledger_id: LedgerId) -> Request {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&[seed; 32]).unwrap();
        let identifier = bs58::encode(keypair.public_key().as_ref()).into_string();
        let mut request = Request {
            identifier: identifier.clone(),
            req_id,
            ledger_id,
            operation: serde_json::json!({"type": "nym", "dest": format!("target-{}", req_id)}),
            signatures: StdBTreeMap::new(),
        };
        let signature = keypair.sign(&request.signable_bytes().unwrap());
        request
            .signatures
            .insert(identifier, bs58::encode(signature.as_ref()).into_string());
        request
    }

    /// An in-memory pool of replicas with a synchronous lossless
    /// network between them.
    struct Pool {
        dirs: Vec<tempfile::TempDir>,
        names: Vec<NodeId>,
        replicas: Vec<Option<Replica>>,
        muted: HashSet<NodeId>,
    }

    impl Pool {
        fn new(n: usize) -> Self {
            let names: Vec<NodeId> =
                (0..n).map(|i| NodeId::new(format!("Node{}", i + 1))).collect();
            let validators = ValidatorSet::new(names.clone()).unwrap();
            let mut dirs = Vec::new();
            let mut replicas = Vec::new();
            for name in &names {
                let dir = tempfile::tempdir().unwrap();
                let replica = Replica::new(
                    name.clone(),
                    validators.clone(),
                    Config::default(),
                    dir.path(),
                    None,
                    T0,
                )
                .unwrap();
                dirs.push(dir);
                replicas.push(Some(replica));
            }
            Self { dirs, names, replicas, muted: HashSet::new() }
        }

        fn index_of(&self, name: &str) -> usize {
            self.names.iter().position(|n| n.as_str() == name).unwrap()
        }

        fn replica(&self, name: &str) -> &Replica {
            self.replicas[self.index_of(name)].as_ref().unwrap()
        }

        fn mute(&mut self, name: &str) {
            self.muted.insert(NodeId::from(name));
        }

        fn take_offline(&mut self, name: &str) {
            let index = self.index_of(name);
            self.replicas[index] = None;
        }

        fn restart(&mut self, name: &str, now: Timestamp) {
            let index = self.index_of(name);
            let validators = ValidatorSet::new(self.names.clone()).unwrap();
            let replica = Replica::new(
                NodeId::from(name),
                validators,
                Config::default(),
                self.dirs[index].path(),
                None,
                now,
            )
            .unwrap();
            self.replicas[index] = Some(replica);
        }

        fn submit_all(&mut self, request: &Request, now: Timestamp) {
            for replica in self.replicas.iter_mut().flatten() {
                replica.submit_request(request.clone(), now).unwrap();
            }
        }

        /// Delivers traffic until the network is quiet.
        fn settle(&mut self, now: Timestamp) {
            for _ in 0..64 {
                let mut traffic: Vec<(NodeId, Envelope)> = Vec::new();
                for i in 0..self.replicas.len() {
                    let name = self.names[i].clone();
                    let muted = self.muted.contains(&name);
                    if let Some(replica) = self.replicas[i].as_mut() {
                        while let Some(envelope) = replica.out_box.pop_front() {
                            if !muted {
                                traffic.push((name.clone(), envelope));
                            }
                        }
                    }
                }
                if traffic.is_empty() {
                    return;
                }
                for (from, envelope) in traffic {
                    match envelope.to {
                        Target::Broadcast => {
                            for i in 0..self.replicas.len() {
                                if self.names[i] == from {
                                    continue;
                                }
                                if let Some(replica) = self.replicas[i].as_mut() {
                                    replica
                                        .handle_message(
                                            from.clone(),
                                            envelope.message.clone(),
                                            now,
                                        )
                                        .unwrap();
                                }
                            }
                        }
                        Target::Node(ref to) => {
                            let index = self.index_of(to.as_str());
                            if let Some(replica) = self.replicas[index].as_mut() {
                                replica
                                    .handle_message(from.clone(), envelope.message.clone(), now)
                                    .unwrap();
                            }
                        }
                    }
                }
            }
            panic!("network did not quiesce");
        }

        fn tick_all(&mut self, now: Timestamp) {
            for replica in self.replicas.iter_mut().flatten() {
                replica.tick(now).unwrap();
            }
            self.settle(now);
        }

        fn live(&self) -> impl Iterator<Item = &Replica> {
            self.replicas.iter().flatten()
        }
    }

    #[test]
    fn four_node_happy_path_orders_in_submission_order() {
        let mut pool = Pool::new(4);
        pool.settle(T0);

        let requests: Vec<Request> =
            (1..=10).map(|i| signed_request(1, i, LedgerId::DOMAIN)).collect();
        for request in &requests {
            pool.submit_all(request, T0);
        }
        pool.tick_all(T0 + 5);

        for replica in pool.live() {
            assert_eq!(
                replica.master().last_ordered_3pc(),
                (ViewNo::ZERO, SeqNo::ONE),
                "{} ordered the batch",
                replica.node_id()
            );
        }

        // submission order is preserved inside the batch
        let events = &pool.replica("Node1").ordered;
        assert_eq!(events.len(), 1);
        let expected: Vec<_> = requests.iter().map(|r| r.key()).collect();
        assert_eq!(events[0].req_idr, expected);

        // every replica converged on the same commitments
        let roots: HashSet<[u8; 32]> = pool
            .live()
            .map(|r| r.master().state(LedgerId::DOMAIN).unwrap().committed_root())
            .collect();
        assert_eq!(roots.len(), 1);
        let txn_roots: HashSet<Digest> =
            pool.live().map(|r| r.master().ledger(LedgerId::DOMAIN).unwrap().root_hash()).collect();
        assert_eq!(txn_roots.len(), 1);
        for replica in pool.live() {
            assert_eq!(replica.master().ledger(LedgerId::DOMAIN).unwrap().committed_size(), 10);
        }
    }

    #[test]
    fn silent_primary_is_replaced_and_history_survives() {
        let mut pool = Pool::new(4);
        pool.settle(T0);

        let request = signed_request(2, 1, LedgerId::DOMAIN);
        pool.submit_all(&request, T0);
        pool.tick_all(T0 + 5);
        for replica in pool.live() {
            assert_eq!(replica.master().last_ordered_3pc(), (ViewNo::ZERO, SeqNo::ONE));
        }

        // the view-0 primary goes dark
        pool.mute("Node1");
        pool.tick_all(T0 + 70);

        for name in ["Node2", "Node3", "Node4"] {
            let replica = pool.replica(name);
            assert_eq!(replica.view_no(), ViewNo::from(1), "{} installed view 1", name);
            assert_eq!(replica.primary_name(), NodeId::from("Node2"));
            // the ordered batch was carried across the view change
            assert_eq!(replica.master().last_ordered_3pc(), (ViewNo::from(1), SeqNo::ONE));
            assert_eq!(replica.master().ledger(LedgerId::DOMAIN).unwrap().committed_size(), 1);
        }

        // the new primary keeps ordering client traffic
        let request = signed_request(2, 2, LedgerId::DOMAIN);
        pool.submit_all(&request, T0 + 71);
        pool.tick_all(T0 + 76);
        for name in ["Node2", "Node3", "Node4"] {
            let replica = pool.replica(name);
            assert_eq!(replica.master().last_ordered_3pc(), (ViewNo::from(1), SeqNo::from(2)));
        }
    }

    #[test]
    fn restarted_node_catches_up_and_cancels_reask_timers() {
        let mut pool = Pool::new(4);
        pool.settle(T0);
        pool.take_offline("Node4");

        for req_id in 1..=2u64 {
            let request = signed_request(3, req_id, LedgerId::DOMAIN);
            pool.submit_all(&request, T0 + req_id * 10);
            pool.tick_all(T0 + req_id * 10 + 5);
        }
        for name in ["Node1", "Node2", "Node3"] {
            assert_eq!(
                pool.replica(name).master().last_ordered_3pc(),
                (ViewNo::ZERO, SeqNo::from(2))
            );
        }

        pool.restart("Node4", T0 + 30);
        pool.settle(T0 + 30);
        pool.tick_all(T0 + 31);

        let healthy = pool.replica("Node1");
        let restarted = pool.replica("Node4");
        assert!(!restarted.is_paused_for_catchup());
        for ledger_id in [LedgerId::DOMAIN, LedgerId::AUDIT] {
            assert_eq!(
                restarted.master().ledger(ledger_id).unwrap().committed_size(),
                healthy.master().ledger(ledger_id).unwrap().committed_size(),
                "{:?} sizes match",
                ledger_id
            );
            assert_eq!(
                restarted.master().ledger(ledger_id).unwrap().root_hash(),
                healthy.master().ledger(ledger_id).unwrap().root_hash()
            );
        }
        assert_eq!(
            restarted.master().state(LedgerId::DOMAIN).unwrap().committed_root(),
            healthy.master().state(LedgerId::DOMAIN).unwrap().committed_root()
        );
        assert_eq!(restarted.master().last_ordered_3pc(), (ViewNo::ZERO, SeqNo::from(2)));
        // no reask deadline stays scheduled once catch-up completes
        assert!(!restarted.timers().has_pending(|k| matches!(
            k,
            TimerKind::ReaskLedgerStatus { .. } | TimerKind::ReaskConsistencyProof { .. }
        )));
    }

    #[test]
    fn stashed_votes_wait_for_their_pre_prepare() {
        let mut pool = Pool::new(4);
        pool.settle(T0);

        // a Prepare for an unknown batch arrives ahead of its
        // PrePrepare and must not be dropped
        let orphan = crate::messages::Prepare {
            inst_id: 0,
            view_no: ViewNo::ZERO,
            pp_seq_no: SeqNo::ONE,
            digest: Digest::of(b"early"),
            state_root: Digest::of(b"early"),
            txn_root: Digest::of(b"early"),
        };
        let node2 = pool.index_of("Node2");
        pool.replicas[node2]
            .as_mut()
            .unwrap()
            .handle_message(NodeId::from("Node3"), Message::Prepare(orphan), T0)
            .unwrap();
        assert_eq!(pool.replica("Node2").stash.len(), 1);

        // ordering still completes once the real traffic flows
        let request = signed_request(4, 1, LedgerId::DOMAIN);
        pool.submit_all(&request, T0);
        pool.tick_all(T0 + 5);
        for replica in pool.live() {
            assert_eq!(replica.master().last_ordered_3pc(), (ViewNo::ZERO, SeqNo::ONE));
        }
    }
}
