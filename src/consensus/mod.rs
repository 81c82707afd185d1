//! The three-phase-commit ordering service.
//!
//! One instance is the master; its ordered batches are applied to the
//! ledgers and the state tries. Backups run the same vote counting
//! over batch digests only, giving the monitor a baseline.
//!
//! Per `(view_no, pp_seq_no)` a batch walks
//! `PrePrepared -> Prepared -> Committed -> Ordered`; a view change
//! resets every non-ordered entry above the stable checkpoint.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use linked_hash_map::LinkedHashMap;
use ring::signature::{UnparsedPublicKey, ED25519};
use tracing::{debug, info, warn};

use crate::bls::{verify_multi_sig, BlsAggregator, BlsKeyRegister, BlsSigner};
use crate::checkpoint::CheckpointService;
use crate::config::Config;
use crate::crypto::Digest;
use crate::error::*;
use crate::ledger::Ledger;
use crate::messages::{
    canonical_bytes, BatchId, Checkpoint, Commit, Envelope, Message, MultiSignatureValue,
    PrePrepare, Prepare, Request, RequestKey, Timestamp,
};
use crate::ordering::{LedgerId, NodeId, SeqNo, ViewNo};
use crate::state::State;
use crate::view::ViewInfo;

/// The ledgers every pool replicates; freshness covers all but audit.
pub const LEDGER_IDS: [LedgerId; 4] =
    [LedgerId::POOL, LedgerId::DOMAIN, LedgerId::CONFIG, LedgerId::AUDIT];

pub const FRESHNESS_LEDGER_IDS: [LedgerId; 3] =
    [LedgerId::POOL, LedgerId::DOMAIN, LedgerId::CONFIG];

/// Protocol faults attributed to a peer. Accumulating enough of them
/// makes the replica propose a view change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Suspicion {
    PprFromNonPrimary,
    PprDuplicate,
    PprTimeDiverged,
    PprDigestWrong,
    PprStateRootWrong,
    PprTxnRootWrong,
    PprBlsMultisigWrong,
    PrInconsistent,
    CmBlsSigWrong,
    NvSelectionMismatch,
}

/// Where a batch stands in the pipeline.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum BatchPhase {
    PrePrepared,
    Prepared,
    Committed,
    Ordered,
}

/// Everything remembered about one `(view_no, pp_seq_no)`.
struct BatchState {
    pre_prepare: PrePrepare,
    prepares: HashMap<NodeId, Prepare>,
    commits: HashMap<NodeId, Commit>,
    phase: BatchPhase,
    our_commit_sent: bool,
}

/// Emitted once per ordered batch, in strictly increasing
/// `(view_no, pp_seq_no)` order.
#[derive(Debug, Clone)]
pub struct OrderedEvent {
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
    pub ledger_id: LedgerId,
    pub req_idr: Vec<RequestKey>,
    pub pp_time: Timestamp,
    pub state_root: Digest,
    pub txn_root: Digest,
}

struct FinalizedRequest {
    request: Request,
    received_at: Timestamp,
}

/// One replica instance of the ordering pipeline.
pub struct OrderingService {
    node_id: NodeId,
    inst_id: usize,
    is_master: bool,
    config: Config,
    view: ViewInfo,

    ledgers: HashMap<LedgerId, Ledger>,
    states: HashMap<LedgerId, State>,

    requests: HashMap<RequestKey, FinalizedRequest>,
    request_queues: HashMap<LedgerId, LinkedHashMap<RequestKey, Timestamp>>,

    batches: BTreeMap<(ViewNo, SeqNo), BatchState>,
    last_pp_seq_no: SeqNo,
    last_ordered: (ViewNo, SeqNo),
    last_freshness_update: HashMap<LedgerId, Timestamp>,

    pub bls: BlsAggregator,
    pub key_register: BlsKeyRegister,
    pub checkpoints: CheckpointService,

    /// Outbound messages for the transport layer.
    pub out_box: VecDeque<Envelope>,
    /// Ordered events not yet drained by the replica.
    pub ordered_events: Vec<OrderedEvent>,
    /// Protocol faults observed, for the replica's suspicion counters.
    pub suspicions: Vec<(NodeId, Suspicion)>,
}

impl OrderingService {
    /// Creates an instance with its ledgers rooted under `dir`.
    pub fn new(
        node_id: NodeId,
        inst_id: usize,
        view: ViewInfo,
        config: Config,
        dir: &Path,
        bls_signer: Option<BlsSigner>,
    ) -> Result<Self> {
        config.validate()?;
        let is_master = inst_id == 0;
        let mut ledgers = HashMap::new();
        let mut states = HashMap::new();
        if is_master {
            for (ledger_id, name) in [
                (LedgerId::POOL, "pool_transactions"),
                (LedgerId::DOMAIN, "domain_transactions"),
                (LedgerId::CONFIG, "config_transactions"),
                (LedgerId::AUDIT, "audit_transactions"),
            ] {
                let ledger = Ledger::open(dir.join(name), config.ensure_ledger_durability)?;
                ledgers.insert(ledger_id, ledger);
                states.insert(ledger_id, State::new());
            }
        }
        let checkpoints = CheckpointService::new(inst_id, config.chk_freq, config.log_size);
        let mut request_queues = HashMap::new();
        for ledger_id in FRESHNESS_LEDGER_IDS {
            request_queues.insert(ledger_id, LinkedHashMap::new());
        }
        let mut service = Self {
            node_id,
            inst_id,
            is_master,
            config,
            view,
            ledgers,
            states,
            requests: HashMap::new(),
            request_queues,
            batches: BTreeMap::new(),
            last_pp_seq_no: SeqNo::ZERO,
            last_ordered: (ViewNo::ZERO, SeqNo::ZERO),
            last_freshness_update: HashMap::new(),
            bls: BlsAggregator::new(bls_signer),
            key_register: BlsKeyRegister::new(),
            checkpoints,
            out_box: VecDeque::new(),
            ordered_events: Vec::new(),
            suspicions: Vec::new(),
        };
        // a restarted replica rebuilds its tries from the record files
        for ledger_id in FRESHNESS_LEDGER_IDS {
            service.replay_ledger_into_state(ledger_id, 0)?;
        }
        Ok(service)
    }

    pub fn view(&self) -> &ViewInfo {
        &self.view
    }

    pub fn is_primary(&self) -> bool {
        self.view.primary_of(self.inst_id) == &self.node_id
    }

    pub fn last_ordered_3pc(&self) -> (ViewNo, SeqNo) {
        self.last_ordered
    }

    pub fn ledger(&self, ledger_id: LedgerId) -> Option<&Ledger> {
        self.ledgers.get(&ledger_id)
    }

    pub fn ledgers(&self) -> &HashMap<LedgerId, Ledger> {
        &self.ledgers
    }

    pub fn ledgers_mut(&mut self) -> &mut HashMap<LedgerId, Ledger> {
        &mut self.ledgers
    }

    pub fn state(&self, ledger_id: LedgerId) -> Option<&State> {
        self.states.get(&ledger_id)
    }

    /// Whether 3PC context exists for a key; votes arriving before
    /// their PrePrepare are stashed by the replica until it does.
    pub fn has_batch(&self, view_no: ViewNo, pp_seq_no: SeqNo) -> bool {
        self.batches.contains_key(&(view_no, pp_seq_no))
    }

    // internal lookups; a miss here means the instance's own
    // bookkeeping broke, which is not something to order through
    fn ledger_ref(&self, ledger_id: LedgerId) -> Result<&Ledger> {
        self.ledgers
            .get(&ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no ledger on this instance"))
    }

    fn ledger_mut(&mut self, ledger_id: LedgerId) -> Result<&mut Ledger> {
        self.ledgers
            .get_mut(&ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no ledger on this instance"))
    }

    fn state_ref(&self, ledger_id: LedgerId) -> Result<&State> {
        self.states
            .get(&ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no state on this instance"))
    }

    fn state_mut(&mut self, ledger_id: LedgerId) -> Result<&mut State> {
        self.states
            .get_mut(&ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no state on this instance"))
    }

    fn queue_mut(
        &mut self,
        ledger_id: LedgerId,
    ) -> Result<&mut LinkedHashMap<RequestKey, Timestamp>> {
        self.request_queues
            .get_mut(&ledger_id)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no request queue for this ledger"))
    }

    fn batch_ref(&self, key: (ViewNo, SeqNo)) -> Result<&BatchState> {
        self.batches
            .get(&key)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no 3pc context for this key"))
    }

    fn batch_mut(&mut self, key: (ViewNo, SeqNo)) -> Result<&mut BatchState> {
        self.batches
            .get_mut(&key)
            .ok_or_else(|| Error::new(ErrorKind::Fatal, "no 3pc context for this key"))
    }

    fn suspect(&mut self, who: NodeId, what: Suspicion) {
        warn!(node = %who, suspicion = ?what, "protocol violation recorded");
        self.suspicions.push((who, what));
    }

    // -- client requests --

    /// Validates, finalizes and queues a client request.
    pub fn receive_request(&mut self, request: Request, now: Timestamp) -> Result<()> {
        if !FRESHNESS_LEDGER_IDS.contains(&request.ledger_id) {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "requests cannot target the audit ledger",
            ));
        }
        if !request.operation.is_object() {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "operation must be a canonical object",
            ));
        }
        verify_request_signatures(&request)?;

        let key = request.key();
        if self.requests.contains_key(&key) {
            // duplicate submission; the first copy wins
            return Ok(());
        }
        self.queue_mut(request.ledger_id)?.insert(key.clone(), now);
        self.requests.insert(key, FinalizedRequest { request, received_at: now });
        Ok(())
    }

    /// Drops requests that outlived their lifecycle bounds.
    pub fn check_request_timeouts(&mut self, now: Timestamp) {
        let propagates = self.config.propagates_phase_req_timeout.as_secs();
        let ordering = self.config.ordering_phase_req_timeout.as_secs();
        let mut outdated = Vec::new();
        for (key, state) in &self.requests {
            let queued = self
                .request_queues
                .get(&state.request.ledger_id)
                .map(|q| q.contains_key(key))
                .unwrap_or(false);
            let age = now.saturating_sub(state.received_at);
            if (queued && age > propagates) || age > ordering {
                outdated.push(key.clone());
            }
        }
        for key in outdated {
            warn!(identifier = %key.0, req_id = key.1, "discarding outdated request");
            if let Some(state) = self.requests.remove(&key) {
                if let Some(queue) = self.request_queues.get_mut(&state.request.ledger_id) {
                    queue.remove(&key);
                }
            }
        }
    }

    // -- primary side --

    /// Primary batching tick: forms a batch per ledger when size or
    /// wait thresholds are crossed, and freshness batches for idle
    /// ledgers.
    pub fn send_3pc_batch(&mut self, now: Timestamp) -> Result<()> {
        if !self.is_primary() {
            return Ok(());
        }
        // the freshness clock starts at the first batching tick
        if self.is_master {
            for ledger_id in FRESHNESS_LEDGER_IDS {
                self.last_freshness_update.entry(ledger_id).or_insert(now);
            }
        }
        if self.in_flight() >= self.config.max_3pc_batches_in_flight {
            return Ok(());
        }
        for ledger_id in FRESHNESS_LEDGER_IDS {
            let queued = self
                .request_queues
                .get(&ledger_id)
                .and_then(|q| q.front().map(|(_, oldest)| (q.len(), *oldest)));
            if let Some((queue_len, oldest)) = queued {
                let waited = now.saturating_sub(oldest);
                if queue_len >= self.config.max_3pc_batch_size
                    || waited >= self.config.max_3pc_batch_wait.as_secs()
                {
                    self.do_send_3pc_batch(ledger_id, now)?;
                }
            } else if self.needs_freshness_batch(ledger_id, now) {
                self.do_send_3pc_batch(ledger_id, now)?;
            }
            if self.in_flight() >= self.config.max_3pc_batches_in_flight {
                break;
            }
        }
        Ok(())
    }

    fn needs_freshness_batch(&self, ledger_id: LedgerId, now: Timestamp) -> bool {
        // only the master instance refreshes signed state
        if !self.is_master || !self.config.freshness_enabled {
            return false;
        }
        let last = self.last_freshness_update.get(&ledger_id).copied().unwrap_or(0);
        now.saturating_sub(last) > self.config.state_freshness_update_interval.as_secs()
    }

    /// Builds and multicasts one batch for `ledger_id`; empty
    /// `req_idr` makes it a freshness batch.
    pub fn do_send_3pc_batch(&mut self, ledger_id: LedgerId, now: Timestamp) -> Result<()> {
        let mut req_idr = Vec::new();
        {
            let max_batch_size = self.config.max_3pc_batch_size;
            let queue = self.queue_mut(ledger_id)?;
            while req_idr.len() < max_batch_size {
                match queue.pop_front() {
                    Some((key, _)) => req_idr.push(key),
                    None => break,
                }
            }
        }

        let pp_seq_no = self.last_pp_seq_no.next();
        let view_no = self.view.view_no();
        let (state_root, txn_root, audit_txn_root) =
            self.apply_batch(ledger_id, &req_idr, view_no, pp_seq_no, now)?;

        let mut pre_prepare = PrePrepare {
            inst_id: self.inst_id,
            view_no,
            pp_seq_no,
            pp_time: now,
            ledger_id,
            req_idr,
            digest: Digest::blank(),
            state_root,
            txn_root,
            sub_seq_no: 0,
            is_final: true,
            audit_txn_root: Some(audit_txn_root),
            bls_multi_sig: self.bls.latest_for(ledger_id).cloned(),
            bls_multi_sigs: self.bls.latest_multi_sigs(),
        };
        pre_prepare.digest = pre_prepare.batch_digest()?;

        self.track_multi_sig_value(&pre_prepare)?;
        self.last_pp_seq_no = pp_seq_no;
        if pre_prepare.is_freshness_batch() {
            self.last_freshness_update.insert(ledger_id, now);
        }

        debug!(ledger = ?ledger_id, view = %view_no, seq = %pp_seq_no,
               freshness = pre_prepare.is_freshness_batch(), "3pc batch sent");
        let mut state = BatchState {
            pre_prepare: pre_prepare.clone(),
            prepares: HashMap::new(),
            commits: HashMap::new(),
            phase: BatchPhase::PrePrepared,
            our_commit_sent: false,
        };
        // the PrePrepare stands in for the primary's Prepare vote
        state.prepares.insert(
            self.node_id.clone(),
            Prepare {
                inst_id: self.inst_id,
                view_no,
                pp_seq_no,
                digest: pre_prepare.digest,
                state_root: pre_prepare.state_root,
                txn_root: pre_prepare.txn_root,
            },
        );
        self.batches.insert((view_no, pp_seq_no), state);
        self.out_box.push_back(Envelope::broadcast(Message::PrePrepare(pre_prepare)));
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.batches.values().filter(|b| b.phase < BatchPhase::Ordered).count()
    }

    /// Applies a batch to the uncommitted heads and returns the three
    /// roots a PrePrepare commits to.
    fn apply_batch(
        &mut self,
        ledger_id: LedgerId,
        req_idr: &[RequestKey],
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        pp_time: Timestamp,
    ) -> Result<(Digest, Digest, Digest)> {
        if !self.is_master {
            return Ok((Digest::blank(), Digest::blank(), Digest::blank()));
        }
        for key in req_idr {
            let request = self
                .requests
                .get(key)
                .map(|r| r.request.clone())
                .ok_or_else(|| Error::new(ErrorKind::Fatal, "batched request not held"))?;
            let txn = canonical_bytes(&request)?;
            let digest = request.digest()?;
            let operation = canonical_bytes(&request.operation)?;
            self.ledger_mut(ledger_id)?.append(&txn)?;
            self.state_mut(ledger_id)?.set(digest.as_ref(), &operation)?;
        }

        let state_root = Digest::from_bytes(&self.state_ref(ledger_id)?.uncommitted_root())?;
        let txn_root = self.ledger_ref(ledger_id)?.uncommitted_root_hash();

        // every batch, freshness included, binds its roots into the
        // audit ledger
        let audit_row = serde_json::json!({
            "ledger_id": ledger_id,
            "view_no": view_no,
            "pp_seq_no": u64::from(pp_seq_no),
            "pp_time": pp_time,
            "state_root": state_root,
            "txn_root": txn_root,
        });
        let encoded_row = canonical_bytes(&audit_row)?;
        let (_, audit_txn_root) = self.ledger_mut(LedgerId::AUDIT)?.append(&encoded_row)?;
        Ok((state_root, txn_root, audit_txn_root))
    }

    fn track_multi_sig_value(&mut self, pre_prepare: &PrePrepare) -> Result<()> {
        if !self.is_master {
            return Ok(());
        }
        let pool_state_root =
            Digest::from_bytes(&self.state_ref(LedgerId::POOL)?.uncommitted_root())?;
        let value = MultiSignatureValue {
            ledger_id: pre_prepare.ledger_id,
            state_root: pre_prepare.state_root,
            pool_state_root,
            txn_root: pre_prepare.txn_root,
            timestamp: pre_prepare.pp_time,
        };
        self.bls.track_value(pre_prepare.view_no, pre_prepare.pp_seq_no, value);
        Ok(())
    }

    // -- non-primary side --

    /// Validates a primary's PrePrepare, re-executes it and answers
    /// with a Prepare when everything checks out.
    pub fn process_pre_prepare(
        &mut self,
        pre_prepare: PrePrepare,
        from: NodeId,
        now: Timestamp,
    ) -> Result<()> {
        if pre_prepare.view_no != self.view.view_no() {
            return Ok(()); // the replica stashes cross-view traffic
        }
        if &from != self.view.primary_of(self.inst_id) {
            self.suspect(from, Suspicion::PprFromNonPrimary);
            return Ok(());
        }
        if pre_prepare.pp_seq_no <= self.last_pp_seq_no {
            self.suspect(from, Suspicion::PprDuplicate);
            return Ok(());
        }
        if !self.checkpoints.in_watermarks(pre_prepare.pp_seq_no) {
            return Ok(()); // outside the window; replica stash
        }
        let deviation = self.config.acceptable_deviation_preprepare.as_secs();
        if pre_prepare.pp_time.abs_diff(now) > deviation {
            self.suspect(from, Suspicion::PprTimeDiverged);
            return Ok(());
        }
        if pre_prepare.digest != pre_prepare.batch_digest()? {
            self.suspect(from, Suspicion::PprDigestWrong);
            return Ok(());
        }
        for multi_sig in pre_prepare
            .bls_multi_sigs
            .iter()
            .chain(pre_prepare.bls_multi_sig.iter())
        {
            if !verify_multi_sig(&self.key_register, multi_sig, self.view.quorums()) {
                self.suspect(from, Suspicion::PprBlsMultisigWrong);
                return Ok(());
            }
        }

        if self.is_master && !self.has_all_requests(&pre_prepare) {
            // propagation has not delivered every referenced request
            // yet; the replica stashes and retries
            return Ok(());
        }

        // re-execute and compare commitments
        if self.is_master {
            for key in &pre_prepare.req_idr {
                self.request_queues
                    .get_mut(&pre_prepare.ledger_id)
                    .map(|q| q.remove(key));
            }
            let (state_root, txn_root, _) = self.apply_batch(
                pre_prepare.ledger_id,
                &pre_prepare.req_idr,
                pre_prepare.view_no,
                pre_prepare.pp_seq_no,
                pre_prepare.pp_time,
            )?;
            if state_root != pre_prepare.state_root {
                self.revert_uncommitted()?;
                self.suspect(from, Suspicion::PprStateRootWrong);
                return Ok(());
            }
            if txn_root != pre_prepare.txn_root {
                self.revert_uncommitted()?;
                self.suspect(from, Suspicion::PprTxnRootWrong);
                return Ok(());
            }
        }

        self.track_multi_sig_value(&pre_prepare)?;
        self.last_pp_seq_no = pre_prepare.pp_seq_no;

        let prepare = Prepare {
            inst_id: self.inst_id,
            view_no: pre_prepare.view_no,
            pp_seq_no: pre_prepare.pp_seq_no,
            digest: pre_prepare.digest,
            state_root: pre_prepare.state_root,
            txn_root: pre_prepare.txn_root,
        };
        let key = (pre_prepare.view_no, pre_prepare.pp_seq_no);
        let mut state = BatchState {
            pre_prepare,
            prepares: HashMap::new(),
            commits: HashMap::new(),
            phase: BatchPhase::PrePrepared,
            our_commit_sent: false,
        };
        // the accepted PrePrepare is the primary's Prepare vote, and
        // our own counts as well
        state.prepares.insert(from, prepare.clone());
        state.prepares.insert(self.node_id.clone(), prepare.clone());
        self.batches.insert(key, state);
        self.out_box.push_back(Envelope::broadcast(Message::Prepare(prepare)));
        self.try_reach_prepared(key)?;
        Ok(())
    }

    /// Accumulates a Prepare vote.
    pub fn process_prepare(&mut self, prepare: Prepare, from: NodeId) -> Result<()> {
        if prepare.view_no != self.view.view_no() {
            return Ok(());
        }
        let key = (prepare.view_no, prepare.pp_seq_no);
        let state = match self.batches.get_mut(&key) {
            Some(state) => state,
            None => return Ok(()), // replica stashes until the PrePrepare lands
        };
        let expected = &state.pre_prepare;
        if prepare.digest != expected.digest
            || prepare.state_root != expected.state_root
            || prepare.txn_root != expected.txn_root
        {
            self.suspect(from, Suspicion::PrInconsistent);
            return Ok(());
        }
        if state.prepares.insert(from, prepare).is_some() {
            // within a view a node never sends two distinct Prepares
            // for one sequence; a repeat is just ignored
            return Ok(());
        }
        self.try_reach_prepared(key)
    }

    fn try_reach_prepared(&mut self, key: (ViewNo, SeqNo)) -> Result<()> {
        let strong = self.view.quorums().strong();
        let (ledger_id, ready) = {
            let state = self.batch_ref(key)?;
            (
                state.pre_prepare.ledger_id,
                state.phase == BatchPhase::PrePrepared
                    && state.prepares.len() >= strong
                    && !state.our_commit_sent,
            )
        };
        if !ready {
            return Ok(());
        }

        let share = match self.bls.value_of(key.0, key.1, ledger_id) {
            Some(value) => self.bls.sign_value(value)?,
            None => None,
        };
        let commit = Commit {
            inst_id: self.inst_id,
            view_no: key.0,
            pp_seq_no: key.1,
            bls_sig_share: share.clone(),
        };

        let own_id = self.node_id.clone();
        let state = self.batch_mut(key)?;
        state.phase = BatchPhase::Prepared;
        state.our_commit_sent = true;
        state.commits.insert(own_id, commit.clone());
        debug!(view = %key.0, seq = %key.1, "prepare quorum reached");

        if let Some(share) = share {
            let from = self.node_id.clone();
            // our own share joins the aggregation pool
            let _ = self.bls.add_share(&self.key_register, key.0, key.1, ledger_id, from, &share);
        }
        self.out_box.push_back(Envelope::broadcast(Message::Commit(commit)));
        self.try_reach_committed(key)
    }

    /// Accumulates a Commit vote and its BLS share.
    pub fn process_commit(&mut self, commit: Commit, from: NodeId) -> Result<()> {
        if commit.view_no != self.view.view_no() {
            return Ok(());
        }
        let key = (commit.view_no, commit.pp_seq_no);
        let ledger_id = match self.batches.get(&key) {
            Some(state) => state.pre_prepare.ledger_id,
            None => return Ok(()), // replica stash until 3PC context exists
        };

        if let Some(share) = commit.bls_sig_share.clone() {
            let added = self.bls.add_share(
                &self.key_register,
                key.0,
                key.1,
                ledger_id,
                from.clone(),
                &share,
            );
            if let Err(e) = added {
                if e.kind() == ErrorKind::ProofInvalid {
                    // the share is excluded from the aggregate, but
                    // the Commit still counts as a vote
                    self.suspect(from.clone(), Suspicion::CmBlsSigWrong);
                }
            }
        }

        let state = self.batch_mut(key)?;
        if state.commits.insert(from, commit).is_some() {
            return Ok(());
        }
        self.try_reach_committed(key)?;
        // a share arriving after the batch ordered can still complete
        // the multi-signature
        if self.batches.get(&key).map(|b| b.phase) == Some(BatchPhase::Ordered) {
            let _ = self.bls.try_aggregate(key.0, key.1, ledger_id, self.view.quorums());
        }
        Ok(())
    }

    fn try_reach_committed(&mut self, key: (ViewNo, SeqNo)) -> Result<()> {
        let strong = self.view.quorums().strong();
        let ready = {
            let state = self.batch_ref(key)?;
            state.phase == BatchPhase::Prepared && state.commits.len() >= strong
        };
        if !ready {
            return Ok(());
        }
        self.batch_mut(key)?.phase = BatchPhase::Committed;
        debug!(view = %key.0, seq = %key.1, "commit quorum reached");
        self.process_stashed_out_of_order_commits()
    }

    /// Orders every committed batch whose predecessor has ordered;
    /// also the retry body of the stashed-commit timer.
    pub fn process_stashed_out_of_order_commits(&mut self) -> Result<()> {
        loop {
            let next = (self.view.view_no(), self.next_to_order());
            let ready = self
                .batches
                .get(&next)
                .map(|b| b.phase == BatchPhase::Committed)
                .unwrap_or(false);
            if !ready {
                return Ok(());
            }
            self.order_3pc_key(next)?;
        }
    }

    fn next_to_order(&self) -> SeqNo {
        // sequence numbers continue above the transferred history
        // after a view change, so the successor is the same either way
        self.last_ordered.1.next()
    }

    fn order_3pc_key(&mut self, key: (ViewNo, SeqNo)) -> Result<()> {
        let pre_prepare = {
            let state = self.batch_mut(key)?;
            state.phase = BatchPhase::Ordered;
            state.pre_prepare.clone()
        };

        if self.is_master {
            self.commit_batch(&pre_prepare)?;
        }
        for req_key in &pre_prepare.req_idr {
            self.requests.remove(req_key);
            if let Some(queue) = self.request_queues.get_mut(&pre_prepare.ledger_id) {
                queue.remove(req_key);
            }
        }
        self.last_ordered = key;
        self.last_freshness_update.insert(pre_prepare.ledger_id, pre_prepare.pp_time);

        let _ = self.bls.try_aggregate(key.0, key.1, pre_prepare.ledger_id, self.view.quorums());

        info!(view = %key.0, seq = %key.1, ledger = ?pre_prepare.ledger_id, "batch ordered");
        self.ordered_events.push(OrderedEvent {
            view_no: key.0,
            pp_seq_no: key.1,
            ledger_id: pre_prepare.ledger_id,
            req_idr: pre_prepare.req_idr.clone(),
            pp_time: pre_prepare.pp_time,
            state_root: pre_prepare.state_root,
            txn_root: pre_prepare.txn_root,
        });

        let summary = self
            .ledgers
            .get(&LedgerId::AUDIT)
            .map(|l| l.root_hash())
            .unwrap_or_else(|| pre_prepare.digest);
        let own_id = self.node_id.clone();
        if let Some(checkpoint) = self.checkpoints.on_batch_ordered(&own_id, key.0, key.1, summary)
        {
            self.out_box.push_back(Envelope::broadcast(Message::Checkpoint(checkpoint)));
        }
        Ok(())
    }

    fn commit_batch(&mut self, pre_prepare: &PrePrepare) -> Result<()> {
        let ledger = self.ledger_mut(pre_prepare.ledger_id)?;
        ledger.commit_to(ledger.size())?;
        self.state_mut(pre_prepare.ledger_id)?.commit();
        let audit = self.ledger_mut(LedgerId::AUDIT)?;
        audit.commit_to(audit.size())?;
        Ok(())
    }

    fn revert_uncommitted(&mut self) -> Result<()> {
        for ledger in self.ledgers.values_mut() {
            ledger.discard_uncommitted()?;
        }
        for state in self.states.values_mut() {
            state.revert();
        }
        Ok(())
    }

    // -- checkpoints --

    pub fn process_checkpoint(&mut self, checkpoint: &Checkpoint, from: NodeId) -> Result<()> {
        if let Some(stable) =
            self.checkpoints.process_checkpoint(from, checkpoint, self.view.quorums())
        {
            self.gc_below_stable(stable);
        }
        Ok(())
    }

    fn gc_below_stable(&mut self, stable: SeqNo) {
        let view_no = self.view.view_no();
        self.batches.retain(|(v, s), _| *v > view_no || *s > stable);
        self.bls.gc_below(view_no, stable);
        debug!(stable = %stable, "3pc state below the stable checkpoint collected");
    }

    // -- view change integration --

    /// Batches this replica saw a Prepare quorum for, above the
    /// stable checkpoint.
    pub fn prepared_certificates(&self) -> Vec<BatchId> {
        self.batches
            .iter()
            .filter(|((_, s), b)| {
                *s > self.checkpoints.stable_seq() && b.phase >= BatchPhase::Prepared
            })
            .map(|((v, s), b)| BatchId {
                view_no: *v,
                pp_seq_no: *s,
                digest: b.pre_prepare.digest,
                state_root: b.pre_prepare.state_root,
                txn_root: b.pre_prepare.txn_root,
            })
            .collect()
    }

    /// Batches this replica accepted a PrePrepare for, above the
    /// stable checkpoint.
    pub fn preprepared_certificates(&self) -> Vec<BatchId> {
        self.batches
            .iter()
            .filter(|((_, s), _)| *s > self.checkpoints.stable_seq())
            .map(|((v, s), b)| BatchId {
                view_no: *v,
                pp_seq_no: *s,
                digest: b.pre_prepare.digest,
                state_root: b.pre_prepare.state_root,
                txn_root: b.pre_prepare.txn_root,
            })
            .collect()
    }

    /// Installs a new view: rolls back uncommitted work, resets
    /// non-ordered batches above the checkpoint and re-orders the
    /// NewView selection.
    pub fn install_new_view(
        &mut self,
        view: ViewInfo,
        checkpoint_seq: SeqNo,
        batches: &[BatchId],
    ) -> Result<()> {
        if self.is_master {
            self.revert_uncommitted()?;
        }
        let old_batches = std::mem::take(&mut self.batches);
        let mut by_digest: HashMap<Digest, PrePrepare> = old_batches
            .into_values()
            .map(|b| (b.pre_prepare.digest, b.pre_prepare))
            .collect();

        self.view = view;
        let view_no = self.view.view_no();
        self.checkpoints.install_stable(checkpoint_seq);
        if self.last_ordered.1 < checkpoint_seq {
            self.last_ordered = (view_no, checkpoint_seq);
        } else {
            self.last_ordered = (view_no, self.last_ordered.1);
        }

        // re-order the transferred history deterministically
        for batch in batches {
            if batch.pp_seq_no <= self.last_ordered.1 {
                continue;
            }
            if let Some(original) = by_digest.remove(&batch.digest) {
                let re_pp = PrePrepare { view_no, ..original };
                if self.is_master && !re_pp.is_freshness_batch() {
                    let (state_root, txn_root, _) = self.apply_batch(
                        re_pp.ledger_id,
                        &re_pp.req_idr,
                        view_no,
                        re_pp.pp_seq_no,
                        re_pp.pp_time,
                    )?;
                    if state_root != batch.state_root || txn_root != batch.txn_root {
                        return Err(Error::new(
                            ErrorKind::Fatal,
                            "transferred batch replays to different roots",
                        ));
                    }
                }
                self.batches.insert(
                    (view_no, batch.pp_seq_no),
                    BatchState {
                        pre_prepare: re_pp,
                        prepares: HashMap::new(),
                        commits: HashMap::new(),
                        phase: BatchPhase::Committed,
                        our_commit_sent: true,
                    },
                );
                self.order_3pc_key((view_no, batch.pp_seq_no))?;
            } else {
                // gap filled with a no-op batch to keep the sequence
                // contiguous
                self.last_ordered = (view_no, batch.pp_seq_no);
            }
        }
        self.last_pp_seq_no = self.last_ordered.1;
        info!(view = %view_no, "new view installed, ordering resumed");
        Ok(())
    }

    /// Whether every request a PrePrepare references is held locally.
    pub fn has_all_requests(&self, pre_prepare: &PrePrepare) -> bool {
        pre_prepare.req_idr.iter().all(|k| self.requests.contains_key(k))
    }

    /// Replays a committed ledger suffix into the state trie; used on
    /// restart (whole ledger) and after catch-up (fetched suffix).
    pub fn replay_ledger_into_state(&mut self, ledger_id: LedgerId, from_size: u64) -> Result<()> {
        if !self.is_master || ledger_id == LedgerId::AUDIT {
            return Ok(());
        }
        let txns: Vec<Vec<u8>> = {
            let ledger = self.ledger_ref(ledger_id)?;
            (from_size + 1..=ledger.committed_size())
                .filter_map(|seq_no| ledger.get(seq_no).map(|t| t.to_vec()))
                .collect()
        };
        if txns.is_empty() {
            return Ok(());
        }
        for raw in txns {
            let request: Request = serde_json::from_slice(&raw)
                .or_fault(ErrorKind::Fatal, "ledger record is not a canonical request")?;
            let digest = request.digest()?;
            let operation = canonical_bytes(&request.operation)?;
            self.state_mut(ledger_id)?.set(digest.as_ref(), &operation)?;
        }
        self.state_mut(ledger_id)?.commit();
        Ok(())
    }

    /// Resumes after catch-up from a known stable point.
    pub fn sync_to(&mut self, view_no: ViewNo, pp_seq_no: SeqNo) {
        if (view_no, pp_seq_no) > self.last_ordered {
            self.last_ordered = (view_no, pp_seq_no);
            self.last_pp_seq_no = pp_seq_no;
            self.checkpoints.install_stable(pp_seq_no);
        }
    }
}

/// Checks every signature a finalized request carries; at least one
/// is required, and the identifier itself must be a registered-format
/// Ed25519 key.
fn verify_request_signatures(request: &Request) -> Result<()> {
    if request.signatures.is_empty() {
        return Err(Error::new(ErrorKind::AuthFailure, "request carries no signatures"));
    }
    let message = request.signable_bytes()?;
    for (signer, signature_b58) in &request.signatures {
        let key_raw = bs58::decode(signer)
            .into_vec()
            .or_fault(ErrorKind::AuthFailure, "signer is not a base58 key")?;
        if key_raw.len() != 32 {
            return Err(Error::new(ErrorKind::AuthFailure, "signer key must be 32 bytes"));
        }
        let signature = bs58::decode(signature_b58)
            .into_vec()
            .or_fault(ErrorKind::AuthFailure, "signature is not base58")?;
        UnparsedPublicKey::new(&ED25519, key_raw)
            .verify(&message, &signature)
            .or_fault(ErrorKind::AuthFailure, "request signature does not verify")?;
    }
    Ok(())
}
