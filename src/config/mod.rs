//! Behavioral configuration consumed by the replica core.
//!
//! Quorum sizes are never configured directly; they derive from the
//! pool size through `view::Quorums`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every knob the core recognizes, with the production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// After ordering every `chk_freq` batches, a replica sends a Checkpoint.
    pub chk_freq: u64,
    /// Size of the watermark window, in batch sequence numbers above
    /// the stable checkpoint.
    pub log_size: u64,
    /// A primary forms a batch after this many finalized requests, or
    /// after `max_3pc_batch_wait`, whichever is earlier.
    pub max_3pc_batch_size: usize,
    pub max_3pc_batch_wait: Duration,
    /// Bound on concurrently outstanding batches per instance.
    pub max_3pc_batches_in_flight: usize,
    /// When a ledger sees no requests for this long, the master primary
    /// sends an empty batch so signed state stays fresh.
    pub state_freshness_update_interval: Duration,
    pub freshness_enabled: bool,
    /// A PrePrepare whose proposed time diverges from the local clock
    /// by more than this is rejected.
    pub acceptable_deviation_preprepare: Duration,
    /// At most one ViewChange per target view is sent in any window of
    /// this size.
    pub view_change_window: Duration,
    /// How long a primary may stay disconnected before a view change
    /// is proposed.
    pub tolerate_primary_disconnection: Duration,
    /// Waiting for a NewView after the view-change certificate becomes
    /// reachable.
    pub new_view_timeout: Duration,
    pub initial_propose_view_change_timeout: Duration,
    pub consistency_proofs_timeout: Duration,
    pub catchup_transactions_timeout: Duration,
    /// How often (in ordered batches) the monitor compares instance
    /// performance.
    pub perf_check_freq: u64,
    /// Master throughput below `delta` times the backup median is
    /// degraded.
    pub delta: f64,
    /// Master latency above the backup median by more than `lambda`
    /// is degraded.
    pub lambda: Duration,
    /// The degradation condition must hold for this long before an
    /// InstanceChange fires.
    pub acc_monitor_timeout: Duration,
    /// A request that has not left the propagation phase within this
    /// bound is discarded as outdated.
    pub propagates_phase_req_timeout: Duration,
    /// A request not ordered within this bound is discarded as outdated.
    pub ordering_phase_req_timeout: Duration,
    pub replica_stash_limit: usize,
    pub view_change_service_stash_limit: usize,
    pub process_stashed_out_of_order_commits_interval: Duration,
    /// When true, every ledger append fsyncs; otherwise fsync is
    /// batched at commit.
    pub ensure_ledger_durability: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chk_freq: 100,
            log_size: 3 * 100,
            max_3pc_batch_size: 1000,
            max_3pc_batch_wait: Duration::from_secs(3),
            max_3pc_batches_in_flight: 4,
            state_freshness_update_interval: Duration::from_secs(300),
            freshness_enabled: true,
            acceptable_deviation_preprepare: Duration::from_secs(600),
            view_change_window: Duration::from_secs(60),
            tolerate_primary_disconnection: Duration::from_secs(60),
            new_view_timeout: Duration::from_secs(30),
            initial_propose_view_change_timeout: Duration::from_secs(60),
            consistency_proofs_timeout: Duration::from_secs(5),
            catchup_transactions_timeout: Duration::from_secs(6),
            perf_check_freq: 10,
            delta: 0.1,
            lambda: Duration::from_secs(240),
            acc_monitor_timeout: Duration::from_secs(300),
            propagates_phase_req_timeout: Duration::from_secs(36_000),
            ordering_phase_req_timeout: Duration::from_secs(72_000),
            replica_stash_limit: 100_000,
            view_change_service_stash_limit: 1_000,
            process_stashed_out_of_order_commits_interval: Duration::from_secs(1),
            ensure_ledger_durability: false,
        }
    }
}

impl Config {
    /// The watermark window must cover at least one checkpoint span,
    /// otherwise checkpoints can never stabilize.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::{ErrorKind, Error};
        if self.log_size < self.chk_freq {
            return Err(Error::new(
                ErrorKind::InputMalformed,
                "log_size smaller than chk_freq",
            ));
        }
        if self.max_3pc_batch_size == 0 {
            return Err(Error::new(ErrorKind::InputMalformed, "empty batch size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let c = Config::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.log_size, 3 * c.chk_freq);
    }

    #[test]
    fn rejects_window_smaller_than_checkpoint_span() {
        let c = Config { log_size: 10, chk_freq: 100, ..Config::default() };
        assert!(c.validate().is_err());
    }
}
