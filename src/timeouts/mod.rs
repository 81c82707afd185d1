//! A single monotonic timer service owning every scheduled callback.
//!
//! All protocol layers register deadlines here and cancel them by
//! token; nothing cancels by name matching. The replica's event loop
//! calls `advance` with the current monotonic time and dispatches
//! whatever fired. Cancellation is lazy: a cancelled token stays in
//! the heap but is skipped when its deadline pops.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::ordering::{LedgerId, ViewNo};

/// Milliseconds on the replica's monotonic clock.
pub type Instant = u64;

/// Cancellation token for one scheduled deadline.
pub type TimerToken = u64;

/// What a deadline means to the layer that scheduled it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimerKind {
    /// Batch-wait cadence of the ordering service.
    Batch3Pc,
    /// Retry stashed out-of-order Commits.
    ProcessStashedCommits,
    /// Scan request lifecycle timeouts.
    RequestLifecycle,
    /// The primary has been disconnected for too long.
    PrimaryDisconnected,
    /// No NewView arrived after the certificate became reachable.
    NewViewWait { view_no: ViewNo },
    /// First view-change propose timer.
    ProposeViewChange { view_no: ViewNo },
    /// Catch-up is still waiting for ledger statuses.
    ReaskLedgerStatus { ledger_id: LedgerId },
    /// Catch-up is still waiting for a consistency proof.
    ReaskConsistencyProof { ledger_id: LedgerId },
    /// Periodic monitor comparison.
    PerfCheck,
}

/// Owns every scheduled deadline in the replica.
pub struct TimerService {
    next_token: TimerToken,
    heap: BinaryHeap<Reverse<(Instant, TimerToken)>>,
    pending: HashMap<TimerToken, TimerKind>,
}

impl TimerService {
    pub fn new() -> Self {
        Self { next_token: 0, heap: BinaryHeap::new(), pending: HashMap::new() }
    }

    /// Schedules `kind` to fire `delay` after `now` and returns its
    /// cancellation token.
    pub fn schedule(&mut self, now: Instant, delay: Duration, kind: TimerKind) -> TimerToken {
        let token = self.next_token;
        self.next_token += 1;
        let deadline = now + delay.as_millis() as u64;
        self.heap.push(Reverse((deadline, token)));
        self.pending.insert(token, kind);
        token
    }

    /// Cancels one deadline; a no-op if it already fired.
    pub fn cancel(&mut self, token: TimerToken) {
        self.pending.remove(&token);
    }

    /// Cancels every pending deadline matching `predicate`.
    pub fn cancel_matching(&mut self, predicate: impl Fn(&TimerKind) -> bool) {
        self.pending.retain(|_, kind| !predicate(kind));
    }

    /// True if any live deadline matches `predicate`.
    pub fn has_pending(&self, predicate: impl Fn(&TimerKind) -> bool) -> bool {
        self.pending.values().any(predicate)
    }

    /// Pops every deadline at or before `now`, in firing order.
    pub fn advance(&mut self, now: Instant) -> Vec<(TimerToken, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.pending.remove(&token) {
                fired.push((token, kind));
            }
        }
        fired
    }

    /// The next live deadline, if any; lets the driver sleep exactly
    /// long enough.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|Reverse((_, token))| self.pending.contains_key(token))
            .map(|Reverse((deadline, _))| *deadline)
            .min()
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_fire_in_order() {
        let mut timers = TimerService::new();
        timers.schedule(0, Duration::from_secs(3), TimerKind::Batch3Pc);
        timers.schedule(0, Duration::from_secs(1), TimerKind::ProcessStashedCommits);
        timers.schedule(0, Duration::from_secs(2), TimerKind::PerfCheck);

        assert!(timers.advance(999).is_empty());
        let fired: Vec<_> = timers.advance(3000).into_iter().map(|(_, k)| k).collect();
        assert_eq!(
            fired,
            vec![TimerKind::ProcessStashedCommits, TimerKind::PerfCheck, TimerKind::Batch3Pc]
        );
        assert!(timers.advance(10_000).is_empty());
    }

    #[test]
    fn cancelled_tokens_never_fire() {
        let mut timers = TimerService::new();
        let token = timers.schedule(
            0,
            Duration::from_secs(5),
            TimerKind::ReaskLedgerStatus { ledger_id: crate::ordering::LedgerId::POOL },
        );
        timers.cancel(token);
        assert!(timers.advance(60_000).is_empty());
        assert!(!timers.has_pending(|_| true));
    }

    #[test]
    fn cancel_matching_sweeps_a_family_of_timers() {
        let mut timers = TimerService::new();
        for ledger_id in [LedgerId::POOL, LedgerId::DOMAIN, LedgerId::CONFIG] {
            timers.schedule(0, Duration::from_secs(5), TimerKind::ReaskLedgerStatus { ledger_id });
        }
        timers.schedule(0, Duration::from_secs(5), TimerKind::Batch3Pc);

        timers.cancel_matching(|k| matches!(k, TimerKind::ReaskLedgerStatus { .. }));
        assert!(!timers.has_pending(|k| matches!(k, TimerKind::ReaskLedgerStatus { .. })));
        let fired = timers.advance(5_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, TimerKind::Batch3Pc);
    }

    #[test]
    fn next_deadline_skips_cancelled_entries() {
        let mut timers = TimerService::new();
        let early = timers.schedule(0, Duration::from_secs(1), TimerKind::Batch3Pc);
        timers.schedule(0, Duration::from_secs(9), TimerKind::PerfCheck);
        assert_eq!(timers.next_deadline(), Some(1000));
        timers.cancel(early);
        assert_eq!(timers.next_deadline(), Some(9000));
    }
}
