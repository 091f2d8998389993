//! Bookkeeping for assured updates awaiting acknowledgement.
//!
//! The coordinator owns the one structure that is genuinely shared between
//! the operation threads and the receive loop: the pending map from CSN to
//! waiter. An operation registers before publishing, then blocks on its
//! waiter; the receive loop delivers acknowledgements. The hand-off is a
//! oneshot channel per CSN, the deadline a hard wall-clock timeout.
//!
//! An acknowledgement carrying error flags still unblocks the caller as
//! acknowledged: the update reached the replication server, the flags only
//! describe downstream trouble and feed the monitoring counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use dirsync_proto::msg::{AckMsg, AssuredMode};
use dirsync_proto::Csn;

use crate::metrics::{Counter, ReplicationMonitor};

/// Completion status handed back to the originating caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// An acknowledgement arrived before the deadline.
    Acknowledged {
        /// True when the acknowledgement carried downstream error flags.
        errors: bool,
    },
    /// No acknowledgement arrived before the deadline.
    TimedOut,
    /// The session was torn down while waiting.
    SessionClosed,
}

/// Claim ticket for one registered assured update.
#[derive(Debug)]
pub struct AssuredWaiter {
    csn: Csn,
    mode: AssuredMode,
    local_id: u16,
    rx: oneshot::Receiver<AckMsg>,
}

struct Pending {
    mode: AssuredMode,
    tx: oneshot::Sender<AckMsg>,
}

/// Tracks outstanding assured updates for one domain.
pub struct AssuredCoordinator {
    timeout: Mutex<Duration>,
    pending: Mutex<HashMap<Csn, Pending>>,
    monitor: Arc<dyn ReplicationMonitor>,
}

impl AssuredCoordinator {
    /// Create a coordinator with the given acknowledgement deadline.
    pub fn new(timeout: Duration, monitor: Arc<dyn ReplicationMonitor>) -> Self {
        Self { timeout: Mutex::new(timeout), pending: Mutex::new(HashMap::new()), monitor }
    }

    /// Change the deadline for updates registered from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Register a local update before it is published. `local_id` is this
    /// replica's own id: when the deadline passes with no acknowledgement
    /// at all, no remote reported anything, so the error is recorded
    /// against the local replica.
    pub fn register(&self, csn: Csn, mode: AssuredMode, local_id: u16) -> AssuredWaiter {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(csn, Pending { mode, tx });
        self.monitor.incr(match mode {
            AssuredMode::SafeRead => Counter::AssuredSrSentUpdates,
            AssuredMode::SafeData => Counter::AssuredSdSentUpdates,
        });
        AssuredWaiter { csn, mode, local_id, rx }
    }

    /// Block the caller until acknowledgement, deadline, or teardown.
    pub async fn wait(&self, waiter: AssuredWaiter) -> AckOutcome {
        let timeout = *self.timeout.lock().unwrap();
        match tokio::time::timeout(timeout, waiter.rx).await {
            Ok(Ok(ack)) => AckOutcome::Acknowledged { errors: ack.has_errors() },
            Ok(Err(_)) => AckOutcome::SessionClosed,
            Err(_) => {
                if self.pending.lock().unwrap().remove(&waiter.csn).is_none() {
                    // The acknowledgement raced the deadline and won.
                    return AckOutcome::Acknowledged { errors: false };
                }
                warn!(csn = %waiter.csn, "assured update timed out");
                self.monitor.incr(match waiter.mode {
                    AssuredMode::SafeRead => Counter::AssuredSrTimeoutUpdates,
                    AssuredMode::SafeData => Counter::AssuredSdTimeoutUpdates,
                });
                self.monitor.server_error(waiter.mode, waiter.local_id);
                AckOutcome::TimedOut
            }
        }
    }

    /// Deliver an acknowledgement from the receive loop. Returns false when
    /// no update was pending under that CSN.
    pub fn on_ack(&self, ack: &AckMsg) -> bool {
        let Some(pending) = self.pending.lock().unwrap().remove(&ack.csn) else {
            debug!(csn = %ack.csn, "acknowledgement for unknown update");
            return false;
        };
        match pending.mode {
            AssuredMode::SafeRead => {
                if ack.has_errors() {
                    self.monitor.incr(Counter::AssuredSrNotAcknowledgedUpdates);
                    if ack.has_timeout {
                        self.monitor.incr(Counter::AssuredSrTimeoutUpdates);
                    }
                    if ack.has_wrong_status {
                        self.monitor.incr(Counter::AssuredSrWrongStatusUpdates);
                    }
                    if ack.has_replay_error {
                        self.monitor.incr(Counter::AssuredSrReplayErrorUpdates);
                    }
                } else {
                    self.monitor.incr(Counter::AssuredSrAcknowledgedUpdates);
                }
            }
            AssuredMode::SafeData => {
                if !ack.has_errors() {
                    self.monitor.incr(Counter::AssuredSdAcknowledgedUpdates);
                }
            }
        }
        for server_id in &ack.failed_servers {
            self.monitor.server_error(pending.mode, *server_id);
        }
        let _ = pending.tx.send(ack.clone());
        true
    }

    /// Resolve every outstanding waiter as the session goes down.
    pub fn session_closed(&self) {
        let drained: Vec<Pending> =
            self.pending.lock().unwrap().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "session closed with assured updates outstanding");
        }
        // Dropping the senders resolves the waiters with SessionClosed.
    }

    /// Number of updates currently awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMonitor;

    fn csn(t: u64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn coordinator(timeout_ms: u64) -> (Arc<AssuredCoordinator>, Arc<CounterMonitor>) {
        let monitor = Arc::new(CounterMonitor::new());
        let coord = Arc::new(AssuredCoordinator::new(
            Duration::from_millis(timeout_ms),
            monitor.clone() as Arc<dyn ReplicationMonitor>,
        ));
        (coord, monitor)
    }

    #[tokio::test]
    async fn test_clean_ack_unblocks_caller() {
        let (coord, monitor) = coordinator(5_000);
        let waiter = coord.register(csn(1), AssuredMode::SafeRead, 1);
        assert_eq!(coord.pending_count(), 1);

        assert!(coord.on_ack(&AckMsg::clean(csn(1))));
        let outcome = coord.wait(waiter).await;
        assert_eq!(outcome, AckOutcome::Acknowledged { errors: false });
        assert_eq!(coord.pending_count(), 0);
        assert_eq!(monitor.get(Counter::AssuredSrSentUpdates), 1);
        assert_eq!(monitor.get(Counter::AssuredSrAcknowledgedUpdates), 1);
    }

    #[tokio::test]
    async fn test_ack_with_errors_still_acknowledges() {
        let (coord, monitor) = coordinator(5_000);
        let waiter = coord.register(csn(2), AssuredMode::SafeRead, 1);
        let ack = AckMsg {
            csn: csn(2),
            has_timeout: true,
            has_wrong_status: false,
            has_replay_error: true,
            failed_servers: vec![4, 9],
        };
        coord.on_ack(&ack);
        let outcome = coord.wait(waiter).await;
        assert_eq!(outcome, AckOutcome::Acknowledged { errors: true });
        assert_eq!(monitor.get(Counter::AssuredSrNotAcknowledgedUpdates), 1);
        assert_eq!(monitor.get(Counter::AssuredSrTimeoutUpdates), 1);
        assert_eq!(monitor.get(Counter::AssuredSrReplayErrorUpdates), 1);
        assert_eq!(monitor.get(Counter::AssuredSrAcknowledgedUpdates), 0);
        // Exactly the reported servers carry the errors.
        assert_eq!(monitor.server_errors(AssuredMode::SafeRead, 4), 1);
        assert_eq!(monitor.server_errors(AssuredMode::SafeRead, 9), 1);
        assert_eq!(monitor.server_errors(AssuredMode::SafeRead, 1), 0);
    }

    #[tokio::test]
    async fn test_timeout_resolves_caller_and_counts() {
        let (coord, monitor) = coordinator(20);
        let waiter = coord.register(csn(3), AssuredMode::SafeData, 1);
        let outcome = coord.wait(waiter).await;
        assert_eq!(outcome, AckOutcome::TimedOut);
        assert_eq!(monitor.get(Counter::AssuredSdTimeoutUpdates), 1);
        // Nothing remote reported anything: the local replica is charged.
        assert_eq!(monitor.server_errors(AssuredMode::SafeData, 1), 1);
        assert_eq!(coord.pending_count(), 0);
        // A late acknowledgement finds nothing to resolve.
        assert!(!coord.on_ack(&AckMsg::clean(csn(3))));
    }

    #[tokio::test]
    async fn test_session_close_unblocks_all_waiters() {
        let (coord, _) = coordinator(60_000);
        let w1 = coord.register(csn(4), AssuredMode::SafeRead, 1);
        let w2 = coord.register(csn(5), AssuredMode::SafeData, 1);
        coord.session_closed();
        assert_eq!(coord.wait(w1).await, AckOutcome::SessionClosed);
        assert_eq!(coord.wait(w2).await, AckOutcome::SessionClosed);
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_safe_data_partial_failure_accounting() {
        // Level-3 send where one remote stored the change and one timed
        // out: the RS acknowledges with the timeout flag and the failed
        // server listed. The caller is acknowledged, the counters tell the
        // real story.
        let (coord, monitor) = coordinator(5_000);
        let waiter = coord.register(csn(6), AssuredMode::SafeData, 1);
        let ack = AckMsg {
            csn: csn(6),
            has_timeout: true,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: vec![7],
        };
        coord.on_ack(&ack);
        assert_eq!(coord.wait(waiter).await, AckOutcome::Acknowledged { errors: true });
        assert_eq!(monitor.get(Counter::AssuredSdAcknowledgedUpdates), 0);
        assert_eq!(monitor.server_errors(AssuredMode::SafeData, 7), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_resolve_independently() {
        let (coord, _) = coordinator(5_000);
        let w1 = coord.register(csn(10), AssuredMode::SafeRead, 1);
        let w2 = coord.register(csn(11), AssuredMode::SafeRead, 1);

        let c = Arc::clone(&coord);
        let h1 = tokio::spawn(async move { c.wait(w1).await });
        let c = Arc::clone(&coord);
        let h2 = tokio::spawn(async move { c.wait(w2).await });

        coord.on_ack(&AckMsg::clean(csn(11)));
        assert_eq!(h2.await.unwrap(), AckOutcome::Acknowledged { errors: false });
        coord.on_ack(&AckMsg::clean(csn(10)));
        assert_eq!(h1.await.unwrap(), AckOutcome::Acknowledged { errors: false });
    }
}
