//! Distributed-transaction coordination.
//!
//! A transaction marked distributed reaches its commit point prepared but
//! unresolved; the registry here is the rendezvous where the coordinator
//! decides the outcome and every prepared party learns it. The transport
//! that carries these signals between nodes is external; what matters to
//! the block processor is the wait surface: block until the outcome is
//! known, or until the replication layer wants the node to downgrade, in
//! which case a prepared transaction must hold its locks and be discarded,
//! never aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tessera_errors::Rcode;
use tracing::{debug, warn};

/// Which side of the distributed transaction this node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistRole {
    Coordinator,
    Participant,
}

/// Identity of a distributed transaction as carried through the block
/// processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistTxn {
    pub dist_txnid: String,
    pub coordinator_dbname: String,
    pub coordinator_tier: String,
    pub coordinator_master: String,
    pub role: DistRole,
}

impl DistTxn {
    pub fn is_coordinator(&self) -> bool {
        self.role == DistRole::Coordinator
    }
}

/// What a prepared party learns from its wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    HasCommitted,
    HasAborted {
        rc: i32,
        outrc: i32,
        errstr: String,
    },
    /// Downgrade requested while prepared; do not release locks, drain
    /// non-prepared writers, then discard.
    LockDesired,
    /// Nothing to report; keep the rcode already in hand.
    KeepRcode,
}

#[derive(Debug, Default)]
struct TxnState {
    participants_expected: usize,
    participants_prepared: usize,
    failure: Option<(i32, i32, String)>,
    resolution: Option<Resolution>,
    propagated: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Resolution {
    Committed,
    Aborted { rc: i32, outrc: i32, errstr: String },
}

/// In-process registry of distributed transactions. One per node; shared
/// between the block threads running coordinator and participant halves.
pub struct DistTxnRegistry {
    inner: Mutex<HashMap<String, TxnState>>,
    cond: Condvar,
    /// Probe into the replication layer's downgrade intent.
    lock_probe: Mutex<Option<Arc<dyn Fn() -> bool + Send + Sync>>>,
}

impl Default for DistTxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(10);

impl DistTxnRegistry {
    pub fn new() -> DistTxnRegistry {
        DistTxnRegistry {
            inner: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            lock_probe: Mutex::new(None),
        }
    }

    /// Install the downgrade probe; waits return `LockDesired` while it
    /// reads true.
    pub fn set_lock_probe(&self, probe: Arc<dyn Fn() -> bool + Send + Sync>) {
        *self.lock_probe.lock() = Some(probe);
    }

    fn lock_desired(&self) -> bool {
        self.lock_probe
            .lock()
            .as_ref()
            .map(|p| p())
            .unwrap_or(false)
    }

    /// Coordinator announces the transaction and how many participants it
    /// expects to prepare.
    pub fn register_coordinator(&self, dist_txnid: &str, participants: usize) {
        let mut g = self.inner.lock();
        let st = g.entry(dist_txnid.to_owned()).or_default();
        st.participants_expected = participants;
        debug!(dist_txnid, participants, "registered coordinator");
    }

    /// Participant reports its prepare record is durable.
    pub fn participant_prepared(&self, dist_txnid: &str) {
        let mut g = self.inner.lock();
        g.entry(dist_txnid.to_owned()).or_default().participants_prepared += 1;
        self.cond.notify_all();
    }

    /// Participant could not prepare (or failed before that); the
    /// transaction must abort everywhere.
    pub fn participant_has_failed(
        &self,
        dist_txnid: &str,
        _coordinator_dbname: &str,
        _coordinator_master: &str,
        rc: i32,
        outrc: i32,
        errstr: &str,
    ) {
        let mut g = self.inner.lock();
        let st = g.entry(dist_txnid.to_owned()).or_default();
        if st.failure.is_none() {
            st.failure = Some((rc, outrc, errstr.to_owned()));
        }
        if st.resolution.is_none() {
            st.resolution = Some(Resolution::Aborted {
                rc,
                outrc,
                errstr: errstr.to_owned(),
            });
        }
        self.cond.notify_all();
    }

    /// Coordinator gave up before (or instead of) committing.
    pub fn coordinator_failed(&self, dist_txnid: &str) {
        let mut g = self.inner.lock();
        let st = g.entry(dist_txnid.to_owned()).or_default();
        if st.resolution.is_none() {
            st.resolution = Some(Resolution::Aborted {
                rc: 0,
                outrc: Rcode::DistAbort.as_i32(),
                errstr: "Transaction aborted by coordinator".to_owned(),
            });
        }
        self.cond.notify_all();
    }

    /// Block the coordinator until the transaction can be resolved.
    ///
    /// With `should_wait` false or in `dry` mode nothing is decided: an
    /// already-recorded failure comes back as `HasAborted`, otherwise
    /// `KeepRcode`.
    pub fn coordinator_wait(
        &self,
        dist_txnid: &str,
        should_wait: bool,
        dry: bool,
    ) -> WaitOutcome {
        let mut g = self.inner.lock();
        loop {
            let st = g.entry(dist_txnid.to_owned()).or_default();
            if let Some(Resolution::Aborted { rc, outrc, errstr }) = st.resolution.clone() {
                return WaitOutcome::HasAborted { rc, outrc, errstr };
            }
            if let Some((rc, outrc, errstr)) = st.failure.clone() {
                return WaitOutcome::HasAborted { rc, outrc, errstr };
            }
            if !dry && st.participants_prepared >= st.participants_expected {
                st.resolution = Some(Resolution::Committed);
                self.cond.notify_all();
                return WaitOutcome::HasCommitted;
            }
            if dry || !should_wait {
                return WaitOutcome::KeepRcode;
            }
            if self.lock_desired() {
                return WaitOutcome::LockDesired;
            }
            self.cond.wait_for(&mut g, WAIT_SLICE);
        }
    }

    /// Block a prepared participant until the coordinator's decision lands.
    pub fn participant_wait(
        &self,
        dist_txnid: &str,
        _coordinator_dbname: &str,
        _coordinator_tier: &str,
        _coordinator_master: &str,
    ) -> WaitOutcome {
        let mut g = self.inner.lock();
        loop {
            let st = g.entry(dist_txnid.to_owned()).or_default();
            match st.resolution.clone() {
                Some(Resolution::Committed) => return WaitOutcome::HasCommitted,
                Some(Resolution::Aborted { rc, outrc, errstr }) => {
                    return WaitOutcome::HasAborted { rc, outrc, errstr }
                }
                None => {}
            }
            if self.lock_desired() {
                return WaitOutcome::LockDesired;
            }
            self.cond.wait_for(&mut g, WAIT_SLICE);
        }
    }

    /// Participant's local commit has replicated.
    pub fn participant_has_propagated(
        &self,
        dist_txnid: &str,
        _coordinator_dbname: &str,
        _coordinator_master: &str,
    ) {
        let mut g = self.inner.lock();
        g.entry(dist_txnid.to_owned()).or_default().propagated += 1;
        self.cond.notify_all();
    }

    /// Coordinator blocks until every participant has propagated, then
    /// resolves the transaction.
    pub fn coordinator_wait_propagate(&self, dist_txnid: &str) {
        let mut g = self.inner.lock();
        loop {
            let st = g.entry(dist_txnid.to_owned()).or_default();
            if st.propagated >= st.participants_expected {
                break;
            }
            if self.lock_desired() {
                warn!(dist_txnid, "giving up propagate wait, lock desired");
                break;
            }
            self.cond.wait_for(&mut g, WAIT_SLICE);
        }
        drop(g);
        self.coordinator_resolve(dist_txnid);
    }

    /// Forget a resolved transaction.
    pub fn coordinator_resolve(&self, dist_txnid: &str) {
        self.inner.lock().remove(dist_txnid);
    }

    /// Test/introspection hook: current resolution, if any.
    pub fn is_resolved(&self, dist_txnid: &str) -> bool {
        self.inner
            .lock()
            .get(dist_txnid)
            .map(|st| st.resolution.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn commit_needs_every_participant_prepared() {
        let reg = Arc::new(DistTxnRegistry::new());
        reg.register_coordinator("d1", 2);
        reg.participant_prepared("d1");

        let r2 = reg.clone();
        let waiter = thread::spawn(move || r2.coordinator_wait("d1", true, false));
        thread::sleep(Duration::from_millis(20));
        reg.participant_prepared("d1");
        assert_eq!(waiter.join().unwrap(), WaitOutcome::HasCommitted);

        // participants observe the same resolution
        assert_eq!(
            reg.participant_wait("d1", "db", "tier", "host"),
            WaitOutcome::HasCommitted
        );
    }

    #[test]
    fn participant_failure_aborts_the_coordinator() {
        let reg = DistTxnRegistry::new();
        reg.register_coordinator("d2", 2);
        reg.participant_prepared("d2");
        reg.participant_has_failed("d2", "db", "host", 4, 220, "verify on participant");
        match reg.coordinator_wait("d2", true, false) {
            WaitOutcome::HasAborted { rc, outrc, .. } => {
                assert_eq!((rc, outrc), (4, 220));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn dry_wait_never_decides() {
        let reg = DistTxnRegistry::new();
        reg.register_coordinator("d3", 0);
        assert_eq!(reg.coordinator_wait("d3", true, true), WaitOutcome::KeepRcode);
        assert!(!reg.is_resolved("d3"));
    }

    #[test]
    fn lock_desired_interrupts_waits() {
        let reg = DistTxnRegistry::new();
        let flag = Arc::new(AtomicBool::new(true));
        let probe = flag.clone();
        reg.set_lock_probe(Arc::new(move || probe.load(Ordering::SeqCst)));
        reg.register_coordinator("d4", 1);
        assert_eq!(
            reg.coordinator_wait("d4", true, false),
            WaitOutcome::LockDesired
        );
        assert_eq!(
            reg.participant_wait("d4", "db", "tier", "host"),
            WaitOutcome::LockDesired
        );
    }

    #[test]
    fn propagate_wait_drains_then_resolves() {
        let reg = Arc::new(DistTxnRegistry::new());
        reg.register_coordinator("d5", 1);
        reg.participant_prepared("d5");
        assert_eq!(reg.coordinator_wait("d5", true, false), WaitOutcome::HasCommitted);

        let r2 = reg.clone();
        let waiter = thread::spawn(move || r2.coordinator_wait_propagate("d5"));
        thread::sleep(Duration::from_millis(20));
        reg.participant_has_propagated("d5", "db", "host");
        waiter.join().unwrap();
        assert!(!reg.is_resolved("d5"));
    }

    #[test]
    fn coordinator_failure_writes_dist_abort() {
        let reg = DistTxnRegistry::new();
        reg.register_coordinator("d6", 1);
        reg.coordinator_failed("d6");
        match reg.participant_wait("d6", "db", "tier", "host") {
            WaitOutcome::HasAborted { outrc, errstr, .. } => {
                assert_eq!(outrc, Rcode::DistAbort.as_i32());
                assert!(errstr.contains("coordinator"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }
}
