//! Process-wide state of the block processor, owned as one value instead of
//! scattered globals: tunables, the commit lock, the in-flight block gauge,
//! replay counters and the writer penalty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tessera_srs::SrsShared;

use crate::penalty::WriterPenalty;

/// Numeric knobs, read once per batch. Defaults are production values;
/// tests override fields directly.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// Outer driver retries on deadlock.
    pub maxretries: u32,
    pub osql_verify_retries_max: u32,
    pub disttxn_random_retry_poll: u32,
    /// Never skip constraint deferral, even for the last op of a batch.
    pub goslow: bool,
    pub maxwthreads: u32,
    pub penaltyincpercent: u32,
    /// Use a separate schema-change sub-txn for closing old files.
    pub sc_close_txn: bool,
    pub use_blkseq: bool,
    pub replicate_local: bool,
    pub disable_tagged_api_writes: bool,
    pub coordinator_wait_propagate: bool,
    pub replicant_retry_on_not_durable: bool,
    /// Rowlocks isolation regime; pagelocks otherwise.
    pub rowlocks: bool,
    /// Standalone mode: skip the master check entirely.
    pub local_mode: bool,
    /// Deadlock-victim bias: stamp new writers with a monotonic ms clock.
    pub deadlock_youngest_ever: bool,
    /// Deadlock-victim bias: propagate the victim's priority on retry.
    pub deadlock_least_writes_ever: bool,
    pub deadlock_priority_bump: i32,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            maxretries: 500,
            osql_verify_retries_max: 10,
            disttxn_random_retry_poll: 500,
            goslow: false,
            maxwthreads: 8,
            penaltyincpercent: 20,
            sc_close_txn: true,
            use_blkseq: true,
            replicate_local: false,
            disable_tagged_api_writes: false,
            coordinator_wait_propagate: true,
            replicant_retry_on_not_durable: true,
            rowlocks: false,
            local_mode: false,
            deadlock_youngest_ever: false,
            deadlock_least_writes_ever: false,
            deadlock_priority_bump: 10,
        }
    }
}

/// Count of block threads inside the processor and how many of them are
/// sitting on a prepared distributed transaction. The condvar is broadcast
/// every time a thread leaves, which is what the `LockDesired` drain waits
/// on.
#[derive(Debug, Default)]
pub struct BlockGauge {
    pub blkcnt: u32,
    pub prepared: u32,
    pub blkmax: u32,
}

/// Everything process-wide the block processor touches, passed explicitly.
pub struct ProcessorContext {
    pub tunables: Tunables,
    /// Held in read mode around read-set validation and commit; upgraded to
    /// write mode only for the serializable re-dive.
    pub commit_lock: RwLock<()>,
    pub gauge: Mutex<BlockGauge>,
    pub gauge_cond: Condvar,
    pub penalty: WriterPenalty,
    pub srs: SrsShared,

    // counters
    pub blkseq_replay_count: AtomicU64,
    pub blkseq_replay_error_count: AtomicU64,
    pub long_request_bytes: AtomicU64,
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self::new(Tunables::default())
    }
}

impl ProcessorContext {
    pub fn new(tunables: Tunables) -> ProcessorContext {
        let penalty = WriterPenalty::new(tunables.maxwthreads, tunables.penaltyincpercent);
        let srs = SrsShared {
            verify_retries_max: tunables.osql_verify_retries_max,
            disttxn_random_retry_poll: tunables.disttxn_random_retry_poll,
            verify_tran_replays: AtomicU64::new(0),
        };
        ProcessorContext {
            tunables,
            commit_lock: RwLock::new(()),
            gauge: Mutex::new(BlockGauge::default()),
            gauge_cond: Condvar::new(),
            penalty,
            srs,
            blkseq_replay_count: AtomicU64::new(0),
            blkseq_replay_error_count: AtomicU64::new(0),
            long_request_bytes: AtomicU64::new(0),
        }
    }

    /// Enter the block gauge; `Err` when the node is downgrading and new
    /// block threads must be turned away.
    pub fn gauge_enter(&self, lock_desired: bool) -> Result<(), ()> {
        let mut g = self.gauge.lock();
        if lock_desired {
            return Err(());
        }
        g.blkcnt += 1;
        if g.blkcnt > g.blkmax {
            g.blkmax = g.blkcnt;
        }
        Ok(())
    }

    pub fn gauge_exit(&self) {
        let mut g = self.gauge.lock();
        g.blkcnt -= 1;
        self.gauge_cond.notify_all();
    }

    pub fn prepared_inc(&self) {
        self.gauge.lock().prepared += 1;
    }

    pub fn prepared_dec(&self) {
        self.gauge.lock().prepared -= 1;
    }

    /// Block until every non-prepared writer has drained out of the
    /// processor, calling `kick` each round to abort writers stuck on our
    /// locks. Used while holding a prepared transaction through a
    /// downgrade.
    pub fn drain_nonprepared_writers(&self, mut kick: impl FnMut()) {
        let mut g = self.gauge.lock();
        while g.prepared < g.blkcnt {
            kick();
            tracing::info!(
                prepared = g.prepared,
                total = g.blkcnt,
                "blocking for non-prepared writers to resolve"
            );
            self.gauge_cond
                .wait_for(&mut g, Duration::from_millis(1000));
        }
        g.prepared -= 1;
    }

    pub fn blkmax(&self) -> u32 {
        self.gauge.lock().blkmax
    }

    pub fn note_replay(&self, failed: bool) {
        self.blkseq_replay_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.blkseq_replay_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn gauge_tracks_a_high_water_mark() {
        let ctx = ProcessorContext::default();
        ctx.gauge_enter(false).unwrap();
        ctx.gauge_enter(false).unwrap();
        ctx.gauge_exit();
        ctx.gauge_enter(false).unwrap();
        assert_eq!(ctx.blkmax(), 2);
        ctx.gauge_exit();
        ctx.gauge_exit();
    }

    #[test]
    fn gauge_turns_threads_away_while_downgrading() {
        let ctx = ProcessorContext::default();
        assert!(ctx.gauge_enter(true).is_err());
        assert_eq!(ctx.blkmax(), 0);
    }

    #[test]
    fn drain_waits_for_nonprepared_writers() {
        let ctx = Arc::new(ProcessorContext::default());
        // one prepared writer (us), one plain writer still in flight
        ctx.gauge_enter(false).unwrap();
        ctx.prepared_inc();
        ctx.gauge_enter(false).unwrap();

        let other = ctx.clone();
        let t = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            other.gauge_exit();
        });

        let mut kicks = 0;
        ctx.drain_nonprepared_writers(|| kicks += 1);
        t.join().unwrap();
        assert!(kicks >= 1);
        assert_eq!(ctx.gauge.lock().prepared, 0);
        ctx.gauge_exit();
    }
}
