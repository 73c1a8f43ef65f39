//! Statement retry store: per-connection history of a multi-statement
//! transaction, replayed in full when the commit fails with a verify
//! conflict.
//!
//! The SQL engine is not this crate's business; statements are opaque values
//! owned through a [`StatementPlugin`], and running one is a dispatch
//! callback supplied by the caller. What lives here is the bookkeeping the
//! correctness argument rests on: history grows only outside replay, replay
//! preserves insertion order, a commit statement is always last, and the
//! replay state always returns to `None` when the history is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tessera_errors::BlockError;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Saved-statement capability set, one implementation per front-end flavor
/// (newsql, legacy, appsock).
pub trait StatementPlugin {
    type Conn;
    type Saved;

    fn save(&self, conn: &mut Self::Conn) -> Self::Saved;
    fn restore(&self, conn: &mut Self::Conn, stmt: &Self::Saved);
    fn destroy(&self, conn: &mut Self::Conn, stmt: Self::Saved);
    fn print(&self, conn: &Self::Conn, stmt: &Self::Saved) -> String;
}

/// Isolation mode of the transaction being replayed; decides how shadow
/// state is reset between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranMode {
    SockSql,
    ReadCommitted,
    SnapshotIsolation,
    Serializable,
}

/// Connection-side hooks the replay loop drives between attempts.
pub trait ReplaySession {
    /// Replay is suppressed entirely for this connection: verify-retry is
    /// off, the statement set contains a select, a stored procedure ran, or
    /// the session is recording.
    fn do_not_retry(&self) -> bool;
    fn is_distributed(&self) -> bool;
    fn mode(&self) -> Option<TranMode>;
    fn reset_query_effects(&mut self);
    /// Reset shadow tables. Under read committed the selectv recgenid table
    /// survives; everything else is discarded.
    fn reset_shadow_tables(&mut self, preserve_selectv: bool);
    /// Abort the socket transaction at the request type matching the
    /// connection's mode.
    fn sock_abort(&mut self, mode: Option<TranMode>);
}

/// Replay state for a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Replay {
    #[default]
    None,
    /// A verify conflict was detected; replay the history.
    Do,
    /// Retries exhausted; one final attempt whose failure is surfaced.
    Last,
}

/// Process-wide replay knobs and counters, owned by the service and shared
/// by reference.
#[derive(Debug)]
pub struct SrsShared {
    pub verify_retries_max: u32,
    /// Distributed transactions jitter up to this many ms between retries.
    pub disttxn_random_retry_poll: u32,
    pub verify_tran_replays: AtomicU64,
}

impl Default for SrsShared {
    fn default() -> Self {
        SrsShared {
            verify_retries_max: 10,
            disttxn_random_retry_poll: 500,
            verify_tran_replays: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SrsError {
    #[error("replay state is {0:?} but there is no history")]
    MissingHistory(Replay),

    #[error("trying to replay, but no history")]
    NoHistory,
}

impl From<SrsError> for BlockError {
    fn from(e: SrsError) -> BlockError {
        BlockError::Internal(e.to_string())
    }
}

struct Entry<S> {
    stmt: S,
    is_commit: bool,
}

/// Per-connection statement retry store.
pub struct Srs<P: StatementPlugin> {
    plugin: P,
    history: Option<Vec<Entry<P::Saved>>>,
    replay: Replay,
    last_replay: Replay,
    replay_site: &'static str,
    pub verify_retries: u32,
}

impl<P: StatementPlugin> Srs<P> {
    pub fn new(plugin: P) -> Srs<P> {
        Srs {
            plugin,
            history: None,
            replay: Replay::None,
            last_replay: Replay::None,
            replay_site: "",
            verify_retries: 0,
        }
    }

    pub fn replay(&self) -> Replay {
        self.replay
    }

    pub fn last_replay(&self) -> Replay {
        self.last_replay
    }

    pub fn has_history(&self) -> bool {
        self.history.is_some()
    }

    pub fn history_len(&self) -> usize {
        self.history.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Set replay state, remembering where it was set from.
    pub fn set_replay(&mut self, site: &'static str, replay: Replay) {
        self.last_replay = self.replay;
        self.replay_site = site;
        self.replay = replay;
    }

    /// Start a fresh history. An existing one is a bug in the caller; it is
    /// torn down with a warning rather than leaked.
    pub fn create(&mut self, conn: &mut P::Conn) {
        if self.history.is_some() {
            error!("statement history should be empty, discarding");
            self.destroy(conn);
        }
        self.history = Some(Vec::new());
    }

    /// Append the connection's current statement to the history.
    ///
    /// No-op when retry is suppressed, or during replay (the transaction is
    /// simply being repeated; the history must not grow).
    ///
    /// # Panics
    ///
    /// Panics if a statement is appended after a commit statement; the
    /// commit must be the last entry of a transaction.
    pub fn add_query(
        &mut self,
        conn: &mut P::Conn,
        is_commit: bool,
    ) -> Result<(), SrsError>
    where
        P::Conn: ReplaySession,
    {
        if conn.do_not_retry() {
            return Ok(());
        }
        if self.replay != Replay::None {
            if self.history.is_none() {
                error!(state = ?self.replay, "replay in progress but no history");
                return Err(SrsError::MissingHistory(self.replay));
            }
            return Ok(());
        }
        if self.history.is_none() {
            self.create(conn);
        }
        let history = self.history.as_mut().unwrap();
        assert!(
            !history.last().map(|e| e.is_commit).unwrap_or(false),
            "statement appended after commit"
        );
        let stmt = self.plugin.save(conn);
        history.push(Entry { stmt, is_commit });
        Ok(())
    }

    /// Pop the most recent statement.
    pub fn del_last_query(&mut self, conn: &mut P::Conn) {
        if let Some(history) = self.history.as_mut() {
            if let Some(e) = history.pop() {
                self.plugin.destroy(conn, e.stmt);
            }
        }
    }

    /// Drop every saved statement but keep the history allocated.
    pub fn empty(&mut self, conn: &mut P::Conn) {
        if let Some(history) = self.history.as_mut() {
            for e in history.drain(..) {
                self.plugin.destroy(conn, e.stmt);
            }
        }
    }

    /// Tear the history down. Replay state is forced back to `None`; being
    /// anywhere else at teardown is logged, not tolerated.
    pub fn destroy(&mut self, conn: &mut P::Conn) {
        if let Some(history) = self.history.take() {
            for e in history {
                self.plugin.destroy(conn, e.stmt);
            }
        }
        if self.replay != Replay::None {
            error!(state = ?self.replay, site = self.replay_site,
                   "cleaned history but replay state is wrong, fixing");
            self.set_replay(concat!(file!(), ":destroy"), Replay::None);
        }
    }

    pub fn print_history(&self, conn: &P::Conn) {
        if let Some(history) = self.history.as_ref() {
            for (num, e) in history.iter().enumerate() {
                warn!("{:3}) {}", num, self.plugin.print(conn, &e.stmt));
            }
        }
    }

    /// Replay the transaction using the current history.
    ///
    /// Statements run in insertion order; the loop repeats while the state
    /// is `Do` and retries are within bounds, switching to `Last` for the
    /// final attempt. `dispatch` returns `Ok` for success, `Err(rc)` with a
    /// logical error to retry, and a `Fatal` error to abort the socket
    /// transaction and stop. The history is consumed either way.
    pub fn replay_transaction(
        &mut self,
        conn: &mut P::Conn,
        shared: &SrsShared,
        mut dispatch: impl FnMut(&mut P::Conn) -> Result<(), DispatchError>,
    ) -> Result<(), BlockError>
    where
        P::Conn: ReplaySession,
    {
        self.verify_retries = 0;

        if self.history.is_none() {
            error!("trying to replay, but no history");
            return Err(SrsError::NoHistory.into());
        }

        let mut rc: Result<(), DispatchError>;
        loop {
            conn.reset_query_effects();
            assert!(self.history.is_some(), "history vanished mid-replay");

            self.verify_retries += 1;
            shared.verify_tran_replays.fetch_add(1, Ordering::Relaxed);

            if conn.is_distributed() && shared.disttxn_random_retry_poll > 1 {
                let ms = rand::rng().random_range(0..shared.disttxn_random_retry_poll);
                std::thread::sleep(Duration::from_millis(ms as u64));
            }

            // Serializable and snapshot replays never carry select or
            // selectv state; only read committed needs the recgenid table
            // preserved.
            match conn.mode() {
                Some(TranMode::ReadCommitted) => conn.reset_shadow_tables(true),
                _ => conn.reset_shadow_tables(false),
            }

            if self.verify_retries == shared.verify_retries_max + 1 {
                self.set_replay(concat!(file!(), ":replay"), Replay::Last);
            }

            rc = Ok(());
            let n = self.history_len();
            for i in 0..n {
                if let Some(history) = self.history.as_ref() {
                    if let Some(e) = history.get(i) {
                        self.plugin.restore(conn, &e.stmt);
                    } else {
                        break;
                    }
                } else {
                    break;
                }
                rc = dispatch(conn);
                if rc.is_err() {
                    break;
                }
                if self.history.is_none() {
                    break;
                }
            }

            if let Err(DispatchError::Fatal(ref e)) = rc {
                // don't repeat on an unexplainable failure
                if self.replay != Replay::None {
                    error!(error = %e, "replaying failed abnormally, aborting");
                    let mode = conn.mode();
                    conn.sock_abort(mode);
                }
                break;
            }

            // a clean pass committed the transaction; replay is over
            if rc.is_ok() {
                self.set_replay(concat!(file!(), ":committed"), Replay::None);
                break;
            }

            if !(self.replay == Replay::Do && self.verify_retries <= shared.verify_retries_max)
            {
                break;
            }
        }

        let failed = rc.is_err();
        if self.verify_retries >= shared.verify_retries_max && failed {
            error!(
                retries = self.verify_retries,
                "transaction failed repeatedly with verify errors"
            );
            // suppress the state complaint from destroy below
            self.set_replay(concat!(file!(), ":exhausted"), Replay::None);
        }
        if failed && self.verify_retries < shared.verify_retries_max {
            debug!(
                retries = self.verify_retries,
                "uncommittable transaction gave up before the retry cap"
            );
        }

        self.destroy(conn);
        self.set_replay(concat!(file!(), ":done"), Replay::None);

        match rc {
            Ok(()) => Ok(()),
            Err(DispatchError::Logical(e)) | Err(DispatchError::Fatal(e)) => Err(e),
        }
    }
}

/// Outcome of dispatching one replayed statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// A logical failure (verify conflict and friends); eligible for
    /// another replay round.
    Logical(BlockError),
    /// Engine-level failure; abort the socket transaction and stop.
    Fatal(BlockError),
}
