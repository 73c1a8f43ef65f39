//! The data-store seam the block processor drives.
//!
//! The page store, WAL and replication transport live elsewhere; the
//! processor only sees this trait: transaction handles, record operations
//! scoped to a handle, the durable blkseq map, and the 2PC primitives. The
//! in-memory engine in [`mem`] implements the whole seam and is what the
//! test suites run against.

pub mod mem;

use thiserror::Error;

/// Row identity. Genids are unique per store instance and never reused;
/// zero is "no genid".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Genid(pub u64);

/// Transaction handle. Handles are tokens into the store's own state; the
/// processor never sees transaction internals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TranId(pub u64);

/// How a transaction participates in the commit protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranKind {
    /// Physical transaction, possibly a child of a parent physical txn.
    Physical,
    /// Logical rowlocks transaction; commit may carry the blkseq write.
    Logical,
    /// Schema-change sub-transaction.
    SchemaChange,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Insert collided with an existing key. For blkseq inserts the payload
    /// already stored under the key comes back so the caller can replay it.
    #[error("duplicate key")]
    Duplicate { existing: Option<Vec<u8>> },

    #[error("record not found")]
    NotFound,

    /// Optimistic verify failed: the record no longer matches the image the
    /// client read.
    #[error("verify mismatch")]
    VerifyError,

    /// Deadlock victim; the caller restores state and retries.
    #[error("deadlock, retry transaction")]
    Deadlock,

    /// Commit landed locally but did not replicate to a quorum.
    #[error("commit not durable")]
    NotDurable,

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Deferred unique-index add collided; the transaction can never commit.
    #[error("uncommittable: duplicate on index {0}")]
    Uncommittable(String),

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("unknown queue {0}")]
    UnknownQueue(String),

    #[error("bad transaction handle")]
    BadTran,

    #[error("internal store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Static description of a table. Keys are a byte prefix of the record;
/// `key_len == 0` means the table has no unique index. A foreign key means
/// this table's key prefix must exist in `parent`'s index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub dbnum: u32,
    pub key_len: usize,
    pub parent: Option<String>,
    pub version: u32,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, dbnum: u32, key_len: usize) -> TableSchema {
        TableSchema {
            name: name.into(),
            dbnum,
            key_len,
            parent: None,
            version: 1,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> TableSchema {
        self.parent = Some(parent.into());
        self
    }

    pub fn has_constraints(&self) -> bool {
        self.parent.is_some()
    }
}

/// A cursor read-set captured by a serializable or selectv scan: key ranges
/// per table plus the commit-log high-water mark at read time.
#[derive(Clone, Debug, Default)]
pub struct ReadSet {
    pub ranges: Vec<(String, Vec<u8>, Vec<u8>)>,
    pub high_water: u64,
}

impl ReadSet {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// The store surface the block processor drives. One implementation per
/// storage engine; every method that takes a [`TranId`] operates within
/// that transaction and is undone by its abort.
pub trait DataStore: Send + Sync {
    // --- transactions ---

    fn trans_start(&self, parent: Option<TranId>) -> StoreResult<TranId>;
    fn trans_start_logical(&self) -> StoreResult<TranId>;
    fn trans_start_sc(&self, parent: TranId) -> StoreResult<TranId>;
    /// Logical envelope for schema-change + DML in one block.
    fn trans_start_logical_sc(&self) -> StoreResult<TranId>;
    /// Physical transaction backing a logical one (pagelocks regime).
    fn get_physical_tran(&self, logical: TranId) -> StoreResult<TranId>;

    fn trans_commit(&self, tran: TranId) -> StoreResult<()>;
    /// Commit that picks its own durability wait; identical outcome surface
    /// to [`trans_commit`](Self::trans_commit).
    fn trans_commit_adaptive(&self, tran: TranId) -> StoreResult<()> {
        self.trans_commit(tran)
    }
    /// Logical commit; under rowlocks the blkseq entry rides in the same
    /// commit record.
    fn trans_commit_logical(
        &self,
        tran: TranId,
        blkseq: Option<(&[u8], &[u8])>,
    ) -> StoreResult<()>;
    fn trans_abort(&self, tran: TranId) -> StoreResult<()>;
    /// Logical abort, writing an error blkseq entry if one is supplied.
    fn trans_abort_logical(
        &self,
        tran: TranId,
        blkseq: Option<(&[u8], &[u8])>,
    ) -> StoreResult<()>;

    // --- 2PC primitives ---

    /// Write a prepare record and block until it is durable on a quorum.
    fn trans_prepare(
        &self,
        tran: TranId,
        dist_txnid: &str,
        coordinator_name: &str,
        coordinator_tier: &str,
        blkseq_key: &[u8],
    ) -> StoreResult<()>;
    /// Release a prepared transaction whose outcome is recorded elsewhere.
    fn trans_discard_prepared(&self, tran: TranId) -> StoreResult<()>;
    fn count_write_waiters(&self, tran: TranId) -> usize;
    fn abort_waiters(&self, tran: TranId);
    /// True while the replication layer wants this node to downgrade.
    fn lock_desired(&self) -> bool;

    // --- record operations ---

    fn add_record(
        &self,
        tran: TranId,
        table: &str,
        record: &[u8],
        defer_index: bool,
    ) -> StoreResult<Genid>;
    fn del_record_by_genid(&self, tran: TranId, table: &str, genid: Genid) -> StoreResult<()>;
    fn del_record_by_key(&self, tran: TranId, table: &str, key: &[u8]) -> StoreResult<Genid>;
    /// Update by genid or key; `verify` is the optimistic image check.
    fn upd_record(
        &self,
        tran: TranId,
        table: &str,
        genid: Option<Genid>,
        key: Option<&[u8]>,
        verify: Option<&[u8]>,
        record: &[u8],
    ) -> StoreResult<Genid>;
    fn range_delete(
        &self,
        tran: TranId,
        table: &str,
        start_key: &[u8],
        end_key: &[u8],
        max: usize,
    ) -> StoreResult<usize>;
    /// Rewrite up to `nrecs` records starting at `genid` in the current
    /// schema version.
    fn upgrade_records(
        &self,
        tran: TranId,
        table: &str,
        genid: Genid,
        nrecs: usize,
    ) -> StoreResult<usize>;
    fn delete_older_than(
        &self,
        tran: TranId,
        table: &str,
        epoch: u32,
        max: usize,
    ) -> StoreResult<usize>;

    fn queue_add(&self, tran: TranId, queue: &str, data: &[u8]) -> StoreResult<()>;
    fn queue_consume(&self, tran: TranId, queue: &str, consumer: u32) -> StoreResult<()>;

    /// Bump a table's schema version inside a schema-change sub-txn.
    fn schema_change(&self, tran: TranId, table: &str) -> StoreResult<()>;
    /// Undo schema changes recorded in `tran` after a backout.
    fn backout_schema_changes(&self, tran: TranId);

    // --- deferred work ---

    /// Apply index inserts queued by `defer_index` adds. A duplicate into a
    /// pre-existing unique index is [`StoreError::Uncommittable`].
    fn apply_deferred_index_adds(&self, tran: TranId) -> StoreResult<()>;
    fn verify_add_constraints(&self, tran: TranId) -> StoreResult<()>;
    fn verify_del_constraints(&self, tran: TranId) -> StoreResult<()>;

    // --- blkseq ---

    /// Insert the canonical outcome under `key`, atomically with `tran` when
    /// one is given. On collision the existing payload is returned inside
    /// [`StoreError::Duplicate`].
    fn blkseq_insert(
        &self,
        tran: Option<TranId>,
        key: &[u8],
        payload: &[u8],
    ) -> StoreResult<()>;
    fn blkseq_find(&self, key: &[u8]) -> Option<Vec<u8>>;

    // --- serializable validation ---

    /// Current commit-log high-water mark, captured into [`ReadSet`]s.
    fn commit_seqno(&self) -> u64;
    /// True if any write after `readset.high_water` intersects the read-set.
    /// With `include_inflight`, writes buffered in uncommitted transactions
    /// count too (the cheap first dive); without it only committed writes
    /// count (the authoritative recheck).
    fn serial_check(&self, readset: &ReadSet, include_inflight: bool) -> bool;

    // --- introspection for lookups during the batch ---

    fn table_by_dbnum(&self, dbnum: u32) -> Option<String>;
    fn table_exists(&self, name: &str) -> bool;
    fn table_has_constraints(&self, name: &str) -> bool;
    fn find_by_key(&self, tran: TranId, table: &str, key: &[u8]) -> StoreResult<(Genid, Vec<u8>)>;
}
