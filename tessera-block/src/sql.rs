//! The seam to the SQL engine. Offloaded SQL arrives as text inside the
//! batch; the engine runs it elsewhere and what comes back is the write
//! stream to apply at commit time, plus the read-sets that serializable
//! isolation must re-validate.

use tessera_dist::DistTxn;
use tessera_errors::BlockResult;
use tessera_srs::TranMode;
use tessera_store::ReadSet;

/// One buffered write produced by the SQL engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlWriteOp {
    Insert {
        table: String,
        record: Vec<u8>,
    },
    Update {
        table: String,
        key: Vec<u8>,
        verify: Option<Vec<u8>>,
        record: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
    /// DDL folded into the transaction; commits through the schema-change
    /// sub-transactions.
    SchemaChange {
        table: String,
    },
}

/// Everything the engine hands back for one offloaded-SQL transaction.
#[derive(Clone, Debug, Default)]
pub struct SqlWriteStream {
    pub ops: Vec<SqlWriteOp>,
    /// Set when the transaction is distributed.
    pub dist: Option<DistTxn>,
    /// Serializable cursor ranges to re-validate at commit.
    pub readset: Option<ReadSet>,
    /// Selectv ranges; a conflict here is a constraint error, not a
    /// serializability one.
    pub selectv_readset: Option<ReadSet>,
    /// The submitting replicant can retry this transaction itself, so a
    /// retryable failure must not be pinned into the blockseq.
    pub replicant_can_retry: bool,
}

impl SqlWriteStream {
    pub fn has_schema_change(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, SqlWriteOp::SchemaChange { .. }))
    }

    /// Row writes, the `num_completed` of a keyless SQL-mode response.
    pub fn row_writes(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !matches!(op, SqlWriteOp::SchemaChange { .. }))
            .count()
    }
}

/// The engine itself: parse/plan/execute elsewhere, write stream back here.
pub trait SqlEngine: Send + Sync {
    fn execute(&self, sql: &str, mode: TranMode) -> BlockResult<SqlWriteStream>;
}

/// Engine stub that refuses everything; for deployments without the SQL
/// surface.
pub struct NoSqlEngine;

impl SqlEngine for NoSqlEngine {
    fn execute(&self, _sql: &str, _mode: TranMode) -> BlockResult<SqlWriteStream> {
        Err(tessera_errors::BlockError::SqlPrepare(
            "sql surface disabled".into(),
        ))
    }
}
