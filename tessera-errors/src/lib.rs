//! Return codes and error types for the Tessera write path.
//!
//! Every failure that can escape the block processor is represented twice:
//! as a [`BlockError`] while it propagates through Rust code, and as a
//! numeric [`Rcode`] once it is packed into a response frame or a blockseq
//! payload. The mapping between the two is total; there is no "unknown"
//! escape hatch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client-visible exit codes.
///
/// `Ok` is pinned at zero by the wire contract. The remaining discriminants
/// are stable constants of this crate: they round-trip through the `rcode`
/// words of RSP/RSPKL frames and through blockseq payloads, so changing one
/// is a wire-format change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Rcode {
    Ok = 0,
    Verify = 4,
    InternalRetry = 8,
    BadReq = 110,
    Internal = 177,
    Rejected = 186,
    InternalForward = 193,
    TranClientRetry = 210,
    Incoherent = 212,
    BlockFailed = 220,
    NotSerial = 230,
    Constraint = 301,
    NullConstraint = 303,
    ConvertData = 307,
    ConvertIndex = 308,
    DistAbort = 310,
    NoRecordsFound = 316,
    BlobTooLarge = 318,
    SqlPrepare = 319,
    SchemaChange = 330,
    TranTooBig = 333,
    NotDurable = 350,
    UncommittableTxn = 404,
    NoMaster = 1000,
}

impl Rcode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Structural errors keep their own code through the 2PC abort path;
    /// everything else is reported as `BlockFailed + errcode`.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Rcode::NoRecordsFound
                | Rcode::ConvertData
                | Rcode::NullConstraint
                | Rcode::SqlPrepare
                | Rcode::Constraint
                | Rcode::UncommittableTxn
                | Rcode::NoMaster
                | Rcode::NotSerial
                | Rcode::DistAbort
                | Rcode::SchemaChange
                | Rcode::TranTooBig
        )
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}

/// Rewrite policy applied when a distributed transaction aborts: structural
/// rcodes are surfaced as-is, anything else collapses to
/// `BlockFailed + errcode` so the client sees one failure family.
pub fn rewrite_rcode(outrc: Rcode, errcode: i32) -> i32 {
    if outrc.is_structural() {
        outrc.as_i32()
    } else {
        Rcode::BlockFailed.as_i32() + errcode
    }
}

/// Maximum length of the human-readable half of an [`Errstat`] once it is
/// packed onto the wire.
pub const ERRSTAT_STR_SZ: usize = 128;

/// Structured error status carried next to an exit code: a numeric value and
/// a human-readable reason. The string is truncated to [`ERRSTAT_STR_SZ`]
/// when encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errstat {
    pub val: i32,
    pub msg: String,
}

impl Errstat {
    pub fn new(val: i32, msg: impl Into<String>) -> Self {
        let mut msg = msg.into();
        msg.truncate(ERRSTAT_STR_SZ);
        Errstat { val, msg }
    }

    pub fn is_set(&self) -> bool {
        self.val != 0 || !self.msg.is_empty()
    }
}

/// Failures that can escape a block transaction.
///
/// The variants mirror the exit-code families in [`Rcode`]; `rcode()` is the
/// canonical mapping used when packing responses.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not master")]
    NoMaster,

    #[error("request rejected")]
    Rejected,

    #[error("node incoherent")]
    Incoherent,

    #[error("verify error on op {opnum}")]
    Verify { opnum: usize },

    #[error("transaction is not serializable")]
    NotSerial,

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("null constraint violation: {0}")]
    NullConstraint(String),

    #[error("cannot convert data: {0}")]
    ConvertData(String),

    #[error("cannot convert index: {0}")]
    ConvertIndex(String),

    #[error("transaction is uncommittable: {0}")]
    UncommittableTxn(String),

    #[error("transaction aborted by coordinator")]
    DistAbort,

    #[error("no records found")]
    NoRecordsFound,

    #[error("sql prepare failed: {0}")]
    SqlPrepare(String),

    #[error("schema change failed: {0}")]
    SchemaChange(String),

    #[error("transaction too big")]
    TranTooBig,

    #[error("blob exceeds maximum length")]
    BlobTooLarge,

    #[error("commit did not replicate durably")]
    NotDurable,

    #[error("block failed with errcode {errcode}")]
    BlockFailed { errcode: i32 },

    /// The client (or proxy) should resubmit the whole request.
    #[error("client should retry")]
    ClientRetry,

    /// Deadlock or equivalent; the outer driver retries the batch in place.
    #[error("internal retry")]
    InternalRetry,

    /// The request was repackaged and handed to the master.
    #[error("forwarded to master")]
    InternalForward,
}

impl BlockError {
    pub fn rcode(&self) -> Rcode {
        match self {
            BlockError::BadRequest(_) => Rcode::BadReq,
            BlockError::Internal(_) => Rcode::Internal,
            BlockError::NoMaster => Rcode::NoMaster,
            BlockError::Rejected => Rcode::Rejected,
            BlockError::Incoherent => Rcode::Incoherent,
            BlockError::Verify { .. } => Rcode::Verify,
            BlockError::NotSerial => Rcode::NotSerial,
            BlockError::Constraint(_) => Rcode::Constraint,
            BlockError::NullConstraint(_) => Rcode::NullConstraint,
            BlockError::ConvertData(_) => Rcode::ConvertData,
            BlockError::ConvertIndex(_) => Rcode::ConvertIndex,
            BlockError::UncommittableTxn(_) => Rcode::UncommittableTxn,
            BlockError::DistAbort => Rcode::DistAbort,
            BlockError::NoRecordsFound => Rcode::NoRecordsFound,
            BlockError::SqlPrepare(_) => Rcode::SqlPrepare,
            BlockError::SchemaChange(_) => Rcode::SchemaChange,
            BlockError::TranTooBig => Rcode::TranTooBig,
            BlockError::BlobTooLarge => Rcode::BlobTooLarge,
            BlockError::NotDurable => Rcode::NotDurable,
            BlockError::BlockFailed { .. } => Rcode::BlockFailed,
            BlockError::ClientRetry => Rcode::TranClientRetry,
            BlockError::InternalRetry => Rcode::InternalRetry,
            BlockError::InternalForward => Rcode::InternalForward,
        }
    }

    pub fn errstat(&self) -> Errstat {
        Errstat::new(self.rcode().as_i32(), self.to_string())
    }

    /// Transient failures the outer driver may retry without involving the
    /// client.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlockError::InternalRetry | BlockError::NotDurable | BlockError::Rejected
        )
    }
}

pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_keeps_structural_codes() {
        assert_eq!(rewrite_rcode(Rcode::NotSerial, 4), Rcode::NotSerial.as_i32());
        assert_eq!(rewrite_rcode(Rcode::Constraint, 4), Rcode::Constraint.as_i32());
        assert_eq!(rewrite_rcode(Rcode::DistAbort, 0), Rcode::DistAbort.as_i32());
    }

    #[test]
    fn rewrite_folds_everything_else_into_block_failed() {
        assert_eq!(
            rewrite_rcode(Rcode::Internal, 4),
            Rcode::BlockFailed.as_i32() + 4
        );
        assert_eq!(
            rewrite_rcode(Rcode::Verify, 4),
            Rcode::BlockFailed.as_i32() + 4
        );
    }

    #[test]
    fn errstat_truncates_long_reasons() {
        let e = Errstat::new(1, "x".repeat(4 * ERRSTAT_STR_SZ));
        assert_eq!(e.msg.len(), ERRSTAT_STR_SZ);
    }

    #[test]
    fn rcode_mapping_is_total() {
        // Every variant must map; a missing arm fails to compile, this just
        // spot-checks the interesting ones.
        assert_eq!(BlockError::Verify { opnum: 3 }.rcode(), Rcode::Verify);
        assert_eq!(
            BlockError::BlockFailed { errcode: 4 }.rcode(),
            Rcode::BlockFailed
        );
        assert_eq!(BlockError::InternalRetry.rcode(), Rcode::InternalRetry);
    }
}
