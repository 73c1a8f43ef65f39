//! The block processor: the write path that turns a client batch of tagged
//! writes and offloaded SQL into a durable, serializable, optionally
//! distributed commit, idempotent across retries, deadlocks and master
//! swings.
//!
//! The seams are explicit: storage behind [`tessera_store::DataStore`], the
//! SQL engine behind [`sql::SqlEngine`], cluster routing behind
//! [`forward::Cluster`], and distributed-transaction rendezvous behind
//! [`tessera_dist::DistTxnRegistry`]. Everything process-wide lives in one
//! [`context::ProcessorContext`] value owned by the service.

pub mod blkseq;
pub mod blob;
pub mod context;
mod exec;
pub mod forward;
pub mod longtrn;
pub mod penalty;
pub mod processor;
pub mod sql;

pub use blkseq::{BlkseqKey, ReplayedResponse};
pub use context::{ProcessorContext, Tunables};
pub use forward::{Cluster, SoloCluster};
pub use processor::{BlockProcessor, BlockResponse, CustomOp, Origin};
pub use sql::{NoSqlEngine, SqlEngine, SqlWriteOp, SqlWriteStream};
