//! Non-master routing. The cluster view and the transport are external;
//! the forwarder repacks the frame under the forward opcode and hands it to
//! the current master.

use tessera_errors::{BlockError, BlockResult};
use tessera_wire::repack_for_master;
use tracing::debug;

/// Cluster membership view plus the node-to-node transport.
pub trait Cluster: Send + Sync {
    /// This node is currently master and may run block transactions.
    fn is_master(&self) -> bool;
    fn master(&self) -> String;
    /// This replicant is caught up enough to serve.
    fn am_coherent(&self) -> bool {
        true
    }
    /// Ship a repacked frame to `host`. An error means the request was not
    /// delivered.
    fn send_to_master(&self, host: &str, frame: &[u8]) -> Result<(), String>;
}

/// A single-node view for tests and standalone mode.
pub struct SoloCluster;

impl Cluster for SoloCluster {
    fn is_master(&self) -> bool {
        true
    }
    fn master(&self) -> String {
        "localhost".into()
    }
    fn send_to_master(&self, _host: &str, _frame: &[u8]) -> Result<(), String> {
        Err("single node cluster".into())
    }
}

/// Repack `frame` with the forward opcode and send it to the master. The
/// errstat flag rides along in the copied header. Transport failure is a
/// rejection; the client retries elsewhere.
pub fn forward_block_to_master(cluster: &dyn Cluster, frame: &[u8]) -> BlockResult<()> {
    let master = cluster.master();
    let repacked = repack_for_master(frame)?;
    debug!(master, len = repacked.len(), "forwarding block to master");
    match cluster.send_to_master(&master, &repacked) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(error = %e, "forward failed");
            Err(BlockError::Rejected)
        }
    }
}
