//! Entry points: request-type dispatch, the master check and forwarding,
//! long-transaction assembly, and the outer deadlock-retry driver around
//! one block attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tessera_dist::DistTxnRegistry;
use tessera_errors::{BlockError, Errstat, Rcode};
use tessera_store::{DataStore, TranId};
use tessera_wire::{
    BlockReqHdr, BlockState, Cursor, Endian, LongBlockHdr, QueryEffects, ReqHdr, ReqType,
    Writer, LONG_HDR_LEN, MAX_BLOCK_OPS, REQ_HDR_LEN,
};
use tracing::{debug, warn};

use crate::blkseq::epoch_now;
use crate::context::ProcessorContext;
use crate::exec::{Attempt, MainOutcome};
use crate::forward::{forward_block_to_master, Cluster};
use crate::longtrn::{LongTranTable, PieceOutcome};
use crate::sql::SqlEngine;

/// Stored-procedure write hook behind the CUSTOM opcode; deployments
/// without one reject the op.
pub trait CustomOp: Send + Sync {
    fn apply(
        &self,
        opname: &str,
        payload: &[u8],
        store: &dyn DataStore,
        tran: TranId,
    ) -> Result<(), BlockError>;
}

/// Where a request came from; offloaded-SQL submissions are rejected
/// instead of forwarded when this node is not master (the replicant
/// retries against the new master itself).
#[derive(Clone, Copy, Debug, Default)]
pub struct Origin {
    pub from_socket_sql: bool,
}

/// The reply handed back to the transport: an exit code, the packed
/// response frame, and the structured error when the request asked for one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockResponse {
    pub rc: i32,
    pub bytes: Vec<u8>,
    pub errstat: Option<Errstat>,
    pub effects: Option<QueryEffects>,
}

impl BlockResponse {
    pub fn error(e: &BlockError) -> BlockResponse {
        BlockResponse {
            rc: e.rcode().as_i32(),
            bytes: Vec::new(),
            errstat: Some(e.errstat()),
            effects: None,
        }
    }

    pub fn ok() -> BlockResponse {
        BlockResponse {
            rc: Rcode::Ok.as_i32(),
            bytes: Vec::new(),
            errstat: None,
            effects: None,
        }
    }
}

/// The block processor. One per node; block threads call
/// [`process`](Self::process) concurrently.
pub struct BlockProcessor {
    pub ctx: Arc<ProcessorContext>,
    pub(crate) store: Arc<dyn DataStore>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) sql: Arc<dyn SqlEngine>,
    pub(crate) dist: Arc<DistTxnRegistry>,
    pub(crate) custom: Option<Arc<dyn CustomOp>>,
    longtrn: LongTranTable,
}

impl BlockProcessor {
    pub fn new(
        ctx: Arc<ProcessorContext>,
        store: Arc<dyn DataStore>,
        cluster: Arc<dyn Cluster>,
        sql: Arc<dyn SqlEngine>,
        dist: Arc<DistTxnRegistry>,
    ) -> BlockProcessor {
        BlockProcessor {
            ctx,
            store,
            cluster,
            sql,
            dist,
            custom: None,
            longtrn: LongTranTable::new(),
        }
    }

    pub fn with_custom_op(mut self, custom: Arc<dyn CustomOp>) -> BlockProcessor {
        self.custom = Some(custom);
        self
    }

    /// Run one client frame to completion: parse, route, execute, respond.
    /// The frame is borrowed mutably because deadlock retries restore it
    /// from the private backup in place.
    pub fn process(&self, frame: &mut Vec<u8>, origin: Origin) -> BlockResponse {
        let hdr = match ReqHdr::get(frame) {
            Ok(h) => h,
            Err(e) => return BlockResponse::error(&e.into()),
        };

        if hdr.req_type.is_long() {
            return self.process_long(frame, hdr, origin);
        }

        let endian = hdr.req_type.endian();
        let (num_reqs, mut blkstate) = match Self::parse_block_hdr(frame, endian) {
            Ok(v) => v,
            Err(e) => return BlockResponse::error(&e),
        };

        if let Some(resp) = self.reroute_if_not_master(frame, origin) {
            return resp;
        }

        self.run_with_retries(frame, hdr, endian, num_reqs, &mut blkstate, origin)
    }

    fn parse_block_hdr(
        frame: &[u8],
        endian: Endian,
    ) -> Result<(usize, BlockState), BlockError> {
        let mut c = Cursor::over(frame, REQ_HDR_LEN, frame.len(), endian);
        let bh = BlockReqHdr::get(&mut c)?;
        let mut st = BlockState::new(c.pos());
        st.set_end(frame, bh.offset_end)?;
        if bh.num_reqs < 1 || bh.num_reqs > MAX_BLOCK_OPS as i64 {
            return Err(BlockError::BadRequest(format!(
                "bad number of requests {}",
                bh.num_reqs
            )));
        }
        Ok((bh.num_reqs as usize, st))
    }

    /// Long transactions: buffer pieces keyed by tranid, then synthesize a
    /// short-block frame from the assembled body and run it.
    fn process_long(
        &self,
        frame: &mut Vec<u8>,
        hdr: ReqHdr,
        origin: Origin,
    ) -> BlockResponse {
        let endian = hdr.req_type.endian();
        let mut c = Cursor::over(frame, REQ_HDR_LEN, frame.len(), endian);
        let lh = match LongBlockHdr::get(&mut c) {
            Ok(h) => h,
            Err(e) => return BlockResponse::error(&e.into()),
        };
        let body_start = REQ_HDR_LEN + LONG_HDR_LEN;
        let mut st = BlockState::new(body_start);
        if let Err(e) = st.set_end(frame, lh.offset_end()) {
            return BlockResponse::error(&e.into());
        }
        let body = frame[body_start..st.req_end].to_vec();

        match self.longtrn.add_piece(&lh, &body) {
            Err(e) => BlockResponse::error(&e),
            Ok(PieceOutcome::Buffered) => BlockResponse::ok(),
            Ok(PieceOutcome::Complete { body, num_reqs }) => {
                self.ctx.long_request_bytes.fetch_add(
                    body.len() as u64,
                    std::sync::atomic::Ordering::Relaxed,
                );
                let mut assembled =
                    match Self::synthesize_frame(&body, num_reqs, hdr.flags, endian) {
                        Ok(f) => f,
                        Err(e) => return BlockResponse::error(&e),
                    };
                if let Some(resp) = self.reroute_if_not_master(&assembled, origin) {
                    return resp;
                }
                let hdr = ReqHdr::get(&assembled).expect("synthesized header");
                let (num_reqs, mut blkstate) =
                    match Self::parse_block_hdr(&assembled, endian) {
                        Ok(v) => v,
                        Err(e) => return BlockResponse::error(&e),
                    };
                self.run_with_retries(
                    &mut assembled,
                    hdr,
                    endian,
                    num_reqs,
                    &mut blkstate,
                    origin,
                )
            }
        }
    }

    fn synthesize_frame(
        body: &[u8],
        num_reqs: i64,
        flags: u32,
        endian: Endian,
    ) -> Result<Vec<u8>, BlockError> {
        let body_start = REQ_HDR_LEN + 8;
        let total = body_start + body.len();
        let mut frame = Vec::with_capacity(total);
        {
            let mut w = Writer::new(&mut frame, Endian::Big, total);
            w.put_u32(ReqType::Block.as_u32())
                .map_err(BlockError::from)?;
        }
        let mut w = Writer::new(&mut frame, endian, total);
        w.put_u32((total / 4) as u32).map_err(BlockError::from)?;
        w.put_u32(flags).map_err(BlockError::from)?;
        w.put_u32(0).map_err(BlockError::from)?; // luxref
        w.put_u32(num_reqs as u32).map_err(BlockError::from)?;
        w.put_u32((total / 4) as u32 + 1).map_err(BlockError::from)?; // end offset
        w.put_bytes(body).map_err(BlockError::from)?;
        Ok(frame)
    }

    /// Master check. `None` means run locally.
    fn reroute_if_not_master(&self, frame: &[u8], origin: Origin) -> Option<BlockResponse> {
        let tun = &self.ctx.tunables;
        if tun.local_mode || self.cluster.is_master() {
            return None;
        }
        if origin.from_socket_sql {
            // ask the replicant to retry against the new master
            return Some(BlockResponse {
                rc: Rcode::Rejected.as_i32(),
                bytes: Vec::new(),
                errstat: Some(Errstat::new(Rcode::NoMaster.as_i32(), "not master")),
                effects: None,
            });
        }
        if !self.cluster.am_coherent() {
            return Some(BlockResponse::error(&BlockError::Rejected));
        }
        Some(match forward_block_to_master(self.cluster.as_ref(), frame) {
            Ok(()) => BlockResponse {
                rc: Rcode::InternalForward.as_i32(),
                bytes: Vec::new(),
                errstat: None,
                effects: None,
            },
            Err(e) => BlockResponse::error(&e),
        })
    }

    /// The outer driver: run attempts until one completes, retrying
    /// deadlocks with the buffer restored from backup, a bumped deadlock
    /// priority, a writer penalty and a short random poll between rounds.
    fn run_with_retries(
        &self,
        frame: &mut Vec<u8>,
        hdr: ReqHdr,
        endian: Endian,
        num_reqs: usize,
        blkstate: &mut BlockState,
        origin: Origin,
    ) -> BlockResponse {
        let tun = self.ctx.tunables.clone();
        let mut retries: u32 = 0;
        let mut priority: i32 = 0;
        let mut penalized = false;

        let resp = loop {
            match self.gauged_attempt(
                frame, hdr, endian, num_reqs, blkstate, origin, retries, &mut priority,
            ) {
                MainOutcome::Done(resp) => break resp,
                MainOutcome::Retry => {
                    retries += 1;
                    if retries >= tun.maxretries {
                        warn!(retries, "giving up, too many retries");
                        break BlockResponse::error(&BlockError::Internal(format!(
                            "failed after {retries} retries"
                        )));
                    }
                    if !penalized {
                        self.ctx.penalty.retry_started();
                        penalized = true;
                    }
                    let ms = rand::rng().random_range(1..=25);
                    std::thread::sleep(Duration::from_millis(ms));
                }
            }
        };
        if penalized {
            self.ctx.penalty.retry_done();
        }
        resp
    }

    /// One attempt inside the block gauge. A node that is downgrading
    /// turns new block threads away at the door.
    #[allow(clippy::too_many_arguments)]
    fn gauged_attempt(
        &self,
        frame: &mut Vec<u8>,
        hdr: ReqHdr,
        endian: Endian,
        num_reqs: usize,
        blkstate: &mut BlockState,
        origin: Origin,
        retries: u32,
        priority: &mut i32,
    ) -> MainOutcome {
        if self
            .ctx
            .gauge_enter(self.store.lock_desired())
            .is_err()
        {
            return MainOutcome::Done(BlockResponse::error(&BlockError::Rejected));
        }
        debug!(retries, num_reqs, "block attempt");
        let outcome = Attempt::new(
            self, frame, hdr, endian, num_reqs, blkstate, origin, retries, priority,
        )
        .run();
        self.ctx.gauge_exit();
        outcome
    }

    pub(crate) fn epoch(&self) -> u32 {
        epoch_now()
    }
}
