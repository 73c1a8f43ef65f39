//! One attempt at running a block transaction: pre-scan, transaction
//! acquisition, opcode dispatch, deferred index/constraint work,
//! serializable read-set validation, commit and backout.
//!
//! Control flow is a ladder of fallible phases; any failure funnels into
//! [`Attempt::backout`], which unwinds whatever resources the attempt holds
//! (blob buffers, schema-change sub-transactions, the data transaction) on
//! every path.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tessera_dist::{DistTxn, WaitOutcome};
use tessera_errors::{rewrite_rcode, BlockError, Errstat, Rcode};
use tessera_srs::TranMode;
use tessera_store::{StoreError, TranId};
use tessera_wire::{
    pack_rsp, pack_rspkl, BlockErr, BlockOp, BlockOpcode, BlockState, Cursor, Endian,
    FstblkBody, FstblkPayload, OpHeader, QueryEffects, ReqHdr, RspKl, SqlIsolation,
    WireError, Writer, FSTBLK_MAX_BUF_LEN,
};
use tracing::{debug, error, warn};

use crate::blkseq::{dist_abort_payload, replay_response, BlkseqKey};
use crate::blob::BlobBufferSet;
use crate::processor::{BlockProcessor, BlockResponse, Origin};
use crate::sql::{SqlWriteOp, SqlWriteStream};

/// Outcome of one gauged attempt.
pub(crate) enum MainOutcome {
    Done(BlockResponse),
    /// Deadlock; the request buffer has been restored, run it again.
    Retry,
}

pub(crate) struct Attempt<'a> {
    p: &'a BlockProcessor,
    frame: &'a mut Vec<u8>,
    hdr: ReqHdr,
    endian: Endian,
    num_reqs: usize,
    st: &'a mut BlockState,
    origin: Origin,
    retries: u32,
    priority: &'a mut i32,

    // discovered by the pre-scan
    blkseq_key: Option<BlkseqKey>,
    sql_stream: Option<SqlWriteStream>,
    sql_mode: Option<TranMode>,
    have_keyless: bool,
    have_tagged_write: bool,
    tranddl: bool,

    // execution state
    usedb: Option<String>,
    blobs: BlobBufferSet,
    tz: Option<String>,
    last_genid: u64,
    opnum: usize,
    nops: usize,
    delayed: bool,
    effects: QueryEffects,
    sc_closed_files: bool,

    // transaction handles
    trans: Option<TranId>,
    parent: Option<TranId>,
    sc_logical: Option<TranId>,
    sc_tran: Option<TranId>,
    sc_close: Option<TranId>,
    osql_notrans: bool,

    // error detail for the response
    err: BlockErr,
    numerrs: u32,
    errstat: Errstat,
}

impl<'a> Attempt<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        p: &'a BlockProcessor,
        frame: &'a mut Vec<u8>,
        hdr: ReqHdr,
        endian: Endian,
        num_reqs: usize,
        st: &'a mut BlockState,
        origin: Origin,
        retries: u32,
        priority: &'a mut i32,
    ) -> Attempt<'a> {
        Attempt {
            p,
            frame,
            hdr,
            endian,
            num_reqs,
            st,
            origin,
            retries,
            priority,
            blkseq_key: None,
            sql_stream: None,
            sql_mode: None,
            have_keyless: false,
            have_tagged_write: false,
            tranddl: false,
            usedb: None,
            blobs: BlobBufferSet::new(),
            tz: None,
            last_genid: 0,
            opnum: 0,
            nops: 0,
            delayed: false,
            effects: QueryEffects::default(),
            sc_closed_files: false,
            trans: None,
            parent: None,
            sc_logical: None,
            sc_tran: None,
            sc_close: None,
            osql_notrans: false,
            err: BlockErr::default(),
            numerrs: 0,
            errstat: Errstat::default(),
        }
    }

    pub(crate) fn run(mut self) -> MainOutcome {
        debug!(
            retries = self.retries,
            from_socket_sql = self.origin.from_socket_sql,
            num_reqs = self.num_reqs,
            "block attempt"
        );
        match self.prescan() {
            Err(e) => return self.reject(e),
            Ok(Some(resp)) => return MainOutcome::Done(resp),
            Ok(None) => {}
        }

        if self.p.ctx.tunables.disable_tagged_api_writes
            && self.have_tagged_write
            && self.sql_mode.is_none()
        {
            return self.reject(BlockError::BadRequest(
                "tagged api writes are disabled".into(),
            ));
        }

        if let Err(e) = self.create_transactions() {
            return self.backout(e);
        }
        if let Err(e) = self.run_ops() {
            return self.backout(e);
        }
        if let Err(e) = self.deferred_work() {
            return self.backout(e);
        }
        match self.commit_phase() {
            Ok(resp) => MainOutcome::Done(resp),
            Err(e) => self.backout(e),
        }
    }

    fn store(&self) -> &dyn tessera_store::DataStore {
        self.p.store.as_ref()
    }

    fn have_blkseq(&self) -> bool {
        self.p.ctx.tunables.use_blkseq && self.blkseq_key.is_some()
    }

    fn can_retry(&self) -> bool {
        self.blkseq_key.as_ref().map(|k| k.is_cnonce()).unwrap_or(false)
            && self
                .sql_stream
                .as_ref()
                .map(|s| s.replicant_can_retry)
                .unwrap_or(false)
    }

    fn dist(&self) -> Option<&DistTxn> {
        self.sql_stream.as_ref().and_then(|s| s.dist.as_ref())
    }

    /// Walk the opcode list without executing: pull out the blockseq key,
    /// detect SQL mode (and run the offloaded SQL so schema-change intent
    /// is known before transactions open), and check the blockseq store
    /// for an early duplicate.
    fn prescan(&mut self) -> Result<Option<BlockResponse>, BlockError> {
        let mut pos = self.st.body_start;
        let mut found_blkseq = false;
        let mut sql_text: Option<(SqlIsolation, String)> = None;

        for _ in 0..self.num_reqs {
            if pos >= self.st.req_end {
                break;
            }
            let frame: &[u8] = self.frame;
            let mut c = Cursor::over(frame, pos, self.st.req_end, self.endian);
            let hdr = OpHeader::get(&mut c)?;
            let next = hdr.next.to_byte_index(frame.len())?;
            if next > self.st.req_end || next < pos {
                return Err(WireError::OffsetOutOfRange(hdr.next.0).into());
            }
            let opcode = BlockOpcode::from_u16(hdr.opcode)?;
            if (opcode as u16) >= 130 {
                self.have_keyless = true;
            }
            if opcode.is_tagged_write() {
                self.have_tagged_write = true;
            }
            match opcode {
                BlockOpcode::Seq | BlockOpcode::SeqV2 => {
                    if found_blkseq {
                        return Err(WireError::DuplicateSeq.into());
                    }
                    found_blkseq = true;
                    let mut body = Cursor::over(frame, c.pos(), next, self.endian);
                    match BlockOp::get(opcode, &mut body)? {
                        BlockOp::Seq { seq } => {
                            self.blkseq_key = BlkseqKey::from_seq(seq);
                        }
                        BlockOp::SeqV2 { key } => {
                            self.blkseq_key = Some(BlkseqKey::from_cnonce(&key));
                        }
                        _ => unreachable!("seq opcode decoded to non-seq op"),
                    }
                }
                BlockOpcode::SockSql
                | BlockOpcode::Recom
                | BlockOpcode::Snapisol
                | BlockOpcode::Serial => {
                    let mut body = Cursor::over(frame, c.pos(), next, self.endian);
                    if let BlockOp::Sql { isolation, sql } = BlockOp::get(opcode, &mut body)? {
                        sql_text = Some((isolation, sql));
                    }
                }
                _ => {}
            }
            pos = next;
        }

        // early duplicate detection, before any transaction is opened and
        // before the offloaded SQL runs
        if self.p.ctx.tunables.use_blkseq && self.blkseq_key.is_some() {
            let key = self.blkseq_key.as_ref().unwrap();
            if let Some(payload) = self.store().blkseq_find(key.bytes()) {
                warn!("early blockseq replay detected");
                let replayed = replay_response(
                    &payload,
                    self.num_reqs,
                    self.endian,
                    self.hdr.position_mode(),
                )?;
                self.p.ctx.note_replay(replayed.outrc != 0);
                return Ok(Some(BlockResponse {
                    rc: replayed.outrc,
                    bytes: replayed.bytes,
                    errstat: replayed.errstat,
                    effects: replayed.effects,
                }));
            }
            // everything executed from here may scribble on the request;
            // keep a pristine copy for deadlock retries
            self.st.backup_all(self.frame);
        }

        // run the offloaded SQL; its write stream tells us whether this
        // block carries schema changes and whether it is distributed
        if let Some((isolation, sql)) = sql_text {
            let mode = match isolation {
                SqlIsolation::SockSql => TranMode::SockSql,
                SqlIsolation::ReadCommitted => TranMode::ReadCommitted,
                SqlIsolation::SnapshotIsolation => TranMode::SnapshotIsolation,
                SqlIsolation::Serializable => TranMode::Serializable,
            };
            self.sql_mode = Some(mode);
            let stream = self.p.sql.execute(&sql, mode)?;
            self.tranddl = stream.has_schema_change();
            self.sql_stream = Some(stream);
        }

        Ok(None)
    }

    /// Open the transaction tree for this attempt. The four regimes are
    /// mutually exclusive: schema-change blocks get a logical envelope with
    /// schema-change children, rowlocks gets a single logical transaction,
    /// and plain pagelocks blocks get a parent (for the blockseq) with one
    /// physical child.
    fn create_transactions(&mut self) -> Result<(), BlockError> {
        let tun = &self.p.ctx.tunables;
        if tun.deadlock_youngest_ever && *self.priority == 0 {
            *self.priority = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i32)
                .unwrap_or(0);
        }

        let store = self.p.store.as_ref();
        if self.tranddl {
            let logical = store.trans_start_logical_sc().map_err(map_store)?;
            let phys = store.get_physical_tran(logical).map_err(map_store)?;
            if tun.rowlocks {
                self.trans = Some(logical);
                self.sc_tran = Some(store.trans_start_sc(phys).map_err(map_store)?);
                if tun.sc_close_txn {
                    self.sc_close = Some(store.trans_start_sc(phys).map_err(map_store)?);
                }
            } else {
                self.sc_logical = Some(logical);
                self.parent = Some(phys);
                self.trans = Some(store.trans_start(Some(phys)).map_err(map_store)?);
                self.sc_tran = Some(store.trans_start_sc(phys).map_err(map_store)?);
                if tun.sc_close_txn {
                    self.sc_close = Some(store.trans_start_sc(phys).map_err(map_store)?);
                }
            }
        } else if !tun.rowlocks {
            if self.have_blkseq() {
                self.parent = Some(store.trans_start(None).map_err(map_store)?);
            }
            self.trans = Some(store.trans_start(self.parent).map_err(map_store)?);
        } else {
            self.trans = Some(store.trans_start_logical().map_err(map_store)?);
        }
        Ok(())
    }

    /// A tagged op needs a live write transaction. SQL mode tears the
    /// tagged transaction down when it takes over; mixing tagged ops back
    /// in afterwards is legal only if we know to recreate it.
    fn write_tran(&mut self) -> Result<TranId, BlockError> {
        if self.trans.is_none() {
            if self.osql_notrans {
                error!("incorrect transaction mix, sql and dyntags");
                self.create_transactions()?;
                self.osql_notrans = false;
            } else {
                panic!("tagged op with no transaction outside sql mode");
            }
        }
        Ok(self.trans.unwrap())
    }

    fn run_ops(&mut self) -> Result<(), BlockError> {
        self.opnum = 0;
        while self.opnum < self.num_reqs {
            if self.st.pos >= self.st.req_end {
                return Err(BlockError::BadRequest(format!(
                    "request ends after {} of {} ops",
                    self.opnum, self.num_reqs
                )));
            }
            let (opcode, op) = {
                let frame: &[u8] = self.frame;
                let mut c = Cursor::over(frame, self.st.pos, self.st.req_end, self.endian);
                let hdr = OpHeader::get(&mut c)?;
                self.st.set_next(frame, hdr.next)?;
                let next = self.st.next_start().unwrap();
                let opcode = BlockOpcode::from_u16(hdr.opcode)?;
                let mut body = Cursor::over(frame, c.pos(), next.max(c.pos()), self.endian);
                let op = BlockOp::get(opcode, &mut body)?;
                (opcode, op)
            };
            self.st.advance()?;
            if let Err(e) = self.apply_op(opcode, op) {
                self.set_op_error(&e);
                return Err(e);
            }
            self.opnum += 1;
        }
        Ok(())
    }

    fn set_op_error(&mut self, e: &BlockError) {
        self.numerrs = 1;
        self.err = BlockErr {
            blockop_num: self.opnum as i32,
            errcode: e.rcode().as_i32(),
            ixnum: match e {
                BlockError::Constraint(_) => -1,
                _ => 0,
            },
        };
        self.errstat = e.errstat();
    }

    fn usedb(&self) -> Result<&str, BlockError> {
        self.usedb
            .as_deref()
            .ok_or_else(|| BlockError::BadRequest("no use op before record op".into()))
    }

    /// The last op of a batch can skip constraint deferral when the target
    /// table has no constraints; everything else defers.
    fn defer_for_add(&mut self, table: &str) -> bool {
        let last = self.opnum + 1 == self.num_reqs;
        let defer = !(last
            && !self.p.ctx.tunables.goslow
            && !self.store().table_has_constraints(table));
        if defer {
            self.delayed = true;
        }
        defer
    }

    fn apply_add(&mut self, record: &[u8]) -> Result<(), BlockError> {
        let table = self.usedb()?.to_owned();
        if self.blobs.any_exists() {
            // the consuming op requires every declared byte collected
            let _blobs = self.blobs.take_for_op()?;
        }
        let defer = self.defer_for_add(&table);
        let tran = self.write_tran()?;
        let genid = self
            .store()
            .add_record(tran, &table, record, defer)
            .map_err(map_store)?;
        self.last_genid = genid.0;
        self.effects.num_inserted += 1;
        self.effects.num_affected += 1;
        self.nops += 1;
        Ok(())
    }

    fn apply_op(&mut self, opcode: BlockOpcode, op: BlockOp) -> Result<(), BlockError> {
        match op {
            BlockOp::Use { dbnum } => {
                let table = self
                    .store()
                    .table_by_dbnum(dbnum)
                    .ok_or_else(|| BlockError::BadRequest(format!("no table for db {dbnum}")))?;
                self.usedb = Some(table);
            }
            BlockOp::Usekl { table } => {
                if !self.store().table_exists(&table) {
                    return Err(BlockError::BadRequest(format!("no such table {table}")));
                }
                self.usedb = Some(table);
            }
            // key already extracted by the pre-scan
            BlockOp::Seq { .. } | BlockOp::SeqV2 { .. } => {}
            BlockOp::Addsl { record }
            | BlockOp::Adddta { record }
            | BlockOp::Addkl { record, .. }
            | BlockOp::AddklPos { record, .. } => {
                self.apply_add(&record)?;
            }
            // key formation is the store's job; these exist for
            // compatibility with ancient proxies
            BlockOp::Addkey | BlockOp::Delkey => {
                debug!(opcode = ?opcode, "ignoring legacy key op");
            }
            BlockOp::Delsc { key, .. } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                self.store()
                    .del_record_by_key(tran, &table, &key)
                    .map_err(map_store)?;
                self.effects.num_deleted += 1;
                self.effects.num_affected += 1;
                self.nops += 1;
                self.delayed = true;
            }
            BlockOp::Delkl { genid } | BlockOp::Deldta { genid } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                self.store()
                    .del_record_by_genid(tran, &table, tessera_store::Genid(genid))
                    .map_err(map_store)?;
                self.effects.num_deleted += 1;
                self.effects.num_affected += 1;
                self.nops += 1;
                self.delayed = true;
            }
            BlockOp::Upvrrn { verify, record, .. } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                let verify = (!verify.is_empty()).then_some(verify);
                self.store()
                    .upd_record(tran, &table, None, None, verify.as_deref(), &record)
                    .map_err(map_store)
                    .map_err(|e| self.verify_at_op(e))?;
                self.effects.num_updated += 1;
                self.effects.num_affected += 1;
                self.nops += 1;
                self.delayed = true;
            }
            BlockOp::Update {
                genid,
                verify,
                record,
            }
            | BlockOp::Updkl {
                genid,
                verify,
                record,
                ..
            }
            | BlockOp::UpdklPos {
                genid,
                verify,
                record,
                ..
            } => {
                let table = self.usedb()?.to_owned();
                if self.blobs.any_exists() {
                    let _blobs = self.blobs.take_for_op()?;
                }
                let tran = self.write_tran()?;
                let verify = (!verify.is_empty()).then_some(verify);
                let new = self
                    .store()
                    .upd_record(
                        tran,
                        &table,
                        Some(tessera_store::Genid(genid)),
                        None,
                        verify.as_deref(),
                        &record,
                    )
                    .map_err(map_store)
                    .map_err(|e| self.verify_at_op(e))?;
                self.last_genid = new.0;
                self.effects.num_updated += 1;
                self.effects.num_affected += 1;
                self.nops += 1;
                self.delayed = true;
            }
            BlockOp::Updbykey { key, record } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                self.store()
                    .upd_record(tran, &table, None, Some(&key), None, &record)
                    .map_err(map_store)
                    .map_err(|e| self.verify_at_op(e))?;
                self.effects.num_updated += 1;
                self.effects.num_affected += 1;
                self.nops += 1;
                self.delayed = true;
            }
            BlockOp::Qblob {
                blobno,
                length,
                frag_offset,
                frag,
            } => {
                self.blobs.add_fragment(blobno, length, frag_offset, &frag)?;
            }
            BlockOp::Qadd { queue, data } => {
                let tran = self.write_tran()?;
                self.store()
                    .queue_add(tran, &queue, &data)
                    .map_err(map_store)?;
            }
            BlockOp::Qconsume { queue, consumer } => {
                let tran = self.write_tran()?;
                self.store()
                    .queue_consume(tran, &queue, consumer)
                    .map_err(map_store)?;
            }
            BlockOp::Custom { opname, payload } => {
                let hook = self
                    .p
                    .custom
                    .as_ref()
                    .ok_or_else(|| {
                        BlockError::BadRequest(format!("custom op {opname} not supported"))
                    })?
                    .clone();
                let tran = self.write_tran()?;
                hook.apply(&opname, &payload, self.p.store.as_ref(), tran)?;
            }
            BlockOp::Sql { .. } => {
                // the stream was collected in the pre-scan; here SQL mode
                // takes over the transaction, which for pagelocks means the
                // tagged transaction goes away until the bplog commits
                if !self.p.ctx.tunables.rowlocks && !self.tranddl {
                    if let Some(t) = self.trans.take() {
                        self.store().trans_abort(t).map_err(map_store)?;
                    }
                    if let Some(pt) = self.parent.take() {
                        self.store().trans_abort(pt).map_err(map_store)?;
                    }
                    self.osql_notrans = true;
                }
                self.delayed = true;
            }
            BlockOp::Tz { tzname } => {
                self.tz = Some(tzname);
            }
            BlockOp::Pragma { kind, .. } => {
                debug!(kind, "pragma");
            }
            BlockOp::DbglogCookie { cookie } => {
                debug!(cookie, "dbglog cookie");
            }
            BlockOp::Modnum { modnum } => {
                debug!(modnum, "modnum");
            }
            BlockOp::Scsmsk { mask } => {
                debug!(mask, "schema change mask");
            }
            BlockOp::Delolder { epoch, count } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                let n = self
                    .store()
                    .delete_older_than(tran, &table, epoch, count as usize)
                    .map_err(map_store)?;
                self.effects.num_deleted += n as u32;
                self.effects.num_affected += n as u32;
                self.nops += n;
            }
            BlockOp::Uptbl { nrecs, genid } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                self.store()
                    .upgrade_records(tran, &table, tessera_store::Genid(genid), nrecs as usize)
                    .map_err(map_store)?;
            }
            BlockOp::Setflags { flags } => {
                debug!(flags, "setflags");
            }
            BlockOp::Rngdelkl {
                start_key,
                end_key,
                max,
            } => {
                let table = self.usedb()?.to_owned();
                let tran = self.write_tran()?;
                let n = self
                    .store()
                    .range_delete(tran, &table, &start_key, &end_key, max as usize)
                    .map_err(map_store)?;
                self.effects.num_deleted += n as u32;
                self.effects.num_affected += n as u32;
                self.nops += n;
                self.delayed = true;
            }
            BlockOp::Debug => {}
        }
        Ok(())
    }

    /// Attach the failing op number to verify conflicts so the response
    /// points at the right statement.
    fn verify_at_op(&self, e: BlockError) -> BlockError {
        match e {
            BlockError::Verify { .. } => BlockError::Verify { opnum: self.opnum },
            other => other,
        }
    }

    /// Post-loop deferred work: reorder-index resolution, delayed key adds,
    /// delete constraints, add constraints, then the collected SQL write
    /// stream.
    fn deferred_work(&mut self) -> Result<(), BlockError> {
        if !(self.delayed || self.sql_stream.is_some()) {
            return Ok(());
        }

        if let Some(tran) = self.trans {
            self.store()
                .apply_deferred_index_adds(tran)
                .map_err(map_store)?;
            self.store()
                .verify_del_constraints(tran)
                .map_err(map_store)?;
            self.store()
                .verify_add_constraints(tran)
                .map_err(map_store)?;
        }

        if self.sql_stream.is_some() {
            self.apply_bplog()?;
            if let Some(tran) = self.trans {
                self.store()
                    .apply_deferred_index_adds(tran)
                    .map_err(map_store)?;
                self.store()
                    .verify_del_constraints(tran)
                    .map_err(map_store)?;
                self.store()
                    .verify_add_constraints(tran)
                    .map_err(map_store)?;
            }
        }
        Ok(())
    }

    /// Run the collected SQL write stream against the store.
    fn apply_bplog(&mut self) -> Result<(), BlockError> {
        if self.osql_notrans {
            self.create_transactions()?;
            self.osql_notrans = false;
        }
        let ops = self
            .sql_stream
            .as_ref()
            .map(|s| s.ops.clone())
            .unwrap_or_default();
        for (i, op) in ops.iter().enumerate() {
            match op {
                SqlWriteOp::Insert { table, record } => {
                    let tran = self.write_tran()?;
                    let genid = self
                        .store()
                        .add_record(tran, table, record, true)
                        .map_err(map_store)?;
                    self.last_genid = genid.0;
                    self.effects.num_inserted += 1;
                    self.effects.num_affected += 1;
                }
                SqlWriteOp::Update {
                    table,
                    key,
                    verify,
                    record,
                } => {
                    let tran = self.write_tran()?;
                    self.store()
                        .upd_record(tran, table, None, Some(key), verify.as_deref(), record)
                        .map_err(map_store)
                        .map_err(|e| match e {
                            BlockError::Verify { .. } => BlockError::Verify { opnum: i },
                            other => other,
                        })?;
                    self.effects.num_updated += 1;
                    self.effects.num_affected += 1;
                }
                SqlWriteOp::Delete { table, key } => {
                    let tran = self.write_tran()?;
                    self.store()
                        .del_record_by_key(tran, table, key)
                        .map_err(map_store)?;
                    self.effects.num_deleted += 1;
                    self.effects.num_affected += 1;
                }
                SqlWriteOp::SchemaChange { table } => {
                    let sc = self.sc_tran.ok_or_else(|| {
                        BlockError::Internal("schema change without sc transaction".into())
                    })?;
                    self.store().schema_change(sc, table).map_err(map_store)?;
                    self.sc_closed_files = true;
                }
            }
            self.nops += 1;
        }
        Ok(())
    }

    /// Number reported as `num_completed` in keyless responses: record
    /// writes, whether tagged or from the SQL stream. Housekeeping ops
    /// (use, seq, tz) do not count.
    fn completed(&self) -> usize {
        self.nops
    }

    fn pack_success_response(&self) -> Result<Vec<u8>, BlockError> {
        let mut bytes = Vec::new();
        let cap = FSTBLK_MAX_BUF_LEN + 16 * self.num_reqs;
        let mut w = Writer::new(&mut bytes, self.endian, cap);
        if !self.have_keyless {
            pack_rsp(&mut w, self.num_reqs, self.num_reqs, 0)?;
        } else {
            let position = self.hdr.position_mode().then_some(self.last_genid);
            pack_rspkl(&mut w, self.completed(), position, None)?;
        }
        Ok(bytes)
    }

    fn pack_error_response(&self, rc: Rcode) -> Result<Vec<u8>, BlockError> {
        let mut bytes = Vec::new();
        let cap = FSTBLK_MAX_BUF_LEN + 16 * self.num_reqs;
        let mut w = Writer::new(&mut bytes, self.endian, cap);
        if !self.have_keyless {
            pack_rsp(&mut w, self.num_reqs, self.opnum, rc.as_i32())?;
        } else {
            let position = self.hdr.position_mode().then_some(self.last_genid);
            let err = (self.numerrs > 0).then_some(&self.err);
            pack_rspkl(&mut w, self.completed(), position, err)?;
        }
        Ok(bytes)
    }

    /// Exit code for the client given the failing op's rcode.
    fn outrc_for(&self, rc: Rcode) -> i32 {
        if !self.have_keyless {
            return rc.as_i32();
        }
        match rc {
            Rcode::NotSerial
            | Rcode::NotDurable
            | Rcode::TranClientRetry
            | Rcode::InternalRetry
            | Rcode::Rejected
            | Rcode::NoMaster
            | Rcode::DistAbort
            | Rcode::SqlPrepare
            | Rcode::UncommittableTxn
            | Rcode::BadReq
            | Rcode::Internal => rc.as_i32(),
            _ => Rcode::BlockFailed.as_i32(),
        }
    }

    /// Build the blockseq payload mirroring the response we are about to
    /// send. Cnonce keys always carry the snapinfo shape.
    fn build_payload(&self, outrc: i32) -> Result<Vec<u8>, BlockError> {
        let key = self.blkseq_key.as_ref().expect("payload without blkseq");
        let rspkl = RspKl {
            num_completed: self.completed() as u32,
            numerrs: self.numerrs,
        };
        let body = if key.is_cnonce() {
            FstblkBody::SnapInfo {
                outrc,
                errstat: self.errstat.clone(),
                effects: self.effects,
                rspkl,
                err: self.err,
                last_genid: self.last_genid,
            }
        } else if self.have_keyless {
            FstblkBody::RspKl {
                rspkl,
                err: self.err,
                last_genid: self.last_genid,
            }
        } else if outrc == 0 {
            FstblkBody::RspOk { fluff: 0 }
        } else {
            FstblkBody::RspErr {
                num_completed: self.opnum as u32,
                rcode: outrc,
            }
        };
        FstblkPayload {
            body,
            epoch: self.p.epoch(),
        }
        .pack()
        .map_err(|e| BlockError::Internal(format!("payload pack: {e}")))
    }

    /// The stored payload under our key is the canonical outcome; emit it.
    fn replay_stored(&mut self, existing: Option<Vec<u8>>) -> Result<BlockResponse, BlockError> {
        warn!("blockseq replay detected at commit");
        let key = self.blkseq_key.as_ref().expect("replay without blkseq");
        let payload = match existing.or_else(|| self.store().blkseq_find(key.bytes())) {
            Some(p) => p,
            None => {
                // the entry was expired out from under the duplicate; we
                // know it is a replay but not what to answer
                error!("blockseq replay deleted under us");
                self.p.ctx.note_replay(true);
                return Ok(BlockResponse::error(&BlockError::ClientRetry));
            }
        };
        let replayed = replay_response(
            &payload,
            self.num_reqs,
            self.endian,
            self.hdr.position_mode(),
        )?;
        self.p.ctx.note_replay(replayed.outrc != 0);
        Ok(BlockResponse {
            rc: replayed.outrc,
            bytes: replayed.bytes,
            errstat: replayed.errstat,
            effects: replayed.effects,
        })
    }

    /// Serializable/selectv read-set validation followed by commit. Runs
    /// under the commit lock in read mode, upgrading to write mode for the
    /// re-dive, and never re-dives more than once.
    fn commit_phase(&mut self) -> Result<BlockResponse, BlockError> {
        let (readset, selectv) = match self.sql_stream.as_ref() {
            Some(s) => (s.readset.clone(), s.selectv_readset.clone()),
            None => (None, None),
        };

        // The commit lock is taken in read mode; transactions carrying a
        // read-set upgrade to write mode and re-validate, re-diving at most
        // once before trusting the committed-only check.
        let commit_lock = &self.p.ctx.commit_lock;
        let mut rguard: Option<RwLockReadGuard<'_, ()>> = None;
        let mut wguard: Option<RwLockWriteGuard<'_, ()>> = None;
        if readset.is_some() || selectv.is_some() {
            wguard = Some(commit_lock.write());
            let mut dives = 0;
            loop {
                let triggered = readset
                    .as_ref()
                    .map(|r| self.store().serial_check(r, true))
                    .unwrap_or(false)
                    || selectv
                        .as_ref()
                        .map(|r| self.store().serial_check(r, true))
                        .unwrap_or(false);
                if !triggered {
                    break;
                }
                wguard = None;
                if let Some(sv) = selectv.as_ref() {
                    if self.store().serial_check(sv, false) {
                        self.numerrs = 1;
                        self.err = BlockErr {
                            blockop_num: self.opnum as i32,
                            errcode: Rcode::Constraint.as_i32(),
                            ixnum: -1,
                        };
                        self.errstat =
                            Errstat::new(Rcode::Constraint.as_i32(), "selectv constraints");
                        return Err(BlockError::Constraint("selectv constraints".into()));
                    }
                }
                if let Some(r) = readset.as_ref() {
                    if self.store().serial_check(r, false) {
                        self.numerrs = 1;
                        self.err = BlockErr {
                            blockop_num: self.opnum as i32,
                            errcode: Rcode::NotSerial.as_i32(),
                            ixnum: 0,
                        };
                        self.errstat = Errstat::new(
                            Rcode::NotSerial.as_i32(),
                            "transaction is not serializable",
                        );
                        return Err(BlockError::NotSerial);
                    }
                }
                dives += 1;
                if dives > 1 {
                    break;
                }
                wguard = Some(commit_lock.write());
            }
            if wguard.is_none() {
                wguard = Some(commit_lock.write());
            }
        } else {
            rguard = Some(commit_lock.read());
        }

        // no errors yet, release the blob buffers
        self.blobs.free_all();
        debug!(tz = ?self.tz, completed = self.completed(), "committing");

        if self.p.ctx.tunables.replicate_local {
            // local replication tails the commit log; pin the sequence this
            // transaction will carry so consumers see updates in order
            let seqno = self.store().commit_seqno();
            debug!(seqno, "local replication sequence");
        }

        // commit the physical child early in the plain pagelocks regime
        let tun = self.p.ctx.tunables.clone();
        if !tun.rowlocks && self.parent.is_some() && !self.tranddl {
            if let Some(t) = self.trans.take() {
                self.store()
                    .trans_commit(t)
                    .unwrap_or_else(|e| panic!("child commit failed: {e}"));
            }
        }

        let bytes = self.pack_success_response()?;
        let mut outrc = Rcode::Ok.as_i32();

        if !self.have_blkseq() {
            // nothing to make idempotent: commit whatever the regime holds
            if tun.rowlocks {
                match self.commit_rowlocks(None) {
                    Ok(()) => {}
                    Err(StoreError::NotDurable) => return Err(self.not_durable_rc()),
                    Err(e) => return Err(map_store(e)),
                }
            } else {
                if self.tranddl {
                    self.commit_tranddl()?;
                }
                if let Some(t) = self.trans.take() {
                    self.store().trans_commit(t).map_err(map_store)?;
                }
                if let Some(pt) = self.parent.take() {
                    match self.store().trans_commit_adaptive(pt) {
                        Ok(()) => {}
                        Err(StoreError::NotDurable) => return Err(self.not_durable_rc()),
                        Err(e) => return Err(map_store(e)),
                    }
                }
            }
            return Ok(BlockResponse {
                rc: outrc,
                bytes,
                errstat: None,
                effects: Some(self.effects),
            });
        }

        let key = self.blkseq_key.clone().unwrap();
        let payload = self.build_payload(outrc)?;

        if tun.rowlocks {
            // the blockseq rides inside the logical commit record
            return match self.commit_rowlocks(Some((key.bytes(), &payload))) {
                Ok(()) => Ok(BlockResponse {
                    rc: outrc,
                    bytes,
                    errstat: None,
                    effects: Some(self.effects),
                }),
                Err(StoreError::Duplicate { existing }) => self.replay_stored(existing),
                Err(StoreError::NotDurable) => Err(self.not_durable_rc()),
                Err(e) => Err(map_store(e)),
            };
        }

        // pagelocks: insert the blockseq under the parent so data and
        // blockseq commit atomically
        match self
            .store()
            .blkseq_insert(self.parent, key.bytes(), &payload)
        {
            Ok(()) => {}
            Err(StoreError::Duplicate { existing }) => {
                self.abort_everything();
                return self.replay_stored(existing);
            }
            Err(StoreError::Deadlock) => return Err(BlockError::InternalRetry),
            Err(e) => return Err(map_store(e)),
        }

        if self.tranddl {
            self.commit_tranddl()?;
            return Ok(BlockResponse {
                rc: outrc,
                bytes,
                errstat: None,
                effects: Some(self.effects),
            });
        }

        if let Some(dist) = self.dist().cloned() {
            // released before the potentially long prepared wait
            drop(rguard.take());
            drop(wguard.take());
            return self.commit_distributed(&dist, key, bytes);
        }

        if let Some(pt) = self.parent.take() {
            match self.store().trans_commit_adaptive(pt) {
                Ok(()) => {}
                Err(StoreError::NotDurable) => {
                    if tun.replicant_retry_on_not_durable {
                        outrc = Rcode::NotDurable.as_i32();
                    }
                }
                Err(StoreError::Deadlock) => return Err(BlockError::InternalRetry),
                Err(e) => return Err(map_store(e)),
            }
        }

        Ok(BlockResponse {
            rc: outrc,
            bytes,
            errstat: None,
            effects: Some(self.effects),
        })
    }

    fn not_durable_rc(&self) -> BlockError {
        if self.p.ctx.tunables.replicant_retry_on_not_durable {
            BlockError::NotDurable
        } else {
            BlockError::Internal("commit not durable".into())
        }
    }

    /// Commit the schema-change children: close-old-files first (committed
    /// only if files were actually closed), then the schema-change child.
    /// A failure here is past the point of no return.
    fn commit_sc_children(&mut self) {
        if let Some(ct) = self.sc_close.take() {
            let r = if self.sc_closed_files {
                self.store().trans_commit(ct)
            } else {
                self.store().trans_abort(ct)
            };
            r.unwrap_or_else(|e| panic!("schema close transaction failed: {e}"));
        }
        if let Some(sc) = self.sc_tran.take() {
            self.store()
                .trans_commit(sc)
                .unwrap_or_else(|e| panic!("schema change commit failed: {e}"));
        }
    }

    /// Schema-change commit ladder under pagelocks: operation child, the
    /// schema-change children, the physical envelope, then the logical
    /// envelope.
    fn commit_tranddl(&mut self) -> Result<(), BlockError> {
        if let Some(t) = self.trans.take() {
            self.store().trans_commit(t).map_err(map_store)?;
        }
        self.commit_sc_children();
        if let Some(pt) = self.parent.take() {
            self.store().trans_commit(pt).map_err(map_store)?;
        }
        if let Some(lt) = self.sc_logical.take() {
            match self.store().trans_commit_logical(lt, None) {
                Ok(()) => {}
                Err(StoreError::NotDurable) => return Err(self.not_durable_rc()),
                Err(e) => return Err(map_store(e)),
            }
        }
        Ok(())
    }

    /// Rowlocks commit: any schema-change children and the physical
    /// envelope fold into the single logical commit, which carries the
    /// blockseq entry when one is present.
    fn commit_rowlocks(
        &mut self,
        blkseq: Option<(&[u8], &[u8])>,
    ) -> Result<(), StoreError> {
        let t = self.trans.take().expect("rowlocks commit without txn");
        if self.tranddl {
            self.commit_sc_children();
            let phys = self.store().get_physical_tran(t)?;
            self.store().trans_commit(phys)?;
        }
        self.store().trans_commit_logical(t, blkseq)
    }

    /// The 2PC interleave on the success path: prepare, block for the
    /// outcome, then commit or abort. A downgrade while prepared drains the
    /// other writers and discards without releasing prepared locks.
    fn commit_distributed(
        &mut self,
        dist: &DistTxn,
        key: BlkseqKey,
        bytes: Vec<u8>,
    ) -> Result<BlockResponse, BlockError> {
        let parent = self.parent.take().expect("distributed txn without parent");
        let store = self.p.store.as_ref();
        let reg = self.p.dist.as_ref();
        let tun = &self.p.ctx.tunables;

        let (cname, ctier) = if dist.is_coordinator() {
            (dist.coordinator_dbname.as_str(), "_coordinator_local")
        } else {
            (
                dist.coordinator_dbname.as_str(),
                dist.coordinator_tier.as_str(),
            )
        };

        if let Err(e) =
            store.trans_prepare(parent, &dist.dist_txnid, cname, ctier, key.bytes())
        {
            error!(dist_txnid = %dist.dist_txnid, error = %e, "failed to prepare");
            if dist.is_coordinator() {
                reg.coordinator_failed(&dist.dist_txnid);
            } else {
                reg.participant_has_failed(
                    &dist.dist_txnid,
                    &dist.coordinator_dbname,
                    &dist.coordinator_master,
                    Rcode::NotDurable.as_i32(),
                    Rcode::BlockFailed.as_i32(),
                    "Prepare was not durable",
                );
            }
            // prepare failed to reach a majority: fail the txn everywhere,
            // then pin the abort outcome (the abort rolls back the
            // in-transaction blockseq entry under this key)
            store.trans_abort(parent).map_err(map_store)?;
            let abort_payload = dist_abort_payload()
                .pack()
                .map_err(|e| BlockError::Internal(e.to_string()))?;
            let _ = store.blkseq_insert(None, key.bytes(), &abort_payload);
            self.numerrs = 1;
            self.err.errcode = Rcode::NotDurable.as_i32();
            self.errstat = Errstat::new(Rcode::NotDurable.as_i32(), "Prepare was not durable");
            return Ok(BlockResponse {
                rc: Rcode::BlockFailed.as_i32(),
                bytes: self.pack_error_response(Rcode::NotDurable)?,
                errstat: Some(self.errstat.clone()),
                effects: None,
            });
        }

        self.p.ctx.prepared_inc();

        if !dist.is_coordinator() {
            // tell the coordinator our prepare record is durable
            reg.participant_prepared(&dist.dist_txnid);
        }

        let waitrc = if dist.is_coordinator() {
            reg.coordinator_wait(&dist.dist_txnid, true, false)
        } else {
            reg.participant_wait(
                &dist.dist_txnid,
                &dist.coordinator_dbname,
                &dist.coordinator_tier,
                &dist.coordinator_master,
            )
        };

        match waitrc {
            WaitOutcome::HasCommitted => {
                self.p.ctx.prepared_dec();
                let commit_rc = store.trans_commit_adaptive(parent);
                if dist.is_coordinator() {
                    if tun.coordinator_wait_propagate {
                        reg.coordinator_wait_propagate(&dist.dist_txnid);
                    } else {
                        reg.coordinator_resolve(&dist.dist_txnid);
                    }
                } else {
                    reg.participant_has_propagated(
                        &dist.dist_txnid,
                        &dist.coordinator_dbname,
                        &dist.coordinator_master,
                    );
                }
                let rc = match commit_rc {
                    Err(StoreError::NotDurable) if tun.replicant_retry_on_not_durable => {
                        Rcode::NotDurable.as_i32()
                    }
                    _ => Rcode::Ok.as_i32(),
                };
                Ok(BlockResponse {
                    rc,
                    bytes,
                    errstat: None,
                    effects: Some(self.effects),
                })
            }
            WaitOutcome::HasAborted { rc, outrc, errstr } => {
                self.p.ctx.prepared_dec();
                let rewritten = rewrite_rcode(rcode_or_block_failed(outrc), rc);
                self.numerrs = 1;
                self.err.errcode = rc;
                self.errstat = Errstat::new(rewritten, errstr);
                let verify_retryable = (outrc == Rcode::NotSerial.as_i32()
                    || (outrc == Rcode::BlockFailed.as_i32()
                        && rc == Rcode::Verify.as_i32()))
                    && self.can_retry();
                store.trans_abort(parent).map_err(map_store)?;
                if !verify_retryable {
                    let abort_payload = dist_abort_payload()
                        .pack()
                        .map_err(|e| BlockError::Internal(e.to_string()))?;
                    let _ = store.blkseq_insert(None, key.bytes(), &abort_payload);
                }
                Ok(BlockResponse {
                    rc: rewritten,
                    bytes: self.pack_error_response(Rcode::DistAbort)?,
                    errstat: Some(self.errstat.clone()),
                    effects: None,
                })
            }
            WaitOutcome::LockDesired => {
                // Releasing locks would let something overwrite prepared
                // state; block until every non-prepared writer has
                // resolved, then discard.
                warn!(dist_txnid = %dist.dist_txnid, "failed to commit durably, draining");
                self.p
                    .ctx
                    .drain_nonprepared_writers(|| store.abort_waiters(parent));
                let waiters = store.count_write_waiters(parent);
                assert!(
                    waiters == 0,
                    "prepared txn discarded with {waiters} write waiters"
                );
                store.trans_discard_prepared(parent).map_err(map_store)?;
                Ok(BlockResponse {
                    rc: Rcode::NotDurable.as_i32(),
                    bytes: Vec::new(),
                    errstat: Some(Errstat::new(
                        Rcode::NotDurable.as_i32(),
                        "commit outcome unknown, retry",
                    )),
                    effects: None,
                })
            }
            WaitOutcome::KeepRcode => {
                self.p.ctx.prepared_dec();
                let commit_rc = store.trans_commit_adaptive(parent);
                let rc = match commit_rc {
                    Err(StoreError::NotDurable) if tun.replicant_retry_on_not_durable => {
                        Rcode::NotDurable.as_i32()
                    }
                    _ => Rcode::Ok.as_i32(),
                };
                Ok(BlockResponse {
                    rc,
                    bytes,
                    errstat: None,
                    effects: Some(self.effects),
                })
            }
        }
    }

    fn abort_everything(&mut self) {
        let store = self.p.store.as_ref();
        if let Some(t) = self.trans.take() {
            let _ = store.trans_abort(t);
        }
        if let Some(ct) = self.sc_close.take() {
            let _ = store.trans_abort(ct);
        }
        if let Some(sc) = self.sc_tran.take() {
            let _ = store.trans_abort(sc);
        }
        if let Some(lt) = self.sc_logical.take() {
            store.backout_schema_changes(lt);
            let _ = store.trans_abort(lt);
        }
        if let Some(pt) = self.parent.take() {
            let _ = store.trans_abort(pt);
        }
    }

    /// Failure before any transaction opened; nothing to unwind beyond the
    /// blobs.
    fn reject(&mut self, e: BlockError) -> MainOutcome {
        self.blobs.free_all();
        self.set_op_error(&e);
        let rc = e.rcode();
        let bytes = self.pack_error_response(rc).unwrap_or_default();
        MainOutcome::Done(BlockResponse {
            rc: self.outrc_for(rc),
            bytes,
            errstat: Some(e.errstat()),
            effects: None,
        })
    }

    /// Unwind a failed attempt: blobs, schema-change sub-transactions in
    /// order, the data transaction; then decide between internal retry,
    /// replay, and a persisted error outcome.
    fn backout(&mut self, e: BlockError) -> MainOutcome {
        debug!(error = %e, opnum = self.opnum, "backing out");
        self.blobs.free_all();
        if self.numerrs == 0 {
            self.set_op_error(&e);
        }

        let rc = e.rcode();
        let outrc = self.outrc_for(rc);

        // distributed failures resolve the dist-txn before the data abort
        if let Some(dist) = self.dist().cloned() {
            if rc != Rcode::InternalRetry {
                let reg = self.p.dist.as_ref();
                if dist.is_coordinator() {
                    let verify_retryable = (rc == Rcode::NotSerial
                        || rc == Rcode::Verify)
                        && self.can_retry();
                    if verify_retryable {
                        if let WaitOutcome::HasAborted {
                            rc: prc,
                            outrc: poutrc,
                            ..
                        } = reg.coordinator_wait(&dist.dist_txnid, true, true)
                        {
                            let rewritten =
                                rewrite_rcode(rcode_or_block_failed(poutrc), prc);
                            self.errstat = Errstat::new(rewritten, "aborted by participant");
                        }
                    }
                    reg.coordinator_failed(&dist.dist_txnid);
                } else {
                    reg.participant_has_failed(
                        &dist.dist_txnid,
                        &dist.coordinator_dbname,
                        &dist.coordinator_master,
                        self.err.errcode,
                        outrc,
                        &self.errstat.msg,
                    );
                }
            }
        }

        self.abort_everything();

        if rc == Rcode::InternalRetry {
            // restore the request buffer bit-exactly for the next attempt
            self.st.restore(self.frame);
            if self.p.ctx.tunables.deadlock_least_writes_ever {
                *self.priority += self.p.ctx.tunables.deadlock_priority_bump;
            }
            return MainOutcome::Retry;
        }

        // persist the failure under the key so duplicate submissions see
        // the same outcome; skipped when the client can retry freely, and
        // never for bad requests or internal faults
        let persist = self.have_blkseq()
            && !matches!(rc, Rcode::BadReq | Rcode::Internal)
            && !((outrc == Rcode::NotSerial.as_i32()
                || (outrc == Rcode::BlockFailed.as_i32()
                    && self.err.errcode == Rcode::Verify.as_i32()))
                && self.can_retry());
        if persist {
            if let Some(key) = self.blkseq_key.clone() {
                match self.build_payload(outrc) {
                    Ok(payload) => {
                        match self.store().blkseq_insert(None, key.bytes(), &payload) {
                            Ok(()) | Err(StoreError::Duplicate { .. }) => {}
                            Err(e) => warn!(error = %e, "failed to persist error outcome"),
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to build error payload"),
                }
            }
        }

        let bytes = self.pack_error_response(rc).unwrap_or_default();
        MainOutcome::Done(BlockResponse {
            rc: outrc,
            bytes,
            errstat: Some(self.errstat.clone()),
            effects: None,
        })
    }
}

/// An aborted outrc that is not one of ours folds to `BlockFailed`.
fn rcode_or_block_failed(outrc: i32) -> Rcode {
    match outrc {
        x if x == Rcode::NoRecordsFound.as_i32() => Rcode::NoRecordsFound,
        x if x == Rcode::ConvertData.as_i32() => Rcode::ConvertData,
        x if x == Rcode::NullConstraint.as_i32() => Rcode::NullConstraint,
        x if x == Rcode::SqlPrepare.as_i32() => Rcode::SqlPrepare,
        x if x == Rcode::Constraint.as_i32() => Rcode::Constraint,
        x if x == Rcode::UncommittableTxn.as_i32() => Rcode::UncommittableTxn,
        x if x == Rcode::NoMaster.as_i32() => Rcode::NoMaster,
        x if x == Rcode::NotSerial.as_i32() => Rcode::NotSerial,
        x if x == Rcode::DistAbort.as_i32() => Rcode::DistAbort,
        x if x == Rcode::SchemaChange.as_i32() => Rcode::SchemaChange,
        x if x == Rcode::TranTooBig.as_i32() => Rcode::TranTooBig,
        _ => Rcode::BlockFailed,
    }
}

/// Store failures mapped onto the client-visible error families.
fn map_store(e: StoreError) -> BlockError {
    match e {
        StoreError::Duplicate { .. } => BlockError::Constraint("duplicate key".into()),
        StoreError::NotFound => BlockError::NoRecordsFound,
        StoreError::VerifyError => BlockError::Verify { opnum: 0 },
        StoreError::Deadlock => BlockError::InternalRetry,
        StoreError::NotDurable => BlockError::NotDurable,
        StoreError::Constraint(s) => BlockError::Constraint(s),
        StoreError::Uncommittable(s) => BlockError::UncommittableTxn(s),
        StoreError::UnknownTable(t) => BlockError::BadRequest(format!("unknown table {t}")),
        StoreError::UnknownQueue(q) => BlockError::BadRequest(format!("unknown queue {q}")),
        StoreError::BadTran => BlockError::Internal("bad transaction handle".into()),
        StoreError::Internal(s) => BlockError::Internal(s),
    }
}
