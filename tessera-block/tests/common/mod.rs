//! Shared fixtures: a frame builder that speaks the block wire format and
//! an environment wrapping the processor around the in-memory engine.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_block::{
    BlockProcessor, Cluster, ProcessorContext, SqlEngine, SqlWriteStream, Tunables,
};
use tessera_dist::DistTxnRegistry;
use tessera_errors::{BlockError, BlockResult};
use tessera_srs::TranMode;
use tessera_store::mem::MemStore;
use tessera_store::TableSchema;
use tessera_wire::{BlockOpcode, Endian, ReqType, Writer, REQ_HDR_LEN};

pub const BODY_START: usize = REQ_HDR_LEN + 8;

/// Op-list bytes with `next` offsets computed for a frame whose body starts
/// at `base`.
pub fn build_ops_body(ops: &[(BlockOpcode, Vec<u8>)], base: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut off = base;
    for (code, payload) in ops {
        assert_eq!(payload.len() % 4, 0, "payload must be word aligned");
        let op_len = 8 + payload.len();
        let next_word = (off + op_len) / 4 + 1;
        let mut w = Writer::new(&mut body, Endian::Big, 1 << 20);
        w.put_u16(*code as u16).unwrap();
        w.put_u16(0).unwrap();
        w.put_u32(next_word as u32).unwrap();
        w.put_bytes(payload).unwrap();
        off += op_len;
    }
    body
}

/// Builds a short-block frame the way the proxy would.
#[derive(Default)]
pub struct BatchBuilder {
    flags: u32,
    ops: Vec<(BlockOpcode, Vec<u8>)>,
}

impl BatchBuilder {
    pub fn new() -> BatchBuilder {
        BatchBuilder::default()
    }

    pub fn flags(mut self, flags: u32) -> BatchBuilder {
        self.flags = flags;
        self
    }

    pub fn op(mut self, code: BlockOpcode, payload: Vec<u8>) -> BatchBuilder {
        self.ops.push((code, payload));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let body = build_ops_body(&self.ops, BODY_START);
        let total = BODY_START + body.len();
        let mut frame = Vec::with_capacity(total);
        let mut w = Writer::new(&mut frame, Endian::Big, 1 << 20);
        w.put_u32(ReqType::Block.as_u32()).unwrap();
        w.put_u32((total / 4) as u32).unwrap();
        w.put_u32(self.flags).unwrap();
        w.put_u32(0).unwrap();
        w.put_u32(self.ops.len() as u32).unwrap();
        w.put_u32((total / 4) as u32 + 1).unwrap();
        w.put_bytes(&body).unwrap();
        frame
    }
}

/// A long-block frame carrying one piece of an op body.
pub fn long_frame(
    tranid: u64,
    curpiece: u32,
    num_pieces: u32,
    docommit: bool,
    num_reqs: u32,
    body: &[u8],
) -> Vec<u8> {
    let body_start = REQ_HDR_LEN + tessera_wire::LONG_HDR_LEN;
    let total = body_start + body.len();
    let mut frame = Vec::with_capacity(total);
    let mut w = Writer::new(&mut frame, Endian::Big, 1 << 20);
    w.put_u32(ReqType::LongBlock.as_u32()).unwrap();
    w.put_u32((total / 4) as u32).unwrap();
    w.put_u32(0).unwrap();
    w.put_u32(0).unwrap();
    w.put_u64(tranid).unwrap();
    w.put_u32(curpiece).unwrap();
    w.put_u32(num_pieces).unwrap();
    w.put_u32(docommit as u32).unwrap();
    w.put_u32(num_reqs).unwrap();
    // the long header's end offset is 0-based
    w.put_u32((total / 4) as u32).unwrap();
    w.put_bytes(body).unwrap();
    frame
}

// --- op payload builders ---

fn with_writer(f: impl FnOnce(&mut Writer<'_>)) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, Endian::Big, 1 << 20);
    f(&mut w);
    buf
}

pub fn usekl(table: &str) -> Vec<u8> {
    with_writer(|w| w.put_lpstring(table.as_bytes()).unwrap())
}

pub fn use_db(dbnum: u32) -> Vec<u8> {
    with_writer(|w| w.put_u32(dbnum).unwrap())
}

pub fn seqv2(key: &[u8]) -> Vec<u8> {
    with_writer(|w| w.put_lpstring(key).unwrap())
}

pub fn seq(a: u32, b: u32, c: u32) -> Vec<u8> {
    with_writer(|w| {
        w.put_u32(a).unwrap();
        w.put_u32(b).unwrap();
        w.put_u32(c).unwrap();
    })
}

pub fn addkl(tag: &str, record: &[u8]) -> Vec<u8> {
    with_writer(|w| {
        w.put_lpstring(tag.as_bytes()).unwrap();
        w.put_lpstring(record).unwrap();
    })
}

pub fn addsl(record: &[u8]) -> Vec<u8> {
    with_writer(|w| w.put_lpstring(record).unwrap())
}

pub fn update(genid: u64, verify: &[u8], record: &[u8]) -> Vec<u8> {
    with_writer(|w| {
        w.put_u64(genid).unwrap();
        w.put_lpstring(verify).unwrap();
        w.put_lpstring(record).unwrap();
    })
}

pub fn delkl(genid: u64) -> Vec<u8> {
    with_writer(|w| w.put_u64(genid).unwrap())
}

pub fn qblob(blobno: u32, length: u32, frag_offset: u32, frag: &[u8]) -> Vec<u8> {
    with_writer(|w| {
        w.put_u32(blobno).unwrap();
        w.put_u32(length).unwrap();
        w.put_u32(frag_offset).unwrap();
        w.put_lpstring(frag).unwrap();
    })
}

pub fn qadd(queue: &str, data: &[u8]) -> Vec<u8> {
    with_writer(|w| {
        w.put_lpstring(queue.as_bytes()).unwrap();
        w.put_lpstring(data).unwrap();
    })
}

pub fn qconsume(queue: &str, consumer: u32) -> Vec<u8> {
    with_writer(|w| {
        w.put_lpstring(queue.as_bytes()).unwrap();
        w.put_u32(consumer).unwrap();
    })
}

pub fn sql_text(sql: &str) -> Vec<u8> {
    with_writer(|w| w.put_lpstring(sql.as_bytes()).unwrap())
}

pub fn rngdelkl(start: &[u8], end: &[u8], max: u32) -> Vec<u8> {
    with_writer(|w| {
        w.put_lpstring(start).unwrap();
        w.put_lpstring(end).unwrap();
        w.put_u32(max).unwrap();
    })
}

pub fn delolder(epoch: u32, count: u32) -> Vec<u8> {
    with_writer(|w| {
        w.put_u32(epoch).unwrap();
        w.put_u32(count).unwrap();
    })
}

pub fn uptbl(nrecs: u32, genid: u64) -> Vec<u8> {
    with_writer(|w| {
        w.put_u32(nrecs).unwrap();
        w.put_u64(genid).unwrap();
    })
}

pub fn tz(name: &str) -> Vec<u8> {
    with_writer(|w| w.put_lpstring(name.as_bytes()).unwrap())
}

pub fn pragma(kind: u32, payload: &[u8]) -> Vec<u8> {
    with_writer(|w| {
        w.put_u32(kind).unwrap();
        w.put_lpstring(payload).unwrap();
    })
}

pub fn modnum(v: u32) -> Vec<u8> {
    with_writer(|w| w.put_u32(v).unwrap())
}

pub fn scsmsk(mask: u64) -> Vec<u8> {
    with_writer(|w| w.put_u64(mask).unwrap())
}

pub fn dbglog_cookie(cookie: u64) -> Vec<u8> {
    with_writer(|w| w.put_u64(cookie).unwrap())
}

pub fn setflags(flags: u32) -> Vec<u8> {
    with_writer(|w| w.put_u32(flags).unwrap())
}

// --- fixtures ---

/// SQL engine whose behavior is a lookup table from statement text to
/// write stream.
#[derive(Default)]
pub struct ScriptedSql {
    scripts: Mutex<HashMap<String, SqlWriteStream>>,
}

impl ScriptedSql {
    pub fn new() -> ScriptedSql {
        ScriptedSql::default()
    }

    pub fn script(&self, sql: &str, stream: SqlWriteStream) {
        self.scripts.lock().insert(sql.to_owned(), stream);
    }
}

impl SqlEngine for ScriptedSql {
    fn execute(&self, sql: &str, _mode: TranMode) -> BlockResult<SqlWriteStream> {
        self.scripts
            .lock()
            .get(sql)
            .cloned()
            .ok_or_else(|| BlockError::SqlPrepare(format!("no such statement: {sql}")))
    }
}

/// Cluster view for routing tests: configurable mastership, captures
/// forwarded frames.
pub struct FakeCluster {
    pub is_master: bool,
    pub forwarded: Mutex<Vec<Vec<u8>>>,
}

impl Cluster for FakeCluster {
    fn is_master(&self) -> bool {
        self.is_master
    }
    fn master(&self) -> String {
        "other-node".into()
    }
    fn send_to_master(&self, _host: &str, frame: &[u8]) -> Result<(), String> {
        self.forwarded.lock().push(frame.to_vec());
        Ok(())
    }
}

pub struct TestEnv {
    pub store: Arc<MemStore>,
    pub ctx: Arc<ProcessorContext>,
    pub registry: Arc<DistTxnRegistry>,
    pub sql: Arc<ScriptedSql>,
    pub processor: Arc<BlockProcessor>,
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Standard environment: master node, in-memory store with `t1` (4-byte
/// keys), a `parent`/`child` FK pair, and queue `q1`.
pub fn env_with(tunables: Tunables) -> TestEnv {
    init_tracing();
    let store = Arc::new(MemStore::new());
    store.create_table(TableSchema::new("t1", 101, 4));
    store.create_table(TableSchema::new("parent", 102, 4));
    store.create_table(TableSchema::new("child", 103, 4).with_parent("parent"));
    store.create_queue("q1");

    let ctx = Arc::new(ProcessorContext::new(tunables));
    let registry = Arc::new(DistTxnRegistry::new());
    let sql = Arc::new(ScriptedSql::new());
    let cluster = Arc::new(tessera_block::SoloCluster);
    let processor = Arc::new(BlockProcessor::new(
        ctx.clone(),
        store.clone(),
        cluster,
        sql.clone(),
        registry.clone(),
    ));
    TestEnv {
        store,
        ctx,
        registry,
        sql,
        processor,
    }
}

pub fn env() -> TestEnv {
    env_with(Tunables::default())
}
