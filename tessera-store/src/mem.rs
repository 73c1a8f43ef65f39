//! In-memory storage engine implementing the [`DataStore`] seam.
//!
//! State is applied eagerly under one store mutex with a per-transaction
//! undo log; abort replays the undo entries in reverse, commit of a child
//! moves its undo onto the parent, and commit of a root discards it. That
//! gives the processor the same visibility rules the real engine has
//! (a transaction sees its own writes immediately) without modelling page
//! latching. Failpoints stand in for the failures the real engine produces
//! under contention: deadlock victims and non-durable commits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use fail::fail_point;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    DataStore, Genid, ReadSet, StoreError, StoreResult, TableSchema, TranId, TranKind,
};

#[derive(Clone, Debug)]
struct Row {
    data: Vec<u8>,
    epoch: u32,
}

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    rows: IndexMap<Genid, Row>,
    index: HashMap<Vec<u8>, Genid, ahash::RandomState>,
}

impl Table {
    fn key_of<'a>(&self, record: &'a [u8]) -> Option<&'a [u8]> {
        if self.schema.key_len == 0 || record.len() < self.schema.key_len {
            None
        } else {
            Some(&record[..self.schema.key_len])
        }
    }
}

#[derive(Debug)]
enum Undo {
    AddRow {
        table: String,
        genid: Genid,
        key: Option<Vec<u8>>,
    },
    AddIndex {
        table: String,
        key: Vec<u8>,
    },
    DelRow {
        table: String,
        genid: Genid,
        row: Row,
        key: Option<Vec<u8>>,
    },
    UpdRow {
        table: String,
        old_genid: Genid,
        new_genid: Genid,
        old_row: Row,
        old_key: Option<Vec<u8>>,
        new_key: Option<Vec<u8>>,
    },
    QueueAdd {
        queue: String,
    },
    QueueConsume {
        queue: String,
        data: Vec<u8>,
    },
    Schema {
        table: String,
    },
    Blkseq {
        key: Vec<u8>,
    },
    LogEntry {
        idx: usize,
    },
}

#[derive(Debug, Default)]
struct Txn {
    parent: Option<u64>,
    physical_child: Option<u64>,
    undo: Vec<Undo>,
    deferred_ix: Vec<(String, Vec<u8>, Genid)>,
    added_keys: Vec<(String, Vec<u8>)>,
    deleted_keys: Vec<(String, Vec<u8>)>,
    sc_tables: Vec<String>,
    prepared: Option<String>,
}

#[derive(Debug)]
struct LogEntry {
    root: u64,
    table: String,
    key: Vec<u8>,
    committed: bool,
    aborted: bool,
}

#[derive(Default)]
struct Inner {
    tables: IndexMap<String, Table>,
    queues: HashMap<String, VecDeque<Vec<u8>>, ahash::RandomState>,
    blkseq: HashMap<Vec<u8>, Vec<u8>, ahash::RandomState>,
    txns: HashMap<u64, Txn, ahash::RandomState>,
    next_tran: u64,
    next_genid: u64,
    commit_log: Vec<LogEntry>,
    write_waiters: HashMap<u64, usize, ahash::RandomState>,
}

/// The in-memory engine. Clone-free; share it behind an `Arc`.
pub struct MemStore {
    inner: Mutex<Inner>,
    lock_desired: AtomicBool,
    clock: AtomicU32,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            inner: Mutex::new(Inner {
                next_tran: 1,
                next_genid: 1,
                ..Default::default()
            }),
            lock_desired: AtomicBool::new(false),
            clock: AtomicU32::new(1),
        }
    }

    pub fn create_table(&self, schema: TableSchema) {
        let mut g = self.inner.lock();
        g.tables.insert(
            schema.name.clone(),
            Table {
                schema,
                rows: IndexMap::new(),
                index: HashMap::default(),
            },
        );
    }

    pub fn create_queue(&self, name: impl Into<String>) {
        self.inner.lock().queues.insert(name.into(), VecDeque::new());
    }

    /// Replication layer wants this node to downgrade; gates new block
    /// threads and flips 2PC waits to `LockDesired`.
    pub fn set_lock_desired(&self, v: bool) {
        self.lock_desired.store(v, Ordering::SeqCst);
    }

    /// Advance the store's epoch clock (used by `delete_older_than` tests).
    pub fn advance_clock(&self, by: u32) {
        self.clock.fetch_add(by, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn schema_version(&self, table: &str) -> Option<u32> {
        self.inner.lock().tables.get(table).map(|t| t.schema.version)
    }

    /// Test hook: drop a blkseq entry out from under a duplicate detection,
    /// the "deleted under us" path.
    pub fn blkseq_remove(&self, key: &[u8]) {
        self.inner.lock().blkseq.remove(key);
    }

    /// Test hook: pretend `n` writers are blocked on this transaction's
    /// locks.
    pub fn set_write_waiters(&self, tran: TranId, n: usize) {
        self.inner.lock().write_waiters.insert(tran.0, n);
    }

    fn alloc_tran(g: &mut Inner, parent: Option<u64>, _kind: TranKind) -> u64 {
        let id = g.next_tran;
        g.next_tran += 1;
        g.txns.insert(
            id,
            Txn {
                parent,
                ..Default::default()
            },
        );
        id
    }

    fn root_of(g: &Inner, mut id: u64) -> u64 {
        while let Some(t) = g.txns.get(&id) {
            match t.parent {
                Some(p) => id = p,
                None => break,
            }
        }
        id
    }

    fn apply_undo(g: &mut Inner, undo: Undo) {
        match undo {
            Undo::AddRow { table, genid, key } => {
                if let Some(t) = g.tables.get_mut(&table) {
                    t.rows.shift_remove(&genid);
                    if let Some(k) = key {
                        t.index.remove(&k);
                    }
                }
            }
            Undo::AddIndex { table, key } => {
                if let Some(t) = g.tables.get_mut(&table) {
                    t.index.remove(&key);
                }
            }
            Undo::DelRow {
                table,
                genid,
                row,
                key,
            } => {
                if let Some(t) = g.tables.get_mut(&table) {
                    if let Some(k) = key {
                        t.index.insert(k, genid);
                    }
                    t.rows.insert(genid, row);
                }
            }
            Undo::UpdRow {
                table,
                old_genid,
                new_genid,
                old_row,
                old_key,
                new_key,
            } => {
                if let Some(t) = g.tables.get_mut(&table) {
                    t.rows.shift_remove(&new_genid);
                    if let Some(k) = new_key {
                        t.index.remove(&k);
                    }
                    if let Some(k) = old_key {
                        t.index.insert(k, old_genid);
                    }
                    t.rows.insert(old_genid, old_row);
                }
            }
            Undo::QueueAdd { queue } => {
                if let Some(q) = g.queues.get_mut(&queue) {
                    q.pop_back();
                }
            }
            Undo::QueueConsume { queue, data } => {
                if let Some(q) = g.queues.get_mut(&queue) {
                    q.push_front(data);
                }
            }
            Undo::Schema { table } => {
                if let Some(t) = g.tables.get_mut(&table) {
                    t.schema.version -= 1;
                }
            }
            Undo::Blkseq { key } => {
                g.blkseq.remove(&key);
            }
            Undo::LogEntry { idx } => {
                if let Some(e) = g.commit_log.get_mut(idx) {
                    e.aborted = true;
                }
            }
        }
    }

    fn abort_tree(g: &mut Inner, id: u64) {
        // abort children first, then the node itself, newest effects first
        let children: Vec<u64> = g
            .txns
            .iter()
            .filter(|(_, t)| t.parent == Some(id))
            .map(|(k, _)| *k)
            .collect();
        for c in children {
            Self::abort_tree(g, c);
        }
        if let Some(mut t) = g.txns.remove(&id) {
            while let Some(u) = t.undo.pop() {
                Self::apply_undo(g, u);
            }
        }
        g.write_waiters.remove(&id);
    }

    fn finalize_root(g: &mut Inner, id: u64) {
        // orphaned children of a committing root are a processor bug
        let children: Vec<u64> = g
            .txns
            .iter()
            .filter(|(_, t)| t.parent == Some(id))
            .map(|(k, _)| *k)
            .collect();
        assert!(
            children.is_empty(),
            "root transaction committed with live children"
        );
        g.txns.remove(&id);
        g.write_waiters.remove(&id);
        for e in g.commit_log.iter_mut() {
            if e.root == id && !e.aborted {
                e.committed = true;
            }
        }
    }

    fn merge_into_parent(g: &mut Inner, id: u64) -> StoreResult<()> {
        let t = g.txns.remove(&id).ok_or(StoreError::BadTran)?;
        let parent = t.parent.ok_or(StoreError::BadTran)?;
        let p = g.txns.get_mut(&parent).ok_or(StoreError::BadTran)?;
        p.undo.extend(t.undo);
        p.deferred_ix.extend(t.deferred_ix);
        p.added_keys.extend(t.added_keys);
        p.deleted_keys.extend(t.deleted_keys);
        p.sc_tables.extend(t.sc_tables);
        Ok(())
    }

    fn log_write(g: &mut Inner, root: u64, table: &str, key: &[u8]) -> usize {
        g.commit_log.push(LogEntry {
            root,
            table: table.to_owned(),
            key: key.to_vec(),
            committed: false,
            aborted: false,
        });
        g.commit_log.len() - 1
    }
}

impl DataStore for MemStore {
    fn trans_start(&self, parent: Option<TranId>) -> StoreResult<TranId> {
        let mut g = self.inner.lock();
        if let Some(p) = parent {
            if !g.txns.contains_key(&p.0) {
                return Err(StoreError::BadTran);
            }
        }
        Ok(TranId(Self::alloc_tran(
            &mut g,
            parent.map(|p| p.0),
            TranKind::Physical,
        )))
    }

    fn trans_start_logical(&self) -> StoreResult<TranId> {
        let mut g = self.inner.lock();
        Ok(TranId(Self::alloc_tran(&mut g, None, TranKind::Logical)))
    }

    fn trans_start_sc(&self, parent: TranId) -> StoreResult<TranId> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&parent.0) {
            return Err(StoreError::BadTran);
        }
        Ok(TranId(Self::alloc_tran(
            &mut g,
            Some(parent.0),
            TranKind::SchemaChange,
        )))
    }

    fn trans_start_logical_sc(&self) -> StoreResult<TranId> {
        let mut g = self.inner.lock();
        let logical = Self::alloc_tran(&mut g, None, TranKind::Logical);
        let phys = Self::alloc_tran(&mut g, Some(logical), TranKind::Physical);
        g.txns.get_mut(&logical).unwrap().physical_child = Some(phys);
        Ok(TranId(logical))
    }

    fn get_physical_tran(&self, logical: TranId) -> StoreResult<TranId> {
        let g = self.inner.lock();
        g.txns
            .get(&logical.0)
            .and_then(|t| t.physical_child)
            .map(TranId)
            .ok_or(StoreError::BadTran)
    }

    fn trans_commit(&self, tran: TranId) -> StoreResult<()> {
        let mut g = self.inner.lock();
        let t = g.txns.get(&tran.0).ok_or(StoreError::BadTran)?;
        if t.parent.is_some() {
            return Self::merge_into_parent(&mut g, tran.0);
        }
        fail_point!("memstore.commit.notdurable", |_| {
            Self::finalize_root(&mut g, tran.0);
            Err(StoreError::NotDurable)
        });
        Self::finalize_root(&mut g, tran.0);
        Ok(())
    }

    fn trans_commit_logical(
        &self,
        tran: TranId,
        blkseq: Option<(&[u8], &[u8])>,
    ) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        if let Some((key, payload)) = blkseq {
            if let Some(existing) = g.blkseq.get(key) {
                let existing = existing.clone();
                Self::abort_tree(&mut g, tran.0);
                return Err(StoreError::Duplicate {
                    existing: Some(existing),
                });
            }
            g.blkseq.insert(key.to_vec(), payload.to_vec());
        }
        fail_point!("memstore.commit.notdurable", |_| {
            Self::finalize_root(&mut g, tran.0);
            Err(StoreError::NotDurable)
        });
        Self::finalize_root(&mut g, tran.0);
        Ok(())
    }

    fn trans_abort(&self, tran: TranId) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        Self::abort_tree(&mut g, tran.0);
        Ok(())
    }

    fn trans_abort_logical(
        &self,
        tran: TranId,
        blkseq: Option<(&[u8], &[u8])>,
    ) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        Self::abort_tree(&mut g, tran.0);
        if let Some((key, payload)) = blkseq {
            g.blkseq.entry(key.to_vec()).or_insert_with(|| payload.to_vec());
        }
        Ok(())
    }

    fn trans_prepare(
        &self,
        tran: TranId,
        dist_txnid: &str,
        coordinator_name: &str,
        coordinator_tier: &str,
        _blkseq_key: &[u8],
    ) -> StoreResult<()> {
        fail_point!("memstore.prepare.notdurable", |_| {
            Err(StoreError::NotDurable)
        });
        let mut g = self.inner.lock();
        let t = g.txns.get_mut(&tran.0).ok_or(StoreError::BadTran)?;
        debug!(dist_txnid, coordinator_name, coordinator_tier, "prepared");
        t.prepared = Some(dist_txnid.to_owned());
        Ok(())
    }

    fn trans_discard_prepared(&self, tran: TranId) -> StoreResult<()> {
        let mut g = self.inner.lock();
        let t = g.txns.get(&tran.0).ok_or(StoreError::BadTran)?;
        assert!(t.prepared.is_some(), "discard of a non-prepared transaction");
        Self::abort_tree(&mut g, tran.0);
        Ok(())
    }

    fn count_write_waiters(&self, tran: TranId) -> usize {
        *self.inner.lock().write_waiters.get(&tran.0).unwrap_or(&0)
    }

    fn abort_waiters(&self, tran: TranId) {
        self.inner.lock().write_waiters.remove(&tran.0);
    }

    fn lock_desired(&self) -> bool {
        self.lock_desired.load(Ordering::SeqCst)
    }

    fn add_record(
        &self,
        tran: TranId,
        table: &str,
        record: &[u8],
        defer_index: bool,
    ) -> StoreResult<Genid> {
        fail_point!("memstore.add.deadlock", |_| Err(StoreError::Deadlock));
        let mut g = self.inner.lock();
        let g = &mut *g;
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let root = Self::root_of(g, tran.0);
        let epoch = self.clock.load(Ordering::SeqCst);
        let t = g
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;

        let key = t.key_of(record).map(<[u8]>::to_vec);
        if let Some(ref k) = key {
            if !defer_index && t.index.contains_key(k) {
                return Err(StoreError::Duplicate { existing: None });
            }
        }

        let genid = Genid(g.next_genid);
        g.next_genid += 1;
        t.rows.insert(
            genid,
            Row {
                data: record.to_vec(),
                epoch,
            },
        );
        let indexed_key = if defer_index { None } else { key.clone() };
        if let Some(ref k) = indexed_key {
            t.index.insert(k.clone(), genid);
        }

        let table_name = t.schema.name.clone();
        let log_idx = key
            .as_ref()
            .map(|k| Self::log_write(g, root, &table_name, k));

        let txn = g.txns.get_mut(&tran.0).unwrap();
        txn.undo.push(Undo::AddRow {
            table: table_name.clone(),
            genid,
            key: indexed_key,
        });
        if let Some(idx) = log_idx {
            txn.undo.push(Undo::LogEntry { idx });
        }
        if let Some(k) = key {
            if defer_index {
                txn.deferred_ix.push((table_name.clone(), k.clone(), genid));
            }
            txn.added_keys.push((table_name, k));
        }
        Ok(genid)
    }

    fn del_record_by_genid(&self, tran: TranId, table: &str, genid: Genid) -> StoreResult<()> {
        let mut g = self.inner.lock();
        let g = &mut *g;
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let root = Self::root_of(g, tran.0);
        let t = g
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
        let row = t.rows.shift_remove(&genid).ok_or(StoreError::NotFound)?;
        let key = t.key_of(&row.data).map(<[u8]>::to_vec);
        if let Some(ref k) = key {
            t.index.remove(k);
        }
        let table_name = t.schema.name.clone();
        let log_idx = key
            .as_ref()
            .map(|k| Self::log_write(g, root, &table_name, k));
        let txn = g.txns.get_mut(&tran.0).unwrap();
        txn.undo.push(Undo::DelRow {
            table: table_name.clone(),
            genid,
            row,
            key: key.clone(),
        });
        if let Some(idx) = log_idx {
            txn.undo.push(Undo::LogEntry { idx });
        }
        if let Some(k) = key {
            txn.deleted_keys.push((table_name, k));
        }
        Ok(())
    }

    fn del_record_by_key(&self, tran: TranId, table: &str, key: &[u8]) -> StoreResult<Genid> {
        let genid = {
            let g = self.inner.lock();
            let t = g
                .tables
                .get(table)
                .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
            *t.index.get(key).ok_or(StoreError::NotFound)?
        };
        self.del_record_by_genid(tran, table, genid)?;
        Ok(genid)
    }

    fn upd_record(
        &self,
        tran: TranId,
        table: &str,
        genid: Option<Genid>,
        key: Option<&[u8]>,
        verify: Option<&[u8]>,
        record: &[u8],
    ) -> StoreResult<Genid> {
        let mut g = self.inner.lock();
        let g = &mut *g;
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let root = Self::root_of(g, tran.0);
        let epoch = self.clock.load(Ordering::SeqCst);
        let t = g
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;

        let old_genid = match (genid, key) {
            (Some(gid), _) => gid,
            (None, Some(k)) => *t.index.get(k).ok_or(StoreError::NotFound)?,
            (None, None) => return Err(StoreError::Internal("update without target".into())),
        };
        let old_row = t.rows.get(&old_genid).ok_or(StoreError::VerifyError)?.clone();
        if let Some(v) = verify {
            if old_row.data != v {
                return Err(StoreError::VerifyError);
            }
        }

        let old_key = t.key_of(&old_row.data).map(<[u8]>::to_vec);
        let new_key = t.key_of(record).map(<[u8]>::to_vec);
        if let (Some(ref nk), Some(ref ok)) = (&new_key, &old_key) {
            if nk != ok && t.index.contains_key(nk.as_slice()) {
                return Err(StoreError::Duplicate { existing: None });
            }
        }

        let new_genid = Genid(g.next_genid);
        g.next_genid += 1;
        t.rows.shift_remove(&old_genid);
        if let Some(ref k) = old_key {
            t.index.remove(k);
        }
        t.rows.insert(
            new_genid,
            Row {
                data: record.to_vec(),
                epoch,
            },
        );
        if let Some(ref k) = new_key {
            t.index.insert(k.clone(), new_genid);
        }

        let table_name = t.schema.name.clone();
        let log_idx = new_key
            .as_ref()
            .or(old_key.as_ref())
            .map(|k| Self::log_write(g, root, &table_name, k));
        let txn = g.txns.get_mut(&tran.0).unwrap();
        txn.undo.push(Undo::UpdRow {
            table: table_name,
            old_genid,
            new_genid,
            old_row,
            old_key,
            new_key,
        });
        if let Some(idx) = log_idx {
            txn.undo.push(Undo::LogEntry { idx });
        }
        Ok(new_genid)
    }

    fn range_delete(
        &self,
        tran: TranId,
        table: &str,
        start_key: &[u8],
        end_key: &[u8],
        max: usize,
    ) -> StoreResult<usize> {
        let victims: Vec<Genid> = {
            let g = self.inner.lock();
            let t = g
                .tables
                .get(table)
                .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
            let mut keys: Vec<&Vec<u8>> = t
                .index
                .keys()
                .filter(|k| k.as_slice() >= start_key && k.as_slice() < end_key)
                .collect();
            keys.sort();
            keys.into_iter()
                .take(max)
                .map(|k| t.index[k])
                .collect()
        };
        for genid in &victims {
            self.del_record_by_genid(tran, table, *genid)?;
        }
        Ok(victims.len())
    }

    fn upgrade_records(
        &self,
        tran: TranId,
        table: &str,
        genid: Genid,
        nrecs: usize,
    ) -> StoreResult<usize> {
        let g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let t = g
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
        // records are schema-opaque blobs here: upgrading is a walk that
        // counts what would be rewritten
        Ok(t.rows.keys().filter(|g| **g >= genid).take(nrecs).count())
    }

    fn delete_older_than(
        &self,
        tran: TranId,
        table: &str,
        epoch: u32,
        max: usize,
    ) -> StoreResult<usize> {
        let victims: Vec<Genid> = {
            let g = self.inner.lock();
            let t = g
                .tables
                .get(table)
                .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
            t.rows
                .iter()
                .filter(|(_, r)| r.epoch < epoch)
                .take(max)
                .map(|(g, _)| *g)
                .collect()
        };
        for genid in &victims {
            self.del_record_by_genid(tran, table, *genid)?;
        }
        Ok(victims.len())
    }

    fn queue_add(&self, tran: TranId, queue: &str, data: &[u8]) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let q = g
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::UnknownQueue(queue.to_owned()))?;
        q.push_back(data.to_vec());
        g.txns
            .get_mut(&tran.0)
            .unwrap()
            .undo
            .push(Undo::QueueAdd {
                queue: queue.to_owned(),
            });
        Ok(())
    }

    fn queue_consume(&self, tran: TranId, queue: &str, _consumer: u32) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let q = g
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::UnknownQueue(queue.to_owned()))?;
        let data = q.pop_front().ok_or(StoreError::NotFound)?;
        g.txns
            .get_mut(&tran.0)
            .unwrap()
            .undo
            .push(Undo::QueueConsume {
                queue: queue.to_owned(),
                data,
            });
        Ok(())
    }

    fn schema_change(&self, tran: TranId, table: &str) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if !g.txns.contains_key(&tran.0) {
            return Err(StoreError::BadTran);
        }
        let t = g
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
        t.schema.version += 1;
        let txn = g.txns.get_mut(&tran.0).unwrap();
        txn.undo.push(Undo::Schema {
            table: table.to_owned(),
        });
        txn.sc_tables.push(table.to_owned());
        Ok(())
    }

    fn backout_schema_changes(&self, tran: TranId) {
        let mut g = self.inner.lock();
        let tables = g
            .txns
            .get_mut(&tran.0)
            .map(|t| std::mem::take(&mut t.sc_tables))
            .unwrap_or_default();
        for name in tables {
            if let Some(t) = g.tables.get_mut(&name) {
                t.schema.version -= 1;
            }
            if let Some(txn) = g.txns.get_mut(&tran.0) {
                // the schema undo entry has been consumed by the backout
                txn.undo
                    .retain(|u| !matches!(u, Undo::Schema { table } if *table == name));
            }
        }
    }

    fn apply_deferred_index_adds(&self, tran: TranId) -> StoreResult<()> {
        let mut g = self.inner.lock();
        let g = &mut *g;
        let deferred = g
            .txns
            .get_mut(&tran.0)
            .ok_or(StoreError::BadTran)?
            .deferred_ix
            .drain(..)
            .collect::<Vec<_>>();
        for (table, key, genid) in deferred {
            let t = g
                .tables
                .get_mut(&table)
                .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
            if let Some(existing) = t.index.get(&key) {
                if *existing != genid {
                    return Err(StoreError::Uncommittable(table));
                }
                continue;
            }
            t.index.insert(key.clone(), genid);
            g.txns
                .get_mut(&tran.0)
                .unwrap()
                .undo
                .push(Undo::AddIndex { table, key });
        }
        Ok(())
    }

    fn verify_add_constraints(&self, tran: TranId) -> StoreResult<()> {
        let g = self.inner.lock();
        let txn = g.txns.get(&tran.0).ok_or(StoreError::BadTran)?;
        for (table, key) in &txn.added_keys {
            let t = match g.tables.get(table) {
                Some(t) => t,
                None => continue,
            };
            if let Some(parent) = &t.schema.parent {
                let p = g
                    .tables
                    .get(parent)
                    .ok_or_else(|| StoreError::UnknownTable(parent.clone()))?;
                let want = &key[..p.schema.key_len.min(key.len())];
                if !p.index.contains_key(want) {
                    return Err(StoreError::Constraint(format!(
                        "{table} references missing {parent} key"
                    )));
                }
            }
        }
        Ok(())
    }

    fn verify_del_constraints(&self, tran: TranId) -> StoreResult<()> {
        let g = self.inner.lock();
        let txn = g.txns.get(&tran.0).ok_or(StoreError::BadTran)?;
        for (table, key) in &txn.deleted_keys {
            for child in g.tables.values() {
                if child.schema.parent.as_deref() != Some(table.as_str()) {
                    continue;
                }
                let still_referenced = child
                    .index
                    .keys()
                    .any(|k| k.starts_with(&key[..key.len().min(k.len())]));
                if still_referenced {
                    return Err(StoreError::Constraint(format!(
                        "{} still references deleted {table} key",
                        child.schema.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn blkseq_insert(
        &self,
        tran: Option<TranId>,
        key: &[u8],
        payload: &[u8],
    ) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if let Some(existing) = g.blkseq.get(key) {
            return Err(StoreError::Duplicate {
                existing: Some(existing.clone()),
            });
        }
        g.blkseq.insert(key.to_vec(), payload.to_vec());
        if let Some(t) = tran {
            g.txns
                .get_mut(&t.0)
                .ok_or(StoreError::BadTran)?
                .undo
                .push(Undo::Blkseq { key: key.to_vec() });
        }
        Ok(())
    }

    fn blkseq_find(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().blkseq.get(key).cloned()
    }

    fn commit_seqno(&self) -> u64 {
        self.inner.lock().commit_log.len() as u64
    }

    fn serial_check(&self, readset: &ReadSet, include_inflight: bool) -> bool {
        let g = self.inner.lock();
        for e in g.commit_log.iter().skip(readset.high_water as usize) {
            if e.aborted || (!e.committed && !include_inflight) {
                continue;
            }
            for (table, lo, hi) in &readset.ranges {
                if e.table == *table && e.key.as_slice() >= lo.as_slice() && e.key.as_slice() <= hi.as_slice() {
                    return true;
                }
            }
        }
        false
    }

    fn table_by_dbnum(&self, dbnum: u32) -> Option<String> {
        self.inner
            .lock()
            .tables
            .values()
            .find(|t| t.schema.dbnum == dbnum)
            .map(|t| t.schema.name.clone())
    }

    fn table_exists(&self, name: &str) -> bool {
        self.inner.lock().tables.contains_key(name)
    }

    fn table_has_constraints(&self, name: &str) -> bool {
        self.inner
            .lock()
            .tables
            .get(name)
            .map(|t| t.schema.has_constraints())
            .unwrap_or(false)
    }

    fn find_by_key(&self, _tran: TranId, table: &str, key: &[u8]) -> StoreResult<(Genid, Vec<u8>)> {
        let g = self.inner.lock();
        let t = g
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_owned()))?;
        let genid = *t.index.get(key).ok_or(StoreError::NotFound)?;
        let row = t.rows.get(&genid).ok_or(StoreError::NotFound)?;
        Ok((genid, row.data.clone()))
    }
}
