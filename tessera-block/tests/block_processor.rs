//! End-to-end coverage of the block processor against the in-memory
//! engine: tagged writes, blockseq idempotence, bounds enforcement, blobs,
//! queues, constraints and long transactions.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tessera_block::{BlockProcessor, Origin, ProcessorContext, Tunables};
use tessera_dist::DistTxnRegistry;
use tessera_errors::Rcode;
use tessera_store::{DataStore, TranId};
use tessera_wire::{
    BlockOpcode, Cursor, Endian, ReqType, REQ_FLAG_POSITION_MODE,
};

fn submit(env: &TestEnv, frame: &[u8]) -> tessera_block::BlockResponse {
    let mut frame = frame.to_vec();
    env.processor.process(&mut frame, Origin::default())
}

#[test]
fn happy_tagged_add_returns_rspkl_and_is_idempotent() {
    let env = env();
    let frame = BatchBuilder::new()
        .flags(REQ_FLAG_POSITION_MODE)
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1rest-of-row!"))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-0xABCD"))
        .build();

    let first = submit(&env, &frame);
    assert_eq!(first.rc, 0, "errstat: {:?}", first.errstat);
    assert_eq!(env.store.row_count("t1"), 1);

    // RSPKL { num_completed = 1, last_genid != 0, numerrs = 0 }
    let mut c = Cursor::new(&first.bytes, Endian::Big);
    assert_eq!(c.get_u32(), Ok(1));
    let genid = c.get_u64().unwrap();
    assert_ne!(genid, 0);
    assert_eq!(c.get_u32(), Ok(0));
    assert_eq!(c.remaining(), 0);

    // resubmission: byte-identical response, no second row
    let second = submit(&env, &frame);
    assert_eq!(second.rc, first.rc);
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(env.store.row_count("t1"), 1);
    assert_eq!(
        env.ctx
            .blkseq_replay_count
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn legacy_batch_packs_rsp_and_replays_from_blockseq() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Use, use_db(101))
        .op(BlockOpcode::Addsl, addsl(b"keyAdata-legacy!"))
        .op(BlockOpcode::Seq, seq(0xdead, 0xbeef, 0x1234))
        .build();

    let first = submit(&env, &frame);
    assert_eq!(first.rc, 0);
    // RSP: num_completed, 3 rcodes, 3 rrns (2 for completed), 3 borcodes
    let mut c = Cursor::new(&first.bytes, Endian::Big);
    assert_eq!(c.get_u32(), Ok(3));
    for _ in 0..3 {
        assert_eq!(c.get_i32(), Ok(0));
    }
    for _ in 0..3 {
        assert_eq!(c.get_i32(), Ok(2));
    }
    for _ in 0..3 {
        assert_eq!(c.get_i32(), Ok(0));
    }

    let second = submit(&env, &frame);
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(env.store.row_count("t1"), 1);
}

#[test]
fn op_count_out_of_bounds_is_a_bad_request() {
    let env = env();
    let frame = BatchBuilder::new().build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BadReq.as_i32());

    // a count above the cap is rejected before anything runs
    let mut frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .build();
    frame[16..20].copy_from_slice(&10_000u32.to_be_bytes());
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BadReq.as_i32());
}

#[test]
fn unknown_opcode_is_a_bad_request() {
    let env = env();
    let mut frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .build();
    // scribble an unknown opcode into the op header
    frame[BODY_START] = 0xff;
    frame[BODY_START + 1] = 0xff;
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BadReq.as_i32());
    assert_eq!(env.store.row_count("t1"), 0);
}

#[test]
fn op_offset_past_request_end_is_a_bad_request() {
    let env = env();
    let mut frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1rest-of-row!"))
        .build();
    // first op's next pointer far past the end
    let bad = ((frame.len() / 4) as u32 + 64).to_be_bytes();
    frame[BODY_START + 4..BODY_START + 8].copy_from_slice(&bad);
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BadReq.as_i32());
}

#[test]
fn second_sequence_op_is_an_internal_error() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-one"))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-two"))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::Internal.as_i32());
}

#[test]
fn blob_fragments_assemble_before_the_consuming_add() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Qblob, qblob(0, 8, 0, b"blob"))
        .op(BlockOpcode::Qblob, qblob(0, 8, 4, b"tail"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1with-blob..."))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-blob"))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, 0, "errstat: {:?}", resp.errstat);
    assert_eq!(env.store.row_count("t1"), 1);
}

#[test]
fn incomplete_blob_fails_the_batch() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Qblob, qblob(0, 8, 0, b"half"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1with-blob..."))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BadReq.as_i32());
    assert_eq!(env.store.row_count("t1"), 0);
}

#[test]
fn queue_add_and_consume_are_transactional() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Qadd, qadd("q1", b"payload-one!"))
        .build();
    assert_eq!(submit(&env, &frame).rc, 0);
    assert_eq!(env.store.queue_len("q1"), 1);

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Qconsume, qconsume("q1", 0))
        .build();
    assert_eq!(submit(&env, &frame).rc, 0);
    assert_eq!(env.store.queue_len("q1"), 0);

    // consuming an empty queue fails and the batch backs out
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Qadd, qadd("q1", b"payload-two!"))
        .op(BlockOpcode::Qconsume, qconsume("q1", 0))
        .op(BlockOpcode::Qconsume, qconsume("q1", 0))
        .build();
    let resp = submit(&env, &frame);
    assert_ne!(resp.rc, 0);
    assert_eq!(env.store.queue_len("q1"), 0);
}

#[test]
fn fk_violation_backs_out_and_pins_the_outcome() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("child"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1no-parent..."))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-fk"))
        .build();

    let first = submit(&env, &frame);
    assert_eq!(first.rc, Rcode::BlockFailed.as_i32());
    assert_eq!(env.store.row_count("child"), 0);
    let errstat = first.errstat.clone().unwrap();
    assert_eq!(errstat.val, Rcode::Constraint.as_i32());

    // a duplicate submission observes the same pinned failure
    let second = submit(&env, &frame);
    assert_eq!(second.rc, first.rc);
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(env.store.row_count("child"), 0);
}

#[test]
fn deferred_duplicate_key_is_uncommittable() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1first-row..."))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1second-row.."))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::UncommittableTxn.as_i32());
    assert_eq!(env.store.row_count("t1"), 0);
}

#[test]
fn tagged_update_verify_mismatch_fails_without_retry() {
    let env = env();
    // seed a row out of band
    let t = env.store.trans_start(None).unwrap();
    let genid = env
        .store
        .add_record(t, "t1", b"key1original....", false)
        .unwrap();
    env.store.trans_commit(t).unwrap();

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(
            BlockOpcode::Update,
            update(genid.0, b"key1stale-image.", b"key1new-value..."),
        )
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-verify"))
        .build();

    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BlockFailed.as_i32());
    assert_eq!(resp.errstat.as_ref().unwrap().val, Rcode::Verify.as_i32());

    // tagged writes cannot self-retry, so the outcome is pinned
    let again = submit(&env, &frame);
    assert_eq!(again.bytes, resp.bytes);
    // the row is unchanged
    let (_, data) = env
        .store
        .find_by_key(TranId(0), "t1", b"key1")
        .unwrap();
    assert_eq!(data, b"key1original....");
}

#[test]
fn range_delete_removes_bounded_keys() {
    let env = env();
    for rec in [&b"aaa1-row-one...."[..], b"bbb1-row-two....", b"ccc1-row-three.."] {
        let t = env.store.trans_start(None).unwrap();
        env.store.add_record(t, "t1", rec, false).unwrap();
        env.store.trans_commit(t).unwrap();
    }
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Rngdelkl, rngdelkl(b"aaa", b"ccc", 10))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, 0);
    assert_eq!(env.store.row_count("t1"), 1);
}

#[test]
fn delete_by_genid_and_missing_record() {
    let env = env();
    let t = env.store.trans_start(None).unwrap();
    let genid = env
        .store
        .add_record(t, "t1", b"key1to-delete...", false)
        .unwrap();
    env.store.trans_commit(t).unwrap();

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Delkl, delkl(genid.0))
        .build();
    assert_eq!(submit(&env, &frame).rc, 0);
    assert_eq!(env.store.row_count("t1"), 0);

    // deleting it again is a structural failure
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::BlockFailed.as_i32());
    assert_eq!(
        resp.errstat.unwrap().val,
        Rcode::NoRecordsFound.as_i32()
    );
}

#[test]
fn rowlocks_commit_carries_the_blockseq() {
    let env = env_with(Tunables {
        rowlocks: true,
        ..Tunables::default()
    });
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1rowlocks...."))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-rowlocks"))
        .build();

    let first = submit(&env, &frame);
    assert_eq!(first.rc, 0, "errstat: {:?}", first.errstat);
    assert_eq!(env.store.row_count("t1"), 1);

    let second = submit(&env, &frame);
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(env.store.row_count("t1"), 1);
}

#[test]
fn long_transaction_assembles_across_pieces() {
    let env = env();
    let ops = vec![
        (BlockOpcode::Usekl, usekl("t1")),
        (BlockOpcode::Addkl, addkl(".DEFAULT", b"key1long-txn....")),
        (BlockOpcode::Addkl, addkl(".DEFAULT", b"key2long-txn....")),
        (BlockOpcode::SeqV2, seqv2(b"cnonce-long")),
    ];
    // offsets are computed against the assembled short-block frame
    let body = build_ops_body(&ops, BODY_START);
    let split = {
        // split at the boundary after the second op
        let first_two = build_ops_body(&ops[..2], BODY_START);
        first_two.len()
    };

    let mut piece1 = long_frame(42, 1, 2, false, 2, &body[..split]);
    let ack = env
        .processor
        .process(&mut piece1, Origin::default());
    assert_eq!(ack.rc, 0);
    assert!(ack.bytes.is_empty());

    let mut piece2 = long_frame(42, 2, 2, true, 2, &body[split..]);
    let done = env.processor.process(&mut piece2, Origin::default());
    assert_eq!(done.rc, 0, "errstat: {:?}", done.errstat);
    assert_eq!(env.store.row_count("t1"), 2);
    assert!(
        env.ctx
            .long_request_bytes
            .load(std::sync::atomic::Ordering::Relaxed)
            >= body.len() as u64
    );
}

#[test]
fn non_master_forwards_tagged_and_rejects_socket_sql() {
    let store = Arc::new(tessera_store::mem::MemStore::new());
    store.create_table(tessera_store::TableSchema::new("t1", 101, 4));
    let ctx = Arc::new(ProcessorContext::new(Tunables::default()));
    let cluster = Arc::new(FakeCluster {
        is_master: false,
        forwarded: parking_lot::Mutex::new(Vec::new()),
    });
    let processor = BlockProcessor::new(
        ctx,
        store,
        cluster.clone(),
        Arc::new(ScriptedSql::new()),
        Arc::new(DistTxnRegistry::new()),
    );

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1forwarded..."))
        .build();
    let mut f = frame.clone();
    let resp = processor.process(&mut f, Origin::default());
    assert_eq!(resp.rc, Rcode::InternalForward.as_i32());

    let sent = cluster.forwarded.lock();
    assert_eq!(sent.len(), 1);
    let fwd_hdr = tessera_wire::ReqHdr::get(&sent[0]).unwrap();
    assert_eq!(fwd_hdr.req_type, ReqType::FwdBlock);
    assert_eq!(&sent[0][4..], &frame[4..]);
    drop(sent);

    // offloaded sql is told to chase the new master instead
    let mut f = frame.clone();
    let resp = processor.process(
        &mut f,
        Origin {
            from_socket_sql: true,
        },
    );
    assert_eq!(resp.rc, Rcode::Rejected.as_i32());
    assert_eq!(resp.errstat.unwrap().val, Rcode::NoMaster.as_i32());
}

#[test]
fn delolder_removes_rows_older_than_the_epoch() {
    let env = env();
    let t = env.store.trans_start(None).unwrap();
    env.store.add_record(t, "t1", b"key1aged-row....", false).unwrap();
    env.store.trans_commit(t).unwrap();
    env.store.advance_clock(10);
    let t = env.store.trans_start(None).unwrap();
    env.store.add_record(t, "t1", b"key2fresh-row...", false).unwrap();
    env.store.trans_commit(t).unwrap();

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Delolder, delolder(11, 100))
        .build();
    assert_eq!(submit(&env, &frame).rc, 0);
    // only the row written before the clock advanced is gone
    assert_eq!(env.store.row_count("t1"), 1);
    assert!(env
        .store
        .find_by_key(TranId(0), "t1", b"key2")
        .is_ok());
}

#[test]
fn side_configuration_ops_are_accepted() {
    let env = env();
    let t = env.store.trans_start(None).unwrap();
    let genid = env
        .store
        .add_record(t, "t1", b"key1some-row....", false)
        .unwrap();
    env.store.trans_commit(t).unwrap();

    let frame = BatchBuilder::new()
        .op(BlockOpcode::Tz, tz("America/New_York"))
        .op(BlockOpcode::Modnum, modnum(3))
        .op(BlockOpcode::Scsmsk, scsmsk(0xff))
        .op(BlockOpcode::DbglogCookie, dbglog_cookie(0xc00c1e))
        .op(BlockOpcode::Pragma, pragma(1, b"vrfy"))
        .op(BlockOpcode::Setflags, setflags(2))
        .op(BlockOpcode::Debug, Vec::new())
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Uptbl, uptbl(10, genid.0))
        .build();
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, 0, "errstat: {:?}", resp.errstat);
    assert_eq!(env.store.row_count("t1"), 1);
}

#[test]
fn expired_blockseq_entry_reruns_the_batch() {
    let env = env();
    let frame = BatchBuilder::new()
        .op(BlockOpcode::Usekl, usekl("t1"))
        .op(BlockOpcode::Addkl, addkl(".DEFAULT", b"key1expired....."))
        .op(BlockOpcode::SeqV2, seqv2(b"cnonce-expired"))
        .build();
    assert_eq!(submit(&env, &frame).rc, 0);

    // if the entry is expired out of the store, the resubmission is
    // indistinguishable from a new batch and runs again, colliding on the
    // unique key instead of replaying
    env.store.blkseq_remove(b"cnonce-expired");
    let resp = submit(&env, &frame);
    assert_eq!(resp.rc, Rcode::UncommittableTxn.as_i32());
    assert_eq!(env.store.row_count("t1"), 1);
}
