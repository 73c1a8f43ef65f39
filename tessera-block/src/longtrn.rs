//! Long-transaction coalescing: a batch too big for one frame arrives as
//! numbered pieces sharing a tranid. Pieces are buffered under the table's
//! own lock and the whole request runs once the final piece carries the
//! commit flag.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_errors::{BlockError, BlockResult};
use tessera_wire::{LongBlockHdr, MAX_BLOCK_OPS, MAX_LONG_PIECES};
use tracing::warn;

/// A long transaction that never completes is purged after this long.
const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct LongTran {
    body: Vec<u8>,
    num_reqs: i64,
    pieces: u32,
    touched: Instant,
}

/// The long-transaction table, keyed by tranid.
#[derive(Debug, Default)]
pub struct LongTranTable {
    inner: Mutex<HashMap<u64, LongTran>>,
}

/// Result of feeding one piece.
#[derive(Debug, PartialEq, Eq)]
pub enum PieceOutcome {
    /// Piece buffered; acknowledge and wait for more.
    Buffered,
    /// Final piece arrived: the assembled op-list body and total op count.
    Complete { body: Vec<u8>, num_reqs: i64 },
}

impl LongTranTable {
    pub fn new() -> LongTranTable {
        LongTranTable::default()
    }

    /// Feed one piece. `body` is the op-list bytes of this piece (headers
    /// stripped). Piece numbering must be dense and in order; anything else
    /// is a bad request, as is blowing the piece or op caps.
    pub fn add_piece(
        &self,
        hdr: &LongBlockHdr,
        body: &[u8],
    ) -> BlockResult<PieceOutcome> {
        if hdr.num_pieces == 0 || hdr.num_pieces > MAX_LONG_PIECES {
            return Err(BlockError::BadRequest(format!(
                "bad piece count {}",
                hdr.num_pieces
            )));
        }
        let mut g = self.inner.lock();
        g.retain(|tranid, t| {
            let stale = t.touched.elapsed() > STALE_AFTER;
            if stale {
                warn!(tranid, "purging stale long transaction");
            }
            !stale
        });

        let t = g.entry(hdr.tranid).or_insert_with(|| LongTran {
            body: Vec::new(),
            num_reqs: 0,
            pieces: 0,
            touched: Instant::now(),
        });
        if hdr.curpiece != t.pieces + 1 {
            let got = hdr.curpiece;
            let want = t.pieces + 1;
            g.remove(&hdr.tranid);
            return Err(BlockError::BadRequest(format!(
                "long transaction piece {got} out of order, expected {want}"
            )));
        }
        t.pieces = hdr.curpiece;
        t.touched = Instant::now();
        t.body.extend_from_slice(body);
        t.num_reqs += hdr.num_reqs;
        if t.num_reqs < 1 || t.num_reqs > MAX_BLOCK_OPS as i64 {
            let n = t.num_reqs;
            g.remove(&hdr.tranid);
            return Err(BlockError::BadRequest(format!(
                "bad number of requests {n}"
            )));
        }

        if hdr.docommit {
            let t = g.remove(&hdr.tranid).unwrap();
            Ok(PieceOutcome::Complete {
                body: t.body,
                num_reqs: t.num_reqs,
            })
        } else {
            Ok(PieceOutcome::Buffered)
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(tranid: u64, curpiece: u32, num_pieces: u32, docommit: bool, num_reqs: i64) -> LongBlockHdr {
        // build through the wire decoder so the 0-based end offset quirk
        // stays covered
        let mut buf = Vec::new();
        let mut w = tessera_wire::Writer::new(&mut buf, tessera_wire::Endian::Big, 64);
        w.put_u64(tranid).unwrap();
        w.put_u32(curpiece).unwrap();
        w.put_u32(num_pieces).unwrap();
        w.put_u32(docommit as u32).unwrap();
        w.put_u32(num_reqs as u32).unwrap();
        w.put_u32(0).unwrap();
        let mut c = tessera_wire::Cursor::new(&buf, tessera_wire::Endian::Big);
        LongBlockHdr::get(&mut c).unwrap()
    }

    #[test]
    fn pieces_assemble_in_order() {
        let table = LongTranTable::new();
        assert_eq!(
            table.add_piece(&hdr(7, 1, 3, false, 2), b"aaaa").unwrap(),
            PieceOutcome::Buffered
        );
        assert_eq!(
            table.add_piece(&hdr(7, 2, 3, false, 2), b"bbbb").unwrap(),
            PieceOutcome::Buffered
        );
        match table.add_piece(&hdr(7, 3, 3, true, 1), b"cccc").unwrap() {
            PieceOutcome::Complete { body, num_reqs } => {
                assert_eq!(body, b"aaaabbbbcccc");
                assert_eq!(num_reqs, 5);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn out_of_order_piece_drops_the_transaction() {
        let table = LongTranTable::new();
        table.add_piece(&hdr(9, 1, 2, false, 1), b"x").unwrap();
        assert!(table.add_piece(&hdr(9, 3, 2, true, 1), b"y").is_err());
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn op_count_cap_applies_to_the_whole_transaction() {
        let table = LongTranTable::new();
        let too_many = (MAX_BLOCK_OPS + 1) as i64;
        assert!(table.add_piece(&hdr(1, 1, 1, true, too_many), b"").is_err());
    }
}
