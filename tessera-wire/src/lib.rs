//! Wire codec for the block processor.
//!
//! Everything in this crate is wire-visible and bit-exact: the 1-based
//! 32-bit word offsets the proxy has always sent, the two response shapes
//! (legacy RSP and keyless RSPKL), and the fstblk payload stored in the
//! blockseq. All multi-byte integers are network byte order unless the
//! request arrived through the little-endian forward opcode, in which case
//! the [`Endian`] carried on the cursor flips every get/put.

mod cursor;
mod error;
mod fstblk;
mod fwd;
mod offset;
mod ops;
mod request;
mod response;

pub use cursor::{Cursor, Endian, Writer};
pub use error::WireError;
pub use fstblk::{
    FstblkBody, FstblkPayload, FstblkType, QueryEffects, FSTBLK_MAX_BUF_LEN,
};
pub use fwd::{forward_opcode, repack_for_master};
pub use offset::WordOffset;
pub use ops::{BlockOp, BlockOpcode, OpHeader, SqlIsolation};
pub use request::{
    BlockReqHdr, BlockState, LongBlockHdr, ReqHdr, ReqType, LONG_HDR_LEN, REQ_HDR_LEN,
    REQ_FLAG_ERRSTAT, REQ_FLAG_POSITION_MODE,
};
pub use response::{pack_rsp, pack_rspkl, BlockErr, RspKl};

/// Bounds enforced while walking a batch.
pub const MAX_BLOCK_OPS: usize = 2000;
/// Named blob slots available to one batch.
pub const MAX_BLOBS: usize = 16;
/// Largest declared blob a write op may reference.
pub const MAX_BLOB_LENGTH: usize = 256 * 1024 * 1024;
/// Most pieces a long transaction may arrive in.
pub const MAX_LONG_PIECES: u32 = 100;
