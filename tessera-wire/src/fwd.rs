use byteorder::{BigEndian, ByteOrder};

use crate::cursor::Endian;
use crate::request::{ReqHdr, ReqType, REQ_HDR_LEN};
use crate::WireError;

/// Forward opcode for a request we are about to hand to the master. The
/// little-endian variant is chosen by the payload's byte order so the master
/// keeps decoding the body exactly as the client packed it.
pub fn forward_opcode(orig: ReqType) -> ReqType {
    match (orig, orig.endian()) {
        (_, Endian::Little) => ReqType::FwdBlockLe,
        (t, _) if t.is_long() => ReqType::FwdLongBlock,
        _ => ReqType::FwdBlock,
    }
}

/// Repack a frame for the master: same body, same flags (the errstat flag
/// rides along in the copied header), forward opcode in the type word.
pub fn repack_for_master(frame: &[u8]) -> Result<Vec<u8>, WireError> {
    if frame.len() < REQ_HDR_LEN {
        return Err(WireError::UnexpectedEof {
            need: REQ_HDR_LEN,
            have: frame.len(),
        });
    }
    let hdr = ReqHdr::get(frame)?;
    let mut out = frame.to_vec();
    BigEndian::write_u32(&mut out[..4], forward_opcode(hdr.req_type).as_u32());
    Ok(out)
}
