use crate::cursor::{Cursor, Endian};
use crate::offset::WordOffset;
use crate::WireError;

/// Bytes occupied by the fixed request header at the front of every frame.
pub const REQ_HDR_LEN: usize = 16;
/// Additional bytes of the long-block header that follows [`ReqHdr`] on
/// long transactions.
pub const LONG_HDR_LEN: usize = 28;

/// Request wants a structured errstat appended to error responses.
pub const REQ_FLAG_ERRSTAT: u32 = 0x1;
/// Keyless responses carry the last genid (position mode).
pub const REQ_FLAG_POSITION_MODE: u32 = 0x2;

/// Top-level request types. The `_LE` variant marks a frame forwarded from
/// a little-endian source; its payload integers are byte-swapped relative
/// to everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReqType {
    Block,
    LongBlock,
    FwdBlock,
    FwdLongBlock,
    FwdBlockLe,
}

impl ReqType {
    pub const OP_BLOCK: u32 = 10;
    pub const OP_LONGBLOCK: u32 = 21;
    pub const OP_FWD_BLOCK: u32 = 32;
    pub const OP_FWD_LBLOCK: u32 = 36;
    pub const OP_FWD_BLOCK_LE: u32 = 94;

    pub fn from_u32(v: u32) -> Result<ReqType, WireError> {
        Ok(match v {
            Self::OP_BLOCK => ReqType::Block,
            Self::OP_LONGBLOCK => ReqType::LongBlock,
            Self::OP_FWD_BLOCK => ReqType::FwdBlock,
            Self::OP_FWD_LBLOCK => ReqType::FwdLongBlock,
            Self::OP_FWD_BLOCK_LE => ReqType::FwdBlockLe,
            other => return Err(WireError::UnknownReqType(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ReqType::Block => Self::OP_BLOCK,
            ReqType::LongBlock => Self::OP_LONGBLOCK,
            ReqType::FwdBlock => Self::OP_FWD_BLOCK,
            ReqType::FwdLongBlock => Self::OP_FWD_LBLOCK,
            ReqType::FwdBlockLe => Self::OP_FWD_BLOCK_LE,
        }
    }

    /// Byte order of everything after the request-type word.
    pub fn endian(self) -> Endian {
        match self {
            ReqType::FwdBlockLe => Endian::Little,
            _ => Endian::Big,
        }
    }

    pub fn is_long(self) -> bool {
        matches!(self, ReqType::LongBlock | ReqType::FwdLongBlock)
    }

    pub fn is_forwarded(self) -> bool {
        matches!(
            self,
            ReqType::FwdBlock | ReqType::FwdLongBlock | ReqType::FwdBlockLe
        )
    }
}

/// Fixed request header: `{opcode, length, flags, luxref}`. The request-type
/// word is always big-endian (it is what tells us the endianness of the
/// rest).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReqHdr {
    pub req_type: ReqType,
    /// Total frame length in words.
    pub length: u32,
    pub flags: u32,
    pub luxref: u32,
}

impl ReqHdr {
    pub fn get(frame: &[u8]) -> Result<ReqHdr, WireError> {
        let mut head = Cursor::over(frame, 0, REQ_HDR_LEN, Endian::Big);
        let req_type = ReqType::from_u32(head.get_u32()?)?;
        let mut rest = Cursor::over(frame, head.pos(), REQ_HDR_LEN, req_type.endian());
        let length = rest.get_u32()?;
        let flags = rest.get_u32()?;
        let luxref = rest.get_u32()?;
        Ok(ReqHdr {
            req_type,
            length,
            flags,
            luxref,
        })
    }

    pub fn wants_errstat(&self) -> bool {
        self.flags & REQ_FLAG_ERRSTAT != 0
    }

    pub fn position_mode(&self) -> bool {
        self.flags & REQ_FLAG_POSITION_MODE != 0
    }
}

/// Short-block header that follows [`ReqHdr`]: op count and the 1-based
/// word offset of the end of the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockReqHdr {
    pub num_reqs: i64,
    pub offset_end: WordOffset,
}

impl BlockReqHdr {
    pub fn get(c: &mut Cursor<'_>) -> Result<BlockReqHdr, WireError> {
        let num_reqs = c.get_i32()? as i64;
        let offset_end = WordOffset(c.get_u32()?);
        Ok(BlockReqHdr {
            num_reqs,
            offset_end,
        })
    }
}

/// Long-block header: `{tranid, curpiece, num_pieces, docommit}` plus the
/// short-block fields. Unlike every other offset in the protocol the end
/// offset here is 0-based; `offset_end()` normalizes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongBlockHdr {
    pub tranid: u64,
    pub curpiece: u32,
    pub num_pieces: u32,
    pub docommit: bool,
    pub num_reqs: i64,
    raw_offset_end: u32,
}

impl LongBlockHdr {
    pub fn get(c: &mut Cursor<'_>) -> Result<LongBlockHdr, WireError> {
        let tranid = c.get_u64()?;
        let curpiece = c.get_u32()?;
        let num_pieces = c.get_u32()?;
        let docommit = c.get_u32()? != 0;
        let num_reqs = c.get_i32()? as i64;
        let raw_offset_end = c.get_u32()?;
        Ok(LongBlockHdr {
            tranid,
            curpiece,
            num_pieces,
            docommit,
            num_reqs,
            raw_offset_end,
        })
    }

    pub fn offset_end(&self) -> WordOffset {
        WordOffset(self.raw_offset_end + 1)
    }
}

/// Parse-position state for one block request, plus the private backup used
/// to make deadlock retries idempotent.
///
/// All fields are byte indexes into the request frame; the frame itself is
/// borrowed from the transport and passed into each call, so the state can
/// outlive any one borrow of it.
#[derive(Clone, Debug, Default)]
pub struct BlockState {
    /// Start of the op list (just past the headers).
    pub body_start: usize,
    /// Exclusive end of the request as declared by the header.
    pub req_end: usize,
    /// Current read position.
    pub pos: usize,
    next_start: Option<usize>,
    saved: Vec<u8>,
    saved_upto: usize,
}

impl BlockState {
    pub fn new(body_start: usize) -> BlockState {
        BlockState {
            body_start,
            req_end: body_start,
            pos: body_start,
            next_start: None,
            saved: Vec::new(),
            saved_upto: 0,
        }
    }

    /// Validate `offset` and record it as the end of the whole request.
    pub fn set_end(&mut self, frame: &[u8], offset: WordOffset) -> Result<(), WireError> {
        let idx = offset.to_byte_index(frame.len())?;
        if idx < self.body_start {
            return Err(WireError::OffsetOutOfRange(offset.0));
        }
        self.req_end = idx;
        Ok(())
    }

    /// Validate `offset` and record it as the start of the next op.
    pub fn set_next(&mut self, frame: &[u8], offset: WordOffset) -> Result<(), WireError> {
        let idx = offset.to_byte_index(frame.len())?;
        if idx < self.body_start || idx > self.req_end {
            return Err(WireError::OffsetOutOfRange(offset.0));
        }
        self.next_start = Some(idx);
        Ok(())
    }

    /// Jump to the op recorded by [`set_next`](Self::set_next).
    ///
    /// Advances are monotonically non-decreasing: an op whose `next` points
    /// backwards is a malformed frame (it could loop forever).
    pub fn advance(&mut self) -> Result<(), WireError> {
        let next = self
            .next_start
            .take()
            .ok_or(WireError::BadOffset(0))?;
        if next < self.pos {
            return Err(WireError::OffsetOutOfRange(
                WordOffset::from_byte_index(next).0,
            ));
        }
        self.pos = next;
        Ok(())
    }

    pub fn next_start(&self) -> Option<usize> {
        self.next_start
    }

    /// Bytes of request body, valid once `set_end` has run.
    pub fn body_len(&self) -> usize {
        self.req_end - self.body_start
    }

    /// Incrementally back up the body through byte index `thru`. Backing up
    /// a prefix twice is a no-op; the shadow only ever grows.
    pub fn backup(&mut self, frame: &[u8], thru: usize) {
        let thru = thru.min(self.req_end);
        if self.saved.is_empty() {
            self.saved = vec![0; self.body_len()];
            self.saved_upto = self.body_start;
        }
        if thru <= self.saved_upto {
            return;
        }
        let dst_from = self.saved_upto - self.body_start;
        let dst_to = thru - self.body_start;
        self.saved[dst_from..dst_to].copy_from_slice(&frame[self.saved_upto..thru]);
        self.saved_upto = thru;
    }

    /// Back up everything through the end of the request.
    pub fn backup_all(&mut self, frame: &[u8]) {
        self.backup(frame, self.req_end);
    }

    /// Restore whatever was backed up and rewind the read position to the
    /// start of the body.
    pub fn restore(&mut self, frame: &mut [u8]) {
        let n = self.saved_upto.saturating_sub(self.body_start);
        frame[self.body_start..self.body_start + n].copy_from_slice(&self.saved[..n]);
        self.pos = self.body_start;
        self.next_start = None;
    }

    pub fn has_backup(&self) -> bool {
        !self.saved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Writer;
    use pretty_assertions::assert_eq;

    fn frame_with_hdr(req_type: ReqType, body_words: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        let total_words = (REQ_HDR_LEN / 4) + body_words;
        let mut w = Writer::new(&mut buf, Endian::Big, 4096);
        w.put_u32(req_type.as_u32()).unwrap();
        w.put_u32(total_words as u32).unwrap();
        w.put_u32(REQ_FLAG_ERRSTAT).unwrap();
        w.put_u32(0).unwrap();
        w.put_zeros(body_words * 4).unwrap();
        buf
    }

    #[test]
    fn req_hdr_round_trip() {
        let frame = frame_with_hdr(ReqType::Block, 8);
        let hdr = ReqHdr::get(&frame).unwrap();
        assert_eq!(hdr.req_type, ReqType::Block);
        assert_eq!(hdr.length as usize, frame.len() / 4);
        assert!(hdr.wants_errstat());
        assert!(!hdr.position_mode());
    }

    #[test]
    fn le_forward_flips_payload_endianness() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, Endian::Big, 64);
        w.put_u32(ReqType::OP_FWD_BLOCK_LE).unwrap();
        drop(w);
        let mut w = Writer::new(&mut buf, Endian::Little, 64);
        w.put_u32(9).unwrap();
        w.put_u32(0).unwrap();
        w.put_u32(0).unwrap();
        let hdr = ReqHdr::get(&buf).unwrap();
        assert_eq!(hdr.req_type, ReqType::FwdBlockLe);
        assert_eq!(hdr.length, 9);
    }

    #[test]
    fn set_next_rejects_offsets_past_end() {
        let frame = frame_with_hdr(ReqType::Block, 4);
        let mut st = BlockState::new(REQ_HDR_LEN);
        st.set_end(&frame, WordOffset::from_byte_index(frame.len()))
            .unwrap();
        let past = WordOffset::from_byte_index(frame.len() + 4);
        assert!(matches!(
            st.set_next(&frame, past),
            Err(WireError::OffsetOutOfRange(_))
        ));
    }

    #[test]
    fn advance_rejects_backwards_jumps() {
        let frame = frame_with_hdr(ReqType::Block, 8);
        let mut st = BlockState::new(REQ_HDR_LEN);
        st.set_end(&frame, WordOffset::from_byte_index(frame.len()))
            .unwrap();
        st.set_next(&frame, WordOffset::from_byte_index(REQ_HDR_LEN + 8))
            .unwrap();
        st.advance().unwrap();
        st.set_next(&frame, WordOffset::from_byte_index(REQ_HDR_LEN + 4))
            .unwrap();
        assert!(st.advance().is_err());
    }

    #[test]
    fn backup_restore_round_trips_bit_exactly() {
        let mut frame = frame_with_hdr(ReqType::Block, 8);
        for (i, b) in frame.iter_mut().enumerate().skip(REQ_HDR_LEN) {
            *b = i as u8;
        }
        let pristine = frame.clone();

        let mut st = BlockState::new(REQ_HDR_LEN);
        st.set_end(&frame, WordOffset::from_byte_index(frame.len()))
            .unwrap();
        st.backup_all(&frame);

        // simulate in-place scribbling during execution
        for b in frame.iter_mut().skip(REQ_HDR_LEN) {
            *b = 0xff;
        }
        st.restore(&mut frame);
        assert_eq!(frame, pristine);
        assert_eq!(st.pos, REQ_HDR_LEN);
    }

    #[test]
    fn partial_backup_only_restores_what_was_saved() {
        let mut frame = frame_with_hdr(ReqType::Block, 8);
        for (i, b) in frame.iter_mut().enumerate().skip(REQ_HDR_LEN) {
            *b = i as u8;
        }
        let mut st = BlockState::new(REQ_HDR_LEN);
        st.set_end(&frame, WordOffset::from_byte_index(frame.len()))
            .unwrap();
        st.backup(&frame, REQ_HDR_LEN + 8);

        let scribbled_tail = 0xeeu8;
        for b in frame.iter_mut().skip(REQ_HDR_LEN) {
            *b = scribbled_tail;
        }
        st.restore(&mut frame);
        assert_eq!(frame[REQ_HDR_LEN], REQ_HDR_LEN as u8);
        assert_eq!(frame[REQ_HDR_LEN + 7], (REQ_HDR_LEN + 7) as u8);
        assert_eq!(frame[REQ_HDR_LEN + 8], scribbled_tail);
    }
}
