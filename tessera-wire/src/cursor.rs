use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::WireError;

/// Byte order of a request, decided once from the top-level opcode and
/// carried through every get/put for that frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Bounds-checked reader over a byte span `[pos, end)`.
///
/// The span is usually narrower than the whole frame: while executing one op
/// the end is clamped to that op's `next` pointer, so a payload that lies
/// about its length fails here instead of bleeding into the next op.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Cursor<'a> {
        Cursor {
            buf,
            pos: 0,
            end: buf.len(),
            endian,
        }
    }

    /// Cursor over `[pos, end)` of `buf`. `pos > end` or `end > buf.len()`
    /// is a caller bug surfaced as an eof error on first read.
    pub fn over(buf: &'a [u8], pos: usize, end: usize, endian: Endian) -> Cursor<'a> {
        Cursor {
            buf,
            pos,
            end: end.min(buf.len()),
            endian,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.remaining() < n {
            Err(WireError::UnexpectedEof {
                need: n,
                have: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.get_bytes(2)?;
        Ok(match self.endian {
            Endian::Big => BigEndian::read_u16(b),
            Endian::Little => LittleEndian::read_u16(b),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.get_bytes(4)?;
        Ok(match self.endian {
            Endian::Big => BigEndian::read_u32(b),
            Endian::Little => LittleEndian::read_u32(b),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.get_bytes(8)?;
        Ok(match self.endian {
            Endian::Big => BigEndian::read_u64(b),
            Endian::Little => LittleEndian::read_u64(b),
        })
    }

    /// Length-prefixed byte string, padded on the wire to a word boundary.
    pub fn get_lpstring(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(WireError::BadFieldLength(len as u32));
        }
        let out = self.get_bytes(len)?;
        let pad = (4 - len % 4) % 4;
        if pad > 0 && self.remaining() >= pad {
            self.skip(pad)?;
        }
        Ok(out)
    }

    pub fn get_lpstr_utf8(&mut self) -> Result<&'a str, WireError> {
        std::str::from_utf8(self.get_lpstring()?).map_err(|_| WireError::BadString)
    }
}

/// Bounds-checked writer, the put-side twin of [`Cursor`].
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut Vec<u8>,
    endian: Endian,
    limit: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut Vec<u8>, endian: Endian, limit: usize) -> Writer<'a> {
        Writer { buf, endian, limit }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.len() + n > self.limit {
            Err(WireError::Overflow)
        } else {
            Ok(())
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> Result<(), WireError> {
        self.need(b.len())?;
        self.buf.extend_from_slice(b);
        Ok(())
    }

    pub fn put_zeros(&mut self, n: usize) -> Result<(), WireError> {
        self.need(n)?;
        self.buf.resize(self.buf.len() + n, 0);
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), WireError> {
        let mut b = [0u8; 2];
        match self.endian {
            Endian::Big => BigEndian::write_u16(&mut b, v),
            Endian::Little => LittleEndian::write_u16(&mut b, v),
        }
        self.put_bytes(&b)
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), WireError> {
        let mut b = [0u8; 4];
        match self.endian {
            Endian::Big => BigEndian::write_u32(&mut b, v),
            Endian::Little => LittleEndian::write_u32(&mut b, v),
        }
        self.put_bytes(&b)
    }

    pub fn put_i32(&mut self, v: i32) -> Result<(), WireError> {
        self.put_u32(v as u32)
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), WireError> {
        let mut b = [0u8; 8];
        match self.endian {
            Endian::Big => BigEndian::write_u64(&mut b, v),
            Endian::Little => LittleEndian::write_u64(&mut b, v),
        }
        self.put_bytes(&b)
    }

    pub fn put_lpstring(&mut self, s: &[u8]) -> Result<(), WireError> {
        self.put_u32(s.len() as u32)?;
        self.put_bytes(s)?;
        let pad = (4 - s.len() % 4) % 4;
        self.put_zeros(pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_respect_the_clamped_end() {
        let buf = [0u8; 16];
        let mut c = Cursor::over(&buf, 4, 8, Endian::Big);
        assert_eq!(c.get_u32(), Ok(0));
        assert_eq!(
            c.get_u32(),
            Err(WireError::UnexpectedEof { need: 4, have: 0 })
        );
    }

    #[test]
    fn endianness_flips_both_sides() {
        let mut out = Vec::new();
        Writer::new(&mut out, Endian::Little, 64).put_u32(0xdead_beef).unwrap();
        assert_eq!(out, [0xef, 0xbe, 0xad, 0xde]);
        let mut c = Cursor::new(&out, Endian::Little);
        assert_eq!(c.get_u32(), Ok(0xdead_beef));
    }

    #[test]
    fn lpstring_round_trips_with_padding() {
        let mut out = Vec::new();
        let mut w = Writer::new(&mut out, Endian::Big, 64);
        w.put_lpstring(b"hello").unwrap();
        assert_eq!(out.len(), 4 + 8);
        let mut c = Cursor::new(&out, Endian::Big);
        assert_eq!(c.get_lpstring(), Ok(&b"hello"[..]));
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn writer_enforces_its_limit() {
        let mut out = Vec::new();
        let mut w = Writer::new(&mut out, Endian::Big, 6);
        w.put_u32(1).unwrap();
        assert_eq!(w.put_u32(2), Err(WireError::Overflow));
    }
}
