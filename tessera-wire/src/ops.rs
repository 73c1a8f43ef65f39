use crate::cursor::Cursor;
use crate::offset::WordOffset;
use crate::{WireError, MAX_BLOB_LENGTH};

/// Per-op header: a 16-bit opcode and the 1-based word offset of the next
/// op (pointing one past this op's payload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpHeader {
    pub opcode: u16,
    pub next: WordOffset,
}

impl OpHeader {
    pub fn get(c: &mut Cursor<'_>) -> Result<OpHeader, WireError> {
        let opcode = c.get_u16()?;
        // opcode is padded to a word on the wire
        c.skip(2)?;
        let next = WordOffset(c.get_u32()?);
        Ok(OpHeader { opcode, next })
    }

    pub const LEN: usize = 8;
}

/// The closed set of block opcodes. The low range is the legacy generation,
/// the 130+ range the keyless/block2 generation; both appear in the same
/// batch format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BlockOpcode {
    Addsl = 110,
    Delsc = 114,
    Upvrrn = 117,
    Debug = 118,
    Seq = 119,
    Use = 120,
    Setflags = 121,
    Delolder = 122,

    Adddta = 130,
    Addkey = 131,
    Deldta = 132,
    Delkey = 133,
    Update = 134,
    Addkl = 135,
    AddklPos = 136,
    Delkl = 137,
    Updkl = 138,
    UpdklPos = 139,
    Usekl = 140,
    Tz = 141,
    Qblob = 143,
    Rngdelkl = 144,
    Custom = 145,
    Qadd = 146,
    Qconsume = 147,
    Modnum = 148,
    SockSql = 149,
    Scsmsk = 150,
    Recom = 151,
    Updbykey = 152,
    Snapisol = 153,
    Serial = 154,
    DbglogCookie = 155,
    Pragma = 156,
    SeqV2 = 157,
    Uptbl = 158,
}

impl BlockOpcode {
    pub fn from_u16(v: u16) -> Result<BlockOpcode, WireError> {
        use BlockOpcode::*;
        Ok(match v {
            110 => Addsl,
            114 => Delsc,
            117 => Upvrrn,
            118 => Debug,
            119 => Seq,
            120 => Use,
            121 => Setflags,
            122 => Delolder,
            130 => Adddta,
            131 => Addkey,
            132 => Deldta,
            133 => Delkey,
            134 => Update,
            135 => Addkl,
            136 => AddklPos,
            137 => Delkl,
            138 => Updkl,
            139 => UpdklPos,
            140 => Usekl,
            141 => Tz,
            143 => Qblob,
            144 => Rngdelkl,
            145 => Custom,
            146 => Qadd,
            147 => Qconsume,
            148 => Modnum,
            149 => SockSql,
            150 => Scsmsk,
            151 => Recom,
            152 => Updbykey,
            153 => Snapisol,
            154 => Serial,
            155 => DbglogCookie,
            156 => Pragma,
            157 => SeqV2,
            158 => Uptbl,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }

    /// Opcodes that flip the batch into offloaded-SQL mode.
    pub fn is_sql_mode(self) -> bool {
        matches!(
            self,
            BlockOpcode::SockSql
                | BlockOpcode::Recom
                | BlockOpcode::Snapisol
                | BlockOpcode::Serial
        )
    }

    /// Tagged record writes, the ops a no-tagged-writes policy rejects.
    pub fn is_tagged_write(self) -> bool {
        matches!(
            self,
            BlockOpcode::Addsl
                | BlockOpcode::Adddta
                | BlockOpcode::Addkl
                | BlockOpcode::AddklPos
                | BlockOpcode::Delsc
                | BlockOpcode::Deldta
                | BlockOpcode::Delkl
                | BlockOpcode::Upvrrn
                | BlockOpcode::Update
                | BlockOpcode::Updkl
                | BlockOpcode::UpdklPos
                | BlockOpcode::Updbykey
                | BlockOpcode::Rngdelkl
        )
    }
}

/// One decoded op payload. Records and keys are owned copies out of the
/// request buffer; the buffer itself may be restored from backup between
/// retries, so nothing here borrows from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockOp {
    /// Switch target table by db number.
    Use { dbnum: u32 },
    /// Switch target table by name.
    Usekl { table: String },
    /// Legacy 12-byte sequence. The proxy sends the logically-first word
    /// last; `seq` holds wire order.
    Seq { seq: [u32; 3] },
    /// Cnonce/uuid sequence.
    SeqV2 { key: Vec<u8> },
    /// Legacy tagged add.
    Addsl { record: Vec<u8> },
    /// Keyless add; `tag` names the record layout.
    Addkl { tag: String, record: Vec<u8> },
    AddklPos { tag: String, record: Vec<u8> },
    Adddta { record: Vec<u8> },
    /// Ignored for compatibility; key formation is the store's job.
    Addkey,
    Delsc { rrn: u32, key: Vec<u8> },
    Delkl { genid: u64 },
    Deldta { genid: u64 },
    /// Ignored for compatibility.
    Delkey,
    Upvrrn { rrn: u32, verify: Vec<u8>, record: Vec<u8> },
    Update { genid: u64, verify: Vec<u8>, record: Vec<u8> },
    Updkl { genid: u64, tag: String, verify: Vec<u8>, record: Vec<u8> },
    UpdklPos { genid: u64, tag: String, verify: Vec<u8>, record: Vec<u8> },
    Updbykey { key: Vec<u8>, record: Vec<u8> },
    Qblob { blobno: u32, length: usize, frag_offset: usize, frag: Vec<u8> },
    Qadd { queue: String, data: Vec<u8> },
    Qconsume { queue: String, consumer: u32 },
    Custom { opname: String, payload: Vec<u8> },
    /// Offloaded SQL; `isolation` distinguishes SOCK_SQL/RECOM/SNAPISOL/SERIAL.
    Sql { isolation: SqlIsolation, sql: String },
    Tz { tzname: String },
    Pragma { kind: u32, payload: Vec<u8> },
    DbglogCookie { cookie: u64 },
    Modnum { modnum: u32 },
    Scsmsk { mask: u64 },
    Delolder { epoch: u32, count: u32 },
    Uptbl { nrecs: u32, genid: u64 },
    Setflags { flags: u32 },
    Rngdelkl { start_key: Vec<u8>, end_key: Vec<u8>, max: u32 },
    Debug,
}

/// Isolation requested by an offloaded-SQL op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlIsolation {
    SockSql,
    ReadCommitted,
    SnapshotIsolation,
    Serializable,
}

impl BlockOp {
    /// Decode the payload for `opcode` from a cursor clamped to this op.
    pub fn get(opcode: BlockOpcode, c: &mut Cursor<'_>) -> Result<BlockOp, WireError> {
        use BlockOpcode as Code;
        Ok(match opcode {
            Code::Use => BlockOp::Use { dbnum: c.get_u32()? },
            Code::Usekl => BlockOp::Usekl {
                table: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Seq => BlockOp::Seq {
                seq: [c.get_u32()?, c.get_u32()?, c.get_u32()?],
            },
            Code::SeqV2 => BlockOp::SeqV2 {
                key: c.get_lpstring()?.to_vec(),
            },
            Code::Addsl => BlockOp::Addsl {
                record: c.get_lpstring()?.to_vec(),
            },
            Code::Addkl => {
                let tag = c.get_lpstr_utf8()?.to_owned();
                BlockOp::Addkl {
                    tag,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::AddklPos => {
                let tag = c.get_lpstr_utf8()?.to_owned();
                BlockOp::AddklPos {
                    tag,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Adddta => BlockOp::Adddta {
                record: c.get_lpstring()?.to_vec(),
            },
            Code::Addkey => BlockOp::Addkey,
            Code::Delsc => {
                let rrn = c.get_u32()?;
                BlockOp::Delsc {
                    rrn,
                    key: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Delkl => BlockOp::Delkl { genid: c.get_u64()? },
            Code::Deldta => BlockOp::Deldta { genid: c.get_u64()? },
            Code::Delkey => BlockOp::Delkey,
            Code::Upvrrn => {
                let rrn = c.get_u32()?;
                let verify = c.get_lpstring()?.to_vec();
                BlockOp::Upvrrn {
                    rrn,
                    verify,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Update => {
                let genid = c.get_u64()?;
                let verify = c.get_lpstring()?.to_vec();
                BlockOp::Update {
                    genid,
                    verify,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Updkl => {
                let genid = c.get_u64()?;
                let tag = c.get_lpstr_utf8()?.to_owned();
                let verify = c.get_lpstring()?.to_vec();
                BlockOp::Updkl {
                    genid,
                    tag,
                    verify,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::UpdklPos => {
                let genid = c.get_u64()?;
                let tag = c.get_lpstr_utf8()?.to_owned();
                let verify = c.get_lpstring()?.to_vec();
                BlockOp::UpdklPos {
                    genid,
                    tag,
                    verify,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Updbykey => {
                let key = c.get_lpstring()?.to_vec();
                BlockOp::Updbykey {
                    key,
                    record: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Qblob => {
                let blobno = c.get_u32()?;
                let length = c.get_u32()? as usize;
                if length > MAX_BLOB_LENGTH {
                    return Err(WireError::BlobTooLarge(length));
                }
                let frag_offset = c.get_u32()? as usize;
                let frag = c.get_lpstring()?.to_vec();
                if frag_offset + frag.len() > length {
                    return Err(WireError::BadBlobFragment {
                        blobno: blobno as usize,
                    });
                }
                BlockOp::Qblob {
                    blobno,
                    length,
                    frag_offset,
                    frag,
                }
            }
            Code::Qadd => {
                let queue = c.get_lpstr_utf8()?.to_owned();
                BlockOp::Qadd {
                    queue,
                    data: c.get_lpstring()?.to_vec(),
                }
            }
            Code::Qconsume => {
                let queue = c.get_lpstr_utf8()?.to_owned();
                BlockOp::Qconsume {
                    queue,
                    consumer: c.get_u32()?,
                }
            }
            Code::Custom => {
                let opname = c.get_lpstr_utf8()?.to_owned();
                BlockOp::Custom {
                    opname,
                    payload: c.get_lpstring()?.to_vec(),
                }
            }
            Code::SockSql => BlockOp::Sql {
                isolation: SqlIsolation::SockSql,
                sql: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Recom => BlockOp::Sql {
                isolation: SqlIsolation::ReadCommitted,
                sql: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Snapisol => BlockOp::Sql {
                isolation: SqlIsolation::SnapshotIsolation,
                sql: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Serial => BlockOp::Sql {
                isolation: SqlIsolation::Serializable,
                sql: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Tz => BlockOp::Tz {
                tzname: c.get_lpstr_utf8()?.to_owned(),
            },
            Code::Pragma => {
                let kind = c.get_u32()?;
                BlockOp::Pragma {
                    kind,
                    payload: c.get_lpstring()?.to_vec(),
                }
            }
            Code::DbglogCookie => BlockOp::DbglogCookie { cookie: c.get_u64()? },
            Code::Modnum => BlockOp::Modnum { modnum: c.get_u32()? },
            Code::Scsmsk => BlockOp::Scsmsk { mask: c.get_u64()? },
            Code::Delolder => BlockOp::Delolder {
                epoch: c.get_u32()?,
                count: c.get_u32()?,
            },
            Code::Uptbl => BlockOp::Uptbl {
                nrecs: c.get_u32()?,
                genid: c.get_u64()?,
            },
            Code::Setflags => BlockOp::Setflags { flags: c.get_u32()? },
            Code::Rngdelkl => {
                let start_key = c.get_lpstring()?.to_vec();
                let end_key = c.get_lpstring()?.to_vec();
                BlockOp::Rngdelkl {
                    start_key,
                    end_key,
                    max: c.get_u32()?,
                }
            }
            Code::Debug => BlockOp::Debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Endian, Writer};

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(BlockOpcode::from_u16(999), Err(WireError::UnknownOpcode(999)));
    }

    #[test]
    fn every_known_opcode_round_trips_through_u16() {
        for v in 0..=u16::MAX {
            if let Ok(op) = BlockOpcode::from_u16(v) {
                assert_eq!(op as u16, v);
            }
        }
    }

    #[test]
    fn addkl_payload_decodes() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, Endian::Big, 256);
        w.put_lpstring(b".DEFAULT").unwrap();
        w.put_lpstring(&[1, 2, 3, 4, 5]).unwrap();
        let mut c = Cursor::new(&buf, Endian::Big);
        let op = BlockOp::get(BlockOpcode::Addkl, &mut c).unwrap();
        assert_eq!(
            op,
            BlockOp::Addkl {
                tag: ".DEFAULT".into(),
                record: vec![1, 2, 3, 4, 5],
            }
        );
    }

    #[test]
    fn qblob_fragment_must_fit_declared_length() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, Endian::Big, 256);
        w.put_u32(0).unwrap(); // blobno
        w.put_u32(4).unwrap(); // declared length
        w.put_u32(2).unwrap(); // frag offset
        w.put_lpstring(&[9, 9, 9]).unwrap(); // 3 bytes at offset 2 > 4
        let mut c = Cursor::new(&buf, Endian::Big);
        assert_eq!(
            BlockOp::get(BlockOpcode::Qblob, &mut c),
            Err(WireError::BadBlobFragment { blobno: 0 })
        );
    }

    #[test]
    fn oversized_blob_declaration_is_rejected() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, Endian::Big, 256);
        w.put_u32(1).unwrap();
        w.put_u32((MAX_BLOB_LENGTH + 1) as u32).unwrap();
        w.put_u32(0).unwrap();
        w.put_lpstring(&[]).unwrap();
        let mut c = Cursor::new(&buf, Endian::Big);
        assert_eq!(
            BlockOp::get(BlockOpcode::Qblob, &mut c),
            Err(WireError::BlobTooLarge(MAX_BLOB_LENGTH + 1))
        );
    }
}
