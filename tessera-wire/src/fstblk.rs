use tessera_errors::{Errstat, ERRSTAT_STR_SZ};

use crate::cursor::{Cursor, Endian, Writer};
use crate::response::{BlockErr, RspKl};
use crate::WireError;

/// Hard cap on a packed blockseq payload.
pub const FSTBLK_MAX_BUF_LEN: usize = 1024;

/// Discriminator at the front of every blockseq payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FstblkType {
    RspOk = 1,
    RspErr = 2,
    RspKl = 3,
    SnapInfo = 4,
}

impl FstblkType {
    fn from_u32(v: u32) -> Result<FstblkType, WireError> {
        Ok(match v {
            1 => FstblkType::RspOk,
            2 => FstblkType::RspErr,
            3 => FstblkType::RspKl,
            4 => FstblkType::SnapInfo,
            other => return Err(WireError::UnknownReqType(other)),
        })
    }
}

/// Row-count summary stored with snapinfo payloads so a replayed commit
/// reports the same effects as the original.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryEffects {
    pub num_affected: u32,
    pub num_selected: u32,
    pub num_updated: u32,
    pub num_deleted: u32,
    pub num_inserted: u32,
}

impl QueryEffects {
    fn put(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.put_u32(self.num_affected)?;
        w.put_u32(self.num_selected)?;
        w.put_u32(self.num_updated)?;
        w.put_u32(self.num_deleted)?;
        w.put_u32(self.num_inserted)
    }

    fn get(c: &mut Cursor<'_>) -> Result<QueryEffects, WireError> {
        Ok(QueryEffects {
            num_affected: c.get_u32()?,
            num_selected: c.get_u32()?,
            num_updated: c.get_u32()?,
            num_deleted: c.get_u32()?,
            num_inserted: c.get_u32()?,
        })
    }
}

/// Body of a blockseq payload, one shape per [`FstblkType`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FstblkBody {
    /// Legacy all-success response; the op count comes from the resubmitted
    /// request, so only fluff is stored.
    RspOk { fluff: u32 },
    /// Legacy error response.
    RspErr { num_completed: u32, rcode: i32 },
    /// Keyless response without snapinfo. `last_genid` reproduces the
    /// position word for position-mode clients.
    RspKl {
        rspkl: RspKl,
        err: BlockErr,
        last_genid: u64,
    },
    /// Cnonce-keyed response: outer rcode, errstat, query effects, then the
    /// keyless tail.
    SnapInfo {
        outrc: i32,
        errstat: Errstat,
        effects: QueryEffects,
        rspkl: RspKl,
        err: BlockErr,
        last_genid: u64,
    },
}

impl FstblkBody {
    pub fn fstblk_type(&self) -> FstblkType {
        match self {
            FstblkBody::RspOk { .. } => FstblkType::RspOk,
            FstblkBody::RspErr { .. } => FstblkType::RspErr,
            FstblkBody::RspKl { .. } => FstblkType::RspKl,
            FstblkBody::SnapInfo { .. } => FstblkType::SnapInfo,
        }
    }
}

/// A complete blockseq payload: typed body plus the epoch-seconds trailer.
/// The epoch is stripped before a replayed response is emitted; everything
/// before it must round-trip byte-identically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstblkPayload {
    pub body: FstblkBody,
    pub epoch: u32,
}

fn put_errstat(e: &Errstat, w: &mut Writer<'_>) -> Result<(), WireError> {
    w.put_i32(e.val)?;
    let bytes = e.msg.as_bytes();
    let n = bytes.len().min(ERRSTAT_STR_SZ);
    w.put_bytes(&bytes[..n])?;
    w.put_zeros(ERRSTAT_STR_SZ - n)
}

fn get_errstat(c: &mut Cursor<'_>) -> Result<Errstat, WireError> {
    let val = c.get_i32()?;
    let raw = c.get_bytes(ERRSTAT_STR_SZ)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(ERRSTAT_STR_SZ);
    let msg = std::str::from_utf8(&raw[..end])
        .map_err(|_| WireError::BadString)?
        .to_owned();
    Ok(Errstat { val, msg })
}

impl FstblkPayload {
    /// Payloads are always packed big-endian; they never leave the server
    /// except re-emitted through a response writer that owns the client's
    /// byte order.
    pub fn pack(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, Endian::Big, FSTBLK_MAX_BUF_LEN);
        w.put_u32(self.body.fstblk_type() as u32)?;
        match &self.body {
            FstblkBody::RspOk { fluff } => {
                w.put_u32(*fluff)?;
            }
            FstblkBody::RspErr { num_completed, rcode } => {
                w.put_u32(*num_completed)?;
                w.put_i32(*rcode)?;
            }
            FstblkBody::RspKl {
                rspkl,
                err,
                last_genid,
            } => {
                rspkl.put(&mut w)?;
                err.put(&mut w)?;
                w.put_u64(*last_genid)?;
            }
            FstblkBody::SnapInfo {
                outrc,
                errstat,
                effects,
                rspkl,
                err,
                last_genid,
            } => {
                // pre-rspkl fluff word, kept for layout compatibility
                w.put_u32(0)?;
                w.put_i32(*outrc)?;
                put_errstat(errstat, &mut w)?;
                effects.put(&mut w)?;
                rspkl.put(&mut w)?;
                err.put(&mut w)?;
                w.put_u64(*last_genid)?;
            }
        }
        w.put_u32(self.epoch)?;
        Ok(buf)
    }

    pub fn unpack(bytes: &[u8]) -> Result<FstblkPayload, WireError> {
        let mut c = Cursor::new(bytes, Endian::Big);
        let ty = FstblkType::from_u32(c.get_u32()?)?;
        let body = match ty {
            FstblkType::RspOk => FstblkBody::RspOk { fluff: c.get_u32()? },
            FstblkType::RspErr => FstblkBody::RspErr {
                num_completed: c.get_u32()?,
                rcode: c.get_i32()?,
            },
            FstblkType::RspKl => FstblkBody::RspKl {
                rspkl: RspKl::get(&mut c)?,
                err: BlockErr::get(&mut c)?,
                last_genid: c.get_u64()?,
            },
            FstblkType::SnapInfo => {
                let _fluff = c.get_u32()?;
                FstblkBody::SnapInfo {
                    outrc: c.get_i32()?,
                    errstat: get_errstat(&mut c)?,
                    effects: QueryEffects::get(&mut c)?,
                    rspkl: RspKl::get(&mut c)?,
                    err: BlockErr::get(&mut c)?,
                    last_genid: c.get_u64()?,
                }
            }
        };
        let epoch = c.get_u32()?;
        if c.remaining() != 0 {
            return Err(WireError::BadFieldLength(c.remaining() as u32));
        }
        Ok(FstblkPayload { body, epoch })
    }
}
