use crate::cursor::{Cursor, Writer};
use crate::WireError;

/// Per-batch error detail appended to keyless responses when `numerrs > 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockErr {
    /// Index of the op that failed.
    pub blockop_num: i32,
    pub errcode: i32,
    /// Index number for constraint errors, -1 for the data file.
    pub ixnum: i32,
}

impl BlockErr {
    pub fn put(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.put_i32(self.blockop_num)?;
        w.put_i32(self.errcode)?;
        w.put_i32(self.ixnum)
    }

    pub fn get(c: &mut Cursor<'_>) -> Result<BlockErr, WireError> {
        Ok(BlockErr {
            blockop_num: c.get_i32()?,
            errcode: c.get_i32()?,
            ixnum: c.get_i32()?,
        })
    }
}

/// Keyless response header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RspKl {
    pub num_completed: u32,
    pub numerrs: u32,
}

impl RspKl {
    pub fn put(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.put_u32(self.num_completed)?;
        w.put_u32(self.numerrs)
    }

    pub fn get(c: &mut Cursor<'_>) -> Result<RspKl, WireError> {
        Ok(RspKl {
            num_completed: c.get_u32()?,
            numerrs: c.get_u32()?,
        })
    }
}

/// Pack a legacy RSP frame: `{num_completed}`, then `num_reqs` rcodes, then
/// `num_reqs` rrns, then `num_reqs` borcodes.
///
/// The shape is positional: `rcode[j]` is `rc` exactly at `j ==
/// num_completed` (the failing op) and zero elsewhere; `rrn[j]` is 2 for
/// completed ops and 0 after the failure point; borcodes are always zero.
pub fn pack_rsp(
    w: &mut Writer<'_>,
    num_reqs: usize,
    num_completed: usize,
    rc: i32,
) -> Result<(), WireError> {
    w.put_u32(num_completed as u32)?;
    for j in 0..num_reqs {
        w.put_i32(if j == num_completed { rc } else { 0 })?;
    }
    for j in 0..num_reqs {
        w.put_i32(if j < num_completed { 2 } else { 0 })?;
    }
    w.put_zeros(4 * num_reqs)
}

/// Pack a keyless RSPKL frame. `position` is the last genid, present only
/// in position mode; `err` is appended when set, and `numerrs` reflects it.
pub fn pack_rspkl(
    w: &mut Writer<'_>,
    num_completed: usize,
    position: Option<u64>,
    err: Option<&BlockErr>,
) -> Result<(), WireError> {
    w.put_u32(num_completed as u32)?;
    if let Some(genid) = position {
        w.put_u64(genid)?;
    }
    w.put_u32(if err.is_some() { 1 } else { 0 })?;
    if let Some(err) = err {
        err.put(w)?;
    }
    Ok(())
}
