//! Blockseq key handling and replay-response reconstruction.
//!
//! The blockseq is the idempotence log: one durable payload per
//! client-supplied key, written in the same transaction as the data it
//! describes. Resubmitting a batch whose key is already present must
//! produce the original response, byte for byte.

use std::time::{SystemTime, UNIX_EPOCH};

use tessera_errors::{BlockError, BlockResult, Errstat, Rcode};
use tessera_wire::{
    pack_rsp, pack_rspkl, Endian, FstblkBody, FstblkPayload, QueryEffects, Writer,
    FSTBLK_MAX_BUF_LEN,
};

/// A blockseq key: either the proxy's legacy 12-byte sequence or a
/// client-chosen cnonce (snapinfo key).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlkseqKey {
    Legacy([u8; 12]),
    Cnonce(Vec<u8>),
}

impl BlkseqKey {
    /// Reassemble a legacy sequence from wire order. The proxy sends the
    /// logically-first word last, so wire `(a, b, c)` is logical
    /// `(c, a, b)`. An all-zero sequence means the request did not come
    /// through the proxy and carries no blockseq.
    pub fn from_seq(seq: [u32; 3]) -> Option<BlkseqKey> {
        if seq == [0, 0, 0] {
            return None;
        }
        let mut key = [0u8; 12];
        key[0..4].copy_from_slice(&seq[2].to_be_bytes());
        key[4..8].copy_from_slice(&seq[0].to_be_bytes());
        key[8..12].copy_from_slice(&seq[1].to_be_bytes());
        Some(BlkseqKey::Legacy(key))
    }

    pub fn from_cnonce(bytes: &[u8]) -> BlkseqKey {
        BlkseqKey::Cnonce(bytes.to_vec())
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            BlkseqKey::Legacy(b) => b,
            BlkseqKey::Cnonce(b) => b,
        }
    }

    /// Cnonce keys get snapinfo payloads; legacy keys the RSP shapes.
    pub fn is_cnonce(&self) -> bool {
        matches!(self, BlkseqKey::Cnonce(_))
    }
}

pub fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The fixed payload written when a prepared distributed transaction
/// resolves to abort: any later resubmission of the cnonce sees the same
/// coordinator abort.
pub fn dist_abort_payload() -> FstblkPayload {
    FstblkPayload {
        body: FstblkBody::SnapInfo {
            outrc: Rcode::DistAbort.as_i32(),
            errstat: Errstat::new(
                Rcode::DistAbort.as_i32(),
                "Transaction aborted by coordinator",
            ),
            effects: QueryEffects::default(),
            rspkl: Default::default(),
            err: Default::default(),
            last_genid: 0,
        },
        epoch: epoch_now(),
    }
}

/// A response reconstructed from a stored payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayedResponse {
    pub bytes: Vec<u8>,
    pub outrc: i32,
    pub errstat: Option<Errstat>,
    pub effects: Option<QueryEffects>,
}

/// Rebuild the client response from a stored blockseq payload. `num_reqs`
/// comes from the resubmitted batch (the legacy success shape stores no op
/// count of its own); `endian` and `position_mode` come from its header.
pub fn replay_response(
    payload: &[u8],
    num_reqs: usize,
    endian: Endian,
    position_mode: bool,
) -> BlockResult<ReplayedResponse> {
    let parsed = FstblkPayload::unpack(payload)
        .map_err(|e| BlockError::Internal(format!("bad blockseq payload: {e}")))?;

    let mut bytes = Vec::new();
    let mut w = Writer::new(&mut bytes, endian, FSTBLK_MAX_BUF_LEN + 16 * num_reqs);
    match parsed.body {
        FstblkBody::RspOk { .. } => {
            pack_rsp(&mut w, num_reqs, num_reqs, 0)?;
            Ok(ReplayedResponse {
                bytes,
                outrc: Rcode::Ok.as_i32(),
                errstat: None,
                effects: None,
            })
        }
        FstblkBody::RspErr {
            num_completed,
            rcode,
        } => {
            pack_rsp(&mut w, num_reqs, num_completed as usize, rcode)?;
            Ok(ReplayedResponse {
                bytes,
                outrc: rcode,
                errstat: None,
                effects: None,
            })
        }
        FstblkBody::RspKl {
            rspkl,
            err,
            last_genid,
        } => {
            pack_rspkl(
                &mut w,
                rspkl.num_completed as usize,
                position_mode.then_some(last_genid),
                (rspkl.numerrs > 0).then_some(&err),
            )?;
            let outrc = if rspkl.numerrs > 0 {
                Rcode::BlockFailed.as_i32() + err.errcode
            } else {
                Rcode::Ok.as_i32()
            };
            Ok(ReplayedResponse {
                bytes,
                outrc,
                errstat: None,
                effects: None,
            })
        }
        FstblkBody::SnapInfo {
            outrc,
            errstat,
            effects,
            rspkl,
            err,
            last_genid,
        } => {
            pack_rspkl(
                &mut w,
                rspkl.num_completed as usize,
                position_mode.then_some(last_genid),
                (rspkl.numerrs > 0).then_some(&err),
            )?;
            Ok(ReplayedResponse {
                bytes,
                outrc,
                errstat: errstat.is_set().then_some(errstat),
                effects: Some(effects),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tessera_wire::{BlockErr, RspKl};

    #[test]
    fn all_zero_legacy_sequence_means_no_blkseq() {
        assert_eq!(BlkseqKey::from_seq([0, 0, 0]), None);
    }

    #[test]
    fn legacy_sequence_is_reordered_to_logical() {
        let key = BlkseqKey::from_seq([2, 3, 1]).unwrap();
        let mut want = [0u8; 12];
        want[3] = 1;
        want[7] = 2;
        want[11] = 3;
        assert_eq!(key.bytes(), &want);
        assert!(!key.is_cnonce());
    }

    #[test]
    fn replayed_success_matches_a_fresh_success_response() {
        let payload = FstblkPayload {
            body: FstblkBody::RspOk { fluff: 0 },
            epoch: 123,
        }
        .pack()
        .unwrap();

        let replayed = replay_response(&payload, 3, Endian::Big, false).unwrap();
        let mut fresh = Vec::new();
        let mut w = Writer::new(&mut fresh, Endian::Big, 1024);
        pack_rsp(&mut w, 3, 3, 0).unwrap();
        assert_eq!(replayed.bytes, fresh);
        assert_eq!(replayed.outrc, 0);
    }

    #[test]
    fn replayed_snapinfo_surfaces_stored_outrc_and_errstat() {
        let payload = dist_abort_payload().pack().unwrap();
        let replayed = replay_response(&payload, 1, Endian::Big, false).unwrap();
        assert_eq!(replayed.outrc, Rcode::DistAbort.as_i32());
        let errstat = replayed.errstat.unwrap();
        assert_eq!(errstat.val, Rcode::DistAbort.as_i32());
        assert!(errstat.msg.contains("coordinator"));
    }

    #[test]
    fn replayed_keyless_error_folds_into_block_failed() {
        let payload = FstblkPayload {
            body: FstblkBody::RspKl {
                rspkl: RspKl {
                    num_completed: 1,
                    numerrs: 1,
                },
                err: BlockErr {
                    blockop_num: 1,
                    errcode: Rcode::Verify.as_i32(),
                    ixnum: -1,
                },
                last_genid: 0,
            },
            epoch: 5,
        }
        .pack()
        .unwrap();
        let replayed = replay_response(&payload, 2, Endian::Big, false).unwrap();
        assert_eq!(
            replayed.outrc,
            Rcode::BlockFailed.as_i32() + Rcode::Verify.as_i32()
        );
    }
}
