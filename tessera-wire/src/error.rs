use tessera_errors::BlockError;
use thiserror::Error;

/// Decode/encode failures. Almost everything here is a client-caused
/// bad-request; the exceptions (`DuplicateSeq`, `Overflow`) are internal
/// errors so that a proxy bug is distinguishable from a malformed frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of buffer: need {need} bytes, have {have}")]
    UnexpectedEof { need: usize, have: usize },

    #[error("bad offset {0}")]
    BadOffset(u32),

    #[error("offset out of range {0}")]
    OffsetOutOfRange(u32),

    #[error("unknown request type {0}")]
    UnknownReqType(u32),

    #[error("unknown block opcode {0}")]
    UnknownOpcode(u16),

    #[error("bad number of requests {0}")]
    BadNumReqs(i64),

    #[error("op {opnum} overruns its next pointer")]
    OpOverrun { opnum: usize },

    #[error("second sequence op in one batch")]
    DuplicateSeq,

    #[error("invalid string payload")]
    BadString,

    #[error("blob {blobno} fragment out of bounds")]
    BadBlobFragment { blobno: usize },

    #[error("blob declared length {0} exceeds maximum")]
    BlobTooLarge(usize),

    #[error("response buffer overflow")]
    Overflow,

    #[error("bad field length {0}")]
    BadFieldLength(u32),
}

impl From<WireError> for BlockError {
    fn from(e: WireError) -> BlockError {
        match e {
            WireError::DuplicateSeq | WireError::Overflow => {
                BlockError::Internal(e.to_string())
            }
            WireError::BlobTooLarge(_) => BlockError::BlobTooLarge,
            _ => BlockError::BadRequest(e.to_string()),
        }
    }
}
