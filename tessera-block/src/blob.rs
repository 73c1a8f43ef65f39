//! Blob fragment assembly. Fragments arrive as QBLOB ops ahead of the
//! write op that consumes them; a slot is complete only when every declared
//! byte has been collected.

use tessera_errors::{BlockError, BlockResult};
use tessera_wire::{MAX_BLOBS, MAX_BLOB_LENGTH};

#[derive(Debug, Default)]
struct BlobBuf {
    exists: bool,
    length: usize,
    collected: usize,
    data: Vec<u8>,
}

/// The per-batch blob slots. Freed after the consuming op, or wholesale at
/// the end of the transaction.
#[derive(Debug)]
pub struct BlobBufferSet {
    slots: Vec<BlobBuf>,
}

impl Default for BlobBufferSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBufferSet {
    pub fn new() -> BlobBufferSet {
        BlobBufferSet {
            slots: (0..MAX_BLOBS).map(|_| BlobBuf::default()).collect(),
        }
    }

    /// Accumulate one fragment. The first fragment allocates the slot and
    /// pins the declared length; later fragments must agree with it.
    pub fn add_fragment(
        &mut self,
        blobno: u32,
        length: usize,
        frag_offset: usize,
        frag: &[u8],
    ) -> BlockResult<()> {
        let idx = blobno as usize;
        if idx >= MAX_BLOBS {
            return Err(BlockError::BadRequest(format!("blob slot {idx} out of range")));
        }
        if length > MAX_BLOB_LENGTH {
            return Err(BlockError::BlobTooLarge);
        }
        let slot = &mut self.slots[idx];
        if !slot.exists {
            slot.exists = true;
            slot.length = length;
            slot.collected = 0;
            slot.data = vec![0; length];
        } else if slot.length != length {
            return Err(BlockError::BadRequest(format!(
                "blob {idx} fragments disagree on length ({} vs {length})",
                slot.length
            )));
        }
        if frag_offset + frag.len() > slot.length {
            return Err(BlockError::BadRequest(format!(
                "blob {idx} fragment overruns declared length"
            )));
        }
        slot.data[frag_offset..frag_offset + frag.len()].copy_from_slice(frag);
        slot.collected += frag.len();
        Ok(())
    }

    /// True when every allocated slot is fully collected.
    pub fn all_complete(&self) -> bool {
        self.slots
            .iter()
            .all(|s| !s.exists || s.collected == s.length)
    }

    pub fn any_exists(&self) -> bool {
        self.slots.iter().any(|s| s.exists)
    }

    /// Hand the collected blobs to the consuming op and free the slots.
    /// A partially-collected slot is a malformed batch.
    pub fn take_for_op(&mut self) -> BlockResult<Vec<(usize, Vec<u8>)>> {
        if !self.all_complete() {
            return Err(BlockError::BadRequest(
                "write op references incomplete blob".into(),
            ));
        }
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.exists {
                out.push((i, std::mem::take(&mut slot.data)));
                *slot = BlobBuf::default();
            }
        }
        Ok(out)
    }

    /// Drop everything, complete or not.
    pub fn free_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = BlobBuf::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_assemble_in_any_order() {
        let mut set = BlobBufferSet::new();
        set.add_fragment(0, 6, 3, b"def").unwrap();
        set.add_fragment(0, 6, 0, b"abc").unwrap();
        assert!(set.all_complete());
        let blobs = set.take_for_op().unwrap();
        assert_eq!(blobs, vec![(0, b"abcdef".to_vec())]);
        assert!(!set.any_exists());
    }

    #[test]
    fn incomplete_blob_blocks_the_consuming_op() {
        let mut set = BlobBufferSet::new();
        set.add_fragment(1, 8, 0, b"abc").unwrap();
        assert!(!set.all_complete());
        assert!(set.take_for_op().is_err());
    }

    #[test]
    fn length_disagreement_is_rejected() {
        let mut set = BlobBufferSet::new();
        set.add_fragment(0, 8, 0, b"abcd").unwrap();
        assert!(set.add_fragment(0, 10, 4, b"efgh").is_err());
    }

    #[test]
    fn slot_bounds_are_enforced() {
        let mut set = BlobBufferSet::new();
        assert!(set
            .add_fragment(MAX_BLOBS as u32, 4, 0, b"1234")
            .is_err());
    }
}
