//! Checkpoint descriptor area scan
//!
//! Block zero holds a copy of the container superblock that may lag behind
//! the latest checkpoint. The descriptor area holds the superblocks of
//! recent checkpoints; the valid one with the highest transaction
//! identifier describes the current state.

use crate::object::{verify_checksum, ObjectHeader, OBJECT_TYPE_NX_SUPERBLOCK};
use crate::reader::BlockReader;
use crate::superblock::NxSuperblock;
use fsapfs_core::Result;

/// Upper bound on descriptor blocks examined
const MAX_DESCRIPTOR_BLOCKS: u64 = 65536;

/// Find the newest valid container superblock
///
/// Falls back to the block zero copy when the descriptor area holds no
/// newer valid superblock.
pub(crate) fn latest_superblock(reader: &BlockReader, block_zero: NxSuperblock) -> Result<NxSuperblock> {
    if !block_zero.has_contiguous_descriptor_area() {
        tracing::debug!("Checkpoint descriptor area is not contiguous, using block zero superblock");
        return Ok(block_zero);
    }

    let count = (block_zero.descriptor_block_count() as u64)
        .min(block_zero.block_count)
        .min(MAX_DESCRIPTOR_BLOCKS);

    let mut best = block_zero;
    let base = best.xp_desc_base;

    for index in 0..count {
        let Some(paddr) = base.checked_add(index) else {
            break;
        };

        let data = match reader.read_block(paddr) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Unable to read checkpoint descriptor block {}: {}", paddr, e);
                continue;
            }
        };

        match ObjectHeader::parse(&data) {
            Ok(header) if header.kind() == OBJECT_TYPE_NX_SUPERBLOCK => {}
            _ => continue,
        }

        if let Err(e) = verify_checksum(&data) {
            tracing::warn!("Rejecting checkpoint superblock at block {}: {}", paddr, e);
            continue;
        }

        let candidate = match NxSuperblock::parse(&data) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Rejecting checkpoint superblock at block {}: {}", paddr, e);
                continue;
            }
        };

        if candidate.uuid != best.uuid || candidate.block_size != best.block_size {
            tracing::warn!("Checkpoint superblock at block {} belongs to another container", paddr);
            continue;
        }

        if candidate.xid() > best.xid() {
            tracing::debug!("Checkpoint superblock at block {} has xid {}", paddr, candidate.xid());
            best = candidate;
        }
    }

    Ok(best)
}
