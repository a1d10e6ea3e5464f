use tracing::{debug, warn};

use crate::footer::{is_footer_cookie, VHD_FOOTER_SIZE};
use crate::sparse::SparseState;
use crate::util::{align_up_u64, write_zero_sectors, write_zeroes};
use crate::{Result, StorageBackend, VhdError, SECTOR_SIZE};

/// Zero sectors appended after every new block, matching what Windows writes.
pub const BLOCK_FILLER_SECTORS: u64 = 5;

/// Appends storage for an unallocated block and records it in the BAT.
///
/// The trailing footer is overwritten by the new block and re-appended at the new end of file.
/// If the tail does not hold a footer, the copy at offset 0 is used instead and the new block
/// is appended after whatever the tail contains. Returns the block's sector offset.
///
/// The BAT slot is written last and only then marked allocated in memory, so a failure leaves
/// the block sparse and a retry allocates it again. There is no other rollback: an I/O error
/// part-way through can leave the footer missing or duplicated, or orphan the appended region.
pub(crate) fn allocate_block<B: StorageBackend>(
    backend: &mut B,
    state: &mut SparseState,
    block: u32,
) -> Result<u64> {
    if state.bat.is_allocated(block)? {
        return Err(VhdError::CorruptImage("vhd block already allocated"));
    }

    let file_len = backend.len()?;
    let mut footer = [0u8; VHD_FOOTER_SIZE];
    let tail_footer = file_len >= VHD_FOOTER_SIZE as u64 && {
        backend.read_at(file_len - VHD_FOOTER_SIZE as u64, &mut footer)?;
        is_footer_cookie(&footer)
    };

    let mut pos = if tail_footer {
        file_len - VHD_FOOTER_SIZE as u64
    } else {
        warn!(block, file_len, "vhd footer missing at end of file; using header copy");
        match backend.read_at(0, &mut footer) {
            Ok(()) => {}
            Err(VhdError::OutOfBounds { .. }) => {
                return Err(VhdError::CorruptImage("vhd footer missing"));
            }
            Err(e) => return Err(e),
        }
        if !is_footer_cookie(&footer) {
            return Err(VhdError::CorruptImage("vhd footer missing"));
        }
        file_len
    };

    if pos % SECTOR_SIZE as u64 != 0 {
        let aligned = align_up_u64(pos, SECTOR_SIZE as u64)?;
        warn!(block, pos, aligned, "vhd end of file not sector aligned; padding");
        pos = write_zeroes(backend, pos, aligned - pos)?;
    }

    let block_sector: u32 = (pos / SECTOR_SIZE as u64)
        .try_into()
        .map_err(|_| VhdError::Unsupported("vhd block offset"))?;

    let region_sectors = state
        .bitmap_sectors()
        .checked_add(state.sectors_per_block() as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    let next = write_zero_sectors(backend, pos, region_sectors)?;
    let next = write_zero_sectors(backend, next, BLOCK_FILLER_SECTORS)?;
    backend.write_at(next, &footer)?;

    state.bat.write_entry(backend, block, block_sector)?;

    debug!(block, block_sector, "allocated vhd block");
    Ok(block_sector as u64)
}
