//! Reads through differencing chains.
//!
//! Each sector is resolved on its own: starting at the requested image, walk towards the root
//! until an image whose bitmap marks the sector as present, or a dynamic/fixed image. Different
//! sectors of one request may resolve at different depths, so the walk restarts every time.

use crate::bounds::check_sectors;
use crate::footer::DiskType;
use crate::util::check_buffer;
use crate::{fixed, sparse, ImageId, ImageSet, Result, StorageBackend, VhdError, SECTOR_SIZE};

/// Reads `count` sectors at `offset` from image `id`, faulting absent sectors through its
/// parents. Returns the number of sectors truncated at the end of the image.
pub fn read<B: StorageBackend>(
    set: &mut ImageSet<B>,
    id: ImageId,
    offset: u64,
    count: u64,
    buf: &mut [u8],
) -> Result<u64> {
    check_buffer(buf.len(), count)?;
    let span = check_sectors(offset, count, set.get(id)?.total_sectors());

    for (i, sector) in (offset..offset + span.transfer).enumerate() {
        let out = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
        let owner = resolve(set, id, sector)?;
        let image = set.get_mut(owner)?;
        let truncated = match image.disk_type() {
            DiskType::Fixed => fixed::read(image, sector, 1, out)?,
            DiskType::Dynamic | DiskType::Differencing => sparse::read(image, sector, 1, out)?,
        };
        if truncated != 0 {
            // Ancestor smaller than the child.
            out.fill(0);
        }
    }

    Ok(span.truncated)
}

/// Finds the image in the chain of `id` that holds `sector`.
fn resolve<B: StorageBackend>(set: &mut ImageSet<B>, id: ImageId, sector: u64) -> Result<ImageId> {
    let mut current = id;
    loop {
        let (image, parent) = set.slot_mut(current)?;
        if image.disk_type() != DiskType::Differencing || sector >= image.total_sectors() {
            return Ok(current);
        }
        let (backend, state) = image
            .sparse_parts_mut()
            .ok_or(VhdError::CorruptImage("vhd differencing image without block table"))?;
        if state.has_local_data(backend, sector)? {
            return Ok(current);
        }
        current = parent.ok_or(VhdError::ParentUnavailable)?;
    }
}
