//! Sector I/O for fixed images: a flat raw image followed by the footer.

use crate::bounds::check_sectors;
use crate::util::{check_buffer, sector_to_byte, sectors_to_len};
use crate::{Result, StorageBackend, VhdError, VhdImage};

/// Reads `count` sectors starting at `offset`; returns the number of truncated sectors.
pub fn read<B: StorageBackend>(
    image: &mut VhdImage<B>,
    offset: u64,
    count: u64,
    buf: &mut [u8],
) -> Result<u64> {
    check_buffer(buf.len(), count)?;
    let span = check_sectors(offset, count, image.total_sectors());
    if span.transfer == 0 {
        return Ok(span.truncated);
    }
    let len = sectors_to_len(span.transfer)?;
    match image
        .backend_mut()
        .read_at(sector_to_byte(offset)?, &mut buf[..len])
    {
        Ok(()) => {}
        Err(VhdError::OutOfBounds { .. }) => {
            return Err(VhdError::CorruptImage("vhd fixed disk truncated"));
        }
        Err(e) => return Err(e),
    }
    Ok(span.truncated)
}

/// Writes `count` sectors starting at `offset`; returns the number of truncated sectors.
pub fn write<B: StorageBackend>(
    image: &mut VhdImage<B>,
    offset: u64,
    count: u64,
    buf: &[u8],
) -> Result<u64> {
    check_buffer(buf.len(), count)?;
    let span = check_sectors(offset, count, image.total_sectors());
    if span.transfer == 0 {
        return Ok(span.truncated);
    }
    let len = sectors_to_len(span.transfer)?;
    image
        .backend_mut()
        .write_at(sector_to_byte(offset)?, &buf[..len])?;
    Ok(span.truncated)
}
