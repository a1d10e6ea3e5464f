use crate::{Result, StorageBackend, VhdError, SECTOR_SIZE};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(VhdError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(VhdError::OffsetOverflow)
}

/// Byte offset of `sector`.
pub fn sector_to_byte(sector: u64) -> Result<u64> {
    sector
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)
}

/// Byte length of `sectors` sectors, as a buffer length.
pub fn sectors_to_len(sectors: u64) -> Result<usize> {
    let bytes = sector_to_byte(sectors)?;
    usize::try_from(bytes).map_err(|_| VhdError::OffsetOverflow)
}

/// Rejects caller buffers that cannot hold `count` sectors.
pub fn check_buffer(len: usize, count: u64) -> Result<()> {
    let required = sectors_to_len(count)?;
    if len < required {
        return Err(VhdError::BufferTooSmall { len, required });
    }
    Ok(())
}

/// Writes `count` zero-filled sectors starting at `offset`.
///
/// Returns the offset just past the written sectors.
pub fn write_zero_sectors<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
    count: u64,
) -> Result<u64> {
    write_zeroes(backend, offset, sector_to_byte(count)?)
}

/// Writes `len` zero bytes starting at `offset`, returning the offset just past them.
pub fn write_zeroes<B: StorageBackend>(
    backend: &mut B,
    mut offset: u64,
    mut len: u64,
) -> Result<u64> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0u8; CHUNK];
    while len > 0 {
        let to_write = len.min(CHUNK as u64) as usize;
        backend.write_at(offset, &buf[..to_write])?;
        offset = offset
            .checked_add(to_write as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        len -= to_write as u64;
    }
    Ok(offset)
}

pub fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackend;

    #[test]
    fn align_up_u64_supports_non_power_of_two_alignments() {
        assert_eq!(align_up_u64(0, 10).unwrap(), 0);
        assert_eq!(align_up_u64(20, 10).unwrap(), 20);
        assert_eq!(align_up_u64(1, 10).unwrap(), 10);
        assert_eq!(align_up_u64(12, 10).unwrap(), 20);
    }

    #[test]
    fn align_up_u64_reports_overflow() {
        // u64::MAX is not 10-byte aligned and cannot be rounded up without overflowing.
        assert!(matches!(
            align_up_u64(u64::MAX, 10).unwrap_err(),
            VhdError::OffsetOverflow
        ));
        assert!(matches!(
            align_up_u64(1, 0).unwrap_err(),
            VhdError::OffsetOverflow
        ));
    }

    #[test]
    fn write_zero_sectors_advances_by_whole_sectors() {
        let mut backend = MemBackend::from_vec(vec![0xAA; 4 * SECTOR_SIZE]);
        let next = write_zero_sectors(&mut backend, 512, 2).unwrap();
        assert_eq!(next, 3 * SECTOR_SIZE as u64);

        let data = backend.as_slice();
        assert!(data[..SECTOR_SIZE].iter().all(|b| *b == 0xAA));
        assert!(data[SECTOR_SIZE..3 * SECTOR_SIZE].iter().all(|b| *b == 0));
        assert!(data[3 * SECTOR_SIZE..].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn write_zero_sectors_grows_backend() {
        let mut backend = MemBackend::new();
        let next = write_zero_sectors(&mut backend, 0, 200).unwrap();
        assert_eq!(next, 200 * SECTOR_SIZE as u64);
        assert_eq!(backend.len().unwrap(), next);
    }

    #[test]
    fn write_zeroes_splits_long_runs_into_chunks() {
        let len = 2 * 64 * 1024 + 3;
        let mut backend = MemBackend::from_vec(vec![0xAA; len as usize + 10]);
        let next = write_zeroes(&mut backend, 5, len).unwrap();
        assert_eq!(next, 5 + len);

        let data = backend.as_slice();
        assert!(data[..5].iter().all(|b| *b == 0xAA));
        assert!(data[5..next as usize].iter().all(|b| *b == 0));
        assert!(data[next as usize..].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn check_buffer_rejects_short_buffers() {
        check_buffer(1024, 2).unwrap();
        let err = check_buffer(1023, 2).unwrap_err();
        assert!(matches!(
            err,
            VhdError::BufferTooSmall {
                len: 1023,
                required: 1024
            }
        ));
    }
}
