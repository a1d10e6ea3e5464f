use tracing::trace;

use crate::bat::BlockAllocationTable;
use crate::util::{sector_to_byte, sectors_to_len};
use crate::{Result, StorageBackend, VhdError};

// Hard cap to avoid absurd allocations from untrusted images.
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

/// Single-block cache of a sparse image's per-block sector bitmaps.
///
/// One bit per sector, most significant bit first. A set bit means the sector holds data in
/// this image; a clear bit means it defers to the parent (or reads as zeros).
///
/// Only one block is resident at a time. Callers must [`flush`](Self::flush) before
/// [`load`](Self::load)ing a different block, otherwise pending bit updates are lost.
#[derive(Debug)]
pub struct SectorBitmap {
    buf: Vec<u8>,
    block: Option<u32>,
    dirty: bool,
}

impl SectorBitmap {
    pub fn new(bitmap_sectors: u64) -> Result<Self> {
        let len = sectors_to_len(bitmap_sectors)?;
        if len as u64 > MAX_BITMAP_BYTES {
            return Err(VhdError::Unsupported("vhd bitmap too large"));
        }
        Ok(Self {
            buf: vec![0; len],
            block: None,
            dirty: false,
        })
    }

    /// Block currently held by the cache.
    pub fn block(&self) -> Option<u32> {
        self.block
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Points the cache at `block`.
    ///
    /// Unallocated blocks get an all-zero bitmap without touching storage.
    pub fn load<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        bat: &BlockAllocationTable,
        block: u32,
    ) -> Result<()> {
        debug_assert!(!self.dirty, "bitmap repointed without flush");
        match bat.block_sector(block)? {
            Some(sector) => match backend.read_at(sector_to_byte(sector)?, &mut self.buf) {
                Ok(()) => {}
                Err(VhdError::OutOfBounds { .. }) => {
                    return Err(VhdError::CorruptImage("vhd block bitmap truncated"));
                }
                Err(e) => return Err(e),
            },
            None => self.buf.fill(0),
        }
        self.block = Some(block);
        self.dirty = false;
        Ok(())
    }

    /// Writes the cached bitmap back to its block if it was modified.
    pub fn flush<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        bat: &BlockAllocationTable,
    ) -> Result<()> {
        let Some(block) = self.block else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let sector = bat
            .block_sector(block)?
            .ok_or(VhdError::CorruptImage("vhd dirty bitmap for sparse block"))?;
        trace!(block, sector, "flushing sector bitmap");
        backend.write_at(sector_to_byte(sector)?, &self.buf)?;
        self.dirty = false;
        Ok(())
    }

    pub fn test(&self, sector_in_block: u32) -> bool {
        let byte = (sector_in_block / 8) as usize;
        self.buf
            .get(byte)
            .is_some_and(|b| b & (0x80u8 >> (sector_in_block % 8)) != 0)
    }

    /// Marks a sector of the cached block as present.
    pub fn set(&mut self, sector_in_block: u32) -> Result<()> {
        let byte = (sector_in_block / 8) as usize;
        let slot = self
            .buf
            .get_mut(byte)
            .ok_or(VhdError::CorruptImage("vhd bitmap too small"))?;
        let mask = 0x80u8 >> (sector_in_block % 8);
        if *slot & mask == 0 {
            *slot |= mask;
            self.dirty = true;
        }
        Ok(())
    }
}
