//! Sector I/O for dynamic and differencing images.
//!
//! Both layouts store data in fixed-size blocks that are appended to the file on first write.
//! Every block starts with a sector bitmap; a sector whose bit is clear has no local data and
//! reads as zeros here (the differencing resolver consults the parent chain before landing here).

use crate::alloc::allocate_block;
use crate::bat::BlockAllocationTable;
use crate::bitmap::SectorBitmap;
use crate::bounds::check_sectors;
use crate::header::SparseHeader;
use crate::util::{check_buffer, sector_to_byte};
use crate::{Result, StorageBackend, VhdError, VhdImage, SECTOR_SIZE};

/// Block-layout state of a dynamic or differencing image.
#[derive(Debug)]
pub struct SparseState {
    pub(crate) header: SparseHeader,
    pub(crate) bat: BlockAllocationTable,
    pub(crate) bitmap: SectorBitmap,
    sectors_per_block: u32,
    bitmap_sectors: u64,
}

impl SparseState {
    pub fn new(header: SparseHeader, bat: BlockAllocationTable) -> Result<Self> {
        let sectors_per_block = header.sectors_per_block();
        let bitmap_sectors = header.bitmap_sectors()?;
        Ok(Self {
            bitmap: SectorBitmap::new(bitmap_sectors)?,
            header,
            bat,
            sectors_per_block,
            bitmap_sectors,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn bat(&self) -> &BlockAllocationTable {
        &self.bat
    }

    pub fn bitmap(&self) -> &SectorBitmap {
        &self.bitmap
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.sectors_per_block
    }

    pub fn bitmap_sectors(&self) -> u64 {
        self.bitmap_sectors
    }

    /// Sectors covered by the BAT.
    pub fn capacity_sectors(&self) -> u64 {
        self.bat.len() as u64 * self.sectors_per_block as u64
    }

    /// Splits a virtual sector into (block index, sector within block).
    pub fn locate(&self, sector: u64) -> Result<(u32, u32)> {
        let spb = self.sectors_per_block as u64;
        let block: u32 = (sector / spb)
            .try_into()
            .map_err(|_| VhdError::CorruptImage("vhd block index out of range"))?;
        Ok((block, (sector % spb) as u32))
    }

    /// Points the bitmap cache at `block`, flushing the previous block first.
    ///
    /// A block that is already cached is not reloaded.
    pub(crate) fn select_block<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        block: u32,
    ) -> Result<()> {
        if self.bitmap.block() == Some(block) {
            return Ok(());
        }
        self.bitmap.flush(backend, &self.bat)?;
        self.bitmap.load(backend, &self.bat, block)
    }

    pub(crate) fn flush_bitmap<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        self.bitmap.flush(backend, &self.bat)
    }

    /// Byte offset of a sector's data inside an allocated block.
    fn data_offset(&self, block_sector: u64, sector_in_block: u32) -> Result<u64> {
        let sector = block_sector
            .checked_add(self.bitmap_sectors)
            .and_then(|v| v.checked_add(sector_in_block as u64))
            .ok_or(VhdError::OffsetOverflow)?;
        sector_to_byte(sector)
    }

    /// Whether `sector` holds data in this image (not in a parent).
    pub(crate) fn has_local_data<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        sector: u64,
    ) -> Result<bool> {
        let (block, sib) = self.locate(sector)?;
        self.select_block(backend, block)?;
        Ok(self.bitmap.test(sib))
    }
}

/// Reads `count` sectors starting at `offset` from a dynamic or differencing image.
///
/// Sectors without local data are returned as zeros. Returns the number of sectors truncated at
/// the end of the image.
pub fn read<B: StorageBackend>(
    image: &mut VhdImage<B>,
    offset: u64,
    count: u64,
    buf: &mut [u8],
) -> Result<u64> {
    check_buffer(buf.len(), count)?;
    let span = check_sectors(offset, count, image.total_sectors());
    let (backend, state) = image
        .sparse_parts_mut()
        .ok_or(VhdError::Unsupported("vhd image is not sparse"))?;

    for (i, sector) in (offset..offset + span.transfer).enumerate() {
        let out = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
        let (block, sib) = state.locate(sector)?;
        state.select_block(backend, block)?;

        if !state.bitmap.test(sib) {
            out.fill(0);
            continue;
        }
        let block_sector = state
            .bat
            .block_sector(block)?
            .ok_or(VhdError::CorruptImage("vhd bitmap set for sparse block"))?;
        match backend.read_at(state.data_offset(block_sector, sib)?, out) {
            Ok(()) => {}
            Err(VhdError::OutOfBounds { .. }) => {
                return Err(VhdError::CorruptImage("vhd block data truncated"));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(span.truncated)
}

/// Writes `count` sectors starting at `offset` to a dynamic or differencing image.
///
/// Unallocated blocks are materialized on demand. The bitmap of every touched block is on disk
/// when this returns. Returns the number of sectors truncated at the end of the image.
pub fn write<B: StorageBackend>(
    image: &mut VhdImage<B>,
    offset: u64,
    count: u64,
    buf: &[u8],
) -> Result<u64> {
    check_buffer(buf.len(), count)?;
    let span = check_sectors(offset, count, image.total_sectors());
    let (backend, state) = image
        .sparse_parts_mut()
        .ok_or(VhdError::Unsupported("vhd image is not sparse"))?;

    for (i, sector) in (offset..offset + span.transfer).enumerate() {
        let data = &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
        let (block, sib) = state.locate(sector)?;
        state.select_block(backend, block)?;

        let block_sector = match state.bat.block_sector(block)? {
            Some(sector) => sector,
            None => allocate_block(backend, state, block)?,
        };
        backend.write_at(state.data_offset(block_sector, sib)?, data)?;
        state.bitmap.set(sib)?;
    }

    state.flush_bitmap(backend)?;
    Ok(span.truncated)
}
