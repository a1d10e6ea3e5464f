use crate::util::be_u32;
use crate::{Result, StorageBackend, VhdError};

/// BAT value of a block that has not been allocated yet.
pub const SPARSE_BLOCK: u32 = u32::MAX;

const BAT_ENTRY_SIZE: u64 = 4;

// Hard cap to avoid absurd allocations from untrusted images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB

/// In-memory copy of the block allocation table.
///
/// Each entry is either [`SPARSE_BLOCK`] or the absolute sector offset of the block's
/// bitmap+data region.
#[derive(Debug, Clone)]
pub struct BlockAllocationTable {
    table_offset: u64,
    entries: Vec<u32>,
}

impl BlockAllocationTable {
    /// Table for a freshly created image: every block unallocated.
    pub fn new_sparse(table_offset: u64, entries: usize) -> Self {
        Self {
            table_offset,
            entries: vec![SPARSE_BLOCK; entries],
        }
    }

    /// Reads `entries` big-endian slots starting at `table_offset`.
    pub fn load<B: StorageBackend>(
        backend: &mut B,
        table_offset: u64,
        entries: u64,
    ) -> Result<Self> {
        let bat_bytes = entries
            .checked_mul(BAT_ENTRY_SIZE)
            .ok_or(VhdError::OffsetOverflow)?;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(VhdError::Unsupported("vhd bat too large"));
        }
        let bat_bytes: usize = bat_bytes
            .try_into()
            .map_err(|_| VhdError::Unsupported("vhd bat too large"))?;

        let mut buf = vec![0u8; bat_bytes];
        match backend.read_at(table_offset, &mut buf) {
            Ok(()) => {}
            Err(VhdError::OutOfBounds { .. }) => {
                return Err(VhdError::CorruptImage("vhd bat truncated"));
            }
            Err(e) => return Err(e),
        }

        Ok(Self {
            table_offset,
            entries: buf.chunks_exact(4).map(be_u32).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, block: u32) -> Result<u32> {
        self.entries
            .get(block as usize)
            .copied()
            .ok_or(VhdError::CorruptImage("vhd block index out of range"))
    }

    pub fn is_allocated(&self, block: u32) -> Result<bool> {
        Ok(self.get(block)? != SPARSE_BLOCK)
    }

    /// Sector offset of an allocated block; `None` while the block is sparse.
    pub fn block_sector(&self, block: u32) -> Result<Option<u64>> {
        let entry = self.get(block)?;
        Ok((entry != SPARSE_BLOCK).then_some(entry as u64))
    }

    /// Points `block` at `sector`, on disk first.
    ///
    /// The in-memory slot only changes once the big-endian entry has been written, so a failed
    /// write leaves the block unallocated in both places.
    pub fn write_entry<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        block: u32,
        sector: u32,
    ) -> Result<()> {
        self.get(block)?;
        let offset = self
            .table_offset
            .checked_add(block as u64 * BAT_ENTRY_SIZE)
            .ok_or(VhdError::OffsetOverflow)?;
        backend.write_at(offset, &sector.to_be_bytes())?;
        self.entries[block as usize] = sector;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackend;

    #[test]
    fn write_entry_stores_big_endian_slot() {
        let mut backend = MemBackend::with_len(2048).unwrap();
        let mut bat = BlockAllocationTable::new_sparse(1024, 4);
        bat.write_entry(&mut backend, 2, 0x0102_0304).unwrap();

        assert_eq!(&backend.as_slice()[1032..1036], &[1, 2, 3, 4]);
        assert_eq!(bat.block_sector(2).unwrap(), Some(0x0102_0304));
        // Neighbouring slots are untouched.
        assert!(backend.as_slice()[1024..1032].iter().all(|b| *b == 0));
    }

    #[test]
    fn failed_entry_write_leaves_slot_sparse() {
        let mut backend = MemBackend::with_len(2048).unwrap();
        // No entry can be written this far out.
        let mut bat = BlockAllocationTable::new_sparse(u64::MAX - 2, 1);
        let err = bat.write_entry(&mut backend, 0, 9).unwrap_err();
        assert!(matches!(err, VhdError::OffsetOverflow));
        assert!(!bat.is_allocated(0).unwrap());
    }

    #[test]
    fn load_reads_sentinels_and_offsets() {
        let mut backend = MemBackend::with_len(1024).unwrap();
        backend.write_at(512, &[0xFF; 4]).unwrap();
        backend.write_at(516, &7u32.to_be_bytes()).unwrap();

        let bat = BlockAllocationTable::load(&mut backend, 512, 2).unwrap();
        assert_eq!(bat.len(), 2);
        assert!(!bat.is_allocated(0).unwrap());
        assert_eq!(bat.block_sector(1).unwrap(), Some(7));
    }

    #[test]
    fn load_past_end_is_corruption() {
        let mut backend = MemBackend::with_len(512).unwrap();
        let err = BlockAllocationTable::load(&mut backend, 512, 4).unwrap_err();
        assert!(matches!(err, VhdError::CorruptImage("vhd bat truncated")));
    }

    #[test]
    fn out_of_range_block_is_reported() {
        let bat = BlockAllocationTable::new_sparse(0, 1);
        assert!(matches!(
            bat.get(1).unwrap_err(),
            VhdError::CorruptImage("vhd block index out of range")
        ));
    }
}
