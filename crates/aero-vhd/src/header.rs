use crate::footer::VHD_FORMAT_VERSION;
use crate::util::{align_up_u64, be_u32, be_u64};
use crate::{Result, VhdError, SECTOR_SIZE};

pub const VHD_SPARSE_HEADER_SIZE: usize = 1024;

const VHD_DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";

/// Dynamic/differencing disk header ("cxsparse").
#[derive(Debug, Clone)]
pub struct SparseHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_unique_id: [u8; 16],
    pub parent_timestamp: u32,
}

impl SparseHeader {
    pub fn parse(raw: &[u8; VHD_SPARSE_HEADER_SIZE]) -> Result<Self> {
        if raw[..8] != VHD_DYNAMIC_COOKIE {
            return Err(VhdError::CorruptImage(
                "vhd dynamic header cookie mismatch",
            ));
        }

        let expected = be_u32(&raw[36..40]);
        if expected != vhd_checksum_header(raw) {
            return Err(VhdError::CorruptImage(
                "vhd dynamic header checksum mismatch",
            ));
        }

        let table_offset = be_u64(&raw[16..24]);
        let header_version = be_u32(&raw[24..28]);
        if header_version != VHD_FORMAT_VERSION {
            return Err(VhdError::Unsupported("vhd dynamic header version"));
        }
        let max_table_entries = be_u32(&raw[28..32]);
        let block_size = be_u32(&raw[32..36]);

        if !table_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptImage("vhd bat offset misaligned"));
        }
        if max_table_entries == 0 {
            return Err(VhdError::CorruptImage("vhd max_table_entries is zero"));
        }
        if block_size == 0 || !(block_size as u64).is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptImage("vhd block_size invalid"));
        }

        let mut parent_unique_id = [0u8; 16];
        parent_unique_id.copy_from_slice(&raw[40..56]);

        Ok(Self {
            table_offset,
            max_table_entries,
            block_size,
            parent_unique_id,
            parent_timestamp: be_u32(&raw[56..60]),
        })
    }

    pub fn to_bytes(&self) -> [u8; VHD_SPARSE_HEADER_SIZE] {
        let mut raw = [0u8; VHD_SPARSE_HEADER_SIZE];
        raw[0..8].copy_from_slice(&VHD_DYNAMIC_COOKIE);
        raw[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        raw[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        raw[24..28].copy_from_slice(&VHD_FORMAT_VERSION.to_be_bytes());
        raw[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        raw[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        raw[40..56].copy_from_slice(&self.parent_unique_id);
        raw[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        let checksum = vhd_checksum_header(&raw);
        raw[36..40].copy_from_slice(&checksum.to_be_bytes());
        raw
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }

    /// Size of a block's sector bitmap on disk, in sectors.
    pub fn bitmap_sectors(&self) -> Result<u64> {
        let bitmap_bytes = (self.sectors_per_block() as u64).div_ceil(8);
        Ok(align_up_u64(bitmap_bytes, SECTOR_SIZE as u64)? / SECTOR_SIZE as u64)
    }
}

fn vhd_checksum_header(raw: &[u8; VHD_SPARSE_HEADER_SIZE]) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (36..40).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}
