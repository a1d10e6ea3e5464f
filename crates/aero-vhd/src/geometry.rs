/// Cylinder/head/sector geometry recorded in the VHD footer.
///
/// The product of the three fields is the addressable sector count of the image; it may be
/// slightly smaller than `current_size / 512` because CHS cannot express every size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;

impl DiskGeometry {
    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }

    /// Standard VHD CHS derivation for a disk of `size_bytes`.
    pub fn from_size(size_bytes: u64) -> Self {
        let total = (size_bytes / crate::SECTOR_SIZE as u64).min(MAX_CHS_SECTORS);

        let (spt, heads, cyl_times_heads) = if total >= 65535 * 16 * 63 {
            (255u64, 16u64, total / 255)
        } else {
            let mut spt = 17u64;
            let mut cth = total / spt;
            let mut heads = cth.div_ceil(1024).max(4);
            if cth >= heads * 1024 || heads > 16 {
                spt = 31;
                heads = 16;
                cth = total / spt;
            }
            if cth >= heads * 1024 {
                spt = 63;
                heads = 16;
                cth = total / spt;
            }
            (spt, heads, cth)
        };

        Self {
            cylinders: (cyl_times_heads / heads).min(u16::MAX as u64) as u16,
            heads: heads as u8,
            sectors_per_track: spt as u8,
        }
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 4] {
        let c = self.cylinders.to_be_bytes();
        [c[0], c[1], self.heads, self.sectors_per_track]
    }

    pub(crate) fn from_be_bytes(raw: &[u8]) -> Self {
        Self {
            cylinders: crate::util::be_u16(&raw[0..2]),
            heads: raw[2],
            sectors_per_track: raw[3],
        }
    }
}
