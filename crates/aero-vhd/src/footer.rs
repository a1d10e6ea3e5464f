use crate::geometry::DiskGeometry;
use crate::util::{be_u32, be_u64};
use crate::{Result, VhdError, SECTOR_SIZE};

pub const VHD_FOOTER_SIZE: usize = 512;

const VHD_FOOTER_COOKIE: [u8; 8] = *b"conectix";
const VHD_FEATURES_RESERVED: u32 = 2;
pub(crate) const VHD_FORMAT_VERSION: u32 = 0x0001_0000;

/// Disk type field of the footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            2 => Some(Self::Fixed),
            3 => Some(Self::Dynamic),
            4 => Some(Self::Differencing),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Fixed => 2,
            Self::Dynamic => 3,
            Self::Differencing => 4,
        }
    }
}

/// Returns true if `buf` starts with the footer cookie.
pub fn is_footer_cookie(buf: &[u8]) -> bool {
    buf.len() >= VHD_FOOTER_COOKIE.len() && buf[..VHD_FOOTER_COOKIE.len()] == VHD_FOOTER_COOKIE
}

/// Parsed VHD footer, kept together with its raw bytes so it can be re-appended verbatim.
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub data_offset: u64,
    pub timestamp: u32,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub unique_id: [u8; 16],
    raw: [u8; VHD_FOOTER_SIZE],
}

/// Values needed to lay out a new footer.
pub(crate) struct FooterFields {
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub unique_id: [u8; 16],
}

impl VhdFooter {
    pub fn parse(raw: [u8; VHD_FOOTER_SIZE]) -> Result<Self> {
        if !is_footer_cookie(&raw) {
            return Err(VhdError::CorruptImage("vhd footer cookie mismatch"));
        }

        let expected = be_u32(&raw[64..68]);
        let actual = vhd_checksum_footer(&raw);
        if expected != actual {
            return Err(VhdError::CorruptImage("vhd footer checksum mismatch"));
        }

        let disk_type = DiskType::from_raw(be_u32(&raw[60..64]))
            .ok_or(VhdError::Unsupported("vhd disk type"))?;
        let current_size = be_u64(&raw[48..56]);
        if current_size == 0 || !current_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptImage("vhd current_size invalid"));
        }

        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&raw[68..84]);

        Ok(Self {
            data_offset: be_u64(&raw[16..24]),
            timestamp: be_u32(&raw[24..28]),
            current_size,
            geometry: DiskGeometry::from_be_bytes(&raw[56..60]),
            disk_type,
            unique_id,
            raw,
        })
    }

    pub(crate) fn build(fields: FooterFields) -> Result<Self> {
        let mut raw = [0u8; VHD_FOOTER_SIZE];
        raw[0..8].copy_from_slice(&VHD_FOOTER_COOKIE);
        raw[8..12].copy_from_slice(&VHD_FEATURES_RESERVED.to_be_bytes());
        raw[12..16].copy_from_slice(&VHD_FORMAT_VERSION.to_be_bytes());
        raw[16..24].copy_from_slice(&fields.data_offset.to_be_bytes());
        raw[24..28].copy_from_slice(&fields.timestamp.to_be_bytes());
        raw[28..32].copy_from_slice(&fields.creator_app);
        raw[32..36].copy_from_slice(&VHD_FORMAT_VERSION.to_be_bytes());
        raw[36..40].copy_from_slice(b"Wi2k");
        raw[40..48].copy_from_slice(&fields.size.to_be_bytes());
        raw[48..56].copy_from_slice(&fields.size.to_be_bytes());
        raw[56..60].copy_from_slice(&fields.geometry.to_be_bytes());
        raw[60..64].copy_from_slice(&fields.disk_type.to_raw().to_be_bytes());
        raw[68..84].copy_from_slice(&fields.unique_id);

        let checksum = vhd_checksum_footer(&raw);
        raw[64..68].copy_from_slice(&checksum.to_be_bytes());
        Self::parse(raw)
    }

    pub fn as_bytes(&self) -> &[u8; VHD_FOOTER_SIZE] {
        &self.raw
    }
}

pub(crate) fn vhd_checksum_footer(raw: &[u8; VHD_FOOTER_SIZE]) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (64..68).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}
