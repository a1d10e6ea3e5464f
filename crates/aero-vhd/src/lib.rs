//! Sector I/O engine for Microsoft VHD disk images.
//!
//! Images are addressed in 512-byte sectors. Three layouts are supported:
//!
//! - fixed: a flat raw image followed by a 512-byte footer ([`fixed`])
//! - dynamic: blocks appended on first write, located through the BAT ([`sparse`])
//! - differencing: a dynamic image whose unwritten sectors come from a parent ([`diff`])
//!
//! [`VhdImage`] owns one open image on top of a [`StorageBackend`]. Differencing chains are held
//! in an [`ImageSet`], which owns every image of the chain and resolves reads through parents.
//!
//! Every transfer is clamped to the geometry-derived sector count; the number of sectors that
//! did not fit is returned to the caller rather than treated as an error.

mod alloc;
mod backend;
mod bat;
mod bitmap;
mod bounds;
pub mod diff;
mod error;
pub mod fixed;
mod footer;
mod geometry;
mod header;
mod image;
mod set;
pub mod sparse;
mod util;

/// Size of a VHD sector in bytes.
pub const SECTOR_SIZE: usize = 512;

pub use alloc::BLOCK_FILLER_SECTORS;
pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use bat::{BlockAllocationTable, SPARSE_BLOCK};
pub use bitmap::SectorBitmap;
pub use bounds::{check_sectors, SectorSpan};
pub use error::{Result, VhdError};
pub use footer::{is_footer_cookie, DiskType, VhdFooter, VHD_FOOTER_SIZE};
pub use geometry::DiskGeometry;
pub use header::{SparseHeader, VHD_SPARSE_HEADER_SIZE};
pub use image::{noop_write, CreateOptions, Layout, OpenOptions, VhdImage};
pub use set::{ImageId, ImageSet};
pub use sparse::SparseState;
pub use util::write_zero_sectors;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;
