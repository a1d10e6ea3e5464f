use tracing::{debug, warn};

use crate::bat::BlockAllocationTable;
use crate::footer::{DiskType, FooterFields, VhdFooter, VHD_FOOTER_SIZE};
use crate::geometry::DiskGeometry;
use crate::header::{SparseHeader, VHD_SPARSE_HEADER_SIZE};
use crate::sparse::SparseState;
use crate::util::align_up_u64;
use crate::{fixed, sparse, Result, StorageBackend, VhdError, SECTOR_SIZE};

const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

// Layout of freshly created sparse images: footer copy, sparse header, then the BAT.
const SPARSE_HEADER_OFFSET: u64 = VHD_FOOTER_SIZE as u64;
const BAT_OFFSET: u64 = SPARSE_HEADER_OFFSET + VHD_SPARSE_HEADER_SIZE as u64;

/// How an image is opened.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Route every write to [`noop_write`] instead of the image.
    pub read_only: bool,
}

/// Parameters for creating a new image.
///
/// The unique id and timestamp are recorded verbatim; generating them is up to the caller.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Virtual disk size. Ignored for differencing images, which inherit the parent's.
    pub size_bytes: u64,
    /// Block size of dynamic/differencing images.
    pub block_size: u32,
    /// Overrides the standard CHS derivation from `size_bytes`.
    pub geometry: Option<DiskGeometry>,
    pub unique_id: [u8; 16],
    /// Seconds since 2000-01-01 00:00:00 UTC.
    pub timestamp: u32,
    pub creator_app: [u8; 4],
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            size_bytes: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            geometry: None,
            unique_id: [0; 16],
            timestamp: 0,
            creator_app: *b"aero",
        }
    }
}

/// On-disk layout of an open image, fixed when the image is opened.
#[derive(Debug)]
pub enum Layout {
    Fixed,
    Dynamic(SparseState),
    Differencing(SparseState),
}

/// An open VHD image.
///
/// Differencing images need their parent chain for reads; put them in an
/// [`ImageSet`](crate::ImageSet) to resolve it.
pub struct VhdImage<B> {
    backend: B,
    footer: VhdFooter,
    layout: Layout,
    read_only: bool,
}

impl<B: StorageBackend> VhdImage<B> {
    pub fn open(mut backend: B, options: OpenOptions) -> Result<Self> {
        let len = backend.len()?;
        if len < VHD_FOOTER_SIZE as u64 {
            return Err(VhdError::CorruptImage("vhd file too small"));
        }
        let footer = read_footer(&mut backend, len)?;
        let total_sectors = footer.geometry.total_sectors();

        let layout = match footer.disk_type {
            DiskType::Fixed => {
                let required_len = total_sectors
                    .checked_mul(SECTOR_SIZE as u64)
                    .and_then(|v| v.checked_add(VHD_FOOTER_SIZE as u64))
                    .ok_or(VhdError::CorruptImage("vhd current_size overflow"))?;
                if len < required_len {
                    return Err(VhdError::CorruptImage("vhd fixed disk truncated"));
                }
                Layout::Fixed
            }
            DiskType::Dynamic | DiskType::Differencing => {
                let state = open_sparse(&mut backend, &footer, len)?;
                if total_sectors > state.capacity_sectors() {
                    return Err(VhdError::CorruptImage("vhd geometry exceeds bat"));
                }
                if footer.disk_type == DiskType::Dynamic {
                    Layout::Dynamic(state)
                } else {
                    Layout::Differencing(state)
                }
            }
        };

        debug!(
            disk_type = ?footer.disk_type,
            total_sectors,
            read_only = options.read_only,
            "opened vhd image"
        );
        Ok(Self {
            backend,
            footer,
            layout,
            read_only: options.read_only,
        })
    }

    /// Creates a fixed image: `size_bytes` of zeros followed by the footer.
    pub fn create_fixed(mut backend: B, options: CreateOptions) -> Result<Self> {
        let geometry = validate_size(&options)?;
        let footer = VhdFooter::build(FooterFields {
            data_offset: u64::MAX,
            timestamp: options.timestamp,
            creator_app: options.creator_app,
            size: options.size_bytes,
            geometry,
            disk_type: DiskType::Fixed,
            unique_id: options.unique_id,
        })?;

        backend.set_len(0)?;
        backend.set_len(options.size_bytes)?;
        backend.write_at(options.size_bytes, footer.as_bytes())?;
        Self::open(backend, OpenOptions::default())
    }

    /// Creates an empty dynamic image.
    pub fn create_dynamic(backend: B, options: CreateOptions) -> Result<Self> {
        let geometry = validate_size(&options)?;
        create_sparse(
            backend,
            &options,
            options.size_bytes,
            geometry,
            DiskType::Dynamic,
            [0; 16],
            0,
        )
    }

    /// Creates an empty differencing image on top of `parent`.
    ///
    /// Size and geometry are taken from the parent; `options.size_bytes` and
    /// `options.geometry` are ignored.
    pub fn create_differencing<P: StorageBackend>(
        backend: B,
        parent: &VhdImage<P>,
        options: CreateOptions,
    ) -> Result<Self> {
        let parent_footer = parent.footer();
        create_sparse(
            backend,
            &options,
            parent_footer.current_size,
            parent_footer.geometry,
            DiskType::Differencing,
            parent_footer.unique_id,
            parent_footer.timestamp,
        )
    }

    /// Reads `count` sectors at `offset` into `buf`, returning the truncated sector count.
    ///
    /// Fails with [`VhdError::ParentUnavailable`] for differencing images.
    pub fn read_sectors(&mut self, offset: u64, count: u64, buf: &mut [u8]) -> Result<u64> {
        match self.disk_type() {
            DiskType::Fixed => fixed::read(self, offset, count, buf),
            DiskType::Dynamic => sparse::read(self, offset, count, buf),
            DiskType::Differencing => Err(VhdError::ParentUnavailable),
        }
    }

    /// Writes `count` sectors at `offset` from `buf`, returning the truncated sector count.
    ///
    /// Differencing images always receive the data themselves; the parent is never written.
    pub fn write_sectors(&mut self, offset: u64, count: u64, buf: &[u8]) -> Result<u64> {
        if self.read_only {
            return noop_write(self, offset, count, buf);
        }
        match self.disk_type() {
            DiskType::Fixed => fixed::write(self, offset, count, buf),
            DiskType::Dynamic | DiskType::Differencing => sparse::write(self, offset, count, buf),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some((backend, state)) = self.sparse_parts_mut() {
            state.flush_bitmap(backend)?;
        }
        self.backend.flush()
    }

    /// Whether a block has storage. Fixed images are fully allocated.
    pub fn is_block_allocated(&self, block: u32) -> Result<bool> {
        match self.sparse_state() {
            Some(state) => state.bat().is_allocated(block),
            None => Ok(true),
        }
    }

    pub(crate) fn sparse_parts_mut(&mut self) -> Option<(&mut B, &mut SparseState)> {
        match &mut self.layout {
            Layout::Fixed => None,
            Layout::Dynamic(state) | Layout::Differencing(state) => {
                Some((&mut self.backend, state))
            }
        }
    }
}

impl<B> VhdImage<B> {
    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.footer.geometry
    }

    /// Addressable sectors: cylinders × heads × sectors per track.
    pub fn total_sectors(&self) -> u64 {
        self.footer.geometry.total_sectors()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn block_size(&self) -> Option<u32> {
        self.sparse_state().map(|s| s.header().block_size)
    }

    pub fn sparse_state(&self) -> Option<&SparseState> {
        match &self.layout {
            Layout::Fixed => None,
            Layout::Dynamic(state) | Layout::Differencing(state) => Some(state),
        }
    }

    /// Unique id of the parent recorded in a differencing image's header.
    pub fn parent_unique_id(&self) -> Option<[u8; 16]> {
        match &self.layout {
            Layout::Differencing(state) => Some(state.header().parent_unique_id),
            _ => None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

/// Write entry point for read-only images: accepts the request and stores nothing.
pub fn noop_write<B>(_image: &mut VhdImage<B>, _offset: u64, _count: u64, _buf: &[u8]) -> Result<u64> {
    Ok(0)
}

fn read_footer<B: StorageBackend>(backend: &mut B, len: u64) -> Result<VhdFooter> {
    let mut raw = [0u8; VHD_FOOTER_SIZE];
    backend.read_at(len - VHD_FOOTER_SIZE as u64, &mut raw)?;
    let tail_err = match VhdFooter::parse(raw) {
        Ok(footer) => return Ok(footer),
        Err(e) => e,
    };

    // Dynamic images keep a copy of the footer at offset 0.
    backend.read_at(0, &mut raw)?;
    match VhdFooter::parse(raw) {
        Ok(footer) => {
            warn!(error = %tail_err, "vhd footer at end of file invalid; using copy at offset 0");
            Ok(footer)
        }
        Err(_) => Err(tail_err),
    }
}

fn open_sparse<B: StorageBackend>(
    backend: &mut B,
    footer: &VhdFooter,
    len: u64,
) -> Result<SparseState> {
    if footer.data_offset == u64::MAX {
        return Err(VhdError::CorruptImage("vhd dynamic header offset invalid"));
    }
    if !footer.data_offset.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(VhdError::CorruptImage(
            "vhd dynamic header offset misaligned",
        ));
    }
    let header_end = footer
        .data_offset
        .checked_add(VHD_SPARSE_HEADER_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    if header_end > len {
        return Err(VhdError::CorruptImage("vhd dynamic header truncated"));
    }

    let mut raw_header = [0u8; VHD_SPARSE_HEADER_SIZE];
    backend.read_at(footer.data_offset, &mut raw_header)?;
    let header = SparseHeader::parse(&raw_header)?;

    // Only the entries needed for the virtual size are loaded.
    let required_entries = footer.current_size.div_ceil(header.block_size as u64);
    if (header.max_table_entries as u64) < required_entries {
        return Err(VhdError::CorruptImage("vhd bat too small"));
    }
    let bat = BlockAllocationTable::load(backend, header.table_offset, required_entries)?;
    SparseState::new(header, bat)
}

fn validate_size(options: &CreateOptions) -> Result<DiskGeometry> {
    let size = options.size_bytes;
    if size == 0 || !size.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(VhdError::InvalidConfig(
            "size_bytes must be a non-zero multiple of 512",
        ));
    }
    let geometry = options
        .geometry
        .unwrap_or_else(|| DiskGeometry::from_size(size));
    if geometry.total_sectors() == 0 {
        return Err(VhdError::InvalidConfig("geometry has no sectors"));
    }
    if geometry.total_sectors() > size / SECTOR_SIZE as u64 {
        return Err(VhdError::InvalidConfig("geometry exceeds size_bytes"));
    }
    Ok(geometry)
}

fn create_sparse<B: StorageBackend>(
    mut backend: B,
    options: &CreateOptions,
    size: u64,
    geometry: DiskGeometry,
    disk_type: DiskType,
    parent_unique_id: [u8; 16],
    parent_timestamp: u32,
) -> Result<VhdImage<B>> {
    let block_size = options.block_size;
    if block_size == 0 || !block_size.is_multiple_of(SECTOR_SIZE as u32) {
        return Err(VhdError::InvalidConfig(
            "block_size must be a non-zero multiple of 512",
        ));
    }
    let entries: u32 = size
        .div_ceil(block_size as u64)
        .try_into()
        .map_err(|_| VhdError::InvalidConfig("too many blocks"))?;
    let bat_bytes = align_up_u64(entries as u64 * 4, SECTOR_SIZE as u64)?;
    let bat_len: usize = bat_bytes
        .try_into()
        .map_err(|_| VhdError::InvalidConfig("too many blocks"))?;

    let footer = VhdFooter::build(FooterFields {
        data_offset: SPARSE_HEADER_OFFSET,
        timestamp: options.timestamp,
        creator_app: options.creator_app,
        size,
        geometry,
        disk_type,
        unique_id: options.unique_id,
    })?;
    let header = SparseHeader {
        table_offset: BAT_OFFSET,
        max_table_entries: entries,
        block_size,
        parent_unique_id,
        parent_timestamp,
    };

    backend.set_len(0)?;
    backend.write_at(0, footer.as_bytes())?;
    backend.write_at(SPARSE_HEADER_OFFSET, &header.to_bytes())?;
    backend.write_at(BAT_OFFSET, &vec![0xFF; bat_len])?;
    backend.write_at(BAT_OFFSET + bat_bytes, footer.as_bytes())?;

    debug!(?disk_type, size, block_size, entries, "created sparse vhd image");
    VhdImage::open(backend, OpenOptions::default())
}
