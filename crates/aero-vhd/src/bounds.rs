/// Result of clamping a sector request to an image's capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorSpan {
    /// Sectors that will actually be transferred.
    pub transfer: u64,
    /// Requested sectors past the end of the image.
    pub truncated: u64,
}

/// Clamps `count` sectors starting at `offset` so the transfer never runs past `total`.
///
/// `transfer + truncated == count` always holds. A request starting at or beyond `total`
/// transfers nothing.
pub fn check_sectors(offset: u64, count: u64, total: u64) -> SectorSpan {
    let available = total.saturating_sub(offset);
    let transfer = count.min(available);
    SectorSpan {
        transfer,
        truncated: count - transfer,
    }
}
