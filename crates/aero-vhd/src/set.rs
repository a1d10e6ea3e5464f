use crate::footer::DiskType;
use crate::{diff, Result, StorageBackend, VhdError, VhdImage};

/// Handle to an image owned by an [`ImageSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(usize);

impl ImageId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Slot<B> {
    image: VhdImage<B>,
    parent: Option<ImageId>,
}

/// Owner of every open image taking part in differencing chains.
///
/// Children refer to their parent by [`ImageId`]. A parent must already be in the set when its
/// child is inserted, so ids strictly decrease along a chain and every chain ends at a fixed or
/// dynamic image. One parent may back any number of children.
pub struct ImageSet<B> {
    slots: Vec<Slot<B>>,
}

impl<B> Default for ImageSet<B> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<B: StorageBackend> ImageSet<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds a fixed or dynamic image.
    pub fn insert(&mut self, image: VhdImage<B>) -> Result<ImageId> {
        if image.disk_type() == DiskType::Differencing {
            return Err(VhdError::ParentUnavailable);
        }
        Ok(self.push(image, None))
    }

    /// Adds a differencing image backed by `parent`.
    ///
    /// The parent's unique id must match the one recorded in the child's header.
    pub fn insert_differencing(&mut self, image: VhdImage<B>, parent: ImageId) -> Result<ImageId> {
        let expected = image
            .parent_unique_id()
            .ok_or(VhdError::Unsupported("vhd image is not differencing"))?;
        if self.get(parent)?.footer().unique_id != expected {
            return Err(VhdError::ParentMismatch);
        }
        Ok(self.push(image, Some(parent)))
    }

    fn push(&mut self, image: VhdImage<B>, parent: Option<ImageId>) -> ImageId {
        let id = ImageId(self.slots.len());
        self.slots.push(Slot { image, parent });
        id
    }

    pub fn get(&self, id: ImageId) -> Result<&VhdImage<B>> {
        self.slots
            .get(id.0)
            .map(|slot| &slot.image)
            .ok_or(VhdError::UnknownImage(id.0))
    }

    pub fn get_mut(&mut self, id: ImageId) -> Result<&mut VhdImage<B>> {
        self.slots
            .get_mut(id.0)
            .map(|slot| &mut slot.image)
            .ok_or(VhdError::UnknownImage(id.0))
    }

    pub fn parent(&self, id: ImageId) -> Result<Option<ImageId>> {
        self.slots
            .get(id.0)
            .map(|slot| slot.parent)
            .ok_or(VhdError::UnknownImage(id.0))
    }

    /// Reads through the differencing chain of `id` when needed.
    pub fn read_sectors(
        &mut self,
        id: ImageId,
        offset: u64,
        count: u64,
        buf: &mut [u8],
    ) -> Result<u64> {
        if self.get(id)?.disk_type() == DiskType::Differencing {
            return diff::read(self, id, offset, count, buf);
        }
        self.get_mut(id)?.read_sectors(offset, count, buf)
    }

    pub fn write_sectors(&mut self, id: ImageId, offset: u64, count: u64, buf: &[u8]) -> Result<u64> {
        self.get_mut(id)?.write_sectors(offset, count, buf)
    }

    pub fn flush(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.image.flush()?;
        }
        Ok(())
    }

    pub fn into_images(self) -> Vec<VhdImage<B>> {
        self.slots.into_iter().map(|slot| slot.image).collect()
    }

    pub(crate) fn slot_mut(&mut self, id: ImageId) -> Result<(&mut VhdImage<B>, Option<ImageId>)> {
        self.slots
            .get_mut(id.0)
            .map(|slot| (&mut slot.image, slot.parent))
            .ok_or(VhdError::UnknownImage(id.0))
    }
}
