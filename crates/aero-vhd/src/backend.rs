use std::fs::File;
use std::path::Path;

use crate::{Result, VhdError};

/// Byte-addressed random-access storage an image lives in.
///
/// All transfers are positional: an implementation never relies on a cursor left behind by a
/// previous call. Reads past the end fail with [`VhdError::OutOfBounds`]; writes past the end
/// grow the storage.
pub trait StorageBackend {
    fn len(&mut self) -> Result<u64>;
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// In-memory backend, mainly for tests and scratch images.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len: usize = len
            .try_into()
            .map_err(|_| VhdError::Unsupported("mem backend too large"))?;
        Ok(Self { data: vec![0; len] })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let start: usize = offset.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        let end = start.checked_add(len).ok_or(VhdError::OffsetOverflow)?;
        Ok((start, end))
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len
            .try_into()
            .map_err(|_| VhdError::Unsupported("mem backend too large"))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        if end > self.data.len() {
            return Err(VhdError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`StorageBackend`] over a host file.
///
/// Uses positional I/O where the platform offers it so the file's own cursor is left alone.
pub struct StdFileBackend {
    file: File,
    read_only: bool,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            read_only: false,
        }
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }

    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(VhdError::NotSupported("read-only backend".to_string()));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(offset))?;
        let res = self.file.read_exact(buf);
        self.file.seek(SeekFrom::Start(saved))?;
        res
    }

    #[cfg(not(unix))]
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(offset))?;
        let res = self.file.write_all(buf);
        self.file.seek(SeekFrom::Start(saved))?;
        res
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        let capacity = self.len()?;
        if end > capacity {
            return Err(VhdError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity,
            });
        }
        self.read_exact_at(offset, buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        offset
            .checked_add(buf.len() as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        self.ensure_writable()?;
        self.write_all_at(offset, buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_read_oob_returns_out_of_bounds() {
        let mut backend = MemBackend::with_len(1024).unwrap();
        let mut buf = [0u8; 200];
        let err = backend.read_at(900, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            VhdError::OutOfBounds {
                offset: 900,
                len: 200,
                capacity: 1024
            }
        ));
    }

    #[test]
    fn mem_backend_write_past_end_grows() {
        let mut backend = MemBackend::new();
        backend.write_at(10, b"abc").unwrap();
        assert_eq!(backend.len().unwrap(), 13);
        assert_eq!(&backend.as_slice()[10..], b"abc");
        assert!(backend.as_slice()[..10].iter().all(|b| *b == 0));
    }

    #[test]
    fn mem_backend_offset_overflow_is_reported() {
        let mut backend = MemBackend::new();
        let err = backend.write_at(u64::MAX, &[0u8; 2]).unwrap_err();
        assert!(matches!(err, VhdError::OffsetOverflow));
    }
}
