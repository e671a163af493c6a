//! RAW disk image abstraction
//!
//! This module provides the [`RAW`] struct, a flat disk image: a plain file
//! whose length is the virtual disk capacity. It implements
//! [`std::io::Read`], [`std::io::Write`] and [`std::io::Seek`].
//!

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::debug;

use crate::error::{checked_range, DiskError, Result};
use crate::vhdx::FileAccess;

/// A flat image over a [`File`].
///
/// The capacity is fixed when the image is opened; reads stop and writes
/// fail at the end of the image instead of growing the file.
pub struct RAW {
    /// The underlying file handle.
    pub file: File,
    capacity: u64,
    access: FileAccess,
}

impl RAW {
    /// Creates (or truncates) the file at `path` and sizes it to `capacity`
    /// bytes. The content reads as zero.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::InvalidArgument`] for a zero capacity, and any
    /// [`io::Error`] produced while creating or resizing the file.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<RAW> {
        if capacity == 0 {
            return Err(DiskError::InvalidArgument("capacity"));
        }
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        debug!("Created RAW image {} of {} bytes", path.display(), capacity);
        Ok(RAW {
            file,
            capacity,
            access: FileAccess::ReadWrite,
        })
    }

    /// Opens the file at `path` and returns a new [`RAW`] wrapper whose
    /// capacity is the current file length.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`OpenOptions::open`], e.g. when
    /// the path does not exist or the process lacks sufficient permissions.
    pub fn open(path: impl AsRef<Path>, access: FileAccess) -> Result<RAW> {
        let file = OpenOptions::new()
            .read(true)
            .write(access.can_write())
            .open(path.as_ref())?;
        let capacity = file.metadata()?.len();
        Ok(RAW {
            file,
            capacity,
            access,
        })
    }

    /// Size of the image in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn access(&self) -> FileAccess {
        self.access
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::OutOfRange`] when the range ends past the
    /// capacity, and propagates I/O errors.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes all of `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::ReadOnly`] on an image opened for reading,
    /// [`DiskError::OutOfRange`] when the range ends past the capacity, and
    /// propagates I/O errors.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::ReadOnly("RAW image opened for reading"));
        }
        checked_range(offset, data.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Duplicates the underlying file handle. The new handle has a
    /// *separate* seek position.
    ///
    /// # Errors
    ///
    /// Propagates the error of [`File::try_clone`], usually a file
    /// descriptor limit.
    pub fn try_clone(&self) -> Result<RAW> {
        Ok(RAW {
            file: self.file.try_clone()?,
            capacity: self.capacity,
            access: self.access,
        })
    }

    fn remaining(&mut self) -> io::Result<(u64, u64)> {
        let position = self.file.stream_position()?;
        Ok((position, self.capacity.saturating_sub(position)))
    }
}

impl Read for RAW {
    /// Reads from the current position, stopping at the end of the image.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (_, remaining) = self.remaining()?;
        let len = (buf.len() as u64).min(remaining) as usize;
        self.file.read(&mut buf[..len])
    }
}

impl Write for RAW {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.access.can_write() {
            return Err(DiskError::ReadOnly("RAW image opened for reading").into());
        }
        let (position, remaining) = self.remaining()?;
        if remaining == 0 {
            return Err(DiskError::OutOfRange {
                offset: position,
                len: buf.len() as u64,
                capacity: self.capacity,
            }
            .into());
        }
        let len = (buf.len() as u64).min(remaining) as usize;
        self.file.write(&buf[..len])
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.access.can_write() {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl Seek for RAW {
    /// Seeks within the underlying file, delegating to [`File::seek`].
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_sizes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        let raw = RAW::create(&path, 64 * 1024).unwrap();
        assert_eq!(raw.capacity(), 64 * 1024);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 1024);
    }

    #[test]
    fn writes_do_not_grow_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        let mut raw = RAW::create(&path, 4096).unwrap();
        raw.write_at(4090, b"edge!!").unwrap();
        assert!(matches!(
            raw.write_at(4095, b"ab"),
            Err(DiskError::OutOfRange { .. })
        ));

        raw.seek(SeekFrom::Start(4094)).unwrap();
        assert_eq!(raw.write(b"xyz").unwrap(), 2);
        assert!(raw.write(b"z").is_err());

        let mut back = Vec::new();
        raw.seek(SeekFrom::Start(4090)).unwrap();
        raw.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"edgexy");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn read_only_image_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        RAW::create(&path, 4096).unwrap();
        let mut raw = RAW::open(&path, FileAccess::Read).unwrap();
        assert!(matches!(raw.write_at(0, b"a"), Err(DiskError::ReadOnly(_))));
        let mut buf = [1u8; 16];
        raw.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
