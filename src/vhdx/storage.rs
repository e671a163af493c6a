//! Backing storage for a container.
//!
//! A [`Storage`] is anything seekable that can be read, written, resized and
//! synced. It is implemented for [`File`], for in-memory `Cursor<Vec<u8>>`
//! buffers, for boxed trait objects (used by the parent chain) and for
//! `&mut` borrows, so a caller keeps ownership of a handle simply by lending
//! it.

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use serde::{Deserialize, Serialize};

/// Random-access backing store of a container.
pub trait Storage: Read + Write + Seek {
    /// Truncates or extends the storage to `len` bytes. New bytes read as zero.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Makes every completed write durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Current length of the storage in bytes.
    fn storage_len(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

impl Storage for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn storage_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn storage_len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn storage_len(&mut self) -> io::Result<u64> {
        (**self).storage_len()
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn storage_len(&mut self) -> io::Result<u64> {
        (**self).storage_len()
    }
}

/// Who is responsible for the final sync of the storage when the container
/// is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// The container syncs the storage on close and drops it.
    Dispose,
    /// The caller keeps responsibility, typically by lending `&mut` storage.
    None,
}

/// Access mode a container is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAccess {
    Read,
    ReadWrite,
}

impl FileAccess {
    pub fn can_write(self) -> bool {
        self == FileAccess::ReadWrite
    }
}

/// Reads exactly `buf.len()` bytes at `offset`.
pub(crate) fn read_exact_at<S: Storage + ?Sized>(
    storage: &mut S,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    storage.seek(SeekFrom::Start(offset))?;
    storage.read_exact(buf)
}

/// Writes all of `buf` at `offset`.
pub(crate) fn write_all_at<S: Storage + ?Sized>(
    storage: &mut S,
    offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    storage.seek(SeekFrom::Start(offset))?;
    storage.write_all(buf)
}

/// Writes `len` zero bytes starting at `offset`, in 1 MiB pieces.
pub(crate) fn write_zeroes_at<S: Storage + ?Sized>(
    storage: &mut S,
    mut offset: u64,
    mut len: u64,
) -> io::Result<()> {
    const CHUNK: usize = 1024 * 1024;
    let zeros = vec![0u8; CHUNK];
    storage.seek(SeekFrom::Start(offset))?;
    while len > 0 {
        let to_write = len.min(CHUNK as u64) as usize;
        storage.write_all(&zeros[..to_write])?;
        offset += to_write as u64;
        len -= to_write as u64;
    }
    debug_assert_eq!(storage.stream_position()?, offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_storage_set_len_zero_fills() {
        let mut storage = Cursor::new(vec![0xAAu8; 4]);
        Storage::set_len(&mut storage, 8).unwrap();
        assert_eq!(storage.storage_len().unwrap(), 8);
        assert_eq!(&storage.get_ref()[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn positional_helpers_round_trip() {
        let mut storage = Cursor::new(Vec::new());
        write_all_at(&mut storage, 100, b"payload").unwrap();
        assert_eq!(storage.storage_len().unwrap(), 107);

        let mut back = [0u8; 7];
        read_exact_at(&mut storage, 100, &mut back).unwrap();
        assert_eq!(&back, b"payload");

        write_zeroes_at(&mut storage, 102, 3).unwrap();
        read_exact_at(&mut storage, 100, &mut back).unwrap();
        assert_eq!(&back, b"pa\0\0\0ad");
    }

    #[test]
    fn borrowed_storage_writes_through() {
        let mut inner = Cursor::new(Vec::new());
        {
            let mut borrowed = &mut inner;
            write_all_at(&mut borrowed, 0, b"abc").unwrap();
            borrowed.sync().unwrap();
        }
        assert_eq!(inner.get_ref().as_slice(), b"abc");
    }
}
