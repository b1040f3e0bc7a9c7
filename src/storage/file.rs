//! Offset-addressed backing file
//!
//! Every read and write names an absolute byte offset. I/O runs on the
//! blocking pool with positional syscalls, so concurrent callers never share
//! a cursor and never wait on each other inside the handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::errors::{StorageError, StorageResult};

/// Shared handle to the single database file.
#[derive(Debug, Clone)]
pub struct FileHandle {
    file: Arc<File>,
    path: PathBuf,
}

impl FileHandle {
    /// Opens the file at `path`, creating it (and missing parent directories)
    /// when it does not exist.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let owned = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            if let Some(parent) = owned.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&owned)
        })
        .await
        .map_err(join_error)
        .and_then(|r| r)
        .map_err(|e| {
            StorageError::io_error(format!("Failed to open database file: {}", path.display()), e)
        })?;

        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || f(&file))
            .await
            .map_err(join_error)?
    }

    /// Reads exactly `len` bytes at `offset`.
    pub async fn read_bytes(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.read_into(offset, vec![0u8; len]).await
    }

    /// Fills `buf` from `offset` and hands it back. Lets pooled buffers be
    /// reused without an extra allocation.
    pub async fn read_into(&self, offset: u64, mut buf: Vec<u8>) -> StorageResult<Vec<u8>> {
        self.blocking(move |file| {
            read_exact_at(file, &mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| StorageError::io_at_offset(offset, "read failed", e))
    }

    /// Writes `data` at `offset`, extending the file if needed.
    pub async fn write_bytes(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let owned = data.to_vec();
        self.blocking(move |file| write_all_at(file, &owned, offset))
            .await
            .map_err(|e| StorageError::io_at_offset(offset, "write failed", e))
    }

    /// Writes `len` zero bytes at `offset`.
    pub async fn write_zeros(&self, offset: u64, len: usize) -> StorageResult<()> {
        self.blocking(move |file| write_all_at(file, &vec![0u8; len], offset))
            .await
            .map_err(|e| StorageError::io_at_offset(offset, "zero fill failed", e))
    }

    pub async fn read_bool(&self, offset: u64) -> StorageResult<bool> {
        let bytes = self.read_bytes(offset, 1).await?;
        Ok(bytes[0] != 0)
    }

    pub async fn write_bool(&self, offset: u64, value: bool) -> StorageResult<()> {
        self.write_bytes(offset, &[u8::from(value)]).await
    }

    pub async fn read_i64(&self, offset: u64) -> StorageResult<i64> {
        let bytes = self.read_bytes(offset, 8).await?;
        Ok(i64::from_le_bytes(to_array(&bytes)))
    }

    pub async fn write_i64(&self, offset: u64, value: i64) -> StorageResult<()> {
        self.write_bytes(offset, &value.to_le_bytes()).await
    }

    pub async fn read_u64(&self, offset: u64) -> StorageResult<u64> {
        let bytes = self.read_bytes(offset, 8).await?;
        Ok(u64::from_le_bytes(to_array(&bytes)))
    }

    pub async fn write_u64(&self, offset: u64, value: u64) -> StorageResult<()> {
        self.write_bytes(offset, &value.to_le_bytes()).await
    }

    pub async fn read_u32(&self, offset: u64) -> StorageResult<u32> {
        let bytes = self.read_bytes(offset, 4).await?;
        Ok(u32::from_le_bytes(to_array(&bytes)))
    }

    pub async fn write_u32(&self, offset: u64, value: u32) -> StorageResult<()> {
        self.write_bytes(offset, &value.to_le_bytes()).await
    }

    /// Current length of the backing file in bytes.
    pub async fn len(&self) -> StorageResult<u64> {
        self.blocking(|file| file.metadata().map(|m| m.len()))
            .await
            .map_err(|e| StorageError::io_error("Failed to read file metadata", e))
    }

    /// Flushes file content and metadata to disk.
    pub async fn sync(&self) -> StorageResult<()> {
        self.blocking(|file| file.sync_all())
            .await
            .map_err(|e| StorageError::io_error("fsync failed", e))
    }
}

/// Copies a little-endian field out of a byte slice.
pub(crate) fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
