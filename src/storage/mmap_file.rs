//! Safe wrapper around a memory-mapped file.
//!
//! All byte access goes through `with_read`/`with_write` closures taken
//! under a `parking_lot` rwlock, so a concurrent `resize` (which remaps
//! and may move the mapping) can never invalidate a slice a reader is
//! holding.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{TsdbError, TsdbResult};

#[derive(Debug)]
enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

#[derive(Debug, Default)]
struct Inner {
    file: Option<File>,
    map: Option<Map>,
    len: usize,
    read_only: bool,
}

#[derive(Debug)]
pub struct MmapFile {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl MmapFile {
    /// Creates (or truncates) the file to `len` bytes and maps it
    /// read-write. The file is sparse until written.
    pub fn create(path: &Path, len: usize) -> TsdbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        debug!(path = %path.display(), len, "created mmap file");
        Ok(MmapFile {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner {
                file: Some(file),
                map: Some(Map::ReadWrite(map)),
                len,
                read_only: false,
            }),
        })
    }

    /// Maps the entire existing file.
    pub fn open_existing(path: &Path, read_only: bool) -> TsdbResult<Self> {
        let mmap_file = MmapFile {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner::default()),
        };
        mmap_file.ensure_open(read_only)?;
        Ok(mmap_file)
    }

    /// An unopened handle; `ensure_open` maps it lazily. Intended for
    /// query paths that traverse cold files.
    pub fn closed(path: &Path) -> Self {
        MmapFile {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().map.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens and maps the file if it is not already. Reopening an
    /// already-open file for a stronger mode (write after read-only)
    /// remaps it read-write.
    pub fn ensure_open(&self, read_only: bool) -> TsdbResult<()> {
        {
            let inner = self.inner.read();
            if inner.map.is_some() && (read_only || !inner.read_only) {
                return Ok(());
            }
        }
        let mut inner = self.inner.write();
        if inner.map.is_some() && (read_only || !inner.read_only) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&self.path)?;
        let len = file.metadata()?.len() as usize;
        let map = if read_only {
            Map::ReadOnly(unsafe { MmapOptions::new().map(&file)? })
        } else {
            Map::ReadWrite(unsafe { MmapOptions::new().map_mut(&file)? })
        };
        debug!(path = %self.path.display(), len, read_only, "opened mmap file");
        *inner = Inner { file: Some(file), map: Some(map), len, read_only };
        Ok(())
    }

    /// Grows (or shrinks) the file and remaps. The mapping may move;
    /// callers never hold slices across this call because access is
    /// closure-scoped.
    pub fn resize(&self, new_len: usize) -> TsdbResult<()> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(TsdbError::Internal(format!(
                "resize of read-only file {:?}",
                self.path
            )));
        }
        if let Some(Map::ReadWrite(map)) = &inner.map {
            map.flush()?;
        }
        inner.map = None;
        let Some(file) = inner.file.as_ref() else {
            return Err(TsdbError::Internal(format!("resize of closed file {:?}", self.path)));
        };
        file.set_len(new_len as u64)?;
        let map = unsafe { MmapOptions::new().map_mut(file)? };
        inner.map = Some(Map::ReadWrite(map));
        inner.len = new_len;
        Ok(())
    }

    /// Runs `f` over the mapped bytes under the read lock.
    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> TsdbResult<R> {
        let inner = self.inner.read();
        match &inner.map {
            Some(Map::ReadWrite(map)) => Ok(f(&map[..])),
            Some(Map::ReadOnly(map)) => Ok(f(&map[..])),
            None => Err(TsdbError::Internal(format!(
                "read access to closed file {:?}",
                self.path
            ))),
        }
    }

    /// Runs `f` over the mapped bytes mutably, under the write lock.
    /// Single-writer discipline is enforced by the owning Tsdb.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> TsdbResult<R> {
        let mut inner = self.inner.write();
        match &mut inner.map {
            Some(Map::ReadWrite(map)) => Ok(f(&mut map[..])),
            Some(Map::ReadOnly(_)) => Err(TsdbError::Internal(format!(
                "write access to read-only file {:?}",
                self.path
            ))),
            None => Err(TsdbError::Internal(format!(
                "write access to closed file {:?}",
                self.path
            ))),
        }
    }

    /// msync. Async between rotations, sync at rotation boundaries.
    pub fn flush(&self, sync: bool) -> TsdbResult<()> {
        let inner = self.inner.read();
        if let Some(Map::ReadWrite(map)) = &inner.map {
            if sync {
                map.flush()?;
            } else {
                map.flush_async()?;
            }
        }
        Ok(())
    }

    /// Flushes (when writable), unmaps and closes. Idempotent.
    pub fn close(&self) -> TsdbResult<()> {
        let mut inner = self.inner.write();
        if let Some(Map::ReadWrite(map)) = &inner.map {
            map.flush()?;
        }
        if inner.map.take().is_some() {
            debug!(path = %self.path.display(), "closed mmap file");
        }
        inner.file = None;
        Ok(())
    }

    pub fn remove(&self) -> TsdbResult<()> {
        let _ = self.close();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        let file = MmapFile::create(&path, 64).unwrap();
        file.with_write(|bytes| bytes[..4].copy_from_slice(b"puls")).unwrap();
        file.flush(true).unwrap();
        file.close().unwrap();
        file.close().unwrap(); // idempotent

        let reopened = MmapFile::open_existing(&path, true).unwrap();
        assert_eq!(reopened.len(), 64);
        reopened
            .with_read(|bytes| assert_eq!(&bytes[..4], b"puls"))
            .unwrap();
        assert!(reopened.with_write(|_| ()).is_err());
    }

    #[test]
    fn test_resize_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow");

        let file = MmapFile::create(&path, 16).unwrap();
        file.with_write(|bytes| bytes[15] = 0xAB).unwrap();
        file.resize(1024).unwrap();
        assert_eq!(file.len(), 1024);
        file.with_read(|bytes| {
            assert_eq!(bytes[15], 0xAB);
            assert_eq!(bytes[1023], 0);
        })
        .unwrap();
    }

    #[test]
    fn test_lazy_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy");
        MmapFile::create(&path, 8).unwrap().close().unwrap();

        let lazy = MmapFile::closed(&path);
        assert!(!lazy.is_open());
        lazy.ensure_open(true).unwrap();
        assert!(lazy.is_open());
        assert_eq!(lazy.len(), 8);
    }
}
