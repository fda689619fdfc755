//! One data file of a `(header, data)` pair: `page_count` pages of
//! `page_size` bytes, filled sequentially. A physical page may host
//! several logical pages at different offsets; remaining space on the
//! current page is handed to the next allocation.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::common::time::{current_time_secs, Timestamp};
use crate::common::types::{FileIndex, PageIndex, PageSize};
use crate::error::{TsdbError, TsdbResult};
use crate::storage::mmap_file::MmapFile;

/// Below this many bytes a page remainder is not worth a logical page.
pub const MIN_PAGE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct AppendState {
    /// next free physical page
    page_index: PageIndex,
    /// fill offset within the current page
    offset: PageSize,
}

#[derive(Debug)]
pub struct DataFile {
    file: MmapFile,
    id: FileIndex,
    page_size: PageSize,
    page_count: u32,
    state: Mutex<AppendState>,
    last_read: AtomicI64,
    last_write: AtomicI64,
}

/// Where an appended logical page landed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageSlot {
    pub page_index: PageIndex,
    pub offset: PageSize,
}

impl DataFile {
    pub fn create(
        path: &Path,
        id: FileIndex,
        page_size: PageSize,
        page_count: u32,
    ) -> TsdbResult<Self> {
        let file = MmapFile::create(path, page_size as usize * page_count as usize)?;
        Ok(DataFile {
            file,
            id,
            page_size,
            page_count,
            state: Mutex::new(AppendState::default()),
            last_read: AtomicI64::new(0),
            last_write: AtomicI64::new(current_time_secs()),
        })
    }

    /// `next_page_index` comes from the persisted tsdb header; appends
    /// resume on a fresh physical page after a restart.
    pub fn open_existing(
        path: &Path,
        id: FileIndex,
        page_size: PageSize,
        page_count: u32,
        next_page_index: PageIndex,
        read_only: bool,
    ) -> TsdbResult<Self> {
        let file = MmapFile::open_existing(path, read_only)?;
        Ok(DataFile {
            file,
            id,
            page_size,
            page_count,
            state: Mutex::new(AppendState { page_index: next_page_index, offset: 0 }),
            last_read: AtomicI64::new(0),
            last_write: AtomicI64::new(0),
        })
    }

    pub fn id(&self) -> FileIndex {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn ensure_open(&self, for_read: bool) -> TsdbResult<()> {
        self.file.ensure_open(for_read)
    }

    pub fn flush(&self, sync: bool) -> TsdbResult<()> {
        self.file.flush(sync)
    }

    pub fn close(&self) -> TsdbResult<()> {
        self.file.close()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    pub fn last_read(&self) -> Timestamp {
        self.last_read.load(Ordering::Relaxed)
    }

    pub fn last_write(&self) -> Timestamp {
        self.last_write.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().page_index >= self.page_count
    }

    /// The next free page index, to be mirrored into the tsdb header.
    pub fn next_page_index(&self) -> PageIndex {
        self.state.lock().page_index
    }

    /// Capacity the next logical page should be created with: the
    /// remainder of the current physical page when it is worth using.
    pub fn next_page_capacity(&self) -> usize {
        let state = self.state.lock();
        let remaining = (self.page_size - state.offset) as usize;
        if state.offset > 0 && remaining >= MIN_PAGE_CAPACITY {
            remaining
        } else {
            self.page_size as usize
        }
    }

    /// Reserves `capacity` bytes and writes the first `bytes` of the new
    /// logical page. Returns `Full` when no physical page can hold it.
    pub fn append(&self, bytes: &[u8], capacity: usize) -> TsdbResult<PageSlot> {
        debug_assert!(bytes.len() <= capacity && capacity <= self.page_size as usize);
        let mut state = self.state.lock();

        if capacity > (self.page_size - state.offset) as usize {
            state.page_index += 1;
            state.offset = 0;
        }
        if state.page_index >= self.page_count {
            return Err(TsdbError::Full(self.page_count as usize));
        }

        let slot = PageSlot { page_index: state.page_index, offset: state.offset };
        self.write_at(slot, bytes)?;

        state.offset += capacity as PageSize;
        if state.offset >= self.page_size {
            state.page_index += 1;
            state.offset = 0;
        }
        Ok(slot)
    }

    /// Truncates the file to the pages actually used and returns that
    /// count. Called at the end of compaction, when the allocation is
    /// final.
    pub fn shrink_to_fit(&self) -> TsdbResult<u32> {
        let state = self.state.lock();
        let used = state.page_index + (state.offset > 0) as u32;
        self.file.resize(used as usize * self.page_size as usize)?;
        Ok(used)
    }

    /// Rewrites a logical page in place; used when a partially flushed
    /// page keeps filling.
    pub fn write_at(&self, slot: PageSlot, bytes: &[u8]) -> TsdbResult<()> {
        let at = slot.page_index as usize * self.page_size as usize + slot.offset as usize;
        if at + bytes.len() > self.file.len() {
            // a shrunk (compacted) file grows back when late writes land
            if slot.page_index >= self.page_count {
                return Err(TsdbError::Internal(format!(
                    "write of {} bytes at {} beyond data file {:?}",
                    bytes.len(),
                    at,
                    self.file.path()
                )));
            }
            self.file
                .resize((slot.page_index + 1) as usize * self.page_size as usize)?;
        }
        self.file.with_write(|pages| pages[at..at + bytes.len()].copy_from_slice(bytes))?;
        self.last_write.store(current_time_secs(), Ordering::Relaxed);
        Ok(())
    }

    /// Copies a logical page region out of the mapping. Decoding happens
    /// on the copy so no mapping reference outlives the lock.
    pub fn read_page(&self, slot: PageSlot, len: usize) -> TsdbResult<Vec<u8>> {
        self.ensure_open(true)?;
        let at = slot.page_index as usize * self.page_size as usize + slot.offset as usize;
        if at + len > self.file.len() {
            return Err(TsdbError::Corrupted(format!(
                "page region {}+{} beyond data file {:?}",
                at,
                len,
                self.file.path()
            )));
        }
        let bytes = self.file.with_read(|pages| pages[at..at + len].to_vec())?;
        self.last_read.store(current_time_secs(), Ordering::Relaxed);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_packs_remainders() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataFile::create(&dir.path().join("data.00000"), 0, 256, 4).unwrap();

        // a full-size page
        let slot = data.append(&[1u8; 200], 256).unwrap();
        assert_eq!(slot, PageSlot { page_index: 0, offset: 0 });
        // 256 reserved, so the next page starts fresh
        assert_eq!(data.next_page_capacity(), 256);

        // a small logical page leaves a remainder worth using
        let slot = data.append(&[2u8; 100], 100).unwrap();
        assert_eq!(slot, PageSlot { page_index: 1, offset: 0 });
        assert_eq!(data.next_page_capacity(), 156);

        // the remainder is shared on the same physical page
        let slot = data.append(&[3u8; 156], 156).unwrap();
        assert_eq!(slot, PageSlot { page_index: 1, offset: 100 });

        assert_eq!(&data.read_page(slot, 156).unwrap()[..4], &[3, 3, 3, 3]);
    }

    #[test]
    fn test_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataFile::create(&dir.path().join("data.00000"), 0, 128, 2).unwrap();
        data.append(&[0u8; 128], 128).unwrap();
        data.append(&[0u8; 128], 128).unwrap();
        assert!(data.is_full());
        assert!(matches!(data.append(&[0u8; 1], 128), Err(TsdbError::Full(_))));
    }

    #[test]
    fn test_rewrite_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataFile::create(&dir.path().join("data.00000"), 0, 256, 2).unwrap();
        let slot = data.append(&[7u8; 64], 256).unwrap();
        data.write_at(slot, &[9u8; 128]).unwrap();
        let bytes = data.read_page(slot, 128).unwrap();
        assert!(bytes.iter().all(|b| *b == 9));
    }
}
