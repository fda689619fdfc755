//! The per-Tsdb index: a dense array of `index_entry` records indexed by
//! `TimeSeriesId`, mapping every series to the head of its page chain.
//!
//! The second `(file2, header2)` pair points at the first page whose data
//! falls into the second half of the Tsdb range, cutting query walks in
//! half for large windows.

use std::path::Path;

use crate::common::types::{
    FileIndex, HeaderIndex, RollupIndex, TimeSeriesId, INVALID_FILE_INDEX, INVALID_HEADER_INDEX,
    INVALID_ROLLUP_INDEX,
};
use crate::error::TsdbResult;
use crate::storage::mmap_file::MmapFile;

pub const INDEX_ENTRY_SIZE: usize = 13;
const GROW_ENTRIES: usize = 4096;

const FLAG_OUT_OF_ORDER: u8 = 0x01;
const FLAG_ROLLUP_OUT_OF_ORDER: u8 = 0x02;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct IndexEntry {
    pub flags: u8,
    pub file_index: FileIndex,
    pub header_index: HeaderIndex,
    pub file_index2: FileIndex,
    pub header_index2: HeaderIndex,
    pub rollup_index: RollupIndex,
}

impl Default for IndexEntry {
    fn default() -> Self {
        IndexEntry {
            flags: 0,
            file_index: INVALID_FILE_INDEX,
            header_index: INVALID_HEADER_INDEX,
            file_index2: INVALID_FILE_INDEX,
            header_index2: INVALID_HEADER_INDEX,
            rollup_index: INVALID_ROLLUP_INDEX,
        }
    }
}

impl IndexEntry {
    pub fn is_out_of_order(&self) -> bool {
        self.flags & FLAG_OUT_OF_ORDER != 0
    }

    pub fn has_first(&self) -> bool {
        self.file_index != INVALID_FILE_INDEX
    }

    pub fn has_second(&self) -> bool {
        self.file_index2 != INVALID_FILE_INDEX
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0] = self.flags;
        out[1..3].copy_from_slice(&self.file_index.to_le_bytes());
        out[3..5].copy_from_slice(&self.header_index.to_le_bytes());
        out[5..7].copy_from_slice(&self.file_index2.to_le_bytes());
        out[7..9].copy_from_slice(&self.header_index2.to_le_bytes());
        out[9..13].copy_from_slice(&self.rollup_index.to_le_bytes());
    }

    fn read_from(data: &[u8]) -> Self {
        IndexEntry {
            flags: data[0],
            file_index: u16::from_le_bytes(data[1..3].try_into().unwrap()),
            header_index: u16::from_le_bytes(data[3..5].try_into().unwrap()),
            file_index2: u16::from_le_bytes(data[5..7].try_into().unwrap()),
            header_index2: u16::from_le_bytes(data[7..9].try_into().unwrap()),
            rollup_index: u32::from_le_bytes(data[9..13].try_into().unwrap()),
        }
    }
}

#[derive(Debug)]
pub struct IndexFile {
    file: MmapFile,
}

impl IndexFile {
    pub fn create(path: &Path) -> TsdbResult<Self> {
        let file = MmapFile::create(path, GROW_ENTRIES * INDEX_ENTRY_SIZE)?;
        let index = IndexFile { file };
        index.init_range(0, GROW_ENTRIES)?;
        Ok(index)
    }

    pub fn open_existing(path: &Path, read_only: bool) -> TsdbResult<Self> {
        Ok(IndexFile { file: MmapFile::open_existing(path, read_only)? })
    }

    pub fn closed(path: &Path) -> Self {
        IndexFile { file: MmapFile::closed(path) }
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

    pub fn entry_count(&self) -> usize {
        self.file.len() / INDEX_ENTRY_SIZE
    }

    fn init_range(&self, from_entry: usize, to_entry: usize) -> TsdbResult<()> {
        let template = IndexEntry::default();
        self.file.with_write(|bytes| {
            for i in from_entry..to_entry {
                template.write_to(&mut bytes[i * INDEX_ENTRY_SIZE..(i + 1) * INDEX_ENTRY_SIZE]);
            }
        })
    }

    /// Grows the array in 4096-entry chunks until `id` is addressable; the
    /// new tail is filled with invalid sentinels.
    pub fn ensure_capacity(&self, id: TimeSeriesId) -> TsdbResult<()> {
        let needed = id as usize + 1;
        let current = self.entry_count();
        if needed <= current {
            return Ok(());
        }
        let new_count = needed.div_ceil(GROW_ENTRIES) * GROW_ENTRIES;
        self.file.resize(new_count * INDEX_ENTRY_SIZE)?;
        self.init_range(current, new_count)
    }

    pub fn get_entry(&self, id: TimeSeriesId) -> TsdbResult<IndexEntry> {
        if id as usize >= self.entry_count() {
            return Ok(IndexEntry::default());
        }
        self.file.with_read(|bytes| {
            let at = id as usize * INDEX_ENTRY_SIZE;
            IndexEntry::read_from(&bytes[at..at + INDEX_ENTRY_SIZE])
        })
    }

    fn update_entry(
        &self,
        id: TimeSeriesId,
        update: impl FnOnce(&mut IndexEntry),
    ) -> TsdbResult<()> {
        self.ensure_capacity(id)?;
        self.file.with_write(|bytes| {
            let at = id as usize * INDEX_ENTRY_SIZE;
            let mut entry = IndexEntry::read_from(&bytes[at..at + INDEX_ENTRY_SIZE]);
            update(&mut entry);
            entry.write_to(&mut bytes[at..at + INDEX_ENTRY_SIZE]);
        })
    }

    pub fn set_indices(
        &self,
        id: TimeSeriesId,
        file_index: FileIndex,
        header_index: HeaderIndex,
    ) -> TsdbResult<()> {
        self.update_entry(id, |entry| {
            entry.file_index = file_index;
            entry.header_index = header_index;
        })
    }

    pub fn set_indices2(
        &self,
        id: TimeSeriesId,
        file_index: FileIndex,
        header_index: HeaderIndex,
    ) -> TsdbResult<()> {
        self.update_entry(id, |entry| {
            entry.file_index2 = file_index;
            entry.header_index2 = header_index;
        })
    }

    pub fn get_indices(&self, id: TimeSeriesId) -> TsdbResult<Option<(FileIndex, HeaderIndex)>> {
        let entry = self.get_entry(id)?;
        Ok(entry.has_first().then_some((entry.file_index, entry.header_index)))
    }

    pub fn get_indices2(&self, id: TimeSeriesId) -> TsdbResult<Option<(FileIndex, HeaderIndex)>> {
        let entry = self.get_entry(id)?;
        Ok(entry.has_second().then_some((entry.file_index2, entry.header_index2)))
    }

    pub fn get_out_of_order(&self, id: TimeSeriesId) -> TsdbResult<bool> {
        Ok(self.get_entry(id)?.is_out_of_order())
    }

    pub fn set_out_of_order(&self, id: TimeSeriesId, ooo: bool) -> TsdbResult<()> {
        self.update_entry(id, |entry| {
            if ooo {
                entry.flags |= FLAG_OUT_OF_ORDER;
            } else {
                entry.flags &= !FLAG_OUT_OF_ORDER;
            }
        })
    }

    pub fn get_rollup_out_of_order(&self, id: TimeSeriesId) -> TsdbResult<bool> {
        Ok(self.get_entry(id)?.flags & FLAG_ROLLUP_OUT_OF_ORDER != 0)
    }

    pub fn set_rollup_out_of_order(&self, id: TimeSeriesId, ooo: bool) -> TsdbResult<()> {
        self.update_entry(id, |entry| {
            if ooo {
                entry.flags |= FLAG_ROLLUP_OUT_OF_ORDER;
            } else {
                entry.flags &= !FLAG_ROLLUP_OUT_OF_ORDER;
            }
        })
    }

    pub fn get_rollup_index(&self, id: TimeSeriesId) -> TsdbResult<RollupIndex> {
        Ok(self.get_entry(id)?.rollup_index)
    }

    pub fn set_rollup_index(&self, id: TimeSeriesId, rollup_index: RollupIndex) -> TsdbResult<()> {
        self.update_entry(id, |entry| entry.rollup_index = rollup_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_and_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexFile::create(&dir.path().join("index")).unwrap();
        assert_eq!(index.entry_count(), 4096);

        // untouched entries read as invalid
        assert!(index.get_indices(4095).unwrap().is_none());
        assert!(!index.get_out_of_order(100).unwrap());

        // writing past the end grows in 4096-entry chunks
        index.set_indices(5000, 2, 17).unwrap();
        assert_eq!(index.entry_count(), 8192);
        assert_eq!(index.get_indices(5000).unwrap(), Some((2, 17)));
        assert!(index.get_indices(5001).unwrap().is_none());
    }

    #[test]
    fn test_flags_and_second_indices() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexFile::create(&dir.path().join("index")).unwrap();

        index.set_indices(3, 0, 5).unwrap();
        index.set_indices2(3, 1, 0).unwrap();
        index.set_out_of_order(3, true).unwrap();

        let entry = index.get_entry(3).unwrap();
        assert_eq!((entry.file_index, entry.header_index), (0, 5));
        assert_eq!(index.get_indices2(3).unwrap(), Some((1, 0)));
        assert!(entry.is_out_of_order());
        assert_eq!(entry.rollup_index, INVALID_ROLLUP_INDEX);

        // reopening sees the same state
        index.close().unwrap();
        let reopened = IndexFile::open_existing(&dir.path().join("index"), true).unwrap();
        assert!(reopened.get_out_of_order(3).unwrap());
        assert_eq!(reopened.get_indices(3).unwrap(), Some((0, 5)));
    }
}
