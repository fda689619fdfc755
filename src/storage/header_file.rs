//! One header file of a `(header, data)` pair: the `tsdb_header` followed
//! by an array of `page_info_on_disk` records of length `page_count`.

use std::path::Path;

use tracing::warn;

use crate::common::time::TimeRange;
use crate::common::types::{FileIndex, HeaderIndex, INVALID_HEADER_INDEX};
use crate::compress::CompressorVersion;
use crate::error::{TsdbError, TsdbResult};
use crate::storage::mmap_file::MmapFile;
use crate::storage::page::{PageHeader, TsdbHeader, PAGE_INFO_SIZE, TSDB_HEADER_SIZE};

#[derive(Debug)]
pub struct HeaderFile {
    file: MmapFile,
    id: FileIndex,
    page_count: u32,
}

impl HeaderFile {
    pub fn create(
        path: &Path,
        id: FileIndex,
        page_count: u32,
        page_size: u16,
        compressor: CompressorVersion,
        millisecond: bool,
        range: &TimeRange,
    ) -> TsdbResult<Self> {
        let len = TSDB_HEADER_SIZE + page_count as usize * PAGE_INFO_SIZE;
        let file = MmapFile::create(path, len)?;
        let header = TsdbHeader::new(page_count, page_size, compressor, millisecond, range);
        file.with_write(|bytes| header.write_to(&mut bytes[..TSDB_HEADER_SIZE]))?;
        Ok(HeaderFile { file, id, page_count })
    }

    /// Opens an existing header file, validating and repairing the header
    /// index: a crash can leave the index pointing past claimed-but-empty
    /// slots, which are rewound so the chain stays consistent.
    pub fn open_existing(path: &Path, id: FileIndex, read_only: bool) -> TsdbResult<Self> {
        let file = MmapFile::open_existing(path, read_only)?;
        let header = file.with_read(|bytes| TsdbHeader::read_from(&bytes[..TSDB_HEADER_SIZE]))?;
        let expected = TSDB_HEADER_SIZE + header.page_count as usize * PAGE_INFO_SIZE;
        if file.len() != expected {
            return Err(TsdbError::Corrupted(format!(
                "header file {:?}: {} bytes, expected {}",
                path,
                file.len(),
                expected
            )));
        }
        let header_file = HeaderFile { file, id, page_count: header.page_count };
        if !read_only {
            header_file.rewind_empty_tail(&header)?;
        }
        Ok(header_file)
    }

    fn rewind_empty_tail(&self, header: &TsdbHeader) -> TsdbResult<()> {
        let mut rewound = header.header_index;
        while rewound > 0 {
            let page = self.get_page_header((rewound - 1) as HeaderIndex)?;
            if !page.is_empty() {
                break;
            }
            rewound -= 1;
        }
        if rewound != header.header_index {
            warn!(
                file = self.id,
                from = header.header_index,
                to = rewound,
                "rewinding header index past empty slots"
            );
            self.update_tsdb_header(|h| h.header_index = rewound)?;
        }
        Ok(())
    }

    pub fn id(&self) -> FileIndex {
        self.id
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn path(&self) -> &Path {
        self.file.path()
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

    pub fn get_tsdb_header(&self) -> TsdbResult<TsdbHeader> {
        self.file
            .with_read(|bytes| TsdbHeader::read_from(&bytes[..TSDB_HEADER_SIZE]))
    }

    pub fn update_tsdb_header(&self, update: impl FnOnce(&mut TsdbHeader)) -> TsdbResult<()> {
        self.file.with_write(|bytes| {
            let mut header = TsdbHeader::read_from(&bytes[..TSDB_HEADER_SIZE]);
            update(&mut header);
            header.write_to(&mut bytes[..TSDB_HEADER_SIZE]);
        })
    }

    pub fn compressor_version(&self) -> TsdbResult<CompressorVersion> {
        Ok(self.get_tsdb_header()?.compressor_version())
    }

    /// Reserves the next header slot. Returns `INVALID_HEADER_INDEX` when
    /// the array is exhausted, prompting the Tsdb to start a new pair.
    pub fn new_header_index(&self) -> TsdbResult<HeaderIndex> {
        let mut claimed = INVALID_HEADER_INDEX;
        self.update_tsdb_header(|header| {
            if header.header_index < header.page_count {
                claimed = header.header_index as HeaderIndex;
                header.header_index += 1;
            }
        })?;
        Ok(claimed)
    }

    pub fn is_full(&self) -> TsdbResult<bool> {
        let header = self.get_tsdb_header()?;
        Ok(header.header_index >= header.page_count)
    }

    pub fn get_page_header(&self, header_idx: HeaderIndex) -> TsdbResult<PageHeader> {
        if header_idx as u32 >= self.page_count {
            return Err(TsdbError::Corrupted(format!(
                "header index {} out of bounds ({} pages)",
                header_idx, self.page_count
            )));
        }
        self.file.with_read(|bytes| {
            let at = TSDB_HEADER_SIZE + header_idx as usize * PAGE_INFO_SIZE;
            PageHeader::read_from(&bytes[at..at + PAGE_INFO_SIZE])
        })
    }

    pub fn set_page_header(&self, header_idx: HeaderIndex, page: &PageHeader) -> TsdbResult<()> {
        if header_idx as u32 >= self.page_count {
            return Err(TsdbError::Internal(format!(
                "header index {} out of bounds ({} pages)",
                header_idx, self.page_count
            )));
        }
        self.file.with_write(|bytes| {
            let at = TSDB_HEADER_SIZE + header_idx as usize * PAGE_INFO_SIZE;
            page.write_to(&mut bytes[at..at + PAGE_INFO_SIZE]);
        })
    }

    /// Links the chain: the previous page of the series now points at the
    /// freshly persisted one. Called only after the new page is durable.
    pub fn update_next(
        &self,
        prev_header_idx: HeaderIndex,
        this_file_idx: FileIndex,
        this_header_idx: HeaderIndex,
    ) -> TsdbResult<()> {
        let mut page = self.get_page_header(prev_header_idx)?;
        page.next_file = this_file_idx;
        page.next_header = this_header_idx;
        self.set_page_header(prev_header_idx, &page)
    }

    /// Number of used page headers, optionally only out-of-order ones.
    pub fn count_pages(&self, ooo_only: bool) -> TsdbResult<usize> {
        let header = self.get_tsdb_header()?;
        let mut count = 0;
        for idx in 0..header.header_index {
            let page = self.get_page_header(idx as HeaderIndex)?;
            if !ooo_only || page.is_out_of_order() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_header_file(dir: &Path) -> HeaderFile {
        let range = TimeRange::new(0, 86_400);
        HeaderFile::create(
            &dir.join("header.00000"),
            0,
            8,
            4096,
            CompressorVersion::V2,
            false,
            &range,
        )
        .unwrap()
    }

    #[test]
    fn test_slot_reservation_until_full() {
        let dir = tempfile::tempdir().unwrap();
        let hf = new_header_file(dir.path());

        for expected in 0..8u16 {
            assert_eq!(hf.new_header_index().unwrap(), expected);
        }
        assert!(hf.is_full().unwrap());
        assert_eq!(hf.new_header_index().unwrap(), INVALID_HEADER_INDEX);
    }

    #[test]
    fn test_chain_linking() {
        let dir = tempfile::tempdir().unwrap();
        let hf = new_header_file(dir.path());

        let first = hf.new_header_index().unwrap();
        let mut page = PageHeader { cursor: 100, size: 4096, ..Default::default() };
        hf.set_page_header(first, &page).unwrap();

        let second = hf.new_header_index().unwrap();
        page.cursor = 200;
        hf.set_page_header(second, &page).unwrap();
        hf.update_next(first, 0, second).unwrap();

        let linked = hf.get_page_header(first).unwrap();
        assert_eq!(linked.next_file, 0);
        assert_eq!(linked.next_header, second);
        assert!(!hf.get_page_header(second).unwrap().has_next());
    }

    #[test]
    fn test_rewind_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.00000");
        {
            let hf = new_header_file(dir.path());
            let idx = hf.new_header_index().unwrap();
            let page = PageHeader { cursor: 64, size: 4096, ..Default::default() };
            hf.set_page_header(idx, &page).unwrap();
            // claim two more slots but never fill them, as a crash between
            // claim and persist would
            hf.new_header_index().unwrap();
            hf.new_header_index().unwrap();
            hf.close().unwrap();
        }
        let reopened = HeaderFile::open_existing(&path, 0, false).unwrap();
        assert_eq!(reopened.get_tsdb_header().unwrap().header_index, 1);
    }
}
