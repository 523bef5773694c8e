use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Reads and writes fixed-size pages by page id and hands out fresh ids.
///
/// Allocation is monotonic from the current end of the file; deallocated
/// ids are not reused while the file is open.
pub struct DiskManager {
    file: File,
    next_page_id: u32,
}

impl DiskManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            next_page_id: 0,
        })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file,
            next_page_id: num_pages,
        })
    }

    /// Reads a page into `buf`. Pages past the end of the file read as
    /// zeroes so a freshly allocated page is fetchable before its first
    /// flush.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPage(format!(
                "buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            )));
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPage(format!(
                "data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            )));
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;

        Ok(())
    }

    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        let page_id = PageId(self.next_page_id);
        self.next_page_id += 1;
        Ok(page_id)
    }

    /// Ids are never handed out twice while the file is open; the page's
    /// bytes stay in place until something overwrites them.
    pub fn deallocate_page(&mut self, _page_id: PageId) {}

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        {
            let dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(&dir.path().join("test.db"))?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        dm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_allocate_monotonic() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(&dir.path().join("test.db"))?;

        assert_eq!(dm.allocate_page()?, PageId(0));
        assert_eq!(dm.allocate_page()?, PageId(1));
        assert_eq!(dm.allocate_page()?, PageId(2));

        // Deallocation never recycles an id for the lifetime of the handle.
        dm.deallocate_page(PageId(1));
        assert_eq!(dm.allocate_page()?, PageId(3));

        Ok(())
    }

    #[test]
    fn test_read_unwritten_page_is_zeroed() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(&dir.path().join("test.db"))?;

        let _ = dm.allocate_page()?;
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(&dir.path().join("test.db"))?;

        let mut small_buf = vec![0u8; 100];
        assert!(dm.read_page(PageId(0), &mut small_buf).is_err());
        assert!(dm.write_page(PageId(0), &small_buf).is_err());

        Ok(())
    }

    #[test]
    fn test_persistence() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.db");

        {
            let mut dm = DiskManager::create(&file_path)?;
            let buf = vec![99u8; PAGE_SIZE];
            dm.write_page(PageId(3), &buf)?;
        }

        {
            let mut dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.num_pages()?, 4);
            // Reopening resumes allocation past the existing pages.
            assert_eq!(dm.allocate_page()?, PageId(4));

            let mut buf = vec![0u8; PAGE_SIZE];
            dm.read_page(PageId(3), &mut buf)?;
            assert_eq!(buf[0], 99);
        }

        Ok(())
    }
}
