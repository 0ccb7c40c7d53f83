use super::page::{PAGE_SIZE, Page, PageId, PageType};
use crate::audit::ResourceTracker;
use crate::errors::DbError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

const MAGIC: &[u8; 4] = b"LDB1";
const FORMAT_VERSION: u32 = 1;

// Page 0 is the file header, raw little-endian:
//   magic, format version, page size, free-list head, page count,
//   last checkpoint LSN.

struct DiskInner {
    file: File,
    page_count: u64,
    free_list_head: PageId,
    last_lsn: u64,
}

/// File-backed fixed-size page I/O. Allocation extends the file; freed
/// pages go to a singly-linked list threaded through page bodies.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
    resources: Arc<dyn ResourceTracker>,
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager").finish_non_exhaustive()
    }
}

impl DiskManager {
    /// Opens or creates the paged data file.
    /// # Errors
    /// `Io` on filesystem failure, `Corruption` on bad magic or a
    /// page-size mismatch.
    pub fn open(path: &Path, resources: Arc<dyn ResourceTracker>) -> Result<Self, DbError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let len = file.metadata()?.len();
        let mut inner = if len == 0 {
            DiskInner { file, page_count: 1, free_list_head: 0, last_lsn: 0 }
        } else {
            let mut header = [0u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[0..4] != MAGIC {
                return Err(DbError::Corruption("bad magic in data file header".into()));
            }
            let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or([0; 4]));
            if version != FORMAT_VERSION {
                return Err(DbError::Corruption(format!("unsupported format version {version}")));
            }
            let page_size = u32::from_le_bytes(header[8..12].try_into().unwrap_or([0; 4]));
            if page_size as usize != PAGE_SIZE {
                return Err(DbError::Corruption(format!(
                    "data file page size {page_size} does not match build constant {PAGE_SIZE}"
                )));
            }
            let free_list_head = u64::from_le_bytes(header[12..20].try_into().unwrap_or([0; 8]));
            let page_count = u64::from_le_bytes(header[20..28].try_into().unwrap_or([0; 8]));
            let last_lsn = u64::from_le_bytes(header[28..36].try_into().unwrap_or([0; 8]));
            DiskInner { file, page_count, free_list_head, last_lsn }
        };
        if len == 0 {
            Self::write_header(&mut inner)?;
        }
        Ok(Self { inner: Mutex::new(inner), resources })
    }

    fn write_header(inner: &mut DiskInner) -> Result<(), DbError> {
        let mut header = [0u8; PAGE_SIZE];
        header[0..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        header[12..20].copy_from_slice(&inner.free_list_head.to_le_bytes());
        header[20..28].copy_from_slice(&inner.page_count.to_le_bytes());
        header[28..36].copy_from_slice(&inner.last_lsn.to_le_bytes());
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&header)?;
        Ok(())
    }

    /// Reads one page, verifying checksum and stored id.
    /// # Errors
    /// `NotFound` past the end of the file, `Corruption` on checksum or
    /// id mismatch.
    pub fn read_page(&self, id: PageId) -> Result<Page, DbError> {
        let mut inner = self.inner.lock();
        if id == 0 || id >= inner.page_count {
            return Err(DbError::NotFound(format!("page {id} out of range")));
        }
        let mut buf = [0u8; PAGE_SIZE];
        inner.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        inner.file.read_exact(&mut buf)?;
        drop(inner);
        self.resources.record_read(PAGE_SIZE as u64);
        let page = Page::from_bytes(buf)?;
        if page.id() != id {
            return Err(DbError::Corruption(format!("page {id} carries id {}", page.id())));
        }
        Ok(page)
    }

    /// Writes one page, stamping its checksum.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn write_page(&self, page: &Page) -> Result<(), DbError> {
        let mut stamped = page.clone();
        stamped.stamp_checksum();
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(stamped.id() * PAGE_SIZE as u64))?;
        inner.file.write_all(stamped.bytes())?;
        drop(inner);
        self.resources.record_write(PAGE_SIZE as u64);
        Ok(())
    }

    /// Pops the free list, or extends the file. The new page is written
    /// out immediately as an initialized `Free` page.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn allocate(&self) -> Result<PageId, DbError> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.free_list_head != 0 {
                let head = inner.free_list_head;
                let mut buf = [0u8; PAGE_SIZE];
                inner.file.seek(SeekFrom::Start(head * PAGE_SIZE as u64))?;
                inner.file.read_exact(&mut buf)?;
                let page = Page::from_bytes(buf)?;
                let next =
                    u64::from_le_bytes(page.body()[0..8].try_into().unwrap_or([0; 8]));
                inner.free_list_head = next;
                Self::write_header(&mut inner)?;
                head
            } else {
                let id = inner.page_count;
                inner.page_count += 1;
                Self::write_header(&mut inner)?;
                id
            }
        };
        self.write_page(&Page::new(id, PageType::Free))?;
        Ok(id)
    }

    /// Pushes a page onto the free list.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn free(&self, id: PageId) -> Result<(), DbError> {
        let head = {
            let inner = self.inner.lock();
            inner.free_list_head
        };
        let mut page = Page::new(id, PageType::Free);
        page.body_mut()[0..8].copy_from_slice(&head.to_le_bytes());
        self.write_page(&page)?;
        let mut inner = self.inner.lock();
        inner.free_list_head = id;
        Self::write_header(&mut inner)?;
        Ok(())
    }

    /// # Errors
    /// `Io` on filesystem failure.
    pub fn sync(&self) -> Result<(), DbError> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.inner.lock().page_count
    }

    #[must_use]
    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.inner.lock().last_lsn
    }

    /// Records the checkpoint LSN in the file header.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn set_checkpoint_lsn(&self, lsn: u64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.last_lsn = lsn;
        Self::write_header(&mut inner)
    }

    // --- raw access, WAL replay only ---

    /// Reads a page image without checksum verification. Returns `None`
    /// past the end of the file. A torn page is repaired by redo, so
    /// replay must be able to look at it.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn read_page_raw(&self, id: PageId) -> Result<Option<[u8; PAGE_SIZE]>, DbError> {
        let mut inner = self.inner.lock();
        if id == 0 || id >= inner.page_count {
            return Ok(None);
        }
        let mut buf = [0u8; PAGE_SIZE];
        inner.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        inner.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Writes a raw page image, extending the page count when the WAL
    /// references a page the header never recorded.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn write_page_raw(&self, id: PageId, image: &[u8; PAGE_SIZE]) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if id >= inner.page_count {
            inner.page_count = id + 1;
            Self::write_header(&mut inner)?;
        }
        inner.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        inner.file.write_all(image)?;
        drop(inner);
        self.resources.record_write(PAGE_SIZE as u64);
        Ok(())
    }
}
