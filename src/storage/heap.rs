use super::buffer::BufferPool;
use super::page::{PAGE_HEADER_SIZE, PAGE_SIZE, Page, PageId, PageType};
use super::wal::Wal;
use crate::cancel::CancelToken;
use crate::errors::DbError;
use crate::storage::DiskManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Compaction fires once a page accumulates this many tombstones.
const COMPACT_THRESHOLD: usize = 8;

/// Largest record one data page can hold (one slot entry reserved).
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - 4;

/// Stable 12-byte locator: collection ‖ page ‖ slot ‖ reserved.
/// Valid until the record is deleted or relocated by an oversized
/// update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub collection: u32,
    pub page: PageId,
    pub slot: u16,
}

impl RecordId {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.collection.to_le_bytes());
        bytes[4..8].copy_from_slice(&(self.page as u32).to_le_bytes());
        bytes[8..10].copy_from_slice(&self.slot.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        Self {
            collection: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            page: PageId::from(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
            slot: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.collection, self.page, self.slot)
    }
}

struct HeapInner {
    pages: Vec<PageId>,
    free_space: HashMap<PageId, usize>,
}

/// Slotted-page record store for one collection: places encoded
/// documents into data pages, first-fit over a free-space map.
pub struct HeapStore {
    collection_id: u32,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    disk: Arc<DiskManager>,
    inner: Mutex<HeapInner>,
}

impl HeapStore {
    #[must_use]
    pub fn new(
        collection_id: u32,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        disk: Arc<DiskManager>,
    ) -> Self {
        Self {
            collection_id,
            pool,
            wal,
            disk,
            inner: Mutex::new(HeapInner { pages: Vec::new(), free_space: HashMap::new() }),
        }
    }

    /// Reattaches to a known page list (reopen path), rebuilding the
    /// free-space map from the pages themselves.
    /// # Errors
    /// Surfaces disk errors from fetching the listed pages.
    pub fn with_pages(
        collection_id: u32,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        disk: Arc<DiskManager>,
        pages: Vec<PageId>,
    ) -> Result<Self, DbError> {
        let store = Self::new(collection_id, pool, wal, disk);
        {
            let mut inner = store.inner.lock();
            for &id in &pages {
                let page = store.pool.fetch(id)?;
                inner.free_space.insert(id, page.free_space());
                store.pool.unpin(id);
            }
            inner.pages = pages;
        }
        Ok(store)
    }

    #[must_use]
    pub fn pages(&self) -> Vec<PageId> {
        self.inner.lock().pages.clone()
    }

    /// Places one encoded record, first-fit; allocates a fresh data
    /// page when nothing fits.
    /// # Errors
    /// `Capacity` when the record exceeds what any page can hold.
    pub fn insert(&self, record: &[u8]) -> Result<RecordId, DbError> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(DbError::Capacity(format!(
                "record of {} bytes exceeds page capacity {MAX_RECORD_SIZE}",
                record.len()
            )));
        }
        let mut inner = self.inner.lock();
        let target = inner
            .pages
            .iter()
            .find(|id| inner.free_space.get(*id).is_some_and(|free| *free >= record.len() + 4))
            .copied();
        match target {
            Some(id) => {
                let mut page = self.pool.fetch(id)?;
                let Some(slot) = page.insert_record(record) else {
                    // Free-space map drifted; resync and fall through to a new page.
                    inner.free_space.insert(id, page.free_space());
                    self.pool.unpin(id);
                    drop(inner);
                    return self.insert(record);
                };
                let lsn = self.wal.append(id, None, page.bytes().to_vec())?;
                page.set_lsn(lsn);
                inner.free_space.insert(id, page.free_space());
                self.pool.unpin_dirty(id, page);
                Ok(RecordId { collection: self.collection_id, page: id, slot })
            }
            None => {
                let id = self.disk.allocate()?;
                let mut page = Page::new(id, PageType::Data);
                let slot = page
                    .insert_record(record)
                    .ok_or_else(|| DbError::Capacity("record does not fit a fresh page".into()))?;
                let lsn = self.wal.append(id, None, page.bytes().to_vec())?;
                page.set_lsn(lsn);
                inner.pages.push(id);
                inner.free_space.insert(id, page.free_space());
                self.pool.put_page(page)?;
                Ok(RecordId { collection: self.collection_id, page: id, slot })
            }
        }
    }

    /// # Errors
    /// `NotFound` for a foreign, tombstoned, or out-of-range record id.
    pub fn read(&self, rid: RecordId) -> Result<Vec<u8>, DbError> {
        if rid.collection != self.collection_id {
            return Err(DbError::NotFound(format!("record {rid} belongs to another collection")));
        }
        let page = self.pool.fetch(rid.page)?;
        let record = page.read_record(rid.slot).map(<[u8]>::to_vec);
        self.pool.unpin(rid.page);
        record.ok_or_else(|| DbError::NotFound(format!("record {rid}")))
    }

    /// Tombstones the slot; compacts the page once tombstones pass the
    /// threshold. Slot ids survive compaction.
    /// # Errors
    /// `NotFound` when the slot is already gone.
    pub fn delete(&self, rid: RecordId) -> Result<(), DbError> {
        if rid.collection != self.collection_id {
            return Err(DbError::NotFound(format!("record {rid} belongs to another collection")));
        }
        let mut inner = self.inner.lock();
        let mut page = self.pool.fetch(rid.page)?;
        if !page.delete_record(rid.slot) {
            self.pool.unpin(rid.page);
            return Err(DbError::NotFound(format!("record {rid}")));
        }
        if page.tombstone_count() > COMPACT_THRESHOLD {
            page.compact();
        }
        let lsn = self.wal.append(rid.page, None, page.bytes().to_vec())?;
        page.set_lsn(lsn);
        inner.free_space.insert(rid.page, page.free_space());
        self.pool.unpin_dirty(rid.page, page);
        Ok(())
    }

    /// Rewrites in place when the new bytes fit the old slot, otherwise
    /// relocates and returns the new record id.
    /// # Errors
    /// `NotFound` when the record is gone, `Capacity` when the new
    /// record exceeds page capacity.
    pub fn update(&self, rid: RecordId, record: &[u8]) -> Result<RecordId, DbError> {
        {
            let mut inner = self.inner.lock();
            let mut page = self.pool.fetch(rid.page)?;
            if page.update_record_in_place(rid.slot, record) {
                let lsn = self.wal.append(rid.page, None, page.bytes().to_vec())?;
                page.set_lsn(lsn);
                inner.free_space.insert(rid.page, page.free_space());
                self.pool.unpin_dirty(rid.page, page);
                return Ok(rid);
            }
            self.pool.unpin(rid.page);
        }
        self.delete(rid)?;
        self.insert(record)
    }

    /// Full scan in page order, checking the cancel token at every
    /// record boundary.
    /// # Errors
    /// `Cancelled` when the token fires mid-scan.
    pub fn scan(&self, cancel: &CancelToken) -> Result<Vec<(RecordId, Vec<u8>)>, DbError> {
        let pages = self.pages();
        let mut out = Vec::new();
        for id in pages {
            cancel.check()?;
            let page = self.pool.fetch(id)?;
            for slot in 0..page.slot_count() {
                cancel.check().inspect_err(|_| self.pool.unpin(id))?;
                if let Some(record) = page.read_record(slot) {
                    out.push((
                        RecordId { collection: self.collection_id, page: id, slot },
                        record.to_vec(),
                    ));
                }
            }
            self.pool.unpin(id);
        }
        Ok(out)
    }

    /// Releases every owned page to the disk free list (collection
    /// drop).
    /// # Errors
    /// Surfaces disk errors from the free-list writes.
    pub fn free_all_pages(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        for id in inner.pages.drain(..) {
            self.disk.free(id)?;
        }
        inner.free_space.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopResources;

    fn fixture() -> (tempfile::TempDir, HeapStore) {
        let dir = tempfile::tempdir().unwrap();
        let disk =
            Arc::new(DiskManager::open(&dir.path().join("data.db"), Arc::new(NoopResources)).unwrap());
        let wal = Arc::new(Wal::open(&dir.path().join("wal.log"), 0).unwrap());
        let pool = Arc::new(BufferPool::new(disk.clone(), wal.clone(), 16));
        let heap = HeapStore::new(9, pool, wal, disk);
        (dir, heap)
    }

    #[test]
    fn insert_read_delete_round_trip() {
        let (_dir, heap) = fixture();
        let rid = heap.insert(b"record-one").unwrap();
        assert_eq!(rid.collection, 9);
        assert_eq!(heap.read(rid).unwrap(), b"record-one");
        heap.delete(rid).unwrap();
        assert!(matches!(heap.read(rid), Err(DbError::NotFound(_))));
        assert!(matches!(heap.delete(rid), Err(DbError::NotFound(_))));
    }

    #[test]
    fn update_in_place_keeps_rid() {
        let (_dir, heap) = fixture();
        let rid = heap.insert(b"0123456789").unwrap();
        let same = heap.update(rid, b"short").unwrap();
        assert_eq!(same, rid);
        assert_eq!(heap.read(rid).unwrap(), b"short");
    }

    #[test]
    fn oversized_update_relocates() {
        let (_dir, heap) = fixture();
        let rid = heap.insert(b"tiny").unwrap();
        let big = vec![b'x'; 64];
        let moved = heap.update(rid, &big).unwrap();
        assert_ne!(moved, rid);
        assert_eq!(heap.read(moved).unwrap(), big);
        assert!(matches!(heap.read(rid), Err(DbError::NotFound(_))));
    }

    #[test]
    fn spills_to_new_pages() {
        let (_dir, heap) = fixture();
        let record = vec![b'r'; 1000];
        let rids: Vec<RecordId> = (0..10).map(|_| heap.insert(&record).unwrap()).collect();
        assert!(heap.pages().len() > 1);
        for rid in rids {
            assert_eq!(heap.read(rid).unwrap().len(), 1000);
        }
    }

    #[test]
    fn scan_observes_cancellation() {
        let (_dir, heap) = fixture();
        for i in 0..5 {
            heap.insert(format!("rec-{i}").as_bytes()).unwrap();
        }
        let cancel = CancelToken::new();
        assert_eq!(heap.scan(&cancel).unwrap().len(), 5);
        cancel.cancel();
        assert!(matches!(heap.scan(&cancel), Err(DbError::Cancelled)));
    }

    #[test]
    fn oversized_record_is_capacity() {
        let (_dir, heap) = fixture();
        let too_big = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(heap.insert(&too_big), Err(DbError::Capacity(_))));
    }
}
