use super::disk::DiskManager;
use super::page::{Page, PageId};
use super::wal::Wal;
use crate::errors::DbError;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Frame {
    page: Page,
    pin_count: u32,
    dirty: bool,
}

struct PoolInner {
    frames: LruCache<PageId, Frame>,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time counters for the frame cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub resident: usize,
    pub capacity: usize,
}

/// Bounded page cache over the disk manager. Frames carry a pin count
/// and a dirty flag; eviction is LRU over unpinned frames and writes
/// back through the WAL-then-disk protocol.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    disk: Arc<DiskManager>,
    wal: Arc<Wal>,
    metrics: PoolMetrics,
}

impl BufferPool {
    #[must_use]
    pub fn new(disk: Arc<DiskManager>, wal: Arc<Wal>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(PoolInner { frames: LruCache::new(cap) }),
            disk,
            wal,
            metrics: PoolMetrics::default(),
        }
    }

    /// Fetches and pins a page, reading from disk on a miss. Fetches of
    /// the same id are serialized on the pool mutex, so concurrent
    /// callers collapse onto one disk read.
    /// # Errors
    /// `Capacity` when the pool is full and every frame is pinned;
    /// otherwise whatever the disk manager surfaces.
    pub fn fetch(&self, id: PageId) -> Result<Page, DbError> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.pin_count += 1;
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.page.clone());
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        self.make_room(&mut inner)?;
        let page = self.disk.read_page(id)?;
        inner.frames.put(id, Frame { page: page.clone(), pin_count: 1, dirty: false });
        Ok(page)
    }

    /// Unpins after a read-only use.
    pub fn unpin(&self, id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Stores a modified image (LSN already stamped by the caller's WAL
    /// append), marks the frame dirty, and unpins it.
    pub fn unpin_dirty(&self, id: PageId, page: Page) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.page = page;
            frame.dirty = true;
            frame.pin_count = frame.pin_count.saturating_sub(1);
        } else {
            // Pinned frames are never evicted, so this means the caller
            // unpinned twice.
            log::error!("unpin_dirty: page {id} is not resident");
        }
    }

    /// Installs a dirty page that need not be resident yet (B+ tree
    /// node write-back path).
    /// # Errors
    /// `Capacity` when no frame can be reclaimed.
    pub fn put_page(&self, page: Page) -> Result<(), DbError> {
        let id = page.id();
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.page = page;
            frame.dirty = true;
            return Ok(());
        }
        self.make_room(&mut inner)?;
        inner.frames.put(id, Frame { page, pin_count: 0, dirty: true });
        Ok(())
    }

    /// Writes one frame back if dirty.
    /// # Errors
    /// `Io` from the WAL flush or the page write.
    pub fn flush(&self, id: PageId) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let page = match inner.frames.get_mut(&id) {
            Some(frame) if frame.dirty => frame.page.clone(),
            _ => return Ok(()),
        };
        self.wal.flush()?;
        self.disk.write_page(&page)?;
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.dirty = false;
        }
        Ok(())
    }

    /// Writes every dirty frame back, flushing the WAL once up front.
    /// # Errors
    /// `Io` from the WAL flush or a page write.
    pub fn flush_all(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let dirty: Vec<PageId> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, _)| *id)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        self.wal.flush()?;
        for id in dirty {
            if let Some(frame) = inner.frames.get_mut(&id) {
                let page = frame.page.clone();
                self.disk.write_page(&page)?;
                frame.dirty = false;
                self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// True when the page is currently cached (test hook for the LRU
    /// residency scenarios).
    #[must_use]
    pub fn is_resident(&self, id: PageId) -> bool {
        self.inner.lock().frames.peek(&id).is_some()
    }

    #[must_use]
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let inner = self.inner.lock();
        PoolMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            flushes: self.metrics.flushes.load(Ordering::Relaxed),
            resident: inner.frames.len(),
            capacity: inner.frames.cap().get(),
        }
    }

    /// Evicts the least-recently-used unpinned frame when the pool is
    /// full, writing it back first if dirty.
    fn make_room(&self, inner: &mut PoolInner) -> Result<(), DbError> {
        if inner.frames.len() < inner.frames.cap().get() {
            return Ok(());
        }
        // iter() yields most-recent first; scan from the tail.
        let keys: Vec<PageId> = inner.frames.iter().map(|(id, _)| *id).collect();
        let victim = keys
            .iter()
            .rev()
            .find(|id| inner.frames.peek(*id).is_some_and(|f| f.pin_count == 0))
            .copied();
        let Some(victim) = victim else {
            return Err(DbError::Capacity("buffer pool exhausted: all frames pinned".into()));
        };
        if let Some(frame) = inner.frames.peek(&victim)
            && frame.dirty
        {
            let page = frame.page.clone();
            self.wal.flush()?;
            self.disk.write_page(&page)?;
        }
        inner.frames.pop(&victim);
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
