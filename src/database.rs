use crate::audit::{AuditSink, MetricsCollector, NoopAudit, NoopMetrics, NoopResources, ResourceTracker};
use crate::cancel::CancelToken;
use crate::collection::{Collection, CollectionCatalog};
use crate::errors::DbError;
use crate::mvcc::{Snapshot, TxnManager};
use crate::storage::{BufferPool, DiskManager, PoolMetricsSnapshot, Wal};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_BUFFER_POOL_PAGES: usize = 256;
const DEFAULT_NODE_CACHE_NODES: usize = 128;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Construction parameters. Collaborator handles (audit, metrics,
/// resource tracking) are explicit; defaults are no-ops.
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    pub buffer_pool_pages: usize,
    pub node_cache_nodes: usize,
    pub gc_interval: Duration,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub resources: Arc<dyn ResourceTracker>,
}

impl DatabaseConfig {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            buffer_pool_pages: DEFAULT_BUFFER_POOL_PAGES,
            node_cache_nodes: DEFAULT_NODE_CACHE_NODES,
            gc_interval: DEFAULT_GC_INTERVAL,
            audit: Arc::new(NoopAudit),
            metrics: Arc::new(NoopMetrics),
            resources: Arc::new(NoopResources),
        }
    }
}

/// One database: a paged data file, its WAL, a buffer pool and a set of
/// named collections. Opening replays the WAL; closing checkpoints and
/// stops the background version GC.
pub struct Database {
    name: String,
    data_dir: PathBuf,
    collections_dir: PathBuf,
    disk: Arc<DiskManager>,
    wal: Arc<Wal>,
    pool: Arc<BufferPool>,
    txns: Arc<TxnManager>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsCollector>,
    node_cache_nodes: usize,
    collections: Arc<RwLock<HashMap<String, Arc<Collection>>>>,
    next_collection_id: AtomicU32,
    shutdown: CancelToken,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Opens (or creates) the database under `config.data_dir`.
    /// # Errors
    /// `Io` / `Corruption` from the data file, WAL replay, or catalog
    /// files.
    pub fn open(config: DatabaseConfig) -> Result<Arc<Self>, DbError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let collections_dir = config.data_dir.join("collections");
        std::fs::create_dir_all(&collections_dir)?;
        let name = config
            .data_dir
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("lauradb")
            .to_string();
        // A second open in the same process leaves the existing logger
        // in place.
        let _ = crate::logger::init_for_db_in(&config.data_dir, &name);

        let data_path = config.data_dir.join("data.db");
        let wal_path = config.data_dir.join("wal.log");
        let disk = Arc::new(DiskManager::open(&data_path, config.resources.clone())?);
        let replayed_lsn = Wal::replay(&wal_path, &disk)?;
        let start_lsn = replayed_lsn.max(disk.last_checkpoint_lsn());
        let wal = Arc::new(Wal::open(&wal_path, start_lsn)?);
        let pool = Arc::new(BufferPool::new(disk.clone(), wal.clone(), config.buffer_pool_pages));
        let txns = Arc::new(TxnManager::new());

        let db = Arc::new(Self {
            name,
            data_dir: config.data_dir,
            collections_dir,
            disk,
            wal,
            pool,
            txns,
            audit: config.audit,
            metrics: config.metrics,
            node_cache_nodes: config.node_cache_nodes,
            collections: Arc::new(RwLock::new(HashMap::new())),
            next_collection_id: AtomicU32::new(1),
            shutdown: CancelToken::new(),
            gc_thread: Mutex::new(None),
        });
        db.load_catalogs()?;
        for collection in db.collections.read().values() {
            collection.resume_interrupted_builds();
        }
        db.start_gc(config.gc_interval);
        log::info!("database {} open at {}", db.name, db.data_dir.display());
        Ok(db)
    }

    fn load_catalogs(&self) -> Result<(), DbError> {
        let mut max_id = 0u32;
        for entry in std::fs::read_dir(&self.collections_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let catalog: CollectionCatalog = serde_json::from_slice(&bytes)?;
            max_id = max_id.max(catalog.id);
            let name = catalog.name.clone();
            let collection = Collection::open(
                catalog,
                self.name.clone(),
                self.disk.clone(),
                self.pool.clone(),
                self.wal.clone(),
                self.txns.clone(),
                self.audit.clone(),
                self.metrics.clone(),
                path,
                self.node_cache_nodes,
                self.shutdown.clone(),
            )?;
            let collection = Arc::new(collection);
            collection.attach_self(Arc::downgrade(&collection));
            self.collections.write().insert(name, collection);
        }
        self.next_collection_id.store(max_id + 1, Ordering::SeqCst);
        Ok(())
    }

    fn start_gc(&self, interval: Duration) {
        let shutdown = self.shutdown.clone();
        let txns = self.txns.clone();
        let collections = self.collections.clone();
        let handle = std::thread::spawn(move || {
            let tick = Duration::from_millis(50);
            let mut elapsed = Duration::ZERO;
            while !shutdown.is_cancelled() {
                std::thread::sleep(tick);
                elapsed += tick;
                if elapsed < interval {
                    continue;
                }
                elapsed = Duration::ZERO;
                let floor = txns.min_active_version();
                let live: Vec<Arc<Collection>> = collections.read().values().cloned().collect();
                for collection in live {
                    collection.versions.gc(floor);
                }
            }
        });
        *self.gc_thread.lock() = Some(handle);
    }

    /// Creates a named collection with its `_id` index.
    /// # Errors
    /// `Duplicate` for a taken name, `InvalidInput` for a name that
    /// cannot become a catalog filename.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        validate_collection_name(name)?;
        let mut map = self.collections.write();
        if map.contains_key(name) {
            return Err(DbError::Duplicate(format!("collection {name} already exists")));
        }
        let id = self.next_collection_id.fetch_add(1, Ordering::SeqCst);
        let collection = Collection::create(
            id,
            name.to_string(),
            self.name.clone(),
            self.disk.clone(),
            self.pool.clone(),
            self.wal.clone(),
            self.txns.clone(),
            self.audit.clone(),
            self.metrics.clone(),
            self.collections_dir.join(format!("{name}.json")),
            self.node_cache_nodes,
            self.shutdown.clone(),
        )?;
        let collection = Arc::new(collection);
        collection.attach_self(Arc::downgrade(&collection));
        map.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    #[must_use]
    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// # Errors
    /// `NotFound` for an unknown collection.
    pub fn collection_required(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        self.collection(name).ok_or_else(|| DbError::NotFound(format!("collection {name}")))
    }

    /// Drops a collection, freeing its data and index pages.
    /// # Errors
    /// `NotFound` for an unknown collection.
    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        let collection = self
            .collections
            .write()
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("collection {name}")))?;
        collection.join_builders();
        collection.free_storage()?;
        Ok(())
    }

    #[must_use]
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Begins a read snapshot; release it so GC can advance.
    #[must_use]
    pub fn begin_snapshot(&self) -> Snapshot {
        self.txns.begin_snapshot()
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.txns.release_snapshot(snapshot);
    }

    /// Runs one version-GC cycle now (normally the background thread's
    /// job).
    pub fn gc_now(&self) {
        let floor = self.txns.min_active_version();
        for collection in self.collections.read().values() {
            collection.versions.gc(floor);
        }
    }

    /// Flushes every dirty page and truncates the WAL.
    /// # Errors
    /// `Io` from the flush path.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        for collection in self.collections.read().values() {
            collection.flush_indexes()?;
            collection.save_catalog()?;
        }
        self.pool.flush_all()?;
        self.disk.sync()?;
        self.disk.set_checkpoint_lsn(self.wal.next_lsn().saturating_sub(1))?;
        self.wal.truncate()?;
        log::info!("checkpoint complete for {}", self.name);
        Ok(())
    }

    /// Stops background work, checkpoints, and releases the database.
    /// After `close()` a fresh `open()` observes identical state.
    /// # Errors
    /// `Io` from the final checkpoint.
    pub fn close(&self) -> Result<(), DbError> {
        self.shutdown.cancel();
        if let Some(handle) = self.gc_thread.lock().take()
            && handle.join().is_err()
        {
            log::error!("version GC thread panicked");
        }
        for collection in self.collections.read().values() {
            collection.join_builders();
        }
        self.checkpoint()?;
        log::info!("database {} closed", self.name);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn buffer_pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn validate_collection_name(name: &str) -> Result<(), DbError> {
    if name.is_empty() {
        return Err(DbError::InvalidInput("collection name must not be empty".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(DbError::InvalidInput(format!(
            "collection name {name} may only contain alphanumerics, '_' and '-'"
        )));
    }
    Ok(())
}
