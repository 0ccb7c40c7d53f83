use crate::audit::{AuditEvent, AuditSink, MetricsCollector, Severity};
use crate::cancel::CancelToken;
use crate::document::{Document, ID_FIELD, ObjectId};
use crate::errors::DbError;
use crate::index::{
    BPlusTree, BuildState, DEFAULT_ORDER, IndexMeta, IndexRegistry, IndexSpec, KeyType,
    ManagedIndex,
};
use crate::mvcc::{TxnManager, VersionStore};
use crate::query::Filter;
use crate::storage::{BufferPool, DiskManager, HeapStore, PageId, Wal};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Reserved name of the always-present primary-key index.
pub const ID_INDEX_NAME: &str = "_id_";

/// Durable per-collection catalog, one JSON file under `collections/`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CollectionCatalog {
    pub id: u32,
    pub name: String,
    pub pages: Vec<PageId>,
    pub indexes: Vec<IndexMeta>,
}

/// A named set of documents plus its indexes and version chains.
/// Writes serialize under the write gate; an index entry is never
/// observable without its document.
pub struct Collection {
    pub(crate) id: u32,
    name: String,
    db_name: String,
    pub(crate) heap: HeapStore,
    pub(crate) indexes: IndexRegistry,
    pub(crate) versions: VersionStore<ObjectId, Document>,
    pub(crate) txns: Arc<TxnManager>,
    pub(crate) write_gate: Mutex<()>,
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) metrics: Arc<dyn MetricsCollector>,
    pub(crate) doc_count: AtomicU64,
    pub(crate) shutdown: CancelToken,
    catalog_path: PathBuf,
    persisted_pages: Mutex<usize>,
    persisted_roots: Mutex<std::collections::HashMap<String, crate::storage::PageId>>,
    pub(crate) builders: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) node_cache_capacity: usize,
    /// Back-reference for background builders; set right after the
    /// owning `Arc` is created.
    pub(crate) self_ref: Mutex<Weak<Collection>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("db_name", &self.db_name)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Creates a fresh collection with its `_id` index and persists the
    /// initial catalog.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        id: u32,
        name: String,
        db_name: String,
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        txns: Arc<TxnManager>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsCollector>,
        catalog_path: PathBuf,
        node_cache_capacity: usize,
        shutdown: CancelToken,
    ) -> Result<Self, DbError> {
        let heap = HeapStore::new(id, pool.clone(), wal.clone(), disk.clone());
        let collection = Self {
            id,
            name,
            db_name,
            heap,
            indexes: IndexRegistry::new(),
            versions: VersionStore::new(),
            txns,
            write_gate: Mutex::new(()),
            disk,
            pool,
            wal,
            audit,
            metrics,
            doc_count: AtomicU64::new(0),
            shutdown,
            catalog_path,
            persisted_pages: Mutex::new(0),
            persisted_roots: Mutex::new(std::collections::HashMap::new()),
            builders: Mutex::new(Vec::new()),
            node_cache_capacity,
            self_ref: Mutex::new(Weak::new()),
        };
        let id_tree = BPlusTree::create(
            collection.disk.clone(),
            collection.pool.clone(),
            collection.wal.clone(),
            KeyType::ObjectId,
            true,
            DEFAULT_ORDER,
            collection.node_cache_capacity,
        )?;
        collection.indexes.register(Arc::new(ManagedIndex::new(
            id_index_spec(),
            id_tree,
            BuildState::Ready,
        )))?;
        collection.save_catalog()?;
        Ok(collection)
    }

    /// Reattaches to a persisted collection. Indexes that crashed
    /// mid-build come back as `Building` and are rebuilt by the
    /// database open path.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        catalog: CollectionCatalog,
        db_name: String,
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        txns: Arc<TxnManager>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsCollector>,
        catalog_path: PathBuf,
        node_cache_capacity: usize,
        shutdown: CancelToken,
    ) -> Result<Self, DbError> {
        let heap = HeapStore::with_pages(
            catalog.id,
            pool.clone(),
            wal.clone(),
            disk.clone(),
            catalog.pages.clone(),
        )?;
        let collection = Self {
            id: catalog.id,
            name: catalog.name,
            db_name,
            heap,
            indexes: IndexRegistry::new(),
            versions: VersionStore::new(),
            txns,
            write_gate: Mutex::new(()),
            disk,
            pool,
            wal,
            audit,
            metrics,
            doc_count: AtomicU64::new(0),
            shutdown,
            catalog_path,
            persisted_pages: Mutex::new(catalog.pages.len()),
            persisted_roots: Mutex::new(std::collections::HashMap::new()),
            builders: Mutex::new(Vec::new()),
            node_cache_capacity,
            self_ref: Mutex::new(Weak::new()),
        };
        for meta in catalog.indexes {
            let tree = BPlusTree::open(
                collection.disk.clone(),
                collection.pool.clone(),
                collection.wal.clone(),
                meta.spec.key_type,
                meta.spec.unique,
                meta.order,
                collection.node_cache_capacity,
                meta.root_page,
            );
            collection.indexes.register(Arc::new(ManagedIndex::new(
                meta.spec,
                tree,
                meta.build_state,
            )))?;
        }
        let cancel = CancelToken::new();
        let docs = collection.heap.scan(&cancel)?;
        collection.doc_count.store(docs.len() as u64, Ordering::SeqCst);
        Ok(collection)
    }

    /// Wires the back-reference used by background index builders.
    pub(crate) fn attach_self(&self, weak: Weak<Self>) {
        *self.self_ref.lock() = weak;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.doc_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists the catalog file (page list + index metadata).
    pub(crate) fn save_catalog(&self) -> Result<(), DbError> {
        let catalog = CollectionCatalog {
            id: self.id,
            name: self.name.clone(),
            pages: self.heap.pages(),
            indexes: self.indexes.all().iter().map(|i| i.meta()).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&catalog)?;
        std::fs::write(&self.catalog_path, bytes)?;
        *self.persisted_pages.lock() = catalog.pages.len();
        *self.persisted_roots.lock() = catalog
            .indexes
            .iter()
            .map(|meta| (meta.spec.name.clone(), meta.root_page))
            .collect();
        Ok(())
    }

    /// Re-persists the catalog when the heap grew a page or an index
    /// root moved (a split can relocate it mid-stream).
    pub(crate) fn persist_metadata_changes(&self) -> Result<(), DbError> {
        let pages_changed = *self.persisted_pages.lock() != self.heap.pages().len();
        let roots_changed = {
            let saved = self.persisted_roots.lock();
            self.indexes
                .all()
                .iter()
                .any(|index| saved.get(&index.spec.name) != Some(&index.tree.root_page_id()))
        };
        if pages_changed || roots_changed {
            self.save_catalog()?;
        }
        Ok(())
    }

    /// Flushes index node caches and statistics for a checkpoint.
    pub(crate) fn flush_indexes(&self) -> Result<(), DbError> {
        for index in self.indexes.all() {
            index.tree.flush()?;
        }
        Ok(())
    }

    /// Frees every page the collection owns (explicit drop only).
    pub(crate) fn free_storage(&self) -> Result<(), DbError> {
        let _gate = self.write_gate.lock();
        for index in self.indexes.all() {
            index.tree.free_pages()?;
            let _ = self.indexes.unregister(&index.spec.name);
        }
        self.heap.free_all_pages()?;
        std::fs::remove_file(&self.catalog_path).ok();
        Ok(())
    }

    /// Joins any background index builders (database close).
    pub(crate) fn join_builders(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.builders.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("index builder for {} panicked", self.name);
            }
        }
    }

    /// Emits exactly one audit event and one metrics observation for a
    /// user-visible operation.
    pub(crate) fn observe<T>(
        &self,
        op: &str,
        filter: Option<&Filter>,
        counts: Option<u64>,
        started: Instant,
        result: &Result<T, DbError>,
    ) {
        let duration = started.elapsed();
        let (success, error, severity) = match result {
            Ok(_) => (true, None, Severity::Info),
            Err(err) => (false, Some(err.to_string()), Severity::Error),
        };
        self.audit.log(AuditEvent {
            timestamp: Utc::now(),
            op: op.to_string(),
            collection: self.name.clone(),
            db: self.db_name.clone(),
            user: None,
            success,
            error,
            duration,
            severity,
            details: None,
            counts,
            filter: filter.cloned(),
        });
        self.metrics.incr(op);
        self.metrics.observe_latency(op, duration);
    }
}

pub(crate) fn id_index_spec() -> IndexSpec {
    IndexSpec {
        name: ID_INDEX_NAME.to_string(),
        fields: vec![ID_FIELD.to_string()],
        key_type: KeyType::ObjectId,
        unique: true,
        partial_filter: None,
        background: false,
    }
}
