use super::core::{Collection, ID_INDEX_NAME};
use crate::cancel::CancelToken;
use crate::document::decode_document;
use crate::errors::DbError;
use crate::index::{BPlusTree, BuildState, IndexMeta, IndexSpec, IndexStatistics, ManagedIndex, extract_key};
use std::sync::Arc;
use std::time::Instant;

impl Collection {
    /// Creates an index, building it from the existing documents.
    /// Foreground builds hold the write gate; background builds install
    /// in `Building` state and backfill on a database-owned worker while
    /// writers dual-write. The catalog is persisted before returning.
    /// # Errors
    /// `Duplicate` for a taken name, `Duplicate` from unique-constraint
    /// violations during a foreground build.
    pub fn create_index(&self, spec: IndexSpec) -> Result<(), DbError> {
        let started = Instant::now();
        let result = self.create_index_inner(spec);
        self.observe("create_index", None, None, started, &result);
        result
    }

    fn create_index_inner(&self, spec: IndexSpec) -> Result<(), DbError> {
        spec.validate()?;
        if self.indexes.get(&spec.name).is_some() {
            return Err(DbError::Duplicate(format!("index {} already exists", spec.name)));
        }
        let tree = BPlusTree::create(
            self.disk.clone(),
            self.pool.clone(),
            self.wal.clone(),
            spec.key_type,
            spec.unique,
            crate::index::DEFAULT_ORDER,
            self.node_cache_capacity,
        )?;

        if spec.background {
            let index = Arc::new(ManagedIndex::new(
                spec,
                tree,
                BuildState::Building { total: self.len(), processed: 0 },
            ));
            self.indexes.register(index.clone())?;
            self.save_catalog()?;
            self.spawn_builder(index);
            return Ok(());
        }

        let _gate = self.write_gate.lock();
        let index = ManagedIndex::new(spec, tree, BuildState::Ready);
        let cancel = CancelToken::new();
        for (rid, bytes) in self.heap.scan(&cancel)? {
            let doc = decode_document(&bytes)?;
            if let Err(err) = index.insert_document(&doc, rid) {
                index.tree.free_pages()?;
                return Err(err);
            }
        }
        index.tree.flush()?;
        self.wal.flush()?;
        self.indexes.register(Arc::new(index))?;
        self.save_catalog()?;
        Ok(())
    }

    /// Restarts builds that were interrupted by a crash. The database
    /// calls this once per collection on open; the build begins again
    /// from scratch.
    pub(crate) fn resume_interrupted_builds(&self) {
        for index in self.indexes.all() {
            if matches!(index.state(), BuildState::Building { .. }) {
                log::info!(
                    "restarting interrupted build of index {} on {}",
                    index.spec.name,
                    self.name()
                );
                index.set_state(BuildState::Building { total: self.len(), processed: 0 });
                self.spawn_builder(index);
            }
        }
    }

    fn spawn_builder(&self, index: Arc<ManagedIndex>) {
        let Some(collection) = self.self_ref.lock().upgrade() else {
            log::error!(
                "no owning handle for {}; background build of {} skipped",
                self.name(),
                index.spec.name
            );
            return;
        };
        let handle = std::thread::spawn(move || {
            let outcome = collection.backfill(&index).and_then(|()| {
                index.tree.flush()?;
                collection.wal.flush()
            });
            match outcome {
                Ok(()) => index.set_state(BuildState::Ready),
                Err(DbError::Cancelled) => {
                    // Shutdown mid-build; the restart path rebuilds from
                    // scratch on the next open.
                    return;
                }
                Err(err) => {
                    log::error!("background build of {} failed: {err}", index.spec.name);
                    index.set_state(BuildState::Failed(err.to_string()));
                }
            }
            if let Err(err) = collection.save_catalog() {
                log::error!("persisting catalog after build of {} failed: {err}", index.spec.name);
            }
        });
        self.builders.lock().push(handle);
    }

    /// Scans the heap and backfills one index. Each document is checked
    /// and inserted under the write gate so concurrent dual-writes and
    /// deletes stay consistent; entries already present from dual
    /// writes are skipped.
    fn backfill(&self, index: &ManagedIndex) -> Result<(), DbError> {
        let records = self.heap.scan(&self.shutdown)?;
        let mut processed = 0u64;
        for (rid, _) in records {
            self.shutdown.check()?;
            let _gate = self.write_gate.lock();
            // Reread under the gate; the document may be gone by now.
            let Ok(bytes) = self.heap.read(rid) else {
                continue;
            };
            let doc = decode_document(&bytes)?;
            if let Some(key) = extract_key(&index.spec, &doc)?
                && !index.tree.get_all(&key)?.contains(&rid)
            {
                index.tree.insert(key, rid)?;
            }
            processed += 1;
            index.bump_progress(processed);
        }
        Ok(())
    }

    /// Drops an index and frees its pages. The `_id` index cannot be
    /// dropped.
    /// # Errors
    /// `NotFound` for an unknown name, `InvalidInput` for `_id_`.
    pub fn drop_index(&self, name: &str) -> Result<(), DbError> {
        let started = Instant::now();
        let result = (|| {
            if name == ID_INDEX_NAME {
                return Err(DbError::InvalidInput("the _id index cannot be dropped".into()));
            }
            if let Some(index) = self.indexes.get(name)
                && matches!(index.state(), BuildState::Building { .. })
            {
                return Err(DbError::Conflict(format!("index {name} is still building")));
            }
            let _gate = self.write_gate.lock();
            let index = self.indexes.unregister(name)?;
            index.tree.free_pages()?;
            self.save_catalog()?;
            Ok(())
        })();
        self.observe("drop_index", None, None, started, &result);
        result
    }

    /// Catalog view of every index.
    #[must_use]
    pub fn list_indexes(&self) -> Vec<IndexMeta> {
        let mut metas: Vec<IndexMeta> = self.indexes.all().iter().map(|i| i.meta()).collect();
        metas.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        metas
    }

    /// Recomputes one index's statistics by a full scan.
    /// # Errors
    /// `NotFound` for an unknown index; `Cancelled` mid-scan.
    pub fn analyze_index(
        &self,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<IndexStatistics, DbError> {
        let index =
            self.indexes.get(name).ok_or_else(|| DbError::NotFound(format!("index {name}")))?;
        index.analyze(cancel)
    }
}
