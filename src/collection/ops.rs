use super::core::Collection;
use crate::cancel::CancelToken;
use crate::document::{Document, ID_FIELD, ObjectId, Value, decode_document, encode_document};
use crate::errors::DbError;
use crate::query::{
    AggregateStage, Filter, FindOptions, QueryPlan, ScanStrategy, SortOrder, UpdateDoc,
    apply_update, matches, plan_query,
};
use crate::storage::RecordId;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// `explain` output: the access path the planner would take.
#[derive(Debug, Clone, Serialize)]
pub struct ExplainReport {
    pub index: Option<String>,
    pub strategy: ScanStrategy,
    pub estimated_cost: f64,
}

impl Collection {
    /// Inserts one document, assigning an `_id` when absent. Durable on
    /// return.
    /// # Errors
    /// `Duplicate` from a unique index (the primary store is left
    /// untouched), `InvalidInput` for a non-ObjectId `_id`.
    pub fn insert_one(&self, doc: Document) -> Result<ObjectId, DbError> {
        let started = Instant::now();
        let result = {
            let _gate = self.write_gate.lock();
            self.insert_locked(doc)
        };
        self.observe("insert_one", None, result.as_ref().ok().map(|_| 1), started, &result);
        result
    }

    /// Inserts a batch, per document: an error aborts the remainder and
    /// already-applied documents stay (explicit transactions exist for
    /// atomicity).
    /// # Errors
    /// The first per-document error.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<ObjectId>, DbError> {
        let started = Instant::now();
        let total = docs.len();
        let result = {
            let _gate = self.write_gate.lock();
            let mut ids = Vec::with_capacity(docs.len());
            let mut failure = None;
            for doc in docs {
                match self.insert_locked(doc) {
                    Ok(id) => ids.push(id),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            match failure {
                None => Ok(ids),
                Some(err) => {
                    log::warn!(
                        "insert_many aborted after {}/{} documents: {err}",
                        ids.len(),
                        total
                    );
                    Err(err)
                }
            }
        };
        self.observe(
            "insert_many",
            None,
            result.as_ref().ok().map(|ids| ids.len() as u64),
            started,
            &result,
        );
        result
    }

    /// Finds matching documents under a fresh snapshot, using an index
    /// when the filter covers one.
    /// # Errors
    /// `Cancelled` mid-scan; storage errors.
    pub fn find(
        &self,
        filter: &Filter,
        opts: &FindOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Document>, DbError> {
        let started = Instant::now();
        let snapshot = self.txns.begin_snapshot();
        let result = self.find_at(filter, opts, snapshot.version, cancel);
        self.txns.release_snapshot(snapshot);
        self.observe(
            "find",
            Some(filter),
            result.as_ref().ok().map(|docs| docs.len() as u64),
            started,
            &result,
        );
        result
    }

    /// Finds under a caller-held snapshot (repeatable reads across
    /// several operations).
    /// # Errors
    /// `Cancelled` mid-scan; storage errors.
    pub fn find_snapshot(
        &self,
        filter: &Filter,
        opts: &FindOptions,
        snapshot: crate::mvcc::Snapshot,
        cancel: &CancelToken,
    ) -> Result<Vec<Document>, DbError> {
        let started = Instant::now();
        let result = self.find_at(filter, opts, snapshot.version, cancel);
        self.observe(
            "find",
            Some(filter),
            result.as_ref().ok().map(|docs| docs.len() as u64),
            started,
            &result,
        );
        result
    }

    /// First match, or `NotFound`.
    /// # Errors
    /// `NotFound` when nothing matches.
    pub fn find_one(&self, filter: &Filter, cancel: &CancelToken) -> Result<Document, DbError> {
        let opts = FindOptions { limit: Some(1), ..FindOptions::default() };
        self.find(filter, &opts, cancel)?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound("no document matches the filter".into()))
    }

    /// Point lookup by `_id` through the primary-key index.
    /// # Errors
    /// `NotFound` for an unknown id.
    pub fn find_by_id(&self, id: ObjectId) -> Result<Document, DbError> {
        self.find_one(&Filter::eq(ID_FIELD, Value::ObjectId(id)), &CancelToken::new())
    }

    /// Updates the first match.
    /// # Errors
    /// `NotFound` when nothing matches; `Duplicate` when the update
    /// would break a unique index.
    pub fn update_one(
        &self,
        filter: &Filter,
        update: &UpdateDoc,
        cancel: &CancelToken,
    ) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = {
            let _gate = self.write_gate.lock();
            let matched = self.matching_latest(filter, cancel, Some(1))?;
            match matched.into_iter().next() {
                None => Err(DbError::NotFound("no document matches the update filter".into())),
                Some((rid, doc)) => self.update_locked(rid, doc, update),
            }
        };
        self.observe("update_one", Some(filter), result.as_ref().ok().copied(), started, &result);
        result
    }

    /// Updates every match, returning the modified count.
    /// # Errors
    /// Aborts on the first failing document; earlier updates stay.
    pub fn update_many(
        &self,
        filter: &Filter,
        update: &UpdateDoc,
        cancel: &CancelToken,
    ) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = {
            let _gate = self.write_gate.lock();
            let matched = self.matching_latest(filter, cancel, None)?;
            let mut modified = 0u64;
            let mut failure = None;
            for (rid, doc) in matched {
                match self.update_locked(rid, doc, update) {
                    Ok(n) => modified += n,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            match failure {
                None => Ok(modified),
                Some(err) => Err(err),
            }
        };
        self.observe("update_many", Some(filter), result.as_ref().ok().copied(), started, &result);
        result
    }

    /// Deletes the first match.
    /// # Errors
    /// `NotFound` when nothing matches.
    pub fn delete_one(&self, filter: &Filter, cancel: &CancelToken) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = {
            let _gate = self.write_gate.lock();
            let matched = self.matching_latest(filter, cancel, Some(1))?;
            match matched.into_iter().next() {
                None => Err(DbError::NotFound("no document matches the delete filter".into())),
                Some((rid, doc)) => self.delete_locked(rid, &doc).map(|()| 1),
            }
        };
        self.observe("delete_one", Some(filter), result.as_ref().ok().copied(), started, &result);
        result
    }

    /// Deletes every match, returning the count.
    /// # Errors
    /// Aborts on the first failing document.
    pub fn delete_many(&self, filter: &Filter, cancel: &CancelToken) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = {
            let _gate = self.write_gate.lock();
            let matched = self.matching_latest(filter, cancel, None)?;
            let mut deleted = 0u64;
            let mut failure = None;
            for (rid, doc) in matched {
                match self.delete_locked(rid, &doc) {
                    Ok(()) => deleted += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            match failure {
                None => Ok(deleted),
                Some(err) => Err(err),
            }
        };
        self.observe("delete_many", Some(filter), result.as_ref().ok().copied(), started, &result);
        result
    }

    /// Matching-document count.
    /// # Errors
    /// `Cancelled` mid-scan; storage errors.
    pub fn count(&self, filter: &Filter, cancel: &CancelToken) -> Result<u64, DbError> {
        let started = Instant::now();
        let snapshot = self.txns.begin_snapshot();
        let result = self
            .find_at(filter, &FindOptions::default(), snapshot.version, cancel)
            .map(|docs| docs.len() as u64);
        self.txns.release_snapshot(snapshot);
        self.observe("count", Some(filter), result.as_ref().ok().copied(), started, &result);
        result
    }

    /// Runs the contracted pipeline stages. A leading `Match` stage is
    /// pushed into the access planner.
    /// # Errors
    /// `Cancelled` mid-scan; storage errors.
    pub fn aggregate(
        &self,
        stages: &[AggregateStage],
        cancel: &CancelToken,
    ) -> Result<Vec<Document>, DbError> {
        let started = Instant::now();
        let result = self.aggregate_inner(stages, cancel);
        self.observe(
            "aggregate",
            None,
            result.as_ref().ok().map(|docs| docs.len() as u64),
            started,
            &result,
        );
        result
    }

    /// The access plan `find` would choose for this filter.
    #[must_use]
    pub fn explain(&self, filter: &Filter) -> ExplainReport {
        let plan = plan_query(filter, &self.indexes.all(), self.len());
        ExplainReport {
            index: plan.index,
            strategy: plan.strategy,
            estimated_cost: plan.estimated_cost,
        }
    }

    // --- internals, all under the write gate where they mutate ---

    fn insert_locked(&self, mut doc: Document) -> Result<ObjectId, DbError> {
        let id = match doc.get(ID_FIELD) {
            None => {
                let id = ObjectId::new();
                doc.set(ID_FIELD, Value::ObjectId(id));
                id
            }
            Some(Value::ObjectId(id)) => *id,
            Some(other) => {
                return Err(DbError::InvalidInput(format!(
                    "_id must be an ObjectId, got {}",
                    other.type_name()
                )));
            }
        };
        // Every unique constraint is checked before anything mutates.
        for index in self.indexes.all() {
            index.check_unique(&doc, None)?;
        }
        let rid = self.heap.insert(&encode_document(&doc))?;
        for index in self.indexes.all() {
            index.insert_document(&doc, rid)?;
        }
        let version = self.txns.next_version();
        self.versions.put(&id, doc, version);
        self.doc_count.fetch_add(1, Ordering::SeqCst);
        self.flush_indexes()?;
        self.wal.flush()?;
        self.persist_metadata_changes()?;
        Ok(id)
    }

    fn update_locked(
        &self,
        rid: RecordId,
        old_doc: Document,
        update: &UpdateDoc,
    ) -> Result<u64, DbError> {
        if update.set.iter().any(|(path, _)| path == ID_FIELD)
            || update.unset.iter().any(|path| path == ID_FIELD)
        {
            return Err(DbError::InvalidInput("_id is immutable".into()));
        }
        let mut new_doc = old_doc.clone();
        if !apply_update(&mut new_doc, update) {
            return Ok(0);
        }
        for index in self.indexes.all() {
            index.check_unique(&new_doc, Some(rid))?;
        }
        let new_rid = self.heap.update(rid, &encode_document(&new_doc))?;
        for index in self.indexes.all() {
            index.remove_document(&old_doc, rid)?;
            index.insert_document(&new_doc, new_rid)?;
        }
        if let Some(id) = new_doc.id() {
            let version = self.txns.next_version();
            self.versions.put(&id, new_doc, version);
        }
        self.flush_indexes()?;
        self.wal.flush()?;
        self.persist_metadata_changes()?;
        Ok(1)
    }

    fn delete_locked(&self, rid: RecordId, doc: &Document) -> Result<(), DbError> {
        self.heap.delete(rid)?;
        for index in self.indexes.all() {
            index.remove_document(doc, rid)?;
        }
        if let Some(id) = doc.id() {
            let version = self.txns.next_version();
            self.versions.delete(&id, version);
        }
        self.doc_count.fetch_sub(1, Ordering::SeqCst);
        self.flush_indexes()?;
        self.wal.flush()?;
        Ok(())
    }

    /// Executes a plan and returns candidate `(rid, stored document)`
    /// pairs; callers still re-apply the full filter.
    fn fetch_candidates(
        &self,
        plan: &QueryPlan,
        cancel: &CancelToken,
    ) -> Result<Vec<(RecordId, Document)>, DbError> {
        let rids: Vec<RecordId> = match plan.strategy {
            ScanStrategy::FullScan => {
                let mut out = Vec::new();
                for (rid, bytes) in self.heap.scan(cancel)? {
                    out.push((rid, decode_document(&bytes)?));
                }
                return Ok(out);
            }
            ScanStrategy::IndexLookup => {
                let name = plan.index.as_deref().unwrap_or_default();
                let index = self
                    .indexes
                    .get(name)
                    .ok_or_else(|| DbError::NotFound(format!("index {name}")))?;
                index.ensure_ready()?;
                let key = plan
                    .eq_key
                    .as_ref()
                    .ok_or_else(|| DbError::InvalidInput("lookup plan without a key".into()))?;
                index.tree.get_all(key)?
            }
            ScanStrategy::RangeScan => {
                let name = plan.index.as_deref().unwrap_or_default();
                let index = self
                    .indexes
                    .get(name)
                    .ok_or_else(|| DbError::NotFound(format!("index {name}")))?;
                index.ensure_ready()?;
                index
                    .tree
                    .range_scan(plan.range.0.as_ref(), plan.range.1.as_ref(), cancel)?
                    .into_iter()
                    .map(|(_, rid)| rid)
                    .collect()
            }
        };
        let mut out = Vec::with_capacity(rids.len());
        for rid in rids {
            cancel.check()?;
            let bytes = self.heap.read(rid)?;
            out.push((rid, decode_document(&bytes)?));
        }
        Ok(out)
    }

    fn find_at(
        &self,
        filter: &Filter,
        opts: &FindOptions,
        snapshot: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<Document>, DbError> {
        let plan = plan_query(filter, &self.indexes.all(), self.len());
        let candidates = self.fetch_candidates(&plan, cancel)?;
        let mut matched = Vec::new();
        for (_, stored) in candidates {
            cancel.check()?;
            let effective = match stored.id() {
                Some(id) if self.versions.contains(&id) => {
                    match self.versions.get(&id, snapshot) {
                        Some(doc) => doc,
                        None => continue, // not visible at this snapshot
                    }
                }
                _ => stored,
            };
            if matches(filter, &effective) {
                matched.push(effective);
            }
        }
        let skip = opts.skip.unwrap_or(0);
        let limited: Vec<Document> = match opts.limit {
            Some(limit) => matched.into_iter().skip(skip).take(limit).collect(),
            None => matched.into_iter().skip(skip).collect(),
        };
        Ok(match &opts.projection {
            Some(fields) => limited.iter().map(|doc| doc.project(fields)).collect(),
            None => limited,
        })
    }

    /// Latest-state matches for read-modify-write; caller holds the
    /// write gate.
    fn matching_latest(
        &self,
        filter: &Filter,
        cancel: &CancelToken,
        limit: Option<usize>,
    ) -> Result<Vec<(RecordId, Document)>, DbError> {
        let plan = plan_query(filter, &self.indexes.all(), self.len());
        let candidates = self.fetch_candidates(&plan, cancel)?;
        let mut out = Vec::new();
        for (rid, stored) in candidates {
            cancel.check()?;
            if matches(filter, &stored) {
                out.push((rid, stored));
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn aggregate_inner(
        &self,
        stages: &[AggregateStage],
        cancel: &CancelToken,
    ) -> Result<Vec<Document>, DbError> {
        let mut stages = stages.iter();
        let mut pending = stages.next();
        let initial = match pending {
            Some(AggregateStage::Match(filter)) => {
                pending = stages.next();
                filter.clone()
            }
            _ => Filter::True,
        };
        let snapshot = self.txns.begin_snapshot();
        let scanned =
            self.find_at(&initial, &FindOptions::default(), snapshot.version, cancel);
        self.txns.release_snapshot(snapshot);
        let mut docs = scanned?;

        while let Some(stage) = pending {
            cancel.check()?;
            match stage {
                AggregateStage::Match(filter) => docs.retain(|doc| matches(filter, doc)),
                AggregateStage::Sort { field, order } => {
                    docs.sort_by(|a, b| {
                        let ord = match (a.get_path(field), b.get_path(field)) {
                            (Some(x), Some(y)) => crate::document::compare_values(x, y),
                            (Some(_), None) => CmpOrdering::Greater,
                            (None, Some(_)) => CmpOrdering::Less,
                            (None, None) => CmpOrdering::Equal,
                        };
                        match order {
                            SortOrder::Asc => ord,
                            SortOrder::Desc => ord.reverse(),
                        }
                    });
                }
                AggregateStage::Skip(n) => {
                    docs = docs.into_iter().skip(*n).collect();
                }
                AggregateStage::Limit(n) => docs.truncate(*n),
                AggregateStage::Project(fields) => {
                    docs = docs.iter().map(|doc| doc.project(fields)).collect();
                }
                AggregateStage::Count(into) => {
                    let mut counted = Document::new();
                    counted.set(into.clone(), Value::Int64(docs.len() as i64));
                    docs = vec![counted];
                }
            }
            pending = stages.next();
        }
        Ok(docs)
    }
}
