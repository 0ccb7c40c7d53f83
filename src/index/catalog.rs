use super::btree::BPlusTree;
use super::key::{IndexKey, KeyType};
use super::stats::IndexStatistics;
use crate::cancel::CancelToken;
use crate::document::Document;
use crate::errors::DbError;
use crate::query::{Filter, matches};
use crate::storage::{PageId, RecordId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Build state of an index. Background builds install as `Building`
/// and flip to `Ready` (or `Failed`) when the backfill finishes; reads
/// of a non-ready index surface `NotReady`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Ready,
    Building { total: u64, processed: u64 },
    Failed(String),
}

/// Declarative index definition, as supplied by `create_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub key_type: KeyType,
    pub unique: bool,
    pub partial_filter: Option<Filter>,
    #[serde(default)]
    pub background: bool,
}

impl IndexSpec {
    /// # Errors
    /// `InvalidInput` for an empty field list or a compound spec whose
    /// key type is not composite.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.name.is_empty() {
            return Err(DbError::InvalidInput("index name must not be empty".into()));
        }
        if self.fields.is_empty() {
            return Err(DbError::InvalidInput(format!("index {} declares no fields", self.name)));
        }
        if self.fields.len() > 1 && self.key_type != KeyType::Composite {
            return Err(DbError::InvalidInput(format!(
                "compound index {} must use composite keys",
                self.name
            )));
        }
        if self.fields.len() == 1 && self.key_type == KeyType::Composite {
            return Err(DbError::InvalidInput(format!(
                "single-field index {} cannot use composite keys",
                self.name
            )));
        }
        Ok(())
    }
}

/// Durable form of one index, persisted in the collection catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub spec: IndexSpec,
    pub root_page: PageId,
    pub order: usize,
    pub build_state: BuildState,
}

/// Extracts the index key for a document, honoring the partial filter.
/// `Ok(None)` means the document gets no entry (filtered out, or a key
/// field is absent).
/// # Errors
/// `InvalidInput` when a present field holds a non-indexable or
/// mistyped value.
pub fn extract_key(spec: &IndexSpec, doc: &Document) -> Result<Option<IndexKey>, DbError> {
    if let Some(filter) = &spec.partial_filter
        && !matches(filter, doc)
    {
        return Ok(None);
    }
    if spec.fields.len() == 1 {
        match doc.get_path(&spec.fields[0]) {
            Some(value) => IndexKey::from_value(value, spec.key_type).map(Some),
            None => Ok(None),
        }
    } else {
        let mut parts = Vec::with_capacity(spec.fields.len());
        for field in &spec.fields {
            match doc.get_path(field) {
                Some(value) => parts.push(IndexKey::from_value_infer(value)?),
                None => return Ok(None),
            }
        }
        Ok(Some(IndexKey::Composite(parts)))
    }
}

/// One live index: spec, tree, build state and statistics.
pub struct ManagedIndex {
    pub spec: IndexSpec,
    pub tree: BPlusTree,
    state: RwLock<BuildState>,
    stats: Mutex<IndexStatistics>,
}

impl ManagedIndex {
    #[must_use]
    pub fn new(spec: IndexSpec, tree: BPlusTree, state: BuildState) -> Self {
        Self { spec, tree, state: RwLock::new(state), stats: Mutex::new(IndexStatistics::default()) }
    }

    #[must_use]
    pub fn state(&self) -> BuildState {
        self.state.read().clone()
    }

    pub fn set_state(&self, state: BuildState) {
        *self.state.write() = state;
    }

    pub fn bump_progress(&self, processed: u64) {
        let mut state = self.state.write();
        if let BuildState::Building { total, .. } = *state {
            *state = BuildState::Building { total, processed };
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), BuildState::Ready)
    }

    /// # Errors
    /// `NotReady` while the index is building or failed.
    pub fn ensure_ready(&self) -> Result<(), DbError> {
        match &*self.state.read() {
            BuildState::Ready => Ok(()),
            BuildState::Building { total, processed } => Err(DbError::NotReady(format!(
                "index {} is building ({processed}/{total})",
                self.spec.name
            ))),
            BuildState::Failed(reason) => {
                Err(DbError::NotReady(format!("index {} failed: {reason}", self.spec.name)))
            }
        }
    }

    /// Adds the document's entry, if it has one. Writes dual-write even
    /// while the index is still building.
    /// # Errors
    /// `Duplicate` from a unique tree; extraction errors.
    pub fn insert_document(&self, doc: &Document, rid: RecordId) -> Result<(), DbError> {
        if let Some(key) = extract_key(&self.spec, doc)? {
            self.tree.insert(key, rid)?;
            self.stats.lock().mark_stale();
        }
        Ok(())
    }

    /// Removes the document's entry, if it had one.
    /// # Errors
    /// Extraction or storage errors.
    pub fn remove_document(&self, doc: &Document, rid: RecordId) -> Result<(), DbError> {
        if let Some(key) = extract_key(&self.spec, doc)? {
            self.tree.delete(&key, Some(rid))?;
            self.stats.lock().mark_stale();
        }
        Ok(())
    }

    /// Would inserting this document violate the unique constraint?
    /// `exclude` tolerates the document's own current entry during an
    /// update.
    /// # Errors
    /// `Duplicate` on a violation; extraction or storage errors.
    pub fn check_unique(&self, doc: &Document, exclude: Option<RecordId>) -> Result<(), DbError> {
        if !self.spec.unique {
            return Ok(());
        }
        if let Some(key) = extract_key(&self.spec, doc)? {
            let taken = self
                .tree
                .get_all(&key)?
                .into_iter()
                .any(|rid| exclude.is_none_or(|own| rid != own));
            if taken {
                return Err(DbError::Duplicate(format!(
                    "duplicate key {key} for unique index {}",
                    self.spec.name
                )));
            }
        }
        Ok(())
    }

    /// Full-scan statistics refresh.
    /// # Errors
    /// `Cancelled` or storage errors from the scan.
    pub fn analyze(&self, cancel: &CancelToken) -> Result<IndexStatistics, DbError> {
        let entries = self.tree.range_scan(None, None, cancel)?;
        let mut stats = self.stats.lock();
        stats.recompute(&entries);
        Ok(stats.clone())
    }

    #[must_use]
    pub fn statistics(&self) -> IndexStatistics {
        self.stats.lock().clone()
    }

    #[must_use]
    pub fn meta(&self) -> IndexMeta {
        IndexMeta {
            spec: self.spec.clone(),
            root_page: self.tree.root_page_id(),
            order: self.tree.order(),
            build_state: self.state(),
        }
    }
}

/// Per-collection registry of all index variants.
#[derive(Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<String, Arc<ManagedIndex>>>,
}

impl IndexRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `Duplicate` when the name is taken.
    pub fn register(&self, index: Arc<ManagedIndex>) -> Result<(), DbError> {
        let mut map = self.indexes.write();
        if map.contains_key(&index.spec.name) {
            return Err(DbError::Duplicate(format!("index {} already exists", index.spec.name)));
        }
        map.insert(index.spec.name.clone(), index);
        Ok(())
    }

    /// # Errors
    /// `NotFound` for an unknown name.
    pub fn unregister(&self, name: &str) -> Result<Arc<ManagedIndex>, DbError> {
        self.indexes
            .write()
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("index {name}")))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ManagedIndex>> {
        self.indexes.read().get(name).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<ManagedIndex>> {
        self.indexes.read().values().cloned().collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;

    fn spec_on(field: &str, key_type: KeyType) -> IndexSpec {
        IndexSpec {
            name: format!("{field}_1"),
            fields: vec![field.to_string()],
            key_type,
            unique: false,
            partial_filter: None,
            background: false,
        }
    }

    #[test]
    fn extract_single_field() {
        let spec = spec_on("age", KeyType::Int64);
        let doc = crate::doc! { "age" => Value::Int64(33) };
        assert_eq!(extract_key(&spec, &doc).unwrap(), Some(IndexKey::Int64(33)));
        let missing = crate::doc! { "name" => Value::String("x".into()) };
        assert_eq!(extract_key(&spec, &missing).unwrap(), None);
    }

    #[test]
    fn extract_respects_partial_filter() {
        let mut spec = spec_on("age", KeyType::Int64);
        spec.partial_filter = Some(Filter::Cmp {
            path: "age".into(),
            op: crate::query::CmpOp::Gte,
            value: Value::Int64(18),
        });
        let adult = crate::doc! { "age" => Value::Int64(20) };
        let minor = crate::doc! { "age" => Value::Int64(10) };
        assert!(extract_key(&spec, &adult).unwrap().is_some());
        assert!(extract_key(&spec, &minor).unwrap().is_none());
    }

    #[test]
    fn extract_compound_needs_every_field() {
        let spec = IndexSpec {
            name: "country_user".into(),
            fields: vec!["country".into(), "user_id".into()],
            key_type: KeyType::Composite,
            unique: false,
            partial_filter: None,
            background: false,
        };
        let full = crate::doc! {
            "country" => Value::String("US".into()),
            "user_id" => Value::Int64(7),
        };
        assert_eq!(
            extract_key(&spec, &full).unwrap(),
            Some(IndexKey::Composite(vec![
                IndexKey::String("US".into()),
                IndexKey::Int64(7)
            ]))
        );
        let partial = crate::doc! { "country" => Value::String("US".into()) };
        assert_eq!(extract_key(&spec, &partial).unwrap(), None);
    }

    #[test]
    fn spec_validation() {
        assert!(spec_on("a", KeyType::Int64).validate().is_ok());
        let bad = IndexSpec {
            name: "bad".into(),
            fields: vec!["a".into(), "b".into()],
            key_type: KeyType::Int64,
            unique: false,
            partial_filter: None,
            background: false,
        };
        assert!(matches!(bad.validate(), Err(DbError::InvalidInput(_))));
    }
}
