use super::key::{IndexKey, KeyType};
use super::node::{NODE_PAYLOAD_SIZE, Node};
use super::node_cache::{NodeCache, NodeCacheMetricsSnapshot};
use super::MIN_ORDER;
use crate::cancel::CancelToken;
use crate::errors::DbError;
use crate::storage::{BufferPool, DiskManager, PageId, RecordId, Wal};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

struct TreeMeta {
    root: PageId,
}

/// Page-backed B+ tree from typed keys to record ids. Nodes live one
/// per page, loaded lazily through a per-index node cache; leaves chain
/// through `next` for range scans. Deletion does not rebalance on
/// underflow.
pub struct BPlusTree {
    meta: Mutex<TreeMeta>,
    order: usize,
    key_type: KeyType,
    unique: bool,
    cache: NodeCache,
    lock: RwLock<()>,
    disk: Arc<DiskManager>,
}

impl BPlusTree {
    /// Creates an empty tree with a fresh leaf root.
    /// # Errors
    /// `InvalidInput` for an order below the minimum.
    pub fn create(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        key_type: KeyType,
        unique: bool,
        order: usize,
        cache_capacity: usize,
    ) -> Result<Self, DbError> {
        if order < MIN_ORDER {
            return Err(DbError::InvalidInput(format!("index order {order} is below minimum {MIN_ORDER}")));
        }
        let root = disk.allocate()?;
        let cache = NodeCache::new(pool, wal, cache_capacity);
        cache.put(Node::new_leaf(root))?;
        // The empty root must reach the WAL before the catalog can
        // reference it.
        cache.flush_dirty()?;
        Ok(Self {
            meta: Mutex::new(TreeMeta { root }),
            order,
            key_type,
            unique,
            cache,
            lock: RwLock::new(()),
            disk,
        })
    }

    /// Reattaches to a persisted tree.
    pub fn open(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        key_type: KeyType,
        unique: bool,
        order: usize,
        cache_capacity: usize,
        root: PageId,
    ) -> Self {
        Self {
            meta: Mutex::new(TreeMeta { root }),
            order: order.max(MIN_ORDER),
            key_type,
            unique,
            cache: NodeCache::new(pool, wal, cache_capacity),
            lock: RwLock::new(()),
            disk,
        }
    }

    #[must_use]
    pub fn root_page_id(&self) -> PageId {
        self.meta.lock().root
    }

    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn cache_metrics(&self) -> NodeCacheMetricsSnapshot {
        self.cache.metrics()
    }

    /// Largest encoded key this tree's order leaves room for.
    fn max_key_len(&self) -> usize {
        NODE_PAYLOAD_SIZE / (self.order + 1) - 12
    }

    fn validate_key(&self, key: &IndexKey) -> Result<(), DbError> {
        if key.key_type() != self.key_type {
            return Err(DbError::InvalidInput(format!(
                "{:?} key offered to a {:?} index",
                key.key_type(),
                self.key_type
            )));
        }
        if key.encoded_len() > self.max_key_len() {
            return Err(DbError::InvalidInput(format!(
                "encoded key of {} bytes exceeds the {}-byte limit for order {}",
                key.encoded_len(),
                self.max_key_len(),
                self.order
            )));
        }
        Ok(())
    }

    /// Descends to the leaf that may contain `key` (leftmost leaf when
    /// `key` is `None`), recording the path of internal page ids.
    fn find_leaf(&self, key: Option<&IndexKey>) -> Result<(Node, Vec<PageId>), DbError> {
        let mut path = Vec::new();
        let mut node = self.cache.get(self.root_page_id())?;
        while !node.leaf {
            let idx = match key {
                // Left-biased on equality so scans start at the
                // leftmost candidate leaf.
                Some(key) => node.keys.partition_point(|k| k < key),
                None => 0,
            };
            let child = *node.children.get(idx).ok_or_else(|| {
                DbError::Corruption(format!("internal node {} lacks child {idx}", node.page_id))
            })?;
            path.push(node.page_id);
            node = self.cache.get(child)?;
        }
        Ok((node, path))
    }

    /// Inserts one entry. Duplicate keys are rejected for unique trees
    /// before anything is mutated.
    /// # Errors
    /// `Duplicate`, `InvalidInput`, or storage errors.
    pub fn insert(&self, key: IndexKey, rid: RecordId) -> Result<(), DbError> {
        self.validate_key(&key)?;
        let _guard = self.lock.write();
        if self.unique && !self.collect_equal(&key, Some(1))?.is_empty() {
            return Err(DbError::Duplicate(format!("key {key} already indexed")));
        }
        let (mut leaf, mut path) = self.find_leaf(Some(&key))?;
        let pos = leaf.keys.partition_point(|k| k < &key);
        leaf.keys.insert(pos, key);
        leaf.values.insert(pos, rid);
        if leaf.keys.len() >= self.order {
            self.split_leaf(leaf, &mut path)?;
        } else {
            self.cache.put(leaf)?;
        }
        Ok(())
    }

    /// First record id stored under `key`.
    /// # Errors
    /// `InvalidInput` for a mistyped key; storage errors.
    pub fn search(&self, key: &IndexKey) -> Result<Option<RecordId>, DbError> {
        self.validate_key(key)?;
        let _guard = self.lock.read();
        Ok(self.collect_equal(key, Some(1))?.into_iter().next())
    }

    /// Every record id stored under `key` (non-unique trees may hold
    /// several).
    /// # Errors
    /// `InvalidInput` for a mistyped key; storage errors.
    pub fn get_all(&self, key: &IndexKey) -> Result<Vec<RecordId>, DbError> {
        self.validate_key(key)?;
        let _guard = self.lock.read();
        self.collect_equal(key, None)
    }

    /// Removes one entry matching `key` (and `rid`, when given).
    /// Returns whether anything was removed; no rebalancing happens on
    /// underflow.
    /// # Errors
    /// `InvalidInput` for a mistyped key; storage errors.
    pub fn delete(&self, key: &IndexKey, rid: Option<RecordId>) -> Result<bool, DbError> {
        self.validate_key(key)?;
        let _guard = self.lock.write();
        let (mut leaf, _) = self.find_leaf(Some(key))?;
        loop {
            let start = leaf.keys.partition_point(|k| k < key);
            for idx in start..leaf.keys.len() {
                if &leaf.keys[idx] != key {
                    return Ok(false);
                }
                if rid.is_none_or(|r| leaf.values[idx] == r) {
                    leaf.keys.remove(idx);
                    leaf.values.remove(idx);
                    self.cache.put(leaf)?;
                    return Ok(true);
                }
            }
            if leaf.next == 0 {
                return Ok(false);
            }
            leaf = self.cache.get(leaf.next)?;
        }
    }

    /// Ordered scan over `[lo, hi]`; either bound may be absent (±∞).
    /// Checks the cancel token at every leaf boundary.
    /// # Errors
    /// `Cancelled` mid-scan, `InvalidInput` for mistyped bounds.
    pub fn range_scan(
        &self,
        lo: Option<&IndexKey>,
        hi: Option<&IndexKey>,
        cancel: &CancelToken,
    ) -> Result<Vec<(IndexKey, RecordId)>, DbError> {
        if let Some(lo) = lo {
            self.validate_key(lo)?;
        }
        if let Some(hi) = hi {
            self.validate_key(hi)?;
        }
        let _guard = self.lock.read();
        let (mut leaf, _) = self.find_leaf(lo)?;
        let mut out = Vec::new();
        loop {
            cancel.check()?;
            for (key, rid) in leaf.keys.iter().zip(leaf.values.iter()) {
                if lo.is_some_and(|lo| key < lo) {
                    continue;
                }
                if hi.is_some_and(|hi| key > hi) {
                    return Ok(out);
                }
                out.push((key.clone(), *rid));
            }
            if leaf.next == 0 {
                return Ok(out);
            }
            leaf = self.cache.get(leaf.next)?;
        }
    }

    /// Writes dirty nodes back through the buffer pool.
    /// # Errors
    /// Storage errors from the write-back path.
    pub fn flush(&self) -> Result<(), DbError> {
        let _guard = self.lock.read();
        self.cache.flush_dirty()
    }

    /// Releases every node page to the disk free list (index drop).
    /// # Errors
    /// Storage errors while walking or freeing pages.
    pub fn free_pages(&self) -> Result<(), DbError> {
        let _guard = self.lock.write();
        let mut stack = vec![self.root_page_id()];
        while let Some(id) = stack.pop() {
            let node = self.cache.get(id)?;
            if !node.leaf {
                stack.extend(node.children.iter().copied());
            }
            self.cache.evict(id);
            self.disk.free(id)?;
        }
        Ok(())
    }

    fn collect_equal(
        &self,
        key: &IndexKey,
        limit: Option<usize>,
    ) -> Result<Vec<RecordId>, DbError> {
        let (mut leaf, _) = self.find_leaf(Some(key))?;
        let mut out = Vec::new();
        loop {
            let start = leaf.keys.partition_point(|k| k < key);
            for idx in start..leaf.keys.len() {
                if &leaf.keys[idx] != key {
                    return Ok(out);
                }
                out.push(leaf.values[idx]);
                if limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
            if leaf.next == 0 {
                return Ok(out);
            }
            leaf = self.cache.get(leaf.next)?;
        }
    }

    fn split_leaf(&self, mut leaf: Node, path: &mut Vec<PageId>) -> Result<(), DbError> {
        let mid = leaf.keys.len() / 2;
        let right_id = self.disk.allocate()?;
        let mut right = Node::new_leaf(right_id);
        right.keys = leaf.keys.split_off(mid);
        right.values = leaf.values.split_off(mid);
        // Leaves promote a copy of the first right key.
        let separator = right.keys[0].clone();
        right.next = leaf.next;
        right.prev = leaf.page_id;
        if right.next != 0 {
            let mut after = self.cache.get(right.next)?;
            after.prev = right_id;
            self.cache.put(after)?;
        }
        leaf.next = right_id;
        let left_id = leaf.page_id;
        self.cache.put(leaf)?;
        self.cache.put(right)?;
        self.insert_into_parent(path, left_id, separator, right_id, 1)
    }

    fn split_internal(&self, mut node: Node, path: &mut Vec<PageId>) -> Result<(), DbError> {
        let mid = node.keys.len() / 2;
        // Internals promote the middle key itself.
        let separator = node.keys[mid].clone();
        let right_id = self.disk.allocate()?;
        let mut right = Node::new_internal(right_id, node.level);
        right.keys = node.keys.split_off(mid + 1);
        node.keys.pop();
        right.children = node.children.split_off(mid + 1);
        let left_id = node.page_id;
        let level = node.level;
        self.cache.put(node)?;
        self.cache.put(right)?;
        self.insert_into_parent(path, left_id, separator, right_id, level + 1)
    }

    fn insert_into_parent(
        &self,
        path: &mut Vec<PageId>,
        left: PageId,
        separator: IndexKey,
        right: PageId,
        level: u8,
    ) -> Result<(), DbError> {
        let Some(parent_id) = path.pop() else {
            // The promotion bubbled past the root; grow the tree.
            let root_id = self.disk.allocate()?;
            let mut root = Node::new_internal(root_id, level);
            root.keys.push(separator);
            root.children.push(left);
            root.children.push(right);
            self.cache.put(root)?;
            self.meta.lock().root = root_id;
            return Ok(());
        };
        let mut parent = self.cache.get(parent_id)?;
        let idx = parent.children.iter().position(|c| *c == left).ok_or_else(|| {
            DbError::Corruption(format!("parent {parent_id} lost child {left} during split"))
        })?;
        parent.keys.insert(idx, separator);
        parent.children.insert(idx + 1, right);
        if parent.keys.len() >= self.order {
            self.split_internal(parent, path)
        } else {
            self.cache.put(parent)?;
            Ok(())
        }
    }
}
