use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One version in a key's chain. `deleted_by == 0` means live.
#[derive(Debug, Clone)]
pub struct VersionedValue<V> {
    pub value: V,
    pub version: u64,
    pub deleted_by: u64,
}

/// Per-key version chains, newest-first, with snapshot visibility and
/// garbage collection. The outer map lock is held only to find a
/// chain; mutations run under the chain's own lock.
pub struct VersionStore<K, V> {
    chains: Mutex<HashMap<K, Arc<Mutex<Vec<VersionedValue<V>>>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for VersionStore<K, V> {
    fn default() -> Self {
        Self { chains: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> VersionStore<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, key: &K) -> Arc<Mutex<Vec<VersionedValue<V>>>> {
        let mut chains = self.chains.lock();
        chains.entry(key.clone()).or_default().clone()
    }

    /// Publishes a new version at the head of the key's chain.
    pub fn put(&self, key: &K, value: V, version: u64) {
        let chain = self.chain(key);
        let mut chain = chain.lock();
        chain.insert(0, VersionedValue { value, version, deleted_by: 0 });
    }

    /// Stamps the head version as deleted by `version`.
    pub fn delete(&self, key: &K, version: u64) {
        let chain = self.chain(key);
        let mut chain = chain.lock();
        if let Some(head) = chain.first_mut()
            && head.deleted_by == 0
        {
            head.deleted_by = version;
        }
    }

    /// The newest version visible at `snapshot`: the first node whose
    /// version is at or below the snapshot and which the snapshot
    /// cannot see as deleted.
    #[must_use]
    pub fn get(&self, key: &K, snapshot: u64) -> Option<V> {
        let chain = self.chains.lock().get(key).cloned()?;
        let chain = chain.lock();
        chain
            .iter()
            .find(|node| node.version <= snapshot)
            .filter(|node| node.deleted_by == 0 || node.deleted_by > snapshot)
            .map(|node| node.value.clone())
    }

    /// The head version, unless it is deleted.
    #[must_use]
    pub fn get_latest(&self, key: &K) -> Option<V> {
        let chain = self.chains.lock().get(key).cloned()?;
        let chain = chain.lock();
        chain.first().filter(|node| node.deleted_by == 0).map(|node| node.value.clone())
    }

    /// True when the key has a chain at all (even a deleted one).
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.chains.lock().contains_key(key)
    }

    /// Trims every chain below the oldest active snapshot. The newest
    /// node visible at `min_active` is always kept while it is live, so
    /// the call is idempotent and never removes a version some snapshot
    /// at or above `min_active` could still read.
    pub fn gc(&self, min_active: u64) {
        let chains: Vec<(K, Arc<Mutex<Vec<VersionedValue<V>>>>)> = {
            let map = self.chains.lock();
            map.iter().map(|(k, c)| (k.clone(), c.clone())).collect()
        };
        let mut emptied = Vec::new();
        for (key, chain) in chains {
            let mut chain_guard = chain.lock();
            if let Some(anchor) = chain_guard.iter().position(|node| node.version <= min_active) {
                chain_guard.truncate(anchor + 1);
                // The anchor itself goes too once no snapshot >= min can see it.
                let drop_anchor = chain_guard
                    .last()
                    .is_some_and(|node| node.deleted_by != 0 && node.deleted_by <= min_active);
                if drop_anchor {
                    chain_guard.pop();
                }
            }
            if chain_guard.is_empty() {
                emptied.push(key);
            }
        }
        if !emptied.is_empty() {
            let mut map = self.chains.lock();
            for key in emptied {
                if map.get(&key).is_some_and(|c| c.lock().is_empty()) {
                    map.remove(&key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }
}

/// A registered read snapshot. Release it back to the manager when the
/// read finishes so GC can advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u64,
}

/// Issues monotonically increasing versions and tracks active
/// snapshots for the GC floor.
pub struct TxnManager {
    next: AtomicU64,
    active: Mutex<BTreeMap<u64, u64>>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self { next: AtomicU64::new(1), active: Mutex::new(BTreeMap::new()) }
    }
}

impl TxnManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Version stamp for one write.
    pub fn next_version(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Latest issued version; what a fresh snapshot sees.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.next.load(Ordering::SeqCst).saturating_sub(1)
    }

    #[must_use]
    pub fn begin_snapshot(&self) -> Snapshot {
        let version = self.current_version();
        *self.active.lock().entry(version).or_insert(0) += 1;
        Snapshot { version }
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&snapshot.version) {
            *count -= 1;
            if *count == 0 {
                active.remove(&snapshot.version);
            }
        }
    }

    /// Oldest version any reader may still need.
    #[must_use]
    pub fn min_active_version(&self) -> u64 {
        self.active
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current_version())
    }
}
