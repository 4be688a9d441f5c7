//! Sampled-LRU single-flight cache.
//!
//! Every entry starts `Waiting` and transitions exactly once to `Success` or
//! `Failed`; callers that lose the race to create an entry get back a
//! handle they can await instead of doing duplicate work — the usual
//! single-flight pattern, here generalized with an approximate-recency
//! eviction policy instead of a strict LRU list.
//!
//! Eviction never maintains a global recency list (that would mean an
//! O(1)-but-contended doubly-linked-list splice on every hit). Instead each
//! entry carries a last-access tick from one shared monotonic counter, and
//! eviction samples a handful of random live slots and drops whichever has
//! the oldest tick. With `max_scan` around 5-10 this tracks true LRU closely
//! at a fraction of the coordination cost.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::collections::hashtable::HashTable;
use crate::coroutine::sleep::{self, Addr, SleepOutcome};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Waiting,
    Success,
    Failed,
}

enum Slot<V> {
    Waiting,
    Success(V),
    Failed,
}

impl<V> Slot<V> {
    fn state(&self) -> EntryState {
        match self {
            Slot::Waiting => EntryState::Waiting,
            Slot::Success(_) => EntryState::Success,
            Slot::Failed => EntryState::Failed,
        }
    }
}

struct CacheEntry<V> {
    slot: Mutex<Slot<V>>,
    last_access: AtomicU64,
    addr: Addr,
}

impl<V> CacheEntry<V> {
    fn new(tick: u64) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Waiting),
            last_access: AtomicU64::new(tick),
            addr: sleep::fresh_addr(),
        })
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }
}

/// A handle to one cache slot, returned by `get` and `get_or_create`.
pub struct Handle<V> {
    entry: Arc<CacheEntry<V>>,
}

impl<V: Clone + Send + 'static> Handle<V> {
    pub fn state(&self) -> EntryState {
        self.entry.slot.lock().state()
    }

    /// Reads the value if the entry has reached `Success`.
    pub fn value(&self) -> Option<V> {
        match &*self.entry.slot.lock() {
            Slot::Success(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Fulfils the obligation from a `true`-flagged `get_or_create`: moves
    /// the entry to `Success` and wakes every waiter.
    pub fn emplace_value(&self, value: V) {
        *self.entry.slot.lock() = Slot::Success(value);
        sleep::cancel_sleep_by_addr(self.entry.addr, usize::MAX);
    }

    /// Fulfils the obligation with a failure instead: moves to `Failed` and
    /// wakes every waiter.
    pub fn set_failed(&self) {
        *self.entry.slot.lock() = Slot::Failed;
        sleep::cancel_sleep_by_addr(self.entry.addr, usize::MAX);
    }

    /// Suspends until the entry leaves `Waiting`.
    pub async fn wait(&self) -> Result<EntryState, CoreError> {
        self.wait_deadline(None).await
    }

    pub async fn wait_for(&self, deadline: Instant) -> Result<EntryState, CoreError> {
        self.wait_deadline(Some(deadline)).await
    }

    async fn wait_deadline(&self, deadline: Option<Instant>) -> Result<EntryState, CoreError> {
        loop {
            // Check the state and register the waiter under the same slot
            // lock. `emplace_value`/`set_failed` also take `slot.lock()`
            // before calling `cancel_sleep_by_addr`, so they can never land
            // in the gap between our check and our registration — either
            // they run first and we observe the new state directly, or they
            // run after and find this waiter already registered.
            let ticket = {
                let slot = self.entry.slot.lock();
                let state = slot.state();
                if state != EntryState::Waiting {
                    return Ok(state);
                }
                sleep::register(self.entry.addr, false)
            };
            match ticket.wait(deadline).await {
                SleepOutcome::Canceled => continue,
                SleepOutcome::Success => return Err(CoreError::timeout()),
                SleepOutcome::Aborted => return Err(CoreError::aborted()),
            }
        }
    }
}

struct Table<K, V> {
    index: HashTable<K, usize>,
    entries: Vec<(K, Arc<CacheEntry<V>>)>,
}

impl<K: Hash + Eq + Clone, V> Table<K, V> {
    fn evict_at(&mut self, idx: usize) {
        let removed_key = self.entries[idx].0.clone();
        self.index.erase(&removed_key);
        self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            let moved_key = self.entries[idx].0.clone();
            self.index.erase(&moved_key);
            self.index.insert(moved_key, idx);
        }
    }
}

/// A bounded, single-flight, sampled-LRU cache.
pub struct Cache<K, V> {
    capacity: usize,
    max_scan: usize,
    table: RwLock<Table<K, V>>,
    clock: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone + Send + 'static> Cache<K, V> {
    pub fn new(capacity: usize, max_scan: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            max_scan: max_scan.max(1),
            table: RwLock::new(Table {
                index: HashTable::with_capacity(capacity),
                entries: Vec::with_capacity(capacity),
            }),
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Shared-lock lookup; touches `last_access` on a hit.
    pub fn get(&self, key: &K) -> Option<Handle<V>> {
        let table = self.table.read();
        let idx = *table.index.find(key)?;
        let entry = Arc::clone(&table.entries[idx].1);
        entry.touch(self.tick());
        Some(Handle { entry })
    }

    /// Evicts the sampled-oldest live slot. Caller holds the write lock.
    fn evict_one(&self, table: &mut Table<K, V>) {
        if table.entries.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        let scans = self.max_scan.min(table.entries.len());
        let mut worst_idx = rng.gen_range(0..table.entries.len());
        let mut worst_tick = table.entries[worst_idx].1.last_access.load(Ordering::Relaxed);
        for _ in 1..scans {
            let idx = rng.gen_range(0..table.entries.len());
            let tick = table.entries[idx].1.last_access.load(Ordering::Relaxed);
            if tick < worst_tick {
                worst_idx = idx;
                worst_tick = tick;
            }
        }
        table.evict_at(worst_idx);
    }

    /// Looks up `key`, creating a fresh `Waiting` entry (evicting if
    /// necessary) when absent. The `bool` is `true` when the caller is
    /// responsible for eventually calling `emplace_value` or `set_failed`.
    pub fn get_or_create(&self, key: &K) -> (Handle<V>, bool) {
        if let Some(handle) = self.get(key) {
            return (handle, false);
        }
        let mut table = self.table.write();
        if let Some(&idx) = table.index.find(key) {
            let entry = Arc::clone(&table.entries[idx].1);
            entry.touch(self.tick());
            return (Handle { entry }, false);
        }
        if table.entries.len() >= self.capacity {
            self.evict_one(&mut table);
        }
        let entry = CacheEntry::new(self.tick());
        let idx = table.entries.len();
        table.entries.push((key.clone(), Arc::clone(&entry)));
        table.index.insert(key.clone(), idx);
        (Handle { entry }, true)
    }

    /// Unconditionally installs a `Success` entry, replacing any existing
    /// one. Any handle obtained from a prior `get_or_create` for this key
    /// observes its own, now-orphaned entry — `put` never wakes it.
    pub fn put(&self, key: K, value: V) {
        let mut table = self.table.write();
        if let Some(&idx) = table.index.find(&key) {
            let entry = CacheEntry::new(self.tick());
            *entry.slot.lock() = Slot::Success(value);
            table.entries[idx].1 = entry;
            return;
        }
        if table.entries.len() >= self.capacity {
            self.evict_one(&mut table);
        }
        let entry = CacheEntry::new(self.tick());
        *entry.slot.lock() = Slot::Success(value);
        let idx = table.entries.len();
        table.entries.push((key.clone(), entry));
        table.index.insert(key, idx);
    }

    pub fn remove(&self, key: &K) {
        let mut table = self.table.write();
        if let Some(&idx) = table.index.find(key) {
            table.evict_at(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_signals_ownership_once() {
        let cache: Cache<&str, i32> = Cache::new(4, 3);
        let (h1, created1) = cache.get_or_create(&"a");
        assert!(created1);
        let (h2, created2) = cache.get_or_create(&"a");
        assert!(!created2);
        assert_eq!(h1.state(), EntryState::Waiting);
        h1.emplace_value(42);
        assert_eq!(h2.value(), Some(42));
    }

    #[tokio::test]
    async fn wait_unblocks_after_emplace() {
        let cache = std::sync::Arc::new(Cache::<&str, i32>::new(4, 3));
        let (creator, created) = cache.get_or_create(&"k");
        assert!(created);
        let cache2 = std::sync::Arc::clone(&cache);
        let waiter = tokio::spawn(async move {
            let (handle, _) = cache2.get_or_create(&"k");
            handle.wait().await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        creator.emplace_value(7);
        assert_eq!(waiter.await.unwrap().unwrap(), EntryState::Success);
    }

    #[test]
    fn put_replaces_existing_entry_without_waking_old_handle() {
        let cache: Cache<&str, i32> = Cache::new(4, 3);
        let (old_handle, _) = cache.get_or_create(&"k");
        cache.put("k", 99);
        assert_eq!(old_handle.state(), EntryState::Waiting);
        let (new_handle, created) = cache.get_or_create(&"k");
        assert!(!created);
        assert_eq!(new_handle.value(), Some(99));
    }

    #[test]
    fn eviction_keeps_size_at_capacity() {
        let cache: Cache<i32, i32> = Cache::new(3, 2);
        for i in 0..10 {
            cache.put(i, i);
            assert!(cache.len() <= 3);
        }
    }

    #[test]
    fn set_failed_is_observable() {
        let cache: Cache<&str, i32> = Cache::new(2, 2);
        let (handle, created) = cache.get_or_create(&"x");
        assert!(created);
        handle.set_failed();
        assert_eq!(handle.state(), EntryState::Failed);
    }
}
