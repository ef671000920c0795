//! Name/ID metadata cache
//!
//! Bounded LRU with a time-to-live, keyed by numeric ID, with a secondary
//! `name -> id` index. Both maps sit behind one mutex so evicting an entry
//! and dropping its name happen in the same critical section.
//!
//! Expiry is checked lazily on read; an expired entry is removed and reported
//! as a miss so the caller re-resolves it from the authoritative store.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    loaded: Instant,
    name: Option<String>,
    value: V,
}

struct Inner<V> {
    entries: LruCache<i64, Entry<V>>,
    names: HashMap<String, i64>,
    ttl: Duration,
}

impl<V> Inner<V> {
    fn is_expired(&self, entry: &Entry<V>) -> bool {
        !self.ttl.is_zero() && entry.loaded.elapsed() >= self.ttl
    }

    /// Drop `name` only if it still points at `id`
    fn drop_name(&mut self, name: &str, id: i64) {
        if self.names.get(name) == Some(&id) {
            self.names.remove(name);
        }
    }

    fn insert(&mut self, id: i64, entry: Entry<V>) {
        if let Some((evicted_id, evicted)) = self.entries.push(id, entry) {
            if evicted_id != id {
                if let Some(name) = evicted.name {
                    self.drop_name(&name, evicted_id);
                }
            }
        }
    }

    fn remove(&mut self, id: i64) -> Option<Entry<V>> {
        let entry = self.entries.pop(&id)?;
        if let Some(name) = &entry.name {
            self.drop_name(name, id);
        }
        Some(entry)
    }

    /// Fresh entry for `id`, evicting it if expired
    fn live(&mut self, id: i64) -> Option<&Entry<V>> {
        let expired = match self.entries.peek(&id) {
            Some(entry) => self.is_expired(entry),
            None => return None,
        };
        if expired {
            self.remove(id);
            return None;
        }
        self.entries.get(&id)
    }

    /// Live entry bound to `name`; a stale binding is dropped on the way
    fn live_by_name(&mut self, name: &str) -> Option<(i64, &Entry<V>)> {
        let id = *self.names.get(name)?;
        let bound = matches!(self.live(id), Some(entry) if entry.name.as_deref() == Some(name));
        if !bound {
            self.names.remove(name);
            return None;
        }
        self.entries.peek(&id).map(|entry| (id, entry))
    }

    fn unlink(&mut self, name: &str) {
        if let Some(id) = self.names.remove(name) {
            if let Some(entry) = self.entries.peek_mut(&id) {
                if entry.name.as_deref() == Some(name) {
                    entry.name = None;
                }
            }
        }
    }
}

/// LRU + TTL cache of values addressable by ID or by name
pub struct MetadataCache<V> {
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> MetadataCache<V> {
    /// Cache holding at most `capacity` entries for `ttl` each
    ///
    /// A zero `ttl` disables expiry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                names: HashMap::new(),
                ttl,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // Every critical section leaves both maps consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cache `value` under `id` and bind `name` to it
    ///
    /// `name` is unlinked from any other ID, and `id` from any other name.
    pub fn set(&self, name: &str, id: i64, value: V) {
        let mut inner = self.lock();

        if let Some(old_id) = inner.names.get(name).copied() {
            if old_id != id {
                inner.unlink(name);
            }
        }
        if let Some(old_name) = inner.entries.peek(&id).and_then(|e| e.name.clone()) {
            if old_name != name {
                inner.drop_name(&old_name, id);
            }
        }

        inner.insert(
            id,
            Entry {
                loaded: Instant::now(),
                name: Some(name.to_string()),
                value,
            },
        );
        inner.names.insert(name.to_string(), id);
    }

    /// Cache `value` under `id` without a name
    pub fn set_id(&self, id: i64, value: V) {
        let mut inner = self.lock();
        if let Some(old_name) = inner.entries.peek(&id).and_then(|e| e.name.clone()) {
            inner.drop_name(&old_name, id);
        }
        inner.insert(
            id,
            Entry {
                loaded: Instant::now(),
                name: None,
                value,
            },
        );
    }

    /// Refresh the value under `id`, keeping its name binding
    pub fn update(&self, id: i64, value: V) {
        let mut inner = self.lock();
        let name = inner.live(id).and_then(|e| e.name.clone());
        inner.insert(
            id,
            Entry {
                loaded: Instant::now(),
                name,
                value,
            },
        );
    }

    pub fn get_by_id(&self, id: i64) -> Option<V> {
        self.lock().live(id).map(|e| e.value.clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<V> {
        self.lock()
            .live_by_name(name)
            .map(|(_, entry)| entry.value.clone())
    }

    /// ID a name is bound to, if the binding is cached and unexpired
    pub fn get_name_id(&self, name: &str) -> Option<i64> {
        self.lock().live_by_name(name).map(|(id, _)| id)
    }

    pub fn unlink_name(&self, name: &str) {
        self.lock().unlink(name);
    }

    /// Unlink every name starting with `prefix`
    ///
    /// Linear in the number of cached names.
    pub fn unlink_name_prefix(&self, prefix: &str) {
        let mut inner = self.lock();
        let names: Vec<String> = inner
            .names
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        for name in names {
            inner.unlink(&name);
        }
    }

    pub fn remove_id(&self, id: i64) {
        self.lock().remove(id);
    }

    pub fn remove_name(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(id) = inner.names.remove(name) {
            inner.remove(id);
        }
    }

    /// Drop every name binding; entries stay reachable by ID
    pub fn purge_names(&self) {
        let mut inner = self.lock();
        inner.names.clear();
        for (_, entry) in inner.entries.iter_mut() {
            entry.name = None;
        }
    }

    pub fn purge(&self) {
        let mut inner = self.lock();
        inner.names.clear();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of name bindings
    pub fn name_count(&self) -> usize {
        self.lock().names.len()
    }
}
