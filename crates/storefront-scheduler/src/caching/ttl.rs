use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CacheKey, CacheName};
use crate::config::CacheConfig;
use crate::error::TaskResult;
use crate::types::TaskFuture;

/// A cache entry as handed out by [`TtlCache::get`].
pub enum Entry<T> {
    /// A completed result.
    Value { value: T, stored_at: Instant },
    /// The in-flight execution for this key.
    Pending { future: TaskFuture<T> },
}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value { stored_at, .. } => f
                .debug_struct("Value")
                .field("stored_at", stored_at)
                .finish_non_exhaustive(),
            Self::Pending { .. } => f.debug_struct("Pending").finish_non_exhaustive(),
        }
    }
}

impl<T: Clone> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value { value, stored_at } => Self::Value {
                value: value.clone(),
                stored_at: *stored_at,
            },
            Self::Pending { future } => Self::Pending {
                future: future.clone(),
            },
        }
    }
}

/// Outcome of [`TtlCache::lookup_or_register`].
pub enum Lookup<T> {
    /// A fresh completed value.
    Hit(T),
    /// Another caller already registered an execution for this key.
    InFlight(TaskFuture<T>),
    /// The given future is now the registered execution, identified by the ticket.
    Registered(u64),
}

struct Slot<T> {
    entry: Entry<T>,
    stored_at: Instant,
    /// Insertion order, breaks ties between equal timestamps and doubles as registration ticket.
    order: u64,
}

struct Entries<T> {
    slots: HashMap<CacheKey, Slot<T>>,
    next_order: u64,
}

/// An in-memory cache of completed results and in-flight executions.
///
/// Completed values expire `ttl` after they were stored. Expired values are removed lazily when
/// they are accessed, there is no background sweeping. Once the cache holds `capacity` entries,
/// inserting a new key evicts the oldest completed value.
///
/// Pending registrations are never evicted, as that would allow a second execution of the same
/// work. A cache full of pending registrations thus temporarily grows beyond its capacity.
pub struct TtlCache<T> {
    name: CacheName,
    ttl: Duration,
    capacity: usize,
    entries: Mutex<Entries<T>>,
}

impl<T> fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("len", &self.entries.lock().slots.len())
            .finish()
    }
}

impl<T: Clone> TtlCache<T> {
    pub fn new(name: CacheName, config: &CacheConfig) -> Self {
        Self {
            name,
            ttl: config.ttl,
            capacity: config.capacity.max(1),
            entries: Mutex::new(Entries {
                slots: HashMap::new(),
                next_order: 0,
            }),
        }
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the entry for `key`, unless it is absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<Entry<T>> {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());

        let mut entries = self.entries.lock();
        let entry = self.fresh_entry(&mut entries, key)?;
        if let Entry::Value { .. } = entry {
            metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_ref());
        }
        Some(entry)
    }

    /// Stores a completed value with a fresh timestamp, replacing whatever was stored for `key`.
    pub fn put(&self, key: CacheKey, value: T) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.insert(
            &mut entries,
            key,
            Entry::Value {
                value,
                stored_at: now,
            },
            now,
        );
    }

    /// Registers an in-flight execution for `key`.
    ///
    /// The returned ticket identifies this registration for [`settle`](Self::settle) and
    /// [`abandon`](Self::abandon).
    pub fn put_pending(&self, key: CacheKey, future: TaskFuture<T>) -> u64 {
        let mut entries = self.entries.lock();
        self.insert(&mut entries, key, Entry::Pending { future }, Instant::now())
    }

    /// Atomically joins a fresh value or in-flight execution for `key`, or registers `future`.
    ///
    /// Doing the check and the registration under one lock guarantees that two concurrent
    /// submissions for the same key can never both register an execution.
    pub fn lookup_or_register(&self, key: &CacheKey, future: TaskFuture<T>) -> Lookup<T> {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());

        let mut entries = self.entries.lock();
        match self.fresh_entry(&mut entries, key) {
            Some(Entry::Value { value, .. }) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_ref());
                Lookup::Hit(value)
            }
            Some(Entry::Pending { future }) => Lookup::InFlight(future),
            None => {
                let ticket = self.insert(
                    &mut entries,
                    key.clone(),
                    Entry::Pending { future },
                    Instant::now(),
                );
                Lookup::Registered(ticket)
            }
        }
    }

    /// Settles the pending registration identified by `ticket`.
    ///
    /// A successful result replaces it with a fresh value, a failure removes it so it is never
    /// served to another caller. Nothing happens if the registration is no longer current.
    pub fn settle(&self, key: &CacheKey, ticket: u64, result: &TaskResult<T>) {
        let mut entries = self.entries.lock();
        let Some(slot) = entries.slots.get_mut(key) else {
            return;
        };
        if slot.order != ticket || !matches!(slot.entry, Entry::Pending { .. }) {
            return;
        }

        match result {
            Ok(value) => {
                let now = Instant::now();
                slot.entry = Entry::Value {
                    value: value.clone(),
                    stored_at: now,
                };
                slot.stored_at = now;
            }
            Err(_) => {
                entries.slots.remove(key);
            }
        }
    }

    /// Drops the pending registration identified by `ticket` without storing anything.
    pub fn abandon(&self, key: &CacheKey, ticket: u64) {
        let mut entries = self.entries.lock();
        let is_current = entries.slots.get(key).is_some_and(|slot| {
            slot.order == ticket && matches!(slot.entry, Entry::Pending { .. })
        });
        if is_current {
            entries.slots.remove(key);
        }
    }

    /// Removes the entry for `key` unconditionally, returning whether there was one.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().slots.remove(key).is_some()
    }

    /// The number of entries, including expired ones that were not accessed yet.
    pub fn len(&self) -> usize {
        self.entries.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().slots.clear();
    }

    fn fresh_entry(&self, entries: &mut Entries<T>, key: &CacheKey) -> Option<Entry<T>> {
        let slot = entries.slots.get(key)?;
        if let Entry::Value { stored_at, .. } = slot.entry {
            if stored_at.elapsed() > self.ttl {
                entries.slots.remove(key);
                return None;
            }
        }
        Some(slot.entry.clone())
    }

    fn insert(
        &self,
        entries: &mut Entries<T>,
        key: CacheKey,
        entry: Entry<T>,
        now: Instant,
    ) -> u64 {
        if !entries.slots.contains_key(&key) && entries.slots.len() >= self.capacity {
            self.evict_oldest(entries);
        }

        let order = entries.next_order;
        entries.next_order += 1;
        entries.slots.insert(
            key,
            Slot {
                entry,
                stored_at: now,
                order,
            },
        );
        order
    }

    fn evict_oldest(&self, entries: &mut Entries<T>) {
        let oldest = entries
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.entry, Entry::Value { .. }))
            .min_by_key(|(_, slot)| (slot.stored_at, slot.order))
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            tracing::trace!(cache = %self.name, %key, "Evicting oldest entry");
            metric!(counter("caches.evicted") += 1, "cache" => self.name.as_ref());
            entries.slots.remove(&key);
        }
    }
}
