//! Size-bounded LRU cache of prepared statements.
//!
//! Entries are keyed by the address of the node, the keyspace the connection
//! was using and the statement text. A statement is inserted as soon as its
//! preparation starts, so concurrent preparers of the same key wait for the
//! PREPARE that is already in flight instead of sending their own.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use bytes::Bytes;
use kestrel_cql::frame::response::result::ColumnSpec;
use tokio::sync::watch;
use tracing::trace;

use crate::errors::QueryError;

/// Default bound of a [`StatementCache`].
pub const DEFAULT_MAX_PREPARED_STATEMENTS: usize = 1000;

/// What a node returned for a PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInfo {
    /// Id the node assigned to the statement.
    pub id: Bytes,
    /// Bind markers, in order.
    pub args: Vec<ColumnSpec>,
    /// Columns of the rows the statement returns. Empty on protocol version 1.
    pub rvals: Vec<ColumnSpec>,
}

/// Identifies one prepared statement on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    /// Address of the node the statement was prepared on.
    pub address: String,
    /// Keyspace the connection was using when the statement was prepared.
    pub keyspace: String,
    /// Statement text.
    pub statement: String,
}

type PrepareOutcome = Option<Result<Arc<PreparedInfo>, QueryError>>;

struct Entry {
    last_used: u64,
    generation: u64,
    flight: watch::Receiver<PrepareOutcome>,
}

struct Lru {
    // 0 means unbounded.
    max_entries: usize,
    clock: u64,
    entries: HashMap<StatementKey, Entry>,
    recency: BTreeMap<u64, StatementKey>,
}

impl Lru {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &StatementKey) -> Option<watch::Receiver<PrepareOutcome>> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.last_used);
        entry.last_used = now;
        self.recency.insert(now, key.clone());
        Some(entry.flight.clone())
    }

    fn insert(&mut self, key: StatementKey, flight: watch::Receiver<PrepareOutcome>) -> u64 {
        let now = self.tick();
        if let Some(old) = self.entries.insert(
            key.clone(),
            Entry {
                last_used: now,
                generation: now,
                flight,
            },
        ) {
            self.recency.remove(&old.last_used);
        }
        self.recency.insert(now, key);
        self.evict();
        now
    }

    fn remove(&mut self, key: &StatementKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.last_used);
                true
            }
            None => false,
        }
    }

    // Removes the entry only if it is still the one inserted at `generation`.
    fn remove_generation(&mut self, key: &StatementKey, generation: u64) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.remove(key);
        }
    }

    fn evict(&mut self) {
        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.max_entries {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            trace!("Evicting prepared statement {:?}", oldest.statement);
            self.entries.remove(&oldest);
        }
    }
}

/// Cache of prepared statements, shared by every connection of a session.
///
/// Passing the same `Arc<StatementCache>` to several sessions shares the
/// cache between them.
pub struct StatementCache {
    lru: StdMutex<Lru>,
}

impl Default for StatementCache {
    fn default() -> Self {
        StatementCache::new(DEFAULT_MAX_PREPARED_STATEMENTS)
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lru = self.lock();
        f.debug_struct("StatementCache")
            .field("max_entries", &lru.max_entries)
            .field("len", &lru.entries.len())
            .finish()
    }
}

impl StatementCache {
    /// Creates a cache holding at most `max_entries` statements. Zero means no bound.
    pub fn new(max_entries: usize) -> Self {
        StatementCache {
            lru: StdMutex::new(Lru {
                max_entries,
                clock: 0,
                entries: HashMap::new(),
                recency: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lru> {
        self.lru.lock().unwrap()
    }

    /// Returns the cached preparation of `key`, joining the one in flight if
    /// there is one, or runs `prepare` and caches its outcome.
    ///
    /// A failed preparation is handed to everyone waiting for it and then
    /// forgotten, so the next caller prepares the statement again.
    pub async fn get_or_prepare<F, Fut>(
        &self,
        key: StatementKey,
        prepare: F,
    ) -> Result<Arc<PreparedInfo>, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<PreparedInfo>, QueryError>>,
    {
        let (sender, generation) = loop {
            let mut flight = {
                let mut lru = self.lock();
                match lru.get(&key) {
                    Some(flight) => flight,
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        let generation = lru.insert(key.clone(), receiver);
                        break (sender, generation);
                    }
                }
            };

            let outcome = match flight.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            // The preparer was cancelled before it finished. Its entry is
            // gone, so the next round either joins a newer one or leads.
        };

        let mut guard = InflightGuard {
            cache: self,
            key: &key,
            generation,
            armed: true,
        };
        let outcome = prepare().await;
        if outcome.is_err() {
            self.lock().remove_generation(&key, generation);
        }
        sender.send_replace(Some(outcome.clone()));
        guard.armed = false;
        outcome
    }

    /// Forgets `key`. Returns whether it was cached.
    pub fn remove(&self, key: &StatementKey) -> bool {
        self.lock().remove(key)
    }

    /// Forgets `key` only if it still holds `prepared`.
    ///
    /// A node reporting a statement as unprepared invalidates the
    /// preparation that was sent, not a newer one another caller has
    /// already started or finished.
    pub fn remove_prepared(&self, key: &StatementKey, prepared: &PreparedInfo) -> bool {
        let mut lru = self.lock();
        let stale = lru.entries.get(key).is_some_and(|entry| {
            matches!(&*entry.flight.borrow(), Some(Ok(info)) if std::ptr::eq(&**info, prepared))
        });
        stale && lru.remove(key)
    }

    /// Changes the bound of the cache, evicting the least recently used
    /// statements that no longer fit.
    pub fn resize(&self, max_entries: usize) {
        let mut lru = self.lock();
        lru.max_entries = max_entries;
        lru.evict();
    }

    /// Whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &StatementKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Number of cached statements, preparations in flight included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no statement.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached statement.
    pub fn clear(&self) {
        let mut lru = self.lock();
        lru.entries.clear();
        lru.recency.clear();
    }
}

// Removes the placeholder of a preparation whose future was dropped midway.
struct InflightGuard<'a> {
    cache: &'a StatementCache,
    key: &'a StatementKey,
    generation: u64,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().remove_generation(self.key, self.generation);
        }
    }
}
