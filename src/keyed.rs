//! A generic pool of objects, partitioned by key.
//!
//! Each key has its own idle queue and capacity. Objects are created on
//! demand by a [Manager], borrowed, and given back; periodic calls to
//! [KeyedPool::evict] and [KeyedPool::ensure_min_idle] trim and top up the
//! idle queues.

use crate::node;

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Key is not part of this pool")]
    UnknownKey,

    #[error("Timed out waiting for an object")]
    Timeout,

    #[error("Pool closed")]
    Closed,

    #[error("Failed to create object")]
    Create(#[source] node::Error),
}

/// Creates, checks and destroys the objects of a [KeyedPool].
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Key: Clone + Ord + Debug + Send + Sync + 'static;
    type Object: Send + 'static;

    async fn create(&self, key: &Self::Key) -> Result<Self::Object, node::Error>;

    /// Returns false if the object must not be used again.
    async fn validate(&self, key: &Self::Key, object: &mut Self::Object) -> bool;

    /// Disposes of an object the pool no longer wants.
    fn destroy(&self, key: &Self::Key, object: Self::Object);
}

/// Limits which apply to every key of a [KeyedPool].
#[derive(Clone, Debug)]
pub struct Config {
    /// The most objects (idle, borrowed, or being created) per key.
    ///
    /// `None` is unlimited.
    pub max_per_key: Option<usize>,

    /// Objects given back beyond this many idle are destroyed.
    pub max_idle_per_key: usize,

    /// [KeyedPool::ensure_min_idle] creates objects up to this many idle,
    /// and [KeyedPool::evict] never trims below it.
    pub min_idle_per_key: usize,

    /// Objects idle at least this long may be evicted.
    pub min_evictable_idle: Duration,

    /// Validate objects before lending them out.
    pub test_on_borrow: bool,

    /// How many idle objects of each key one [KeyedPool::evict] run
    /// validates. Successive runs move on through the idle queue.
    pub tests_per_eviction_run: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_per_key: Some(8),
            max_idle_per_key: 8,
            min_idle_per_key: 0,
            min_evictable_idle: Duration::from_secs(60),
            test_on_borrow: false,
            tests_per_eviction_run: 3,
        }
    }
}

/// A point-in-time view of one key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyStats {
    pub idle: usize,
    pub borrowed: usize,
    /// Objects being created or validated.
    pub pending: usize,
    pub generation: u64,
}

struct Idle<O> {
    object: O,
    generation: u64,
    created: Instant,
    since: Instant,
}

/// The state of a single key.
pub(crate) struct Entry<O> {
    // Most recently given back at the back.
    idle: Mutex<VecDeque<Idle<O>>>,
    // Every object of this key, wherever it is.
    live: AtomicUsize,
    // Only changed with "idle" locked.
    borrowed: AtomicUsize,
    available: Notify,
    generation: AtomicU64,
    purged_through: AtomicU64,
    removed: AtomicBool,
    // Position in "idle" where the next eviction run resumes validating.
    eviction_cursor: AtomicUsize,
}

impl<O> Entry<O> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            borrowed: AtomicUsize::new(0),
            available: Notify::new(),
            generation: AtomicU64::new(1),
            purged_through: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            eviction_cursor: AtomicUsize::new(0),
        }
    }

    // Claims capacity for one more object.
    fn reserve(&self, max: Option<usize>) -> Option<Reservation<'_, O>> {
        let mut live = self.live.load(Ordering::SeqCst);
        loop {
            if max.is_some_and(|max| live >= max) {
                return None;
            }
            match self
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(Reservation { entry: self, armed: true }),
                Err(actual) => live = actual,
            }
        }
    }

    fn take_idle(&self) -> Option<Idle<O>> {
        let mut idle = self.idle.lock().unwrap();
        let object = idle.pop_back()?;
        self.borrowed.fetch_add(1, Ordering::SeqCst);
        Some(object)
    }

    // Forgets about an object which will not come back.
    fn release_capacity(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }

    fn stats(&self) -> KeyStats {
        let idle = self.idle.lock().unwrap();
        let borrowed = self.borrowed.load(Ordering::SeqCst);
        let live = self.live.load(Ordering::SeqCst);
        KeyStats {
            idle: idle.len(),
            borrowed,
            pending: live.saturating_sub(idle.len() + borrowed),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }
}

// Capacity claimed for an object which doesn't exist yet. Gives the
// capacity back if dropped while armed, such as when a borrow is cancelled
// mid-creation.
struct Reservation<'a, O> {
    entry: &'a Entry<O>,
    armed: bool,
}

impl<O> Reservation<'_, O> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl<O> Drop for Reservation<'_, O> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.release_capacity();
        }
    }
}

// A borrowed object under validation. Gives back the borrow if dropped
// while armed.
struct Checking<'a, O> {
    entry: &'a Entry<O>,
    armed: bool,
}

impl<O> Checking<'_, O> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl<O> Drop for Checking<'_, O> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.borrowed.fetch_sub(1, Ordering::SeqCst);
            self.entry.release_capacity();
        }
    }
}

/// An object lent out by a [KeyedPool].
///
/// Must be handed back with [KeyedPool::give_back] or
/// [KeyedPool::invalidate]; dropping it leaks its capacity.
pub struct Pooled<K, O> {
    pub(crate) key: K,
    pub(crate) object: O,
    pub(crate) generation: u64,
    pub(crate) created: Instant,
    pub(crate) entry: Arc<Entry<O>>,
}

impl<K, O> Pooled<K, O> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn object(&self) -> &O {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut O {
        &mut self.object
    }

    /// The key's generation when this object was created.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<K: Debug, O> Debug for Pooled<K, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

type Entries<M> = BTreeMap<<M as Manager>::Key, Arc<Entry<<M as Manager>::Object>>>;

/// A pool of objects, partitioned by key.
pub struct KeyedPool<M: Manager> {
    manager: M,
    config: Config,
    entries: RwLock<Entries<M>>,
    closed: AtomicBool,
}

impl<M: Manager> KeyedPool<M> {
    pub fn new(manager: M, config: Config) -> Self {
        Self {
            manager,
            config,
            entries: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn entry(&self, key: &M::Key) -> Option<Arc<Entry<M::Object>>> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Lends out an object for `key`.
    ///
    /// Prefers the most recently returned idle object. Otherwise creates
    /// one, if the key has capacity left. Otherwise waits up to `wait` (or
    /// forever, if `None`) for an object to be given back.
    #[instrument(level = "trace", skip(self))]
    pub async fn borrow(
        &self,
        key: &M::Key,
        wait: Option<Duration>,
    ) -> Result<Pooled<M::Key, M::Object>, Error> {
        let entry = self.entry(key).ok_or(Error::UnknownKey)?;
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if entry.removed.load(Ordering::SeqCst) {
                return Err(Error::UnknownKey);
            }

            // Register interest before looking, so a give-back in between
            // isn't missed.
            let notified = entry.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(mut idle) = entry.take_idle() {
                if self.config.test_on_borrow {
                    let checking = Checking {
                        entry: &entry,
                        armed: true,
                    };
                    if !self.manager.validate(key, &mut idle.object).await {
                        event!(Level::DEBUG, ?key, "Idle object failed validation on borrow");
                        self.manager.destroy(key, idle.object);
                        continue;
                    }
                    checking.keep();
                }
                return Ok(Pooled {
                    key: key.clone(),
                    object: idle.object,
                    generation: idle.generation,
                    created: idle.created,
                    entry: entry.clone(),
                });
            }

            if let Some(reservation) = entry.reserve(self.config.max_per_key) {
                let object = self.manager.create(key).await.map_err(Error::Create)?;
                let generation = {
                    let _idle = entry.idle.lock().unwrap();
                    entry.borrowed.fetch_add(1, Ordering::SeqCst);
                    entry.generation.load(Ordering::SeqCst)
                };
                reservation.keep();
                return Ok(Pooled {
                    key: key.clone(),
                    object,
                    generation,
                    created: Instant::now(),
                    entry: entry.clone(),
                });
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Takes back a borrowed object.
    ///
    /// Returns true if the object was cached; otherwise it was destroyed
    /// because the pool is closed, its key was removed or purged, or the key
    /// already has enough idle objects.
    pub fn give_back(&self, pooled: Pooled<M::Key, M::Object>) -> bool {
        let Pooled {
            key,
            object,
            generation,
            created,
            entry,
        } = pooled;

        let rejected = {
            let mut idle = entry.idle.lock().unwrap();
            entry.borrowed.fetch_sub(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst)
                || entry.removed.load(Ordering::SeqCst)
                || generation <= entry.purged_through.load(Ordering::SeqCst)
                || idle.len() >= self.config.max_idle_per_key
            {
                Some(object)
            } else {
                idle.push_back(Idle {
                    object,
                    generation,
                    created,
                    since: Instant::now(),
                });
                None
            }
        };

        match rejected {
            Some(object) => {
                self.manager.destroy(&key, object);
                entry.release_capacity();
                false
            }
            None => {
                entry.available.notify_one();
                true
            }
        }
    }

    /// Destroys a borrowed object instead of giving it back.
    pub fn invalidate(&self, pooled: Pooled<M::Key, M::Object>) {
        let Pooled {
            key, object, entry, ..
        } = pooled;
        {
            let _idle = entry.idle.lock().unwrap();
            entry.borrowed.fetch_sub(1, Ordering::SeqCst);
        }
        self.manager.destroy(&key, object);
        entry.release_capacity();
    }

    /// Destroys every idle object of `key` created in `generation` or
    /// earlier. Objects of those generations which are currently borrowed
    /// are destroyed when given back.
    ///
    /// Returns the number of idle objects destroyed, or `None` if the key
    /// is unknown or the generation was already purged.
    pub fn purge(&self, key: &M::Key, generation: u64) -> Option<usize> {
        let entry = self.entry(key)?;
        self.purge_entry(key, &entry, generation)
    }

    /// Like [KeyedPool::purge], for one particular incarnation of `key`.
    ///
    /// Objects keep a reference to the entry they were created under. If
    /// the key was removed since, its entry is gone and nothing is purged,
    /// even if the key has been added again.
    pub(crate) fn purge_entry(
        &self,
        key: &M::Key,
        entry: &Entry<M::Object>,
        generation: u64,
    ) -> Option<usize> {
        let evicted: Vec<_> = {
            let mut idle = entry.idle.lock().unwrap();
            if entry.removed.load(Ordering::SeqCst)
                || generation <= entry.purged_through.load(Ordering::SeqCst)
            {
                return None;
            }
            entry.purged_through.store(generation, Ordering::SeqCst);
            entry.generation.fetch_max(generation + 1, Ordering::SeqCst);

            let (keep, evict): (VecDeque<_>, VecDeque<_>) =
                idle.drain(..).partition(|idle| idle.generation > generation);
            *idle = keep;
            evict.into_iter().collect()
        };
        let count = evicted.len();
        for idle in evicted {
            self.manager.destroy(key, idle.object);
            entry.release_capacity();
        }
        Some(count)
    }

    /// Starts tracking `key`. Returns false if it was already tracked.
    pub fn add_key(&self, key: M::Key) -> bool {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::new(Entry::new()));
        true
    }

    /// Stops tracking `key`, destroying its idle objects. Borrowed objects
    /// are destroyed when given back, and waiting borrowers fail.
    pub fn remove_key(&self, key: &M::Key) -> bool {
        let Some(entry) = self.entries.write().unwrap().remove(key) else {
            return false;
        };
        entry.removed.store(true, Ordering::SeqCst);
        self.drain(key, &entry);
        entry.available.notify_waiters();
        true
    }

    pub fn keys(&self) -> Vec<M::Key> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn stats(&self, key: &M::Key) -> Option<KeyStats> {
        self.entry(key).map(|entry| entry.stats())
    }

    fn drain(&self, key: &M::Key, entry: &Entry<M::Object>) {
        let drained: Vec<_> = entry.idle.lock().unwrap().drain(..).collect();
        for idle in drained {
            self.manager.destroy(key, idle.object);
            entry.release_capacity();
        }
    }

    /// Destroys idle objects which have been idle too long (keeping at
    /// least the configured minimum), then validates the rest.
    ///
    /// Returns the number of objects destroyed, per key.
    #[instrument(level = "trace", skip(self))]
    pub async fn evict(&self) -> BTreeMap<M::Key, usize> {
        let entries = self.entries.read().unwrap().clone();
        let mut destroyed = BTreeMap::new();
        for (key, entry) in entries {
            let count = self.evict_key(&key, &entry).await;
            if count > 0 {
                destroyed.insert(key, count);
            }
        }
        destroyed
    }

    async fn evict_key(&self, key: &M::Key, entry: &Entry<M::Object>) -> usize {
        let now = Instant::now();
        let (expired, budget) = {
            let mut idle = entry.idle.lock().unwrap();
            let mut expired = vec![];
            while idle.len() > self.config.min_idle_per_key {
                let Some(oldest) = idle.front() else {
                    break;
                };
                if now.duration_since(oldest.since) < self.config.min_evictable_idle {
                    break;
                }
                expired.extend(idle.pop_front());
            }
            (expired, self.config.tests_per_eviction_run.min(idle.len()))
        };

        let mut count = expired.len();
        let mut cursor = entry
            .eviction_cursor
            .load(Ordering::SeqCst)
            .saturating_sub(expired.len());
        for idle in expired {
            self.manager.destroy(key, idle.object);
            entry.release_capacity();
        }

        // Objects are validated one at a time, outside the lock, so the rest
        // of the queue stays available to borrowers. The one under test
        // counts as pending.
        for _ in 0..budget {
            let (index, mut candidate) = {
                let mut idle = entry.idle.lock().unwrap();
                if cursor >= idle.len() {
                    cursor = 0;
                }
                let Some(candidate) = idle.remove(cursor) else {
                    break;
                };
                (cursor, candidate)
            };

            let rejected = if self.manager.validate(key, &mut candidate.object).await {
                let mut idle = entry.idle.lock().unwrap();
                if self.closed.load(Ordering::SeqCst)
                    || entry.removed.load(Ordering::SeqCst)
                    || candidate.generation <= entry.purged_through.load(Ordering::SeqCst)
                {
                    Some(candidate)
                } else {
                    let index = index.min(idle.len());
                    idle.insert(index, candidate);
                    cursor = index + 1;
                    None
                }
            } else {
                event!(Level::DEBUG, ?key, "Idle object failed validation");
                Some(candidate)
            };

            match rejected {
                Some(candidate) => {
                    count += 1;
                    self.manager.destroy(key, candidate.object);
                    entry.release_capacity();
                }
                None => entry.available.notify_one(),
            }
        }
        entry.eviction_cursor.store(cursor, Ordering::SeqCst);
        count
    }

    /// Creates objects until every key has its minimum number of idle
    /// objects, or a creation fails.
    ///
    /// Returns the failures, per key.
    #[instrument(level = "trace", skip(self))]
    pub async fn ensure_min_idle(&self) -> Vec<(M::Key, node::Error)> {
        if self.closed.load(Ordering::SeqCst) {
            return vec![];
        }
        let entries = self.entries.read().unwrap().clone();
        let fills = entries
            .into_iter()
            .map(|(key, entry)| async move { self.fill_key(&key, &entry).await.err().map(|err| (key, err)) });
        futures::future::join_all(fills)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn fill_key(&self, key: &M::Key, entry: &Entry<M::Object>) -> Result<(), node::Error> {
        loop {
            let stats = entry.stats();
            if stats.idle + stats.pending >= self.config.min_idle_per_key {
                return Ok(());
            }
            let Some(reservation) = entry.reserve(self.config.max_per_key) else {
                return Ok(());
            };
            let object = self.manager.create(key).await?;

            let rejected = {
                let mut idle = entry.idle.lock().unwrap();
                if self.closed.load(Ordering::SeqCst) || entry.removed.load(Ordering::SeqCst) {
                    Some(object)
                } else {
                    let now = Instant::now();
                    idle.push_back(Idle {
                        object,
                        generation: entry.generation.load(Ordering::SeqCst),
                        created: now,
                        since: now,
                    });
                    None
                }
            };
            // The object now occupies the reserved capacity.
            reservation.keep();
            if let Some(object) = rejected {
                self.manager.destroy(key, object);
                entry.release_capacity();
                return Ok(());
            }
            entry.available.notify_one();
        }
    }

    /// Destroys every idle object, and makes every future borrow fail.
    /// Borrowed objects are destroyed when given back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = self.entries.read().unwrap().clone();
        for (key, entry) in entries {
            self.drain(&key, &entry);
            entry.available.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
