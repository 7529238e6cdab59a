//! Key-value backend abstraction.
//!
//! The trigger store never talks to a concrete database. It is handed a
//! [`KvBackend`] bundling three [`KvMap`]s (triggers, jobs, calendars). A
//! clustered deployment plugs in maps shared by every node; local jobs and
//! tests use the process-local [`InMemoryMap`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::calendar::Calendar;
use crate::error::KvError;
use crate::record::{JobKey, JobRecord, TriggerKey, TriggerRecord};

// --- Entry Updates & Filters ---

/// Result of a pure update function passed to [`KvMap::apply_to_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryUpdate<V> {
  /// Leave the entry as it is.
  Keep,
  /// Store this value under the key.
  Set(V),
  /// Delete the entry.
  Remove,
}

/// Predicate evaluated against map entries during enumeration.
///
/// Filters are plain values so a remote backend can ship them to where the
/// data lives.
pub trait EntryFilter<K, V>: Send + Sync {
  fn matches(&self, key: &K, value: &V) -> bool;
}

/// Filter accepting every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllEntries;

impl<K, V> EntryFilter<K, V> for AllEntries {
  fn matches(&self, _key: &K, _value: &V) -> bool {
    true
  }
}

// --- KvMap Trait ---

/// A distributed map with per-key atomic updates and advisory locks.
///
/// Implementations must guarantee that `apply_to_entry` is atomic with respect
/// to every other mutation of the same key, and that a lock held by one owner
/// cannot be taken by another owner (including the same owner a second time:
/// locks are not reentrant from the store's point of view).
pub trait KvMap<K, V>: Send + Sync {
  fn get(&self, key: &K) -> Result<Option<V>, KvError>;

  fn set(&self, key: K, value: V) -> Result<(), KvError>;

  /// Removes the entry, returning the previous value.
  fn remove(&self, key: &K) -> Result<Option<V>, KvError>;

  /// Stores `value` only if the key is vacant. Returns the existing value
  /// when the key was occupied.
  fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>, KvError>;

  /// Runs `update` against the current value (if any) and applies its result
  /// atomically. `update` may be invoked more than once by backends that
  /// retry on contention, so it must be free of side effects.
  fn apply_to_entry(
    &self,
    key: &K,
    update: &mut dyn FnMut(Option<&V>) -> EntryUpdate<V>,
  ) -> Result<(), KvError>;

  fn keys_matching(&self, filter: &dyn EntryFilter<K, V>) -> Result<Vec<K>, KvError>;

  fn entries_matching(&self, filter: &dyn EntryFilter<K, V>) -> Result<Vec<(K, V)>, KvError>;

  /// Fail-fast advisory lock. Returns `false` if another holder has it.
  /// With a `lease`, the lock is reclaimable once the lease elapses.
  fn try_lock(&self, key: &K, owner: &str, lease: Option<Duration>) -> Result<bool, KvError>;

  /// Releases a lock held by `owner`. Returns `false` if it was not held by them.
  fn unlock(&self, key: &K, owner: &str) -> Result<bool, KvError>;

  fn is_locked(&self, key: &K) -> Result<bool, KvError>;

  /// Removes every entry (locks are left alone).
  fn clear(&self) -> Result<(), KvError>;
}

/// Applies a pure update function that also produces a value for the caller.
///
/// Returns the output of the invocation whose update was actually applied.
pub fn update_entry<M, K, V, R>(
  map: &M,
  key: &K,
  mut update: impl FnMut(Option<&V>) -> (EntryUpdate<V>, R),
) -> Result<R, KvError>
where
  M: KvMap<K, V> + ?Sized,
{
  let mut outcome = None;
  map.apply_to_entry(key, &mut |current| {
    let (entry_update, result) = update(current);
    outcome = Some(result);
    entry_update
  })?;
  outcome.ok_or_else(|| KvError::Conflict("update function was never applied".to_string()))
}

// --- In-Memory Implementation ---

#[derive(Debug, Clone)]
struct LockEntry {
  owner: String,
  expires_at: Option<Instant>,
}

impl LockEntry {
  fn is_live(&self, now: Instant) -> bool {
    self.expires_at.map_or(true, |deadline| now < deadline)
  }
}

/// Process-local [`KvMap`]. Cloning the surrounding `Arc` and handing it to
/// several stores simulates a cluster sharing one backend.
pub struct InMemoryMap<K, V> {
  name: String,
  entries: RwLock<HashMap<K, V>>,
  locks: Mutex<HashMap<K, LockEntry>>,
}

impl<K, V> InMemoryMap<K, V> {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      entries: RwLock::new(HashMap::new()),
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl<K, V> fmt::Debug for InMemoryMap<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InMemoryMap")
      .field("name", &self.name)
      .field("len", &self.entries.read().len())
      .finish()
  }
}

impl<K, V> KvMap<K, V> for InMemoryMap<K, V>
where
  K: Eq + Hash + Clone + fmt::Display + Send + Sync,
  V: Clone + Send + Sync,
{
  fn get(&self, key: &K) -> Result<Option<V>, KvError> {
    Ok(self.entries.read().get(key).cloned())
  }

  fn set(&self, key: K, value: V) -> Result<(), KvError> {
    self.entries.write().insert(key, value);
    Ok(())
  }

  fn remove(&self, key: &K) -> Result<Option<V>, KvError> {
    Ok(self.entries.write().remove(key))
  }

  fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>, KvError> {
    let mut entries = self.entries.write();
    if let Some(existing) = entries.get(&key) {
      return Ok(Some(existing.clone()));
    }
    entries.insert(key, value);
    Ok(None)
  }

  fn apply_to_entry(
    &self,
    key: &K,
    update: &mut dyn FnMut(Option<&V>) -> EntryUpdate<V>,
  ) -> Result<(), KvError> {
    let mut entries = self.entries.write();
    match update(entries.get(key)) {
      EntryUpdate::Keep => {}
      EntryUpdate::Set(value) => {
        entries.insert(key.clone(), value);
      }
      EntryUpdate::Remove => {
        entries.remove(key);
      }
    }
    Ok(())
  }

  fn keys_matching(&self, filter: &dyn EntryFilter<K, V>) -> Result<Vec<K>, KvError> {
    Ok(
      self
        .entries
        .read()
        .iter()
        .filter(|(k, v)| filter.matches(k, v))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  fn entries_matching(&self, filter: &dyn EntryFilter<K, V>) -> Result<Vec<(K, V)>, KvError> {
    Ok(
      self
        .entries
        .read()
        .iter()
        .filter(|(k, v)| filter.matches(k, v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn try_lock(&self, key: &K, owner: &str, lease: Option<Duration>) -> Result<bool, KvError> {
    let now = Instant::now();
    let mut locks = self.locks.lock();
    if let Some(existing) = locks.get(key) {
      if existing.is_live(now) {
        trace!(map = %self.name, %key, holder = %existing.owner, "Lock held.");
        return Ok(false);
      }
      trace!(map = %self.name, %key, holder = %existing.owner, "Reclaiming expired lock.");
    }
    locks.insert(
      key.clone(),
      LockEntry {
        owner: owner.to_string(),
        expires_at: lease.and_then(|lease| now.checked_add(lease)),
      },
    );
    Ok(true)
  }

  fn unlock(&self, key: &K, owner: &str) -> Result<bool, KvError> {
    let mut locks = self.locks.lock();
    match locks.get(key) {
      Some(entry) if entry.owner == owner => {
        locks.remove(key);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  fn is_locked(&self, key: &K) -> Result<bool, KvError> {
    let now = Instant::now();
    Ok(self.locks.lock().get(key).is_some_and(|entry| entry.is_live(now)))
  }

  fn clear(&self) -> Result<(), KvError> {
    self.entries.write().clear();
    Ok(())
  }
}

// --- Backend Bundle ---

/// The three maps a [`TriggerStore`](crate::store::TriggerStore) persists into.
#[derive(Clone)]
pub struct KvBackend {
  pub triggers: Arc<dyn KvMap<TriggerKey, TriggerRecord>>,
  pub jobs: Arc<dyn KvMap<JobKey, JobRecord>>,
  pub calendars: Arc<dyn KvMap<String, Calendar>>,
}

impl KvBackend {
  pub fn new(
    triggers: Arc<dyn KvMap<TriggerKey, TriggerRecord>>,
    jobs: Arc<dyn KvMap<JobKey, JobRecord>>,
    calendars: Arc<dyn KvMap<String, Calendar>>,
  ) -> Self {
    Self {
      triggers,
      jobs,
      calendars,
    }
  }

  /// A fresh, unshared in-memory backend.
  pub fn in_memory() -> Self {
    Self::new(
      Arc::new(InMemoryMap::new("triggers")),
      Arc::new(InMemoryMap::new("jobs")),
      Arc::new(InMemoryMap::new("calendars")),
    )
  }
}

impl fmt::Debug for KvBackend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KvBackend").finish_non_exhaustive()
  }
}
