//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};
use clusterkeeper::{
  CompletionInstruction, EntryFilter, EntryUpdate, FireRecord, InMemoryMap, JobKey, JobLauncher,
  JobRecord, KvBackend, KvError, KvMap, ManualClock, SchedulerSignaler, Schedule, TriggerKey,
  TriggerRecord, TriggerStore,
};
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

/// Friday 2024-03-01 10:00:00 UTC.
pub fn base_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

// Builds a store acting as `node_id` over a (possibly shared) backend.
pub fn store_for(node_id: &str, kv: &KvBackend, clock: &ManualClock) -> TriggerStore {
  TriggerStore::new("clustered", node_id, kv.clone()).with_clock(Arc::new(clock.clone()))
}

// Creates the job for `job_runner_key` if needed, then stores a trigger for it.
pub fn schedule(
  store: &TriggerStore,
  job_id: &str,
  job_runner_key: &str,
  schedule: Schedule,
) -> TriggerKey {
  let job_key = JobKey::parse(job_runner_key);
  store
    .store_job_if_absent(&job_key, JobRecord::new(job_runner_key))
    .expect("store job");
  let trigger_key = TriggerKey::parse(job_id);
  store
    .store_trigger(&trigger_key, TriggerRecord::new(job_key, schedule), false)
    .expect("store trigger");
  trigger_key
}

// Runs one acquire + fire pass at the store's current time.
pub fn fire_due(store: &TriggerStore) -> Vec<FireRecord> {
  let acquired = store
    .acquire_next_triggers(store.now(), 16, StdDuration::ZERO)
    .expect("acquire");
  store.triggers_fired(&acquired)
}

// Runs one acquire + fire + complete(instruction) cycle.
pub fn run_cycle(store: &TriggerStore, instruction: CompletionInstruction) -> Vec<FireRecord> {
  let fired = fire_due(store);
  for fire in &fired {
    store
      .triggered_job_complete(&fire.trigger_key, fire.fire_instance_id, instruction)
      .expect("complete");
  }
  fired
}

// A launcher that completes every occurrence with `Noop`.
pub fn noop_launcher() -> impl JobLauncher {
  |_fire: FireRecord| async { CompletionInstruction::Noop }
}

// --- Signals ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
  Misfired(TriggerKey),
  Finalized(TriggerKey),
  SchedulingChange(Option<DateTime<Utc>>),
}

// Records every signal a store raises.
#[derive(Debug, Default)]
pub struct RecordingSignaler {
  signals: Mutex<Vec<Signal>>,
}

impl RecordingSignaler {
  pub fn signals(&self) -> Vec<Signal> {
    self.signals.lock().clone()
  }

  pub fn misfired(&self) -> Vec<TriggerKey> {
    self
      .signals()
      .into_iter()
      .filter_map(|s| match s {
        Signal::Misfired(key) => Some(key),
        _ => None,
      })
      .collect()
  }

  pub fn finalized(&self) -> Vec<TriggerKey> {
    self
      .signals()
      .into_iter()
      .filter_map(|s| match s {
        Signal::Finalized(key) => Some(key),
        _ => None,
      })
      .collect()
  }
}

impl SchedulerSignaler for RecordingSignaler {
  fn notify_trigger_misfired(&self, trigger_key: &TriggerKey) {
    self.signals.lock().push(Signal::Misfired(trigger_key.clone()));
  }

  fn notify_trigger_finalized(&self, trigger_key: &TriggerKey) {
    self.signals.lock().push(Signal::Finalized(trigger_key.clone()));
  }

  fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
    self.signals.lock().push(Signal::SchedulingChange(candidate));
  }
}

// --- Flaky Backend ---

// Trigger map whose reads fail for selected keys, simulating a partitioned
// member of the cluster. It can also go down entirely, and counts the
// updates that wrote a value.
pub struct FlakyMap {
  inner: InMemoryMap<TriggerKey, TriggerRecord>,
  failing: Mutex<HashSet<TriggerKey>>,
  down: AtomicBool,
  writes: AtomicUsize,
}

impl FlakyMap {
  pub fn new() -> Self {
    Self {
      inner: InMemoryMap::new("flaky-triggers"),
      failing: Mutex::new(HashSet::new()),
      down: AtomicBool::new(false),
      writes: AtomicUsize::new(0),
    }
  }

  pub fn fail_reads_of(&self, key: &TriggerKey) {
    self.failing.lock().insert(key.clone());
  }

  // Every operation fails from now on.
  pub fn go_down(&self) {
    self.down.store(true, Ordering::SeqCst);
  }

  // Number of `apply_to_entry` calls that stored a value.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn check_up(&self) -> Result<(), KvError> {
    if self.down.load(Ordering::SeqCst) {
      Err(KvError::Unavailable("down".to_string()))
    } else {
      Ok(())
    }
  }

  fn check(&self, key: &TriggerKey) -> Result<(), KvError> {
    self.check_up()?;
    if self.failing.lock().contains(key) {
      Err(KvError::Unavailable(format!("partition owning {key} is unreachable")))
    } else {
      Ok(())
    }
  }
}

impl KvMap<TriggerKey, TriggerRecord> for FlakyMap {
  fn get(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, KvError> {
    self.check(key)?;
    self.inner.get(key)
  }

  fn set(&self, key: TriggerKey, value: TriggerRecord) -> Result<(), KvError> {
    self.check_up()?;
    self.inner.set(key, value)
  }

  fn remove(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, KvError> {
    self.check_up()?;
    self.inner.remove(key)
  }

  fn put_if_absent(
    &self,
    key: TriggerKey,
    value: TriggerRecord,
  ) -> Result<Option<TriggerRecord>, KvError> {
    self.check_up()?;
    self.inner.put_if_absent(key, value)
  }

  fn apply_to_entry(
    &self,
    key: &TriggerKey,
    update: &mut dyn FnMut(Option<&TriggerRecord>) -> EntryUpdate<TriggerRecord>,
  ) -> Result<(), KvError> {
    self.check(key)?;
    self.inner.apply_to_entry(key, &mut |current| {
      let outcome = update(current);
      if matches!(outcome, EntryUpdate::Set(_)) {
        self.writes.fetch_add(1, Ordering::SeqCst);
      }
      outcome
    })
  }

  fn keys_matching(
    &self,
    filter: &dyn EntryFilter<TriggerKey, TriggerRecord>,
  ) -> Result<Vec<TriggerKey>, KvError> {
    self.check_up()?;
    self.inner.keys_matching(filter)
  }

  fn entries_matching(
    &self,
    filter: &dyn EntryFilter<TriggerKey, TriggerRecord>,
  ) -> Result<Vec<(TriggerKey, TriggerRecord)>, KvError> {
    self.check_up()?;
    self.inner.entries_matching(filter)
  }

  fn try_lock(
    &self,
    key: &TriggerKey,
    owner: &str,
    lease: Option<StdDuration>,
  ) -> Result<bool, KvError> {
    self.inner.try_lock(key, owner, lease)
  }

  fn unlock(&self, key: &TriggerKey, owner: &str) -> Result<bool, KvError> {
    self.inner.unlock(key, owner)
  }

  fn is_locked(&self, key: &TriggerKey) -> Result<bool, KvError> {
    self.inner.is_locked(key)
  }

  fn clear(&self) -> Result<(), KvError> {
    self.inner.clear()
  }
}

// A backend whose trigger map is `triggers` and whose other maps are fresh.
pub fn backend_with_triggers(triggers: Arc<dyn KvMap<TriggerKey, TriggerRecord>>) -> KvBackend {
  KvBackend::new(
    triggers,
    Arc::new(InMemoryMap::new("jobs")),
    Arc::new(InMemoryMap::new("calendars")),
  )
}
