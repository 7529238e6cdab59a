//! The distributed trigger store.
//!
//! A [`TriggerStore`] owns no data of its own: every record lives in the
//! [`KvBackend`] it was constructed with, so several stores (one per node)
//! pointed at the same backend form a cluster. Correctness across nodes rests
//! on two backend guarantees: per-key advisory locks serialize
//! acquire → fire for a trigger, and every mutation goes through
//! [`KvMap::apply_to_entry`](crate::kv::KvMap::apply_to_entry) so no update is a
//! read-then-write across two round trips.
//!
//! Signals are raised after the corresponding change is persisted.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::filter::{GroupMatcher, JobFilter, TriggerFilter};
use crate::kv::{update_entry, AllEntries, EntryUpdate, KvBackend};
use crate::metrics::SchedulerMetrics;
use crate::record::{
  CompletionInstruction, FireInstanceId, FireRecord, InFlight, JobKey, JobRecord, TriggerKey,
  TriggerRecord, TriggerState,
};
use crate::schedule::Schedule;
use crate::signal::{NoopSignaler, SchedulerSignaler};

/// How late a due trigger may be picked up before it counts as misfired.
pub const DEFAULT_MISFIRE_THRESHOLD: Duration = Duration::from_secs(60);

pub type StoreResult<T> = Result<T, StoreError>;

// --- Configuration ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
  pub misfire_threshold: Duration,
  /// Lease applied to acquisition locks. `None` means a lock held by a node
  /// that dies is never reclaimed; the node must come back and recover.
  pub lock_lease: Option<Duration>,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      misfire_threshold: DEFAULT_MISFIRE_THRESHOLD,
      lock_lease: None,
    }
  }
}

/// A trigger locked by [`TriggerStore::acquire_next_triggers`] and waiting to
/// be fired or released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredTrigger {
  pub key: TriggerKey,
  pub scheduled_fire_time: DateTime<Utc>,
}

// --- Pure Record Transitions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Misfire {
  NotMisfired,
  Advanced,
  Exhausted,
}

/// Next occurrence strictly after `after`, skipping calendar-excluded instants.
fn advance(
  schedule: &Schedule,
  calendar: Option<&Calendar>,
  after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
  let candidate = schedule.next_fire_time(after);
  match calendar {
    Some(calendar) => calendar.first_included(schedule, candidate),
    None => candidate,
  }
}

/// Skips the backlog of a trigger whose next fire time is older than
/// `now - threshold`, moving it to the first occurrence after `now`.
fn correct_misfire(
  record: &mut TriggerRecord,
  calendar: Option<&Calendar>,
  now: DateTime<Utc>,
  threshold: ChronoDuration,
) -> Misfire {
  let Some(next) = record.next_fire_time else {
    return Misfire::NotMisfired;
  };
  let limit = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
  if next > limit {
    return Misfire::NotMisfired;
  }
  record.next_fire_time = advance(&record.schedule, calendar, now);
  if record.next_fire_time.is_none() {
    record.state = TriggerState::Complete;
    Misfire::Exhausted
  } else {
    Misfire::Advanced
  }
}

fn fire_record(
  key: &TriggerKey,
  record: &TriggerRecord,
  job: &JobRecord,
  marker: &InFlight,
  recovering: bool,
) -> FireRecord {
  let mut job_parameters = job.data.clone();
  job_parameters.extend(record.data.iter().map(|(k, v)| (k.clone(), v.clone())));
  FireRecord {
    fire_instance_id: marker.fire_instance_id,
    job_id: key.to_string(),
    trigger_key: key.clone(),
    job_key: record.job_key.clone(),
    job_type: job.job_type.clone(),
    job_parameters,
    fired_at: marker.fired_at,
    scheduled_fire_time: marker.scheduled_fire_time,
    previous_fire_time: record.previous_fire_time,
    next_fire_time: record.next_fire_time,
    recovering,
  }
}

fn sorted_groups<'a>(groups: impl Iterator<Item = &'a str>) -> Vec<String> {
  groups
    .map(str::to_string)
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect()
}

// --- TriggerStore ---

/// Trigger and job persistence plus the acquire / fire / complete protocol.
pub struct TriggerStore {
  name: String,
  node_id: String,
  kv: KvBackend,
  config: StoreConfig,
  signaler: Arc<dyn SchedulerSignaler>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
}

impl fmt::Debug for TriggerStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TriggerStore")
      .field("name", &self.name)
      .field("node_id", &self.node_id)
      .field("config", &self.config)
      .field("clock", &self.clock)
      .finish_non_exhaustive()
  }
}

impl TriggerStore {
  /// A store named `name` (used in logs) acting as `node_id` over `kv`.
  pub fn new(name: &str, node_id: &str, kv: KvBackend) -> Self {
    Self {
      name: name.to_string(),
      node_id: node_id.to_string(),
      kv,
      config: StoreConfig::default(),
      signaler: Arc::new(NoopSignaler),
      clock: Arc::new(SystemClock),
      metrics: SchedulerMetrics::new(),
    }
  }

  pub fn with_config(mut self, config: StoreConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_signaler(mut self, signaler: Arc<dyn SchedulerSignaler>) -> Self {
    self.signaler = signaler;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  pub fn metrics(&self) -> &SchedulerMetrics {
    &self.metrics
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  fn misfire_threshold(&self) -> ChronoDuration {
    ChronoDuration::from_std(self.config.misfire_threshold)
      .unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)))
  }

  fn load_calendar(&self, name: Option<&str>) -> StoreResult<Option<Calendar>> {
    match name {
      Some(name) => Ok(self.kv.calendars.get(&name.to_string())?),
      None => Ok(None),
    }
  }

  fn release_lock(&self, key: &TriggerKey) {
    match self.kv.triggers.unlock(key, &self.node_id) {
      Ok(true) => trace!(store = %self.name, trigger_key = %key, "Released trigger lock."),
      Ok(false) => {
        warn!(store = %self.name, trigger_key = %key, "Trigger lock was not held by this node.")
      }
      Err(e) => {
        error!(store = %self.name, trigger_key = %key, error = %e, "Failed to release trigger lock.")
      }
    }
  }

  fn report_misfire(&self, key: &TriggerKey, misfire: Misfire) {
    match misfire {
      Misfire::NotMisfired => {}
      Misfire::Advanced => {
        SchedulerMetrics::incr(&self.metrics.triggers_misfired);
        warn!(store = %self.name, trigger_key = %key, "Trigger misfired; skipped to next occurrence.");
        self.signaler.notify_trigger_misfired(key);
      }
      Misfire::Exhausted => {
        SchedulerMetrics::incr(&self.metrics.triggers_misfired);
        warn!(store = %self.name, trigger_key = %key, "Trigger misfired with no further occurrence.");
        self.signaler.notify_trigger_misfired(key);
        self.report_finalized(key);
      }
    }
  }

  fn report_finalized(&self, key: &TriggerKey) {
    SchedulerMetrics::incr(&self.metrics.triggers_finalized);
    debug!(store = %self.name, trigger_key = %key, "Trigger finalized.");
    self.signaler.notify_trigger_finalized(key);
  }

  // --- Jobs & Triggers ---

  /// Stores a job. Without `replace`, an existing job is an error.
  pub fn store_job(&self, key: &JobKey, job: JobRecord, replace: bool) -> StoreResult<()> {
    if replace {
      self.kv.jobs.set(key.clone(), job)?;
    } else if self.kv.jobs.put_if_absent(key.clone(), job)?.is_some() {
      return Err(StoreError::JobExists(key.clone()));
    }
    debug!(store = %self.name, job_key = %key, "Stored job.");
    Ok(())
  }

  /// Stores a job unless one already exists. Returns whether it was created.
  pub fn store_job_if_absent(&self, key: &JobKey, job: JobRecord) -> StoreResult<bool> {
    let created = self.kv.jobs.put_if_absent(key.clone(), job)?.is_none();
    if created {
      debug!(store = %self.name, job_key = %key, "Created job.");
    }
    Ok(created)
  }

  /// Stores a job followed by one of its triggers.
  pub fn store_job_and_trigger(
    &self,
    job_key: &JobKey,
    job: JobRecord,
    trigger_key: &TriggerKey,
    trigger: TriggerRecord,
    replace: bool,
  ) -> StoreResult<()> {
    self.store_job(job_key, job, replace)?;
    self.store_trigger(trigger_key, trigger, replace)
  }

  /// Validates `trigger`, computes its first fire time and sets its state.
  fn prepare_trigger(&self, key: &TriggerKey, trigger: TriggerRecord) -> StoreResult<TriggerRecord> {
    if let Schedule::Unrecognized { kind } = &trigger.schedule {
      return Err(StoreError::UnsupportedTrigger {
        key: key.clone(),
        kind: kind.clone(),
      });
    }
    trigger.schedule.validate()?;
    if self.kv.jobs.get(&trigger.job_key)?.is_none() {
      return Err(StoreError::JobNotFound(trigger.job_key.clone()));
    }
    let calendar = match trigger.calendar_name.as_deref() {
      Some(name) => Some(
        self
          .load_calendar(Some(name))?
          .ok_or_else(|| StoreError::CalendarNotFound(name.to_string()))?,
      ),
      None => None,
    };

    let now = self.clock.now();
    let paused = trigger.state == TriggerState::Paused;
    let mut record = trigger;
    record.schedule = record.schedule.resolved(now);
    let first = record.schedule.first_fire_time(now);
    record.next_fire_time = match &calendar {
      Some(calendar) => calendar.first_included(&record.schedule, first),
      None => first,
    };
    record.in_flight.clear();
    record.state = if record.next_fire_time.is_none() {
      warn!(store = %self.name, trigger_key = %key, "Trigger will never fire; storing as complete.");
      TriggerState::Complete
    } else if paused {
      TriggerState::Paused
    } else if self.job_has_blocking_execution(&record.job_key)? {
      TriggerState::Blocked
    } else {
      TriggerState::Normal
    };
    Ok(record)
  }

  /// Stores a trigger for an existing job. Without `replace`, an existing
  /// trigger under the same key is an error.
  pub fn store_trigger(
    &self,
    key: &TriggerKey,
    trigger: TriggerRecord,
    replace: bool,
  ) -> StoreResult<()> {
    let record = self.prepare_trigger(key, trigger)?;
    let next = record.next_fire_time;
    if replace {
      self.kv.triggers.set(key.clone(), record)?;
    } else if self.kv.triggers.put_if_absent(key.clone(), record)?.is_some() {
      return Err(StoreError::TriggerExists(key.clone()));
    }
    debug!(store = %self.name, trigger_key = %key, ?next, "Stored trigger.");
    self.signaler.signal_scheduling_change(next);
    Ok(())
  }

  /// Replaces an existing trigger. Returns `false` if there was none.
  pub fn replace_trigger(&self, key: &TriggerKey, trigger: TriggerRecord) -> StoreResult<bool> {
    let Some(old) = self.kv.triggers.get(key)? else {
      return Ok(false);
    };
    let record = self.prepare_trigger(key, trigger)?;
    let next = record.next_fire_time;
    let new_job = record.job_key.clone();
    self.kv.triggers.set(key.clone(), record)?;
    if old.job_key != new_job {
      self.remove_orphaned_job(&old.job_key)?;
    }
    debug!(store = %self.name, trigger_key = %key, ?next, "Replaced trigger.");
    self.signaler.signal_scheduling_change(next);
    Ok(true)
  }

  /// Removes a trigger, and its job if the job is non-durable and now has no
  /// triggers. Returns `false` if the trigger did not exist.
  pub fn remove_trigger(&self, key: &TriggerKey) -> StoreResult<bool> {
    let Some(removed) = self.kv.triggers.remove(key)? else {
      return Ok(false);
    };
    debug!(store = %self.name, trigger_key = %key, "Removed trigger.");
    self.remove_orphaned_job(&removed.job_key)?;
    self.signaler.signal_scheduling_change(None);
    Ok(true)
  }

  /// Deletes a non-durable job that has no triggers left.
  pub(crate) fn remove_orphaned_job(&self, job_key: &JobKey) -> StoreResult<()> {
    let Some(job) = self.kv.jobs.get(job_key)? else {
      return Ok(());
    };
    if job.durable {
      return Ok(());
    }
    if self
      .kv
      .triggers
      .keys_matching(&TriggerFilter::for_job(job_key))?
      .is_empty()
    {
      self.kv.jobs.remove(job_key)?;
      debug!(store = %self.name, %job_key, "Removed non-durable job with no triggers.");
    }
    Ok(())
  }

  /// Removes a job and all of its triggers.
  pub fn remove_job(&self, key: &JobKey) -> StoreResult<bool> {
    for trigger_key in self.kv.triggers.keys_matching(&TriggerFilter::for_job(key))? {
      self.kv.triggers.remove(&trigger_key)?;
    }
    let removed = self.kv.jobs.remove(key)?.is_some();
    if removed {
      debug!(store = %self.name, job_key = %key, "Removed job and its triggers.");
      self.signaler.signal_scheduling_change(None);
    }
    Ok(removed)
  }

  pub fn retrieve_trigger(&self, key: &TriggerKey) -> StoreResult<Option<TriggerRecord>> {
    Ok(self.kv.triggers.get(key)?)
  }

  pub fn retrieve_job(&self, key: &JobKey) -> StoreResult<Option<JobRecord>> {
    Ok(self.kv.jobs.get(key)?)
  }

  /// Every trigger of a job, ordered by key.
  pub fn triggers_for_job(&self, key: &JobKey) -> StoreResult<Vec<(TriggerKey, TriggerRecord)>> {
    let mut triggers = self
      .kv
      .triggers
      .entries_matching(&TriggerFilter::for_job(key))?;
    triggers.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(triggers)
  }

  /// Every trigger whose group matches, ordered by key.
  pub fn retrieve_triggers(
    &self,
    matcher: &GroupMatcher,
  ) -> StoreResult<Vec<(TriggerKey, TriggerRecord)>> {
    let mut triggers = self
      .kv
      .triggers
      .entries_matching(&TriggerFilter::all().in_trigger_group(matcher.clone()))?;
    triggers.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(triggers)
  }

  /// State of a trigger; [`TriggerState::None`] if it does not exist.
  pub fn trigger_state(&self, key: &TriggerKey) -> StoreResult<TriggerState> {
    Ok(
      self
        .kv
        .triggers
        .get(key)?
        .map(|r| r.state)
        .unwrap_or(TriggerState::None),
    )
  }

  pub fn job_keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<JobKey>> {
    let mut keys = self
      .kv
      .jobs
      .keys_matching(&JobFilter::in_group(matcher.clone()))?;
    keys.sort();
    Ok(keys)
  }

  pub fn trigger_keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<TriggerKey>> {
    let mut keys = self
      .kv
      .triggers
      .keys_matching(&TriggerFilter::all().in_trigger_group(matcher.clone()))?;
    keys.sort();
    Ok(keys)
  }

  pub fn job_group_names(&self) -> StoreResult<Vec<String>> {
    let keys = self.kv.jobs.keys_matching(&AllEntries)?;
    Ok(sorted_groups(keys.iter().map(|k| k.group())))
  }

  pub fn trigger_group_names(&self) -> StoreResult<Vec<String>> {
    let keys = self.kv.triggers.keys_matching(&AllEntries)?;
    Ok(sorted_groups(keys.iter().map(|k| k.group())))
  }

  /// Removes every trigger, job and calendar.
  pub fn clear_all(&self) -> StoreResult<()> {
    self.kv.triggers.clear()?;
    self.kv.jobs.clear()?;
    self.kv.calendars.clear()?;
    info!(store = %self.name, "Cleared all scheduling data.");
    Ok(())
  }

  // --- Calendars ---

  /// Stores a calendar. With `update_triggers`, triggers referencing it have
  /// their next fire time moved off newly excluded instants.
  pub fn store_calendar(
    &self,
    name: &str,
    calendar: Calendar,
    replace: bool,
    update_triggers: bool,
  ) -> StoreResult<()> {
    if replace {
      self.kv.calendars.set(name.to_string(), calendar.clone())?;
    } else if self
      .kv
      .calendars
      .put_if_absent(name.to_string(), calendar.clone())?
      .is_some()
    {
      return Err(StoreError::CalendarExists(name.to_string()));
    }

    if update_triggers {
      let referencing = self
        .kv
        .triggers
        .keys_matching(&TriggerFilter::all().using_calendar(name))?;
      for key in referencing {
        let exhausted = update_entry(&*self.kv.triggers, &key, |current| match current {
          Some(r)
            if r.next_fire_time.is_some()
              && !matches!(r.state, TriggerState::Complete | TriggerState::Error) =>
          {
            let mut r = r.clone();
            r.next_fire_time = calendar.first_included(&r.schedule, r.next_fire_time);
            let exhausted = r.next_fire_time.is_none();
            if exhausted {
              r.state = TriggerState::Complete;
            }
            (EntryUpdate::Set(r), exhausted)
          }
          _ => (EntryUpdate::Keep, false),
        })?;
        if exhausted {
          self.report_finalized(&key);
        }
      }
    }

    info!(store = %self.name, calendar = name, update_triggers, "Stored calendar.");
    self.signaler.signal_scheduling_change(None);
    Ok(())
  }

  /// Removes a calendar. Refused while any trigger references it.
  pub fn remove_calendar(&self, name: &str) -> StoreResult<bool> {
    if !self
      .kv
      .triggers
      .keys_matching(&TriggerFilter::all().using_calendar(name))?
      .is_empty()
    {
      return Err(StoreError::CalendarInUse(name.to_string()));
    }
    Ok(self.kv.calendars.remove(&name.to_string())?.is_some())
  }

  pub fn retrieve_calendar(&self, name: &str) -> StoreResult<Option<Calendar>> {
    self.load_calendar(Some(name))
  }

  pub fn calendar_names(&self) -> StoreResult<Vec<String>> {
    let mut names = self.kv.calendars.keys_matching(&AllEntries)?;
    names.sort();
    Ok(names)
  }

  // --- Pause & Resume ---

  /// Pauses a `Normal` or `Blocked` trigger. Returns whether it changed.
  pub fn pause_trigger(&self, key: &TriggerKey) -> StoreResult<bool> {
    let paused = update_entry(&*self.kv.triggers, key, |current| match current {
      Some(r) if matches!(r.state, TriggerState::Normal | TriggerState::Blocked) => {
        let mut r = r.clone();
        r.state = TriggerState::Paused;
        (EntryUpdate::Set(r), true)
      }
      _ => (EntryUpdate::Keep, false),
    })?;
    if paused {
      debug!(store = %self.name, trigger_key = %key, "Paused trigger.");
    }
    Ok(paused)
  }

  /// Resumes a paused trigger, correcting it if it missed fires while paused.
  /// Returns whether it changed.
  pub fn resume_trigger(&self, key: &TriggerKey) -> StoreResult<bool> {
    let Some(record) = self.kv.triggers.get(key)? else {
      return Ok(false);
    };
    if record.state != TriggerState::Paused {
      return Ok(false);
    }
    let blocked = self.job_has_blocking_execution(&record.job_key)?;
    let calendar = self.load_calendar(record.calendar_name.as_deref())?;
    let now = self.clock.now();
    let threshold = self.misfire_threshold();

    let outcome = update_entry(&*self.kv.triggers, key, |current| match current {
      Some(r) if r.state == TriggerState::Paused => {
        let mut r = r.clone();
        let misfire = if blocked {
          r.state = TriggerState::Blocked;
          Misfire::NotMisfired
        } else {
          r.state = TriggerState::Normal;
          correct_misfire(&mut r, calendar.as_ref(), now, threshold)
        };
        let next = r.next_fire_time;
        (EntryUpdate::Set(r), Some((misfire, next)))
      }
      _ => (EntryUpdate::Keep, None),
    })?;

    let Some((misfire, next)) = outcome else {
      return Ok(false);
    };
    debug!(store = %self.name, trigger_key = %key, blocked, "Resumed trigger.");
    self.report_misfire(key, misfire);
    self.signaler.signal_scheduling_change(next);
    Ok(true)
  }

  pub fn pause_job(&self, key: &JobKey) -> StoreResult<()> {
    for trigger_key in self.kv.triggers.keys_matching(&TriggerFilter::for_job(key))? {
      self.pause_trigger(&trigger_key)?;
    }
    Ok(())
  }

  pub fn resume_job(&self, key: &JobKey) -> StoreResult<()> {
    for trigger_key in self.kv.triggers.keys_matching(&TriggerFilter::for_job(key))? {
      self.resume_trigger(&trigger_key)?;
    }
    Ok(())
  }

  /// Pauses every trigger whose group matches. Returns the matched trigger groups.
  pub fn pause_triggers(&self, matcher: &GroupMatcher) -> StoreResult<Vec<String>> {
    let keys = self.trigger_keys(matcher)?;
    for key in &keys {
      self.pause_trigger(key)?;
    }
    Ok(sorted_groups(keys.iter().map(|k| k.group())))
  }

  /// Resumes every trigger whose group matches. Returns the matched trigger groups.
  pub fn resume_triggers(&self, matcher: &GroupMatcher) -> StoreResult<Vec<String>> {
    let keys = self.trigger_keys(matcher)?;
    for key in &keys {
      self.resume_trigger(key)?;
    }
    Ok(sorted_groups(keys.iter().map(|k| k.group())))
  }

  /// Pauses every trigger whose job's group matches. Returns the matched job groups.
  pub fn pause_jobs(&self, matcher: &GroupMatcher) -> StoreResult<Vec<String>> {
    let entries = self
      .kv
      .triggers
      .entries_matching(&TriggerFilter::all().in_job_group(matcher.clone()))?;
    for (key, _) in &entries {
      self.pause_trigger(key)?;
    }
    Ok(sorted_groups(entries.iter().map(|(_, r)| r.job_key.group())))
  }

  /// Resumes every trigger whose job's group matches. Returns the matched job groups.
  pub fn resume_jobs(&self, matcher: &GroupMatcher) -> StoreResult<Vec<String>> {
    let entries = self
      .kv
      .triggers
      .entries_matching(&TriggerFilter::all().in_job_group(matcher.clone()))?;
    for (key, _) in &entries {
      self.resume_trigger(key)?;
    }
    Ok(sorted_groups(entries.iter().map(|(_, r)| r.job_key.group())))
  }

  pub fn pause_all(&self) -> StoreResult<Vec<String>> {
    self.pause_triggers(&GroupMatcher::Any)
  }

  pub fn resume_all(&self) -> StoreResult<Vec<String>> {
    self.resume_triggers(&GroupMatcher::Any)
  }

  // --- Concurrent Execution Blocking ---

  /// Whether `job` disallows concurrent execution and one of its triggers is
  /// currently in flight.
  fn job_has_blocking_execution(&self, job_key: &JobKey) -> StoreResult<bool> {
    let Some(job) = self.kv.jobs.get(job_key)? else {
      return Ok(false);
    };
    if !job.concurrent_execution_disallowed {
      return Ok(false);
    }
    Ok(
      self
        .kv
        .triggers
        .entries_matching(&TriggerFilter::for_job(job_key))?
        .iter()
        .any(|(_, r)| !r.in_flight.is_empty()),
    )
  }

  fn block_sibling_triggers(&self, job_key: &JobKey, fired: &TriggerKey) -> StoreResult<()> {
    let siblings = self.kv.triggers.keys_matching(
      &TriggerFilter::for_job(job_key).with_state(TriggerState::Normal),
    )?;
    for key in siblings.iter().filter(|k| *k != fired) {
      self.kv.triggers.apply_to_entry(key, &mut |current| match current {
        Some(r) if r.state == TriggerState::Normal => {
          let mut r = r.clone();
          r.state = TriggerState::Blocked;
          EntryUpdate::Set(r)
        }
        _ => EntryUpdate::Keep,
      })?;
      trace!(store = %self.name, trigger_key = %key, "Blocked sibling trigger.");
    }
    Ok(())
  }

  fn unblock_job_triggers(&self, job_key: &JobKey) -> StoreResult<()> {
    if self.job_has_blocking_execution(job_key)? {
      return Ok(());
    }
    let blocked = self.kv.triggers.keys_matching(
      &TriggerFilter::for_job(job_key).with_state(TriggerState::Blocked),
    )?;
    for key in blocked {
      self.kv.triggers.apply_to_entry(&key, &mut |current| match current {
        Some(r) if r.state == TriggerState::Blocked => {
          let mut r = r.clone();
          r.state = TriggerState::Normal;
          EntryUpdate::Set(r)
        }
        _ => EntryUpdate::Keep,
      })?;
      trace!(store = %self.name, trigger_key = %key, "Unblocked trigger.");
    }
    Ok(())
  }

  // --- Acquisition ---

  /// Locks up to `max_count` triggers due no later than
  /// `no_later_than + time_window`, earliest first.
  ///
  /// Each candidate is misfire-corrected under its lock and dropped (and
  /// unlocked) if it is no longer due afterwards. Backend errors on a single
  /// candidate are logged and that candidate skipped.
  pub fn acquire_next_triggers(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: Duration,
  ) -> StoreResult<Vec<AcquiredTrigger>> {
    let window = ChronoDuration::from_std(time_window).unwrap_or_else(|_| ChronoDuration::zero());
    let bound = no_later_than
      .checked_add_signed(window)
      .unwrap_or(no_later_than);

    let mut candidates = self.kv.triggers.entries_matching(&TriggerFilter::due(bound))?;
    candidates.sort_by(|(ka, a), (kb, b)| {
      a.next_fire_time
        .cmp(&b.next_fire_time)
        .then_with(|| ka.cmp(kb))
    });
    candidates.truncate(max_count);

    let mut acquired = Vec::with_capacity(candidates.len());
    for (key, _) in candidates {
      match self.acquire_candidate(&key, bound) {
        Ok(Some(trigger)) => acquired.push(trigger),
        Ok(None) => {}
        Err(e) => {
          warn!(store = %self.name, trigger_key = %key, error = %e, "Skipping acquisition candidate after backend error.");
        }
      }
    }

    if !acquired.is_empty() {
      SchedulerMetrics::add(&self.metrics.triggers_acquired, acquired.len());
      debug!(store = %self.name, count = acquired.len(), %bound, "Acquired triggers.");
    }
    Ok(acquired)
  }

  fn acquire_candidate(
    &self,
    key: &TriggerKey,
    bound: DateTime<Utc>,
  ) -> StoreResult<Option<AcquiredTrigger>> {
    if self.kv.triggers.is_locked(key)?
      || !self
        .kv
        .triggers
        .try_lock(key, &self.node_id, self.config.lock_lease)?
    {
      SchedulerMetrics::incr(&self.metrics.candidates_skipped_locked);
      trace!(store = %self.name, trigger_key = %key, "Candidate locked elsewhere; skipping.");
      return Ok(None);
    }

    let result = self.revalidate_locked(key, bound);
    if !matches!(result, Ok(Some(_))) {
      self.release_lock(key);
    }
    result
  }

  /// Re-reads a locked candidate, applies misfire correction and checks it
  /// is still due.
  fn revalidate_locked(
    &self,
    key: &TriggerKey,
    bound: DateTime<Utc>,
  ) -> StoreResult<Option<AcquiredTrigger>> {
    let Some(record) = self.kv.triggers.get(key)? else {
      trace!(store = %self.name, trigger_key = %key, "Candidate vanished after lock.");
      return Ok(None);
    };
    let calendar = self.load_calendar(record.calendar_name.as_deref())?;
    let now = self.clock.now();
    let threshold = self.misfire_threshold();

    let (misfire, current) = update_entry(&*self.kv.triggers, key, |current| match current {
      None => (EntryUpdate::Keep, (Misfire::NotMisfired, None)),
      Some(r) if r.state != TriggerState::Normal => {
        (EntryUpdate::Keep, (Misfire::NotMisfired, Some(r.clone())))
      }
      Some(r) => {
        // The corrected record is written back even when nothing changed.
        let mut r = r.clone();
        let outcome = correct_misfire(&mut r, calendar.as_ref(), now, threshold);
        (EntryUpdate::Set(r.clone()), (outcome, Some(r)))
      }
    })?;
    self.report_misfire(key, misfire);
    if misfire != Misfire::NotMisfired {
      self.signaler.signal_scheduling_change(current.as_ref().and_then(|r| r.next_fire_time));
    }

    match current {
      Some(record) if record.is_due(bound) => Ok(record.next_fire_time.map(|scheduled| {
        AcquiredTrigger {
          key: key.clone(),
          scheduled_fire_time: scheduled,
        }
      })),
      _ => Ok(None),
    }
  }

  /// Releases an acquired trigger without firing it.
  pub fn release_acquired_trigger(&self, trigger: &AcquiredTrigger) {
    self.release_lock(&trigger.key);
  }

  // --- Firing ---

  /// Fires acquired triggers, returning one [`FireRecord`] per trigger that
  /// actually fired. Every acquired lock is released, after the fired state
  /// has been persisted.
  pub fn triggers_fired(&self, acquired: &[AcquiredTrigger]) -> Vec<FireRecord> {
    let mut fired = Vec::with_capacity(acquired.len());
    for trigger in acquired {
      match self.fire_one(trigger) {
        Ok(Some(record)) => fired.push(record),
        Ok(None) => SchedulerMetrics::incr(&self.metrics.fires_aborted),
        Err(e) => {
          SchedulerMetrics::incr(&self.metrics.fires_aborted);
          error!(store = %self.name, trigger_key = %trigger.key, error = %e, "Failed to fire trigger.");
        }
      }
      self.release_lock(&trigger.key);
    }
    SchedulerMetrics::add(&self.metrics.triggers_fired, fired.len());
    fired
  }

  fn fire_one(&self, acquired: &AcquiredTrigger) -> StoreResult<Option<FireRecord>> {
    let key = &acquired.key;
    let Some(record) = self.kv.triggers.get(key)? else {
      debug!(store = %self.name, trigger_key = %key, "Fire aborted: trigger removed.");
      return Ok(None);
    };
    if record.state != TriggerState::Normal {
      debug!(store = %self.name, trigger_key = %key, state = ?record.state, "Fire aborted: trigger no longer normal.");
      return Ok(None);
    }
    let calendar = match record.calendar_name.as_deref() {
      Some(name) => match self.load_calendar(Some(name))? {
        Some(calendar) => Some(calendar),
        None => {
          warn!(store = %self.name, trigger_key = %key, calendar = name, "Fire aborted: calendar missing.");
          return Ok(None);
        }
      },
      None => None,
    };
    let Some(job) = self.kv.jobs.get(&record.job_key)? else {
      warn!(store = %self.name, trigger_key = %key, job_key = %record.job_key, "Fire aborted: job missing.");
      return Ok(None);
    };

    let marker = InFlight {
      fire_instance_id: Uuid::new_v4(),
      node_id: self.node_id.clone(),
      fired_at: self.clock.now(),
      scheduled_fire_time: acquired.scheduled_fire_time,
    };
    let disallow_concurrent = job.concurrent_execution_disallowed;

    let updated = update_entry(&*self.kv.triggers, key, |current| match current {
      Some(r)
        if r.state == TriggerState::Normal
          && r.next_fire_time == Some(acquired.scheduled_fire_time) =>
      {
        let mut r = r.clone();
        r.previous_fire_time = r.next_fire_time;
        r.next_fire_time = advance(&r.schedule, calendar.as_ref(), acquired.scheduled_fire_time);
        r.times_triggered = r.times_triggered.saturating_add(1);
        r.in_flight.push(marker.clone());
        if r.next_fire_time.is_none() {
          r.state = TriggerState::Complete;
        } else if disallow_concurrent {
          r.state = TriggerState::Blocked;
        }
        (EntryUpdate::Set(r.clone()), Some(r))
      }
      _ => (EntryUpdate::Keep, None),
    })?;

    let Some(updated) = updated else {
      debug!(store = %self.name, trigger_key = %key, "Fire aborted: occurrence already consumed.");
      return Ok(None);
    };

    if disallow_concurrent {
      self.block_sibling_triggers(&updated.job_key, key)?;
    }
    if updated.state == TriggerState::Complete {
      self.report_finalized(key);
    }
    debug!(
      store = %self.name,
      trigger_key = %key,
      fire_instance_id = %marker.fire_instance_id,
      scheduled = %acquired.scheduled_fire_time,
      next = ?updated.next_fire_time,
      "Trigger fired."
    );
    Ok(Some(fire_record(key, &updated, &job, &marker, false)))
  }

  // --- Completion ---

  /// Applies a launcher's completion instruction to one fired occurrence.
  ///
  /// Only the in-flight marker of `fire_instance_id` is cleared, and triggers
  /// blocked by that execution are released first. A completion whose
  /// occurrence is no longer in flight (the trigger was removed, replaced or
  /// recovered meanwhile) leaves every trigger untouched.
  pub fn triggered_job_complete(
    &self,
    key: &TriggerKey,
    fire_instance_id: FireInstanceId,
    instruction: CompletionInstruction,
  ) -> StoreResult<()> {
    let cleared = update_entry(&*self.kv.triggers, key, |current| match current {
      Some(r) if r.in_flight.iter().any(|m| m.fire_instance_id == fire_instance_id) => {
        let mut r = r.clone();
        r.in_flight.retain(|m| m.fire_instance_id != fire_instance_id);
        (EntryUpdate::Set(r.clone()), Some(r))
      }
      _ => (EntryUpdate::Keep, None),
    })?;
    let Some(record) = cleared else {
      debug!(store = %self.name, trigger_key = %key, %fire_instance_id, ?instruction, "Completed occurrence is no longer in flight; ignoring.");
      return Ok(());
    };
    self.unblock_job_triggers(&record.job_key)?;

    trace!(store = %self.name, trigger_key = %key, ?instruction, "Applying completion instruction.");
    match instruction {
      CompletionInstruction::Noop => {}
      CompletionInstruction::DeleteTrigger => {
        if record.next_fire_time.is_none() {
          self.remove_trigger(key)?;
        } else {
          // Rescheduled while executing; keep it.
          self.signaler.signal_scheduling_change(record.next_fire_time);
        }
      }
      CompletionInstruction::SetTriggerComplete => {
        self.set_trigger_state(key, TriggerState::Complete)?;
        self.signaler.signal_scheduling_change(None);
      }
      CompletionInstruction::SetTriggerError => {
        self.set_trigger_state(key, TriggerState::Error)?;
        self.signaler.signal_scheduling_change(None);
      }
      CompletionInstruction::SetAllJobTriggersComplete => {
        self.set_job_triggers_state(&record.job_key, TriggerState::Complete)?;
        self.signaler.signal_scheduling_change(None);
      }
      CompletionInstruction::SetAllJobTriggersError => {
        self.set_job_triggers_state(&record.job_key, TriggerState::Error)?;
        self.signaler.signal_scheduling_change(None);
      }
    }
    Ok(())
  }

  fn set_trigger_state(&self, key: &TriggerKey, state: TriggerState) -> StoreResult<()> {
    self.kv.triggers.apply_to_entry(key, &mut |current| match current {
      Some(r) => {
        let mut r = r.clone();
        r.state = state;
        if state == TriggerState::Complete {
          r.next_fire_time = None;
        }
        EntryUpdate::Set(r)
      }
      None => EntryUpdate::Keep,
    })?;
    debug!(store = %self.name, trigger_key = %key, ?state, "Set trigger state.");
    Ok(())
  }

  fn set_job_triggers_state(&self, job_key: &JobKey, state: TriggerState) -> StoreResult<()> {
    for key in self.kv.triggers.keys_matching(&TriggerFilter::for_job(job_key))? {
      self.set_trigger_state(&key, state)?;
    }
    Ok(())
  }

  // --- Recovery & Hints ---

  /// Cleans up in-flight markers this node left behind (it restarted while
  /// jobs were running). Occurrences of jobs that requested recovery are
  /// returned as recovering fire records, ready to be launched again.
  pub fn recover_in_flight(&self) -> StoreResult<Vec<FireRecord>> {
    let stale = self
      .kv
      .triggers
      .entries_matching(&TriggerFilter::all().in_flight_on(&self.node_id))?;
    let mut recovered = Vec::new();

    for (key, _) in stale {
      let Some(record) = self.kv.triggers.get(&key)? else {
        continue;
      };
      let job = self.kv.jobs.get(&record.job_key)?;
      let recover = job.as_ref().is_some_and(|j| j.recovery_requested);
      let now = self.clock.now();
      let node_id = self.node_id.as_str();

      let updated = update_entry(&*self.kv.triggers, &key, |current| match current {
        Some(r) if r.in_flight.iter().any(|m| m.node_id == node_id) => {
          let mut r = r.clone();
          let (stale, kept): (Vec<_>, Vec<_>) =
            r.in_flight.drain(..).partition(|m| m.node_id == node_id);
          r.in_flight = kept;
          let renewed: Vec<InFlight> = if recover {
            stale
              .iter()
              .map(|m| InFlight {
                fire_instance_id: Uuid::new_v4(),
                node_id: node_id.to_string(),
                fired_at: now,
                scheduled_fire_time: m.scheduled_fire_time,
              })
              .collect()
          } else {
            Vec::new()
          };
          r.in_flight.extend(renewed.iter().cloned());
          (EntryUpdate::Set(r.clone()), Some((r, stale.len(), renewed)))
        }
        _ => (EntryUpdate::Keep, None),
      })?;
      let Some((updated, stale_count, renewed)) = updated else {
        continue;
      };

      match &job {
        Some(job) if recover => {
          for marker in &renewed {
            SchedulerMetrics::incr(&self.metrics.fires_recovered);
            info!(store = %self.name, trigger_key = %key, scheduled = %marker.scheduled_fire_time, "Recovering in-flight occurrence.");
            recovered.push(fire_record(&key, &updated, job, marker, true));
          }
        }
        _ => {
          debug!(store = %self.name, trigger_key = %key, markers = stale_count, "Cleared stale in-flight markers.");
          self.unblock_job_triggers(&updated.job_key)?;
        }
      }
    }
    Ok(recovered)
  }

  /// Earliest next fire time over all `Normal` triggers.
  pub fn next_fire_time_hint(&self) -> StoreResult<Option<DateTime<Utc>>> {
    Ok(
      self
        .kv
        .triggers
        .entries_matching(&TriggerFilter::all().with_state(TriggerState::Normal))?
        .into_iter()
        .filter_map(|(_, r)| r.next_fire_time)
        .min(),
    )
  }
}
