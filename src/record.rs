//! Persisted trigger and job records, their keys, and the values exchanged
//! between the store, the firing loop and job launchers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::schedule::Schedule;

// --- Public Type Aliases ---

/// Caller-facing identifier of one schedulable occurrence series.
/// `"group/name"` selects a group; a bare name lands in [`DEFAULT_GROUP`].
///
/// Ids are reported in canonical form: `"DEFAULT/x"` and `"x"` name the same
/// series and both come back as `"x"`.
pub type JobId = String;

/// Caller-facing identifier of a kind of work, shared by many [`JobId`]s.
pub type JobRunnerKey = String;

/// Unique identifier of one fired occurrence.
pub type FireInstanceId = Uuid;

/// Group used when an identifier carries no `group/` prefix.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Epoch-millis sentinel for "never fires again".
pub const NO_FIRE_TIME: i64 = -1;

// --- Keys ---

macro_rules! define_key {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct $name {
      group: String,
      name: String,
    }

    impl $name {
      pub fn new(group: &str, name: &str) -> Self {
        Self {
          group: group.to_string(),
          name: name.to_string(),
        }
      }

      /// Splits an external identifier at its first `/` into group and name.
      /// An explicit `DEFAULT/` prefix yields the same key as the bare name.
      pub fn parse(id: &str) -> Self {
        match id.split_once('/') {
          Some((group, name)) if !group.is_empty() => Self::new(group, name),
          _ => Self::new(DEFAULT_GROUP, id),
        }
      }

      pub fn group(&self) -> &str {
        &self.group
      }

      pub fn name(&self) -> &str {
        &self.name
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group == DEFAULT_GROUP {
          write!(f, "{}", self.name)
        } else {
          write!(f, "{}/{}", self.group, self.name)
        }
      }
    }
  };
}

define_key!(
  /// Identity of a [`TriggerRecord`] inside one store.
  TriggerKey
);
define_key!(
  /// Identity of a [`JobRecord`] inside one store.
  JobKey
);

// --- Trigger State ---

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerState {
  /// Not (yet) stored.
  None,
  /// Eligible for acquisition when due.
  Normal,
  Paused,
  /// No further occurrences. `next_fire_time` is always `None`.
  Complete,
  /// Parked by a `SetTriggerError` completion; never acquired.
  Error,
  /// The job disallows concurrent execution and has a firing in flight.
  Blocked,
}

// --- Records ---

/// Marker written atomically when an occurrence fires, cleared when that
/// same occurrence completes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InFlight {
  pub fire_instance_id: FireInstanceId,
  pub node_id: String,
  pub fired_at: DateTime<Utc>,
  pub scheduled_fire_time: DateTime<Utc>,
}

/// Persisted representation of one scheduled occurrence series.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerRecord {
  pub job_key: JobKey,
  pub schedule: Schedule,
  pub calendar_name: Option<String>,
  /// `None` is the NO_FIRE_TIME sentinel.
  pub next_fire_time: Option<DateTime<Utc>>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub times_triggered: u32,
  pub state: TriggerState,
  pub data: BTreeMap<String, String>,
  /// One marker per fired occurrence still executing.
  pub in_flight: Vec<InFlight>,
}

impl TriggerRecord {
  /// Creates an unstored record; the store computes its first fire time.
  pub fn new(job_key: JobKey, schedule: Schedule) -> Self {
    Self {
      job_key,
      schedule,
      calendar_name: None,
      next_fire_time: None,
      previous_fire_time: None,
      times_triggered: 0,
      state: TriggerState::None,
      data: BTreeMap::new(),
      in_flight: Vec::new(),
    }
  }

  pub fn with_calendar(mut self, calendar_name: &str) -> Self {
    self.calendar_name = Some(calendar_name.to_string());
    self
  }

  pub fn with_data(mut self, key: &str, value: &str) -> Self {
    self.data.insert(key.to_string(), value.to_string());
    self
  }

  /// Next fire time as epoch millis, [`NO_FIRE_TIME`] when exhausted.
  pub fn next_fire_time_millis(&self) -> i64 {
    self
      .next_fire_time
      .map(|t| t.timestamp_millis())
      .unwrap_or(NO_FIRE_TIME)
  }

  /// Acquisition eligibility: Normal and due no later than `bound`.
  pub(crate) fn is_due(&self, bound: DateTime<Utc>) -> bool {
    self.state == TriggerState::Normal && self.next_fire_time.is_some_and(|t| t <= bound)
  }
}

/// Persisted representation of a runnable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobRecord {
  /// Job-type identifier handed to the launcher.
  pub job_type: String,
  /// Survive with zero triggers.
  pub durable: bool,
  /// Re-fire on restart if an occurrence was in flight when this node died.
  pub recovery_requested: bool,
  /// At most one firing of this job at a time; siblings go `Blocked`.
  pub concurrent_execution_disallowed: bool,
  pub data: BTreeMap<String, String>,
}

impl JobRecord {
  pub fn new(job_type: &str) -> Self {
    Self {
      job_type: job_type.to_string(),
      durable: false,
      recovery_requested: false,
      concurrent_execution_disallowed: false,
      data: BTreeMap::new(),
    }
  }

  pub fn durable(mut self, durable: bool) -> Self {
    self.durable = durable;
    self
  }

  pub fn request_recovery(mut self, recovery: bool) -> Self {
    self.recovery_requested = recovery;
    self
  }

  pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
    self.concurrent_execution_disallowed = disallow;
    self
  }

  pub fn with_data(mut self, key: &str, value: &str) -> Self {
    self.data.insert(key.to_string(), value.to_string());
    self
  }
}

// --- Run Mode ---

/// Where a job fires: on every node, or once across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunMode {
  RunLocally,
  RunOncePerCluster,
}

impl fmt::Display for RunMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunMode::RunLocally => f.write_str("local"),
      RunMode::RunOncePerCluster => f.write_str("clustered"),
    }
  }
}

// --- Firing ---

/// Outcome reported by a job launcher, driving the post-fire transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompletionInstruction {
  Noop,
  DeleteTrigger,
  SetTriggerComplete,
  SetTriggerError,
  SetAllJobTriggersComplete,
  SetAllJobTriggersError,
}

/// One fired occurrence, handed to the [`JobLauncher`](crate::firing::JobLauncher).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FireRecord {
  pub fire_instance_id: FireInstanceId,
  pub job_id: JobId,
  pub trigger_key: TriggerKey,
  pub job_key: JobKey,
  pub job_type: String,
  /// Job data overlaid with trigger data.
  pub job_parameters: BTreeMap<String, String>,
  pub fired_at: DateTime<Utc>,
  pub scheduled_fire_time: DateTime<Utc>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  /// Re-fire of an occurrence that was in flight when its node went away.
  pub recovering: bool,
}

// --- Public Snapshot Structs for Querying ---

/// Detailed information about one scheduled job, as returned by queries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobDetails {
  pub job_id: JobId,
  pub job_runner_key: JobRunnerKey,
  pub run_mode: RunMode,
  pub schedule: Schedule,
  pub state: TriggerState,
  pub next_fire_time: Option<DateTime<Utc>>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub times_triggered: u32,
  pub calendar_name: Option<String>,
  pub parameters: BTreeMap<String, String>,
}
