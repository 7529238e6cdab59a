use crate::record::{JobKey, TriggerKey};

use thiserror::Error;

// --- Schedule Validation Errors ---

/// Errors raised while validating a [`Schedule`](crate::schedule::Schedule).
///
/// These surface synchronously from `schedule_job`; a trigger carrying an
/// invalid schedule is never persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("Invalid cron expression '{expression}': {reason}")]
  CronSyntax { expression: String, reason: String },
  #[error("Unknown timezone '{0}'")]
  UnknownTimezone(String),
  #[error("Interval period must be greater than zero (got {0} ms)")]
  NonPositiveInterval(i64),
  #[error("Repeat count must be -1 (forever) or non-negative (got {0})")]
  InvalidRepeatCount(i32),
  #[error("Interval end time precedes its start time")]
  EndBeforeStart,
  #[error("Schedule kind '{0}' is not supported by this engine")]
  Unsupported(String),
}

// --- Key-Value Backend Errors ---

/// Errors reported by a [`KvMap`](crate::kv::KvMap) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
  #[error("Key-value backend unavailable: {0}")]
  Unavailable(String),
  #[error("Concurrent modification detected: {0}")]
  Conflict(String),
}

// --- Store Errors ---

/// Persistence errors raised by the [`TriggerStore`](crate::store::TriggerStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error(transparent)]
  Kv(#[from] KvError),
  #[error(transparent)]
  InvalidSchedule(#[from] ScheduleError),
  #[error("Trigger {key} has unsupported schedule kind '{kind}'")]
  UnsupportedTrigger { key: TriggerKey, kind: String },
  #[error("Trigger {0} already exists")]
  TriggerExists(TriggerKey),
  #[error("Job {0} already exists")]
  JobExists(JobKey),
  #[error("Job {0} not found")]
  JobNotFound(JobKey),
  #[error("Calendar '{0}' already exists")]
  CalendarExists(String),
  #[error("Calendar '{0}' not found")]
  CalendarNotFound(String),
  #[error("Calendar '{0}' is still referenced by at least one trigger")]
  CalendarInUse(String),
}

// --- Scheduling Service Errors ---

/// The checked error returned by [`SchedulerFacade`](crate::facade::SchedulerFacade)
/// and [`SchedulerService`](crate::service::SchedulerService) mutating calls.
/// Callers decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  #[error(transparent)]
  InvalidSchedule(#[from] ScheduleError),
  #[error("Scheduling persistence failure: {0}")]
  Persistence(#[from] StoreError),
  #[error("Scheduler has been shut down.")]
  ShutDown,
}

// --- Build Errors ---

/// Errors that can occur during the building phase using `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("A job launcher (`job_launcher`) must be specified")]
  MissingJobLauncher,
  #[error("Batch size (`max_batch_size`) must be greater than zero")]
  ZeroBatchSize,
}

// --- Shutdown Errors ---

/// Errors related to the shutdown process of a facade's firing loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (firing loop already gone).")]
  SignalFailed,
  #[error("Timed out waiting for the firing loop and its running jobs to complete shutdown.")]
  Timeout,
  #[error("The firing loop task panicked during the shutdown process.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}
