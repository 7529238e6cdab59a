use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::record::{JobId, JobRunnerKey, RunMode};
use crate::schedule::Schedule;

/// Everything needed to schedule one job through a
/// [`SchedulerService`](crate::service::SchedulerService).
///
/// # Example
///
/// ```
/// use clusterkeeper::{JobRequest, RunMode};
///
/// let request = JobRequest::from_cron("reports/nightly", "report-runner", "0 0 * * *")
///   .with_run_mode(RunMode::RunOncePerCluster)
///   .with_parameter("format", "pdf");
/// assert_eq!(request.job_id, "reports/nightly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobRequest {
  pub job_id: JobId,
  pub job_runner_key: JobRunnerKey,
  pub schedule: Schedule,
  /// Defaults to [`RunMode::RunOncePerCluster`].
  pub run_mode: RunMode,
  pub calendar_name: Option<String>,
  /// Per-occurrence parameters, overlaid on the runner's job data when fired.
  pub parameters: BTreeMap<String, String>,
  pub durable: bool,
  pub recovery_requested: bool,
  pub concurrent_execution_disallowed: bool,
}

impl JobRequest {
  pub fn new(job_id: &str, job_runner_key: &str, schedule: Schedule) -> Self {
    Self {
      job_id: job_id.to_string(),
      job_runner_key: job_runner_key.to_string(),
      schedule,
      run_mode: RunMode::RunOncePerCluster,
      calendar_name: None,
      parameters: BTreeMap::new(),
      durable: false,
      recovery_requested: false,
      concurrent_execution_disallowed: false,
    }
  }

  /// A job firing on a UTC cron expression.
  pub fn from_cron(job_id: &str, job_runner_key: &str, expression: &str) -> Self {
    Self::new(job_id, job_runner_key, Schedule::cron(expression))
  }

  /// A job firing every `period`, starting when scheduled.
  pub fn from_interval(job_id: &str, job_runner_key: &str, period: Duration) -> Self {
    Self::new(job_id, job_runner_key, Schedule::every(period))
  }

  /// A job firing once at `run_at`.
  pub fn once(job_id: &str, job_runner_key: &str, run_at: DateTime<Utc>) -> Self {
    Self::new(job_id, job_runner_key, Schedule::once(run_at))
  }

  pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
    self.run_mode = run_mode;
    self
  }

  pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
    self.parameters.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_calendar(mut self, calendar_name: &str) -> Self {
    self.calendar_name = Some(calendar_name.to_string());
    self
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
}
