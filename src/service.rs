use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{BuildError, ScheduleError, SchedulerError, ShutdownError};
use crate::facade::SchedulerFacade;
use crate::firing::{FiringConfig, JobLauncher, ShutdownMode, DEFAULT_IDLE_WAIT};
use crate::kv::KvBackend;
use crate::metrics::MetricsSnapshot;
use crate::record::{JobDetails, JobRunnerKey, RunMode};
use crate::request::JobRequest;
use crate::schedule::Schedule;
use crate::signal::SchedulerSignaler;
use crate::store::{StoreConfig, TriggerStore, DEFAULT_MISFIRE_THRESHOLD};

const LOCAL_STORE_NAME: &str = "local";
const CLUSTERED_STORE_NAME: &str = "clustered";

/// Builder for configuring and creating a [`SchedulerService`].
///
/// # Example
///
/// ```no_run
/// use clusterkeeper::{CompletionInstruction, FireRecord, KvBackend, SchedulerService};
///
/// # fn shared_cluster_backend() -> KvBackend { KvBackend::in_memory() }
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let service = SchedulerService::builder()
///     .max_workers(4)
///     .node_id("node-a")
///     .clustered_backend(shared_cluster_backend())
///     .job_launcher(|fire: FireRecord| async move {
///         println!("running {}", fire.job_id);
///         CompletionInstruction::Noop
///     })
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  job_launcher: Option<Arc<dyn JobLauncher>>,
  max_workers: Option<usize>,
  node_id: Option<String>,
  misfire_threshold: Duration,
  idle_wait: Duration,
  max_batch_size: usize,
  batch_time_window: Duration,
  lock_lease: Option<Duration>,
  clock: Option<Arc<dyn Clock>>,
  local_backend: Option<KvBackend>,
  clustered_backend: Option<KvBackend>,
  signal_listener: Option<Arc<dyn SchedulerSignaler>>,
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("has_job_launcher", &self.job_launcher.is_some())
      .field("max_workers", &self.max_workers)
      .field("node_id", &self.node_id)
      .field("misfire_threshold", &self.misfire_threshold)
      .field("idle_wait", &self.idle_wait)
      .field("max_batch_size", &self.max_batch_size)
      .field("batch_time_window", &self.batch_time_window)
      .field("lock_lease", &self.lock_lease)
      .field("clock", &self.clock)
      .field("local_backend", &self.local_backend)
      .field("clustered_backend", &self.clustered_backend)
      .finish_non_exhaustive()
  }
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      job_launcher: None,
      max_workers: None,
      node_id: None,
      misfire_threshold: DEFAULT_MISFIRE_THRESHOLD,
      idle_wait: DEFAULT_IDLE_WAIT,
      max_batch_size: 1,
      batch_time_window: Duration::ZERO,
      lock_lease: None,
      clock: None,
      local_backend: None,
      clustered_backend: None,
      signal_listener: None,
    }
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - `job_launcher`, `max_workers`: Not set (required).
  /// - `node_id`: A random UUID.
  /// - Both backends: Process-local in-memory maps.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets what runs fired occurrences (required).
  pub fn job_launcher<L: JobLauncher>(mut self, launcher: L) -> Self {
    let launcher: Arc<dyn JobLauncher> = Arc::new(launcher);
    self.job_launcher = Some(launcher);
    self
  }

  /// Sets the maximum number of jobs each facade runs at once (required, > 0).
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  /// Sets this node's identity, used as the owner of acquisition locks and
  /// in-flight markers. Must be unique across the cluster and stable across
  /// restarts for in-flight recovery to find this node's work.
  pub fn node_id(mut self, node_id: &str) -> Self {
    self.node_id = Some(node_id.to_string());
    self
  }

  pub fn misfire_threshold(mut self, threshold: Duration) -> Self {
    self.misfire_threshold = threshold;
    self
  }

  /// Longest time the firing loop sleeps when nothing is due.
  pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
    self.idle_wait = idle_wait;
    self
  }

  pub fn max_batch_size(mut self, size: usize) -> Self {
    self.max_batch_size = size;
    self
  }

  /// Lets a cycle acquire triggers due up to `window` past now.
  pub fn batch_time_window(mut self, window: Duration) -> Self {
    self.batch_time_window = window;
    self
  }

  /// Lets a lock held longer than `lease` be reclaimed by another node.
  pub fn lock_lease(mut self, lease: Duration) -> Self {
    self.lock_lease = Some(lease);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn local_backend(mut self, backend: KvBackend) -> Self {
    self.local_backend = Some(backend);
    self
  }

  /// Sets the backend shared by every node of the cluster.
  pub fn clustered_backend(mut self, backend: KvBackend) -> Self {
    self.clustered_backend = Some(backend);
    self
  }

  pub fn signal_listener(mut self, listener: Arc<dyn SchedulerSignaler>) -> Self {
    self.signal_listener = Some(listener);
    self
  }

  /// Builds the service. Firing loops are not started until
  /// [`SchedulerService::start`].
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingJobLauncher`]: `job_launcher` was not set.
  /// - [`BuildError::MissingOrZeroMaxWorkers`]: `max_workers` was not set or is 0.
  /// - [`BuildError::ZeroBatchSize`]: `max_batch_size` is 0.
  pub fn build(self) -> Result<SchedulerService, BuildError> {
    let launcher = self.job_launcher.ok_or(BuildError::MissingJobLauncher)?;
    let max_workers = self
      .max_workers
      .filter(|count| *count > 0)
      .ok_or(BuildError::MissingOrZeroMaxWorkers)?;
    if self.max_batch_size == 0 {
      return Err(BuildError::ZeroBatchSize);
    }

    let node_id = self.node_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let store_config = StoreConfig {
      misfire_threshold: self.misfire_threshold,
      lock_lease: self.lock_lease,
    };
    let firing_config = FiringConfig {
      max_workers,
      max_batch_size: self.max_batch_size,
      batch_time_window: self.batch_time_window,
      idle_wait: self.idle_wait,
    };

    let local_backend = self.local_backend.unwrap_or_else(KvBackend::in_memory);
    let clustered_backend = self.clustered_backend.unwrap_or_else(|| {
      warn!(%node_id, "No clustered backend configured; clustered jobs will only be shared within this process.");
      KvBackend::in_memory()
    });

    let make_facade = |run_mode: RunMode, name: &str, backend: KvBackend| {
      let store = TriggerStore::new(name, &node_id, backend)
        .with_config(store_config.clone())
        .with_clock(clock.clone());
      SchedulerFacade::new(
        run_mode,
        store,
        launcher.clone(),
        firing_config.clone(),
        self.signal_listener.clone(),
      )
    };
    let local = make_facade(RunMode::RunLocally, LOCAL_STORE_NAME, local_backend);
    let clustered = make_facade(
      RunMode::RunOncePerCluster,
      CLUSTERED_STORE_NAME,
      clustered_backend,
    );

    info!(%node_id, max_workers, "Scheduler service built.");
    Ok(SchedulerService {
      node_id,
      local,
      clustered,
    })
  }
}

/// The top-level scheduling API.
///
/// Composes one [`SchedulerFacade`] per [`RunMode`]: local jobs fire on every
/// node, clustered jobs fire once across every node sharing the clustered
/// backend. A job id lives in at most one of the two; when both report the
/// same id, the clustered one wins.
///
/// Use [`SchedulerService::builder()`] to create and configure an instance.
#[derive(Debug)]
pub struct SchedulerService {
  node_id: String,
  local: SchedulerFacade,
  clustered: SchedulerFacade,
}

impl SchedulerService {
  /// Returns a builder to configure and create a `SchedulerService`.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  /// The facade handling jobs of `run_mode`.
  pub fn facade(&self, run_mode: RunMode) -> &SchedulerFacade {
    match run_mode {
      RunMode::RunLocally => &self.local,
      RunMode::RunOncePerCluster => &self.clustered,
    }
  }

  // --- Scheduling ---

  /// Schedules `request`, replacing any previous scheduling of its job id in
  /// either run mode.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::InvalidSchedule`]: Nothing was changed.
  /// - [`SchedulerError::Persistence`]: The backend rejected a write.
  /// - [`SchedulerError::ShutDown`]: The service has been shut down.
  pub fn do_schedule_job(&self, request: &JobRequest) -> Result<(), SchedulerError> {
    request.schedule.validate()?;
    self.local.unschedule_job(&request.job_id)?;
    self.clustered.unschedule_job(&request.job_id)?;
    self.facade(request.run_mode).schedule_job(request)
  }

  /// Removes `job_id` from both run modes. Returns `false` if it was not
  /// scheduled anywhere.
  pub fn unschedule_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    let local = self.local.unschedule_job(job_id)?;
    let clustered = self.clustered.unschedule_job(job_id)?;
    Ok(local || clustered)
  }

  pub fn pause_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    let local = self.local.pause_job(job_id)?;
    let clustered = self.clustered.pause_job(job_id)?;
    Ok(local || clustered)
  }

  pub fn resume_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    let local = self.local.resume_job(job_id)?;
    let clustered = self.clustered.resume_job(job_id)?;
    Ok(local || clustered)
  }

  // --- Queries ---

  pub fn job_details(&self, job_id: &str) -> Result<Option<JobDetails>, SchedulerError> {
    match self.clustered.job_details(job_id) {
      Ok(Some(details)) => return Ok(Some(details)),
      Ok(None) => {}
      Err(e) => {
        warn!(%job_id, error = %e, "Clustered lookup failed; checking local jobs only.");
        return match self.local.job_details(job_id) {
          Ok(found) => Ok(found),
          Err(_) => Err(e),
        };
      }
    }
    self.local.job_details(job_id)
  }

  /// Every scheduled job, ordered by job id.
  pub fn all_job_details(&self) -> Result<Vec<JobDetails>, SchedulerError> {
    merge_details(self.local.all_job_details(), self.clustered.all_job_details())
  }

  /// Every job scheduled for `job_runner_key`, ordered by job id.
  pub fn job_details_for_runner(
    &self,
    job_runner_key: &str,
  ) -> Result<Vec<JobDetails>, SchedulerError> {
    merge_details(
      self.local.job_details_for_runner(job_runner_key),
      self.clustered.job_details_for_runner(job_runner_key),
    )
  }

  /// Distinct job runner keys across both run modes, sorted.
  pub fn job_runner_keys(&self) -> Result<Vec<JobRunnerKey>, SchedulerError> {
    let mut keys = BTreeSet::new();
    let mut failures = 0;
    let mut last_error = None;
    for (facade, result) in [
      (&self.local, self.local.job_runner_keys()),
      (&self.clustered, self.clustered.job_runner_keys()),
    ] {
      match result {
        Ok(found) => keys.extend(found),
        Err(e) => {
          warn!(run_mode = %facade.run_mode(), error = %e, "Listing job runner keys failed; returning partial result.");
          failures += 1;
          last_error = Some(e);
        }
      }
    }
    match last_error {
      Some(e) if failures == 2 => Err(e),
      _ => Ok(keys.into_iter().collect()),
    }
  }

  /// The next time `schedule` would fire if it were scheduled now. Nothing is
  /// persisted.
  pub fn next_fire_time_preview(
    &self,
    schedule: &Schedule,
  ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    schedule.preview(self.clustered.store().now())
  }

  /// Metrics of both facades added together.
  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self
      .local
      .metrics_snapshot()
      .combined(&self.clustered.metrics_snapshot())
  }

  // --- Lifecycle ---

  /// Starts (or resumes) both firing loops.
  ///
  /// # Panics
  /// Panics if called outside a Tokio runtime on first start.
  pub fn start(&self) -> Result<(), SchedulerError> {
    self.local.start()?;
    self.clustered.start()?;
    info!(node_id = %self.node_id, "Scheduler service started.");
    Ok(())
  }

  /// Stops both firing loops from acquiring triggers, keeping all state.
  pub fn standby(&self) -> Result<(), SchedulerError> {
    self.local.standby()?;
    self.clustered.standby()?;
    info!(node_id = %self.node_id, "Scheduler service in standby.");
    Ok(())
  }

  pub fn is_started(&self) -> bool {
    self.local.is_started() && self.clustered.is_started()
  }

  /// Shuts both facades down concurrently, waiting at most `timeout` for each.
  ///
  /// # Errors
  ///
  /// The first [`ShutdownError`] reported by either facade.
  pub async fn shutdown(
    &self,
    mode: ShutdownMode,
    timeout: Option<Duration>,
  ) -> Result<(), ShutdownError> {
    info!(node_id = %self.node_id, ?mode, "Initiating scheduler service shutdown...");
    try_join_all([
      self.local.shutdown(mode, timeout),
      self.clustered.shutdown(mode, timeout),
    ])
    .await?;
    info!(node_id = %self.node_id, "Scheduler service shut down.");
    Ok(())
  }
}

/// Unions both facades' details by job id, clustered entries replacing local
/// ones. A failing side is logged and skipped unless both fail.
fn merge_details(
  local: Result<Vec<JobDetails>, SchedulerError>,
  clustered: Result<Vec<JobDetails>, SchedulerError>,
) -> Result<Vec<JobDetails>, SchedulerError> {
  let mut merged = BTreeMap::new();
  let mut failures = 0;
  let mut last_error = None;
  for (run_mode, result) in [
    (RunMode::RunLocally, local),
    (RunMode::RunOncePerCluster, clustered),
  ] {
    match result {
      Ok(details) => {
        for detail in details {
          merged.insert(detail.job_id.clone(), detail);
        }
      }
      Err(e) => {
        warn!(%run_mode, error = %e, "Job query failed; returning partial result.");
        failures += 1;
        last_error = Some(e);
      }
    }
  }
  match last_error {
    Some(e) if failures == 2 => Err(e),
    _ => Ok(merged.into_values().collect()),
  }
}
