use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{SchedulerError, ShutdownError};
use crate::filter::GroupMatcher;
use crate::firing::{FiringConfig, FiringLoop, JobLauncher, LoopMode, ShutdownMode};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::record::{
  JobDetails, JobId, JobKey, JobRecord, JobRunnerKey, RunMode, TriggerKey, TriggerRecord,
};
use crate::request::JobRequest;
use crate::signal::{LoopSignaler, SchedulerSignaler};
use crate::store::TriggerStore;

#[derive(Debug, Default)]
struct LoopControl {
  mode_tx: Option<watch::Sender<LoopMode>>,
  handle: Option<JoinHandle<()>>,
  shut_down: bool,
}

/// The scheduling API for one [`RunMode`], backed by its own [`TriggerStore`]
/// and firing loop.
///
/// Job ids map to trigger keys and job runner keys map to job keys
/// (`"group/name"`, or the default group for a bare name).
pub struct SchedulerFacade {
  run_mode: RunMode,
  store: Arc<TriggerStore>,
  launcher: Arc<dyn JobLauncher>,
  firing_config: FiringConfig,
  metrics: SchedulerMetrics,
  wakeup: Arc<Notify>,
  control: Mutex<LoopControl>,
}

impl fmt::Debug for SchedulerFacade {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerFacade")
      .field("run_mode", &self.run_mode)
      .field("store", &self.store)
      .field("firing_config", &self.firing_config)
      .finish_non_exhaustive()
  }
}

impl SchedulerFacade {
  /// Wraps `store`, routing its signals to this facade's firing loop and
  /// then to `listener`.
  pub fn new(
    run_mode: RunMode,
    store: TriggerStore,
    launcher: Arc<dyn JobLauncher>,
    firing_config: FiringConfig,
    listener: Option<Arc<dyn SchedulerSignaler>>,
  ) -> Self {
    let wakeup = Arc::new(Notify::new());
    let metrics = store.metrics().clone();
    let store = store.with_signaler(Arc::new(LoopSignaler::new(wakeup.clone(), listener)));
    Self {
      run_mode,
      store: Arc::new(store),
      launcher,
      firing_config,
      metrics,
      wakeup,
      control: Mutex::new(LoopControl::default()),
    }
  }

  pub fn run_mode(&self) -> RunMode {
    self.run_mode
  }

  /// Direct access to the underlying store (calendars, group pause, ...).
  pub fn store(&self) -> &Arc<TriggerStore> {
    &self.store
  }

  fn ensure_running(&self) -> Result<(), SchedulerError> {
    if self.control.lock().shut_down {
      Err(SchedulerError::ShutDown)
    } else {
      Ok(())
    }
  }

  // --- Scheduling ---

  /// Schedules (or reschedules) `request.job_id` in this facade.
  ///
  /// The job record for the runner key is created if absent, then the
  /// trigger is stored, replacing any trigger with the same job id.
  pub fn schedule_job(&self, request: &JobRequest) -> Result<(), SchedulerError> {
    self.ensure_running()?;
    request.schedule.validate()?;

    let job_key = JobKey::parse(&request.job_runner_key);
    let trigger_key = TriggerKey::parse(&request.job_id);
    let job = JobRecord::new(&request.job_runner_key)
      .durable(request.durable)
      .request_recovery(request.recovery_requested)
      .disallow_concurrent_execution(request.concurrent_execution_disallowed);
    let created = self.store.store_job_if_absent(&job_key, job)?;

    let mut trigger = TriggerRecord::new(job_key.clone(), request.schedule.clone());
    trigger.calendar_name = request.calendar_name.clone();
    trigger.data = request.parameters.clone();

    let stored = match self.store.replace_trigger(&trigger_key, trigger.clone()) {
      Ok(true) => Ok(()),
      Ok(false) => self.store.store_trigger(&trigger_key, trigger, false),
      Err(e) => Err(e),
    };
    if let Err(e) = stored {
      if created {
        if let Err(cleanup) = self.store.remove_orphaned_job(&job_key) {
          warn!(run_mode = %self.run_mode, %job_key, error = %cleanup, "Failed to clean up job after rejected trigger.");
        }
      }
      return Err(e.into());
    }

    info!(
      run_mode = %self.run_mode,
      job_id = %request.job_id,
      job_runner_key = %request.job_runner_key,
      schedule = request.schedule.kind(),
      "Scheduled job."
    );
    Ok(())
  }

  /// Removes a job id. Returns `false` if it was not scheduled here.
  pub fn unschedule_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    self.ensure_running()?;
    let removed = self.store.remove_trigger(&TriggerKey::parse(job_id))?;
    if removed {
      info!(run_mode = %self.run_mode, %job_id, "Unscheduled job.");
    }
    Ok(removed)
  }

  pub fn pause_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    self.ensure_running()?;
    Ok(self.store.pause_trigger(&TriggerKey::parse(job_id))?)
  }

  pub fn resume_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
    self.ensure_running()?;
    Ok(self.store.resume_trigger(&TriggerKey::parse(job_id))?)
  }

  // --- Queries ---

  fn details(&self, key: &TriggerKey, record: TriggerRecord) -> JobDetails {
    JobDetails {
      job_id: key.to_string(),
      job_runner_key: record.job_key.to_string(),
      run_mode: self.run_mode,
      schedule: record.schedule,
      state: record.state,
      next_fire_time: record.next_fire_time,
      previous_fire_time: record.previous_fire_time,
      times_triggered: record.times_triggered,
      calendar_name: record.calendar_name,
      parameters: record.data,
    }
  }

  pub fn job_details(&self, job_id: &str) -> Result<Option<JobDetails>, SchedulerError> {
    let key = TriggerKey::parse(job_id);
    Ok(
      self
        .store
        .retrieve_trigger(&key)?
        .map(|record| self.details(&key, record)),
    )
  }

  /// Every job scheduled in this facade, ordered by job id.
  pub fn all_job_details(&self) -> Result<Vec<JobDetails>, SchedulerError> {
    let mut details: Vec<JobDetails> = self
      .store
      .retrieve_triggers(&GroupMatcher::Any)?
      .into_iter()
      .map(|(key, record)| self.details(&key, record))
      .collect();
    details.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(details)
  }

  pub fn job_details_for_runner(
    &self,
    job_runner_key: &str,
  ) -> Result<Vec<JobDetails>, SchedulerError> {
    let mut details: Vec<JobDetails> = self
      .store
      .triggers_for_job(&JobKey::parse(job_runner_key))?
      .into_iter()
      .map(|(key, record)| self.details(&key, record))
      .collect();
    details.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(details)
  }

  /// Distinct job runner keys with at least one scheduled trigger, sorted.
  /// Durable jobs whose triggers are all gone are not listed.
  pub fn job_runner_keys(&self) -> Result<Vec<JobRunnerKey>, SchedulerError> {
    let keys: BTreeSet<JobRunnerKey> = self
      .store
      .retrieve_triggers(&GroupMatcher::Any)?
      .into_iter()
      .map(|(_, record)| record.job_key.to_string())
      .collect();
    Ok(keys.into_iter().collect())
  }

  pub fn job_ids(&self) -> Result<Vec<JobId>, SchedulerError> {
    Ok(
      self
        .store
        .trigger_keys(&GroupMatcher::Any)?
        .into_iter()
        .map(|key| key.to_string())
        .collect(),
    )
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  // --- Lifecycle ---

  /// Whether the firing loop exists and is acquiring triggers.
  pub fn is_started(&self) -> bool {
    let control = self.control.lock();
    control
      .mode_tx
      .as_ref()
      .is_some_and(|tx| *tx.borrow() == LoopMode::Running)
  }

  /// Starts the firing loop, or resumes it from standby.
  ///
  /// On first start, in-flight occurrences this node left behind are
  /// recovered.
  ///
  /// # Panics
  /// Panics if called outside a Tokio runtime on first start.
  pub fn start(&self) -> Result<(), SchedulerError> {
    let mut control = self.control.lock();
    if control.shut_down {
      return Err(SchedulerError::ShutDown);
    }
    if let Some(tx) = &control.mode_tx {
      tx.send_replace(LoopMode::Running);
      info!(run_mode = %self.run_mode, "Firing loop resumed.");
      return Ok(());
    }

    let recovered = match self.store.recover_in_flight() {
      Ok(recovered) => recovered,
      Err(e) => {
        error!(run_mode = %self.run_mode, error = %e, "In-flight recovery failed; continuing without it.");
        Vec::new()
      }
    };

    let (mode_tx, mode_rx) = watch::channel(LoopMode::Running);
    let firing_loop = FiringLoop::new(
      self.store.clone(),
      self.launcher.clone(),
      self.firing_config.clone(),
      self.run_mode,
      mode_rx,
      self.wakeup.clone(),
      self.metrics.clone(),
      recovered,
    );
    let handle = Handle::current().spawn(firing_loop.run());
    control.mode_tx = Some(mode_tx);
    control.handle = Some(handle);
    info!(run_mode = %self.run_mode, node_id = %self.store.node_id(), "Firing loop started.");
    Ok(())
  }

  /// Stops acquiring triggers. Running jobs continue; state is kept.
  pub fn standby(&self) -> Result<(), SchedulerError> {
    let control = self.control.lock();
    if control.shut_down {
      return Err(SchedulerError::ShutDown);
    }
    if let Some(tx) = &control.mode_tx {
      tx.send_replace(LoopMode::Standby);
      info!(run_mode = %self.run_mode, "Firing loop in standby.");
    }
    Ok(())
  }

  /// Stops the firing loop for good and waits for it to exit.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: shutdown was already requested.
  /// - [`ShutdownError::SignalFailed`]: the loop exited on its own.
  /// - [`ShutdownError::Timeout`]: the loop did not exit within `timeout`.
  /// - [`ShutdownError::TaskPanic`]: the loop task panicked.
  pub async fn shutdown(
    &self,
    mode: ShutdownMode,
    timeout: Option<Duration>,
  ) -> Result<(), ShutdownError> {
    let (mode_tx, handle) = {
      let mut control = self.control.lock();
      if control.shut_down {
        return Err(ShutdownError::AlreadyShuttingDown);
      }
      control.shut_down = true;
      (control.mode_tx.take(), control.handle.take())
    };
    info!(run_mode = %self.run_mode, ?mode, "Shutting down facade.");

    let (Some(mode_tx), Some(handle)) = (mode_tx, handle) else {
      return Ok(());
    };
    mode_tx
      .send(LoopMode::Shutdown(mode))
      .map_err(|_| ShutdownError::SignalFailed)?;

    let joined = match timeout {
      Some(limit) => match tokio::time::timeout(limit, handle).await {
        Ok(joined) => joined,
        Err(_) => {
          error!(run_mode = %self.run_mode, ?limit, "Shutdown timed out.");
          return Err(ShutdownError::Timeout);
        }
      },
      None => handle.await,
    };
    // Keep the sender alive until the loop has exited.
    drop(mode_tx);

    match joined {
      Ok(()) => {
        info!(run_mode = %self.run_mode, "Firing loop joined.");
        Ok(())
      }
      Err(e) => {
        error!(run_mode = %self.run_mode, error = %e, "Firing loop task failed.");
        Err(ShutdownError::TaskPanic)
      }
    }
  }
}
