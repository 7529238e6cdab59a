//! The per-facade firing loop.
//!
//! One Tokio task repeatedly acquires due triggers from its
//! [`TriggerStore`], fires them, and hands each resulting [`FireRecord`] to the
//! [`JobLauncher`] on a separate task bounded by `max_workers`. When a launched
//! job finishes, its [`CompletionInstruction`] is reported back to the store.

use std::future::Future;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn, Instrument};

#[cfg(feature = "firing_context")]
use crate::context::{FiringContext, CURRENT_FIRING_CONTEXT};
use crate::metrics::SchedulerMetrics;
use crate::record::{CompletionInstruction, FireRecord, RunMode};
use crate::store::TriggerStore;

/// Poll cap when nothing is due.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(30);

/// Back-off when a due trigger could not be fired (another node holds it, or
/// its fire aborted).
const CONTENDED_POLL_INTERVAL: Duration = Duration::from_millis(25);

// --- Job Launcher ---

/// Executes the work behind a fired occurrence.
///
/// The returned future runs on its own task. If it panics, the panic is
/// logged and counted and the occurrence completes with
/// [`CompletionInstruction::Noop`].
pub trait JobLauncher: Send + Sync + 'static {
  fn launch(&self, fire: FireRecord) -> BoxFuture<'static, CompletionInstruction>;
}

impl<F, Fut> JobLauncher for F
where
  F: Fn(FireRecord) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = CompletionInstruction> + Send + 'static,
{
  fn launch(&self, fire: FireRecord) -> BoxFuture<'static, CompletionInstruction> {
    Box::pin((self)(fire))
  }
}

// --- Configuration & Control ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiringConfig {
  /// Maximum number of launched jobs running at once.
  pub max_workers: usize,
  /// Maximum triggers acquired per cycle.
  pub max_batch_size: usize,
  /// How far past "now" a cycle may acquire triggers.
  pub batch_time_window: Duration,
  /// Longest sleep between cycles.
  pub idle_wait: Duration,
}

impl Default for FiringConfig {
  fn default() -> Self {
    Self {
      max_workers: 1,
      max_batch_size: 1,
      batch_time_window: Duration::ZERO,
      idle_wait: DEFAULT_IDLE_WAIT,
    }
  }
}

/// How a firing loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownMode {
  /// Stop acquiring and wait for running jobs to report completion.
  Graceful,
  /// Stop acquiring and abort running jobs. Their occurrences stay in flight
  /// until this node recovers them.
  Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopMode {
  Standby,
  Running,
  Shutdown(ShutdownMode),
}

/// Aborts the wrapped task when dropped, so aborting the supervising task also
/// aborts the job it supervises.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

// --- Firing Loop ---

pub(crate) struct FiringLoop {
  store: Arc<TriggerStore>,
  launcher: Arc<dyn JobLauncher>,
  config: FiringConfig,
  run_mode: RunMode,
  mode_rx: watch::Receiver<LoopMode>,
  /// Set once the controlling facade is gone.
  detached: bool,
  wakeup: Arc<Notify>,
  metrics: SchedulerMetrics,
  permits: Arc<Semaphore>,
  running: JoinSet<()>,
  pending_recovery: Vec<FireRecord>,
  /// Occurrences fired by the previous cycle.
  last_fired: usize,
}

impl FiringLoop {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    store: Arc<TriggerStore>,
    launcher: Arc<dyn JobLauncher>,
    config: FiringConfig,
    run_mode: RunMode,
    mode_rx: watch::Receiver<LoopMode>,
    wakeup: Arc<Notify>,
    metrics: SchedulerMetrics,
    pending_recovery: Vec<FireRecord>,
  ) -> Self {
    let permits = Arc::new(Semaphore::new(config.max_workers));
    Self {
      store,
      launcher,
      config,
      run_mode,
      mode_rx,
      detached: false,
      wakeup,
      metrics,
      permits,
      running: JoinSet::new(),
      pending_recovery,
      last_fired: 0,
    }
  }

  fn current_mode(&self) -> LoopMode {
    if self.detached {
      LoopMode::Shutdown(ShutdownMode::Graceful)
    } else {
      *self.mode_rx.borrow()
    }
  }

  fn note_mode_change(&mut self, changed: Result<(), watch::error::RecvError>) {
    if changed.is_err() && !self.detached {
      warn!(store = %self.store.name(), "Facade dropped without shutdown; stopping gracefully.");
      self.detached = true;
    }
  }

  /// Runs until shut down.
  pub(crate) async fn run(mut self) {
    info!(store = %self.store.name(), run_mode = %self.run_mode, node_id = %self.store.node_id(), "Firing loop started.");

    loop {
      match self.current_mode() {
        LoopMode::Shutdown(ShutdownMode::Force) => {
          info!(store = %self.store.name(), running = self.running.len(), "Forced shutdown; aborting running jobs.");
          self.running.abort_all();
          while let Some(result) = self.running.join_next().await {
            self.log_join(result);
          }
          break;
        }
        LoopMode::Shutdown(ShutdownMode::Graceful) => {
          info!(store = %self.store.name(), running = self.running.len(), "Graceful shutdown; waiting for running jobs.");
          loop {
            tokio::select! {
              biased;
              changed = self.mode_rx.changed(), if !self.detached => {
                self.note_mode_change(changed);
                if self.current_mode() == LoopMode::Shutdown(ShutdownMode::Force) {
                  self.running.abort_all();
                }
              }
              joined = self.running.join_next() => match joined {
                Some(result) => self.log_join(result),
                None => break,
              },
            }
          }
          break;
        }
        LoopMode::Standby => {
          trace!(store = %self.store.name(), "Firing loop in standby.");
          tokio::select! {
            biased;
            changed = self.mode_rx.changed(), if !self.detached => self.note_mode_change(changed),
            Some(result) = self.running.join_next(), if !self.running.is_empty() => self.log_join(result),
          }
          continue;
        }
        LoopMode::Running => {}
      }

      self.launch_recovered().await;
      self.run_cycle().await;

      let sleep_duration = self.calculate_sleep();
      tokio::select! {
        biased;
        changed = self.mode_rx.changed(), if !self.detached => self.note_mode_change(changed),
        _ = self.wakeup.notified() => trace!(store = %self.store.name(), "Woken by scheduling change."),
        Some(result) = self.running.join_next(), if !self.running.is_empty() => self.log_join(result),
        _ = sleep(sleep_duration) => trace!(store = %self.store.name(), "Poll timer fired."),
      }
    }

    info!(store = %self.store.name(), "Firing loop stopped.");
  }

  async fn launch_recovered(&mut self) {
    for fire in std::mem::take(&mut self.pending_recovery) {
      self.dispatch(fire).await;
    }
  }

  /// One acquire → fire → dispatch pass.
  async fn run_cycle(&mut self) {
    let available = self.permits.available_permits();
    if available == 0 {
      trace!(store = %self.store.name(), "All workers busy; skipping acquisition.");
      self.last_fired = 0;
      return;
    }
    let max_count = available.min(self.config.max_batch_size).max(1);
    let now = self.store.now();

    let acquired =
      match self
        .store
        .acquire_next_triggers(now, max_count, self.config.batch_time_window)
      {
        Ok(acquired) => acquired,
        Err(e) => {
          warn!(store = %self.store.name(), error = %e, "Trigger acquisition failed; retrying next cycle.");
          self.last_fired = 0;
          return;
        }
      };
    self.last_fired = 0;
    if acquired.is_empty() {
      return;
    }

    // Triggers acquired ahead of time through the batch window fire together
    // once the earliest of them is due.
    if let Some(earliest) = acquired.iter().map(|a| a.scheduled_fire_time).min() {
      if let Ok(wait) = (earliest - self.store.now()).to_std() {
        if !wait.is_zero() {
          tokio::select! {
            biased;
            changed = self.mode_rx.changed(), if !self.detached => {
              self.note_mode_change(changed);
              if self.current_mode() != LoopMode::Running {
                debug!(store = %self.store.name(), count = acquired.len(), "Releasing acquired triggers; loop no longer running.");
                for trigger in &acquired {
                  self.store.release_acquired_trigger(trigger);
                }
                return;
              }
            }
            _ = sleep(wait) => {}
          }
        }
      }
    }

    let fired = self.store.triggers_fired(&acquired);
    self.last_fired = fired.len();
    for fire in fired {
      self.dispatch(fire).await;
    }
  }

  /// Spawns a fired occurrence onto the worker pool.
  async fn dispatch(&mut self, fire: FireRecord) {
    let permit = match self.permits.clone().acquire_owned().await {
      Ok(permit) => permit,
      Err(e) => {
        error!(store = %self.store.name(), trigger_key = %fire.trigger_key, error = %e, "Worker pool closed; dropping fired occurrence.");
        return;
      }
    };

    let store = self.store.clone();
    let launcher = self.launcher.clone();
    let metrics = self.metrics.clone();
    let run_mode = self.run_mode;
    let trigger_key = fire.trigger_key.clone();
    let fire_instance_id = fire.fire_instance_id;
    let had_next = fire.next_fire_time.is_some();

    let job_span = tracing::span!(
      tracing::Level::INFO,
      "job_fire",
      store = %store.name(),
      trigger_key = %trigger_key,
      fire_instance_id = %fire.fire_instance_id,
      job_type = fire.job_type.as_str(),
      run_mode = %run_mode,
      recovering = fire.recovering,
    );

    SchedulerMetrics::incr(&metrics.jobs_launched);
    self.running.spawn(
      async move {
        let _permit = permit;
        metrics
          .workers_active_current
          .fetch_add(1, AtomicOrdering::Relaxed);
        let start_time = Instant::now();

        #[cfg(feature = "firing_context")]
        let job = {
          let context = FiringContext {
            fire_instance_id: fire.fire_instance_id,
            trigger_key: fire.trigger_key.clone(),
            run_mode,
            scheduled_fire_time: fire.scheduled_fire_time,
            recovering: fire.recovering,
          };
          CURRENT_FIRING_CONTEXT.scope(context, async move { launcher.launch(fire).await })
        };
        #[cfg(not(feature = "firing_context"))]
        let job = async move { launcher.launch(fire).await };

        // Run on a nested task so a panic surfaces as a JoinError.
        let mut handle = AbortOnDrop(tokio::spawn(job.in_current_span()));
        let instruction = match (&mut handle.0).await {
          Ok(instruction) => {
            debug!(?instruction, "Job finished.");
            instruction
          }
          Err(e) if e.is_panic() => {
            SchedulerMetrics::incr(&metrics.jobs_panicked);
            error!("Job panicked during execution.");
            CompletionInstruction::Noop
          }
          Err(e) => {
            warn!(error = %e, "Job task was cancelled.");
            CompletionInstruction::Noop
          }
        };

        metrics
          .job_execution_duration
          .record(start_time.elapsed());
        metrics
          .workers_active_current
          .fetch_sub(1, AtomicOrdering::Relaxed);

        let instruction = if instruction == CompletionInstruction::Noop && !had_next {
          CompletionInstruction::DeleteTrigger
        } else {
          instruction
        };
        match store.triggered_job_complete(&trigger_key, fire_instance_id, instruction) {
          Ok(()) => SchedulerMetrics::incr(&metrics.jobs_completed),
          Err(e) => {
            SchedulerMetrics::incr(&metrics.completion_failures);
            error!(error = %e, ?instruction, "Failed to report job completion.");
          }
        }
      }
      .instrument(job_span),
    );
  }

  fn log_join(&self, result: Result<(), JoinError>) {
    match result {
      Ok(()) => {}
      Err(e) if e.is_cancelled() => {
        debug!(store = %self.store.name(), "Launched job aborted.");
      }
      Err(e) => {
        error!(store = %self.store.name(), error = %e, "Job supervisor task failed.");
      }
    }
  }

  /// Time until the earliest due trigger, capped at `idle_wait`.
  fn calculate_sleep(&self) -> Duration {
    let idle = self.config.idle_wait;
    if self.permits.available_permits() == 0 {
      // A finishing job wakes the loop through the join set.
      return idle;
    }
    match self.store.next_fire_time_hint() {
      Ok(Some(next)) => {
        let until_due = (next - self.store.now()).to_std().ok();
        sleep_until_due(until_due, self.last_fired > 0, idle)
      }
      Ok(None) => idle,
      Err(e) => {
        warn!(store = %self.store.name(), error = %e, "Failed to compute next fire time hint.");
        idle
      }
    }
  }
}

/// Sleep before the next cycle when the earliest trigger is due in
/// `until_due` (`None` once it is overdue).
///
/// Overdue work right after a cycle that fired runs immediately. Overdue
/// triggers that fired nothing (locked elsewhere, or aborting on a missing
/// job or calendar) are polled at the contended pace instead.
fn sleep_until_due(
  until_due: Option<Duration>,
  fired_last_cycle: bool,
  idle: Duration,
) -> Duration {
  match until_due {
    Some(wait) if !wait.is_zero() => wait.min(idle),
    _ if fired_last_cycle => Duration::ZERO,
    _ => CONTENDED_POLL_INTERVAL.min(idle),
  }
}
