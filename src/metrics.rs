use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Atomic counters shared by one facade's trigger store and firing loop.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
  // --- Store counters ---
  /// Triggers locked and returned by acquisition.
  pub triggers_acquired: Arc<AtomicUsize>,
  /// Occurrences that fired and produced a fire record.
  pub triggers_fired: Arc<AtomicUsize>,
  /// Misfire corrections applied.
  pub triggers_misfired: Arc<AtomicUsize>,
  /// Triggers that ran out of occurrences.
  pub triggers_finalized: Arc<AtomicUsize>,
  /// Acquired triggers whose fire was aborted (state changed, calendar gone, ...).
  pub fires_aborted: Arc<AtomicUsize>,
  /// Acquisition candidates skipped because another holder had the lock.
  pub candidates_skipped_locked: Arc<AtomicUsize>,
  /// In-flight occurrences re-fired after a restart.
  pub fires_recovered: Arc<AtomicUsize>,

  // --- Firing loop counters ---
  pub jobs_launched: Arc<AtomicUsize>,
  /// Launches whose completion was reported back to the store.
  pub jobs_completed: Arc<AtomicUsize>,
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Completion reports the store rejected.
  pub completion_failures: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Current number of launched jobs still running.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl Default for SchedulerMetrics {
  fn default() -> Self {
    Self::new()
  }
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self {
      triggers_acquired: Default::default(),
      triggers_fired: Default::default(),
      triggers_misfired: Default::default(),
      triggers_finalized: Default::default(),
      fires_aborted: Default::default(),
      candidates_skipped_locked: Default::default(),
      fires_recovered: Default::default(),
      jobs_launched: Default::default(),
      jobs_completed: Default::default(),
      jobs_panicked: Default::default(),
      completion_failures: Default::default(),
      workers_active_current: Default::default(),
      job_execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn add(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Point-in-time copy of every value.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      triggers_acquired: self.triggers_acquired.load(order),
      triggers_fired: self.triggers_fired.load(order),
      triggers_misfired: self.triggers_misfired.load(order),
      triggers_finalized: self.triggers_finalized.load(order),
      fires_aborted: self.fires_aborted.load(order),
      candidates_skipped_locked: self.candidates_skipped_locked.load(order),
      fires_recovered: self.fires_recovered.load(order),
      jobs_launched: self.jobs_launched.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      completion_failures: self.completion_failures.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// Plain-data copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  pub triggers_acquired: usize,
  pub triggers_fired: usize,
  pub triggers_misfired: usize,
  pub triggers_finalized: usize,
  pub fires_aborted: usize,
  pub candidates_skipped_locked: usize,
  pub fires_recovered: usize,
  pub jobs_launched: usize,
  pub jobs_completed: usize,
  pub jobs_panicked: usize,
  pub completion_failures: usize,
  pub workers_active_current: usize,
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean launched-job duration in microseconds, `None` before any job finished.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Field-wise sum, used when merging the two facades' snapshots.
  pub fn combined(&self, other: &MetricsSnapshot) -> MetricsSnapshot {
    MetricsSnapshot {
      triggers_acquired: self.triggers_acquired + other.triggers_acquired,
      triggers_fired: self.triggers_fired + other.triggers_fired,
      triggers_misfired: self.triggers_misfired + other.triggers_misfired,
      triggers_finalized: self.triggers_finalized + other.triggers_finalized,
      fires_aborted: self.fires_aborted + other.fires_aborted,
      candidates_skipped_locked: self.candidates_skipped_locked + other.candidates_skipped_locked,
      fires_recovered: self.fires_recovered + other.fires_recovered,
      jobs_launched: self.jobs_launched + other.jobs_launched,
      jobs_completed: self.jobs_completed + other.jobs_completed,
      jobs_panicked: self.jobs_panicked + other.jobs_panicked,
      completion_failures: self.completion_failures + other.completion_failures,
      workers_active_current: self.workers_active_current + other.workers_active_current,
      job_execution_duration_count: self.job_execution_duration_count
        + other.job_execution_duration_count,
      job_execution_duration_sum_micros: self.job_execution_duration_sum_micros
        + other.job_execution_duration_sum_micros,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshots_combine_field_wise() {
    let metrics = SchedulerMetrics::new();
    SchedulerMetrics::add(&metrics.triggers_fired, 3);
    metrics.job_execution_duration.record(Duration::from_millis(2));
    metrics.job_execution_duration.record(Duration::from_millis(4));

    let local = metrics.snapshot();
    assert_eq!(local.mean_execution_duration(), Some(Duration::from_millis(3)));

    let clustered = MetricsSnapshot {
      triggers_fired: 2,
      jobs_panicked: 1,
      ..Default::default()
    };
    let total = local.combined(&clustered);
    assert_eq!(total.triggers_fired, 5);
    assert_eq!(total.jobs_panicked, 1);
    assert_eq!(total.job_execution_duration_count, 2);
    assert_eq!(MetricsSnapshot::default().mean_execution_duration_micros(), None);
  }
}
