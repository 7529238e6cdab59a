use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::trace;

use crate::record::TriggerKey;

/// Sink for events the trigger store raises while it mutates records.
///
/// Calls are made after the corresponding change is persisted, never while
/// a backend entry is being updated.
pub trait SchedulerSignaler: Send + Sync {
  /// A trigger's next fire time was found more than the misfire threshold in
  /// the past and has been moved forward.
  fn notify_trigger_misfired(&self, trigger_key: &TriggerKey);

  /// A trigger has no further occurrences.
  fn notify_trigger_finalized(&self, trigger_key: &TriggerKey);

  /// Something changed that may move the earliest due time.
  /// `candidate` is the new fire time when one is known.
  fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
}

/// Discards every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
  fn notify_trigger_misfired(&self, _trigger_key: &TriggerKey) {}

  fn notify_trigger_finalized(&self, _trigger_key: &TriggerKey) {}

  fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
}

/// Signaler installed by a facade: wakes its firing loop on scheduling
/// changes and forwards everything to an optional external listener.
pub(crate) struct LoopSignaler {
  wakeup: Arc<Notify>,
  listener: Option<Arc<dyn SchedulerSignaler>>,
}

impl LoopSignaler {
  pub(crate) fn new(wakeup: Arc<Notify>, listener: Option<Arc<dyn SchedulerSignaler>>) -> Self {
    Self { wakeup, listener }
  }
}

impl fmt::Debug for LoopSignaler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoopSignaler")
      .field("has_listener", &self.listener.is_some())
      .finish()
  }
}

impl SchedulerSignaler for LoopSignaler {
  fn notify_trigger_misfired(&self, trigger_key: &TriggerKey) {
    if let Some(listener) = &self.listener {
      listener.notify_trigger_misfired(trigger_key);
    }
  }

  fn notify_trigger_finalized(&self, trigger_key: &TriggerKey) {
    if let Some(listener) = &self.listener {
      listener.notify_trigger_finalized(trigger_key);
    }
  }

  fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
    trace!(?candidate, "Scheduling change signalled; waking firing loop.");
    self.wakeup.notify_one();
    if let Some(listener) = &self.listener {
      listener.signal_scheduling_change(candidate);
    }
  }
}
