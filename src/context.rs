use chrono::{DateTime, Utc};

use crate::record::{FireInstanceId, RunMode, TriggerKey};

/// Information about the occurrence a launched job is running for.
///
/// Available inside the future returned by a [`JobLauncher`](crate::firing::JobLauncher)
/// through [`try_get_current_firing_context()`] or the [`firing_context!`](crate::firing_context) macro.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiringContext {
  pub fire_instance_id: FireInstanceId,
  pub trigger_key: TriggerKey,
  pub run_mode: RunMode,
  pub scheduled_fire_time: DateTime<Utc>,
  pub recovering: bool,
}

tokio::task_local! {
    /// Set by the firing loop around each launched job.
    pub static CURRENT_FIRING_CONTEXT: FiringContext;
}

/// Returns the current `FiringContext`, or `None` outside a launched job.
pub fn try_get_current_firing_context() -> Option<FiringContext> {
  CURRENT_FIRING_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `FiringContext`.
///
/// # Panics
/// Panics when used outside a job launched by a firing loop.
#[macro_export]
macro_rules! firing_context {
  () => {
    $crate::context::CURRENT_FIRING_CONTEXT.with(|ctx| ctx.clone())
  };
}
