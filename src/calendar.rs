//! Exclusion calendars.
//!
//! A trigger may reference a named [`Calendar`]; any computed fire time that
//! falls inside an excluded window or on an excluded weekday is skipped and the
//! schedule is advanced again.

use chrono::{DateTime, Datelike, Utc, Weekday};

use crate::schedule::Schedule;

/// Upper bound on how many consecutive occurrences may be skipped by a
/// calendar before the schedule is considered exhausted.
const MAX_EXCLUDED_ADVANCES: usize = 10_000;

/// A half-open `[start, end)` window during which triggers must not fire.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExcludedWindow {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

/// A named exclusion calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Calendar {
  pub description: Option<String>,
  /// Explicit excluded windows (maintenance windows, holidays).
  pub excluded_windows: Vec<ExcludedWindow>,
  /// Whole UTC days excluded by weekday.
  pub excluded_weekdays: Vec<Weekday>,
}

impl Calendar {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_description(mut self, description: &str) -> Self {
    self.description = Some(description.to_string());
    self
  }

  pub fn exclude_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
    self.excluded_windows.push(ExcludedWindow { start, end });
    self
  }

  pub fn exclude_weekday(mut self, weekday: Weekday) -> Self {
    if !self.excluded_weekdays.contains(&weekday) {
      self.excluded_weekdays.push(weekday);
    }
    self
  }

  /// Whether a trigger may fire at `time`.
  pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
    if self.excluded_weekdays.contains(&time.weekday()) {
      return false;
    }
    !self
      .excluded_windows
      .iter()
      .any(|window| time >= window.start && time < window.end)
  }

  /// Advances `candidate` along `schedule` until it lands on an included
  /// instant. Returns `None` if the schedule runs out first.
  pub(crate) fn first_included(
    &self,
    schedule: &Schedule,
    mut candidate: Option<DateTime<Utc>>,
  ) -> Option<DateTime<Utc>> {
    for _ in 0..MAX_EXCLUDED_ADVANCES {
      let time = candidate?;
      if self.is_time_included(time) {
        return Some(time);
      }
      candidate = schedule.next_fire_time(time);
    }
    tracing::warn!(
      schedule = schedule.kind(),
      "Calendar excluded too many consecutive occurrences; treating schedule as exhausted."
    );
    None
  }
}
