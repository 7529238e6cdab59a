//! Predicates used to enumerate the trigger and job maps.

use chrono::{DateTime, Utc};

use crate::kv::EntryFilter;
use crate::record::{JobKey, JobRecord, TriggerKey, TriggerRecord, TriggerState};

/// Matches a key group by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GroupMatcher {
  Equals(String),
  StartsWith(String),
  EndsWith(String),
  Contains(String),
  Any,
}

impl GroupMatcher {
  pub fn equals(group: &str) -> Self {
    GroupMatcher::Equals(group.to_string())
  }

  pub fn starts_with(prefix: &str) -> Self {
    GroupMatcher::StartsWith(prefix.to_string())
  }

  pub fn ends_with(suffix: &str) -> Self {
    GroupMatcher::EndsWith(suffix.to_string())
  }

  pub fn contains(fragment: &str) -> Self {
    GroupMatcher::Contains(fragment.to_string())
  }

  pub fn matches(&self, group: &str) -> bool {
    match self {
      GroupMatcher::Equals(g) => group == g,
      GroupMatcher::StartsWith(p) => group.starts_with(p.as_str()),
      GroupMatcher::EndsWith(s) => group.ends_with(s.as_str()),
      GroupMatcher::Contains(f) => group.contains(f.as_str()),
      GroupMatcher::Any => true,
    }
  }
}

/// Conjunction of optional criteria over trigger entries. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerFilter {
  state: Option<TriggerState>,
  due_no_later_than: Option<DateTime<Utc>>,
  job_key: Option<JobKey>,
  trigger_group: Option<GroupMatcher>,
  job_group: Option<GroupMatcher>,
  calendar_name: Option<String>,
  in_flight_on: Option<String>,
}

impl TriggerFilter {
  pub fn all() -> Self {
    Self::default()
  }

  /// Acquisition candidates: `Normal` with a next fire time at or before `bound`.
  pub fn due(bound: DateTime<Utc>) -> Self {
    Self {
      state: Some(TriggerState::Normal),
      due_no_later_than: Some(bound),
      ..Self::default()
    }
  }

  pub fn for_job(job_key: &JobKey) -> Self {
    Self {
      job_key: Some(job_key.clone()),
      ..Self::default()
    }
  }

  pub fn in_trigger_group(mut self, matcher: GroupMatcher) -> Self {
    self.trigger_group = Some(matcher);
    self
  }

  pub fn in_job_group(mut self, matcher: GroupMatcher) -> Self {
    self.job_group = Some(matcher);
    self
  }

  pub fn with_state(mut self, state: TriggerState) -> Self {
    self.state = Some(state);
    self
  }

  pub fn using_calendar(mut self, calendar_name: &str) -> Self {
    self.calendar_name = Some(calendar_name.to_string());
    self
  }

  /// Triggers carrying an in-flight marker written by `node_id`.
  pub fn in_flight_on(mut self, node_id: &str) -> Self {
    self.in_flight_on = Some(node_id.to_string());
    self
  }
}

impl EntryFilter<TriggerKey, TriggerRecord> for TriggerFilter {
  fn matches(&self, key: &TriggerKey, record: &TriggerRecord) -> bool {
    if self.state.is_some_and(|state| record.state != state) {
      return false;
    }
    if let Some(bound) = self.due_no_later_than {
      if !record.is_due(bound) {
        return false;
      }
    }
    if self.job_key.as_ref().is_some_and(|jk| *jk != record.job_key) {
      return false;
    }
    if self
      .trigger_group
      .as_ref()
      .is_some_and(|m| !m.matches(key.group()))
    {
      return false;
    }
    if self
      .job_group
      .as_ref()
      .is_some_and(|m| !m.matches(record.job_key.group()))
    {
      return false;
    }
    if let Some(name) = &self.calendar_name {
      if record.calendar_name.as_deref() != Some(name.as_str()) {
        return false;
      }
    }
    if let Some(node) = &self.in_flight_on {
      if !record.in_flight.iter().any(|f| f.node_id == *node) {
        return false;
      }
    }
    true
  }
}

/// Filter over job entries by group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
  group: GroupMatcher,
}

impl JobFilter {
  pub fn in_group(matcher: GroupMatcher) -> Self {
    Self { group: matcher }
  }
}

impl EntryFilter<JobKey, JobRecord> for JobFilter {
  fn matches(&self, key: &JobKey, _record: &JobRecord) -> bool {
    self.group.matches(key.group())
  }
}
