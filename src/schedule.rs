//! Schedule definitions and next-fire-time computation.
//!
//! A [`Schedule`] is pure data. The only behaviour it carries is
//! "when is the next occurrence strictly after instant T", which the trigger
//! store uses for first-fire computation, post-fire advancement and misfire
//! correction.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tracing::warn;

use crate::error::ScheduleError;

/// Sentinel repeat count meaning "repeat forever at the configured period".
pub const REPEAT_FOREVER: i32 = -1;

/// Timezone used by [`Schedule::cron`] when none is given.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Represents the different ways a trigger can be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Schedule {
  /// Fire according to a cron expression evaluated in `timezone` (an IANA id).
  ///
  /// Both the classic five-field form (`min hour dom mon dow`, Sunday is `0`
  /// or `7`) and the seconds-first six/seven-field form of the `cron` crate
  /// (Sunday is `1`) are accepted.
  Cron { expression: String, timezone: String },
  /// Fire at `start_time + k * period_millis`.
  ///
  /// `repeat_count == 0` fires exactly once, [`REPEAT_FOREVER`] never stops,
  /// any other positive value allows that many repeats after the first fire.
  /// An unspecified `start_time` means "now" and is pinned when the trigger
  /// is stored.
  Interval {
    period_millis: i64,
    start_time: Option<DateTime<Utc>>,
    repeat_count: i32,
    end_time: Option<DateTime<Utc>>,
  },
  /// A schedule kind written by a foreign writer that this engine cannot
  /// evaluate. Never fires; rejected when stored.
  Unrecognized { kind: String },
}

impl Schedule {
  /// Cron schedule interpreted in UTC.
  pub fn cron(expression: &str) -> Self {
    Self::cron_in(expression, DEFAULT_TIMEZONE)
  }

  /// Cron schedule interpreted in the given IANA timezone.
  pub fn cron_in(expression: &str, timezone: &str) -> Self {
    Schedule::Cron {
      expression: expression.to_string(),
      timezone: timezone.to_string(),
    }
  }

  /// Interval schedule repeating forever, starting when stored.
  pub fn every(period: StdDuration) -> Self {
    Schedule::Interval {
      period_millis: i64::try_from(period.as_millis()).unwrap_or(i64::MAX),
      start_time: None,
      repeat_count: REPEAT_FOREVER,
      end_time: None,
    }
  }

  /// One-shot schedule firing at `run_at`.
  pub fn once(run_at: DateTime<Utc>) -> Self {
    Schedule::Interval {
      period_millis: 1,
      start_time: Some(run_at),
      repeat_count: 0,
      end_time: None,
    }
  }

  /// Sets the start time of an interval schedule. No effect on other kinds.
  pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
    if let Schedule::Interval { start_time, .. } = &mut self {
      *start_time = Some(start);
    }
    self
  }

  /// Sets the repeat count of an interval schedule. No effect on other kinds.
  pub fn repeating(mut self, count: i32) -> Self {
    if let Schedule::Interval { repeat_count, .. } = &mut self {
      *repeat_count = count;
    }
    self
  }

  /// Sets the end time of an interval schedule. No effect on other kinds.
  pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
    if let Schedule::Interval { end_time, .. } = &mut self {
      *end_time = Some(end);
    }
    self
  }

  /// Short name of the schedule variant, as stored alongside foreign records.
  pub fn kind(&self) -> &str {
    match self {
      Schedule::Cron { .. } => "cron",
      Schedule::Interval { .. } => "interval",
      Schedule::Unrecognized { kind } => kind.as_str(),
    }
  }

  /// Checks the schedule is well formed.
  pub fn validate(&self) -> Result<(), ScheduleError> {
    match self {
      Schedule::Cron {
        expression,
        timezone,
      } => {
        parse_cron(expression)?;
        parse_timezone(timezone)?;
        Ok(())
      }
      Schedule::Interval {
        period_millis,
        start_time,
        repeat_count,
        end_time,
      } => {
        if *period_millis <= 0 {
          return Err(ScheduleError::NonPositiveInterval(*period_millis));
        }
        if *repeat_count < REPEAT_FOREVER {
          return Err(ScheduleError::InvalidRepeatCount(*repeat_count));
        }
        if let (Some(start), Some(end)) = (start_time, end_time) {
          if end < start {
            return Err(ScheduleError::EndBeforeStart);
          }
        }
        Ok(())
      }
      Schedule::Unrecognized { kind } => Err(ScheduleError::Unsupported(kind.clone())),
    }
  }

  /// Pins an unspecified interval start time to `now`.
  pub fn resolved(self, now: DateTime<Utc>) -> Self {
    match self {
      Schedule::Interval {
        period_millis,
        start_time: None,
        repeat_count,
        end_time,
      } => Schedule::Interval {
        period_millis,
        start_time: Some(now),
        repeat_count,
        end_time,
      },
      other => other,
    }
  }

  /// The first occurrence of a freshly stored schedule.
  ///
  /// For intervals this is the start time itself (or `now`); cron schedules
  /// yield their first match strictly after `now`.
  pub fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Interval {
        start_time,
        end_time,
        ..
      } => {
        let start = start_time.unwrap_or(now);
        match end_time {
          Some(end) if start > *end => None,
          _ => Some(start),
        }
      }
      _ => self.next_fire_time(now),
    }
  }

  /// Calculates the next occurrence strictly after `after`.
  /// Returns `None` if the schedule has no further occurrence.
  pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Cron {
        expression,
        timezone,
      } => {
        let cron_schedule = match parse_cron(expression) {
          Ok(schedule) => schedule,
          Err(e) => {
            warn!("Failed to parse cron expression '{}': {}", expression, e);
            return None;
          }
        };
        let tz = match parse_timezone(timezone) {
          Ok(tz) => tz,
          Err(e) => {
            warn!(%timezone, error = %e, "Failed to resolve cron timezone.");
            return None;
          }
        };
        cron_schedule
          .after(&after.with_timezone(&tz))
          .next()
          .map(|next| next.with_timezone(&Utc))
      }
      Schedule::Interval {
        period_millis,
        start_time,
        repeat_count,
        end_time,
      } => {
        if *period_millis <= 0 {
          return None;
        }
        let start = start_time.unwrap_or(after);
        let candidate = if after < start {
          start
        } else {
          if *repeat_count == 0 {
            return None;
          }
          let elapsed = (after - start).num_milliseconds();
          let k = elapsed / period_millis + 1;
          if *repeat_count != REPEAT_FOREVER && k > i64::from(*repeat_count) {
            return None;
          }
          let offset = ChronoDuration::try_milliseconds(k.checked_mul(*period_millis)?)?;
          start.checked_add_signed(offset)?
        };
        match end_time {
          Some(end) if candidate > *end => None,
          _ => Some(candidate),
        }
      }
      Schedule::Unrecognized { .. } => None,
    }
  }

  /// Validates the schedule and computes where it would first fire, without
  /// persisting anything.
  pub fn preview(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    self.validate()?;
    Ok(self.clone().resolved(now).first_fire_time(now))
  }
}

/// Parses a cron expression. The five-field form gets its seconds pinned to
/// zero and its day-of-week field renumbered for the `cron` crate.
fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
  let syntax_error = |reason: String| ScheduleError::CronSyntax {
    expression: expression.to_string(),
    reason,
  };
  let fields: Vec<&str> = expression.split_whitespace().collect();
  let normalized = match fields.as_slice() {
    [minute, hour, day_of_month, month, day_of_week] => format!(
      "0 {minute} {hour} {day_of_month} {month} {}",
      classic_day_of_week(day_of_week).map_err(syntax_error)?
    ),
    _ => fields.join(" "),
  };
  CronSchedule::from_str(&normalized).map_err(|e| syntax_error(e.to_string()))
}

/// Rewrites a numeric classic day-of-week field (`0..=7`, Sunday is `0` or
/// `7`) as an explicit list in the `cron` crate's numbering (Sunday is `1`).
/// Wildcards and day names mean the same in both and pass through.
fn classic_day_of_week(field: &str) -> Result<String, String> {
  if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
    return Ok(field.to_string());
  }
  let invalid = || format!("invalid day-of-week field '{field}'");
  let number = |text: &str| text.parse::<u32>().ok().filter(|n| *n <= 7).ok_or_else(invalid);

  let mut days = BTreeSet::new();
  for part in field.split(',') {
    let (range, step) = match part.split_once('/') {
      Some((range, step)) => {
        let step = step.parse::<usize>().ok().filter(|n| *n > 0);
        (range, Some(step.ok_or_else(invalid)?))
      }
      None => (part, None),
    };
    let (first, last) = if range == "*" {
      (0, 6)
    } else {
      match range.split_once('-') {
        Some((first, last)) => (number(first)?, number(last)?),
        None if step.is_some() => (number(range)?, 6),
        None => (number(range)?, number(range)?),
      }
    };
    if first > last {
      return Err(invalid());
    }
    days.extend((first..=last).step_by(step.unwrap_or(1)).map(|day| day % 7 + 1));
  }
  Ok(days.iter().map(u32::to_string).collect::<Vec<_>>().join(","))
}

fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
  timezone
    .parse::<Tz>()
    .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))
}
