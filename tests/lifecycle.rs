//! tests/lifecycle.rs
//! Trigger state machine: firing, completion instructions, calendars,
//! non-concurrent jobs and in-flight recovery.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc, Weekday};
use clusterkeeper::{
  Calendar, CompletionInstruction, GroupMatcher, JobKey, JobRecord, JobRequest, KvBackend,
  ManualClock, RunMode, Schedule, SchedulerService, StoreError, TriggerKey, TriggerRecord,
  TriggerState,
};
use common::{
  base_time, fire_due, noop_launcher, run_cycle, schedule, setup_tracing, store_for,
  RecordingSignaler,
};

#[test]
fn repeat_count_two_completes_after_three_fires() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let signals = Arc::new(RecordingSignaler::default());
  let store = store_for("node-a", &kv, &clock).with_signaler(signals.clone());
  let key = schedule(
    &store,
    "limited",
    "limited",
    Schedule::every(StdDuration::from_secs(60))
      .starting_at(base_time())
      .repeating(2),
  );

  for fire in 0..3 {
    assert_eq!(
      store.trigger_state(&key).unwrap(),
      TriggerState::Normal,
      "before fire {fire}"
    );
    assert_eq!(run_cycle(&store, CompletionInstruction::Noop).len(), 1);
    clock.advance(ChronoDuration::seconds(60));
  }

  let record = store.retrieve_trigger(&key).unwrap().unwrap();
  assert_eq!(record.state, TriggerState::Complete);
  assert_eq!(record.next_fire_time, None);
  assert_eq!(record.times_triggered, 3);
  assert_eq!(signals.finalized(), vec![key]);
  assert!(fire_due(&store).is_empty());
}

#[test]
fn nightly_cleanup_scenario() {
  setup_tracing();
  let clock = ManualClock::new(base_time());
  let service = SchedulerService::builder()
    .max_workers(1)
    .node_id("node-a")
    .clock(Arc::new(clock.clone()))
    .job_launcher(noop_launcher())
    .build()
    .unwrap();

  let request = JobRequest::new(
    "nightly-cleanup",
    "cleanup",
    Schedule::every(StdDuration::from_millis(86_400_000)).starting_at(base_time()),
  );
  service.do_schedule_job(&request).unwrap();

  let details = service.job_details("nightly-cleanup").unwrap().unwrap();
  assert_eq!(details.next_fire_time, Some(base_time()));
  assert_eq!(details.run_mode, RunMode::RunOncePerCluster);
  assert_eq!(details.job_runner_key, "cleanup");

  let store = service.facade(RunMode::RunOncePerCluster).store();
  assert_eq!(run_cycle(store, CompletionInstruction::Noop).len(), 1);

  let details = service.job_details("nightly-cleanup").unwrap().unwrap();
  assert_eq!(
    details.next_fire_time,
    Some(base_time() + ChronoDuration::milliseconds(86_400_000))
  );
  assert_eq!(details.previous_fire_time, Some(base_time()));
  assert_eq!(details.times_triggered, 1);
}

#[test]
fn fire_record_carries_merged_parameters() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let job_key = JobKey::parse("exports/csv");
  store
    .store_job(
      &job_key,
      JobRecord::new("csv-export")
        .with_data("format", "csv")
        .with_data("bucket", "archive"),
      false,
    )
    .unwrap();
  let trigger_key = TriggerKey::parse("exports/daily");
  store
    .store_trigger(
      &trigger_key,
      TriggerRecord::new(job_key.clone(), Schedule::once(base_time())).with_data("bucket", "daily"),
      false,
    )
    .unwrap();

  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1);
  let fire = &fired[0];
  assert_eq!(fire.job_id, "exports/daily");
  assert_eq!(fire.job_key, job_key);
  assert_eq!(fire.job_type, "csv-export");
  assert_eq!(fire.job_parameters.get("format").map(String::as_str), Some("csv"));
  assert_eq!(fire.job_parameters.get("bucket").map(String::as_str), Some("daily"));
  assert!(!fire.recovering);

  let markers = store
    .retrieve_trigger(&trigger_key)
    .unwrap()
    .unwrap()
    .in_flight;
  assert_eq!(markers.len(), 1, "marker written on fire");
  let in_flight = &markers[0];
  assert_eq!(in_flight.fire_instance_id, fire.fire_instance_id);
  assert_eq!(in_flight.node_id, "node-a");
}

// --- Completion Instructions ---

#[test]
fn delete_trigger_removes_exhausted_trigger_and_orphaned_job() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(&store, "one-off", "one-off-runner", Schedule::once(base_time()));

  run_cycle(&store, CompletionInstruction::DeleteTrigger);

  assert!(store.retrieve_trigger(&key).unwrap().is_none());
  assert!(store
    .retrieve_job(&JobKey::parse("one-off-runner"))
    .unwrap()
    .is_none());
}

#[test]
fn delete_trigger_keeps_trigger_with_future_fires() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(
    &store,
    "recurring",
    "recurring",
    Schedule::every(StdDuration::from_secs(60)).starting_at(base_time()),
  );

  run_cycle(&store, CompletionInstruction::DeleteTrigger);

  let record = store.retrieve_trigger(&key).unwrap().unwrap();
  assert_eq!(record.state, TriggerState::Normal);
  assert!(record.in_flight.is_empty());
}

#[test]
fn set_trigger_complete_and_error() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let every_minute = Schedule::every(StdDuration::from_secs(60)).starting_at(base_time());
  let done = schedule(&store, "done", "runner", every_minute.clone());

  run_cycle(&store, CompletionInstruction::SetTriggerComplete);
  let record = store.retrieve_trigger(&done).unwrap().unwrap();
  assert_eq!(record.state, TriggerState::Complete);
  assert_eq!(record.next_fire_time, None);

  clock.advance(ChronoDuration::seconds(60));
  let failed = schedule(&store, "failed", "runner", every_minute.starting_at(store.now()));
  run_cycle(&store, CompletionInstruction::SetTriggerError);
  assert_eq!(store.trigger_state(&failed).unwrap(), TriggerState::Error);

  clock.advance(ChronoDuration::minutes(5));
  assert!(fire_due(&store).is_empty(), "complete and error triggers never fire");
}

#[test]
fn set_all_job_triggers_error_parks_siblings() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let fired = schedule(&store, "a", "shared", Schedule::once(base_time()));
  let sibling = schedule(
    &store,
    "b",
    "shared",
    Schedule::once(base_time() + ChronoDuration::hours(1)),
  );
  let unrelated = schedule(
    &store,
    "c",
    "other",
    Schedule::once(base_time() + ChronoDuration::hours(1)),
  );

  run_cycle(&store, CompletionInstruction::SetAllJobTriggersError);

  assert_eq!(store.trigger_state(&fired).unwrap(), TriggerState::Error);
  assert_eq!(store.trigger_state(&sibling).unwrap(), TriggerState::Error);
  assert_eq!(store.trigger_state(&unrelated).unwrap(), TriggerState::Normal);
}

// --- Store Validation ---

#[test]
fn store_trigger_rejects_invalid_input() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let job_key = JobKey::parse("runner");

  let missing_job = store.store_trigger(
    &TriggerKey::parse("t"),
    TriggerRecord::new(job_key.clone(), Schedule::once(base_time())),
    false,
  );
  assert_eq!(missing_job, Err(StoreError::JobNotFound(job_key.clone())));

  store.store_job(&job_key, JobRecord::new("runner"), false).unwrap();
  let foreign = store.store_trigger(
    &TriggerKey::parse("foreign"),
    TriggerRecord::new(
      job_key.clone(),
      Schedule::Unrecognized {
        kind: "daily-time-interval".to_string(),
      },
    ),
    false,
  );
  assert!(matches!(foreign, Err(StoreError::UnsupportedTrigger { .. })));

  let bad_cron = store.store_trigger(
    &TriggerKey::parse("bad"),
    TriggerRecord::new(job_key.clone(), Schedule::cron("every tuesday")),
    false,
  );
  assert!(matches!(bad_cron, Err(StoreError::InvalidSchedule(_))));
  assert!(store.trigger_keys(&GroupMatcher::Any).unwrap().is_empty());

  let key = TriggerKey::parse("t");
  store
    .store_trigger(&key, TriggerRecord::new(job_key.clone(), Schedule::once(base_time())), false)
    .unwrap();
  let duplicate =
    store.store_trigger(&key, TriggerRecord::new(job_key, Schedule::once(base_time())), false);
  assert_eq!(duplicate, Err(StoreError::TriggerExists(key)));
}

#[test]
fn removing_last_trigger_keeps_durable_jobs_only() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let durable = JobKey::parse("durable");
  store
    .store_job(&durable, JobRecord::new("durable").durable(true), false)
    .unwrap();
  let key = TriggerKey::parse("t");
  store
    .store_trigger(&key, TriggerRecord::new(durable.clone(), Schedule::once(base_time())), false)
    .unwrap();

  assert!(store.remove_trigger(&key).unwrap());
  assert!(!store.remove_trigger(&key).unwrap());
  assert!(store.retrieve_job(&durable).unwrap().is_some());

  assert!(store.remove_job(&durable).unwrap());
  assert!(store.job_keys(&GroupMatcher::Any).unwrap().is_empty());
}

// --- Group Pause ---

#[test]
fn pause_and_resume_by_group_matchers() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let later = Schedule::once(base_time() + ChronoDuration::hours(1));
  let invoice = schedule(&store, "billing/invoice", "finance/run", later.clone());
  let refund = schedule(&store, "billing-eu/refund", "finance/run", later.clone());
  let report = schedule(&store, "reports/weekly", "analytics/run", later);

  let groups = store.pause_triggers(&GroupMatcher::starts_with("billing")).unwrap();
  assert_eq!(groups, vec!["billing", "billing-eu"]);
  assert_eq!(store.trigger_state(&invoice).unwrap(), TriggerState::Paused);
  assert_eq!(store.trigger_state(&refund).unwrap(), TriggerState::Paused);
  assert_eq!(store.trigger_state(&report).unwrap(), TriggerState::Normal);

  let groups = store.resume_jobs(&GroupMatcher::equals("finance")).unwrap();
  assert_eq!(groups, vec!["finance"]);
  assert_eq!(store.trigger_state(&invoice).unwrap(), TriggerState::Normal);

  store.pause_jobs(&GroupMatcher::ends_with("lytics")).unwrap();
  assert_eq!(store.trigger_state(&report).unwrap(), TriggerState::Paused);

  assert_eq!(
    store.pause_all().unwrap(),
    vec!["billing", "billing-eu", "reports"]
  );
  store.resume_all().unwrap();
  for key in [&invoice, &refund, &report] {
    assert_eq!(store.trigger_state(key).unwrap(), TriggerState::Normal);
  }
  assert_eq!(
    store.trigger_group_names().unwrap(),
    vec!["billing", "billing-eu", "reports"]
  );
  assert_eq!(store.job_group_names().unwrap(), vec!["analytics", "finance"]);
}

// --- Calendars ---

#[test]
fn calendar_skips_excluded_days() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  store
    .store_calendar(
      "weekdays",
      Calendar::new()
        .exclude_weekday(Weekday::Sat)
        .exclude_weekday(Weekday::Sun),
      false,
      false,
    )
    .unwrap();
  let job_key = JobKey::parse("payroll");
  store.store_job(&job_key, JobRecord::new("payroll"), false).unwrap();
  let key = TriggerKey::parse("daily-payroll");
  store
    .store_trigger(
      &key,
      TriggerRecord::new(
        job_key,
        Schedule::every(StdDuration::from_secs(86_400)).starting_at(base_time()),
      )
      .with_calendar("weekdays"),
      false,
    )
    .unwrap();

  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1);
  // Friday fires; Saturday and Sunday are skipped.
  assert_eq!(
    fired[0].next_fire_time,
    Some(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap())
  );

  assert_eq!(
    store.remove_calendar("weekdays"),
    Err(StoreError::CalendarInUse("weekdays".to_string()))
  );
  assert_eq!(
    store.store_calendar("weekdays", Calendar::new(), false, false),
    Err(StoreError::CalendarExists("weekdays".to_string()))
  );
  assert_eq!(store.calendar_names().unwrap(), vec!["weekdays"]);
}

#[test]
fn replacing_calendar_can_move_referencing_triggers() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  store
    .store_calendar("maintenance", Calendar::new(), false, false)
    .unwrap();
  let job_key = JobKey::parse("sync");
  store.store_job(&job_key, JobRecord::new("sync"), false).unwrap();
  let key = TriggerKey::parse("hourly-sync");
  let first = base_time() + ChronoDuration::hours(1);
  store
    .store_trigger(
      &key,
      TriggerRecord::new(
        job_key.clone(),
        Schedule::every(StdDuration::from_secs(3600)).starting_at(first),
      )
      .with_calendar("maintenance"),
      false,
    )
    .unwrap();

  let missing = store.store_trigger(
    &TriggerKey::parse("other"),
    TriggerRecord::new(job_key, Schedule::once(first)).with_calendar("nope"),
    false,
  );
  assert_eq!(missing, Err(StoreError::CalendarNotFound("nope".to_string())));

  let window = Calendar::new().exclude_window(first, first + ChronoDuration::minutes(90));
  store.store_calendar("maintenance", window, true, true).unwrap();
  assert_eq!(
    store.retrieve_trigger(&key).unwrap().unwrap().next_fire_time,
    Some(first + ChronoDuration::hours(2))
  );
}

// --- Non-concurrent Jobs ---

#[test]
fn disallowed_concurrency_blocks_sibling_triggers() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let job_key = JobKey::parse("reindex");
  store
    .store_job(
      &job_key,
      JobRecord::new("reindex").disallow_concurrent_execution(true),
      false,
    )
    .unwrap();
  let every_minute = Schedule::every(StdDuration::from_secs(60)).starting_at(base_time());
  let first = TriggerKey::parse("reindex-a");
  let second = TriggerKey::parse("reindex-b");
  for key in [&first, &second] {
    store
      .store_trigger(key, TriggerRecord::new(job_key.clone(), every_minute.clone()), false)
      .unwrap();
  }

  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1, "sibling must not fire while the job runs");
  assert_eq!(fired[0].trigger_key, first);
  assert_eq!(store.trigger_state(&first).unwrap(), TriggerState::Blocked);
  assert_eq!(store.trigger_state(&second).unwrap(), TriggerState::Blocked);

  // A trigger added while the job runs starts blocked too.
  let third = TriggerKey::parse("reindex-c");
  store
    .store_trigger(&third, TriggerRecord::new(job_key, every_minute), false)
    .unwrap();
  assert_eq!(store.trigger_state(&third).unwrap(), TriggerState::Blocked);

  store
    .triggered_job_complete(&first, fired[0].fire_instance_id, CompletionInstruction::Noop)
    .unwrap();
  for key in [&first, &second, &third] {
    assert_eq!(store.trigger_state(key).unwrap(), TriggerState::Normal);
  }

  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1);
  assert_eq!(fired[0].trigger_key, second);
}

// --- Recovery ---

#[test]
fn restarted_node_recovers_its_in_flight_occurrences() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let crashed = store_for("node-a", &kv, &clock);
  let every_hour = Schedule::every(StdDuration::from_secs(3600)).starting_at(base_time());

  let recoverable_job = JobKey::parse("ledger");
  crashed
    .store_job(&recoverable_job, JobRecord::new("ledger").request_recovery(true), false)
    .unwrap();
  let recoverable = TriggerKey::parse("ledger-close");
  crashed
    .store_trigger(
      &recoverable,
      TriggerRecord::new(recoverable_job, every_hour.clone()),
      false,
    )
    .unwrap();
  let plain = schedule(&crashed, "cache-warm", "cache", every_hour);

  assert_eq!(fire_due(&crashed).len(), 2);
  // No completion is ever reported: the node went away.

  let other_node = store_for("node-b", &kv, &clock);
  assert!(other_node.recover_in_flight().unwrap().is_empty());

  clock.advance(ChronoDuration::minutes(5));
  let restarted = store_for("node-a", &kv, &clock);
  let recovered = restarted.recover_in_flight().unwrap();
  assert_eq!(recovered.len(), 1);
  assert_eq!(recovered[0].trigger_key, recoverable);
  assert!(recovered[0].recovering);
  assert_eq!(recovered[0].scheduled_fire_time, base_time());
  assert_eq!(restarted.metrics().snapshot().fires_recovered, 1);

  assert!(restarted
    .retrieve_trigger(&plain)
    .unwrap()
    .unwrap()
    .in_flight
    .is_empty());
  let markers = restarted
    .retrieve_trigger(&recoverable)
    .unwrap()
    .unwrap()
    .in_flight;
  assert_eq!(markers.len(), 1, "recovered occurrence stays in flight");
  assert_eq!(markers[0].fire_instance_id, recovered[0].fire_instance_id);

  restarted
    .triggered_job_complete(&recoverable, recovered[0].fire_instance_id, CompletionInstruction::Noop)
    .unwrap();
  assert!(restarted.recover_in_flight().unwrap().is_empty());
}

#[test]
fn overlapping_occurrences_keep_separate_in_flight_markers() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let job_key = JobKey::parse("ledger");
  store
    .store_job(&job_key, JobRecord::new("ledger").request_recovery(true), false)
    .unwrap();
  let key = TriggerKey::parse("ledger-sync");
  store
    .store_trigger(
      &key,
      TriggerRecord::new(
        job_key,
        Schedule::every(StdDuration::from_secs(30)).starting_at(base_time()),
      ),
      false,
    )
    .unwrap();

  let first = fire_due(&store);
  assert_eq!(first.len(), 1);
  clock.advance(ChronoDuration::seconds(30));
  let second = fire_due(&store);
  assert_eq!(second.len(), 1);
  assert_eq!(store.retrieve_trigger(&key).unwrap().unwrap().in_flight.len(), 2);

  // The older occurrence finishes while the newer one is still running.
  store
    .triggered_job_complete(&key, first[0].fire_instance_id, CompletionInstruction::Noop)
    .unwrap();
  let markers = store.retrieve_trigger(&key).unwrap().unwrap().in_flight;
  assert_eq!(markers.len(), 1);
  assert_eq!(markers[0].fire_instance_id, second[0].fire_instance_id);

  let restarted = store_for("node-a", &kv, &clock);
  let recovered = restarted.recover_in_flight().unwrap();
  assert_eq!(recovered.len(), 1);
  assert_eq!(
    recovered[0].scheduled_fire_time,
    base_time() + ChronoDuration::seconds(30)
  );
}

#[test]
fn stale_completion_leaves_replacement_trigger_alone() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(
    &store,
    "report",
    "reports",
    Schedule::every(StdDuration::from_secs(60)).starting_at(base_time()),
  );
  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1);

  // Rescheduled while the old occurrence is still running.
  let replacement = Schedule::every(StdDuration::from_secs(120))
    .starting_at(base_time() + ChronoDuration::hours(1));
  store
    .store_trigger(&key, TriggerRecord::new(JobKey::parse("reports"), replacement), true)
    .unwrap();

  store
    .triggered_job_complete(&key, fired[0].fire_instance_id, CompletionInstruction::SetTriggerError)
    .unwrap();
  let record = store.retrieve_trigger(&key).unwrap().unwrap();
  assert_eq!(record.state, TriggerState::Normal);
  assert_eq!(
    record.next_fire_time,
    Some(base_time() + ChronoDuration::hours(1))
  );
  assert!(record.in_flight.is_empty());

  // A repeated completion of an already completed occurrence is ignored too.
  let again = schedule(&store, "digest", "reports", Schedule::once(base_time()));
  let fired = fire_due(&store);
  assert_eq!(fired.len(), 1);
  assert_eq!(fired[0].trigger_key, again);
  store
    .triggered_job_complete(&again, fired[0].fire_instance_id, CompletionInstruction::Noop)
    .unwrap();
  store
    .triggered_job_complete(&again, fired[0].fire_instance_id, CompletionInstruction::DeleteTrigger)
    .unwrap();
  assert!(store.retrieve_trigger(&again).unwrap().is_some());
}
