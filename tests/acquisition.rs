//! tests/acquisition.rs
//! Lock-based acquisition across nodes sharing one backend.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use clusterkeeper::{KvBackend, ManualClock, Schedule, TriggerKey, TriggerState};
use common::{
  backend_with_triggers, base_time, fire_due, schedule, setup_tracing, store_for, FlakyMap,
};

#[test]
fn racing_nodes_fire_one_shot_exactly_once() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let seed = store_for("node-0", &kv, &clock);
  let key = schedule(&seed, "billing/close-books", "billing", Schedule::once(base_time()));

  let stores: Vec<_> = (0..8)
    .map(|i| store_for(&format!("node-{i}"), &kv, &clock))
    .collect();
  let fired: usize = std::thread::scope(|s| {
    let handles: Vec<_> = stores
      .iter()
      .map(|store| s.spawn(move || fire_due(store).len()))
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).sum()
  });

  assert_eq!(fired, 1, "exactly one node may fire the occurrence");
  let record = seed.retrieve_trigger(&key).unwrap().unwrap();
  assert_eq!(record.times_triggered, 1);
  assert_eq!(record.state, TriggerState::Complete);
}

#[test]
fn racing_nodes_fire_each_interval_occurrence_once() {
  setup_tracing();
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let seed = store_for("node-0", &kv, &clock);
  let key = schedule(
    &seed,
    "sync",
    "sync",
    Schedule::every(StdDuration::from_secs(30)).starting_at(base_time()),
  );
  let stores: Vec<_> = (0..4)
    .map(|i| store_for(&format!("node-{i}"), &kv, &clock))
    .collect();

  for round in 0..5 {
    let fired: Vec<_> = std::thread::scope(|s| {
      let handles: Vec<_> = stores
        .iter()
        .map(|store| s.spawn(move || fire_due(store)))
        .collect();
      handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect()
    });
    assert_eq!(fired.len(), 1, "round {round} fired {} times", fired.len());
    assert_eq!(
      fired[0].scheduled_fire_time,
      base_time() + ChronoDuration::seconds(30 * round)
    );
    seed
      .triggered_job_complete(
        &key,
        fired[0].fire_instance_id,
        clusterkeeper::CompletionInstruction::Noop,
      )
      .unwrap();
    clock.advance(ChronoDuration::seconds(30));
  }

  assert_eq!(seed.retrieve_trigger(&key).unwrap().unwrap().times_triggered, 5);
}

#[test]
fn paused_trigger_is_never_acquired() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(&store, "report", "reports", Schedule::once(base_time()));

  assert!(store.pause_trigger(&key).unwrap());
  assert_eq!(store.trigger_state(&key).unwrap(), TriggerState::Paused);
  let acquired = store
    .acquire_next_triggers(store.now(), 10, StdDuration::from_secs(3600))
    .unwrap();
  assert!(acquired.is_empty());

  assert!(store.resume_trigger(&key).unwrap());
  let acquired = store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap();
  assert_eq!(acquired.len(), 1);
  assert_eq!(acquired[0].key, key);
}

#[test]
fn locked_candidate_is_skipped_and_locks_are_not_reentrant() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(&store, "report", "reports", Schedule::once(base_time()));

  assert!(kv.triggers.try_lock(&key, "node-b", None).unwrap());
  assert!(store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap()
    .is_empty());
  assert_eq!(store.metrics().snapshot().candidates_skipped_locked, 1);
  assert!(kv.triggers.unlock(&key, "node-b").unwrap());

  let first = store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap();
  assert_eq!(first.len(), 1);
  // Held by this node now; a second pass must not pick it up again.
  assert!(store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap()
    .is_empty());

  store.release_acquired_trigger(&first[0]);
  assert!(!kv.triggers.is_locked(&key).unwrap());
  assert_eq!(
    store
      .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
      .unwrap()
      .len(),
    1
  );
}

#[test]
fn unreadable_candidate_is_skipped_without_failing_the_batch() {
  setup_tracing();
  let flaky = Arc::new(FlakyMap::new());
  let kv = backend_with_triggers(flaky.clone());
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let broken = schedule(&store, "broken", "jobs", Schedule::once(base_time()));
  let healthy = schedule(&store, "healthy", "jobs", Schedule::once(base_time()));

  flaky.fail_reads_of(&broken);
  let acquired = store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap();

  let keys: Vec<TriggerKey> = acquired.iter().map(|a| a.key.clone()).collect();
  assert_eq!(keys, vec![healthy]);
  assert!(!kv.triggers.is_locked(&broken).unwrap(), "failed candidate must be unlocked");
}

#[test]
fn acquisition_writes_back_revalidated_record() {
  let flaky = Arc::new(FlakyMap::new());
  let kv = backend_with_triggers(flaky.clone());
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  let key = schedule(&store, "on-time", "jobs", Schedule::once(base_time()));
  let before = flaky.writes();

  let acquired = store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap();
  assert_eq!(acquired.len(), 1);
  assert_eq!(flaky.writes(), before + 1, "on-time candidate is persisted too");
  assert_eq!(store.trigger_state(&key).unwrap(), TriggerState::Normal);
  store.release_acquired_trigger(&acquired[0]);
}

#[test]
fn batch_is_ordered_by_fire_time_and_bounded() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time() + ChronoDuration::minutes(1));
  let store = store_for("node-a", &kv, &clock);
  let late = schedule(
    &store,
    "late",
    "jobs",
    Schedule::once(base_time() + ChronoDuration::seconds(50)),
  );
  let early = schedule(
    &store,
    "early",
    "jobs",
    Schedule::once(base_time() + ChronoDuration::seconds(10)),
  );
  let _middle = schedule(
    &store,
    "middle",
    "jobs",
    Schedule::once(base_time() + ChronoDuration::seconds(30)),
  );

  let acquired = store
    .acquire_next_triggers(store.now(), 2, StdDuration::ZERO)
    .unwrap();
  let keys: Vec<_> = acquired.iter().map(|a| a.key.to_string()).collect();
  assert_eq!(keys, vec!["early", "middle"]);
  assert!(!kv.triggers.is_locked(&late).unwrap());
  assert!(kv.triggers.is_locked(&early).unwrap());
}

#[test]
fn time_window_extends_the_acquisition_bound() {
  let kv = KvBackend::in_memory();
  let clock = ManualClock::new(base_time());
  let store = store_for("node-a", &kv, &clock);
  schedule(
    &store,
    "soon",
    "jobs",
    Schedule::once(base_time() + ChronoDuration::seconds(5)),
  );

  assert!(store
    .acquire_next_triggers(store.now(), 10, StdDuration::ZERO)
    .unwrap()
    .is_empty());
  let acquired = store
    .acquire_next_triggers(store.now(), 10, StdDuration::from_secs(10))
    .unwrap();
  assert_eq!(acquired.len(), 1);
  assert_eq!(
    acquired[0].scheduled_fire_time,
    base_time() + ChronoDuration::seconds(5)
  );
}
