//! demos/clustered_nodes.rs
//!
//! Two nodes share one clustered backend. The clustered heartbeat fires once
//! per occurrence across both nodes; the local cache refresh fires on each.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clusterkeeper::{
  CompletionInstruction, FireRecord, JobRequest, KvBackend, RunMode, SchedulerService,
  ShutdownMode,
};
use tracing::info;

fn node(
  node_id: &'static str,
  shared: KvBackend,
  fires: Arc<AtomicUsize>,
) -> anyhow::Result<SchedulerService> {
  let service = SchedulerService::builder()
    .max_workers(2)
    .node_id(node_id)
    .idle_wait(StdDuration::from_millis(500))
    .clustered_backend(shared)
    .job_launcher(move |fire: FireRecord| {
      let fires = fires.clone();
      async move {
        fires.fetch_add(1, Ordering::Relaxed);
        info!(node_id = node_id, job_id = %fire.job_id, scheduled = %fire.scheduled_fire_time, "Running job.");
        CompletionInstruction::Noop
      }
    })
    .build()?;
  Ok(service)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,clusterkeeper=info,clustered_nodes=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let shared = KvBackend::in_memory();
  let fires_a = Arc::new(AtomicUsize::new(0));
  let fires_b = Arc::new(AtomicUsize::new(0));
  let node_a = node("node-a", shared.clone(), fires_a.clone())?;
  let node_b = node("node-b", shared, fires_b.clone())?;

  node_a.do_schedule_job(&JobRequest::from_interval(
    "heartbeat",
    "heartbeat",
    StdDuration::from_secs(1),
  ))?;
  for service in [&node_a, &node_b] {
    service.do_schedule_job(
      &JobRequest::from_interval("cache-refresh", "cache", StdDuration::from_secs(2))
        .with_run_mode(RunMode::RunLocally),
    )?;
  }

  node_a.start()?;
  node_b.start()?;
  tokio::time::sleep(StdDuration::from_secs(5)).await;

  for service in [&node_a, &node_b] {
    service
      .shutdown(ShutdownMode::Graceful, Some(StdDuration::from_secs(5)))
      .await?;
  }

  info!(
    node_a = fires_a.load(Ordering::Relaxed),
    node_b = fires_b.load(Ordering::Relaxed),
    "Fires per node."
  );
  for details in node_a.all_job_details()? {
    info!(job_id = %details.job_id, run_mode = %details.run_mode, times_triggered = details.times_triggered, "Job summary.");
  }
  Ok(())
}
