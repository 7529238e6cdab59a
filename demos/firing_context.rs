//! demos/firing_context.rs
//!
//! Reads the firing context from inside a launched job.

use std::time::Duration as StdDuration;

use chrono::Utc;
use clusterkeeper::{
  firing_context, try_get_current_firing_context, CompletionInstruction, FireRecord,
  FiringContext, JobRequest, SchedulerService, ShutdownMode,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,clusterkeeper=info,firing_context=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let service = SchedulerService::builder()
    .max_workers(1)
    .node_id("demo-node")
    .job_launcher(|fire: FireRecord| async move {
      match try_get_current_firing_context() {
        Some(ctx) => info!(trigger_key = %ctx.trigger_key, fire_instance_id = %ctx.fire_instance_id, "Context (safe access)."),
        None => warn!("No firing context available."),
      }

      // Panics outside a launched job.
      let ctx: FiringContext = firing_context!();
      info!(run_mode = %ctx.run_mode, scheduled = %ctx.scheduled_fire_time, recovering = ctx.recovering, "Context (macro access).");
      info!(parameters = ?fire.job_parameters, "Job finished.");
      CompletionInstruction::Noop
    })
    .build()?;

  service.start()?;
  service.do_schedule_job(
    &JobRequest::once("reports/weekly", "reports", Utc::now()).with_parameter("format", "pdf"),
  )?;
  service.do_schedule_job(&JobRequest::from_interval(
    "reports/ticker",
    "reports",
    StdDuration::from_secs(2),
  ))?;

  tokio::time::sleep(StdDuration::from_secs(5)).await;
  if let Some(details) = service.job_details("reports/ticker")? {
    info!(times_triggered = details.times_triggered, next = ?details.next_fire_time, "Ticker details.");
  }

  service
    .shutdown(ShutdownMode::Graceful, Some(StdDuration::from_secs(5)))
    .await?;
  Ok(())
}
