//! ClusterKeeper: A Cluster-Aware Trigger Store and Firing Engine
//!
//! Decides when named units of work ("triggers") become due and delivers each
//! due occurrence to exactly one executor: on every node for local jobs, or
//! exactly once across the cluster for clustered jobs. All scheduling state
//! lives in a pluggable key-value backend, so it survives node restarts
//! without double-firing or silently dropping work.
//!
//! # Features
//!
//! - Schedules:
//!   - Cron expressions (five or six fields) evaluated in any IANA timezone.
//!   - Fixed intervals with optional start time, repeat count, and end time.
//!   - One-time execution at a specific `DateTime<Utc>`.
//! - Two run modes sharing one API ([`RunMode::RunLocally`], [`RunMode::RunOncePerCluster`]).
//! - Advisory-lock acquisition over a shared [`KvBackend`]: at most one node
//!   fires a given occurrence.
//! - Misfire detection and correction (late triggers skip their backlog).
//! - Trigger state machine with pause/resume by trigger, job, or group matcher.
//! - Exclusion calendars, non-concurrent jobs (`Blocked` siblings), and
//!   recovery of occurrences left in flight by a crashed node.
//! - Bounded worker pool per run mode, graceful and forced shutdown.
//! - Built-in metrics collection (queryable snapshot using [`MetricsSnapshot`]).
//! - Optional task-local firing context for launched jobs (requires `firing_context` feature).
//! - Optional Serde support for public types (requires `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use clusterkeeper::{
//!     CompletionInstruction, FireRecord, JobRequest, KvBackend, RunMode, SchedulerService,
//!     ShutdownMode,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One backend shared by every node of the cluster.
//!     let cluster = KvBackend::in_memory();
//!
//!     let service = SchedulerService::builder()
//!         .max_workers(4)
//!         .node_id("node-a")
//!         .clustered_backend(cluster)
//!         .job_launcher(|fire: FireRecord| async move {
//!             println!("{} fired for {}", fire.job_id, fire.scheduled_fire_time);
//!             CompletionInstruction::Noop
//!         })
//!         .build()?;
//!
//!     // Fires once per cluster every night at midnight UTC.
//!     service.do_schedule_job(&JobRequest::from_cron("nightly-cleanup", "cleanup", "0 0 * * *"))?;
//!
//!     // Fires on every node every 30 seconds.
//!     service.do_schedule_job(
//!         &JobRequest::from_interval("cache-refresh", "cache", Duration::from_secs(30))
//!             .with_run_mode(RunMode::RunLocally),
//!     )?;
//!
//!     service.start()?;
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!
//!     println!("Metrics: {:#?}", service.metrics_snapshot());
//!     service.shutdown(ShutdownMode::Graceful, Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] to configure the service:
//! - `job_launcher`, `max_workers`: Required.
//! - `node_id`: Lock and in-flight owner identity (random UUID by default).
//! - `misfire_threshold`, `idle_wait`, `max_batch_size`, `batch_time_window`, `lock_lease`.
//! - `local_backend`, `clustered_backend`: Key-value backends (in-memory by default).
//! - `clock`, `signal_listener`.
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`SchedulerService::metrics_snapshot`].
//! - Query job state using [`SchedulerService::job_details`] and [`SchedulerService::all_job_details`].
//! - Integrate with the `tracing` crate for detailed logs; each launched job runs in a `job_fire` span.

// --- Feature-gated Documentation ---

// This empty module attaches the documentation block below only when
// the `firing_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "firing_context"))]
pub mod firing_context_docs {
    //! # Accessing the Firing Context (`firing_context` feature)
    //!
    //! Inside the future returned by a [`JobLauncher`](crate::JobLauncher), the
    //! occurrence being run is available through Tokio's task-local context:
    //!
    //! 1.  **`try_get_current_firing_context() -> Option<FiringContext>`**: Returns
    //!     `None` outside a launched job.
    //! 2.  **`firing_context!() -> FiringContext`**: **Panics** outside a launched job.
    //!
    //! ```no_run
    //! use clusterkeeper::{firing_context, try_get_current_firing_context};
    //! use clusterkeeper::{CompletionInstruction, FireRecord};
    //!
    //! let launcher = |_fire: FireRecord| async {
    //!     if let Some(ctx) = try_get_current_firing_context() {
    //!         println!("Running {} ({})", ctx.trigger_key, ctx.fire_instance_id);
    //!     }
    //!     let required = firing_context!();
    //!     println!("Scheduled for {}", required.scheduled_fire_time);
    //!     CompletionInstruction::Noop
    //! };
    //! ```
}

pub mod calendar;
pub mod clock;
#[cfg(feature = "firing_context")]
pub mod context;
pub mod error;
pub mod facade;
pub mod filter;
pub mod firing;
pub mod kv;
pub mod metrics;
pub mod record;
pub mod request;
pub mod schedule;
pub mod service;
pub mod signal;
pub mod store;

// --- Public Re-exports ---

// Core service components
pub use facade::SchedulerFacade;
pub use firing::{FiringConfig, JobLauncher, ShutdownMode};
pub use request::JobRequest;
pub use service::{SchedulerBuilder, SchedulerService};

// Store & backend
pub use calendar::Calendar;
pub use clock::{Clock, ManualClock, SystemClock};
pub use filter::{GroupMatcher, JobFilter, TriggerFilter};
pub use kv::{EntryFilter, EntryUpdate, InMemoryMap, KvBackend, KvMap};
pub use signal::{NoopSignaler, SchedulerSignaler};
pub use store::{AcquiredTrigger, StoreConfig, TriggerStore};

// Data model
pub use record::{
  CompletionInstruction, FireInstanceId, FireRecord, JobDetails, JobId, JobKey, JobRecord,
  JobRunnerKey, RunMode, TriggerKey, TriggerRecord, TriggerState,
};
pub use schedule::Schedule;

// Error types
pub use error::{BuildError, KvError, ScheduleError, SchedulerError, ShutdownError, StoreError};

// Conditionally export context items
#[cfg(feature = "firing_context")]
pub use context::{try_get_current_firing_context, FiringContext};

// Metrics related types
pub use metrics::MetricsSnapshot;
