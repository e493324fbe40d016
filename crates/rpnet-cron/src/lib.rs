//! # rpnet-cron
//!
//! Fleet-wide cron on NATS JetStream. Every node keeps a replica of the job
//! registry and runs an executor; one elected node runs the scheduler.
//!
//! ## Flow
//!
//! 1. [`Registry::register_cronjob`] validates a job and stores it in the
//!    `cronjobs` bucket. Every node's registry picks it up from the watch.
//! 2. The leader's [`Scheduler`] ticks every second. A due job is published
//!    on `cron.schedule` and moved to `PENDING` with its next fire time.
//! 3. One node's [`Executor`] takes the event, acks it, runs the handler
//!    registered under the job's name with the job's timeout, and publishes
//!    the outcome on `cron.complete`.
//! 4. The scheduler consumes the completion and moves the job back to
//!    `WAITING`, keeping the data the handler returned.
//!
//! Delivery is at most once per fire time: a node that dies mid-run loses
//! that run, and ticks missed while no scheduler was running are skipped.
//!
//! ## Job record (JSON in the `cronjobs` bucket under `node_heartbeat`)
//!
//! ```json
//! {
//!   "name": "node_heartbeat",
//!   "schedule": "@always",
//!   "state": "WAITING",
//!   "next_schedule_time": "2026-01-01T00:01:00Z",
//!   "timeout_sec": 60
//! }
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpnet_cron::{CronNode, CronNodeParts, CronSettings, Cronjob, Handlers, kv};
//! use rpnet_std::{SystemClock, SystemEnv};
//! use rpnet_sync::{Lock, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CronSettings::from_env(&SystemEnv);
//! let client = rpnet_nats::connect(&settings.nats).await?;
//! let js = async_nats::jetstream::new(client);
//! let backend = kv::provision(&js, &settings.election()).await?;
//!
//! let handlers = Handlers::new();
//! handlers.add("report", |ctx| async move {
//!     tracing::info!(job = %ctx.name, "Building report");
//!     Ok(None)
//! });
//!
//! let jobs = Store::builder(backend.jobs)
//!     .lock(Arc::new(Lock::new(backend.locks)))
//!     .build();
//! let node = CronNode::start(
//!     CronNodeParts {
//!         jobs,
//!         leader: backend.leader,
//!         stream: backend.stream,
//!         handlers,
//!         clock: SystemClock,
//!         node_name: settings.node_name.clone(),
//!         election: settings.election(),
//!     },
//!     CancellationToken::new(),
//! )
//! .await?;
//! node.registry()
//!     .register_cronjob(Cronjob::new("report", "0 8 * * *"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod kv;
pub mod node;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod settings;

pub use config::{
    Cronjob, CronjobCompletedEvent, CronjobData, CronjobSchedulerEvent, CronjobState,
    DEFAULT_TIMEOUT, MAX_TIMEOUT,
};
pub use error::CronError;
pub use executor::Executor;
pub use handlers::{HandlerResult, Handlers, JobContext};
pub use node::{CronNode, CronNodeParts};
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use settings::CronSettings;
