use std::time::Duration;

use rpnet_nats::{JetStream, KvBucket};
use rpnet_std::time::Clock;
use rpnet_sync::{ElectionConfig, LeaderElector, Store};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Cronjob;
use crate::error::CronError;
use crate::executor::Executor;
use crate::handlers::Handlers;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// Pause before restarting a scheduler or registry watch that failed.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// One process's share of the cron subsystem: the registry replica, an
/// executor, and a candidacy for running the scheduler.
pub struct CronNode<K: KvBucket, C: Clock> {
    registry: Registry<K, C>,
    elector: LeaderElector<K>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything a [`CronNode`] runs against.
pub struct CronNodeParts<K: KvBucket, S: JetStream, C: Clock> {
    pub jobs: Store<Cronjob, K>,
    pub leader: K,
    pub stream: S,
    pub handlers: Handlers,
    pub clock: C,
    pub node_name: String,
    pub election: ElectionConfig,
}

impl<K: KvBucket, C: Clock> CronNode<K, C> {
    /// Load the registry, then start the executor and join the scheduler
    /// election. Returns once the registry is loaded.
    pub async fn start<S: JetStream>(
        parts: CronNodeParts<K, S, C>,
        parent: CancellationToken,
    ) -> Result<Self, CronError> {
        let cancel = parent.child_token();
        let registry = Registry::new(parts.jobs, parts.clock.clone());
        let watch = registry.start(cancel.clone()).await?;
        let mut tasks = vec![tokio::spawn(supervise_watch(
            registry.clone(),
            watch,
            cancel.clone(),
        ))];

        let executor = Executor::new(
            parts.stream.clone(),
            parts.handlers,
            parts.clock.clone(),
            parts.node_name.clone(),
        );
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                while !cancel.is_cancelled() {
                    if let Err(e) = executor.run(cancel.clone()).await {
                        error!(error = %e, "Cron executor failed");
                    }
                    pause(&cancel).await;
                }
            }
        }));

        let scheduler = Scheduler::new(registry.clone(), parts.stream, parts.clock);
        let node_name = parts.node_name;
        let elector = LeaderElector::new(
            parts.leader,
            parts.election,
            cancel.clone(),
            move |leadership: CancellationToken| {
                let scheduler = scheduler.clone();
                async move {
                    while !leadership.is_cancelled() {
                        if let Err(e) = scheduler.run(leadership.clone()).await {
                            error!(error = %e, "Cron scheduler failed");
                        }
                        pause(&leadership).await;
                    }
                }
            },
            move || info!(node = %node_name, "No longer the cron scheduler"),
        )?;
        elector.start();

        Ok(Self {
            registry,
            elector,
            cancel,
            tasks,
        })
    }

    pub fn registry(&self) -> &Registry<K, C> {
        &self.registry
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Release leadership, then stop the executor and the registry watch.
    pub async fn shutdown(self) {
        self.elector.stop().await;
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cron node task failed");
            }
        }
        info!("Cron node stopped");
    }
}

/// Restart the registry watch whenever it ends before `cancel` fires.
async fn supervise_watch<K: KvBucket, C: Clock>(
    registry: Registry<K, C>,
    watch: JoinHandle<()>,
    cancel: CancellationToken,
) {
    let mut watch = Some(watch);
    loop {
        if let Some(task) = watch.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Registry watch task failed");
            }
        }
        pause(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        match registry.start(cancel.clone()).await {
            Ok(restarted) => {
                info!("Registry watch restarted");
                watch = Some(restarted);
            }
            Err(e) => warn!(error = %e, "Failed to restart registry watch"),
        }
    }
}

/// Sleep [`RESTART_DELAY`] unless `cancel` fires first.
async fn pause(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(RESTART_DELAY) => {}
    }
}
