use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rpnet_cron::{CronNode, CronNodeParts, CronSettings, Cronjob, Handlers, kv};
use rpnet_std::{SystemClock, SystemEnv};
use rpnet_sync::{Lock, Store};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_JOB: &str = "node_heartbeat";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = CronSettings::from_env(&SystemEnv);
    tracing::info!(
        node = %settings.node_name,
        servers = ?settings.nats.servers,
        auth = settings.nats.auth.kind(),
        "Starting cron node"
    );

    let client = rpnet_nats::connect(&settings.nats)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        });
    let js = async_nats::jetstream::new(client);

    let backend = kv::provision(&js, &settings.election())
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to provision cron buckets");
            std::process::exit(1);
        });

    let jobs = Store::builder(backend.jobs)
        .lock(Arc::new(
            Lock::new(backend.locks).with_max_lock_age(settings.max_lock_age),
        ))
        .build();

    let handlers = Handlers::new();
    let runs = Arc::new(AtomicU64::new(0));
    let node_name = settings.node_name.clone();
    handlers.add(HEARTBEAT_JOB, move |ctx| {
        let runs = runs.fetch_add(1, Ordering::SeqCst) + 1;
        let node_name = node_name.clone();
        async move {
            tracing::info!(
                node = %node_name,
                scheduled_at = %ctx.scheduled_at,
                runs,
                "Node heartbeat"
            );
            Ok(Some(serde_json::json!({ "runs": runs, "node": node_name })))
        }
    });

    let shutdown = CancellationToken::new();
    let node = CronNode::start(
        CronNodeParts {
            jobs,
            leader: backend.leader,
            stream: backend.stream,
            handlers,
            clock: SystemClock,
            node_name: settings.node_name.clone(),
            election: settings.election(),
        },
        shutdown.clone(),
    )
    .await
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to start cron node");
        std::process::exit(1);
    });

    if let Err(e) = node
        .registry()
        .register_cronjob(Cronjob::new(HEARTBEAT_JOB, "@always"))
        .await
    {
        tracing::error!(error = %e, job = HEARTBEAT_JOB, "Failed to register cronjob");
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, releasing leadership");
    node.shutdown().await;
    shutdown.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}
