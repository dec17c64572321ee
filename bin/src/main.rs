#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod poller;
mod registry;
mod startup_health;

use config::{NodeConfig, StoreConfig};
use external_api::{ExternalApi, Health};
use lease_coordination::{
    KeyResolver, LeaseManager, NodeId, SessionRegistry, Stores, Supervisor,
};
use pollkeeper_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal, sync::mpsc},
    tracing::*,
};
use poller::TracePoller;
use registry::ConfigFileRegistry;
use startup_health::{NodeTasks, verify_startup_subsystems};
use tracing_futures::Instrument;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.pollkeeper_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start node"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing node config");
    let node_cfg = NodeConfig::parse(&config.config_path)?;
    let node_id = NodeId::generate(config.node_name().or(node_cfg.node_name()));
    info!(instance_id = %node_id, "using id");

    let span = info_span!("node", instance_id = %node_id);
    run(config, node_cfg, node_id).instrument(span).await
}

async fn run(config: cli::Config, node_cfg: NodeConfig, node_id: NodeId) -> Result<()> {
    let timing = *node_cfg.lease();
    let keys =
        KeyResolver::new(node_cfg.keys()).map_err(|e| anyhow!("invalid key config: {e}"))?;

    let backend = match node_cfg.store() {
        StoreConfig::Memory => "memory",
        StoreConfig::Nats(_) => "nats",
    };
    info!(backend, "opening lease store");
    let stores = Stores::open(node_cfg.store(), &timing)
        .await
        .map_err(|e| anyhow!("lease store unavailable: {e}"))?;

    let token = CancellationToken::new();
    let manager = LeaseManager::new(node_id, timing, keys, &stores, token.child_token());

    // start external api for healthchecks
    let api = ExternalApi::new(config.external_api, Some(Arc::clone(&manager)));
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());

    // Keep health BAD until the store selftest passed and every loop is running.
    let mut tasks = match bring_up(&config, &node_cfg, &manager, &token).await {
        Ok(tasks) => tasks,
        Err(err) => return abort(&api_sender, &token, err).await,
    };
    if let Err(err) = verify_startup_subsystems(&mut api_task, &mut tasks).await {
        return abort(&api_sender, &token, err).await;
    }

    debug!("changing health to good after startup checks and write selftest passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let signal = shutdown_signal().await;
    let _ = api_sender.send(Health::Bad).await;
    info!("shutting down, releasing leases");
    if tokio::time::timeout(config.shutdown_timeout(), manager.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout = ?config.shutdown_timeout(),
            "graceful shutdown timed out, remaining leases will expire"
        );
    }
    if let Some(client) = &stores.client {
        client.disconnect().await;
    }
    token.cancel();

    for (name, task) in [
        ("liveness loop", tasks.liveness),
        ("session sync", tasks.session_sync),
        ("poll supervisor", tasks.polling),
        ("web server API", api_task),
    ] {
        if let Err(err) = task.await {
            error!(?err, "error waiting for {name}");
        }
    }
    signal
}

/// Startup steps that must all pass before the node reports healthy.
async fn bring_up(
    config: &cli::Config,
    node_cfg: &NodeConfig,
    manager: &Arc<LeaseManager>,
    token: &CancellationToken,
) -> Result<NodeTasks> {
    manager
        .verify_store()
        .await
        .map_err(|e| anyhow!("lease store write selftest failed: {e}"))?;
    let liveness = manager
        .start()
        .await
        .map_err(|e| anyhow!("initial liveness registration failed: {e}"))?;

    let registry: Arc<dyn SessionRegistry> =
        Arc::new(ConfigFileRegistry::new(config.config_path.clone()));
    manager
        .sync_sessions(registry.as_ref())
        .await
        .map_err(|e| anyhow!("initial session sync failed: {e}"))?;
    info!(sessions = node_cfg.sessions().len(), "tracking sessions");
    let session_sync = manager.spawn_session_sync(registry);

    let supervisor = Supervisor::new(
        Arc::clone(manager),
        Arc::new(TracePoller::default()),
        node_cfg.poll_interval(),
        token.child_token(),
    );
    let polling = supervisor.start();

    Ok(NodeTasks {
        liveness,
        session_sync,
        polling,
    })
}

async fn abort(
    api_sender: &mpsc::Sender<Health>,
    token: &CancellationToken,
    err: anyhow::Error,
) -> Result<()> {
    let _ = api_sender.send(Health::Bad).await;
    token.cancel();
    Err(err)
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => res.map_err(|err| anyhow!(err)),
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(|err| anyhow!(err))
    }
}
