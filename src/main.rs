//! ibguid-controller — binds InfiniBand SR-IOV pod networks to a
//! fabric-wide PKey partition directory managed by an external Subnet
//! Manager (spec.md §1, §5, §6).
//!
//! Three long-lived tasks run concurrently: the pod watcher dispatcher
//! and a single periodic reconciler loop that alternates an add pass
//! and a delete pass each tick. SIGINT/SIGTERM cancel a shared
//! [`CancellationToken`], which stops the watcher and breaks the
//! reconciler loop; `main` returns only once both have drained.

mod config;
mod error;
mod events;
mod guid;
mod k8s;
mod pod_network;
mod reconciler;
mod sm;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::error::Result;
use crate::events::EventHandler;
use crate::k8s::KubeClient;
use crate::reconciler::Reconciler;

#[derive(Parser, Debug)]
#[command(name = "ibguid-controller", disable_version_flag = true)]
struct Cli {
    /// Force debug-level logging regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,

    /// Print the controller version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("ibguid-controller {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_tracing(cli.debug);

    if let Err(e) = run().await {
        error!(error = %e, "controller exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("ibguid-controller starting");

    let config = Config::load()?;
    info!(
        sm_plugin = %config.sm_plugin,
        periodic_update = config.periodic_update,
        "configuration loaded"
    );

    let sm = sm::load(&config)?;
    sm.validate().await.map_err(|e| {
        error!(plugin = sm.name(), error = %e, "sm plugin validation failed");
        e
    })?;
    info!(plugin = sm.name(), spec = %sm.spec(), "sm plugin ready");

    let k8s_client = KubeClient::try_default().await?;
    let raw_client = k8s_client.raw();
    let k8s: Arc<dyn k8s::K8sClient> = Arc::new(k8s_client);

    let handler = Arc::new(EventHandler::new());
    let reconciler = Arc::new(Reconciler::new(config.clone(), k8s, sm, handler.clone())?);

    reconciler.startup_recover().await?;
    info!("startup pool recovery complete");

    let shutdown = CancellationToken::new();

    let watcher_handle = watcher::run_background(raw_client, handler);

    let reconciler_task = tokio::spawn({
        let reconciler = reconciler.clone();
        let period = Duration::from_secs(config.periodic_update);
        let token = shutdown.clone();
        async move {
            reconciler.run_periodic(period, token).await;
        }
    });

    info!("controller running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining tasks");

    shutdown.cancel();
    watcher_handle.stop().await;
    if let Err(e) = reconciler_task.await {
        error!(error = %e, "reconciler task panicked during shutdown");
    }

    info!("ibguid-controller stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
