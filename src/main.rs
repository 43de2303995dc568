use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use k8s_zabbix::config::AgentConfig;
use k8s_zabbix::daemon::Daemon;
use k8s_zabbix::k8s::client;
use k8s_zabbix::k8s::watch::WatcherSet;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Watches a Kubernetes cluster and feeds Zabbix and a web API.
#[derive(Parser)]
#[command(name = "check_kubernetesd", version)]
struct Cli {
    /// Path to the INI configuration file. Environment variables with the
    /// upper-cased field name override file values.
    config: String,
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("cannot start with configuration {}", cli.config))?;
    init_tracing(config.debug);

    let kube_client = client::build_client(&config)
        .await
        .context("cannot reach the cluster API")?;

    let daemon = Daemon::new(config);
    let watchers = WatcherSet::new(kube_client, Arc::clone(&daemon));
    watchers.start().await;
    let mut jobs = daemon.spawn_scheduler_jobs();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(max_secs = SHUTDOWN_JOIN_TIMEOUT.as_secs(), "received SIGTERM, stopping");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, stopping");
                break;
            }
            _ = sigusr1.recv() => daemon.dump_summary().await,
            _ = sigusr2.recv() => daemon.dump_full().await,
        }
    }

    daemon.begin_shutdown();
    watchers.shutdown().await;
    for job in jobs.drain(..) {
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, job).await.is_err() {
            warn!("job did not stop in time");
        }
    }
    info!("all tasks exited, exiting check_kubernetesd");
    Ok(())
}
