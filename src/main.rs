//! resync - roll workloads when the configs they consume change

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use resync::config::ResyncConfig;
use resync::controller::{create_client, Controller, Plugins};
use resync::events::KubeEventPublisher;

/// resync - keeps workloads in step with the ConfigMaps/Secrets they
/// consume, and syncs externally-sourced configs from a broker
#[derive(Parser, Debug)]
#[command(name = "resync", version, about, long_about = None)]
struct Cli {
    /// Path to the resync config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a kubeconfig file; in-cluster config when unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Watch the deployed namespace only
    #[arg(long)]
    namespaced: bool,

    /// Debounce window between a config change and the reload, in seconds
    #[arg(long)]
    reload_delay: Option<u64>,

    /// Namespace to exclude from the watch; repeatable
    #[arg(long = "ignore-namespace")]
    ignored_namespaces: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,resync=debug,kube=info,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ResyncConfig::load(path)?,
        None => ResyncConfig::default(),
    };

    // flags override file values
    if cli.kubeconfig.is_some() {
        config.kubeconfig = cli.kubeconfig.clone();
    }
    if cli.namespaced {
        config.namespaced = true;
    }
    if let Some(delay) = cli.reload_delay {
        config.reload_delay_secs = delay;
    }
    config
        .ignored_namespaces
        .extend(cli.ignored_namespaces.iter().cloned());

    let client = create_client(config.kubeconfig.as_deref()).await?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let events = Arc::new(KubeEventPublisher::new(client.clone()));
    let controller = Controller::new(
        client,
        config,
        Plugins::default(),
        events,
        cancel.clone(),
    );

    info!("starting resync controller");
    if let Err(e) = controller.run().await {
        error!(error = %e, "controller exited with error");
        return Err(e.into());
    }
    Ok(())
}

// First SIGINT/SIGTERM cancels the parent token; a second force-exits.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut exits = 0u32;
        loop {
            wait_for_signal().await;
            exits += 1;
            if exits == 1 {
                info!("shutdown signal received, draining");
                cancel.cancel();
            } else {
                std::process::exit(1);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
