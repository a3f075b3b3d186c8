//! Sleuth Operator - managed AI diagnostics deployments for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sleuth::controller::{
    error_policy, reconcile, Context, KubeInstanceStore, Settings,
};
use sleuth::crd::Sleuth;
use sleuth::signal::{signal_channel, SignalReceiver};
use sleuth::sync::{ConflictRetry, KindRegistry, KubeObjectStore, Synchronizer};

/// Sleuth - Kubernetes operator for AI-powered cluster diagnostics
#[derive(Parser, Debug)]
#[command(name = "sleuth", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Skip the workload readiness gate (development without a reachable
    /// diagnostics image)
    #[arg(long, env = "SLEUTH_LOCAL_MODE")]
    local_mode: bool,

    /// Per-call timeout for Kubernetes store operations, in seconds
    #[arg(long, default_value_t = sleuth::DEFAULT_STORE_TIMEOUT_SECS)]
    store_timeout_secs: u64,

    /// Maximum patch attempts on optimistic-concurrency conflicts
    #[arg(long, default_value_t = sleuth::DEFAULT_CONFLICT_RETRIES)]
    conflict_retries: u32,

    /// Capacity of the readiness signal channel
    #[arg(long, default_value_t = sleuth::DEFAULT_SIGNAL_CAPACITY)]
    signal_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Sleuth::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Ensure the Sleuth CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(sleuth::FIELD_MANAGER).force();

    tracing::info!("Installing Sleuth CRD...");
    crds.patch("sleuths.sleuth.dev", &params, &Patch::Apply(&Sleuth::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Sleuth CRD: {}", e))?;

    tracing::info!("Sleuth CRD installed/updated");
    Ok(())
}

/// Drain readiness signals
///
/// Dependent controllers plug in here; until one does, signals are drained
/// and logged so the bounded channel never backs up the reconciler.
async fn drain_signals(mut rx: SignalReceiver) {
    while let Some(signal) = rx.recv().await {
        tracing::info!(reason = %signal.reason, kind = ?signal.kind, "received readiness signal");
    }
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Sleuth controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    // Kind registry is built once and shared by reference from here on
    let registry = Arc::new(KindRegistry::new());
    let store = KubeObjectStore::with_timeout(
        client.clone(),
        registry,
        Duration::from_secs(cli.store_timeout_secs),
    );
    let synchronizer = Synchronizer::with_retry(
        Arc::new(store),
        ConflictRetry::with_max_attempts(cli.conflict_retries),
    );

    let (signals, rx) = signal_channel(cli.signal_capacity);
    tokio::spawn(drain_signals(rx));

    if cli.local_mode {
        tracing::warn!("local mode: workload readiness gate is disabled");
    }

    let ctx = Arc::new(
        Context::builder()
            .synchronizer(synchronizer)
            .instances(Arc::new(KubeInstanceStore::new(client.clone())))
            .signals(signals)
            .settings(Settings {
                local_mode: cli.local_mode,
                ..Default::default()
            })
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    let sleuths: Api<Sleuth> = Api::all(client);

    tracing::info!("Starting Sleuth controller...");
    Controller::new(sleuths, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Sleuth controller stopped");
    Ok(())
}
