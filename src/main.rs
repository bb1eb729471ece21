//! KubeAegis controller binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::registry::{ConfigMapRegistry, RegistryLocation};
use aegis_common::status::{KubeStatusStore, StatusReconciler};
use aegis_common::{DEFAULT_REGISTRY_KEY, DEFAULT_REGISTRY_NAME, DEFAULT_REGISTRY_NAMESPACE, FIELD_MANAGER};
use aegis_dispatch::{
    ClientConfig, Dispatcher, FileReportSink, GrpcAdapterClient, ReportSink, DEFAULT_REPORT_DIR,
};
use aegis_selector::{KubePodLister, SelectorResolver};
use aegis_validator::{HostPathProbe, HttpImageRegistry, IntentValidator, KubeClusterReader};
use kubeaegis::controller::{error_policy, reconcile, Context, KubeIntentClient};

/// How long shutdown waits for deferred deliveries
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// KubeAegis intent-based security policy controller
#[derive(Parser, Debug)]
#[command(name = "kubeaegis", version, about, long_about = None)]
struct Cli {
    /// Print the KubeAegisPolicy CRD and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the policy controller (default)
    Controller,
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Registry ConfigMap name
    #[arg(long, env = "AEGIS_REGISTRY_NAME", default_value = DEFAULT_REGISTRY_NAME)]
    registry_name: String,

    /// Registry ConfigMap namespace
    #[arg(long, env = "AEGIS_REGISTRY_NAMESPACE", default_value = DEFAULT_REGISTRY_NAMESPACE)]
    registry_namespace: String,

    /// Registry ConfigMap data key
    #[arg(long, env = "AEGIS_REGISTRY_KEY", default_value = DEFAULT_REGISTRY_KEY)]
    registry_key: String,

    /// Seconds between registry polls for offline adapters
    #[arg(long, env = "AEGIS_RETRY_INTERVAL_SECS", default_value = "2")]
    retry_interval_secs: u64,

    /// Directory for dispatch reports
    #[arg(long, env = "AEGIS_REPORT_DIR", default_value = DEFAULT_REPORT_DIR)]
    report_dir: PathBuf,

    /// Address of the health and report endpoints
    #[arg(long, env = "AEGIS_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&KubeAegisPolicy::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Install or update the KubeAegisPolicy CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    crds.patch(
        "kubeaegispolicies.cclab.kubeaegis.com",
        &params,
        &Patch::Apply(&KubeAegisPolicy::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install KubeAegisPolicy CRD: {e}"))?;
    tracing::info!("KubeAegisPolicy CRD installed");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("KubeAegis controller starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {e}"))?;

    ensure_crd_installed(&client).await?;

    let status = StatusReconciler::new(Arc::new(KubeStatusStore::new(
        client.clone(),
        FIELD_MANAGER,
    )));
    let resolver = SelectorResolver::new(Arc::new(KubePodLister::new(client.clone())));
    let validator = IntentValidator::new(
        resolver,
        Arc::new(KubeClusterReader::new(client.clone())),
        Arc::new(HostPathProbe),
        Arc::new(
            HttpImageRegistry::new()
                .map_err(|e| anyhow::anyhow!("failed to build image registry client: {e}"))?,
        ),
    );

    let registry = ConfigMapRegistry::new(
        client.clone(),
        RegistryLocation {
            name: args.registry_name,
            namespace: args.registry_namespace,
            key: args.registry_key,
        },
    );
    let reports: Arc<dyn ReportSink> = Arc::new(FileReportSink::new(args.report_dir));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        Arc::new(GrpcAdapterClient::new(ClientConfig::default())),
        Some(reports.clone()),
        Duration::from_secs(args.retry_interval_secs),
    ));
    let supervisor = dispatcher.supervisor().clone();

    let ctx = Arc::new(Context::new(
        Arc::new(KubeIntentClient::new(client.clone())),
        Arc::new(validator),
        dispatcher,
        status,
    ));

    let stop = CancellationToken::new();
    let http = tokio::spawn(kubeaegis::http::serve(
        args.http_addr,
        kubeaegis::http::router(reports),
        stop.clone().cancelled_owned(),
    ));

    let intents: Api<KubeAegisPolicy> = Api::all(client);
    tracing::info!("starting KubeAegisPolicy controller");
    Controller::new(intents, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "policy reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "policy reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("controller stopped, shutting down");
    stop.cancel();
    supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "http server failed"),
        Err(e) => tracing::warn!(error = %e, "http server task panicked"),
    }
    Ok(())
}
