//! KubeAegis adapter binary

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aegis_adapter::{AdapterManager, AdapterServer, Enforcer, KubePolicyObjects};
use aegis_common::policy::Backend;
use aegis_common::registry::{
    AdapterEntry, AdapterStatus, ConfigMapRegistry, RegistryLocation, RegistryStore,
};
use aegis_common::retry::{retry_with_backoff, RetryConfig};
use aegis_common::status::KubeStatusStore;
use aegis_common::{DEFAULT_REGISTRY_KEY, DEFAULT_REGISTRY_NAME, DEFAULT_REGISTRY_NAMESPACE};
use aegis_selector::{KubePodLister, SelectorResolver};

/// KubeAegis adapter for a single enforcement backend
#[derive(Parser, Debug)]
#[command(name = "aegis-adapter", version, about, long_about = None)]
struct Cli {
    /// Backend served (cilium, calico, kubearmor, kyverno, tetragon)
    #[arg(long, env = "AEGIS_BACKEND")]
    backend: Backend,

    /// Registry name of this adapter (defaults to kubeaegis-<backend>)
    #[arg(long, env = "AEGIS_ADAPTER_NAME")]
    name: Option<String>,

    /// Address the gRPC server listens on
    #[arg(long, env = "AEGIS_LISTEN", default_value = "0.0.0.0:50052")]
    listen: SocketAddr,

    /// Address the controller should dial (defaults to the listen address)
    #[arg(long, env = "AEGIS_ADVERTISE")]
    advertise: Option<String>,

    /// Registry ConfigMap name
    #[arg(long, env = "AEGIS_REGISTRY_NAME", default_value = DEFAULT_REGISTRY_NAME)]
    registry_name: String,

    /// Registry ConfigMap namespace
    #[arg(long, env = "AEGIS_REGISTRY_NAMESPACE", default_value = DEFAULT_REGISTRY_NAMESPACE)]
    registry_namespace: String,

    /// Registry ConfigMap data key
    #[arg(long, env = "AEGIS_REGISTRY_KEY", default_value = DEFAULT_REGISTRY_KEY)]
    registry_key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let backend = cli.backend;
    let name = cli
        .name
        .clone()
        .unwrap_or_else(|| backend.default_adapter_name());
    let advertise = cli
        .advertise
        .clone()
        .unwrap_or_else(|| cli.listen.to_string());

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {e}"))?;

    let registry = ConfigMapRegistry::new(
        client.clone(),
        RegistryLocation {
            name: cli.registry_name,
            namespace: cli.registry_namespace,
            key: cli.registry_key,
        },
    );
    let entry = AdapterEntry {
        address: advertise.clone(),
        supported_types: backend.supported_types(),
        status: AdapterStatus::Online,
    };
    retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "register-adapter",
        || registry.upsert(&name, entry.clone()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to register adapter {name}: {e}"))?;
    tracing::info!(adapter = %name, %backend, address = %advertise, "registered adapter");

    let manager = AdapterManager::new(
        backend,
        Arc::new(KubeStatusStore::new(client.clone(), name.clone())),
        SelectorResolver::new(Arc::new(KubePodLister::new(client.clone()))),
        Enforcer::new(Arc::new(KubePolicyObjects::new(client))),
    );

    let served = AdapterServer::new(Arc::new(manager), cli.listen)
        .run(shutdown_signal())
        .await;

    if let Err(e) = registry.set_status(&name, AdapterStatus::Offline).await {
        tracing::warn!(adapter = %name, error = %e, "failed to mark adapter offline");
    } else {
        tracing::info!(adapter = %name, "marked adapter offline");
    }

    served.map_err(|e| anyhow::anyhow!("adapter server failed: {e}"))
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
