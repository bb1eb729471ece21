//! gRPC client for adapter `PolicyService` endpoints

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Endpoint;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use aegis_common::{Error, Result};
use aegis_proto::policy_service_client::PolicyServiceClient;
use aegis_proto::{DeletionResponse, PolicyDeletionRequest, PolicyRequest, PolicyResponse};

/// Calls into one adapter, addressed by its registry `host:port`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdapterClient: Send + Sync {
    /// Ask the adapter to compile and apply an intent
    async fn dispatch_policy(
        &self,
        adapter: &str,
        address: &str,
        request: PolicyRequest,
    ) -> Result<PolicyResponse>;

    /// Tell the adapter an intent was deleted
    async fn notify_deletion(
        &self,
        adapter: &str,
        address: &str,
        request: PolicyDeletionRequest,
    ) -> Result<DeletionResponse>;
}

/// Connection settings for adapter calls
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-RPC deadline
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Plaintext tonic client; a fresh channel per call since addresses are
/// re-read from the registry on every dispatch
#[derive(Clone, Debug, Default)]
pub struct GrpcAdapterClient {
    config: ClientConfig,
}

impl GrpcAdapterClient {
    /// Create a client
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn connect(
        &self,
        adapter: &str,
        address: &str,
    ) -> Result<PolicyServiceClient<tonic::transport::Channel>> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::dispatch_for(adapter, format!("invalid address {address}: {e}")))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .connect()
            .await
            .map_err(|e| Error::dispatch_for(adapter, format!("connect to {address}: {e}")))?;
        debug!(adapter = %adapter, address = %address, "connected to adapter");
        Ok(PolicyServiceClient::new(channel))
    }
}

#[async_trait]
impl AdapterClient for GrpcAdapterClient {
    async fn dispatch_policy(
        &self,
        adapter: &str,
        address: &str,
        request: PolicyRequest,
    ) -> Result<PolicyResponse> {
        let mut client = self.connect(adapter, address).await?;
        let response = client
            .dispatch_policy(request)
            .await
            .map_err(|status| Error::dispatch_for(adapter, status.message()))?;
        Ok(response.into_inner())
    }

    async fn notify_deletion(
        &self,
        adapter: &str,
        address: &str,
        request: PolicyDeletionRequest,
    ) -> Result<DeletionResponse> {
        let mut client = self.connect(adapter, address).await?;
        let response = client
            .notify_policy_deletion(request)
            .await
            .map_err(|status| Error::dispatch_for(adapter, status.message()))?;
        Ok(response.into_inner())
    }
}
