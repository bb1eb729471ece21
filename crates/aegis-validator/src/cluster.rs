//! Cluster reads used by the existence stage

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use aegis_common::kube_utils::label_selector;
use aegis_common::Result;

/// Namespace phase meaning the namespace accepts workloads
pub const NAMESPACE_ACTIVE: &str = "Active";

/// Match kinds whose existence is checked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// `Pod`
    Pod,
    /// `Service`
    Service,
    /// `Deployment`
    Deployment,
    /// `ConfigMap`
    ConfigMap,
}

impl WorkloadKind {
    /// Kind named by a match entry, `None` for kinds that are not checked
    pub fn from_match_kind(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(WorkloadKind::Pod),
            "Service" => Some(WorkloadKind::Service),
            "Deployment" => Some(WorkloadKind::Deployment),
            "ConfigMap" => Some(WorkloadKind::ConfigMap),
            _ => None,
        }
    }

    /// Plural, lower-case name for messages
    pub fn plural(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pods",
            WorkloadKind::Service => "services",
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::ConfigMap => "configmaps",
        }
    }
}

/// Namespace and workload lookups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Phase of a namespace, `None` if it does not exist
    async fn namespace_phase(&self, name: &str) -> Result<Option<String>>;

    /// Whether at least one object of `kind` in `namespace` carries `labels`
    async fn any_matching(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool>;
}

/// Reads against the API server
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    /// Create a reader
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn any<K>(&self, namespace: &str, params: &ListParams) -> Result<bool>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(!api.list(params).await?.items.is_empty())
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn namespace_phase(&self, name: &str) -> Result<Option<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let Some(ns) = api.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(Some(
            ns.status.and_then(|s| s.phase).unwrap_or_default(),
        ))
    }

    async fn any_matching(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut params = ListParams::default().limit(1);
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        match kind {
            WorkloadKind::Pod => self.any::<Pod>(namespace, &params).await,
            WorkloadKind::Service => self.any::<Service>(namespace, &params).await,
            WorkloadKind::Deployment => self.any::<Deployment>(namespace, &params).await,
            WorkloadKind::ConfigMap => self.any::<ConfigMap>(namespace, &params).await,
        }
    }
}
