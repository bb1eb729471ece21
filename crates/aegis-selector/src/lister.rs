//! Live pod listing

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use aegis_common::kube_utils::label_selector;
use aegis_common::Result;

/// Namespace- and label-scoped pod listing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLister: Send + Sync {
    /// Pods in `namespace` carrying every label in `labels`. Empty `labels`
    /// lists the whole namespace.
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<Vec<Pod>>;
}

/// Pod listing against the API server
pub struct KubePodLister {
    client: Client,
}

impl KubePodLister {
    /// Create a lister
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(api.list(&params).await?.items)
    }
}

/// A pod's labels, empty if it has none
pub fn pod_labels(pod: &Pod) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    pod.metadata.labels.as_ref().unwrap_or(&EMPTY)
}
