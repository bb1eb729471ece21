//! KubeAegis backend adapter
//!
//! One adapter serves one [`Backend`](aegis_common::policy::Backend). The
//! controller calls it over gRPC with an intent's name; the adapter reads the
//! intent, compiles it for its backend, and applies the result with an owner
//! reference back to the intent.

#![deny(missing_docs)]

mod enforcer;
mod manager;
mod server;

pub use enforcer::{Applied, Enforcer, KubePolicyObjects, PolicyObjects};
pub use manager::{AdapterManager, ApplyOutcome};
pub use server::AdapterServer;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;

    use aegis_common::crd::KubeAegisPolicy;
    use aegis_common::Result;
    use aegis_selector::{pod_labels, PodLister, SelectorResolver};

    /// Fixed pod set, filtered by labels on every list
    pub struct StaticPods(pub Vec<Pod>);

    impl StaticPods {
        pub fn resolver(self) -> SelectorResolver {
            SelectorResolver::new(Arc::new(self))
        }
    }

    #[async_trait]
    impl PodLister for StaticPods {
        async fn list_pods(
            &self,
            _namespace: &str,
            labels: &BTreeMap<String, String>,
        ) -> Result<Vec<Pod>> {
            Ok(self
                .0
                .iter()
                .filter(|p| {
                    let have = pod_labels(p);
                    labels.iter().all(|(k, v)| have.get(k) == Some(v))
                })
                .cloned()
                .collect())
        }
    }

    pub fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("shop".to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod
    }

    pub fn intent(yaml: &str) -> KubeAegisPolicy {
        serde_yaml::from_str(yaml).unwrap()
    }
}
