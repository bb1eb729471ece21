//! Policy compiler for KubeAegis
//!
//! One compile loop ([`PolicyCompiler`]) drives five backend targets through
//! the [`PolicyTarget`] interface:
//!
//! | Backend | Intent type | Object |
//! |---------|-------------|--------|
//! | Cilium | network | `CiliumNetworkPolicy` |
//! | Calico | network | `projectcalico.org/v3 NetworkPolicy` |
//! | KubeArmor | system | `KubeArmorPolicy` |
//! | Tetragon | system | `TracingPolicyNamespaced` |
//! | Kyverno | cluster | `kyverno.io/v1 Policy` |
//!
//! A peer kind a backend does not know is skipped. A kind it knows but
//! cannot parse (a non-numeric port, a bad CIDR) fails the whole object.

#![deny(missing_docs)]

mod calico;
mod cilium;
mod compiler;
mod kubearmor;
mod kyverno;
mod target;
mod tetragon;

pub use compiler::PolicyCompiler;
pub use target::{PolicyTarget, RuleSlot};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;

    use aegis_common::crd::KubeAegisPolicy;
    use aegis_common::Result;
    use aegis_selector::{PodLister, SelectorResolver};

    /// Fixed pod list, filtered by labels
    pub struct StaticPods(pub Vec<Pod>);

    impl StaticPods {
        pub fn resolver(pods: Vec<Pod>) -> SelectorResolver {
            SelectorResolver::new(Arc::new(StaticPods(pods)))
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
                    let have = aegis_selector::pod_labels(p);
                    labels.iter().all(|(k, v)| have.get(k) == Some(v))
                })
                .cloned()
                .collect())
        }
    }

    pub fn intent(yaml: &str) -> KubeAegisPolicy {
        serde_yaml::from_str(yaml).unwrap()
    }
}
