//! Backend policy type definitions
//!
//! Types for generating:
//! - Cilium CiliumNetworkPolicy (L3/L4/L7 network)
//! - Calico NetworkPolicy (L3/L4 network)
//! - KubeArmor KubeArmorPolicy (host security)
//! - Kyverno Policy (admission)
//! - Tetragon TracingPolicyNamespaced (eBPF runtime)
//!
//! All policy types implement [`HasApiResource`]. [`BackendPolicy`] wraps
//! them for code that handles any backend.

pub mod calico;
pub mod cilium;
pub mod kubearmor;
pub mod kyverno;
pub mod tetragon;

use std::collections::BTreeMap;
use std::str::FromStr;

use kube::discovery::ApiResource;
use serde_json::Value;

use crate::crd::IntentType;
use crate::kube_utils::{HasApiResource, ObjectMeta};
use crate::{Error, Result};

pub use calico::CalicoNetworkPolicy;
pub use cilium::CiliumNetworkPolicy;
pub use kubearmor::KubeArmorPolicy;
pub use kyverno::KyvernoPolicy;
pub use tetragon::TracingPolicyNamespaced;

/// An enforcement engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    /// Cilium
    Cilium,
    /// Calico
    Calico,
    /// KubeArmor
    KubeArmor,
    /// Kyverno
    Kyverno,
    /// Tetragon
    Tetragon,
}

impl Backend {
    /// All backends
    pub const ALL: [Backend; 5] = [
        Backend::Cilium,
        Backend::Calico,
        Backend::KubeArmor,
        Backend::Kyverno,
        Backend::Tetragon,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cilium => "cilium",
            Backend::Calico => "calico",
            Backend::KubeArmor => "kubearmor",
            Backend::Kyverno => "kyverno",
            Backend::Tetragon => "tetragon",
        }
    }

    /// Prefix of compiled object names
    pub fn prefix(&self) -> &'static str {
        match self {
            Backend::Cilium => "cnp",
            Backend::Calico => "networkpolicy",
            Backend::KubeArmor => "ksp",
            Backend::Kyverno => "kyverno",
            Backend::Tetragon => "tracingpolicynamespaced",
        }
    }

    /// Intent type this backend compiles
    pub fn intent_type(&self) -> IntentType {
        match self {
            Backend::Cilium | Backend::Calico => IntentType::Network,
            Backend::KubeArmor | Backend::Tetragon => IntentType::System,
            Backend::Kyverno => IntentType::Cluster,
        }
    }

    /// Subtypes this backend handles, as advertised in the registry
    pub fn subtypes(&self) -> &'static [&'static str] {
        match self {
            Backend::Cilium => &[
                "pod", "endpoint", "namespace", "entities", "cidr", "port", "fqdn", "icmp",
                "dns", "http", "https", "service",
            ],
            Backend::Calico => &[
                "pod",
                "namespace",
                "serviceAccounts",
                "cidr",
                "protocol",
                "port",
                "icmp",
            ],
            Backend::KubeArmor => &["process", "file", "network", "capabilities", "syscalls"],
            Backend::Kyverno => &["mutate", "validate", "verifyImage"],
            Backend::Tetragon => &["kprobe", "tracepoint", "uprobes"],
        }
    }

    /// `supportedTypes` map for this backend's registry entry
    pub fn supported_types(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            self.intent_type().as_str().to_string(),
            self.subtypes().iter().map(|s| s.to_string()).collect(),
        )])
    }

    /// Default registry entry name
    pub fn default_adapter_name(&self) -> String {
        format!("kubeaegis-{}", self.as_str())
    }

    /// Name of the object compiled from `intent`
    pub fn policy_name(&self, intent: &str) -> String {
        format!("{}-{}", self.prefix(), intent)
    }

    /// Name of this backend's object for a deletion notice.
    ///
    /// Notices carry `ksp-<intent>` regardless of backend.
    pub fn policy_name_for_notice(&self, notice: &str) -> String {
        let intent = notice
            .strip_prefix(crate::DELETION_NOTICE_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(notice);
        self.policy_name(intent)
    }

    /// Kind and API resource of compiled objects
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Backend::Cilium => CiliumNetworkPolicy::api_resource(),
            Backend::Calico => CalicoNetworkPolicy::api_resource(),
            Backend::KubeArmor => KubeArmorPolicy::api_resource(),
            Backend::Kyverno => KyvernoPolicy::api_resource(),
            Backend::Tetragon => TracingPolicyNamespaced::api_resource(),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::internal_with_context("backend", format!("unknown backend {s}")))
    }
}

/// A compiled policy for any backend
#[derive(Clone, Debug, PartialEq)]
pub enum BackendPolicy {
    /// Cilium
    Cilium(CiliumNetworkPolicy),
    /// Calico
    Calico(CalicoNetworkPolicy),
    /// KubeArmor
    KubeArmor(KubeArmorPolicy),
    /// Kyverno
    Kyverno(KyvernoPolicy),
    /// Tetragon
    Tetragon(TracingPolicyNamespaced),
}

impl BackendPolicy {
    /// Backend this policy belongs to
    pub fn backend(&self) -> Backend {
        match self {
            BackendPolicy::Cilium(_) => Backend::Cilium,
            BackendPolicy::Calico(_) => Backend::Calico,
            BackendPolicy::KubeArmor(_) => Backend::KubeArmor,
            BackendPolicy::Kyverno(_) => Backend::Kyverno,
            BackendPolicy::Tetragon(_) => Backend::Tetragon,
        }
    }

    /// Metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            BackendPolicy::Cilium(p) => &p.metadata,
            BackendPolicy::Calico(p) => &p.metadata,
            BackendPolicy::KubeArmor(p) => &p.metadata,
            BackendPolicy::Kyverno(p) => &p.metadata,
            BackendPolicy::Tetragon(p) => &p.metadata,
        }
    }

    /// Mutable metadata
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            BackendPolicy::Cilium(p) => &mut p.metadata,
            BackendPolicy::Calico(p) => &mut p.metadata,
            BackendPolicy::KubeArmor(p) => &mut p.metadata,
            BackendPolicy::Kyverno(p) => &mut p.metadata,
            BackendPolicy::Tetragon(p) => &mut p.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    /// Resource kind
    pub fn kind(&self) -> &'static str {
        match self {
            BackendPolicy::Cilium(_) => CiliumNetworkPolicy::KIND,
            BackendPolicy::Calico(_) => CalicoNetworkPolicy::KIND,
            BackendPolicy::KubeArmor(_) => KubeArmorPolicy::KIND,
            BackendPolicy::Kyverno(_) => KyvernoPolicy::KIND,
            BackendPolicy::Tetragon(_) => TracingPolicyNamespaced::KIND,
        }
    }

    /// `Kind/name`, the form recorded in intent status
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }

    /// Labels the compiled object targets
    pub fn target_labels(&self) -> BTreeMap<String, String> {
        match self {
            BackendPolicy::Cilium(p) => p
                .rules()
                .flat_map(|r| r.endpoint_selector.match_labels.clone())
                .collect(),
            BackendPolicy::Calico(_) | BackendPolicy::Kyverno(_) => BTreeMap::new(),
            BackendPolicy::KubeArmor(p) => p.spec.selector.match_labels.clone(),
            BackendPolicy::Tetragon(p) => p
                .spec
                .pod_selector
                .as_ref()
                .map(|s| s.match_labels.clone())
                .unwrap_or_default(),
        }
    }

    /// Serialize to the JSON object applied to the cluster
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            BackendPolicy::Cilium(p) => serde_json::to_value(p),
            BackendPolicy::Calico(p) => serde_json::to_value(p),
            BackendPolicy::KubeArmor(p) => serde_json::to_value(p),
            BackendPolicy::Kyverno(p) => serde_json::to_value(p),
            BackendPolicy::Tetragon(p) => serde_json::to_value(p),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_backend_prefix() {
        assert_eq!(Backend::Cilium.policy_name("web"), "cnp-web");
        assert_eq!(Backend::Calico.policy_name("web"), "networkpolicy-web");
        assert_eq!(Backend::KubeArmor.policy_name("web"), "ksp-web");
        assert_eq!(Backend::Kyverno.policy_name("web"), "kyverno-web");
        assert_eq!(
            Backend::Tetragon.policy_name("web"),
            "tracingpolicynamespaced-web"
        );
    }

    #[test]
    fn deletion_notice_maps_to_each_backends_object() {
        assert_eq!(Backend::Cilium.policy_name_for_notice("ksp-web"), "cnp-web");
        assert_eq!(Backend::KubeArmor.policy_name_for_notice("ksp-web"), "ksp-web");
        // Notices without the prefix are taken as the bare intent name
        assert_eq!(Backend::Kyverno.policy_name_for_notice("web"), "kyverno-web");
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("KubeArmor".parse::<Backend>().unwrap(), Backend::KubeArmor);
        assert_eq!("tetragon".parse::<Backend>().unwrap(), Backend::Tetragon);
        assert!("istio".parse::<Backend>().is_err());
    }

    #[test]
    fn supported_types_are_keyed_by_intent_type() {
        let types = Backend::Kyverno.supported_types();
        assert_eq!(types["cluster"], vec!["mutate", "validate", "verifyImage"]);
        assert!(Backend::Cilium.supported_types()["network"].contains(&"fqdn".to_string()));
    }

    #[test]
    fn full_name_is_kind_slash_name() {
        let policy = BackendPolicy::KubeArmor(KubeArmorPolicy::new(
            ObjectMeta::new("ksp-web", "shop"),
            Default::default(),
        ));
        assert_eq!(policy.full_name(), "KubeArmorPolicy/ksp-web");
        assert_eq!(policy.backend(), Backend::KubeArmor);
        assert_eq!(policy.to_value().unwrap()["metadata"]["namespace"], "shop");
    }
}
