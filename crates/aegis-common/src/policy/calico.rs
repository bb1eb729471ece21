//! Calico NetworkPolicy types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Calico namespaced NetworkPolicy (`projectcalico.org/v3`)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalicoNetworkPolicy {
    /// API version
    #[serde(default = "CalicoNetworkPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "CalicoNetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: CalicoPolicySpec,
}

impl HasApiResource for CalicoNetworkPolicy {
    const API_VERSION: &'static str = "projectcalico.org/v3";
    const KIND: &'static str = "NetworkPolicy";
}

impl CalicoNetworkPolicy {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a policy
    pub fn new(metadata: ObjectMeta, spec: CalicoPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Calico policy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalicoPolicySpec {
    /// Endpoint selector expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    /// Policy types (Ingress, Egress)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    /// Ingress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<CalicoRule>,
    /// Egress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<CalicoRule>,
}

impl CalicoPolicySpec {
    /// Recompute `types` from the populated rule lists
    pub fn refresh_types(&mut self) {
        self.types.clear();
        if !self.ingress.is_empty() {
            self.types.push("Ingress".to_string());
        }
        if !self.egress.is_empty() {
            self.types.push("Egress".to_string());
        }
    }
}

/// Render labels as a Calico selector expression, `k == 'v' && ...`
pub fn selector_expression(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k} == '{v}'"))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// One Calico rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalicoRule {
    /// Allow or Deny
    pub action: String,
    /// L4 protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// ICMP match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp: Option<IcmpMatch>,
    /// Source
    #[serde(default, skip_serializing_if = "EntityRule::is_empty")]
    pub source: EntityRule,
    /// Destination
    #[serde(default, skip_serializing_if = "EntityRule::is_empty")]
    pub destination: EntityRule,
    /// HTTP match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpMatch>,
}

impl CalicoRule {
    /// A rule with only the action set
    pub fn with_action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }
}

/// Source or destination match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityRule {
    /// Endpoint selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Namespace selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<String>,
    /// CIDRs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nets: Vec<String>,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// Service account match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_accounts: Option<ServiceAccountMatch>,
}

impl EntityRule {
    /// Whether nothing is set
    pub fn is_empty(&self) -> bool {
        self.selector.is_none()
            && self.namespace_selector.is_none()
            && self.nets.is_empty()
            && self.ports.is_empty()
            && self.service_accounts.is_none()
    }
}

/// Service account match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceAccountMatch {
    /// Account names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// Label selector over accounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

/// ICMP type/code
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct IcmpMatch {
    /// Type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<u8>,
    /// Code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
}

/// HTTP match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpMatch {
    /// Methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<HttpPath>,
}

/// HTTP path match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpPath {
    /// Exact path
    pub exact: String,
}
