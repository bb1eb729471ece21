//! Shared Kubernetes utilities using kube-rs
//!
//! Backend policy objects are plain serde structs, applied through
//! `DynamicObject` with an `ApiResource` derived from [`HasApiResource`].

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;

// =============================================================================
// ObjectMeta - metadata for compiled backend policies
// =============================================================================

/// Kubernetes metadata for compiled backend policies.
///
/// Adds the KubeAegis management label on construction.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Owner references (set by the enforcer before apply)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_AEGIS.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
            owner_references: Vec::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Metadata for an object compiled from the named intent
    pub fn for_intent(
        name: impl Into<String>,
        namespace: impl Into<String>,
        intent: &str,
    ) -> Self {
        Self::new(name, namespace).with_label(crate::LABEL_POLICY, intent)
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for KubeArmorPolicy {
///     const API_VERSION: &'static str = "security.kubearmor.com/v1";
///     const KIND: &'static str = "KubeArmorPolicy";
/// }
///
/// let ar = KubeArmorPolicy::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "cilium.io/v2", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "CiliumNetworkPolicy")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use aegis_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("cilium.io/v2");
/// assert_eq!(group, "cilium.io");
/// assert_eq!(version, "v2");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Plurals that don't follow the simple English rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("tracingpolicynamespaced", "tracingpoliciesnamespaced"),
    ("tracingpolicy", "tracingpolicies"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Render a label map as a `k=v,k2=v2` selector for list calls
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Replace any existing owner reference with the same uid
pub fn set_owner_reference(refs: &mut Vec<OwnerReference>, owner: OwnerReference) {
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner);
}
