//! Kyverno admission policy types
//!
//! Namespaced `Policy` rather than `ClusterPolicy`, so the owner reference
//! to the namespaced intent stays valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Kyverno Policy (`kyverno.io/v1`)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KyvernoPolicy {
    /// API version
    #[serde(default = "KyvernoPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "KyvernoPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: KyvernoPolicySpec,
}

impl HasApiResource for KyvernoPolicy {
    const API_VERSION: &'static str = "kyverno.io/v1";
    const KIND: &'static str = "Policy";
}

impl KyvernoPolicy {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a policy
    pub fn new(metadata: ObjectMeta, spec: KyvernoPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Kyverno policy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KyvernoPolicySpec {
    /// Apply to existing resources too
    pub background: bool,
    /// Enforce or Audit
    pub validation_failure_action: String,
    /// Rules
    #[serde(default)]
    pub rules: Vec<KyvernoRule>,
}

/// One Kyverno rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KyvernoRule {
    /// Unique rule name
    pub name: String,
    /// Resources the rule applies to
    #[serde(rename = "match")]
    pub match_: MatchResources,
    /// Mutation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<Mutation>,
    /// Validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<Validation>,
    /// Image verification
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify_images: Vec<ImageVerification>,
}

/// `match` block: any-of or all-of resource filters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchResources {
    /// Any filter matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<ResourceFilter>,
    /// All filters match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<ResourceFilter>,
}

/// One resource filter
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceFilter {
    /// Resource description
    pub resources: ResourceDescription,
}

/// Kinds, namespaces, name and labels to match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescription {
    /// Kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    /// Namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Mutation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Strategic merge patch
    pub patch_strategic_merge: Value,
}

/// Validation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Message shown on failure
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// CEL expressions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel: Option<CelValidation>,
    /// Pod Security Standards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security: Option<PodSecurity>,
    /// Deny conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Deny>,
    /// Overlay pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,
}

/// CEL validation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CelValidation {
    /// Expressions
    pub expressions: Vec<CelExpression>,
}

/// One CEL expression
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CelExpression {
    /// Expression
    pub expression: String,
    /// Message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Pod Security Standards level
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PodSecurity {
    /// privileged, baseline or restricted
    pub level: String,
    /// Standards version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Deny block
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Deny {
    /// Conditions
    pub conditions: DenyConditions,
}

/// any/all condition lists
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DenyConditions {
    /// Any condition holds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
    /// All conditions hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
}

/// key/operator/value condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Key (JMESPath)
    pub key: String,
    /// Operator
    pub operator: String,
    /// Values
    pub value: Vec<String>,
}

/// verifyImages entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerification {
    /// Image references
    pub image_references: Vec<String>,
    /// Attestor sets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestors: Vec<AttestorSet>,
}

/// Attestor set
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AttestorSet {
    /// Required number of entries to verify
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    /// Entries
    pub entries: Vec<Attestor>,
}

/// One attestor
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Attestor {
    /// Key-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<StaticKeyAttestor>,
    /// Keyless
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyless: Option<KeylessAttestor>,
}

/// Key-based attestor
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticKeyAttestor {
    /// PEM public keys
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_keys: String,
    /// KMS URI
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kms: String,
}

/// Keyless attestor
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct KeylessAttestor {
    /// Certificate subject
    pub subject: String,
    /// OIDC issuer
    pub issuer: String,
    /// Transparency log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekor: Option<Rekor>,
}

/// Rekor transparency log
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Rekor {
    /// Log URL
    pub url: String,
}
