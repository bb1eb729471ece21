//! KubeAegisPolicy: the user-authored intent resource

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use super::ActionPoint;

/// Specification for a KubeAegisPolicy
///
/// Example:
/// ```yaml
/// apiVersion: cclab.kubeaegis.com/v1
/// kind: KubeAegisPolicy
/// metadata:
///   name: web-ingress
///   namespace: shop
/// spec:
///   enableReport: true
///   intentRequest:
///     - type: network
///       selector:
///         match:
///           - kind: Pod
///             namespace: shop
///             matchLabels: {app: web}
///       rule:
///         action: Allow
///         to:
///           - kind: port
///             port: "443"
///             protocol: TCP
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cclab.kubeaegis.com",
    version = "v1",
    kind = "KubeAegisPolicy",
    plural = "kubeaegispolicies",
    shortname = "kap",
    namespaced,
    status = "KubeAegisPolicyStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Policies","type":"string","jsonPath":".status.listOfAPs"}"#,
    printcolumn = r#"{"name":"Number of APs","type":"integer","jsonPath":".status.numberOfAPs"}"#,
    printcolumn = r#"{"name":"Resources","type":"string","jsonPath":".status.listOfResources"}"#,
    printcolumn = r#"{"name":"Number of Resources","type":"integer","jsonPath":".status.numberOfResources"}"#
)]
pub struct KubeAegisPolicySpec {
    /// Write a report file after each successful dispatch
    #[serde(rename = "enableReport", alias = "enableReporting", default)]
    pub enable_reporting: bool,

    /// Intent entries, compiled independently
    #[serde(rename = "intentRequest", alias = "intentRequests", default)]
    pub intent_requests: Vec<IntentRequest>,
}

/// Which family of backends an intent targets
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    /// L3/L4/L7 network policy (Cilium, Calico)
    #[default]
    Network,
    /// Host/runtime security (KubeArmor, Tetragon)
    System,
    /// Admission policy (Kyverno)
    Cluster,
}

impl IntentType {
    /// Registry key for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Network => "network",
            IntentType::System => "system",
            IntentType::Cluster => "cluster",
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intent: a selector and the rule to apply to what it selects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IntentRequest {
    /// Intent family
    #[serde(rename = "type", default)]
    pub type_: IntentType,
    /// Target selector
    #[serde(default)]
    pub selector: Selector,
    /// Rule
    #[serde(default)]
    pub rule: Rule,
}

impl IntentRequest {
    /// Key used to look up supporting adapters in the registry.
    ///
    /// Network requests are keyed by the first non-empty peer kind; system
    /// and cluster requests by the first action point's subtype.
    pub fn subtype_key(&self) -> Option<&str> {
        match self.type_ {
            IntentType::Network => self
                .rule
                .from
                .iter()
                .chain(self.rule.to.iter())
                .map(|d| d.kind.as_str())
                .find(|k| !k.is_empty()),
            IntentType::System | IntentType::Cluster => {
                self.rule.action_points.first().map(ActionPoint::sub_type)
            }
        }
    }

    /// Namespace the selector targets: first match entry's namespace, else `default`
    pub fn target_namespace<'a>(&'a self, default: &'a str) -> &'a str {
        self.selector
            .matches
            .first()
            .map(|m| m.namespace.as_str())
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default)
    }
}

/// Label matches plus expressions, resolved against live cluster state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Selector {
    /// Label matches, merged in order
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Match>,
    /// Label expressions (`labels["app"] == "web"`, `.startsWith(...)`, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cel: Vec<String>,
}

/// Whether every or any match entry must hold (admission backend only)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchCondition {
    /// Any entry
    Any,
    /// All entries
    All,
}

/// One match entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Resource kind (Pod, Service, Deployment, ConfigMap, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// any / all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<MatchCondition>,
    /// Namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/// What to do with matched traffic or events.
///
/// Parsed case-insensitively; always written back capitalized.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub enum Action {
    /// Permit
    #[default]
    Allow,
    /// Deny
    Block,
    /// Deny, enforced at admission/runtime
    Enforce,
    /// Observe only
    Audit,
}

impl Action {
    /// Whether this action denies
    pub fn is_blocking(&self) -> bool {
        matches!(self, Action::Block | Action::Enforce)
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "block" => Ok(Action::Block),
            "enforce" => Ok(Action::Enforce),
            "audit" => Ok(Action::Audit),
            _ => Err(format!(
                "unknown action {s:?}, expected one of Allow, Block, Enforce, Audit"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// A plain string in the CRD so the API server accepts any casing
impl JsonSchema for Action {
    fn schema_name() -> String {
        "Action".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(generator: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(generator)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Allow => "Allow",
            Action::Block => "Block",
            Action::Enforce => "Enforce",
            Action::Audit => "Audit",
        };
        f.write_str(s)
    }
}

/// Traffic direction of a peer entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// `from` entries
    Ingress,
    /// `to` entries
    Egress,
}

/// Rule body
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Rule {
    /// Action
    #[serde(default)]
    pub action: Action,
    /// Ingress peers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<NetPolDetail>,
    /// Egress peers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<NetPolDetail>,
    /// Action points
    #[serde(
        rename = "actionPoint",
        alias = "actionPoints",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub action_points: Vec<ActionPoint>,
}

impl Rule {
    /// All peers with their direction, `from` first
    pub fn peers(&self) -> impl Iterator<Item = (Direction, &NetPolDetail)> {
        self.from
            .iter()
            .map(|d| (Direction::Ingress, d))
            .chain(self.to.iter().map(|d| (Direction::Egress, d)))
    }
}

/// A network peer or port entry; `kind` says which fields matter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NetPolDetail {
    /// pod, namespace, serviceAccounts, cidr, port, entities, fqdn, icmp, ...
    pub kind: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Positional arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    /// Protocol
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl NetPolDetail {
    /// `kind`, lower-cased for table lookups
    pub fn kind_lower(&self) -> String {
        self.kind.to_ascii_lowercase()
    }
}

/// System-managed status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeAegisPolicyStatus {
    /// "Created" once dispatched
    #[serde(default)]
    pub status: String,
    /// RFC 3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    /// Count of distinct adapter policies
    #[serde(rename = "numberOfAPs", default)]
    pub number_of_aps: i32,
    /// Adapter policy names, in first-seen order
    #[serde(rename = "listOfAPs", default, skip_serializing_if = "Vec::is_empty")]
    pub list_of_aps: Vec<String>,
    /// Count of distinct bound resources
    #[serde(default)]
    pub number_of_resources: i32,
    /// Bound resources (`Pod/<name>`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_of_resources: Vec<String>,
    /// Adapters the last dispatch could not reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_adapters: Vec<String>,
    /// Last validation or dispatch failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Generation the controller last validated and dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KubeAegisPolicyStatus {
    /// Append an adapter policy name unless present. Returns whether it was added.
    pub fn record_child_policy(&mut self, name: &str) -> bool {
        let added = append_unique(&mut self.list_of_aps, name);
        self.number_of_aps = self.list_of_aps.len() as i32;
        added
    }

    /// Append a bound resource unless present. Returns whether it was added.
    pub fn record_resource(&mut self, name: &str) -> bool {
        let added = append_unique(&mut self.list_of_resources, name);
        self.number_of_resources = self.list_of_resources.len() as i32;
        added
    }
}

fn append_unique(list: &mut Vec<String>, name: &str) -> bool {
    if list.iter().any(|n| n == name) {
        return false;
    }
    list.push(name.to_string());
    true
}

impl KubeAegisPolicy {
    /// Namespace, falling back to `default`
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Owner reference pointing at this intent, for cascade deletion.
    ///
    /// `None` until the API server has assigned a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        Some(OwnerReference {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.meta().uid.clone()?,
            ..Default::default()
        })
    }

    /// Distinct intent types, in request order
    pub fn policy_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for req in &self.spec.intent_requests {
            append_unique(&mut types, req.type_.as_str());
        }
        types
    }

    /// Distinct rule actions, in request order
    pub fn policy_actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = Vec::new();
        for req in &self.spec.intent_requests {
            append_unique(&mut actions, &req.rule.action.to_string());
        }
        actions
    }
}
