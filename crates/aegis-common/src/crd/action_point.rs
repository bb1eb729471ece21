//! Action points: one operation unit within a rule.
//!
//! The persisted form is `{subType, headers, precondition, conditions, resource}`
//! where `resource` is a loose object whose meaningful fields depend on
//! `subType`. In memory the resource is an [`EventResource`] variant keyed by
//! the subtype, so each backend only sees the fields that apply to it.
//! Unknown subtypes are kept verbatim so they can still be routed.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Header attached to an action point
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EventHeader {
    /// Header name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Header value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Key/operator/value filter used by preconditions and deny rules
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EventFilter {
    /// `any` or `all`
    #[serde(rename = "Condition", default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    /// Key expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Operator (Equals, AnyIn, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    /// Values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<String>,
}

/// Keyless (sigstore) attestor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Keyless {
    /// Certificate subject
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    /// OIDC issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer: String,
    /// Rekor transparency log URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

// =============================================================================
// Per-subtype payloads
// =============================================================================

/// `http`: L7 method/path match
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResource {
    /// Request paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// HTTP methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

/// `process` / `file`: filesystem match
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathResource {
    /// Exact paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Glob patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern: Vec<String>,
    /// Directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// Only match read access
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    /// Apply to subdirectories of `dir`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
}

/// `network`: protocol match
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetworkResource {
    /// Protocol (tcp, udp, icmp, raw)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// `capabilities`: Linux capability names
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CapabilityResource {
    /// Capability names (net_raw, sys_admin, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// `syscalls`: syscall names, optionally scoped to paths
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SyscallResource {
    /// Paths the syscalls are scoped to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Syscall names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// `kprobe`: comma-separated syscalls with argument types
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KprobeResource {
    /// Syscall names, comma separated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub syscall: String,
    /// Argument types, by index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// `tracepoint`: kernel tracepoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TracepointResource {
    /// Tracepoint subsystem (e.g. `syscalls`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subsystem: String,
    /// Tracepoint event (e.g. `sys_enter_openat`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    /// Syscall names checked against the allow-list
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub syscall: String,
    /// Argument types, by index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// `uprobes`: user-space probe on a binary symbol
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct UprobeResource {
    /// Binary paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Symbol to attach to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symbol: String,
}

/// `mutate`: annotation/label patch
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MutateResource {
    /// `annotations` or `label`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Key/value maps merged into the patch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<BTreeMap<String, String>>,
}

/// `validate`: admission validation rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ValidateResource {
    /// `cel`, `podSecurity`, `deny`, `pattern`, or `annotations`/`label`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Rule-specific key/value maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<BTreeMap<String, String>>,
    /// Deny conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<EventFilter>,
}

/// `verifyImage`: image signature verification
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VerifyImageResource {
    /// Image references are the keys of these maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<BTreeMap<String, String>>,
    /// Static keys (`kms:` URIs or PEM / `{{` templated keys)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Keyless attestors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyless: Vec<Keyless>,
    /// Number of attestors that must verify
    #[serde(default, skip_serializing_if = "is_zero")]
    pub count: i32,
}

impl VerifyImageResource {
    /// Image references named by this action point
    pub fn images(&self) -> impl Iterator<Item = &String> {
        self.details.iter().flat_map(|d| d.keys())
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Subtype-keyed action point payload
#[derive(Clone, Debug, PartialEq)]
pub enum EventResource {
    /// `http`
    Http(HttpResource),
    /// `process`
    Process(PathResource),
    /// `file`
    File(PathResource),
    /// `network`
    Network(NetworkResource),
    /// `capabilities`
    Capabilities(CapabilityResource),
    /// `syscalls`
    Syscalls(SyscallResource),
    /// `kprobe`
    Kprobe(KprobeResource),
    /// `tracepoint`
    Tracepoint(TracepointResource),
    /// `uprobes`
    Uprobes(UprobeResource),
    /// `mutate`
    Mutate(MutateResource),
    /// `validate`
    Validate(ValidateResource),
    /// `verifyImage`
    VerifyImage(VerifyImageResource),
    /// Any other subtype, kept as-is
    Other {
        /// The subtype string
        sub_type: String,
        /// The raw resource object
        resource: serde_json::Value,
    },
}

impl EventResource {
    /// The `subType` string this payload is persisted under
    pub fn sub_type(&self) -> &str {
        match self {
            EventResource::Http(_) => "http",
            EventResource::Process(_) => "process",
            EventResource::File(_) => "file",
            EventResource::Network(_) => "network",
            EventResource::Capabilities(_) => "capabilities",
            EventResource::Syscalls(_) => "syscalls",
            EventResource::Kprobe(_) => "kprobe",
            EventResource::Tracepoint(_) => "tracepoint",
            EventResource::Uprobes(_) => "uprobes",
            EventResource::Mutate(_) => "mutate",
            EventResource::Validate(_) => "validate",
            EventResource::VerifyImage(_) => "verifyImage",
            EventResource::Other { sub_type, .. } => sub_type,
        }
    }

    fn parse(sub_type: &str, resource: serde_json::Value) -> Result<Self, serde_json::Error> {
        let resource = if resource.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            resource
        };
        Ok(match sub_type {
            "http" => EventResource::Http(serde_json::from_value(resource)?),
            "process" => EventResource::Process(serde_json::from_value(resource)?),
            "file" => EventResource::File(serde_json::from_value(resource)?),
            "network" => EventResource::Network(serde_json::from_value(resource)?),
            "capabilities" => EventResource::Capabilities(serde_json::from_value(resource)?),
            "syscalls" => EventResource::Syscalls(serde_json::from_value(resource)?),
            "kprobe" => EventResource::Kprobe(serde_json::from_value(resource)?),
            "tracepoint" => EventResource::Tracepoint(serde_json::from_value(resource)?),
            "uprobes" => EventResource::Uprobes(serde_json::from_value(resource)?),
            "mutate" => EventResource::Mutate(serde_json::from_value(resource)?),
            "validate" => EventResource::Validate(serde_json::from_value(resource)?),
            "verifyImage" => EventResource::VerifyImage(serde_json::from_value(resource)?),
            other => EventResource::Other {
                sub_type: other.to_string(),
                resource,
            },
        })
    }

    fn to_value(&self) -> serde_json::Value {
        let value = match self {
            EventResource::Http(r) => serde_json::to_value(r),
            EventResource::Process(r) | EventResource::File(r) => serde_json::to_value(r),
            EventResource::Network(r) => serde_json::to_value(r),
            EventResource::Capabilities(r) => serde_json::to_value(r),
            EventResource::Syscalls(r) => serde_json::to_value(r),
            EventResource::Kprobe(r) => serde_json::to_value(r),
            EventResource::Tracepoint(r) => serde_json::to_value(r),
            EventResource::Uprobes(r) => serde_json::to_value(r),
            EventResource::Mutate(r) => serde_json::to_value(r),
            EventResource::Validate(r) => serde_json::to_value(r),
            EventResource::VerifyImage(r) => serde_json::to_value(r),
            EventResource::Other { resource, .. } => Ok(resource.clone()),
        };
        // Payloads are plain string/bool maps; serialization cannot fail
        value.unwrap_or_default()
    }
}

/// One operation unit within a rule
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawActionPoint", into = "RawActionPoint")]
pub struct ActionPoint {
    /// Headers
    pub headers: Vec<EventHeader>,
    /// Preconditions
    pub precondition: Vec<EventFilter>,
    /// Conditions
    pub conditions: Vec<EventFilter>,
    /// Subtype-specific payload
    pub resource: EventResource,
}

impl ActionPoint {
    /// Build an action point from a payload with no headers or filters
    pub fn new(resource: EventResource) -> Self {
        Self {
            headers: Vec::new(),
            precondition: Vec::new(),
            conditions: Vec::new(),
            resource,
        }
    }

    /// The subtype string (`http`, `process`, `verifyImage`, ...)
    pub fn sub_type(&self) -> &str {
        self.resource.sub_type()
    }
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawActionPoint {
    sub_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    headers: Vec<EventHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    precondition: Vec<EventFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<EventFilter>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    resource: serde_json::Value,
}

impl TryFrom<RawActionPoint> for ActionPoint {
    type Error = String;

    fn try_from(raw: RawActionPoint) -> Result<Self, Self::Error> {
        let resource = EventResource::parse(&raw.sub_type, raw.resource)
            .map_err(|e| format!("invalid resource for subType '{}': {}", raw.sub_type, e))?;
        Ok(Self {
            headers: raw.headers,
            precondition: raw.precondition,
            conditions: raw.conditions,
            resource,
        })
    }
}

impl From<ActionPoint> for RawActionPoint {
    fn from(ap: ActionPoint) -> Self {
        Self {
            sub_type: ap.resource.sub_type().to_string(),
            resource: ap.resource.to_value(),
            headers: ap.headers,
            precondition: ap.precondition,
            conditions: ap.conditions,
        }
    }
}

impl JsonSchema for ActionPoint {
    fn schema_name() -> String {
        "ActionPoint".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        use schemars::schema::{InstanceType, Metadata, ObjectValidation, Schema, SchemaObject};

        // resource fields depend on subType; let the API server keep them all
        let mut resource = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            metadata: Some(Box::new(Metadata {
                description: Some("Subtype-specific payload".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        resource.extensions.insert(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        );

        let mut properties = schemars::Map::new();
        properties.insert("subType".to_string(), gen.subschema_for::<String>());
        properties.insert("headers".to_string(), gen.subschema_for::<Vec<EventHeader>>());
        properties.insert(
            "precondition".to_string(),
            gen.subschema_for::<Vec<EventFilter>>(),
        );
        properties.insert(
            "conditions".to_string(),
            gen.subschema_for::<Vec<EventFilter>>(),
        );
        properties.insert("resource".to_string(), Schema::Object(resource));

        Schema::Object(SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            object: Some(Box::new(ObjectValidation {
                properties,
                required: ["subType".to_string()].into_iter().collect(),
                ..Default::default()
            })),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_subtype_parses_into_its_payload() {
        let ap: ActionPoint = serde_json::from_value(serde_json::json!({
            "subType": "kprobe",
            "resource": {"syscall": "sys_openat,sys_read", "args": ["int", "file"]}
        }))
        .unwrap();

        match &ap.resource {
            EventResource::Kprobe(k) => {
                assert_eq!(k.syscall, "sys_openat,sys_read");
                assert_eq!(k.args, vec!["int", "file"]);
            }
            other => panic!("expected kprobe, got {other:?}"),
        }
        assert_eq!(ap.sub_type(), "kprobe");
    }

    #[test]
    fn fields_of_other_subtypes_are_ignored() {
        // A file point carrying http fields keeps only its own dimensions
        let ap: ActionPoint = serde_json::from_value(serde_json::json!({
            "subType": "file",
            "resource": {"dir": "/etc/", "recursive": true, "methods": ["GET"]}
        }))
        .unwrap();
        match ap.resource {
            EventResource::File(f) => {
                assert_eq!(f.dir, "/etc/");
                assert!(f.recursive);
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn unknown_subtype_is_kept_verbatim() {
        let json = serde_json::json!({
            "subType": "seccomp",
            "resource": {"profile": "runtime/default"}
        });
        let ap: ActionPoint = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(ap.sub_type(), "seccomp");
        assert_eq!(serde_json::to_value(&ap).unwrap(), json);
    }

    #[test]
    fn missing_resource_defaults_to_empty_payload() {
        let ap: ActionPoint =
            serde_json::from_value(serde_json::json!({"subType": "uprobes"})).unwrap();
        assert_eq!(ap.resource, EventResource::Uprobes(UprobeResource::default()));
    }

    #[test]
    fn mistyped_payload_is_rejected() {
        let result: Result<ActionPoint, _> = serde_json::from_value(serde_json::json!({
            "subType": "http",
            "resource": {"methods": "GET"}
        }));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("subType 'http'"), "{err}");
    }

    #[test]
    fn filters_keep_capitalised_condition_key() {
        let ap: ActionPoint = serde_json::from_value(serde_json::json!({
            "subType": "validate",
            "resource": {
                "kind": "deny",
                "filter": [{"Condition": "any", "key": "{{request.operation}}", "operator": "Equals", "value": ["DELETE"]}]
            }
        }))
        .unwrap();
        match ap.resource {
            EventResource::Validate(v) => assert_eq!(v.filter[0].condition, "any"),
            other => panic!("expected validate, got {other:?}"),
        }
    }

    #[test]
    fn schema_preserves_unknown_resource_fields() {
        let schema = schemars::schema_for!(ActionPoint);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(
            json["properties"]["resource"]["x-kubernetes-preserve-unknown-fields"],
            serde_json::Value::Bool(true)
        );
    }
}
