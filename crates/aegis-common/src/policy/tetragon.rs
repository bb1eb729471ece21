//! Tetragon TracingPolicyNamespaced types for eBPF kprobe, tracepoint and
//! uprobe enforcement.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Tetragon TracingPolicyNamespaced
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracingPolicyNamespaced {
    /// API version
    #[serde(default = "TracingPolicyNamespaced::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "TracingPolicyNamespaced::default_kind")]
    pub kind: String,
    /// Namespace-scoped metadata
    pub metadata: ObjectMeta,
    /// Policy spec
    pub spec: TracingPolicySpec,
}

impl HasApiResource for TracingPolicyNamespaced {
    const API_VERSION: &'static str = "cilium.io/v1alpha1";
    const KIND: &'static str = "TracingPolicyNamespaced";
}

impl TracingPolicyNamespaced {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a policy
    pub fn new(metadata: ObjectMeta, spec: TracingPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// TracingPolicy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracingPolicySpec {
    /// Pods this policy applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<PodSelector>,
    /// Kprobe hooks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kprobes: Vec<KprobeSpec>,
    /// Tracepoint hooks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracepoints: Vec<TracepointSpec>,
    /// Uprobe hooks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uprobes: Vec<UprobeSpec>,
}

impl TracingPolicySpec {
    /// Whether no hook was compiled
    pub fn has_no_hooks(&self) -> bool {
        self.kprobes.is_empty() && self.tracepoints.is_empty() && self.uprobes.is_empty()
    }
}

/// Kprobe hook
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KprobeSpec {
    /// Function to attach to
    pub call: String,
    /// Whether `call` names a syscall
    #[serde(default, skip_serializing_if = "is_false")]
    pub syscall: bool,
    /// Arguments to extract
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<HookArg>,
    /// Selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<Selector>,
}

impl KprobeSpec {
    /// Syscall kprobe with positional argument types
    pub fn syscall(call: impl Into<String>, arg_types: &[String], selectors: Vec<Selector>) -> Self {
        Self {
            call: call.into(),
            syscall: true,
            args: HookArg::positional(arg_types),
            selectors,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !v
}

/// Tracepoint hook
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracepointSpec {
    /// Subsystem (e.g. "syscalls")
    pub subsystem: String,
    /// Event (e.g. "sys_enter_openat")
    pub event: String,
    /// Arguments to extract
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<HookArg>,
    /// Selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<Selector>,
}

/// Uprobe hook
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UprobeSpec {
    /// Binary path
    pub path: String,
    /// Symbols to attach to
    pub symbols: Vec<String>,
    /// Selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<Selector>,
}

/// Hook argument specification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HookArg {
    /// Argument index
    pub index: u32,
    /// Argument type (e.g. "int", "file", "string")
    #[serde(rename = "type")]
    pub type_: String,
}

impl HookArg {
    /// Argument specs indexed by position
    pub fn positional(types: &[String]) -> Vec<Self> {
        types
            .iter()
            .enumerate()
            .map(|(index, t)| Self {
                index: index as u32,
                type_: t.clone(),
            })
            .collect()
    }
}

/// Selector for filtering events
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Match by argument values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_args: Vec<MatchArg>,
    /// Actions to take on match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_actions: Vec<MatchAction>,
}

impl Selector {
    /// Selector taking `action` on every match
    pub fn acting(action: TracingAction) -> Self {
        Self {
            match_actions: vec![MatchAction { action }],
            ..Default::default()
        }
    }
}

/// Argument matching
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatchArg {
    /// Argument index
    pub index: u32,
    /// "Equal", "NotEqual", "Prefix", "Postfix", "Mask"
    pub operator: String,
    /// Values
    pub values: Vec<String>,
}

/// Action on match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchAction {
    /// Action
    pub action: TracingAction,
}

/// Tetragon actions
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TracingAction {
    /// Kill the process
    Sigkill,
    /// Emit an event only
    Post,
}

/// Pod selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    /// Match pods by labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}
