//! KubeArmor host-security policy types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Protocol injected when no network rule was compiled
pub const DEFAULT_PROTOCOL: &str = "raw";

/// Capability injected when no capability rule was compiled
pub const DEFAULT_CAPABILITY: &str = "lease";

/// KubeArmorPolicy (`security.kubearmor.com/v1`)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeArmorPolicy {
    /// API version
    #[serde(default = "KubeArmorPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "KubeArmorPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: KubeArmorPolicySpec,
}

impl HasApiResource for KubeArmorPolicy {
    const API_VERSION: &'static str = "security.kubearmor.com/v1";
    const KIND: &'static str = "KubeArmorPolicy";
}

impl KubeArmorPolicy {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a policy
    pub fn new(metadata: ObjectMeta, spec: KubeArmorPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// KubeArmor policy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeArmorPolicySpec {
    /// Target pods
    pub selector: KubeArmorSelector,
    /// Process rules
    #[serde(default, skip_serializing_if = "PathMatch::is_empty")]
    pub process: PathMatch,
    /// File rules
    #[serde(default, skip_serializing_if = "PathMatch::is_empty")]
    pub file: PathMatch,
    /// Network rules
    pub network: NetworkMatch,
    /// Capability rules
    pub capabilities: CapabilityMatch,
    /// Syscall rules
    #[serde(default, skip_serializing_if = "SyscallMatch::is_empty")]
    pub syscalls: SyscallMatch,
    /// Allow, Audit or Block
    pub action: String,
}

impl KubeArmorPolicySpec {
    /// Fill dimensions KubeArmor refuses to accept empty
    pub fn apply_defaults(&mut self) {
        if self.network.match_protocols.is_empty() {
            self.network.match_protocols.push(ProtocolEntry {
                protocol: DEFAULT_PROTOCOL.to_string(),
            });
        }
        if self.capabilities.match_capabilities.is_empty() {
            self.capabilities.match_capabilities.push(CapabilityEntry {
                capability: DEFAULT_CAPABILITY.to_string(),
            });
        }
    }
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeArmorSelector {
    /// Match labels
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Process or file match lists
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    /// Exact paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_paths: Vec<PathEntry>,
    /// Glob patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_patterns: Vec<PatternEntry>,
    /// Directories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_directories: Vec<DirectoryEntry>,
}

impl PathMatch {
    /// Whether no entries were accumulated
    pub fn is_empty(&self) -> bool {
        self.match_paths.is_empty()
            && self.match_patterns.is_empty()
            && self.match_directories.is_empty()
    }
}

/// Exact path entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathEntry {
    /// Path
    pub path: String,
    /// Read-only access only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// Pattern entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternEntry {
    /// Glob pattern
    pub pattern: String,
    /// Read-only access only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// Directory entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    /// Directory, with trailing slash
    pub dir: String,
    /// Include subdirectories
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
    /// Read-only access only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// Network match list
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMatch {
    /// Protocols
    pub match_protocols: Vec<ProtocolEntry>,
}

/// Protocol entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEntry {
    /// Protocol (tcp, udp, icmp, raw)
    pub protocol: String,
}

/// Capability match list
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMatch {
    /// Capabilities
    pub match_capabilities: Vec<CapabilityEntry>,
}

/// Capability entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapabilityEntry {
    /// Capability name
    pub capability: String,
}

/// Syscall match lists
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyscallMatch {
    /// Syscalls by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_syscalls: Vec<SyscallEntry>,
    /// Syscalls scoped to paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_paths: Vec<SyscallPathEntry>,
}

impl SyscallMatch {
    /// Whether no entries were accumulated
    pub fn is_empty(&self) -> bool {
        self.match_syscalls.is_empty() && self.match_paths.is_empty()
    }
}

/// Syscall entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SyscallEntry {
    /// Syscall names
    pub syscall: Vec<String>,
}

/// Syscall-on-path entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SyscallPathEntry {
    /// Path
    pub path: String,
    /// Syscall names
    pub syscall: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_only_empty_dimensions() {
        let mut spec = KubeArmorPolicySpec {
            network: NetworkMatch {
                match_protocols: vec![ProtocolEntry {
                    protocol: "tcp".to_string(),
                }],
            },
            ..Default::default()
        };
        spec.apply_defaults();
        assert_eq!(spec.network.match_protocols.len(), 1);
        assert_eq!(spec.network.match_protocols[0].protocol, "tcp");
        assert_eq!(spec.capabilities.match_capabilities[0].capability, "lease");
    }

    #[test]
    fn empty_process_and_file_are_omitted() {
        let mut spec = KubeArmorPolicySpec {
            action: "Block".to_string(),
            ..Default::default()
        };
        spec.apply_defaults();
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("process").is_none());
        assert!(json.get("file").is_none());
        assert_eq!(json["network"]["matchProtocols"][0]["protocol"], "raw");
    }
}
