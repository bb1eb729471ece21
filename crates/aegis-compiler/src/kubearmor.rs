//! KubeArmor target: dimensions accumulate across action points

use std::collections::BTreeMap;

use tracing::debug;

use aegis_common::crd::{Action, ActionPoint, EventResource, IntentRequest, PathResource};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::kubearmor::{
    CapabilityEntry, DirectoryEntry, KubeArmorPolicySpec, PathEntry, PathMatch, PatternEntry,
    ProtocolEntry, SyscallEntry, SyscallPathEntry,
};
use aegis_common::policy::{Backend, BackendPolicy, KubeArmorPolicy};
use aegis_common::Result;

use crate::target::{compile_error, PolicyTarget};

const BACKEND: Backend = Backend::KubeArmor;

#[derive(Default)]
pub(crate) struct KubeArmorTarget {
    spec: KubeArmorPolicySpec,
    compiled_any: bool,
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Allow => "Allow",
        Action::Audit => "Audit",
        Action::Block | Action::Enforce => "Block",
    }
}

/// Append path, pattern and directory entries
fn accumulate_paths(target: &mut PathMatch, resource: &PathResource, file: bool) {
    let read_only = file && resource.read_only;
    target.match_paths.extend(resource.path.iter().map(|path| PathEntry {
        path: path.clone(),
        read_only,
    }));
    target
        .match_patterns
        .extend(resource.pattern.iter().map(|pattern| PatternEntry {
            pattern: pattern.clone(),
            read_only,
        }));
    if !resource.dir.is_empty() {
        let dir = if resource.dir.ends_with('/') {
            resource.dir.clone()
        } else {
            format!("{}/", resource.dir)
        };
        target.match_directories.push(DirectoryEntry {
            dir,
            recursive: resource.recursive,
            read_only,
        });
    }
}

impl PolicyTarget for KubeArmorTarget {
    const BACKEND: Backend = BACKEND;

    fn begin_request(
        &mut self,
        request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.spec.selector.match_labels = labels.clone();
        self.spec.action = action_name(request.rule.action).to_string();
        self.compiled_any = true;
        Ok(())
    }

    fn add_action_point(&mut self, point: &ActionPoint) -> Result<()> {
        match &point.resource {
            EventResource::Process(r) => accumulate_paths(&mut self.spec.process, r, false),
            EventResource::File(r) => accumulate_paths(&mut self.spec.file, r, true),
            EventResource::Network(r) => {
                if r.protocol.is_empty() {
                    return Err(compile_error(BACKEND, "network action point requires a protocol"));
                }
                self.spec.network.match_protocols.push(ProtocolEntry {
                    protocol: r.protocol.to_ascii_lowercase(),
                });
            }
            EventResource::Capabilities(r) => {
                if r.args.is_empty() {
                    return Err(compile_error(
                        BACKEND,
                        "capabilities action point requires args",
                    ));
                }
                self.spec
                    .capabilities
                    .match_capabilities
                    .extend(r.args.iter().map(|c| CapabilityEntry {
                        capability: c.to_ascii_lowercase(),
                    }));
            }
            EventResource::Syscalls(r) => {
                if r.args.is_empty() {
                    return Err(compile_error(BACKEND, "syscalls action point requires args"));
                }
                if r.path.is_empty() {
                    self.spec.syscalls.match_syscalls.push(SyscallEntry {
                        syscall: r.args.clone(),
                    });
                } else {
                    self.spec
                        .syscalls
                        .match_paths
                        .extend(r.path.iter().map(|path| SyscallPathEntry {
                            path: path.clone(),
                            syscall: r.args.clone(),
                        }));
                }
            }
            other => debug!(sub_type = %other.sub_type(), "action point not emitted by kubearmor"),
        }
        Ok(())
    }

    fn finish(mut self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>> {
        if !self.compiled_any {
            return Ok(None);
        }
        self.spec.apply_defaults();
        Ok(Some(BackendPolicy::KubeArmor(KubeArmorPolicy::new(
            metadata, self.spec,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{intent, StaticPods};
    use crate::PolicyCompiler;

    use super::*;

    async fn compile(yaml: &str) -> Result<Option<BackendPolicy>> {
        PolicyCompiler::new(StaticPods::resolver(vec![]))
            .compile(Backend::KubeArmor, &intent(yaml))
            .await
    }

    fn ksp(policy: Option<BackendPolicy>) -> KubeArmorPolicy {
        match policy {
            Some(BackendPolicy::KubeArmor(p)) => p,
            other => panic!("expected a kubearmor policy, got {other:?}"),
        }
    }

    const INTENT: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: harden
  namespace: shop
spec:
  intentRequest:
    - type: system
      selector:
        match:
          - matchLabels: {app: web}
      rule:
        action: Enforce
        actionPoint:
          - subType: process
            resource:
              path: [/bin/sh]
          - subType: process
            resource:
              path: [/usr/bin/curl]
              pattern: ["/tmp/*"]
          - subType: file
            resource:
              dir: /etc/secret
              recursive: true
              readOnly: true
          - subType: syscalls
            resource:
              args: [unlink]
              path: [/var/log/app.log]
"#;

    #[tokio::test]
    async fn story_dimensions_accumulate_instead_of_overwriting() {
        let policy = ksp(compile(INTENT).await.unwrap());
        assert_eq!(policy.metadata.name, "ksp-harden");
        assert_eq!(policy.spec.action, "Block");
        let paths: Vec<&str> = policy
            .spec
            .process
            .match_paths
            .iter()
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/bin/sh", "/usr/bin/curl"]);
        assert_eq!(policy.spec.process.match_patterns[0].pattern, "/tmp/*");

        let dir = &policy.spec.file.match_directories[0];
        assert_eq!(dir.dir, "/etc/secret/");
        assert!(dir.recursive && dir.read_only);
        assert_eq!(policy.spec.syscalls.match_paths[0].syscall, vec!["unlink"]);
    }

    #[tokio::test]
    async fn story_empty_network_and_capabilities_get_defaults() {
        let policy = ksp(compile(INTENT).await.unwrap());
        assert_eq!(policy.spec.network.match_protocols[0].protocol, "raw");
        assert_eq!(
            policy.spec.capabilities.match_capabilities[0].capability,
            "lease"
        );
    }

    #[tokio::test]
    async fn story_declared_network_protocol_suppresses_default() {
        let yaml = format!(
            "{INTENT}          - subType: network\n            resource:\n              protocol: TCP\n"
        );
        let policy = ksp(compile(&yaml).await.unwrap());
        let protocols: Vec<&str> = policy
            .spec
            .network
            .match_protocols
            .iter()
            .map(|p| p.protocol.as_str())
            .collect();
        assert_eq!(protocols, vec!["tcp"]);
    }

    #[tokio::test]
    async fn story_network_point_without_protocol_fails() {
        let yaml = format!("{INTENT}          - subType: network\n");
        assert!(compile(&yaml).await.is_err());
    }
}
