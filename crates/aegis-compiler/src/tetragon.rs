//! Tetragon target: kernel hooks from kprobe, tracepoint and uprobe points

use std::collections::BTreeMap;

use tracing::debug;

use aegis_common::crd::{ActionPoint, EventFilter, EventResource, IntentRequest};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::tetragon::{
    HookArg, KprobeSpec, MatchArg, PodSelector, Selector, TracepointSpec, TracingAction,
    TracingPolicySpec, UprobeSpec,
};
use aegis_common::policy::{Backend, BackendPolicy, TracingPolicyNamespaced};
use aegis_common::Result;

use crate::target::{compile_error, PolicyTarget};

const BACKEND: Backend = Backend::Tetragon;

pub(crate) struct TetragonTarget {
    spec: TracingPolicySpec,
    action: TracingAction,
}

impl Default for TetragonTarget {
    fn default() -> Self {
        Self {
            spec: TracingPolicySpec::default(),
            action: TracingAction::Post,
        }
    }
}

impl TetragonTarget {
    /// Selector list for one hook: argument filters plus the request's action
    fn selectors(&self, conditions: &[EventFilter]) -> Result<Vec<Selector>> {
        let mut selector = Selector::acting(self.action);
        selector.match_args = conditions
            .iter()
            .map(match_arg)
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![selector])
    }
}

/// Condition keyed by argument index
fn match_arg(filter: &EventFilter) -> Result<MatchArg> {
    let index = filter.key.trim().parse::<u32>().map_err(|_| {
        compile_error(
            BACKEND,
            format!("condition key {:?} is not an argument index", filter.key),
        )
    })?;
    Ok(MatchArg {
        index,
        operator: if filter.operator.is_empty() {
            "Equal".to_string()
        } else {
            filter.operator.clone()
        },
        values: filter.value.clone(),
    })
}

impl PolicyTarget for TetragonTarget {
    const BACKEND: Backend = BACKEND;

    fn begin_request(
        &mut self,
        request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.spec.pod_selector = Some(PodSelector {
            match_labels: labels.clone(),
        });
        self.action = if request.rule.action.is_blocking() {
            TracingAction::Sigkill
        } else {
            TracingAction::Post
        };
        Ok(())
    }

    fn add_action_point(&mut self, point: &ActionPoint) -> Result<()> {
        match &point.resource {
            EventResource::Kprobe(kprobe) => {
                let calls: Vec<&str> = kprobe
                    .syscall
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                if calls.is_empty() {
                    return Err(compile_error(BACKEND, "kprobe action point requires a syscall"));
                }
                let selectors = self.selectors(&point.conditions)?;
                for call in calls {
                    self.spec.kprobes.push(KprobeSpec::syscall(
                        call,
                        &kprobe.args,
                        selectors.clone(),
                    ));
                }
            }
            EventResource::Tracepoint(tp) => {
                if tp.subsystem.is_empty() || tp.event.is_empty() {
                    return Err(compile_error(
                        BACKEND,
                        "tracepoint action point requires subsystem and event",
                    ));
                }
                let selectors = self.selectors(&point.conditions)?;
                self.spec.tracepoints.push(TracepointSpec {
                    subsystem: tp.subsystem.clone(),
                    event: tp.event.clone(),
                    args: HookArg::positional(&tp.args),
                    selectors,
                });
            }
            EventResource::Uprobes(uprobe) => {
                if uprobe.symbol.is_empty() {
                    return Err(compile_error(BACKEND, "uprobes action point requires a symbol"));
                }
                if uprobe.path.is_empty() {
                    return Err(compile_error(BACKEND, "uprobes action point requires a path"));
                }
                let selectors = self.selectors(&point.conditions)?;
                for path in &uprobe.path {
                    self.spec.uprobes.push(UprobeSpec {
                        path: path.clone(),
                        symbols: vec![uprobe.symbol.clone()],
                        selectors: selectors.clone(),
                    });
                }
            }
            other => debug!(sub_type = %other.sub_type(), "action point not emitted by tetragon"),
        }
        Ok(())
    }

    fn finish(self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>> {
        if self.spec.has_no_hooks() {
            return Ok(None);
        }
        Ok(Some(BackendPolicy::Tetragon(TracingPolicyNamespaced::new(
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
            .compile(Backend::Tetragon, &intent(yaml))
            .await
    }

    fn tracing(policy: Option<BackendPolicy>) -> TracingPolicyNamespaced {
        match policy {
            Some(BackendPolicy::Tetragon(p)) => p,
            other => panic!("expected a tracing policy, got {other:?}"),
        }
    }

    const INTENT: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: trace
  namespace: shop
spec:
  intentRequest:
    - type: system
      selector:
        match:
          - matchLabels: {app: web}
      rule:
        action: Block
        actionPoint:
          - subType: kprobe
            resource:
              syscall: "sys_openat, sys_unlinkat"
              args: [int, string]
            conditions:
              - key: "1"
                operator: Prefix
                value: [/etc/]
          - subType: tracepoint
            resource:
              subsystem: syscalls
              event: sys_enter_execve
          - subType: uprobes
            resource:
              path: [/usr/bin/bash, /bin/sh]
              symbol: readline
          - subType: process
            resource:
              path: [/bin/sh]
"#;

    #[tokio::test]
    async fn story_each_syscall_becomes_its_own_kprobe() {
        let policy = tracing(compile(INTENT).await.unwrap());
        assert_eq!(policy.metadata.name, "tracingpolicynamespaced-trace");
        assert_eq!(
            policy.spec.pod_selector.as_ref().unwrap().match_labels.get("app"),
            Some(&"web".to_string())
        );

        let calls: Vec<&str> = policy.spec.kprobes.iter().map(|k| k.call.as_str()).collect();
        assert_eq!(calls, vec!["sys_openat", "sys_unlinkat"]);
        let kprobe = &policy.spec.kprobes[0];
        assert!(kprobe.syscall);
        assert_eq!(kprobe.args[1].type_, "string");

        let selector = &kprobe.selectors[0];
        assert_eq!(selector.match_actions[0].action, TracingAction::Sigkill);
        assert_eq!(selector.match_args[0].index, 1);
        assert_eq!(selector.match_args[0].values, vec!["/etc/"]);
    }

    #[tokio::test]
    async fn story_tracepoints_and_uprobes_are_emitted() {
        let policy = tracing(compile(INTENT).await.unwrap());
        assert_eq!(policy.spec.tracepoints[0].event, "sys_enter_execve");
        let paths: Vec<&str> = policy.spec.uprobes.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["/usr/bin/bash", "/bin/sh"]);
        assert_eq!(policy.spec.uprobes[0].symbols, vec!["readline"]);
    }

    #[tokio::test]
    async fn story_non_blocking_actions_only_post_events() {
        let yaml = INTENT.replace("action: Block", "action: Audit");
        let policy = tracing(compile(&yaml).await.unwrap());
        assert_eq!(
            policy.spec.tracepoints[0].selectors[0].match_actions[0].action,
            TracingAction::Post
        );
    }

    #[tokio::test]
    async fn story_missing_hook_fields_fail() {
        let no_event = INTENT.replace("event: sys_enter_execve", "event: \"\"");
        assert!(compile(&no_event).await.is_err());

        let no_symbol = INTENT.replace("symbol: readline", "symbol: \"\"");
        assert!(compile(&no_symbol).await.is_err());

        let bad_key = INTENT.replace("key: \"1\"", "key: path");
        assert!(compile(&bad_key).await.is_err());
    }

    #[tokio::test]
    async fn story_no_hooks_means_no_policy() {
        let yaml = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: files
  namespace: shop
spec:
  intentRequest:
    - type: system
      selector:
        match:
          - matchLabels: {app: web}
      rule:
        action: Block
        actionPoint:
          - subType: file
            resource:
              path: [/etc/passwd]
"#;
        assert!(compile(yaml).await.unwrap().is_none());
    }
}
