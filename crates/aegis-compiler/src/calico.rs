//! Calico target: one rule per peer entry

use std::collections::BTreeMap;

use tracing::debug;

use aegis_common::crd::{ActionPoint, Direction, EventResource, IntentRequest, NetPolDetail};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::calico::{
    selector_expression, CalicoPolicySpec, CalicoRule, EntityRule, HttpMatch, HttpPath, IcmpMatch,
    ServiceAccountMatch,
};
use aegis_common::policy::{Backend, BackendPolicy, CalicoNetworkPolicy};
use aegis_common::Result;

use crate::target::{
    compile_error, parse_cidr, parse_port, parse_u8, require_args, PolicyTarget, RuleSlot,
};

/// Calico's built-in namespace name label
const NAMESPACE_NAME_LABEL: &str = "projectcalico.org/name";

const BACKEND: Backend = Backend::Calico;

#[derive(Default)]
pub(crate) struct CalicoTarget {
    spec: CalicoPolicySpec,
    action: String,
    /// Rules added by the current request, as (direction, index)
    current: Vec<(Direction, usize)>,
    compiled_any: bool,
}

impl CalicoTarget {
    fn rules_mut(&mut self, direction: Direction) -> &mut Vec<CalicoRule> {
        match direction {
            Direction::Ingress => &mut self.spec.ingress,
            Direction::Egress => &mut self.spec.egress,
        }
    }

    fn push_rule(&mut self, direction: Direction, rule: CalicoRule) {
        let rules = self.rules_mut(direction);
        rules.push(rule);
        let index = rules.len() - 1;
        self.current.push((direction, index));
    }

    fn add_http(&mut self, methods: &[String], paths: &[String]) {
        let http = HttpMatch {
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            paths: paths
                .iter()
                .map(|p| HttpPath { exact: p.clone() })
                .collect(),
        };
        if self.current.is_empty() {
            let rule = CalicoRule::with_action(self.action.clone());
            self.push_rule(Direction::Ingress, rule);
        }
        for (direction, index) in self.current.clone() {
            if let Some(rule) = self.rules_mut(direction).get_mut(index) {
                rule.http = Some(http.clone());
            }
        }
    }
}

/// Fill a rule from one peer entry. `false` if the kind is not a Calico kind.
fn apply_peer(rule: &mut CalicoRule, direction: Direction, peer: &NetPolDetail) -> Result<bool> {
    let entity: &mut EntityRule = match direction {
        Direction::Ingress => &mut rule.source,
        Direction::Egress => &mut rule.destination,
    };
    match peer.kind_lower().as_str() {
        "pod" | "endpoint" => {
            if peer.labels.is_empty() {
                return Err(compile_error(
                    BACKEND,
                    format!("{} entry requires labels", peer.kind),
                ));
            }
            entity.selector = Some(selector_expression(&peer.labels));
        }
        "namespace" => {
            entity.namespace_selector = Some(if !peer.labels.is_empty() {
                selector_expression(&peer.labels)
            } else {
                let names = require_args(BACKEND, peer)?;
                names
                    .iter()
                    .map(|ns| format!("{NAMESPACE_NAME_LABEL} == '{ns}'"))
                    .collect::<Vec<_>>()
                    .join(" || ")
            });
        }
        "serviceaccounts" | "serviceaccount" => {
            if peer.args.is_empty() && peer.labels.is_empty() {
                return Err(compile_error(
                    BACKEND,
                    "serviceAccounts entry requires args or labels",
                ));
            }
            entity.service_accounts = Some(ServiceAccountMatch {
                names: peer.args.clone(),
                selector: (!peer.labels.is_empty()).then(|| selector_expression(&peer.labels)),
            });
        }
        "cidr" => {
            let cidrs = require_args(BACKEND, peer)?;
            for cidr in cidrs {
                parse_cidr(BACKEND, cidr)?;
            }
            entity.nets = cidrs.to_vec();
        }
        "protocol" => {
            let protocol = if peer.protocol.is_empty() {
                require_args(BACKEND, peer)?[0].clone()
            } else {
                peer.protocol.clone()
            };
            rule.protocol = Some(protocol.to_ascii_uppercase());
        }
        "port" => {
            // Ports always match on the destination side
            rule.destination.ports.push(parse_port(BACKEND, peer)?);
            rule.protocol = Some(if peer.protocol.is_empty() {
                "TCP".to_string()
            } else {
                peer.protocol.to_ascii_uppercase()
            });
        }
        "icmp" => {
            let args = require_args(BACKEND, peer)?;
            rule.protocol = Some("ICMP".to_string());
            rule.icmp = Some(IcmpMatch {
                type_: Some(parse_u8(BACKEND, "ICMP type", &args[0])?),
                code: args
                    .get(1)
                    .map(|c| parse_u8(BACKEND, "ICMP code", c))
                    .transpose()?,
            });
        }
        other => {
            debug!(kind = %other, ?direction, "peer kind not emitted by calico");
            return Ok(false);
        }
    }
    Ok(true)
}

impl PolicyTarget for CalicoTarget {
    const BACKEND: Backend = BACKEND;

    fn begin_request(
        &mut self,
        request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        // Last request wins: a Calico policy has a single selector
        self.spec.selector = selector_expression(labels);
        self.action = if request.rule.action.is_blocking() {
            "Deny".to_string()
        } else {
            "Allow".to_string()
        };
        self.current.clear();
        self.compiled_any = true;
        Ok(())
    }

    fn add_peer(&mut self, slot: RuleSlot, peer: &NetPolDetail) -> Result<()> {
        let direction = slot.direction();
        let mut rule = CalicoRule::with_action(self.action.clone());
        if apply_peer(&mut rule, direction, peer)? {
            self.push_rule(direction, rule);
        }
        Ok(())
    }

    fn add_action_point(&mut self, point: &ActionPoint) -> Result<()> {
        if let EventResource::Http(http) = &point.resource {
            self.add_http(&http.methods, &http.path);
        }
        Ok(())
    }

    fn finish(mut self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>> {
        if !self.compiled_any {
            return Ok(None);
        }
        self.spec.refresh_types();
        Ok(Some(BackendPolicy::Calico(CalicoNetworkPolicy::new(
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
            .compile(Backend::Calico, &intent(yaml))
            .await
    }

    fn calico(policy: Option<BackendPolicy>) -> CalicoNetworkPolicy {
        match policy {
            Some(BackendPolicy::Calico(p)) => p,
            other => panic!("expected a calico policy, got {other:?}"),
        }
    }

    const INTENT: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: db
  namespace: data
spec:
  intentRequest:
    - type: network
      selector:
        match:
          - matchLabels: {app: db, tier: data}
      rule:
        action: Allow
        from:
          - kind: pod
            labels: {app: api}
          - kind: namespace
            args: [monitoring]
          - kind: entities
            args: [world]
        to:
          - kind: port
            port: "5432"
          - kind: icmp
            args: ["8", "0"]
        actionPoint:
          - subType: http
            resource:
              methods: [get]
              path: [/metrics]
"#;

    #[tokio::test]
    async fn story_peers_become_calico_rules() {
        let policy = calico(compile(INTENT).await.unwrap());
        assert_eq!(policy.metadata.name, "networkpolicy-db");
        assert_eq!(policy.spec.selector, "app == 'db' && tier == 'data'");
        assert_eq!(policy.spec.types, vec!["Ingress", "Egress"]);

        // entities is not a Calico kind
        assert_eq!(policy.spec.ingress.len(), 2);
        let from_pod = &policy.spec.ingress[0];
        assert_eq!(from_pod.action, "Allow");
        assert_eq!(from_pod.source.selector.as_deref(), Some("app == 'api'"));
        assert_eq!(
            policy.spec.ingress[1].source.namespace_selector.as_deref(),
            Some("projectcalico.org/name == 'monitoring'")
        );

        let to_port = &policy.spec.egress[0];
        assert_eq!(to_port.destination.ports, vec![5432]);
        assert_eq!(to_port.protocol.as_deref(), Some("TCP"));
        let icmp = policy.spec.egress[1].icmp.as_ref().unwrap();
        assert_eq!((icmp.type_, icmp.code), (Some(8), Some(0)));
    }

    #[tokio::test]
    async fn story_http_points_attach_to_the_requests_rules() {
        let policy = calico(compile(INTENT).await.unwrap());
        for rule in policy.spec.ingress.iter().chain(policy.spec.egress.iter()) {
            let http = rule.http.as_ref().unwrap();
            assert_eq!(http.methods, vec!["GET"]);
            assert_eq!(http.paths[0].exact, "/metrics");
        }
    }

    #[tokio::test]
    async fn story_block_emits_deny_rules() {
        let yaml = INTENT.replace("action: Allow", "action: Block");
        let policy = calico(compile(&yaml).await.unwrap());
        assert!(policy
            .spec
            .ingress
            .iter()
            .chain(policy.spec.egress.iter())
            .all(|r| r.action == "Deny"));
    }

    #[tokio::test]
    async fn story_bad_cidr_fails() {
        let yaml = INTENT.replace("kind: entities\n            args: [world]", "kind: cidr\n            args: [\"300.0.0.0/8\"]");
        assert!(compile(&yaml).await.is_err());
    }
}
