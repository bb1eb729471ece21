//! Cilium target: one CiliumNetworkPolicy rule per request

use std::collections::BTreeMap;

use tracing::debug;

use aegis_common::crd::{Direction, IntentRequest, NetPolDetail};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::cilium::{
    CiliumEgressRule, CiliumIngressRule, CiliumPort, CiliumPortRule, CiliumRule, EndpointSelector,
    FqdnSelector, HttpRule, IcmpField, IcmpRule, K8sServiceNamespace, L7Rules, ServiceSelector,
};
use aegis_common::policy::{Backend, BackendPolicy, CiliumNetworkPolicy};
use aegis_common::Result;

use crate::target::{
    compile_error, parse_cidr, parse_port, parse_u8, require_args, PolicyTarget, RuleSlot,
};

/// Label Cilium sets to a pod's namespace
const NAMESPACE_LABEL: &str = "k8s:io.kubernetes.pod.namespace";

/// Prefix Cilium gives namespace labels on endpoints
const NAMESPACE_LABELS_PREFIX: &str = "k8s:io.cilium.k8s.namespace.labels.";

const BACKEND: Backend = Backend::Cilium;

#[derive(Default)]
pub(crate) struct CiliumTarget {
    rules: Vec<CiliumRule>,
    current: Option<CiliumRule>,
}

/// What one peer entry compiles to
enum CiliumPeer {
    Endpoints(Vec<EndpointSelector>),
    Entities(Vec<String>),
    Cidrs(Vec<String>),
    Ports(CiliumPortRule),
    Fqdns(Vec<FqdnSelector>),
    Icmp(IcmpRule),
    Service(ServiceSelector),
}

impl CiliumPeer {
    fn from_detail(direction: Direction, peer: &NetPolDetail) -> Result<Option<Self>> {
        let egress = direction == Direction::Egress;
        let compiled = match peer.kind_lower().as_str() {
            "pod" | "endpoint" => {
                if peer.labels.is_empty() {
                    return Err(compile_error(
                        BACKEND,
                        format!("{} entry requires labels", peer.kind),
                    ));
                }
                CiliumPeer::Endpoints(vec![EndpointSelector::from_labels(peer.labels.clone())])
            }
            "namespace" => CiliumPeer::Endpoints(namespace_selectors(peer)?),
            "entities" | "entity" => CiliumPeer::Entities(require_args(BACKEND, peer)?.to_vec()),
            "cidr" => {
                let cidrs = require_args(BACKEND, peer)?;
                for cidr in cidrs {
                    parse_cidr(BACKEND, cidr)?;
                }
                CiliumPeer::Cidrs(cidrs.to_vec())
            }
            "port" => CiliumPeer::Ports(CiliumPortRule {
                ports: vec![port_of(peer, parse_port(BACKEND, peer)?, "ANY")],
                rules: None,
            }),
            "fqdn" if egress => CiliumPeer::Fqdns(
                require_args(BACKEND, peer)?
                    .iter()
                    .map(FqdnSelector::name)
                    .collect(),
            ),
            "icmp" => {
                let args = require_args(BACKEND, peer)?;
                CiliumPeer::Icmp(IcmpRule {
                    fields: vec![IcmpField {
                        type_: parse_u8(BACKEND, "ICMP type", &args[0])?,
                        family: args.get(1).cloned().unwrap_or_else(|| "IPv4".to_string()),
                    }],
                })
            }
            "dns" if egress => CiliumPeer::Ports(CiliumPortRule {
                ports: vec![CiliumPort {
                    port: "53".to_string(),
                    protocol: "ANY".to_string(),
                }],
                rules: Some(L7Rules {
                    dns: require_args(BACKEND, peer)?
                        .iter()
                        .map(FqdnSelector::name)
                        .collect(),
                    ..Default::default()
                }),
            }),
            kind @ ("http" | "https") => {
                let args = require_args(BACKEND, peer)?;
                let port = if peer.port.is_empty() {
                    if kind == "https" {
                        443
                    } else {
                        80
                    }
                } else {
                    parse_port(BACKEND, peer)?
                };
                CiliumPeer::Ports(CiliumPortRule {
                    ports: vec![port_of(peer, port, "TCP")],
                    rules: Some(L7Rules {
                        http: vec![HttpRule {
                            method: Some(args[0].to_ascii_uppercase()),
                            path: args.get(1).cloned(),
                        }],
                        ..Default::default()
                    }),
                })
            }
            "service" if egress => {
                let args = require_args(BACKEND, peer)?;
                let [service_name, namespace, ..] = args else {
                    return Err(compile_error(
                        BACKEND,
                        "service entry requires a name and a namespace",
                    ));
                };
                CiliumPeer::Service(ServiceSelector {
                    k8s_service: K8sServiceNamespace {
                        service_name: service_name.clone(),
                        namespace: namespace.clone(),
                    },
                })
            }
            other => {
                debug!(kind = %other, ?direction, "peer kind not emitted by cilium");
                return Ok(None);
            }
        };
        Ok(Some(compiled))
    }

    fn into_ingress(self) -> Option<CiliumIngressRule> {
        let mut rule = CiliumIngressRule::default();
        match self {
            CiliumPeer::Endpoints(e) => rule.from_endpoints = e,
            CiliumPeer::Entities(e) => rule.from_entities = e,
            CiliumPeer::Cidrs(c) => rule.from_cidr = c,
            CiliumPeer::Ports(p) => rule.to_ports = vec![p],
            CiliumPeer::Icmp(i) => rule.icmps = vec![i],
            CiliumPeer::Fqdns(_) | CiliumPeer::Service(_) => return None,
        }
        Some(rule)
    }

    fn into_egress(self) -> CiliumEgressRule {
        let mut rule = CiliumEgressRule::default();
        match self {
            CiliumPeer::Endpoints(e) => rule.to_endpoints = e,
            CiliumPeer::Entities(e) => rule.to_entities = e,
            CiliumPeer::Cidrs(c) => rule.to_cidr = c,
            CiliumPeer::Ports(p) => rule.to_ports = vec![p],
            CiliumPeer::Fqdns(f) => rule.to_fqdns = f,
            CiliumPeer::Icmp(i) => rule.icmps = vec![i],
            CiliumPeer::Service(s) => rule.to_services = vec![s],
        }
        rule
    }
}

fn port_of(peer: &NetPolDetail, port: u16, default_protocol: &str) -> CiliumPort {
    CiliumPort {
        port: port.to_string(),
        protocol: if peer.protocol.is_empty() {
            default_protocol.to_string()
        } else {
            peer.protocol.to_ascii_uppercase()
        },
    }
}

/// Namespace peers: by name from `args`, or by namespace labels
fn namespace_selectors(peer: &NetPolDetail) -> Result<Vec<EndpointSelector>> {
    if !peer.args.is_empty() {
        return Ok(peer
            .args
            .iter()
            .map(|ns| {
                EndpointSelector::from_labels(BTreeMap::from([(
                    NAMESPACE_LABEL.to_string(),
                    ns.clone(),
                )]))
            })
            .collect());
    }
    if !peer.labels.is_empty() {
        let labels = peer
            .labels
            .iter()
            .map(|(k, v)| (format!("{NAMESPACE_LABELS_PREFIX}{k}"), v.clone()))
            .collect();
        return Ok(vec![EndpointSelector::from_labels(labels)]);
    }
    Err(compile_error(
        BACKEND,
        "namespace entry requires args or labels",
    ))
}

impl PolicyTarget for CiliumTarget {
    const BACKEND: Backend = BACKEND;

    fn begin_request(
        &mut self,
        _request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.current = Some(CiliumRule {
            endpoint_selector: EndpointSelector::from_labels(labels.clone()),
            ..Default::default()
        });
        Ok(())
    }

    fn add_peer(&mut self, slot: RuleSlot, peer: &NetPolDetail) -> Result<()> {
        let Some(rule) = self.current.as_mut() else {
            return Ok(());
        };
        let Some(compiled) = CiliumPeer::from_detail(slot.direction(), peer)? else {
            return Ok(());
        };
        match slot {
            RuleSlot::IngressAllow => rule.ingress.extend(compiled.into_ingress()),
            RuleSlot::IngressDeny => rule.ingress_deny.extend(compiled.into_ingress()),
            RuleSlot::EgressAllow => rule.egress.push(compiled.into_egress()),
            RuleSlot::EgressDeny => rule.egress_deny.push(compiled.into_egress()),
        }
        Ok(())
    }

    fn end_request(&mut self) -> Result<()> {
        self.rules.extend(self.current.take());
        Ok(())
    }

    fn finish(self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>> {
        if self.rules.is_empty() {
            return Ok(None);
        }
        Ok(Some(BackendPolicy::Cilium(CiliumNetworkPolicy::new(
            metadata, self.rules,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use aegis_common::policy::Backend;

    use crate::testing::{intent, StaticPods};
    use crate::PolicyCompiler;

    use super::*;

    async fn compile(rule: &str) -> Result<Option<BackendPolicy>> {
        let yaml = format!(
            r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: web
  namespace: ns1
spec:
  intentRequest:
    - type: network
      selector:
        match:
          - kind: Pod
            namespace: ns1
            matchLabels:
              app: web
      rule:
{rule}
"#
        );
        PolicyCompiler::new(StaticPods::resolver(vec![]))
            .compile(Backend::Cilium, &intent(&yaml))
            .await
    }

    fn cnp(policy: Option<BackendPolicy>) -> CiliumNetworkPolicy {
        match policy {
            Some(BackendPolicy::Cilium(p)) => p,
            other => panic!("expected a cilium policy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn story_allow_to_port_becomes_egress_to_ports() {
        let policy = cnp(compile(
            r#"        action: Allow
        to:
          - kind: port
            port: "443"
            protocol: tcp"#,
        )
        .await
        .unwrap());
        assert_eq!(policy.metadata.name, "cnp-web");
        let rule = policy.spec.as_ref().unwrap();
        assert_eq!(rule.endpoint_selector.match_labels["app"], "web");
        let port = &rule.egress[0].to_ports[0].ports[0];
        assert_eq!((port.port.as_str(), port.protocol.as_str()), ("443", "TCP"));
        assert!(rule.egress_deny.is_empty());
    }

    #[tokio::test]
    async fn story_block_routes_to_deny_lists() {
        let policy = cnp(compile(
            r#"        action: Block
        from:
          - kind: cidr
            args: ["10.0.0.0/8"]
        to:
          - kind: entities
            args: ["world"]"#,
        )
        .await
        .unwrap());
        let rule = policy.spec.as_ref().unwrap();
        assert_eq!(rule.ingress_deny[0].from_cidr, vec!["10.0.0.0/8"]);
        assert_eq!(rule.egress_deny[0].to_entities, vec!["world"]);
        assert!(rule.ingress.is_empty() && rule.egress.is_empty());
    }

    #[tokio::test]
    async fn story_l7_and_namespace_peers() {
        let policy = cnp(compile(
            r#"        action: Allow
        from:
          - kind: namespace
            args: ["monitoring"]
        to:
          - kind: fqdn
            args: ["api.example.com"]
          - kind: dns
            args: ["example.com"]
          - kind: http
            args: ["get", "/healthz"]
            port: "8080"
          - kind: service
            args: ["db", "data"]
          - kind: icmp
            args: ["8"]"#,
        )
        .await
        .unwrap());
        let rule = policy.spec.as_ref().unwrap();
        assert_eq!(
            rule.ingress[0].from_endpoints[0].match_labels[NAMESPACE_LABEL],
            "monitoring"
        );
        assert_eq!(
            rule.egress[0].to_fqdns[0].match_name.as_deref(),
            Some("api.example.com")
        );
        let dns = &rule.egress[1].to_ports[0];
        assert_eq!(dns.ports[0].port, "53");
        assert_eq!(
            dns.rules.as_ref().unwrap().dns[0].match_name.as_deref(),
            Some("example.com")
        );
        let http = &rule.egress[2].to_ports[0];
        assert_eq!(http.ports[0].port, "8080");
        assert_eq!(http.rules.as_ref().unwrap().http[0].method.as_deref(), Some("GET"));
        assert_eq!(rule.egress[3].to_services[0].k8s_service.service_name, "db");
        assert_eq!(rule.egress[4].icmps[0].fields[0].family, "IPv4");
    }

    #[tokio::test]
    async fn story_unknown_kind_is_skipped_not_failed() {
        let policy = cnp(compile(
            r#"        action: Allow
        to:
          - kind: serviceAccounts
            args: ["builder"]"#,
        )
        .await
        .unwrap());
        assert!(policy.spec.as_ref().unwrap().egress.is_empty());
    }

    #[tokio::test]
    async fn story_malformed_entries_fail_compilation() {
        for rule in [
            "        action: Allow\n        to:\n          - kind: cidr\n            args: [\"10.0.0.0\"]",
            "        action: Allow\n        to:\n          - kind: pod",
            "        action: Allow\n        to:\n          - kind: icmp\n            args: [\"echo\"]",
            "        action: Allow\n        to:\n          - kind: service\n            args: [\"db\"]",
        ] {
            assert!(compile(rule).await.is_err(), "{rule}");
        }
    }

    #[tokio::test]
    async fn story_several_requests_emit_specs() {
        let yaml = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: two
  namespace: ns1
spec:
  intentRequest:
    - type: network
      selector:
        match:
          - matchLabels: {app: web}
      rule:
        action: Allow
        to: [{kind: port, port: "80"}]
    - type: network
      selector:
        match:
          - matchLabels: {app: api}
      rule:
        action: Block
        to: [{kind: port, port: "22"}]
"#;
        let policy = cnp(PolicyCompiler::new(StaticPods::resolver(vec![]))
            .compile(Backend::Cilium, &intent(yaml))
            .await
            .unwrap());
        assert!(policy.spec.is_none());
        assert_eq!(policy.specs.len(), 2);
        assert_eq!(policy.specs[1].egress_deny[0].to_ports[0].ports[0].protocol, "ANY");
    }
}
