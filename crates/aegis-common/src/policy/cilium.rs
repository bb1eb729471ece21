//! Cilium CiliumNetworkPolicy types
//!
//! One rule per compiled intent request. A policy with a single rule is
//! emitted under `spec`, several rules under `specs`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Cilium Network Policy for L3/L4/L7 eBPF-based network enforcement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicy {
    /// API version
    #[serde(default = "CiliumNetworkPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "CiliumNetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Single rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<CiliumRule>,
    /// Multiple rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<CiliumRule>,
}

impl HasApiResource for CiliumNetworkPolicy {
    const API_VERSION: &'static str = "cilium.io/v2";
    const KIND: &'static str = "CiliumNetworkPolicy";
}

impl CiliumNetworkPolicy {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a policy from its rules
    pub fn new(metadata: ObjectMeta, mut rules: Vec<CiliumRule>) -> Self {
        let (spec, specs) = if rules.len() == 1 {
            (rules.pop(), Vec::new())
        } else {
            (None, rules)
        };
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
            specs,
        }
    }

    /// All rules, whether under `spec` or `specs`
    pub fn rules(&self) -> impl Iterator<Item = &CiliumRule> {
        self.spec.iter().chain(self.specs.iter())
    }
}

/// One Cilium rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumRule {
    /// Endpoint selector (which pods this applies to)
    pub endpoint_selector: EndpointSelector,
    /// Allowed ingress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<CiliumIngressRule>,
    /// Allowed egress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<CiliumEgressRule>,
    /// Denied ingress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress_deny: Vec<CiliumIngressRule>,
    /// Denied egress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_deny: Vec<CiliumEgressRule>,
}

/// Endpoint selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl EndpointSelector {
    /// Selector over the given labels
    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            match_labels: labels,
        }
    }
}

/// Cilium ingress rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumIngressRule {
    /// From endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_endpoints: Vec<EndpointSelector>,
    /// From entities (world, host, cluster, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_entities: Vec<String>,
    /// From CIDRs
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "fromCIDR")]
    pub from_cidr: Vec<String>,
    /// To ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
    /// ICMP
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icmps: Vec<IcmpRule>,
}

/// Cilium egress rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEgressRule {
    /// To endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_endpoints: Vec<EndpointSelector>,
    /// To entities
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_entities: Vec<String>,
    /// To CIDRs
    /// Note: Cilium uses uppercase "CIDR" not camelCase "Cidr"
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toCIDR")]
    pub to_cidr: Vec<String>,
    /// To FQDNs
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toFQDNs")]
    pub to_fqdns: Vec<FqdnSelector>,
    /// To Kubernetes services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_services: Vec<ServiceSelector>,
    /// To ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
    /// ICMP
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icmps: Vec<IcmpRule>,
}

/// FQDN selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FqdnSelector {
    /// Exact match name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,
    /// Pattern match (supports wildcards)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
}

impl FqdnSelector {
    /// Exact-name selector
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            match_name: Some(name.into()),
            match_pattern: None,
        }
    }
}

/// Port rule with optional L7 rules
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CiliumPortRule {
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<CiliumPort>,
    /// L7 rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<L7Rules>,
}

/// Port specification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPort {
    /// Port number
    pub port: String,
    /// Protocol (TCP, UDP, ANY)
    pub protocol: String,
}

/// L7 rules attached to a port rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct L7Rules {
    /// HTTP rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRule>,
    /// DNS rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<FqdnSelector>,
}

/// HTTP method/path match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpRule {
    /// Method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Path regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// ICMP rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct IcmpRule {
    /// Fields
    pub fields: Vec<IcmpField>,
}

/// ICMP type and address family
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IcmpField {
    /// ICMP type
    #[serde(rename = "type")]
    pub type_: u8,
    /// IPv4 / IPv6
    pub family: String,
}

/// Kubernetes service reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelector {
    /// Service by name and namespace
    pub k8s_service: K8sServiceNamespace,
}

/// Service name and namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sServiceNamespace {
    /// Service name
    pub service_name: String,
    /// Namespace
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(app: &str) -> CiliumRule {
        CiliumRule {
            endpoint_selector: EndpointSelector::from_labels(BTreeMap::from([(
                "app".to_string(),
                app.to_string(),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn single_rule_is_emitted_under_spec() {
        let cnp = CiliumNetworkPolicy::new(ObjectMeta::new("cnp-web", "shop"), vec![rule("web")]);
        let json = serde_json::to_value(&cnp).unwrap();
        assert_eq!(json["apiVersion"], "cilium.io/v2");
        assert_eq!(json["spec"]["endpointSelector"]["matchLabels"]["app"], "web");
        assert!(json.get("specs").is_none());
    }

    #[test]
    fn several_rules_are_emitted_under_specs() {
        let cnp = CiliumNetworkPolicy::new(
            ObjectMeta::new("cnp-web", "shop"),
            vec![rule("web"), rule("api")],
        );
        let json = serde_json::to_value(&cnp).unwrap();
        assert!(json.get("spec").is_none());
        assert_eq!(json["specs"].as_array().unwrap().len(), 2);
        assert_eq!(cnp.rules().count(), 2);
    }

    #[test]
    fn cilium_field_spellings() {
        let egress = CiliumEgressRule {
            to_cidr: vec!["10.0.0.0/8".to_string()],
            to_fqdns: vec![FqdnSelector::name("api.example.com")],
            icmps: vec![IcmpRule {
                fields: vec![IcmpField {
                    type_: 8,
                    family: "IPv4".to_string(),
                }],
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&egress).unwrap();
        assert_eq!(json["toCIDR"][0], "10.0.0.0/8");
        assert_eq!(json["toFQDNs"][0]["matchName"], "api.example.com");
        assert_eq!(json["icmps"][0]["fields"][0]["type"], 8);

        let ingress = CiliumIngressRule {
            from_cidr: vec!["192.168.0.0/16".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&ingress).unwrap();
        assert_eq!(json["fromCIDR"][0], "192.168.0.0/16");
    }
}
