//! Stage two: per-type preconditions

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use aegis_common::crd::{
    Direction, EventResource, IntentRequest, IntentType, KubeAegisPolicy, NetPolDetail,
};
use aegis_common::{Error, Result};
use aegis_selector::pod_labels;

use crate::existence::describe;
use crate::report::ValidationFailure;
use crate::validator::{request_field, IntentValidator};

/// Protocols a network peer may declare
const PROTOCOLS: [&str; 3] = ["TCP", "UDP", "ICMP"];

/// System calls that kprobe and tracepoint hooks may name
pub const SYSCALL_ALLOW_LIST: &[&str] = &[
    "open", "openat", "openat2", "read", "write", "close", "unlink", "unlinkat", "rmdir",
    "mkdir", "mkdirat", "rename", "renameat", "execve", "execveat", "connect", "accept",
    "bind", "listen", "mount", "umount", "ptrace", "setuid", "chmod", "fchmodat", "chown",
    "kill",
];

const SYSCALL_PREFIXES: [&str; 3] = ["__x64_sys_", "__arm64_sys_", "sys_"];

/// Parse CIDR notation; a bare address is rejected
pub fn validate_cidr(cidr: &str) -> Result<IpNetwork> {
    if !cidr.contains('/') {
        return Err(Error::validation(format!(
            "invalid CIDR: {cidr} (missing prefix length)"
        )));
    }
    cidr.parse::<IpNetwork>()
        .map_err(|e| Error::validation(format!("invalid CIDR: {cidr} ({e})")))
}

/// Whether a kernel symbol names an allowed system call
fn syscall_allowed(name: &str) -> bool {
    let name = name.trim();
    let bare = SYSCALL_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name);
    SYSCALL_ALLOW_LIST.contains(&bare)
}

impl IntentValidator {
    pub(crate) async fn check_preconditions(
        &self,
        intent: &KubeAegisPolicy,
    ) -> Result<Vec<ValidationFailure>> {
        let default_ns = intent.namespace_or_default();
        let mut failures = Vec::new();

        for (index, request) in intent.spec.intent_requests.iter().enumerate() {
            let field = request_field(index);
            match request.type_ {
                IntentType::Network => {
                    failures.extend(self.check_network(request, &field, &default_ns).await?)
                }
                IntentType::System => failures.extend(self.check_system(request, &field).await),
                IntentType::Cluster => {
                    failures.extend(self.check_cluster(request, &field, &default_ns).await?)
                }
            }
        }
        Ok(failures)
    }

    async fn check_network(
        &self,
        request: &IntentRequest,
        field: &str,
        default_ns: &str,
    ) -> Result<Vec<ValidationFailure>> {
        let namespace = request.target_namespace(default_ns);
        let labels = self.resolver.resolve(&request.selector, namespace).await?;
        if labels.is_empty() {
            return Ok(vec![ValidationFailure::new(
                format!("{field}.selector"),
                "no matches found in the selector",
            )]);
        }

        let mut failures = Vec::new();
        let mut pods: Option<Vec<Pod>> = None;
        let mut counters = [0usize; 2];

        for (direction, peer) in request.rule.peers() {
            let slot = match direction {
                Direction::Ingress => 0,
                Direction::Egress => 1,
            };
            let position = counters[slot];
            counters[slot] += 1;
            let side = match direction {
                Direction::Ingress => "from",
                Direction::Egress => "to",
            };
            let peer_field = format!("{field}.rule.{side}[{position}]");

            failures.extend(check_cidrs(peer, &peer_field));

            let Some((port, protocol)) = check_port(peer, &peer_field, &mut failures) else {
                continue;
            };

            if pods.is_none() {
                pods = Some(self.resolver.pods().list_pods(namespace, &labels).await?);
            }
            let selected = pods.as_deref().unwrap_or_default();
            if selected.is_empty() {
                failures.push(ValidationFailure::new(
                    format!("{field}.selector"),
                    format!("no pods found matching the selector in namespace {namespace}"),
                ));
                continue;
            }
            if !selected.iter().any(|pod| listens_on(pod, port, &protocol)) {
                failures.push(ValidationFailure::new(
                    format!("{peer_field}.port"),
                    format!(
                        "no containers found in namespace {namespace} with labels {} \
                         listening on the expected port {port} with protocol {protocol}",
                        describe(&labels)
                    ),
                ));
            }
        }
        Ok(failures)
    }

    async fn check_system(&self, request: &IntentRequest, field: &str) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        for (index, point) in request.rule.action_points.iter().enumerate() {
            let point_field = format!("{field}.rule.actionPoint[{index}].resource");
            let mut paths: Vec<&str> = Vec::new();

            match &point.resource {
                EventResource::Process(resource) | EventResource::File(resource) => {
                    paths.extend(resource.path.iter().map(String::as_str));
                    if !resource.dir.is_empty() {
                        paths.push(&resource.dir);
                    }
                }
                EventResource::Syscalls(resource) => {
                    paths.extend(resource.path.iter().map(String::as_str));
                }
                EventResource::Uprobes(resource) => {
                    if resource.symbol.trim().is_empty() {
                        failures.push(ValidationFailure::new(
                            format!("{point_field}.symbol"),
                            "missing required symbol for uprobes point",
                        ));
                    }
                    paths.extend(resource.path.iter().map(String::as_str));
                }
                EventResource::Kprobe(resource) => {
                    let names: Vec<&str> = resource
                        .syscall
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect();
                    if names.is_empty() {
                        failures.push(ValidationFailure::new(
                            format!("{point_field}.syscall"),
                            "kprobe point names no system call",
                        ));
                    }
                    failures.extend(check_syscalls(&names, &point_field));
                }
                EventResource::Tracepoint(resource) => {
                    let names: Vec<&str> = resource
                        .syscall
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect();
                    failures.extend(check_syscalls(&names, &point_field));
                }
                other => debug!(sub_type = %other.sub_type(), "no system preconditions"),
            }

            for path in paths.into_iter().filter(|p| !p.is_empty()) {
                if !self.paths.exists(path).await {
                    failures.push(ValidationFailure::new(
                        format!("{point_field}.path"),
                        format!("file or directory does not exist: {path}"),
                    ));
                }
            }
        }
        failures
    }

    async fn check_cluster(
        &self,
        request: &IntentRequest,
        field: &str,
        default_ns: &str,
    ) -> Result<Vec<ValidationFailure>> {
        let namespace = request.target_namespace(default_ns);
        let mut failures = Vec::new();
        let mut pods: Option<Vec<Pod>> = None;

        for (index, point) in request.rule.action_points.iter().enumerate() {
            let point_field = format!("{field}.rule.actionPoint[{index}].resource");
            match &point.resource {
                EventResource::Validate(resource) => {
                    let Some(metadata) = metadata_kind(&resource.kind) else {
                        continue;
                    };
                    let expected: BTreeMap<&str, &str> = resource
                        .details
                        .iter()
                        .flatten()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect();

                    if pods.is_none() {
                        let labels = self.resolver.resolve(&request.selector, namespace).await?;
                        pods = Some(self.resolver.pods().list_pods(namespace, &labels).await?);
                    }
                    for pod in pods.as_deref().unwrap_or_default() {
                        failures.extend(check_pod_metadata(
                            pod,
                            namespace,
                            metadata,
                            &expected,
                            &point_field,
                        ));
                    }
                }
                EventResource::VerifyImage(resource) => {
                    for image in resource.images() {
                        match self.images.image_exists(image).await {
                            Ok(true) => {}
                            Ok(false) => failures.push(ValidationFailure::new(
                                format!("{point_field}.details"),
                                format!("image {image} does not exist"),
                            )),
                            Err(e) => failures.push(ValidationFailure::new(
                                format!("{point_field}.details"),
                                format!("error checking image existence for {image}: {e}"),
                            )),
                        }
                    }
                }
                other => debug!(sub_type = %other.sub_type(), "no cluster preconditions"),
            }
        }
        Ok(failures)
    }
}

/// Validated port number and upper-cased protocol, or `None` after recording failures
fn check_port(
    peer: &NetPolDetail,
    field: &str,
    failures: &mut Vec<ValidationFailure>,
) -> Option<(i32, String)> {
    let port = if peer.port.trim().is_empty() {
        failures.push(ValidationFailure::new(format!("{field}.port"), "port is empty"));
        None
    } else {
        match peer.port.trim().parse::<u16>() {
            Ok(port) if port > 0 => Some(i32::from(port)),
            _ => {
                failures.push(ValidationFailure::new(
                    format!("{field}.port"),
                    format!("invalid port: {}", peer.port),
                ));
                None
            }
        }
    };

    let protocol = peer.protocol.trim().to_uppercase();
    let protocol = if PROTOCOLS.contains(&protocol.as_str()) {
        Some(protocol)
    } else {
        failures.push(ValidationFailure::new(
            format!("{field}.protocol"),
            format!(
                "invalid protocol: {}. Must be one of [{}]",
                peer.protocol,
                PROTOCOLS.join(" ")
            ),
        ));
        None
    };

    Some((port?, protocol?))
}

fn check_cidrs(peer: &NetPolDetail, field: &str) -> Vec<ValidationFailure> {
    if peer.kind_lower() != "cidr" {
        return Vec::new();
    }
    peer.args
        .iter()
        .enumerate()
        .filter(|(_, arg)| validate_cidr(arg).is_err())
        .map(|(i, arg)| {
            ValidationFailure::new(format!("{field}.args[{i}]"), format!("invalid CIDR: {arg}"))
        })
        .collect()
}

fn check_syscalls(names: &[&str], field: &str) -> Vec<ValidationFailure> {
    names
        .iter()
        .filter(|name| !syscall_allowed(name))
        .map(|name| {
            ValidationFailure::new(
                format!("{field}.syscall"),
                format!("invalid system call: {name}"),
            )
        })
        .collect()
}

/// Whether any container of `pod` declares `port` with `protocol` (TCP when unset)
fn listens_on(pod: &Pod, port: i32, protocol: &str) -> bool {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .any(|p| {
            p.container_port == port
                && p.protocol.as_deref().unwrap_or("TCP").eq_ignore_ascii_case(protocol)
        })
}

/// Which metadata map a `validate` kind checks, with its singular name for messages
fn metadata_kind(kind: &str) -> Option<&'static str> {
    match kind {
        "annotations" | "annotation" => Some("annotation"),
        "label" | "labels" => Some("label"),
        _ => None,
    }
}

fn check_pod_metadata(
    pod: &Pod,
    namespace: &str,
    metadata: &str,
    expected: &BTreeMap<&str, &str>,
    field: &str,
) -> Vec<ValidationFailure> {
    let actual = if metadata == "annotation" {
        pod.annotations()
    } else {
        pod_labels(pod)
    };
    let name = pod.name_any();

    expected
        .iter()
        .filter_map(|(key, want)| match actual.get(*key) {
            Some(got) if got == want => None,
            Some(got) => Some(ValidationFailure::new(
                field,
                format!(
                    "pod {name} in namespace {namespace} does not comply with the \
                     {metadata} {key}: expected {want}, got {got}"
                ),
            )),
            None => Some(ValidationFailure::new(
                field,
                format!("pod {name} in namespace {namespace} is missing required {metadata} {key}"),
            )),
        })
        .collect()
}
