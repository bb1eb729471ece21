//! The interface each backend implements for the generic compiler

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;

use aegis_common::crd::{Action, ActionPoint, Direction, IntentRequest, NetPolDetail};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::{Backend, BackendPolicy};
use aegis_common::{Error, Result};

/// Which rule list a peer entry lands in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleSlot {
    /// Allowed ingress (`Allow` + `from`)
    IngressAllow,
    /// Allowed egress (`Allow` + `to`)
    EgressAllow,
    /// Denied ingress (`Block` + `from`)
    IngressDeny,
    /// Denied egress (`Block` + `to`)
    EgressDeny,
}

impl RuleSlot {
    /// Slot for a peer given the rule action and the peer's direction
    pub fn for_peer(action: Action, direction: Direction) -> Self {
        match (action.is_blocking(), direction) {
            (false, Direction::Ingress) => RuleSlot::IngressAllow,
            (false, Direction::Egress) => RuleSlot::EgressAllow,
            (true, Direction::Ingress) => RuleSlot::IngressDeny,
            (true, Direction::Egress) => RuleSlot::EgressDeny,
        }
    }

    /// Traffic direction
    pub fn direction(&self) -> Direction {
        match self {
            RuleSlot::IngressAllow | RuleSlot::IngressDeny => Direction::Ingress,
            RuleSlot::EgressAllow | RuleSlot::EgressDeny => Direction::Egress,
        }
    }

    /// Whether the slot denies
    pub fn is_deny(&self) -> bool {
        matches!(self, RuleSlot::IngressDeny | RuleSlot::EgressDeny)
    }
}

/// Backend-specific half of the compiler.
///
/// [`PolicyCompiler`](crate::PolicyCompiler) owns the control flow: it
/// filters requests by intent type, resolves selectors, and feeds each
/// surviving request through `begin_request`, `add_peer`,
/// `add_action_point` and `end_request` before calling `finish` once.
pub trait PolicyTarget {
    /// Backend this target compiles for
    const BACKEND: Backend;

    /// Whether a request with these resolved labels should be compiled
    fn selects(&self, _request: &IntentRequest, labels: &BTreeMap<String, String>) -> bool {
        !labels.is_empty()
    }

    /// Start a request; `labels` is the resolved selector
    fn begin_request(
        &mut self,
        request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Add one `from`/`to` entry
    fn add_peer(&mut self, _slot: RuleSlot, _peer: &NetPolDetail) -> Result<()> {
        Ok(())
    }

    /// Add one action point
    fn add_action_point(&mut self, _point: &ActionPoint) -> Result<()> {
        Ok(())
    }

    /// Close the current request
    fn end_request(&mut self) -> Result<()> {
        Ok(())
    }

    /// Build the policy object. `None` when nothing was compiled.
    fn finish(self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>>;
}

/// Compile error for a backend
pub(crate) fn compile_error(backend: Backend, msg: impl Into<String>) -> Error {
    Error::compile_for(backend.as_str(), msg)
}

/// Parse a port number
pub(crate) fn parse_port(backend: Backend, peer: &NetPolDetail) -> Result<u16> {
    peer.port.trim().parse::<u16>().map_err(|_| {
        compile_error(
            backend,
            format!("invalid port {:?} in {} entry", peer.port, peer.kind),
        )
    })
}

/// Parse a CIDR in prefix-length notation
pub(crate) fn parse_cidr(backend: Backend, cidr: &str) -> Result<IpNetwork> {
    if !cidr.contains('/') {
        return Err(compile_error(
            backend,
            format!("invalid CIDR {cidr}: missing prefix length"),
        ));
    }
    cidr.parse::<IpNetwork>()
        .map_err(|e| compile_error(backend, format!("invalid CIDR {cidr}: {e}")))
}

/// Parse a small numeric argument (ICMP type/code)
pub(crate) fn parse_u8(backend: Backend, what: &str, value: &str) -> Result<u8> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| compile_error(backend, format!("invalid {what} {value:?}")))
}

/// First argument, or a compile error naming the entry kind
pub(crate) fn require_args<'a>(backend: Backend, peer: &'a NetPolDetail) -> Result<&'a [String]> {
    if peer.args.is_empty() {
        return Err(compile_error(
            backend,
            format!("{} entry requires args", peer.kind),
        ));
    }
    Ok(&peer.args)
}
