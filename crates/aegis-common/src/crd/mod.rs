//! Custom Resource Definitions for KubeAegis

mod action_point;
mod policy;

pub use action_point::{
    ActionPoint, CapabilityResource, EventFilter, EventHeader, EventResource, HttpResource,
    Keyless, KprobeResource, MutateResource, NetworkResource, PathResource, SyscallResource,
    TracepointResource, UprobeResource, ValidateResource, VerifyImageResource,
};
pub use policy::{
    Action, Direction, IntentRequest, IntentType, KubeAegisPolicy, KubeAegisPolicySpec,
    KubeAegisPolicyStatus, Match, MatchCondition, NetPolDetail, Rule, Selector,
};
