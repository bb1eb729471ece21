//! Two-stage validation of KubeAegis intents
//!
//! An intent is checked against live cluster state before anything is
//! compiled or dispatched:
//!
//! 1. **Existence**: referenced namespaces are active, each `match` entry
//!    selects at least one object and each CEL expression holds for at least
//!    one pod.
//! 2. **Precondition**: per-type checks. Network peers need a pod listening
//!    on the declared port, system hooks need existing paths and allowed
//!    system calls, and cluster rules need compliant pods and resolvable
//!    images.
//!
//! The second stage only runs when the first passes.

#![deny(missing_docs)]

mod cluster;
mod existence;
mod precondition;
mod probe;
mod report;
mod validator;

pub use cluster::{ClusterReader, KubeClusterReader, WorkloadKind, NAMESPACE_ACTIVE};
pub use precondition::{validate_cidr, SYSCALL_ALLOW_LIST};
pub use probe::{
    BearerChallenge, HostPathProbe, HttpImageRegistry, ImageReference, ImageRegistry, PathProbe,
};
pub use report::{Stage, ValidationFailure, ValidationReport};
pub use validator::IntentValidator;
