//! Common types for KubeAegis: CRDs, errors, adapter registry, status, and
//! backend policy schemas

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod status;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for adapter gRPC servers
pub const DEFAULT_ADAPTER_PORT: u16 = 50052;

/// Default name of the registry ConfigMap
pub const DEFAULT_REGISTRY_NAME: &str = "adapter-config";

/// Default namespace of the registry ConfigMap
pub const DEFAULT_REGISTRY_NAMESPACE: &str = "default";

/// Default data key holding the registry JSON
pub const DEFAULT_REGISTRY_KEY: &str = "config";

/// Field manager used for status writes and CRD installation
pub const FIELD_MANAGER: &str = "kubeaegis-controller";

/// Finalizer holding an intent until its deletion notice went out
pub const POLICY_FINALIZER: &str = "cclab.kubeaegis.com/deletion-notice";

/// Policy name prefix carried by deletion notices
pub const DELETION_NOTICE_PREFIX: &str = "ksp";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on compiled policies
pub const LABEL_MANAGED_BY_AEGIS: &str = "kubeaegis";

/// Label naming the intent a backend policy was compiled from
pub const LABEL_POLICY: &str = "kubeaegis.io/policy";

/// Label excluded from negated selector results
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
