//! Protocol buffer definitions for controller-adapter communication.
//!
//! The controller is the client. Each adapter serves [`PolicyService`]
//! on the address it records in the adapter registry.
//!
//! - [`PolicyRequest`] / [`PolicyResponse`]: compile and apply an intent
//! - [`PolicyDeletionRequest`] / [`DeletionResponse`]: intent deleted
//!
//! [`PolicyService`]: policy_service_server::PolicyService

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from policy.proto
pub mod policy {
    /// Version 1 of the adapter protocol
    pub mod v1 {
        tonic::include_proto!("kubeaegis.policy.v1");
    }
}

pub use policy::v1::*;
