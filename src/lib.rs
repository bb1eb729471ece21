//! KubeAegis - intent-based security policy controller for Kubernetes
//!
//! A `KubeAegisPolicy` states what should be allowed or blocked for a set of
//! workloads. The controller validates it against the live cluster and hands
//! it to adapters, one per enforcement engine, which compile and apply the
//! engine-specific objects.
//!
//! # Modules
//!
//! - [`controller`] - reconcile loop, finalizer-driven deletion notice
//! - [`http`] - health and report endpoints

#![deny(missing_docs)]

pub mod controller;
pub mod http;

pub use aegis_common::{Error, Result};
