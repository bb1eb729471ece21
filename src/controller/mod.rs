//! Controller for KubeAegisPolicy
//!
//! Reconciliation validates an intent, dispatches it to the adapters that
//! support its requests, and records the outcome in status.

mod policy;

pub use policy::{
    error_policy, reconcile, Context, IntentCheck, IntentClient, KubeIntentClient, PolicyDispatch,
};
