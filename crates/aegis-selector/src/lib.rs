//! Selector resolution for KubeAegis intents
//!
//! A [`Selector`](aegis_common::crd::Selector) is resolved into one concrete
//! label map by combining its `match` entries with its label expressions.
//! Expressions are understood two ways:
//!
//! - [`expression`]: a small heuristic parser used by the compiler. It knows a
//!   fixed set of shapes and reports everything else as unrecognized.
//! - [`cel`]: a real CEL evaluator used by validation to decide whether a
//!   pod satisfies an expression.

#![deny(missing_docs)]

pub mod cel;
pub mod expression;
mod lister;
mod resolver;

pub use cel::CelPredicate;
pub use expression::{ExpressionOutcome, LabelExpression, ParsedExpression};
pub use lister::{pod_labels, KubePodLister, PodLister};
pub use resolver::{merge_match_labels, SelectorResolver};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Pod;

    /// Pod with the given name and labels
    pub fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        pod
    }

    /// Owned label map
    pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
