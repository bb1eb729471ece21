//! Intent validator: runs the two stages in order

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{info, instrument, warn};

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::Result;
use aegis_selector::SelectorResolver;

use crate::cluster::ClusterReader;
use crate::probe::{ImageRegistry, PathProbe};
use crate::report::{Stage, ValidationReport};

/// Validates intents against live cluster state.
///
/// Failures within a stage are collected. A failed existence stage stops
/// validation before any precondition is checked. Errors reading the cluster
/// are returned as `Err` so the caller can retry; they are not failures.
pub struct IntentValidator {
    pub(crate) resolver: SelectorResolver,
    pub(crate) cluster: Arc<dyn ClusterReader>,
    pub(crate) paths: Arc<dyn PathProbe>,
    pub(crate) images: Arc<dyn ImageRegistry>,
}

impl IntentValidator {
    /// Create a validator from its collaborators
    pub fn new(
        resolver: SelectorResolver,
        cluster: Arc<dyn ClusterReader>,
        paths: Arc<dyn PathProbe>,
        images: Arc<dyn ImageRegistry>,
    ) -> Self {
        Self {
            resolver,
            cluster,
            paths,
            images,
        }
    }

    /// Run existence then precondition checks
    #[instrument(skip(self, intent), fields(policy = %intent.name_any()))]
    pub async fn validate(&self, intent: &KubeAegisPolicy) -> Result<ValidationReport> {
        info!("checking resource existence");
        let failures = self.check_existence(intent).await?;
        if !failures.is_empty() {
            warn!(count = failures.len(), "existence check failed");
            return Ok(ValidationReport::failed(Stage::Existence, failures));
        }

        info!("checking preconditions");
        let failures = self.check_preconditions(intent).await?;
        if !failures.is_empty() {
            warn!(count = failures.len(), "precondition check failed");
            return Ok(ValidationReport::failed(Stage::Precondition, failures));
        }

        Ok(ValidationReport::default())
    }
}

/// Field path of a request
pub(crate) fn request_field(index: usize) -> String {
    format!("spec.intentRequest[{index}]")
}
