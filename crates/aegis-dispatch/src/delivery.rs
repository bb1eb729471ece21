//! A single (intent, adapter) delivery and its side effects

use std::sync::Arc;

use tracing::{info, warn};

use aegis_common::registry::AdapterEntry;
use aegis_common::{Error, Result};
use aegis_proto::PolicyRequest;

use crate::client::AdapterClient;
use crate::report::{PolicyReport, ReportSink};

/// One intent to hand to one adapter
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchJob {
    /// Intent name
    pub policy: String,
    /// Intent namespace
    pub namespace: String,
    /// Registry name of the adapter
    pub adapter: String,
    /// Report skeleton, present when the intent asked for reports
    pub report: Option<PolicyReport>,
}

impl DispatchJob {
    /// Identity used to avoid scheduling the same retry twice
    pub fn key(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.policy, self.adapter)
    }
}

/// Sends jobs and reports what the adapter applied
#[derive(Clone)]
pub(crate) struct Courier {
    client: Arc<dyn AdapterClient>,
    reports: Option<Arc<dyn ReportSink>>,
}

impl Courier {
    pub(crate) fn new(client: Arc<dyn AdapterClient>, reports: Option<Arc<dyn ReportSink>>) -> Self {
        Self { client, reports }
    }

    pub(crate) fn client(&self) -> &Arc<dyn AdapterClient> {
        &self.client
    }

    /// Dispatch once. On success a report is written if one was requested.
    /// The adapter records the applied policy in the intent's status itself.
    ///
    /// Only the RPC outcome decides success; report errors are logged.
    pub(crate) async fn deliver(&self, job: &DispatchJob, entry: &AdapterEntry) -> Result<String> {
        let request = PolicyRequest {
            policy_name: job.policy.clone(),
            policy_namespace: job.namespace.clone(),
        };
        let response = self
            .client
            .dispatch_policy(&job.adapter, &entry.address, request)
            .await?;
        if !response.success {
            return Err(Error::dispatch_for(&job.adapter, response.message));
        }

        let applied = response.adapter_policy_name;
        info!(
            policy = %job.policy,
            namespace = %job.namespace,
            adapter = %job.adapter,
            applied = %applied,
            "adapter applied policy"
        );

        if let (Some(sink), Some(report)) = (&self.reports, &job.report) {
            let report = report.delivered_by(&job.adapter, entry.status, &applied);
            if let Err(e) = sink.write(&report).await {
                warn!(policy = %job.policy, error = %e, "failed to write report");
            }
        }

        Ok(applied)
    }
}
