//! Routes intents to the adapters that support them

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::registry::{Registry, RegistryStore};
use aegis_common::{Error, Result, DELETION_NOTICE_PREFIX};
use aegis_proto::PolicyDeletionRequest;

use crate::client::AdapterClient;
use crate::delivery::{Courier, DispatchJob};
use crate::report::{PolicyReport, ReportSink};
use crate::supervisor::RetrySupervisor;

/// A successful synchronous delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    /// Adapter name
    pub adapter: String,
    /// Full name of the object it applied
    pub policy: String,
}

/// A failed synchronous delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchFailure {
    /// Adapter name
    pub adapter: String,
    /// What went wrong
    pub message: String,
}

/// Outcome of one dispatch pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Online adapters that applied the intent
    pub delivered: Vec<Delivered>,
    /// Offline adapters handed to the retry supervisor
    pub deferred: Vec<String>,
    /// Online adapters that rejected the intent or could not be reached
    pub failed: Vec<DispatchFailure>,
}

impl DispatchSummary {
    /// Names of adapters whose delivery failed
    pub fn failed_adapters(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.adapter.clone()).collect()
    }

    /// Text of the last failure
    pub fn failure_message(&self) -> Option<String> {
        self.failed
            .last()
            .map(|f| format!("{}: {}", f.adapter, f.message))
    }

    /// Adapter policy names applied synchronously
    pub fn policies(&self) -> impl Iterator<Item = &str> {
        self.delivered.iter().map(|d| d.policy.as_str())
    }
}

/// Dispatches intents and deletion notices to adapters
pub struct Dispatcher {
    registry: Arc<dyn RegistryStore>,
    courier: Courier,
    supervisor: Arc<RetrySupervisor>,
}

impl Dispatcher {
    /// Create a dispatcher. Offline adapters are polled every `retry_interval`.
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        client: Arc<dyn AdapterClient>,
        reports: Option<Arc<dyn ReportSink>>,
        retry_interval: Duration,
    ) -> Self {
        let courier = Courier::new(client, reports);
        let supervisor = Arc::new(RetrySupervisor::new(
            registry.clone(),
            courier.clone(),
            retry_interval,
        ));
        Self {
            registry,
            courier,
            supervisor,
        }
    }

    /// The supervisor owning deferred deliveries
    pub fn supervisor(&self) -> &Arc<RetrySupervisor> {
        &self.supervisor
    }

    /// Send `intent` to every adapter that supports one of its requests.
    ///
    /// The registry is read fresh. Each adapter is contacted at most once,
    /// even when several requests route to it. Failures of individual
    /// adapters are collected in the summary; only a registry read error is
    /// returned as `Err`.
    #[instrument(skip(self, intent), fields(policy = %intent.name_any()))]
    pub async fn dispatch(&self, intent: &KubeAegisPolicy) -> Result<DispatchSummary> {
        let registry = self.registry.load().await?;
        let name = intent.name_any();
        let namespace = intent.namespace_or_default();
        let report = intent
            .spec
            .enable_reporting
            .then(|| PolicyReport::for_intent(intent));

        let mut summary = DispatchSummary::default();
        for adapter in route(intent, &registry) {
            let Some(entry) = registry.get(&adapter) else {
                continue;
            };
            let job = DispatchJob {
                policy: name.clone(),
                namespace: namespace.clone(),
                adapter: adapter.clone(),
                report: report.clone(),
            };

            if !entry.is_online() {
                self.supervisor.schedule(job);
                summary.deferred.push(adapter);
                continue;
            }

            match self.courier.deliver(&job, entry).await {
                Ok(policy) => summary.delivered.push(Delivered { adapter, policy }),
                Err(e) => {
                    warn!(adapter = %adapter, error = %e, "dispatch failed");
                    summary.failed.push(DispatchFailure {
                        adapter,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            delivered = summary.delivered.len(),
            deferred = summary.deferred.len(),
            failed = summary.failed.len(),
            "dispatch finished"
        );
        Ok(summary)
    }

    /// Tell every online adapter that an intent was deleted.
    ///
    /// Deferred deliveries of the intent are cancelled first. The notice
    /// names `ksp-<intent>`. The first failure stops the loop and
    /// is returned; adapters after it are not notified. Returns how many
    /// adapters acknowledged.
    #[instrument(skip(self))]
    pub async fn notify_deletion(&self, name: &str, namespace: &str) -> Result<usize> {
        self.supervisor.cancel_intent(namespace, name);
        let registry = self.registry.load().await?;
        let policy_name = deletion_notice_name(name);

        let mut notified = 0;
        for (adapter, entry) in registry.online() {
            let request = PolicyDeletionRequest {
                policy_name: policy_name.clone(),
                policy_namespace: namespace.to_string(),
            };
            let response = self
                .courier
                .client()
                .notify_deletion(adapter, &entry.address, request)
                .await?;
            if !response.success {
                return Err(Error::dispatch_for(adapter, response.message));
            }
            debug!(adapter = %adapter, message = %response.message, "deletion acknowledged");
            notified += 1;
        }
        info!(notified, "deletion notices sent");
        Ok(notified)
    }
}

/// Name carried by the deletion notice for an intent
pub fn deletion_notice_name(intent: &str) -> String {
    format!("{DELETION_NOTICE_PREFIX}-{intent}")
}

/// Adapters to contact, first-seen order, no duplicates
fn route(intent: &KubeAegisPolicy, registry: &Registry) -> Vec<String> {
    let mut adapters: Vec<String> = Vec::new();
    for (index, request) in intent.spec.intent_requests.iter().enumerate() {
        let Some(subtype) = request.subtype_key() else {
            warn!(request = index, "request has no subtype to route on, skipping");
            continue;
        };
        let supporting = registry.supporting(request.type_.as_str(), subtype);
        if supporting.is_empty() {
            warn!(request = index, intent_type = %request.type_, subtype = %subtype, "no adapter supports request");
        }
        for adapter in supporting {
            if !adapters.contains(&adapter) {
                adapters.push(adapter);
            }
        }
    }
    adapters
}
