//! KubeAegisPolicy reconciliation
//!
//! A live intent is validated, then dispatched to every adapter that supports
//! one of its requests. The outcome is written to status together with the
//! generation it was computed for, so status writes by adapters do not cause
//! another dispatch. Deleted intents are held by a finalizer until the
//! deletion notice went out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::status::StatusReconciler;
use aegis_common::{Error, Result, FIELD_MANAGER, POLICY_FINALIZER};
use aegis_dispatch::{DispatchSummary, Dispatcher};
use aegis_validator::{IntentValidator, ValidationReport};

/// Finalizer bookkeeping on intents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IntentClient: Send + Sync {
    /// Add [`POLICY_FINALIZER`]
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<()>;

    /// Remove [`POLICY_FINALIZER`]; a vanished intent is fine
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Validation seam of the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IntentCheck: Send + Sync {
    /// Run the validation stages
    async fn validate(&self, intent: &KubeAegisPolicy) -> Result<ValidationReport>;
}

/// Dispatch seam of the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyDispatch: Send + Sync {
    /// Send the intent to its adapters
    async fn dispatch(&self, intent: &KubeAegisPolicy) -> Result<DispatchSummary>;

    /// Tell every adapter the intent is gone; returns how many were told
    async fn notify_deletion(&self, name: &str, namespace: &str) -> Result<usize>;
}

#[async_trait]
impl IntentCheck for IntentValidator {
    async fn validate(&self, intent: &KubeAegisPolicy) -> Result<ValidationReport> {
        IntentValidator::validate(self, intent).await
    }
}

#[async_trait]
impl PolicyDispatch for Dispatcher {
    async fn dispatch(&self, intent: &KubeAegisPolicy) -> Result<DispatchSummary> {
        Dispatcher::dispatch(self, intent).await
    }

    async fn notify_deletion(&self, name: &str, namespace: &str) -> Result<usize> {
        Dispatcher::notify_deletion(self, name, namespace).await
    }
}

/// Finalizer patches through the API server
pub struct KubeIntentClient {
    client: Client,
}

impl KubeIntentClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<()> {
        let api: Api<KubeAegisPolicy> = Api::namespaced(self.client.clone(), namespace);
        let Some(intent) = api.get_opt(name).await? else {
            return Ok(());
        };
        let mut finalizers = intent.metadata.finalizers.unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": intent.metadata.resource_version,
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IntentClient for KubeIntentClient {
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<()> {
        self.patch_finalizers(name, namespace, |finalizers| {
            if finalizers.iter().any(|f| f == POLICY_FINALIZER) {
                return false;
            }
            finalizers.push(POLICY_FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<()> {
        self.patch_finalizers(name, namespace, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != POLICY_FINALIZER);
            finalizers.len() != before
        })
        .await
    }
}

/// Shared state of the policy controller
pub struct Context {
    /// Finalizer bookkeeping
    pub intents: Arc<dyn IntentClient>,
    /// Existence and precondition checks
    pub validator: Arc<dyn IntentCheck>,
    /// Adapter dispatch and deletion notices
    pub dispatcher: Arc<dyn PolicyDispatch>,
    /// Status writer
    pub status: StatusReconciler,
}

impl Context {
    /// Create a context from its collaborators
    pub fn new(
        intents: Arc<dyn IntentClient>,
        validator: Arc<dyn IntentCheck>,
        dispatcher: Arc<dyn PolicyDispatch>,
        status: StatusReconciler,
    ) -> Self {
        Self {
            intents,
            validator,
            dispatcher,
            status,
        }
    }
}

/// Reconcile one KubeAegisPolicy
#[instrument(skip(intent, ctx), fields(policy = %intent.name_any(), namespace = %intent.namespace_or_default()))]
pub async fn reconcile(intent: Arc<KubeAegisPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let name = intent.name_any();
    let namespace = intent.namespace_or_default();

    if intent.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&intent, &ctx).await;
    }

    if !has_finalizer(&intent) {
        info!("adding deletion-notice finalizer");
        ctx.intents.add_finalizer(&name, &namespace).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if is_observed(&intent) {
        debug!(generation = ?intent.metadata.generation, "generation already handled");
        return Ok(Action::await_change());
    }
    let generation = intent.metadata.generation;

    let report = ctx.validator.validate(&intent).await?;
    if !report.is_valid() {
        for failure in &report.failures {
            warn!(field = %failure.field, reason = %failure.message, "validation failed");
        }
        ctx.status
            .mark_invalid(&name, &namespace, generation, &report.summary())
            .await?;
        // Spec changes retrigger; nothing to retry until then
        return Ok(Action::await_change());
    }

    let summary = ctx.dispatcher.dispatch(&intent).await?;
    ctx.status
        .mark_created(
            &name,
            &namespace,
            generation,
            &summary.failed_adapters(),
            summary.failure_message().as_deref(),
        )
        .await?;

    info!(
        delivered = summary.delivered.len(),
        deferred = summary.deferred.len(),
        failed = summary.failed.len(),
        "intent dispatched"
    );
    Ok(Action::await_change())
}

/// Requeue failed reconciles after a fixed delay
pub fn error_policy(intent: Arc<KubeAegisPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        policy = %intent.name_any(),
        namespace = %intent.namespace_or_default(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn handle_deletion(intent: &KubeAegisPolicy, ctx: &Context) -> Result<Action> {
    if !has_finalizer(intent) {
        return Ok(Action::await_change());
    }
    let name = intent.name_any();
    let namespace = intent.namespace_or_default();

    match ctx.dispatcher.notify_deletion(&name, &namespace).await {
        Ok(notified) => info!(adapters = notified, "deletion notice sent"),
        Err(e) => warn!(error = %e, "deletion notice failed, releasing intent anyway"),
    }
    ctx.intents.remove_finalizer(&name, &namespace).await?;
    Ok(Action::await_change())
}

fn has_finalizer(intent: &KubeAegisPolicy) -> bool {
    intent.finalizers().iter().any(|f| f == POLICY_FINALIZER)
}

/// Whether status already reflects this generation
fn is_observed(intent: &KubeAegisPolicy) -> bool {
    let observed = intent
        .status
        .as_ref()
        .and_then(|s| s.observed_generation);
    observed.is_some() && observed == intent.metadata.generation
}
