//! Conflict-safe status accumulation for KubeAegisPolicy
//!
//! Several adapters report back for the same intent at the same time, so every
//! status change is a read-modify-write guarded by `resourceVersion` and
//! retried on conflict.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{KubeAegisPolicy, KubeAegisPolicyStatus};
use crate::retry::{retry_when, RetryConfig};
use crate::{Error, Result};

/// Value of `status.status` once an intent has been dispatched
pub const STATUS_CREATED: &str = "Created";

/// Value of `status.status` when validation rejected the intent
pub const STATUS_INVALID: &str = "Invalid";

/// Read/write access to KubeAegisPolicy status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStatusStore: Send + Sync {
    /// Fetch the latest intent, `None` if it no longer exists
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<KubeAegisPolicy>>;

    /// Write status, failing with a conflict if the intent changed since
    /// `resource_version` was read
    async fn write_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &KubeAegisPolicyStatus,
    ) -> Result<()>;
}

/// Status store backed by the API server
pub struct KubeStatusStore {
    client: Client,
    field_manager: String,
}

impl KubeStatusStore {
    /// Create a store writing with the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

/// Build a merge patch carrying `resourceVersion` so stale writes get a 409.
///
/// Cleared optional fields are sent as `null` so the merge removes them.
pub fn status_patch(
    resource_version: Option<&str>,
    status: &KubeAegisPolicyStatus,
) -> Result<serde_json::Value> {
    let mut status_value = serde_json::to_value(status)?;
    if let Some(obj) = status_value.as_object_mut() {
        for key in ["failedAdapters", "message", "listOfResources", "listOfAPs"] {
            obj.entry(key).or_insert(serde_json::Value::Null);
        }
    }
    let mut patch = serde_json::json!({ "status": status_value });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

#[async_trait]
impl PolicyStatusStore for KubeStatusStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<KubeAegisPolicy>> {
        let api: Api<KubeAegisPolicy> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(kap) => Ok(Some(kap)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &KubeAegisPolicyStatus,
    ) -> Result<()> {
        let api: Api<KubeAegisPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(resource_version.as_deref(), status)?;
        match api
            .patch_status(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::conflict(format!("{}/{}", namespace, name), ae.message))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Applies status mutations with bounded optimistic-concurrency retry
#[derive(Clone)]
pub struct StatusReconciler {
    store: Arc<dyn PolicyStatusStore>,
    retry: RetryConfig,
}

impl StatusReconciler {
    /// Create a reconciler over the given store
    pub fn new(store: Arc<dyn PolicyStatusStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::conflict(),
        }
    }

    /// Override the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Re-read the intent, apply `mutate`, and write if anything changed.
    ///
    /// `mutate` returns whether it changed the status. Returns whether a
    /// write happened; a deleted intent is not an error.
    pub async fn update<F>(&self, name: &str, namespace: &str, operation: &str, mutate: F) -> Result<bool>
    where
        F: Fn(&mut KubeAegisPolicyStatus) -> bool + Send + Sync,
    {
        retry_when(&self.retry, operation, Error::is_conflict, || async {
            let Some(latest) = self.store.get(name, namespace).await? else {
                debug!(policy = %name, namespace = %namespace, "intent gone, skipping status update");
                return Ok(false);
            };
            let mut status = latest.status.clone().unwrap_or_default();
            if !mutate(&mut status) {
                return Ok(false);
            }
            status.last_updated = Some(now());
            self.store
                .write_status(
                    name,
                    namespace,
                    latest.metadata.resource_version.clone(),
                    &status,
                )
                .await?;
            Ok(true)
        })
        .await
    }

    /// Append an adapter policy name to `listOfAPs` (set semantics)
    pub async fn record_policy(&self, name: &str, namespace: &str, child: &str) -> Result<()> {
        let written = self
            .update(name, namespace, "record_policy", |status| {
                status.record_child_policy(child)
            })
            .await?;
        if written {
            info!(policy = %name, namespace = %namespace, child = %child, "recorded adapter policy");
        }
        Ok(())
    }

    /// Append bound resources to `listOfResources` (set semantics)
    pub async fn record_resources(
        &self,
        name: &str,
        namespace: &str,
        resources: &[String],
    ) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        self.update(name, namespace, "record_resources", |status| {
            // Non-short-circuiting so every resource is recorded
            resources
                .iter()
                .fold(false, |changed, r| status.record_resource(r) | changed)
        })
        .await?;
        Ok(())
    }

    /// Mark `generation` of the intent dispatched, replacing the failure summary
    pub async fn mark_created(
        &self,
        name: &str,
        namespace: &str,
        generation: Option<i64>,
        failed_adapters: &[String],
        message: Option<&str>,
    ) -> Result<()> {
        self.update(name, namespace, "mark_created", |status| {
            let message = message.map(str::to_string);
            let changed = status.status != STATUS_CREATED
                || status.failed_adapters != failed_adapters
                || status.message != message
                || status.observed_generation != generation;
            status.status = STATUS_CREATED.to_string();
            status.failed_adapters = failed_adapters.to_vec();
            status.message = message;
            status.observed_generation = generation;
            changed
        })
        .await?;
        Ok(())
    }

    /// Mark `generation` of the intent rejected by validation
    pub async fn mark_invalid(
        &self,
        name: &str,
        namespace: &str,
        generation: Option<i64>,
        message: &str,
    ) -> Result<()> {
        self.update(name, namespace, "mark_invalid", |status| {
            let changed = status.status != STATUS_INVALID
                || status.message.as_deref() != Some(message)
                || status.observed_generation != generation;
            status.status = STATUS_INVALID.to_string();
            status.message = Some(message.to_string());
            status.observed_generation = generation;
            changed
        })
        .await?;
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeAegisPolicySpec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn policy(rv: &str, status: Option<KubeAegisPolicyStatus>) -> KubeAegisPolicy {
        let mut kap = KubeAegisPolicy::new("web", KubeAegisPolicySpec::default());
        kap.metadata.namespace = Some("shop".to_string());
        kap.metadata.resource_version = Some(rv.to_string());
        kap.status = status;
        kap
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    /// In-memory store enforcing resourceVersion checks like the API server
    #[derive(Default)]
    struct VersionedStore {
        state: Mutex<(u64, KubeAegisPolicyStatus)>,
        writes: AtomicU32,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl PolicyStatusStore for VersionedStore {
        async fn get(&self, _name: &str, _namespace: &str) -> Result<Option<KubeAegisPolicy>> {
            let (rv, status) = self.state.lock().unwrap().clone();
            // Yield so concurrent writers interleave between read and write
            tokio::task::yield_now().await;
            Ok(Some(policy(&rv.to_string(), Some(status))))
        }

        async fn write_status(
            &self,
            _name: &str,
            _namespace: &str,
            resource_version: Option<String>,
            status: &KubeAegisPolicyStatus,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if resource_version != Some(state.0.to_string()) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(Error::conflict("shop/web", "stale resourceVersion"));
            }
            state.0 += 1;
            state.1 = status.clone();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_appends_of_same_name_record_it_once() {
        let store = Arc::new(VersionedStore::default());
        let reconciler = StatusReconciler::new(store.clone()).with_retry(fast_retry());

        let (a, b) = tokio::join!(
            reconciler.record_policy("web", "shop", "CiliumNetworkPolicy/cnp-web"),
            reconciler.record_policy("web", "shop", "CiliumNetworkPolicy/cnp-web"),
        );
        a.unwrap();
        b.unwrap();

        let (_, status) = store.state.lock().unwrap().clone();
        assert_eq!(status.number_of_aps, 1);
        assert_eq!(status.list_of_aps, vec!["CiliumNetworkPolicy/cnp-web"]);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_of_different_names_keep_both() {
        let store = Arc::new(VersionedStore::default());
        let reconciler = StatusReconciler::new(store.clone()).with_retry(fast_retry());

        let (a, b) = tokio::join!(
            reconciler.record_policy("web", "shop", "CiliumNetworkPolicy/cnp-web"),
            reconciler.record_policy("web", "shop", "NetworkPolicy/networkpolicy-web"),
        );
        a.unwrap();
        b.unwrap();

        let (_, status) = store.state.lock().unwrap().clone();
        assert_eq!(status.number_of_aps, 2);
        assert_eq!(status.list_of_aps.len(), 2);
        assert!(store.conflicts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let mut mock = MockPolicyStatusStore::new();
        let mut existing = KubeAegisPolicyStatus::default();
        existing.record_child_policy("KubeArmorPolicy/ksp-web");
        mock.expect_get()
            .returning(move |_, _| Ok(Some(policy("7", Some(existing.clone())))));
        mock.expect_write_status().never();

        let reconciler = StatusReconciler::new(Arc::new(mock));
        reconciler
            .record_policy("web", "shop", "KubeArmorPolicy/ksp-web")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleted_intent_is_skipped() {
        let mut mock = MockPolicyStatusStore::new();
        mock.expect_get().returning(|_, _| Ok(None));
        mock.expect_write_status().never();

        let reconciler = StatusReconciler::new(Arc::new(mock));
        reconciler
            .mark_created("web", "shop", Some(1), &[], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflicts_surface_after_bounded_retries() {
        let mut mock = MockPolicyStatusStore::new();
        mock.expect_get()
            .returning(|_, _| Ok(Some(policy("1", None))));
        mock.expect_write_status()
            .times(3)
            .returning(|_, _, _, _| Err(Error::conflict("shop/web", "stale")));

        let reconciler = StatusReconciler::new(Arc::new(mock)).with_retry(RetryConfig {
            max_attempts: 3,
            ..fast_retry()
        });
        let err = reconciler
            .record_policy("web", "shop", "x")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn write_carries_read_resource_version() {
        let mut mock = MockPolicyStatusStore::new();
        mock.expect_get()
            .returning(|_, _| Ok(Some(policy("42", None))));
        mock.expect_write_status()
            .withf(|_, _, rv, status| {
                rv.as_deref() == Some("42")
                    && status.status == STATUS_CREATED
                    && status.failed_adapters == vec!["kubeaegis-calico".to_string()]
                    && status.last_updated.is_some()
                    && status.observed_generation == Some(3)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let reconciler = StatusReconciler::new(Arc::new(mock));
        reconciler
            .mark_created(
                "web",
                "shop",
                Some(3),
                &["kubeaegis-calico".to_string()],
                Some("connection refused"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resources_are_recorded_once_each() {
        let store = Arc::new(VersionedStore::default());
        let reconciler = StatusReconciler::new(store.clone()).with_retry(fast_retry());
        let pods = vec!["Pod/web-0".to_string(), "Pod/web-1".to_string()];

        reconciler.record_resources("web", "shop", &pods).await.unwrap();
        reconciler.record_resources("web", "shop", &pods).await.unwrap();

        let (_, status) = store.state.lock().unwrap().clone();
        assert_eq!(status.number_of_resources, 2);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn patch_includes_resource_version_and_clears_failures() {
        let status = KubeAegisPolicyStatus {
            status: STATUS_CREATED.to_string(),
            ..Default::default()
        };
        let patch = status_patch(Some("9"), &status).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], "9");
        assert!(patch["status"]["failedAdapters"].is_null());
        assert!(patch["status"]
            .as_object()
            .unwrap()
            .contains_key("message"));
    }
}
