//! Per-request work of an adapter: fetch, compile, enforce, record

use std::sync::Arc;

use tracing::{debug, info, instrument};

use aegis_common::policy::{Backend, BackendPolicy};
use aegis_common::status::{PolicyStatusStore, StatusReconciler};
use aegis_common::{Error, Result};
use aegis_compiler::PolicyCompiler;
use aegis_selector::SelectorResolver;

use crate::enforcer::{Applied, Enforcer};

/// Outcome of applying an intent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A backend object was applied
    Applied {
        /// `Kind/name` of the object
        full_name: String,
        /// Created or updated
        applied: Applied,
    },
    /// No request of this backend's type selected anything
    NothingSelected,
}

/// Compiles and enforces intents for one backend
pub struct AdapterManager {
    backend: Backend,
    intents: Arc<dyn PolicyStatusStore>,
    resolver: SelectorResolver,
    compiler: PolicyCompiler,
    enforcer: Enforcer,
    status: StatusReconciler,
}

impl AdapterManager {
    /// Create a manager. `intents` is used both to fetch intents and to
    /// write their status.
    pub fn new(
        backend: Backend,
        intents: Arc<dyn PolicyStatusStore>,
        resolver: SelectorResolver,
        enforcer: Enforcer,
    ) -> Self {
        Self {
            backend,
            status: StatusReconciler::new(intents.clone()),
            compiler: PolicyCompiler::new(resolver.clone()),
            intents,
            resolver,
            enforcer,
        }
    }

    /// Backend served
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Compile the named intent for this backend and apply the result
    #[instrument(skip(self), fields(backend = %self.backend))]
    pub async fn apply(&self, name: &str, namespace: &str) -> Result<ApplyOutcome> {
        let intent = self
            .intents
            .get(name, namespace)
            .await?
            .ok_or_else(|| Error::validation_for(name, format!("intent {namespace}/{name} not found")))?;

        let Some(policy) = self.compiler.compile(self.backend, &intent).await? else {
            info!(policy = %name, "no request selected anything for this backend");
            return Ok(ApplyOutcome::NothingSelected);
        };

        let full_name = policy.full_name();
        let bound = self.bound_pods(&policy).await?;
        let applied = self.enforcer.enforce(policy, &intent).await?;

        if !bound.is_empty() {
            self.status.record_resources(name, namespace, &bound).await?;
        }
        self.status.record_policy(name, namespace, &full_name).await?;

        Ok(ApplyOutcome::Applied { full_name, applied })
    }

    /// Delete this backend's object for a deletion notice name
    #[instrument(skip(self), fields(backend = %self.backend))]
    pub async fn remove(&self, notice: &str, namespace: &str) -> Result<bool> {
        let name = self.backend.policy_name_for_notice(notice);
        self.enforcer.remove(self.backend, namespace, &name).await
    }

    /// `Pod/<name>` for pods a host-security policy applies to
    async fn bound_pods(&self, policy: &BackendPolicy) -> Result<Vec<String>> {
        if !matches!(self.backend, Backend::KubeArmor | Backend::Tetragon) {
            return Ok(Vec::new());
        }
        let labels = policy.target_labels();
        if labels.is_empty() {
            debug!(policy = %policy.full_name(), "policy selects no labels, not listing pods");
            return Ok(Vec::new());
        }
        let pods = self
            .resolver
            .pods()
            .list_pods(policy.namespace(), &labels)
            .await?;
        Ok(pods
            .iter()
            .filter_map(|p| p.metadata.name.as_ref())
            .map(|name| format!("Pod/{name}"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;

    use super::*;
    use crate::enforcer::MockPolicyObjects;
    use crate::testing::{intent, pod, StaticPods};
    use aegis_common::crd::{KubeAegisPolicy, KubeAegisPolicyStatus};

    const HARDEN: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: harden
  namespace: shop
  uid: 6f1c0d4e-0000-0000-0000-000000000001
spec:
  intentRequest:
    - type: system
      selector:
        match:
          - kind: Pod
            namespace: shop
            matchLabels: {app: api}
      rule:
        action: Block
        actionPoint:
          - subType: process
            resource:
              path: [/bin/sh]
"#;

    /// One intent in memory; counts status writes
    struct OneIntent(Mutex<Option<KubeAegisPolicy>>, AtomicUsize);

    impl OneIntent {
        fn new(intent: Option<KubeAegisPolicy>) -> Self {
            Self(Mutex::new(intent), AtomicUsize::new(0))
        }

        fn writes(&self) -> usize {
            self.1.load(Ordering::SeqCst)
        }

        fn status(&self) -> KubeAegisPolicyStatus {
            self.0
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|i| i.status.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl PolicyStatusStore for OneIntent {
        async fn get(&self, _name: &str, _namespace: &str) -> Result<Option<KubeAegisPolicy>> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn write_status(
            &self,
            _name: &str,
            _namespace: &str,
            _resource_version: Option<String>,
            status: &KubeAegisPolicyStatus,
        ) -> Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            if let Some(intent) = self.0.lock().unwrap().as_mut() {
                intent.status = Some(status.clone());
            }
            Ok(())
        }
    }

    fn manager(
        backend: Backend,
        store: Arc<OneIntent>,
        pods: Vec<Pod>,
        objects: MockPolicyObjects,
    ) -> AdapterManager {
        AdapterManager::new(
            backend,
            store,
            StaticPods(pods).resolver(),
            Enforcer::new(Arc::new(objects)),
        )
    }

    fn accepting_objects() -> MockPolicyObjects {
        let mut objects = MockPolicyObjects::new();
        objects.expect_get().returning(|_, _, _| Ok(None));
        objects.expect_create().returning(|_, _, _| Ok(()));
        objects
    }

    #[tokio::test]
    async fn story_host_policy_records_itself_and_its_pods() {
        let store = Arc::new(OneIntent::new(Some(intent(HARDEN))));
        let pods = vec![
            pod("api-0", &[("app", "api")]),
            pod("api-1", &[("app", "api")]),
            pod("db-0", &[("app", "db")]),
        ];

        let outcome = manager(Backend::KubeArmor, store.clone(), pods, accepting_objects())
            .apply("harden", "shop")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                full_name: "KubeArmorPolicy/ksp-harden".to_string(),
                applied: Applied::Created,
            }
        );
        let status = store.status();
        assert_eq!(status.list_of_aps, vec!["KubeArmorPolicy/ksp-harden".to_string()]);
        assert_eq!(status.number_of_aps, 1);
        assert_eq!(
            status.list_of_resources,
            vec!["Pod/api-0".to_string(), "Pod/api-1".to_string()]
        );
        // one write for the pods, one for the policy name
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn story_backend_of_another_type_has_nothing_to_apply() {
        let store = Arc::new(OneIntent::new(Some(intent(HARDEN))));
        let mut objects = MockPolicyObjects::new();
        objects.expect_create().never();

        let outcome = manager(Backend::Cilium, store.clone(), vec![], objects)
            .apply("harden", "shop")
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NothingSelected);
        assert!(store.status().list_of_aps.is_empty());
    }

    #[tokio::test]
    async fn story_missing_intent_is_an_error() {
        let store = Arc::new(OneIntent::new(None));
        let err = manager(Backend::KubeArmor, store, vec![], MockPolicyObjects::new())
            .apply("harden", "shop")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn story_deletion_notice_maps_to_the_backend_object() {
        let mut objects = MockPolicyObjects::new();
        objects
            .expect_delete()
            .withf(|_, ns, name| ns == "shop" && name == "cnp-harden")
            .times(1)
            .returning(|_, _, _| Ok(true));
        let store = Arc::new(OneIntent::new(None));

        let removed = manager(Backend::Cilium, store, vec![], objects)
            .remove("ksp-harden", "shop")
            .await
            .unwrap();
        assert!(removed);
    }
}
