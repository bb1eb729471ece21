//! Backend-agnostic compile loop

use kube::ResourceExt;
use tracing::{debug, instrument};

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::{Backend, BackendPolicy};
use aegis_common::Result;
use aegis_selector::SelectorResolver;

use crate::calico::CalicoTarget;
use crate::cilium::CiliumTarget;
use crate::kubearmor::KubeArmorTarget;
use crate::kyverno::KyvernoTarget;
use crate::target::{PolicyTarget, RuleSlot};
use crate::tetragon::TetragonTarget;

/// Compiles intents into backend policy objects
#[derive(Clone)]
pub struct PolicyCompiler {
    resolver: SelectorResolver,
}

impl PolicyCompiler {
    /// Create a compiler that resolves selectors with `resolver`
    pub fn new(resolver: SelectorResolver) -> Self {
        Self { resolver }
    }

    /// Compile `intent` for `backend`.
    ///
    /// Returns `Ok(None)` when no request of the backend's type selected
    /// anything. Any compile error aborts the whole object.
    #[instrument(skip(self, intent), fields(intent = %intent.name_any(), backend = %backend))]
    pub async fn compile(
        &self,
        backend: Backend,
        intent: &KubeAegisPolicy,
    ) -> Result<Option<BackendPolicy>> {
        match backend {
            Backend::Cilium => self.run(CiliumTarget::default(), intent).await,
            Backend::Calico => self.run(CalicoTarget::default(), intent).await,
            Backend::KubeArmor => self.run(KubeArmorTarget::default(), intent).await,
            Backend::Kyverno => self.run(KyvernoTarget::new(intent), intent).await,
            Backend::Tetragon => self.run(TetragonTarget::default(), intent).await,
        }
    }

    async fn run<T: PolicyTarget>(
        &self,
        mut target: T,
        intent: &KubeAegisPolicy,
    ) -> Result<Option<BackendPolicy>> {
        let name = intent.name_any();
        let namespace = intent.namespace_or_default();
        let intent_type = T::BACKEND.intent_type();

        for (index, request) in intent
            .spec
            .intent_requests
            .iter()
            .enumerate()
            .filter(|(_, r)| r.type_ == intent_type)
        {
            let labels = self
                .resolver
                .resolve(&request.selector, request.target_namespace(&namespace))
                .await?;
            if !target.selects(request, &labels) {
                debug!(request = index, "selector resolved to nothing, skipping request");
                continue;
            }

            target.begin_request(request, &labels)?;
            for (direction, peer) in request.rule.peers() {
                target.add_peer(RuleSlot::for_peer(request.rule.action, direction), peer)?;
            }
            for point in &request.rule.action_points {
                target.add_action_point(point)?;
            }
            target.end_request()?;
        }

        let metadata = ObjectMeta::for_intent(T::BACKEND.policy_name(&name), namespace, &name);
        let policy = target.finish(metadata)?;
        if policy.is_none() {
            debug!("no requests compiled");
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{intent, StaticPods};

    const NETWORK: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: web-egress
  namespace: ns1
spec:
  intentRequest:
    - type: network
      selector:
        match:
          - kind: Pod
            namespace: ns1
            matchLabels:
              app: web
      rule:
        action: Allow
        to:
          - kind: port
            port: "443"
            protocol: TCP
    - type: system
      selector:
        match:
          - kind: Pod
            namespace: ns1
            matchLabels:
              app: web
      rule:
        action: Block
        actionPoint:
          - subType: process
            resource:
              path: ["/bin/sh"]
"#;

    #[tokio::test]
    async fn story_compiling_twice_is_byte_identical() {
        let compiler = PolicyCompiler::new(StaticPods::resolver(vec![]));
        let kap = intent(NETWORK);

        let first = compiler.compile(Backend::Cilium, &kap).await.unwrap().unwrap();
        let second = compiler.compile(Backend::Cilium, &kap).await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&first.to_value().unwrap()).unwrap(),
            serde_json::to_string(&second.to_value().unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn story_only_requests_of_the_backend_type_are_compiled() {
        let compiler = PolicyCompiler::new(StaticPods::resolver(vec![]));
        let kap = intent(NETWORK);

        assert!(compiler.compile(Backend::Kyverno, &kap).await.unwrap().is_none());
        let ksp = compiler
            .compile(Backend::KubeArmor, &kap)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ksp.name(), "ksp-web-egress");
        assert_eq!(ksp.namespace(), "ns1");
        assert_eq!(
            ksp.metadata().labels.get(aegis_common::LABEL_POLICY),
            Some(&"web-egress".to_string())
        );
    }

    #[tokio::test]
    async fn story_empty_selector_skips_the_request() {
        let compiler = PolicyCompiler::new(StaticPods::resolver(vec![]));
        let mut kap = intent(NETWORK);
        kap.spec.intent_requests[0].selector.matches[0].match_labels.clear();

        assert!(compiler.compile(Backend::Cilium, &kap).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn story_bad_port_aborts_the_whole_object() {
        let compiler = PolicyCompiler::new(StaticPods::resolver(vec![]));
        let mut kap = intent(NETWORK);
        kap.spec.intent_requests[0].rule.to[0].port = "https".to_string();

        for backend in [Backend::Cilium, Backend::Calico] {
            let err = compiler.compile(backend, &kap).await.unwrap_err();
            assert!(matches!(err, aegis_common::Error::Compile { .. }), "{backend}");
        }
    }
}
