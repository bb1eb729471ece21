//! `PolicyService` implementation
//!
//! Compile and enforce failures are answered with `success = false` and the
//! error text; they are never transport errors, so the controller can record
//! them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info};

use aegis_common::{Error, Result};
use aegis_proto::policy_service_server::{PolicyService, PolicyServiceServer};
use aegis_proto::{DeletionResponse, PolicyDeletionRequest, PolicyRequest, PolicyResponse};

use crate::manager::{AdapterManager, ApplyOutcome};

/// gRPC front of an [`AdapterManager`]
pub struct AdapterServer {
    manager: Arc<AdapterManager>,
    addr: SocketAddr,
}

impl AdapterServer {
    /// Create a server bound to `addr`
    pub fn new(manager: Arc<AdapterManager>, addr: SocketAddr) -> Self {
        Self { manager, addr }
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let addr = self.addr;
        let backend = self.manager.backend();
        info!(%addr, %backend, "starting adapter gRPC server");

        tonic::transport::Server::builder()
            .add_service(PolicyServiceServer::new(AdapterService {
                manager: self.manager,
            }))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| Error::internal_with_context("adapter-server", e.to_string()))
    }
}

struct AdapterService {
    manager: Arc<AdapterManager>,
}

#[tonic::async_trait]
impl PolicyService for AdapterService {
    async fn dispatch_policy(
        &self,
        request: Request<PolicyRequest>,
    ) -> std::result::Result<Response<PolicyResponse>, Status> {
        let request = request.into_inner();
        let name = request.policy_name;
        let namespace = request.policy_namespace;
        if name.is_empty() {
            return Err(Status::invalid_argument("policy_name is required"));
        }

        let response = match self.manager.apply(&name, &namespace).await {
            Ok(ApplyOutcome::Applied { full_name, applied }) => PolicyResponse {
                success: true,
                message: format!("{applied} {full_name}"),
                adapter_policy_name: full_name,
            },
            Ok(ApplyOutcome::NothingSelected) => PolicyResponse {
                success: true,
                message: format!(
                    "no {} request of {namespace}/{name} selected any workload",
                    self.manager.backend().intent_type()
                ),
                adapter_policy_name: String::new(),
            },
            Err(e) => {
                error!(policy = %name, namespace = %namespace, error = %e, "failed to apply intent");
                PolicyResponse {
                    success: false,
                    message: e.to_string(),
                    adapter_policy_name: String::new(),
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn notify_policy_deletion(
        &self,
        request: Request<PolicyDeletionRequest>,
    ) -> std::result::Result<Response<DeletionResponse>, Status> {
        let request = request.into_inner();
        let response = match self
            .manager
            .remove(&request.policy_name, &request.policy_namespace)
            .await
        {
            Ok(true) => DeletionResponse {
                success: true,
                message: format!("deleted policy for {}", request.policy_name),
            },
            Ok(false) => DeletionResponse {
                success: true,
                message: format!("no policy for {}", request.policy_name),
            },
            Err(e) => {
                error!(policy = %request.policy_name, error = %e, "failed to delete policy");
                DeletionResponse {
                    success: false,
                    message: e.to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::enforcer::{Enforcer, MockPolicyObjects};
    use crate::testing::StaticPods;
    use aegis_common::crd::{KubeAegisPolicy, KubeAegisPolicyStatus};
    use aegis_common::policy::Backend;
    use aegis_common::status::PolicyStatusStore;

    struct NoIntents;

    #[async_trait]
    impl PolicyStatusStore for NoIntents {
        async fn get(&self, _name: &str, _namespace: &str) -> Result<Option<KubeAegisPolicy>> {
            Ok(None)
        }

        async fn write_status(
            &self,
            _name: &str,
            _namespace: &str,
            _resource_version: Option<String>,
            _status: &KubeAegisPolicyStatus,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn service(objects: MockPolicyObjects) -> AdapterService {
        AdapterService {
            manager: Arc::new(AdapterManager::new(
                Backend::Kyverno,
                Arc::new(NoIntents),
                StaticPods(vec![]).resolver(),
                Enforcer::new(Arc::new(objects)),
            )),
        }
    }

    #[tokio::test]
    async fn story_apply_errors_are_answered_not_raised() {
        let response = service(MockPolicyObjects::new())
            .dispatch_policy(Request::new(PolicyRequest {
                policy_name: "gone".to_string(),
                policy_namespace: "shop".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.success);
        assert!(response.message.contains("not found"));
        assert!(response.adapter_policy_name.is_empty());
    }

    #[tokio::test]
    async fn story_empty_policy_name_is_rejected() {
        let status = service(MockPolicyObjects::new())
            .dispatch_policy(Request::new(PolicyRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn story_deleting_an_absent_policy_still_succeeds() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut objects = MockPolicyObjects::new();
        objects.expect_delete().returning(move |_, _, name| {
            seen.lock().unwrap().push(name.to_string());
            Ok(false)
        });

        let response = service(objects)
            .notify_policy_deletion(Request::new(PolicyDeletionRequest {
                policy_name: "ksp-web".to_string(),
                policy_namespace: "shop".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.success);
        assert_eq!(*calls.lock().unwrap(), vec!["kyverno-web".to_string()]);
    }
}
