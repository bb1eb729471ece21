//! Idempotent apply of compiled backend objects
//!
//! A compiled object is created if absent and otherwise replaced in place:
//! the live object's metadata (uid, resourceVersion, labels added by others)
//! is kept and only its body is overwritten. Every object carries an owner
//! reference to its intent so deleting the intent garbage-collects it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::kube_utils::set_owner_reference;
use aegis_common::policy::{Backend, BackendPolicy};
use aegis_common::{Error, Result};

/// What an apply did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The object did not exist
    Created,
    /// An existing object was overwritten
    Updated,
}

impl std::fmt::Display for Applied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Applied::Created => f.write_str("created"),
            Applied::Updated => f.write_str("updated"),
        }
    }
}

/// Dynamic object access for backend kinds
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyObjects: Send + Sync {
    /// Fetch an object, `None` if absent
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Replace an object; `object` must carry the live resourceVersion
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Delete an object. Returns false if it was already gone.
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool>;
}

/// API server access through `Api<DynamicObject>`
pub struct KubePolicyObjects {
    client: Client,
}

impl KubePolicyObjects {
    /// Create accessor
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl PolicyObjects for KubePolicyObjects {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        self.api(resource, namespace)
            .create(&PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.api(resource, namespace)
            .replace(&name, &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Applies compiled objects
#[derive(Clone)]
pub struct Enforcer {
    objects: Arc<dyn PolicyObjects>,
}

impl Enforcer {
    /// Create an enforcer
    pub fn new(objects: Arc<dyn PolicyObjects>) -> Self {
        Self { objects }
    }

    /// Create or overwrite `policy`, owned by `intent`
    pub async fn enforce(&self, mut policy: BackendPolicy, intent: &KubeAegisPolicy) -> Result<Applied> {
        match intent.owner_reference() {
            Some(owner) => set_owner_reference(&mut policy.metadata_mut().owner_references, owner),
            None => warn!(policy = %policy.full_name(), "intent has no uid yet, applying without owner reference"),
        }

        let resource = policy.backend().api_resource();
        let namespace = policy.namespace().to_string();
        let full_name = policy.full_name();
        let desired: DynamicObject = serde_json::from_value(policy.to_value()?)
            .map_err(|e| Error::serialization_for_kind(policy.kind(), e.to_string()))?;

        match self.objects.get(&resource, &namespace, policy.name()).await? {
            None => {
                self.objects.create(&resource, &namespace, &desired).await?;
                info!(policy = %full_name, namespace = %namespace, "created backend policy");
                Ok(Applied::Created)
            }
            Some(live) => {
                let updated = overwrite_body(live, desired);
                self.objects.replace(&resource, &namespace, &updated).await?;
                info!(policy = %full_name, namespace = %namespace, "updated backend policy");
                Ok(Applied::Updated)
            }
        }
    }

    /// Delete this backend's object named `name`; absent objects are fine
    pub async fn remove(&self, backend: Backend, namespace: &str, name: &str) -> Result<bool> {
        let deleted = self
            .objects
            .delete(&backend.api_resource(), namespace, name)
            .await?;
        if deleted {
            info!(backend = %backend, policy = %name, namespace = %namespace, "deleted backend policy");
        } else {
            debug!(backend = %backend, policy = %name, namespace = %namespace, "backend policy already gone");
        }
        Ok(deleted)
    }
}

/// Keep the live object's identity, take the desired body and owner references
fn overwrite_body(mut live: DynamicObject, desired: DynamicObject) -> DynamicObject {
    let owners = live.metadata.owner_references.get_or_insert_with(Vec::new);
    for owner in desired.metadata.owner_references.unwrap_or_default() {
        set_owner_reference(owners, owner);
    }
    live.data = desired.data;
    live
}
