//! Adapter registry
//!
//! The registry is a JSON map persisted under one key of a ConfigMap:
//!
//! ```json
//! {"kubeaegis-cilium": {"address": "10.0.0.5:50052",
//!                       "supportedTypes": {"network": ["pod", "port"]},
//!                       "status": "online"}}
//! ```
//!
//! Readers load it fresh for every dispatch; nothing is cached.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_when, RetryConfig};
use crate::{Error, Result};

/// Whether an adapter is accepting dispatches
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    /// Serving
    Online,
    /// Not serving
    #[default]
    Offline,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterStatus::Online => f.write_str("online"),
            AdapterStatus::Offline => f.write_str("offline"),
        }
    }
}

/// One adapter's registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdapterEntry {
    /// `host:port` of the adapter's gRPC server
    pub address: String,
    /// Intent type to supported subtypes
    #[serde(default)]
    pub supported_types: BTreeMap<String, Vec<String>>,
    /// Current status
    #[serde(default)]
    pub status: AdapterStatus,
}

impl AdapterEntry {
    /// Whether this adapter handles `subtype` for `intent_type`
    pub fn supports(&self, intent_type: &str, subtype: &str) -> bool {
        self.supported_types
            .get(intent_type)
            .is_some_and(|subtypes| subtypes.iter().any(|s| s == subtype))
    }

    /// Whether the adapter is online
    pub fn is_online(&self) -> bool {
        self.status == AdapterStatus::Online
    }
}

/// Parsed registry snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Registry {
    adapters: BTreeMap<String, AdapterEntry>,
}

impl Registry {
    /// Parse the persisted JSON form. Empty input is an empty registry.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| Error::serialization_for_kind("AdapterRegistry", e.to_string()))
    }

    /// Render the persisted JSON form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("AdapterRegistry", e.to_string()))
    }

    /// Look up an adapter
    pub fn get(&self, name: &str) -> Option<&AdapterEntry> {
        self.adapters.get(name)
    }

    /// Insert or replace an adapter
    pub fn insert(&mut self, name: impl Into<String>, entry: AdapterEntry) {
        self.adapters.insert(name.into(), entry);
    }

    /// Update an adapter's status. Returns false if it is not registered.
    pub fn set_status(&mut self, name: &str, status: AdapterStatus) -> bool {
        match self.adapters.get_mut(name) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Names of adapters that support `subtype` for `intent_type`
    pub fn supporting(&self, intent_type: &str, subtype: &str) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|(_, entry)| entry.supports(intent_type, subtype))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Online adapters, by name
    pub fn online(&self) -> impl Iterator<Item = (&String, &AdapterEntry)> {
        self.adapters.iter().filter(|(_, e)| e.is_online())
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapters are registered
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Where the registry lives
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryLocation {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    pub namespace: String,
    /// Data key holding the JSON map
    pub key: String,
}

impl Default for RegistryLocation {
    fn default() -> Self {
        Self {
            name: crate::DEFAULT_REGISTRY_NAME.to_string(),
            namespace: crate::DEFAULT_REGISTRY_NAMESPACE.to_string(),
            key: crate::DEFAULT_REGISTRY_KEY.to_string(),
        }
    }
}

/// Read/update access to the persisted registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Read the current registry
    async fn load(&self) -> Result<Registry>;

    /// Insert or replace an adapter entry
    async fn upsert(&self, name: &str, entry: AdapterEntry) -> Result<()>;

    /// Change an adapter's status; unknown names are ignored
    async fn set_status(&self, name: &str, status: AdapterStatus) -> Result<()>;
}

/// Registry stored in a ConfigMap
pub struct ConfigMapRegistry {
    client: Client,
    location: RegistryLocation,
}

impl ConfigMapRegistry {
    /// Create a store for the given location
    pub fn new(client: Client, location: RegistryLocation) -> Self {
        Self { client, location }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.location.namespace)
    }

    async fn get_config_map(&self) -> Result<Option<ConfigMap>> {
        match self.api().get(&self.location.name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn parse(&self, cm: &ConfigMap) -> Result<Registry> {
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(&self.location.key))
            .map(String::as_str)
            .unwrap_or_default();
        Registry::from_json(raw)
    }

    /// Read-modify-write with resourceVersion checks, retried on conflict
    async fn modify<F>(&self, operation: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut Registry) + Send + Sync,
    {
        retry_when(
            &RetryConfig::conflict(),
            operation,
            Error::is_conflict,
            || async {
                let existing = self.get_config_map().await?;
                let mut registry = match &existing {
                    Some(cm) => self.parse(cm)?,
                    None => Registry::default(),
                };
                mutate(&mut registry);
                let raw = registry.to_json()?;

                match existing {
                    Some(mut cm) => {
                        cm.data
                            .get_or_insert_with(Default::default)
                            .insert(self.location.key.clone(), raw);
                        self.api()
                            .replace(&self.location.name, &PostParams::default(), &cm)
                            .await?;
                    }
                    None => {
                        let mut cm = ConfigMap::default();
                        cm.metadata.name = Some(self.location.name.clone());
                        cm.metadata.namespace = Some(self.location.namespace.clone());
                        cm.data = Some(BTreeMap::from([(self.location.key.clone(), raw)]));
                        self.api().create(&PostParams::default(), &cm).await?;
                    }
                }
                Ok(())
            },
        )
        .await
    }
}

#[async_trait]
impl RegistryStore for ConfigMapRegistry {
    async fn load(&self) -> Result<Registry> {
        let cm = self.get_config_map().await?.ok_or_else(|| {
            Error::internal_with_context(
                "registry",
                format!(
                    "ConfigMap {}/{} not found",
                    self.location.namespace, self.location.name
                ),
            )
        })?;
        let registry = self.parse(&cm)?;
        debug!(adapters = registry.len(), "loaded adapter registry");
        Ok(registry)
    }

    async fn upsert(&self, name: &str, entry: AdapterEntry) -> Result<()> {
        let status = entry.status;
        self.modify("registry_upsert", |registry| {
            registry.insert(name, entry.clone());
        })
        .await?;
        info!(adapter = %name, %status, "registered adapter");
        Ok(())
    }

    async fn set_status(&self, name: &str, status: AdapterStatus) -> Result<()> {
        self.modify("registry_set_status", |registry| {
            if !registry.set_status(name, status) {
                debug!(adapter = %name, "adapter not registered, status unchanged");
            }
        })
        .await?;
        info!(adapter = %name, %status, "updated adapter status");
        Ok(())
    }
}
