//! Per-intent dispatch reports

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use aegis_common::crd::KubeAegisPolicy;
use aegis_common::registry::AdapterStatus;
use aegis_common::{Error, Result};

/// Default directory for report files
pub const DEFAULT_REPORT_DIR: &str = "./report";

/// What one successful dispatch produced
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
    /// Intent name
    pub kap_name: String,
    /// Intent namespace
    pub kap_namespace: String,
    /// Comma-separated intent types
    pub policy_type: String,
    /// Comma-separated rule actions
    pub policy_actions: String,
    /// Intent creation time, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    /// Validation failures seen before dispatch
    pub validation_errors: usize,
    /// Adapter that applied the policy
    pub adapter_name: String,
    /// Adapter status when dispatched
    pub adapter_status: String,
    /// Full name of the applied backend object
    pub adapter_policies: String,
}

impl PolicyReport {
    /// Report skeleton for an intent; adapter fields are filled per delivery
    pub fn for_intent(intent: &KubeAegisPolicy) -> Self {
        Self {
            kap_name: intent.name_any(),
            kap_namespace: intent.namespace_or_default(),
            policy_type: intent.policy_types().join(","),
            policy_actions: intent.policy_actions().join(","),
            creation_timestamp: intent
                .creation_timestamp()
                .map(|t| rfc3339(t.0)),
            validation_errors: 0,
            ..Default::default()
        }
    }

    /// This report for one adapter's delivery
    pub fn delivered_by(&self, adapter: &str, status: AdapterStatus, policy: &str) -> Self {
        Self {
            adapter_name: adapter.to_string(),
            adapter_status: status.to_string(),
            adapter_policies: policy.to_string(),
            ..self.clone()
        }
    }

    fn file_name(name: &str, namespace: &str) -> String {
        format!("{name}-{namespace}.json")
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Destination for reports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Persist a report, replacing any earlier one for the same intent
    async fn write(&self, report: &PolicyReport) -> Result<()>;

    /// Latest report for an intent, if any
    async fn read(&self, name: &str, namespace: &str) -> Result<Option<PolicyReport>>;
}

/// Writes `<dir>/<name>-<namespace>.json`
#[derive(Clone, Debug)]
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    /// Create a sink writing under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Report directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn write(&self, report: &PolicyReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::internal_with_context("report", format!("create {}: {e}", self.dir.display()))
        })?;
        let path = self
            .dir
            .join(PolicyReport::file_name(&report.kap_name, &report.kap_namespace));
        let body = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&path, body).await.map_err(|e| {
            Error::internal_with_context("report", format!("write {}: {e}", path.display()))
        })?;
        info!(policy = %report.kap_name, namespace = %report.kap_namespace, path = %path.display(), "report created");
        Ok(())
    }

    async fn read(&self, name: &str, namespace: &str) -> Result<Option<PolicyReport>> {
        let path = self.dir.join(PolicyReport::file_name(name, namespace));
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::internal_with_context(
                    "report",
                    format!("read {}: {e}", path.display()),
                ))
            }
        };
        let report = serde_json::from_slice(&body)
            .map_err(|e| Error::serialization_for_kind("PolicyReport", e.to_string()))?;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> KubeAegisPolicy {
        serde_yaml::from_str(
            r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: web
  namespace: shop
  creationTimestamp: "2026-01-02T03:04:05Z"
spec:
  enableReport: true
  intentRequest:
    - type: network
      rule:
        action: Allow
    - type: system
      rule:
        action: Block
"#,
        )
        .unwrap()
    }

    #[test]
    fn skeleton_carries_intent_identity_and_shape() {
        let report = PolicyReport::for_intent(&intent());
        assert_eq!(report.kap_name, "web");
        assert_eq!(report.kap_namespace, "shop");
        assert_eq!(report.policy_type, "network,system");
        assert_eq!(report.policy_actions, "Allow,Block");
        assert_eq!(report.creation_timestamp.as_deref(), Some("2026-01-02T03:04:05Z"));

        let delivered = report.delivered_by(
            "kubeaegis-cilium",
            AdapterStatus::Online,
            "CiliumNetworkPolicy/kubeaegis-web",
        );
        let json = serde_json::to_value(&delivered).unwrap();
        assert_eq!(json["kapName"], "web");
        assert_eq!(json["adapterName"], "kubeaegis-cilium");
        assert_eq!(json["adapterStatus"], "online");
        assert_eq!(json["adapterPolicies"], "CiliumNetworkPolicy/kubeaegis-web");
        assert_eq!(json["validationErrors"], 0);
    }

    #[tokio::test]
    async fn file_sink_replaces_the_report_for_an_intent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileReportSink::new(dir.path().join("report"));
        assert_eq!(sink.read("web", "shop").await.unwrap(), None);

        let base = PolicyReport::for_intent(&intent());
        sink.write(&base.delivered_by("a", AdapterStatus::Online, "X/one"))
            .await
            .unwrap();
        sink.write(&base.delivered_by("b", AdapterStatus::Online, "Y/two"))
            .await
            .unwrap();

        assert!(dir.path().join("report/web-shop.json").exists());
        let read = sink.read("web", "shop").await.unwrap().unwrap();
        assert_eq!(read.adapter_name, "b");
        assert_eq!(read.adapter_policies, "Y/two");
    }
}
