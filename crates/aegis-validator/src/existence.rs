//! Stage one: everything the intent refers to exists

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use aegis_common::crd::{IntentRequest, IntentType, KubeAegisPolicy};
use aegis_common::Result;
use aegis_selector::{merge_match_labels, pod_labels, CelPredicate};

use crate::cluster::{WorkloadKind, NAMESPACE_ACTIVE};
use crate::report::ValidationFailure;
use crate::validator::{request_field, IntentValidator};

impl IntentValidator {
    pub(crate) async fn check_existence(
        &self,
        intent: &KubeAegisPolicy,
    ) -> Result<Vec<ValidationFailure>> {
        let default_ns = intent.namespace_or_default();
        let mut failures = Vec::new();
        let mut namespaces_checked = BTreeSet::new();

        for (index, request) in intent.spec.intent_requests.iter().enumerate() {
            let field = request_field(index);

            if request.type_ == IntentType::System
                && (!request.rule.from.is_empty() || !request.rule.to.is_empty())
            {
                failures.push(ValidationFailure::new(
                    format!("{field}.type"),
                    "system request declares from/to peers; network is most likely the intended type",
                ));
            }

            for (m, entry) in request.selector.matches.iter().enumerate() {
                let namespace = if entry.namespace.is_empty() {
                    default_ns.as_str()
                } else {
                    entry.namespace.as_str()
                };
                if namespaces_checked.insert(namespace.to_string()) {
                    if let Some(failure) = self
                        .check_namespace(namespace, format!("{field}.selector.match[{m}].namespace"))
                        .await?
                    {
                        failures.push(failure);
                    }
                }
            }

            failures.extend(self.check_matches(request, &field, &default_ns).await?);
            failures.extend(self.check_expressions(request, &field, &default_ns).await?);
        }
        Ok(failures)
    }

    async fn check_namespace(
        &self,
        namespace: &str,
        field: String,
    ) -> Result<Option<ValidationFailure>> {
        Ok(match self.cluster.namespace_phase(namespace).await? {
            None => Some(ValidationFailure::new(
                field,
                format!("namespace '{namespace}' not found"),
            )),
            Some(phase) if phase != NAMESPACE_ACTIVE => Some(ValidationFailure::new(
                field,
                format!("namespace '{namespace}' is not in an active phase ({phase})"),
            )),
            Some(_) => None,
        })
    }

    /// Each checked kind must select at least one live object
    async fn check_matches(
        &self,
        request: &IntentRequest,
        field: &str,
        default_ns: &str,
    ) -> Result<Vec<ValidationFailure>> {
        let labels = merge_match_labels(&request.selector.matches);
        let mut failures = Vec::new();

        for (m, entry) in request.selector.matches.iter().enumerate() {
            let Some(kind) = WorkloadKind::from_match_kind(&entry.kind) else {
                debug!(kind = %entry.kind, "match kind not checked for existence");
                continue;
            };
            let namespace = if kind == WorkloadKind::Pod {
                request.target_namespace(default_ns)
            } else if entry.namespace.is_empty() {
                default_ns
            } else {
                &entry.namespace
            };
            if !self.cluster.any_matching(kind, namespace, &labels).await? {
                failures.push(ValidationFailure::new(
                    format!("{field}.selector.match[{m}]"),
                    format!(
                        "no matching {} found in namespace {namespace} with labels {}",
                        kind.plural(),
                        describe(&labels)
                    ),
                ));
            }
        }
        Ok(failures)
    }

    /// Each CEL expression must hold for at least one pod in the namespace
    async fn check_expressions(
        &self,
        request: &IntentRequest,
        field: &str,
        default_ns: &str,
    ) -> Result<Vec<ValidationFailure>> {
        if request.selector.cel.is_empty() {
            return Ok(Vec::new());
        }
        let namespace = request.target_namespace(default_ns);
        let pods = self
            .resolver
            .pods()
            .list_pods(namespace, &BTreeMap::new())
            .await?;

        let mut failures = Vec::new();
        for (c, raw) in request.selector.cel.iter().enumerate() {
            let field = format!("{field}.selector.cel[{c}]");
            let predicate = match CelPredicate::compile(raw) {
                Ok(predicate) => predicate,
                Err(e) => {
                    failures.push(ValidationFailure::new(field, e.to_string()));
                    continue;
                }
            };

            let mut found = false;
            for pod in &pods {
                match predicate.matches(pod_labels(pod)) {
                    Ok(true) => {
                        found = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        failures.push(ValidationFailure::new(field.clone(), e.to_string()));
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                failures.push(ValidationFailure::new(
                    field,
                    format!(
                        "no resources found in namespace {namespace} matching the CEL expression: {}",
                        predicate.source()
                    ),
                ));
            }
        }
        Ok(failures)
    }
}

/// `k=v,k2=v2`, or `<any>` for an empty set
pub(crate) fn describe(labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        "<any>".to_string()
    } else {
        aegis_common::kube_utils::label_selector(labels)
    }
}
