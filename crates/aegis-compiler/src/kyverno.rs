//! Kyverno target: one admission rule per cluster request
//!
//! A request's action points must agree on one operation kind (`mutate`,
//! `validate` or `verifyImage`). The first kind seen wins; points of another
//! kind are logged and ignored. A request with no operation is dropped.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::warn;

use aegis_common::crd::{
    Action, ActionPoint, EventResource, IntentRequest, KubeAegisPolicy, MatchCondition,
    MutateResource, ValidateResource, VerifyImageResource,
};
use aegis_common::kube_utils::ObjectMeta;
use aegis_common::policy::kyverno::{
    Attestor, AttestorSet, CelExpression, CelValidation, Condition, Deny, DenyConditions,
    ImageVerification, KeylessAttestor, KyvernoPolicySpec, KyvernoRule, LabelSelector,
    MatchResources, Mutation, PodSecurity, Rekor, ResourceDescription, ResourceFilter,
    StaticKeyAttestor, Validation,
};
use aegis_common::policy::{Backend, BackendPolicy, KyvernoPolicy};
use aegis_common::Result;

use crate::target::{compile_error, PolicyTarget};

const BACKEND: Backend = Backend::Kyverno;

const POD_SECURITY_LEVELS: [&str; 3] = ["privileged", "baseline", "restricted"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Mutate,
    Validate,
    VerifyImage,
}

impl Operation {
    fn of(resource: &EventResource) -> Option<Self> {
        match resource {
            EventResource::Mutate(_) => Some(Operation::Mutate),
            EventResource::Validate(_) => Some(Operation::Validate),
            EventResource::VerifyImage(_) => Some(Operation::VerifyImage),
            _ => None,
        }
    }
}

pub(crate) struct KyvernoTarget {
    intent: String,
    spec: KyvernoPolicySpec,
    pending: Option<(KyvernoRule, Option<Operation>)>,
}

impl KyvernoTarget {
    pub(crate) fn new(intent: &KubeAegisPolicy) -> Self {
        let enforce = intent
            .spec
            .intent_requests
            .first()
            .is_some_and(|r| r.rule.action == Action::Enforce);
        Self {
            intent: intent.name_any(),
            spec: KyvernoPolicySpec {
                background: true,
                validation_failure_action: if enforce { "Enforce" } else { "Audit" }.to_string(),
                rules: Vec::new(),
            },
            pending: None,
        }
    }

    /// `kyverno-<intent>-<type>`, suffixed `-<n>` until unique
    fn rule_name(&self, request: &IntentRequest) -> String {
        let base = format!("kyverno-{}-{}", self.intent, request.type_);
        let taken = |name: &str| self.spec.rules.iter().any(|r| r.name == name);
        if !taken(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let name = format!("{base}-{n}");
            if !taken(&name) {
                return name;
            }
            n += 1;
        }
    }
}

/// Build `match.any` / `match.all` from the selector entries
fn match_resources(
    request: &IntentRequest,
    labels: &BTreeMap<String, String>,
) -> Result<MatchResources> {
    let scope = request
        .selector
        .matches
        .first()
        .and_then(|m| m.condition)
        .ok_or_else(|| compile_error(BACKEND, "first match entry requires a condition (any or all)"))?;

    let selector = (!labels.is_empty()).then(|| LabelSelector {
        match_labels: labels.clone(),
    });
    let mut resources = MatchResources::default();
    for entry in &request.selector.matches {
        let filter = ResourceFilter {
            resources: ResourceDescription {
                kinds: if entry.kind.is_empty() {
                    Vec::new()
                } else {
                    vec![entry.kind.clone()]
                },
                namespaces: if entry.namespace.is_empty() {
                    Vec::new()
                } else {
                    vec![entry.namespace.clone()]
                },
                name: entry.name.clone(),
                selector: selector.clone(),
            },
        };
        match entry.condition.unwrap_or(scope) {
            MatchCondition::Any => resources.any.push(filter),
            MatchCondition::All => resources.all.push(filter),
        }
    }
    Ok(resources)
}

/// Flatten detail maps into one map, later keys winning
fn merged_details(details: &[BTreeMap<String, String>]) -> Map<String, Value> {
    details
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Metadata field a label/annotation operation targets
fn metadata_field(kind: &str) -> Option<&'static str> {
    match kind {
        "annotations" | "annotation" => Some("annotations"),
        "label" | "labels" => Some("labels"),
        _ => None,
    }
}

fn add_mutation(rule: &mut KyvernoRule, resource: &MutateResource) -> Result<()> {
    let field = metadata_field(&resource.kind).ok_or_else(|| {
        compile_error(
            BACKEND,
            format!("unsupported mutate kind {:?}", resource.kind),
        )
    })?;
    let mutation = rule.mutate.get_or_insert_with(|| Mutation {
        patch_strategic_merge: json!({ "metadata": {} }),
    });
    let metadata = mutation
        .patch_strategic_merge
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| compile_error(BACKEND, "patch has no metadata object"))?;
    let entry = metadata
        .entry(field)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(map) = entry.as_object_mut() {
        map.extend(merged_details(&resource.details));
    }
    Ok(())
}

fn add_validation(rule: &mut KyvernoRule, resource: &ValidateResource) -> Result<()> {
    let validation = rule.validate.get_or_insert_with(Validation::default);
    if let Some(message) = resource.details.iter().find_map(|d| d.get("message")) {
        validation.message = message.clone();
    }

    if let Some(field) = metadata_field(&resource.kind) {
        validation.pattern = Some(json!({ "metadata": { field: merged_details(&resource.details) } }));
        return Ok(());
    }

    match resource.kind.as_str() {
        "cel" => {
            let expressions = resource.details.iter().filter_map(|d| {
                d.get("expression").map(|expression| CelExpression {
                    expression: expression.clone(),
                    message: d.get("message").cloned().unwrap_or_default(),
                })
            });
            validation
                .cel
                .get_or_insert_with(CelValidation::default)
                .expressions
                .extend(expressions);
        }
        "podSecurity" => {
            let (level, version) = resource
                .details
                .iter()
                .find_map(|d| Some((d.get("level")?, d.get("version")?)))
                .ok_or_else(|| compile_error(BACKEND, "podSecurity requires level and version"))?;
            if !POD_SECURITY_LEVELS.contains(&level.as_str()) {
                return Err(compile_error(
                    BACKEND,
                    format!("unknown podSecurity level {level:?}"),
                ));
            }
            validation.pod_security = Some(PodSecurity {
                level: level.clone(),
                version: version.clone(),
            });
        }
        "deny" => {
            let conditions = &mut validation
                .deny
                .get_or_insert_with(|| Deny {
                    conditions: DenyConditions::default(),
                })
                .conditions;
            for filter in &resource.filter {
                let condition = Condition {
                    key: filter.key.clone(),
                    operator: filter.operator.clone(),
                    value: filter.value.clone(),
                };
                match filter.condition.to_ascii_lowercase().as_str() {
                    "any" => conditions.any.push(condition),
                    "all" => conditions.all.push(condition),
                    other => warn!(condition = %other, key = %filter.key, "deny filter without any/all, skipped"),
                }
            }
        }
        "pattern" => {
            validation.pattern = Some(Value::Object(merged_details(&resource.details)));
        }
        other => {
            return Err(compile_error(
                BACKEND,
                format!("unsupported validate kind {other:?}"),
            ))
        }
    }
    Ok(())
}

fn attestor_for_key(key: &str) -> Option<Attestor> {
    let keys = if key.starts_with("kms:") {
        StaticKeyAttestor {
            kms: key.to_string(),
            ..Default::default()
        }
    } else if key.starts_with("{{") || key.contains("-----BEGIN") {
        StaticKeyAttestor {
            public_keys: key.to_string(),
            ..Default::default()
        }
    } else {
        return None;
    };
    Some(Attestor {
        keys: Some(keys),
        keyless: None,
    })
}

fn add_image_verification(rule: &mut KyvernoRule, resource: &VerifyImageResource) -> Result<()> {
    let image_references: Vec<String> = resource.images().cloned().collect();
    if image_references.is_empty() {
        return Err(compile_error(BACKEND, "verifyImage requires at least one image"));
    }

    let mut entries: Vec<Attestor> = Vec::new();
    for key in &resource.keys {
        match attestor_for_key(key) {
            Some(attestor) => entries.push(attestor),
            None => warn!("verifyImage key is neither a kms URI nor a public key, skipped"),
        }
    }
    entries.extend(resource.keyless.iter().map(|k| Attestor {
        keys: None,
        keyless: Some(KeylessAttestor {
            subject: k.subject.clone(),
            issuer: k.issuer.clone(),
            rekor: (!k.url.is_empty()).then(|| Rekor { url: k.url.clone() }),
        }),
    }));

    let attestors = if entries.is_empty() {
        Vec::new()
    } else {
        vec![AttestorSet {
            count: (resource.count > 0).then_some(resource.count),
            entries,
        }]
    };
    rule.verify_images.push(ImageVerification {
        image_references,
        attestors,
    });
    Ok(())
}

impl PolicyTarget for KyvernoTarget {
    const BACKEND: Backend = BACKEND;

    fn selects(&self, request: &IntentRequest, _labels: &BTreeMap<String, String>) -> bool {
        !request.selector.matches.is_empty()
    }

    fn begin_request(
        &mut self,
        request: &IntentRequest,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let rule = KyvernoRule {
            name: self.rule_name(request),
            match_: match_resources(request, labels)?,
            ..Default::default()
        };
        self.pending = Some((rule, None));
        Ok(())
    }

    fn add_action_point(&mut self, point: &ActionPoint) -> Result<()> {
        let Some((rule, kind)) = self.pending.as_mut() else {
            return Ok(());
        };
        let Some(operation) = Operation::of(&point.resource) else {
            warn!(rule = %rule.name, sub_type = %point.sub_type(), "action point is not an admission operation, skipped");
            return Ok(());
        };
        if let Some(existing) = *kind {
            if existing != operation {
                warn!(
                    rule = %rule.name,
                    kept = ?existing,
                    ignored = ?operation,
                    "rule mixes operation kinds, ignoring later kind"
                );
                return Ok(());
            }
        }
        *kind = Some(operation);

        match &point.resource {
            EventResource::Mutate(r) => add_mutation(rule, r),
            EventResource::Validate(r) => add_validation(rule, r),
            EventResource::VerifyImage(r) => add_image_verification(rule, r),
            _ => Ok(()),
        }
    }

    fn end_request(&mut self) -> Result<()> {
        match self.pending.take() {
            Some((rule, Some(_))) => self.spec.rules.push(rule),
            Some((rule, None)) => {
                warn!(rule = %rule.name, "no operation defined in the rule, dropped");
            }
            None => {}
        }
        Ok(())
    }

    fn finish(self, metadata: ObjectMeta) -> Result<Option<BackendPolicy>> {
        if self.spec.rules.is_empty() {
            return Ok(None);
        }
        Ok(Some(BackendPolicy::Kyverno(KyvernoPolicy::new(
            metadata, self.spec,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{intent, StaticPods};
    use crate::PolicyCompiler;

    use super::*;

    async fn compile(yaml: &str) -> Result<Option<BackendPolicy>> {
        PolicyCompiler::new(StaticPods::resolver(vec![]))
            .compile(Backend::Kyverno, &intent(yaml))
            .await
    }

    fn kyverno(policy: Option<BackendPolicy>) -> KyvernoPolicy {
        match policy {
            Some(BackendPolicy::Kyverno(p)) => p,
            other => panic!("expected a kyverno policy, got {other:?}"),
        }
    }

    const INTENT: &str = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: admit
  namespace: shop
spec:
  intentRequest:
    - type: cluster
      selector:
        match:
          - kind: Pod
            condition: any
            namespace: shop
            matchLabels: {app: web}
      rule:
        action: Enforce
        actionPoint:
          - subType: mutate
            resource:
              kind: annotations
              details:
                - {team: payments}
          - subType: mutate
            resource:
              kind: label
              details:
                - {tier: frontend}
    - type: cluster
      selector:
        match:
          - kind: Pod
            condition: all
            namespace: shop
      rule:
        action: Enforce
        actionPoint:
          - subType: verifyImage
            resource:
              details:
                - {"ghcr.io/acme/*": ""}
              keys: ["kms://projects/acme/keys/cosign", "{{ keys.cosign }}"]
              keyless:
                - subject: "https://github.com/acme/*"
                  issuer: https://token.actions.githubusercontent.com
                  url: https://rekor.sigstore.dev
              count: 1
"#;

    #[tokio::test]
    async fn story_cluster_requests_become_named_rules() {
        let policy = kyverno(compile(INTENT).await.unwrap());
        assert_eq!(policy.metadata.name, "kyverno-admit");
        assert!(policy.spec.background);
        assert_eq!(policy.spec.validation_failure_action, "Enforce");

        let names: Vec<&str> = policy.spec.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["kyverno-admit-cluster", "kyverno-admit-cluster-1"]);

        let first = &policy.spec.rules[0];
        let filter = &first.match_.any[0].resources;
        assert_eq!(filter.kinds, vec!["Pod"]);
        assert_eq!(filter.namespaces, vec!["shop"]);
        assert_eq!(
            filter.selector.as_ref().unwrap().match_labels.get("app"),
            Some(&"web".to_string())
        );
        assert!(policy.spec.rules[1].match_.all[0].resources.selector.is_none());
    }

    #[tokio::test]
    async fn story_mutations_merge_into_one_patch() {
        let policy = kyverno(compile(INTENT).await.unwrap());
        let patch = &policy.spec.rules[0].mutate.as_ref().unwrap().patch_strategic_merge;
        assert_eq!(patch["metadata"]["annotations"]["team"], "payments");
        assert_eq!(patch["metadata"]["labels"]["tier"], "frontend");
    }

    #[tokio::test]
    async fn story_verify_image_attestors_by_key_shape() {
        let policy = kyverno(compile(INTENT).await.unwrap());
        let verify = &policy.spec.rules[1].verify_images[0];
        assert_eq!(verify.image_references, vec!["ghcr.io/acme/*"]);

        let set = &verify.attestors[0];
        assert_eq!(set.count, Some(1));
        let keys = set.entries[0].keys.as_ref().unwrap();
        assert_eq!(keys.kms, "kms://projects/acme/keys/cosign");
        assert_eq!(
            set.entries[1].keys.as_ref().unwrap().public_keys,
            "{{ keys.cosign }}"
        );
        let keyless = set.entries[2].keyless.as_ref().unwrap();
        assert_eq!(keyless.issuer, "https://token.actions.githubusercontent.com");
        assert_eq!(keyless.rekor.as_ref().unwrap().url, "https://rekor.sigstore.dev");
    }

    #[tokio::test]
    async fn story_audit_unless_first_request_enforces() {
        let yaml = INTENT.replacen("action: Enforce", "action: Block", 1);
        let policy = kyverno(compile(&yaml).await.unwrap());
        assert_eq!(policy.spec.validation_failure_action, "Audit");
    }

    #[tokio::test]
    async fn story_missing_match_condition_fails() {
        let yaml = INTENT.replacen("            condition: any\n", "", 1);
        let err = compile(&yaml).await.unwrap_err();
        assert!(matches!(err, aegis_common::Error::Compile { .. }));
    }

    #[tokio::test]
    async fn story_validation_kinds() {
        let yaml = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: guard
  namespace: shop
spec:
  intentRequest:
    - type: cluster
      selector:
        match:
          - kind: Pod
            condition: any
      rule:
        action: Audit
        actionPoint:
          - subType: validate
            resource:
              kind: podSecurity
              details:
                - {level: restricted, version: latest}
          - subType: validate
            resource:
              kind: deny
              filter:
                - Condition: any
                  key: "{{ request.operation }}"
                  operator: AnyIn
                  value: [DELETE]
          - subType: validate
            resource:
              kind: cel
              details:
                - {expression: "object.spec.hostNetwork == false", message: no host network}
"#;
        let policy = kyverno(compile(yaml).await.unwrap());
        let validation = policy.spec.rules[0].validate.as_ref().unwrap();
        assert_eq!(validation.pod_security.as_ref().unwrap().level, "restricted");
        let deny = &validation.deny.as_ref().unwrap().conditions;
        assert_eq!(deny.any[0].operator, "AnyIn");
        assert_eq!(deny.any[0].value, vec!["DELETE"]);
        let cel = validation.cel.as_ref().unwrap();
        assert_eq!(cel.expressions[0].message, "no host network");
        assert_eq!(validation.message, "no host network");

        let bad_level = yaml.replace("level: restricted", "level: strict");
        assert!(compile(&bad_level).await.is_err());
    }

    #[tokio::test]
    async fn story_requests_without_operations_are_dropped() {
        let yaml = r#"
apiVersion: cclab.kubeaegis.com/v1
kind: KubeAegisPolicy
metadata:
  name: empty
  namespace: shop
spec:
  intentRequest:
    - type: cluster
      selector:
        match:
          - kind: Pod
            condition: any
      rule:
        action: Audit
        actionPoint:
          - subType: http
            resource:
              methods: [GET]
"#;
        assert!(compile(yaml).await.unwrap().is_none());
    }
}
