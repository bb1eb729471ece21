//! Selector resolution

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use aegis_common::crd::{Match, Selector};
use aegis_common::Result;

use crate::expression::{ExpressionOutcome, ParsedExpression};
use crate::lister::PodLister;

/// Merge `matchLabels` of every entry in list order; later entries win
pub fn merge_match_labels(matches: &[Match]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for m in matches {
        labels.extend(m.match_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    labels
}

/// Resolves selectors against live pods
#[derive(Clone)]
pub struct SelectorResolver {
    pods: Arc<dyn PodLister>,
}

impl SelectorResolver {
    /// Create a resolver
    pub fn new(pods: Arc<dyn PodLister>) -> Self {
        Self { pods }
    }

    /// The pod lister this resolver queries
    pub fn pods(&self) -> &Arc<dyn PodLister> {
        &self.pods
    }

    /// Resolve a selector into one label map.
    ///
    /// Expression labels are merged first, then `match` labels, so a `match`
    /// entry wins on key collision. An empty result means the selector
    /// targets nothing and the caller should skip the request.
    pub async fn resolve(
        &self,
        selector: &Selector,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut labels = self.expression_labels(&selector.cel, namespace).await?;
        labels.extend(merge_match_labels(&selector.matches));
        debug!(namespace = %namespace, labels = ?labels, "resolved selector");
        Ok(labels)
    }

    /// Labels contributed by the expression list; later expressions win
    pub async fn expression_labels(
        &self,
        expressions: &[String],
        namespace: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        if expressions.is_empty() {
            return Ok(labels);
        }

        let parsed: Vec<(&String, Option<ParsedExpression>)> = expressions
            .iter()
            .map(|raw| (raw, ParsedExpression::parse(raw)))
            .collect();

        let pods = if parsed
            .iter()
            .any(|(_, p)| p.as_ref().is_some_and(ParsedExpression::queries_pods))
        {
            self.pods.list_pods(namespace, &BTreeMap::new()).await?
        } else {
            Vec::new()
        };

        for (raw, expression) in parsed {
            let outcome = match expression {
                Some(expression) => ExpressionOutcome::Labels(expression.evaluate(&pods)),
                None => ExpressionOutcome::Unrecognized,
            };
            match outcome {
                ExpressionOutcome::Labels(found) => labels.extend(found),
                ExpressionOutcome::Unrecognized => {
                    warn!(expression = %raw, namespace = %namespace, "unrecognized label expression ignored")
                }
            }
        }
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lister::MockPodLister;
    use crate::testing::{labels, pod};

    fn matching(pairs: &[(&str, &str)]) -> Match {
        Match {
            kind: "Pod".to_string(),
            namespace: "ns1".to_string(),
            match_labels: labels(pairs),
            ..Default::default()
        }
    }

    #[test]
    fn later_match_entry_wins_on_overlap() {
        let merged = merge_match_labels(&[
            matching(&[("app", "web"), ("tier", "front")]),
            matching(&[("app", "api")]),
        ]);
        assert_eq!(merged, labels(&[("app", "api"), ("tier", "front")]));
    }

    #[tokio::test]
    async fn match_only_selector_never_lists_pods() {
        let mut lister = MockPodLister::new();
        lister.expect_list_pods().never();
        let resolver = SelectorResolver::new(Arc::new(lister));

        let selector = Selector {
            matches: vec![matching(&[("app", "web")])],
            cel: vec![r#"labels["env"] == "prod""#.to_string()],
        };
        let resolved = resolver.resolve(&selector, "ns1").await.unwrap();
        assert_eq!(resolved, labels(&[("app", "web"), ("env", "prod")]));
    }

    #[tokio::test]
    async fn match_labels_override_expression_labels() {
        let mut lister = MockPodLister::new();
        lister
            .expect_list_pods()
            .withf(|ns, labels| ns == "ns1" && labels.is_empty())
            .times(1)
            .returning(|_, _| Ok(vec![pod("a", &[("app", "api-gateway")])]));
        let resolver = SelectorResolver::new(Arc::new(lister));

        let selector = Selector {
            matches: vec![matching(&[("app", "web")])],
            cel: vec![r#"labels["app"].startsWith("api")"#.to_string()],
        };
        let resolved = resolver.resolve(&selector, "ns1").await.unwrap();
        assert_eq!(resolved, labels(&[("app", "web")]));
    }

    #[tokio::test]
    async fn unrecognized_expressions_contribute_nothing() {
        let lister = MockPodLister::new();
        let resolver = SelectorResolver::new(Arc::new(lister));

        let selector = Selector {
            matches: vec![],
            cel: vec!["size(labels) > 1".to_string()],
        };
        assert!(resolver.resolve(&selector, "ns1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pod_listing_failure_propagates() {
        let mut lister = MockPodLister::new();
        lister
            .expect_list_pods()
            .returning(|_, _| Err(aegis_common::Error::internal("apiserver down")));
        let resolver = SelectorResolver::new(Arc::new(lister));

        let selector = Selector {
            matches: vec![],
            cel: vec![r#"labels["app"] in ["web"]"#.to_string()],
        };
        assert!(resolver.resolve(&selector, "ns1").await.is_err());
    }
}
