//! Heuristic label-expression parser
//!
//! Recognizes a fixed set of expression shapes over a `labels` map:
//!
//! | Shape | Example | Needs pods |
//! |-------|---------|------------|
//! | equality | `labels["app"] == "web"`, `labels["app"] != "web"` | no |
//! | containment | `labels["app"].contains("we")` | yes |
//! | membership | `labels["app"] in ["web", "api"]` | yes |
//! | prefix | `labels["app"].startsWith("we")` | yes |
//! | suffix | `labels["app"].endsWith("eb")` | yes |
//! | regex | `labels["app"].matches("^w.*")` | yes |
//!
//! Pod-backed shapes collect `key -> value` from every pod whose label
//! satisfies the expression (later pods win). A negated pod-backed shape
//! yields the complement instead: all labels of the pods that did not
//! match, minus `pod-template-hash`. Equality is a pure string match and is
//! never complemented.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use regex::Regex;

use aegis_common::POD_TEMPLATE_HASH_LABEL;

use crate::lister::pod_labels;

const QUOTES: &[char] = &['"', '\''];

/// Trim, strip wrapping quotes, unescape embedded quotes and close an
/// unterminated quote.
pub fn normalize(expr: &str) -> String {
    let mut expr = strip_wrapping_quotes(expr.trim()).to_string();
    expr = expr.replace("\\\"", "\"").replace("\\'", "'");
    expr = strip_wrapping_quotes(&expr).to_string();

    if expr.matches('"').count() % 2 != 0 {
        expr.push('"');
    } else if expr.matches('\'').count() % 2 != 0 {
        expr.push('\'');
    }
    expr
}

fn strip_wrapping_quotes(s: &str) -> &str {
    let s = s.strip_prefix(QUOTES).unwrap_or(s);
    s.strip_suffix(QUOTES).unwrap_or(s)
}

/// Whether the raw expression carries a negation marker
pub fn is_negated(raw: &str) -> bool {
    let raw = raw.trim();
    raw.starts_with('!')
        || raw.starts_with("'!")
        || raw.starts_with("\"!")
        || raw.contains(" != ")
}

/// One recognized expression shape
#[derive(Clone, Debug)]
pub enum LabelExpression {
    /// `labels["k"] == "v"` or `labels["k"] != "v"`
    Equality {
        /// Label key
        key: String,
        /// Label value
        value: String,
    },
    /// `labels["k"].contains("s")`
    Contains {
        /// Label key
        key: String,
        /// Substring
        needle: String,
    },
    /// `labels["k"] in ["a", "b"]`
    In {
        /// Label key
        key: String,
        /// Accepted values
        values: Vec<String>,
    },
    /// `labels["k"].startsWith("p")`
    StartsWith {
        /// Label key
        key: String,
        /// Prefix
        prefix: String,
    },
    /// `labels["k"].endsWith("s")`
    EndsWith {
        /// Label key
        key: String,
        /// Suffix
        suffix: String,
    },
    /// `labels["k"].matches("re")`
    Matches {
        /// Label key
        key: String,
        /// Compiled pattern
        pattern: Regex,
    },
}

impl LabelExpression {
    /// Parse a normalized expression. `None` if no shape matches.
    pub fn parse(expr: &str) -> Option<Self> {
        if let Some(op) = ["==", "!="].into_iter().find(|op| expr.contains(op)) {
            let (left, right) = expr.split_once(op)?;
            let key = if left.contains("labels[") {
                label_key(left)?.to_string()
            } else {
                left.trim().trim_start_matches('!').trim_matches(QUOTES).to_string()
            };
            if key.is_empty() {
                return None;
            }
            return Some(LabelExpression::Equality {
                key,
                value: right.trim().trim_matches(QUOTES).to_string(),
            });
        }

        let key = label_key(expr)?.to_string();
        if expr.contains(".contains(") {
            let needle = call_argument(expr, "contains")?.to_string();
            Some(LabelExpression::Contains { key, needle })
        } else if expr.contains(" in ") {
            Some(LabelExpression::In {
                key,
                values: membership_values(expr)?,
            })
        } else if expr.contains(".startsWith(") {
            let prefix = call_argument(expr, "startsWith")?.to_string();
            Some(LabelExpression::StartsWith { key, prefix })
        } else if expr.contains(".endsWith(") {
            let suffix = call_argument(expr, "endsWith")?.to_string();
            Some(LabelExpression::EndsWith { key, suffix })
        } else if expr.contains(".matches(") {
            let pattern = Regex::new(call_argument(expr, "matches")?).ok()?;
            Some(LabelExpression::Matches { key, pattern })
        } else {
            None
        }
    }

    /// Label key the expression is about
    pub fn key(&self) -> &str {
        match self {
            LabelExpression::Equality { key, .. }
            | LabelExpression::Contains { key, .. }
            | LabelExpression::In { key, .. }
            | LabelExpression::StartsWith { key, .. }
            | LabelExpression::EndsWith { key, .. }
            | LabelExpression::Matches { key, .. } => key,
        }
    }

    /// Whether evaluation needs the live pod list
    pub fn queries_pods(&self) -> bool {
        !matches!(self, LabelExpression::Equality { .. })
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            LabelExpression::Equality { value: expected, .. } => value == expected,
            LabelExpression::Contains { needle, .. } => value.contains(needle.as_str()),
            LabelExpression::In { values, .. } => values.iter().any(|v| v == value),
            LabelExpression::StartsWith { prefix, .. } => value.starts_with(prefix.as_str()),
            LabelExpression::EndsWith { suffix, .. } => value.ends_with(suffix.as_str()),
            LabelExpression::Matches { pattern, .. } => pattern.is_match(value),
        }
    }
}

/// Key inside `labels["..."]` or `labels['...']`
fn label_key(expr: &str) -> Option<&str> {
    const MARKER: &str = "labels[";
    let start = expr.find(MARKER)? + MARKER.len();
    let rest = expr[start..].trim_start();
    let quote = rest.chars().next().filter(|c| QUOTES.contains(c))?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end]).filter(|k| !k.is_empty())
}

/// Quoted argument of `.function(...)`
fn call_argument<'a>(expr: &'a str, function: &str) -> Option<&'a str> {
    let marker = format!(".{function}(");
    let start = expr.find(&marker)? + marker.len();
    let close = expr.rfind(')')?;
    if close < start {
        return None;
    }
    unquote(expr[start..close].trim())
}

fn unquote(s: &str) -> Option<&str> {
    let quote = s.chars().next().filter(|c| QUOTES.contains(c))?;
    if s.len() >= 2 && s.ends_with(quote) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Values of `... in [a, b]`
fn membership_values(expr: &str) -> Option<Vec<String>> {
    let (_, rest) = expr.split_once(" in ")?;
    let rest = rest.trim_start().strip_prefix('[')?;
    let end = rest.rfind(']')?;
    let values: Vec<String> = rest[..end]
        .split(',')
        .map(|v| v.trim().trim_matches(QUOTES).to_string())
        .filter(|v| !v.is_empty())
        .collect();
    (!values.is_empty()).then_some(values)
}

/// A parsed expression with its negation marker
#[derive(Clone, Debug)]
pub struct ParsedExpression {
    /// Whether the raw form was negated
    pub negated: bool,
    /// Recognized shape
    pub expression: LabelExpression,
}

impl ParsedExpression {
    /// Normalize and parse a raw expression
    pub fn parse(raw: &str) -> Option<Self> {
        let negated = is_negated(raw);
        LabelExpression::parse(&normalize(raw)).map(|expression| Self {
            negated,
            expression,
        })
    }

    /// Whether evaluation needs the live pod list
    pub fn queries_pods(&self) -> bool {
        self.expression.queries_pods()
    }

    /// Labels contributed by this expression given the namespace's pods
    pub fn evaluate(&self, pods: &[Pod]) -> BTreeMap<String, String> {
        if let LabelExpression::Equality { key, value } = &self.expression {
            return BTreeMap::from([(key.clone(), value.clone())]);
        }

        let key = self.expression.key();
        let mut matched = BTreeMap::new();
        for pod in pods {
            if let Some(value) = pod_labels(pod).get(key) {
                if self.expression.accepts(value) {
                    matched.insert(key.to_string(), value.clone());
                }
            }
        }

        if self.negated {
            complement(pods, &matched)
        } else {
            matched
        }
    }
}

/// Labels of pods carrying none of `excluded`, minus `pod-template-hash`
fn complement(pods: &[Pod], excluded: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut remaining = BTreeMap::new();
    for pod in pods {
        let labels = pod_labels(pod);
        let hit = excluded
            .iter()
            .any(|(k, v)| labels.get(k).is_some_and(|actual| actual == v));
        if hit {
            continue;
        }
        remaining.extend(
            labels
                .iter()
                .filter(|(k, _)| k.as_str() != POD_TEMPLATE_HASH_LABEL)
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    remaining
}

/// Result of evaluating one raw expression
#[derive(Clone, Debug, PartialEq)]
pub enum ExpressionOutcome {
    /// Recognized; contributes these labels (possibly none)
    Labels(BTreeMap<String, String>),
    /// No recognized shape; contributes nothing
    Unrecognized,
}

/// Parse and evaluate a raw expression against the namespace's pods
pub fn evaluate(raw: &str, pods: &[Pod]) -> ExpressionOutcome {
    match ParsedExpression::parse(raw) {
        Some(parsed) => ExpressionOutcome::Labels(parsed.evaluate(pods)),
        None => ExpressionOutcome::Unrecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{labels, pod};

    fn shop() -> Vec<Pod> {
        vec![
            pod("web-1", &[("app", "web"), ("tier", "front"), ("pod-template-hash", "abc")]),
            pod("api-1", &[("app", "api"), ("tier", "back"), ("pod-template-hash", "def")]),
            pod("db-1", &[("app", "database"), ("tier", "data")]),
        ]
    }

    #[test]
    fn normalize_strips_quotes_and_closes_them() {
        assert_eq!(
            normalize(r#"  'labels["app"] == "web"'  "#),
            r#"labels["app"] == "web""#
        );
        assert_eq!(
            normalize(r#""labels[\"app\"] == \"web\"""#),
            r#"labels["app"] == "web""#
        );
        assert_eq!(normalize(r#"labels["app"] == "web"#), r#"labels["app"] == "web""#);
    }

    #[test]
    fn negation_markers_are_detected_on_the_raw_form() {
        assert!(is_negated(r#"!labels["app"].contains("we")"#));
        assert!(is_negated(r#"'!labels["app"].startsWith("w")'"#));
        assert!(is_negated(r#"labels["app"] != "web""#));
        assert!(!is_negated(r#"labels["app"] == "web""#));
    }

    #[test]
    fn equality_needs_no_pods() {
        let outcome = evaluate(r#"labels["app"] == "web""#, &[]);
        assert_eq!(outcome, ExpressionOutcome::Labels(labels(&[("app", "web")])));
    }

    #[test]
    fn inequality_is_not_complemented() {
        let outcome = evaluate(r#"labels["app"] != "web""#, &shop());
        assert_eq!(outcome, ExpressionOutcome::Labels(labels(&[("app", "web")])));
    }

    #[test]
    fn membership_keeps_values_seen_on_live_pods() {
        let outcome = evaluate(r#"labels["app"] in ["api", "cache"]"#, &shop());
        assert_eq!(outcome, ExpressionOutcome::Labels(labels(&[("app", "api")])));
    }

    #[test]
    fn prefix_and_suffix_query_pods() {
        assert_eq!(
            evaluate(r#"labels["app"].startsWith("data")"#, &shop()),
            ExpressionOutcome::Labels(labels(&[("app", "database")]))
        );
        assert_eq!(
            evaluate(r#"labels["tier"].endsWith("nt")"#, &shop()),
            ExpressionOutcome::Labels(labels(&[("tier", "front")]))
        );
    }

    #[test]
    fn containment_uses_live_label_values() {
        assert_eq!(
            evaluate(r#"labels["app"].contains("tab")"#, &shop()),
            ExpressionOutcome::Labels(labels(&[("app", "database")]))
        );
    }

    #[test]
    fn regex_matches_against_pod_labels() {
        assert_eq!(
            evaluate(r#"labels["app"].matches("^a.i$")"#, &shop()),
            ExpressionOutcome::Labels(labels(&[("app", "api")]))
        );
    }

    #[test]
    fn negated_expression_yields_other_pods_labels_without_template_hash() {
        let outcome = evaluate(r#"!labels["app"].startsWith("w")"#, &shop());
        let ExpressionOutcome::Labels(result) = outcome else {
            panic!("expected labels");
        };
        assert!(!result.contains_key("pod-template-hash"));
        // web-1 matched and is excluded, later pods win on collision
        assert_eq!(result, labels(&[("app", "database"), ("tier", "data")]));
    }

    #[test]
    fn recognized_but_unmatched_contributes_nothing() {
        assert_eq!(
            evaluate(r#"labels["app"] in ["cache"]"#, &shop()),
            ExpressionOutcome::Labels(BTreeMap::new())
        );
    }

    #[test]
    fn unknown_shapes_are_reported() {
        assert_eq!(evaluate("size(labels) > 2", &shop()), ExpressionOutcome::Unrecognized);
        assert_eq!(
            evaluate(r#"labels["app"].matches("(")"#, &shop()),
            ExpressionOutcome::Unrecognized
        );
        assert_eq!(evaluate(r#"labels[""] == "x""#, &shop()), ExpressionOutcome::Unrecognized);
    }
}
