//! Validation outcome

use aegis_common::Error;

/// Validation stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Namespaces, selected objects and CEL expressions exist
    Existence,
    /// Per-type preconditions hold
    Precondition,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Existence => f.write_str("existence"),
            Stage::Precondition => f.write_str("precondition"),
        }
    }
}

/// One failed check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Field path, e.g. `spec.intentRequest[0].rule.to[1].port`
    pub field: String,
    /// What is wrong
    pub message: String,
}

impl ValidationFailure {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// As a structured error for `policy`
    pub fn to_error(&self, policy: &str) -> Error {
        Error::validation_for_field(policy, &self.field, &self.message)
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of validating one intent
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Stage that failed, `None` when the intent is valid
    pub stage: Option<Stage>,
    /// Every failure collected in that stage
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub(crate) fn failed(stage: Stage, failures: Vec<ValidationFailure>) -> Self {
        Self {
            stage: Some(stage),
            failures,
        }
    }

    /// Whether both stages passed
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure messages with their field paths
    pub fn messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }

    /// One-line summary for status
    pub fn summary(&self) -> String {
        match self.stage {
            Some(stage) => format!("{stage} check failed: {}", self.messages().join("; ")),
            None => String::new(),
        }
    }
}
