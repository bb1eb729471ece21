//! CEL predicates over pod labels
//!
//! Expressions see one variable, `labels`, holding the pod's labels as a
//! string map. The result must be a boolean.

use std::collections::BTreeMap;

use cel_interpreter::{Context, Program, Value};

use aegis_common::error::UNKNOWN_CONTEXT;
use aegis_common::{Error, Result};

use crate::expression::normalize;

/// A compiled CEL expression
pub struct CelPredicate {
    source: String,
    program: Program,
}

impl CelPredicate {
    /// Compile a raw expression, normalized the same way as the heuristic parser
    pub fn compile(raw: &str) -> Result<Self> {
        let source = normalize(raw);
        let program = Program::compile(&source).map_err(|e| {
            Error::validation_for_field(
                UNKNOWN_CONTEXT,
                "selector.cel",
                format!("invalid CEL expression {source}: {e}"),
            )
        })?;
        Ok(Self { source, program })
    }

    /// Normalized expression text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one label set
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        let mut context = Context::default();
        context
            .add_variable("labels", labels.clone())
            .map_err(|e| Error::serialization_for_kind("CelContext", e.to_string()))?;

        match self.program.execute(&context) {
            Ok(Value::Bool(result)) => Ok(result),
            Ok(other) => Err(Error::validation_for_field(
                UNKNOWN_CONTEXT,
                "selector.cel",
                format!(
                    "CEL expression {} evaluated to {:?}, expected a boolean",
                    self.source, other
                ),
            )),
            // A pod without the referenced key is simply not a match
            Err(_) => Ok(false),
        }
    }
}

impl std::fmt::Debug for CelPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelPredicate")
            .field("source", &self.source)
            .finish()
    }
}
