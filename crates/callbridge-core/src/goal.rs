//! Goal descriptors built by host code.

use crate::error::{Error, Result};
use crate::ipc::{ANONYMOUS_VAR, GoalRequest};
use crate::value::Value;

/// Output template used when the caller wants no outputs.
pub const NO_OUTPUTS: &str = "[]";

/// A goal to submit to the engine.
///
/// ```
/// use callbridge_core::{Goal, Value};
///
/// let goal = Goal::new("length(L, N)")
///     .input("L", vec![Value::Int(1), Value::Int(2)])
///     .outputs("[N]");
/// assert_eq!(goal.directive(), "length(L, N)");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    directive: String,
    input_var: Option<String>,
    inputs: Vec<Value>,
    output_spec: String,
}

impl Goal {
    pub fn new(directive: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
            input_var: None,
            inputs: Vec::new(),
            output_spec: NO_OUTPUTS.to_string(),
        }
    }

    /// Bind `var` to the list `values` before the directive runs.
    pub fn input(mut self, var: impl Into<String>, values: Vec<Value>) -> Self {
        self.input_var = Some(var.into());
        self.inputs = values;
        self
    }

    /// Output template, e.g. `[X, Y]`.
    pub fn outputs(mut self, spec: impl Into<String>) -> Self {
        self.output_spec = spec.into();
        self
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    /// Reject malformed goals before they reach the engine.
    pub fn validate(&self) -> Result<()> {
        let directive = self.directive.trim();
        if directive.is_empty() {
            return Err(Error::InvalidGoal("empty directive".to_string()));
        }
        if directive.ends_with('.') {
            return Err(Error::InvalidGoal(format!(
                "directive must not end with '.': {}",
                directive
            )));
        }
        if let Some(var) = &self.input_var
            && var.trim().is_empty()
        {
            return Err(Error::InvalidGoal("empty input variable name".to_string()));
        }
        Ok(())
    }

    pub(crate) fn into_request(self, timestamp: u64) -> Result<GoalRequest> {
        self.validate()?;
        Ok(GoalRequest {
            timestamp,
            directive: self.directive.trim().to_string(),
            input_var: self
                .input_var
                .unwrap_or_else(|| ANONYMOUS_VAR.to_string()),
            inputs: self.inputs,
            output_spec: self.output_spec,
        })
    }
}

impl From<&str> for Goal {
    fn from(directive: &str) -> Self {
        Goal::new(directive)
    }
}

impl From<String> for Goal {
    fn from(directive: String) -> Self {
        Goal::new(directive)
    }
}
