//! Error types for the reference engine.

use callbridge_core::Value;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while parsing or running a directive.
///
/// Everything except [`EngineError::Channel`] is reported back to the host
/// as the goal's error term; a channel error ends the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A variable was used where a value is required.
    #[error("unbound variable {0}")]
    Unbound(String),

    #[error("unknown directive {0}")]
    UnknownDirective(String),

    #[error("type error: expected {expected}, got {found}")]
    Type { expected: &'static str, found: String },

    /// Raised explicitly with `error(Term)`.
    #[error("raised {0}")]
    Raised(Value),

    #[error("interrupted")]
    Interrupted,

    /// An inbound call came back with a fault.
    #[error("host call failed with {kind}: {message}")]
    Host { kind: String, message: String },

    #[error("channel error: {0}")]
    Channel(#[from] callbridge_core::Error),
}

impl EngineError {
    /// The error term sent to the host in the goal's outcome.
    pub fn to_value(&self) -> Value {
        match self {
            EngineError::Syntax(detail) => Value::Str(format!("syntax_error({})", detail)),
            EngineError::Unbound(var) => Value::Str(format!("instantiation_error({})", var)),
            EngineError::UnknownDirective(name) => {
                Value::Str(format!("existence_error(directive, {})", name))
            }
            EngineError::Type { expected, found } => {
                Value::Str(format!("type_error({}, {})", expected, found))
            }
            EngineError::Raised(value) => value.clone(),
            EngineError::Interrupted => Value::from("interrupted"),
            EngineError::Host { kind, message } => {
                Value::Str(format!("host_exception({}, {:?})", kind, message))
            }
            EngineError::Channel(e) => Value::Str(format!("channel_error({:?})", e.to_string())),
        }
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, EngineError::Channel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_terms() {
        assert_eq!(
            EngineError::Syntax("unexpected ')'".into()).to_value(),
            Value::from("syntax_error(unexpected ')')")
        );
        assert_eq!(EngineError::Interrupted.to_value(), Value::from("interrupted"));
        assert_eq!(
            EngineError::Raised(Value::Int(3)).to_value(),
            Value::Int(3)
        );
        let host = EngineError::Host {
            kind: "no_such_method".into(),
            message: "no method x/0".into(),
        };
        assert_eq!(
            host.to_value(),
            Value::from("host_exception(no_such_method, \"no method x/0\")")
        );
    }

    #[test]
    fn test_only_channel_errors_are_fatal() {
        assert!(EngineError::Channel(callbridge_core::Error::Transport("gone".into())).is_channel());
        assert!(!EngineError::Interrupted.is_channel());
    }
}
