use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

use crate::sources::Location;
use crate::terms::Symbol;

#[derive(Debug, Clone, Serialize)]
#[serde(into = "FormattedPolarError")]
pub struct PolarError {
    pub kind: ErrorKind,
    pub context: Option<ErrorContext>,
}

/// The shape an error takes when it crosses the host boundary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FormattedPolarError {
    pub kind: ErrorTaxonomy,
    pub message: String,
    pub location: Option<Location>,
    pub details: ErrorKind,
}

impl From<PolarError> for FormattedPolarError {
    fn from(other: PolarError) -> Self {
        Self {
            kind: other.taxonomy(),
            message: other.to_string(),
            location: other.context.map(|c| c.location),
            details: other.kind,
        }
    }
}

/// Coarse classification of every error the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTaxonomy {
    LoadError,
    TypeError,
    UnboundVariableError,
    UnknownRuleError,
    RuntimeLimitExceeded,
    HostReportedError,
    InternalInvariantError,
    /// The host drove the query protocol incorrectly.
    ProtocolUsageError,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error(transparent)]
    Load(LoadError),
    #[error(transparent)]
    Runtime(RuntimeError),
    #[error(transparent)]
    Operational(OperationalError),
    #[error(transparent)]
    Parameter(ParameterError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub location: Location,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

impl PolarError {
    /// Attach `location` unless the error already carries one.
    pub fn with_location(mut self, location: Option<&Location>) -> Self {
        if self.context.is_none() {
            self.context = location.map(|location| ErrorContext {
                location: location.clone(),
            });
        }
        self
    }

    pub fn taxonomy(&self) -> ErrorTaxonomy {
        match &self.kind {
            ErrorKind::Load(_) => ErrorTaxonomy::LoadError,
            ErrorKind::Runtime(e) => match e {
                RuntimeError::TypeError { .. }
                | RuntimeError::ArithmeticError { .. }
                | RuntimeError::Unsupported { .. } => ErrorTaxonomy::TypeError,
                RuntimeError::UnboundVariable { .. } => ErrorTaxonomy::UnboundVariableError,
                RuntimeError::UnknownRule { .. } => ErrorTaxonomy::UnknownRuleError,
                RuntimeError::StackOverflow { .. }
                | RuntimeError::StepLimitExceeded { .. }
                | RuntimeError::QueryTimeout { .. } => ErrorTaxonomy::RuntimeLimitExceeded,
                RuntimeError::Application { .. } => ErrorTaxonomy::HostReportedError,
            },
            ErrorKind::Operational(_) => ErrorTaxonomy::InternalInvariantError,
            ErrorKind::Parameter(_) => ErrorTaxonomy::ProtocolUsageError,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        self.context.as_ref().map(|c| &c.location)
    }
}

impl std::error::Error for PolarError {}

impl fmt::Display for PolarError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref context) = self.context {
            write!(f, "{}", context)?;
        }
        Ok(())
    }
}

impl From<LoadError> for PolarError {
    fn from(err: LoadError) -> Self {
        Self {
            kind: ErrorKind::Load(err),
            context: None,
        }
    }
}

impl From<RuntimeError> for PolarError {
    fn from(err: RuntimeError) -> Self {
        Self {
            kind: ErrorKind::Runtime(err),
            context: None,
        }
    }
}

impl From<OperationalError> for PolarError {
    fn from(err: OperationalError) -> Self {
        Self {
            kind: ErrorKind::Operational(err),
            context: None,
        }
    }
}

impl From<ParameterError> for PolarError {
    fn from(err: ParameterError) -> Self {
        Self {
            kind: ErrorKind::Parameter(err),
            context: None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PolarError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        OperationalError::InvalidState {
            msg: format!("knowledge base lock poisoned: {}", err),
        }
        .into()
    }
}

pub type PolarResult<T> = std::result::Result<T, PolarError>;

/// Problems with a compiled policy handed to `load`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum LoadError {
    #[error("Invalid policy IR: {msg}")]
    InvalidIr { msg: String },
    #[error("Invalid rule: {msg}")]
    InvalidRule { msg: String },
    #[error("Problem loading file: {msg}")]
    DuplicateSource { msg: String },
    #[error("Cannot load additional policies after the knowledge base has been loaded. Clear the rules first.")]
    MultipleLoad,
    #[error("Cannot register MRO for {name}: it is not a registered constant")]
    UnregisteredClass { name: Symbol },
    #[error("Invalid rule type: {msg}")]
    InvalidRuleType { msg: String },
    #[error("Invalid rule: {rule} does not match any rule type:{msg}")]
    RuleTypeMismatch { rule: String, msg: String },
    #[error("Missing implementation for required rule {rule_type}")]
    MissingRequiredRule { rule_type: String },
}

fn with_trace(prefix: &str, msg: &str, stack_trace: &Option<String>) -> String {
    match stack_trace {
        Some(trace) => format!("{}\n{}: {}", trace, prefix, msg),
        None => format!("{}: {}", prefix, msg),
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RuntimeError {
    #[error("Arithmetic error: {msg}")]
    ArithmeticError { msg: String },
    #[error("Not supported: {msg}")]
    Unsupported { msg: String },
    #[error("{}", with_trace("Type error", .msg, .stack_trace))]
    TypeError {
        msg: String,
        stack_trace: Option<String>,
    },
    #[error("{sym} is an unbound variable")]
    UnboundVariable { sym: Symbol },
    #[error("Query for undefined rule `{name}`")]
    UnknownRule { name: Symbol },
    #[error("Hit a stack limit: {msg}")]
    StackOverflow { msg: String },
    #[error("Hit the step limit of {limit} steps")]
    StepLimitExceeded { limit: u64 },
    #[error("Query timeout: query running for {elapsed}ms, which exceeds the timeout of {timeout}ms")]
    QueryTimeout { elapsed: u64, timeout: u64 },
    #[error("{}", with_trace("Application error", .msg, .stack_trace))]
    Application {
        msg: String,
        stack_trace: Option<String>,
    },
}

impl RuntimeError {
    pub fn add_stack_trace(&mut self, trace: String) {
        match self {
            Self::Application { stack_trace, .. } | Self::TypeError { stack_trace, .. } => {
                *stack_trace = Some(trace)
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum OperationalError {
    #[error("Invalid state: {msg}")]
    InvalidState { msg: String },
    #[error("we hit an error we do not know how to handle or did not expect. Please submit a bug")]
    Unknown,
}

/// The host passed an invalid argument or drove the query protocol out of order.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Invalid parameter: {0}")]
pub struct ParameterError(pub String);

pub fn invalid_state_error<T>(msg: String) -> PolarResult<T> {
    Err(OperationalError::InvalidState { msg }.into())
}

pub fn unsupported<T>(msg: String) -> PolarResult<T> {
    Err(RuntimeError::Unsupported { msg }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let err: PolarError = RuntimeError::StepLimitExceeded { limit: 10 }.into();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::RuntimeLimitExceeded);
        let err: PolarError = RuntimeError::UnknownRule { name: sym!("f") }.into();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::UnknownRuleError);
        assert_eq!(err.to_string(), "Query for undefined rule `f`");
        let err: PolarError = ParameterError("stale call id".to_owned()).into();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::ProtocolUsageError);
        let err: PolarError = LoadError::MultipleLoad.into();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::LoadError);
    }

    #[test]
    fn test_display_with_location_and_trace() {
        let mut runtime = RuntimeError::TypeError {
            msg: "cannot unify patterns".to_owned(),
            stack_trace: None,
        };
        runtime.add_stack_trace("trace (most recent evaluation last):".to_owned());
        let location = Location::new(Some("policy.polar".to_owned()), 2, 4);
        let err = PolarError::from(runtime)
            .with_location(Some(&location))
            .with_location(None);
        assert_eq!(
            err.to_string(),
            "trace (most recent evaluation last):\nType error: cannot unify patterns at line 3, column 5 in file policy.polar"
        );
        assert_eq!(err.location(), Some(&location));
    }

    #[test]
    fn test_boundary_form() {
        let err = PolarError::from(RuntimeError::Application {
            msg: "boom".to_owned(),
            stack_trace: None,
        })
        .with_location(Some(&Location::new(None, 0, 0)));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "HostReportedError");
        assert_eq!(json["message"], "Application error: boom at line 1, column 1");
        assert_eq!(json["location"]["row"], 0);
        assert_eq!(json["details"]["Runtime"]["Application"]["msg"], "boom");
    }
}
