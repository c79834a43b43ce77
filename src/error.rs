//! Error types for KyroCircuit.
//!
//! All errors in KyroCircuit are strongly typed using thiserror.
//! `ErrorKind` is the taxonomy, `CircuitError` adds an identity and
//! context notes collected while the error travels through the circuit,
//! and `AggregateError` is what the runner raises once it is closed.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("{what} must be a valid identifier, got '{name}'")]
    InvalidName {
        what: &'static str,
        name: String,
    },

    #[error("Name '{name}' is reserved (starting with an underscore)")]
    ReservedName {
        name: String,
    },

    #[error("Duplicate name '{name}'")]
    DuplicateName {
        name: String,
    },

    #[error("Not allowed in phase {phase}: {reason}")]
    PhaseViolation {
        phase: String,
        reason: String,
    },

    #[error("No block or formula named '{name}' found")]
    UnitNotFound {
        name: String,
    },

    #[error("{unit}: Unknown event type '{etype}'")]
    UnknownEvent {
        unit: String,
        etype: String,
    },

    #[error("The circuit was shut down")]
    CircuitShutDown,

    #[error("{unit}: Event '{etype}' generated another event of the same type")]
    Reentrancy {
        unit: String,
        etype: String,
    },

    #[error("{unit}: detected a dependency loop")]
    DependencyCycle {
        unit: String,
    },

    #[error("Not initialized: {}", .names.join(", "))]
    NotInitialized {
        names: Vec<String>,
    },

    #[error("{unit}: input '{input}' has no value after the start")]
    UndefinedInput {
        unit: String,
        input: String,
    },

    #[error("{unit}: {feature} is not supported by this block type")]
    Unsupported {
        unit: String,
        feature: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("A required event value is missing")]
    MissingEventValue,

    #[error("Value rejected: {reason}")]
    Rejected {
        reason: String,
    },

    #[error("{message}")]
    Handler {
        message: String,
    },

    #[error("{service} terminated before shutdown")]
    ServiceTerminated {
        service: String,
    },

    #[error("{service} was cancelled before shutdown")]
    ServiceCancelled {
        service: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

/// Identity of a reported error.
///
/// The same error may be reported from several places (the failing call site
/// and the runner); the identity lets the circuit record it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorId(Uuid);

impl ErrorId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A circuit error: an underlying cause plus context notes.
#[derive(Debug, Clone)]
pub struct CircuitError {
    id: ErrorId,
    kind: Arc<ErrorKind>,
    context: Vec<String>,
}

impl CircuitError {
    /// Creates a new error with a fresh identity.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            id: ErrorId::new(),
            kind: Arc::new(kind),
            context: Vec::new(),
        }
    }

    /// Creates a user-level failure, typically returned from an event handler
    /// or a formula/trigger function.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler {
            message: message.into(),
        })
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    /// Creates a rejection error (used by validators).
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected {
            reason: reason.into(),
        })
    }

    /// Adds a context note. The identity is preserved.
    #[must_use]
    pub fn with_context(mut self, note: impl Into<String>) -> Self {
        self.context.push(note.into());
        self
    }

    /// Returns the identity of this error.
    #[must_use]
    pub const fn id(&self) -> ErrorId {
        self.id
    }

    /// Returns the underlying cause.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the context notes in the order they were added.
    #[must_use]
    pub fn context(&self) -> &[String] {
        &self.context
    }

    /// Returns true if an event type had no handler.
    #[must_use]
    pub fn is_unknown_event(&self) -> bool {
        matches!(*self.kind, ErrorKind::UnknownEvent { .. })
    }

    /// Returns true if an event re-entered its own block.
    #[must_use]
    pub fn is_reentrancy(&self) -> bool {
        matches!(*self.kind, ErrorKind::Reentrancy { .. })
    }

    /// Returns true if a formula re-entered itself.
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(*self.kind, ErrorKind::DependencyCycle { .. })
    }

    /// Returns true if the circuit was already shutting down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        matches!(*self.kind, ErrorKind::CircuitShutDown)
    }

    /// Returns true for errors raised while building the circuit.
    ///
    /// Construction errors go to the caller only and are never recorded.
    #[must_use]
    pub fn is_construction(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::InvalidName { .. }
                | ErrorKind::ReservedName { .. }
                | ErrorKind::DuplicateName { .. }
                | ErrorKind::PhaseViolation { .. }
                | ErrorKind::Unsupported { .. }
                | ErrorKind::InvalidConfig { .. }
        )
    }
}

impl PartialEq for CircuitError {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CircuitError {}

impl fmt::Display for CircuitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for note in &self.context {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CircuitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.kind {
            ErrorKind::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorKind> for CircuitError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<StorageError> for CircuitError {
    fn from(err: StorageError) -> Self {
        Self::new(ErrorKind::Storage(err))
    }
}

/// All distinct errors recorded during a circuit's life, raised once by the runner.
#[derive(Debug, Clone, Error)]
#[error("circuit runner failed with {} error(s): {}", .errors.len(), summary(.errors))]
pub struct AggregateError {
    /// Recorded errors in the order they were recorded.
    pub errors: Vec<CircuitError>,
}

impl AggregateError {
    /// Returns true if any recorded error matches the predicate.
    pub fn any(&self, pred: impl Fn(&CircuitError) -> bool) -> bool {
        self.errors.iter().any(pred)
    }
}

fn summary(errors: &[CircuitError]) -> String {
    errors
        .iter()
        .map(|e| e.kind().to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for circuit operations.
pub type CircuitResult<T> = Result<T, CircuitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_message() {
        let err = CircuitError::new(ErrorKind::DuplicateName {
            name: "x".to_string(),
        });
        assert!(err.to_string().contains("Duplicate name 'x'"));
        assert!(err.is_construction());
    }

    #[test]
    fn test_context_keeps_identity() {
        let err = CircuitError::failed("boom");
        let id = err.id();
        let annotated = err.clone().with_context("in block 'a'");
        assert_eq!(annotated.id(), id);
        assert_eq!(annotated, err);
        assert_eq!(annotated.context(), ["in block 'a'".to_string()]);
        let msg = annotated.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.contains("note: in block 'a'"));
    }

    #[test]
    fn test_distinct_errors_differ() {
        let a = CircuitError::failed("same");
        let b = CircuitError::failed("same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_not_initialized_lists_names() {
        let err = CircuitError::new(ErrorKind::NotInitialized {
            names: vec!["a".to_string(), "b".to_string()],
        });
        assert_eq!(err.to_string(), "Not initialized: a, b");
    }

    #[test]
    fn test_predicates() {
        let unknown = CircuitError::new(ErrorKind::UnknownEvent {
            unit: "<Memory m>".to_string(),
            etype: "nope".to_string(),
        });
        assert!(unknown.is_unknown_event());
        assert!(!unknown.is_construction());

        let cycle = CircuitError::new(ErrorKind::DependencyCycle {
            unit: "<Formula f>".to_string(),
        });
        assert!(cycle.is_cycle());
        assert!(!cycle.is_reentrancy());
    }

    #[test]
    fn test_aggregate_display() {
        let agg = AggregateError {
            errors: vec![CircuitError::failed("one"), CircuitError::failed("two")],
        };
        let msg = agg.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("one; two"));
        assert!(agg.any(|e| e.to_string() == "two"));
    }

    #[test]
    fn test_storage_error_source() {
        let err: CircuitError = StorageError::BackendError("disk".to_string()).into();
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("disk"));
    }
}
