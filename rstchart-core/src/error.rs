//! Core error types.

use crate::model::ConditionKind;
use thiserror::Error;

/// Structural defects in a statechart, detected while the model is built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("duplicate state name: '{name}'")]
    DuplicateState { name: String },

    #[error("state '{state}' refers to unknown parent '{parent}'")]
    UnknownParent { state: String, parent: String },

    #[error("statechart has no root state")]
    MissingRoot,

    #[error("statechart has more than one root: '{first}' and '{second}'")]
    MultipleRoots { first: String, second: String },

    #[error("cyclic parent links through state '{state}'")]
    CyclicParent { state: String },

    #[error("compound state '{state}' has no initial state")]
    MissingInitial { state: String },

    #[error("initial state '{initial}' of '{state}' is not one of its children")]
    InvalidInitial { state: String, initial: String },

    #[error("composite state '{state}' has no children")]
    EmptyComposite { state: String },

    #[error("state '{state}' cannot have children")]
    UnexpectedChildren { state: String },

    #[error("transition from '{source_state}' refers to unknown state '{target}'")]
    UnknownTarget { source_state: String, target: String },

    #[error("transition refers to unknown source state '{source_state}'")]
    UnknownSource { source_state: String },

    #[error("state '{state}' cannot have outgoing transitions")]
    UnexpectedTransition { state: String },

    #[error("transition from '{source_state}' is internal, eventless and guardless")]
    EmptyInternalTransition { source_state: String },

    #[error("history state '{state}' must be a child of a compound state")]
    InvalidHistory { state: String },

    #[error("memory '{memory}' of history state '{state}' is not a sibling")]
    InvalidMemory { state: String, memory: String },

    #[error("state '{state}' declares both 'states' and 'parallel states'")]
    AmbiguousChildren { state: String },

    #[error("invalid expression '{source_text}': {reason}")]
    InvalidExpression { source_text: String, reason: String },

    #[error("invalid statechart description: {reason}")]
    InvalidDescription { reason: String },
}

/// Failures while evaluating a guard or executing an action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    #[error("type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("type mismatch: expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("guard evaluated to {found}, expected a boolean")]
    NonBooleanGuard { found: &'static str },

    #[error("event has no field '{field}'")]
    MissingEventField { field: String },

    #[error("'event' referenced outside of an event-triggered step")]
    NoEvent,

    #[error("time predicate '{name}' used outside of a state")]
    NoSourceState { name: String },
}

/// Clock misuse.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("clock cannot move backwards (delta {delta})")]
    NegativeDelta { delta: f64 },

    #[error("clock delta must be finite (got {delta})")]
    NonFiniteDelta { delta: f64 },
}

/// Errors from the statechart engine.
#[derive(Debug, Error)]
pub enum ChartError {
    #[error("invalid model: {0}")]
    Model(#[from] ModelError),

    #[error("evaluation failed in {location}: {source}")]
    Evaluation {
        location: String,
        #[source]
        source: EvaluationError,
    },

    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("{kind} of {owner} violated: {condition}")]
    ContractViolation {
        kind: ConditionKind,
        owner: String,
        condition: String,
    },

    #[error("macrostep exceeded {limit} microsteps")]
    MicrostepLimit { limit: usize },

    #[error("invalid checkpoint: {reason}")]
    InvalidCheckpoint { reason: String },

    #[error("invalid event payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChartError {
    /// Wraps an evaluation error with the place it happened.
    pub fn evaluation(location: impl Into<String>, source: EvaluationError) -> Self {
        ChartError::Evaluation {
            location: location.into(),
            source,
        }
    }

    /// Returns whether the interpreter can keep receiving input after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChartError::Evaluation { .. }
                | ChartError::ContractViolation { .. }
                | ChartError::Clock(_)
                | ChartError::MicrostepLimit { .. }
        )
    }

    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChartError::Model(_) => "MODEL_ERROR",
            ChartError::Evaluation { .. } => "EVALUATION_ERROR",
            ChartError::ContractViolation { .. } => "CONTRACT_VIOLATION",
            ChartError::Clock(_) => "CLOCK_ERROR",
            ChartError::MicrostepLimit { .. } => "MICROSTEP_LIMIT",
            ChartError::InvalidCheckpoint { .. } => "INVALID_CHECKPOINT",
            ChartError::InvalidPayload { .. } => "BAD_REQUEST",
            ChartError::Json(_) => "BAD_REQUEST",
            ChartError::Yaml(_) => "BAD_REQUEST",
            ChartError::Io(_) => "IO_ERROR",
        }
    }
}
