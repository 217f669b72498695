//! # rstchart-core
//!
//! Statechart execution engine.
//!
//! This crate provides:
//! - Statechart models: nested and parallel states, history, final states
//! - YAML/JSON model descriptions
//! - The guard and action language, evaluated against a shared context
//! - A simulated clock and the event queue
//! - The interpreter, with run-to-completion semantics
//! - Execution traces, stories and checkpoints

pub mod checkpoint;
pub mod clock;
pub mod context;
pub mod definition;
pub mod emitter;
pub mod error;
pub mod event;
pub mod expr;
pub mod interpreter;
pub mod model;
pub mod queue;
pub mod trace;
pub mod value;

pub use checkpoint::Checkpoint;
pub use clock::Clock;
pub use context::{Context, EventSink, Scope, TIME_TOLERANCE};
pub use definition::{ConditionDefinition, StatechartDefinition, StatechartDocument};
pub use emitter::{Emitter, EventFilter};
pub use error::{ChartError, ClockError, EvaluationError, ModelError};
pub use event::Event;
pub use expr::{Action, Guard};
pub use interpreter::{EngineState, Interpreter, InterpreterOptions, DEFAULT_MAX_MICROSTEPS};
pub use model::{
    ConditionKind, Configuration, Contract, ContractSpec, Model, ModelBuilder, StateId, StateKind,
    StateNode, StateSpec, Transition, TransitionId, TransitionSpec,
};
pub use queue::EventQueue;
pub use trace::{story_from_trace, FiredTransition, MacroStep, MicroStep, StoryItem};
pub use value::Value;
