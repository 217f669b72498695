//! Statechart descriptions.
//!
//! Models are described in YAML (or the equivalent JSON):
//!
//! ```yaml
//! statechart:
//!   name: Stopwatch
//!   preamble: elapsed_time = 0
//!   outputs: [refresh]
//!   root state:
//!     name: active
//!     parallel states:
//!       - name: timer
//!         initial: stopped
//!         states:
//!           - name: stopped
//!             transitions:
//!               - event: start
//!                 target: running
//!           - name: running
//!             transitions:
//!               - guard: after(1)
//!                 target: running
//!                 action: elapsed_time += 1
//! ```
//!
//! A state with `states` is compound, one with `parallel states` is
//! parallel, and `type` selects `final`, `shallow history` or `deep history`.
//! States and transitions may carry a `contract`: a list of conditions,
//! each under one of `before`, `after` or `always`.
//! Everything is checked by [`ModelBuilder`].

use crate::error::{ChartError, ModelError};
use crate::model::{ConditionKind, ContractSpec, Model, ModelBuilder, StateSpec, TransitionSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level document: a single `statechart` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatechartDocument {
    pub statechart: StatechartDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatechartDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Statements run once when an interpreter is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,

    /// Events that are emitted to subscribers instead of being queued.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    #[serde(rename = "root state")]
    pub root: StateDefinition,
}

/// Explicit state type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    #[serde(rename = "final")]
    Final,
    #[serde(rename = "shallow history")]
    ShallowHistory,
    #[serde(rename = "deep history")]
    DeepHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDefinition {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Default memory of a history state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(rename = "on entry", default, skip_serializing_if = "Option::is_none")]
    pub on_entry: Option<String>,

    #[serde(rename = "on exit", default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<StateDefinition>>,

    #[serde(rename = "parallel states", default, skip_serializing_if = "Option::is_none")]
    pub parallel_states: Option<Vec<StateDefinition>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract: Vec<ConditionDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract: Vec<ConditionDefinition>,
}

/// One contract clause. `before` is a precondition, `after` a
/// postcondition and `always` an invariant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<String>,
}

fn contract_spec(owner: &str, clauses: &[ConditionDefinition]) -> Result<ContractSpec, ModelError> {
    let mut spec = ContractSpec::default();
    for clause in clauses {
        let mut keys = [
            (ConditionKind::Precondition, &clause.before),
            (ConditionKind::Postcondition, &clause.after),
            (ConditionKind::Invariant, &clause.always),
        ]
        .into_iter()
        .filter_map(|(kind, code)| code.as_ref().map(|c| (kind, c)));
        match (keys.next(), keys.next()) {
            (Some((kind, code)), None) => spec.add(kind, code.as_str()),
            _ => {
                return Err(ModelError::InvalidDescription {
                    reason: format!(
                        "contract clause of {} needs exactly one of 'before', 'after' or 'always'",
                        owner
                    ),
                })
            }
        }
    }
    Ok(spec)
}

impl StatechartDefinition {
    /// Flattens the state tree into a builder, parents before children.
    pub fn to_builder(&self) -> Result<ModelBuilder, ModelError> {
        let mut builder = ModelBuilder::new(&self.name);
        if let Some(description) = &self.description {
            builder.description(description);
        }
        if let Some(preamble) = &self.preamble {
            builder.preamble(preamble);
        }
        for output in &self.outputs {
            builder.output(output);
        }
        add_state(&mut builder, &self.root, None)?;
        Ok(builder)
    }

    pub fn build(&self) -> Result<Model, ModelError> {
        self.to_builder()?.build()
    }
}

fn add_state(
    builder: &mut ModelBuilder,
    def: &StateDefinition,
    parent: Option<&str>,
) -> Result<(), ModelError> {
    let children = match (&def.states, &def.parallel_states) {
        (Some(_), Some(_)) => {
            return Err(ModelError::AmbiguousChildren {
                state: def.name.clone(),
            })
        }
        (Some(states), None) | (None, Some(states)) => Some(states),
        (None, None) => None,
    };

    let mut spec = match def.kind {
        Some(StateType::Final) => StateSpec::final_state(&def.name),
        Some(StateType::ShallowHistory) => StateSpec::history(&def.name, false),
        Some(StateType::DeepHistory) => StateSpec::history(&def.name, true),
        None if def.parallel_states.is_some() => StateSpec::parallel(&def.name),
        None if def.states.is_some() || def.initial.is_some() => StateSpec::compound(&def.name),
        None => StateSpec::basic(&def.name),
    };
    if def.kind.is_some() && children.is_some() {
        return Err(ModelError::UnexpectedChildren {
            state: def.name.clone(),
        });
    }

    spec.parent = parent.map(str::to_string);
    spec.initial = def.initial.clone();
    spec.memory = def.memory.clone();
    spec.on_entry = def.on_entry.clone();
    spec.on_exit = def.on_exit.clone();
    spec.contract = contract_spec(&format!("state '{}'", def.name), &def.contract)?;
    builder.state(spec);

    for t in &def.transitions {
        let mut spec = TransitionSpec::new(&def.name);
        spec.target = t.target.clone();
        spec.event = t.event.clone();
        spec.guard = t.guard.clone();
        spec.action = t.action.clone();
        spec.contract = contract_spec(&format!("a transition from '{}'", def.name), &t.contract)?;
        builder.transition(spec);
    }

    for child in children.into_iter().flatten() {
        add_state(builder, child, Some(&def.name))?;
    }
    Ok(())
}

impl Model {
    /// Parses and validates a YAML description.
    pub fn from_yaml(text: &str) -> Result<Self, ChartError> {
        let doc: StatechartDocument = serde_yaml::from_str(text)?;
        Ok(doc.statechart.build()?)
    }

    /// Parses and validates a JSON description.
    pub fn from_json(text: &str) -> Result<Self, ChartError> {
        let doc: StatechartDocument = serde_json::from_str(text)?;
        Ok(doc.statechart.build()?)
    }

    /// Loads a description from disk; `.json` files are read as JSON,
    /// anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChartError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let model = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text)?,
            _ => Self::from_yaml(&text)?,
        };
        tracing::debug!(path = %path.display(), model = %model, "loaded model");
        Ok(model)
    }
}
