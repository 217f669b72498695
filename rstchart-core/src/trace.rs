//! Execution traces.
//!
//! Every interpreter call returns the [`MacroStep`]s it performed. A trace can
//! be turned into a story: a flat list of events describing what happened,
//! suitable for replay against another interpreter or for assertions.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A transition as it appears in a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTransition {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl fmt::Display for FiredTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.event.as_deref().map(|e| format!("[{}]", e)).unwrap_or_default();
        match &self.target {
            Some(target) => write!(f, "{} -{}-> {}", self.source, event, target),
            None => write!(f, "{} -{}-> (internal)", self.source, event),
        }
    }
}

/// One round of firing: at most one transition, plus the states it left and
/// entered (or, during initialization, only entered states).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<FiredTransition>,
    /// Exited states, innermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exited: Vec<String>,
    /// Entered states, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entered: Vec<String>,
    /// Events raised by `send` during this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sent: Vec<Event>,
}

/// The full reaction to one external event or clock advance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroStep {
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    pub steps: Vec<MicroStep>,
}

impl MacroStep {
    pub fn transitions(&self) -> impl Iterator<Item = &FiredTransition> {
        self.steps.iter().filter_map(|s| s.transition.as_ref())
    }

    pub fn entered_states(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().flat_map(|s| s.entered.iter().map(String::as_str))
    }

    pub fn exited_states(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().flat_map(|s| s.exited.iter().map(String::as_str))
    }

    pub fn sent_events(&self) -> impl Iterator<Item = &Event> {
        self.steps.iter().flat_map(|s| s.sent.iter())
    }

    /// True when nothing fired; e.g. an external event no transition accepted.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for MacroStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.time)?;
        if let Some(event) = &self.event {
            write!(f, " {}", event)?;
        }
        let fired: Vec<String> = self.transitions().map(|t| t.to_string()).collect();
        if fired.is_empty() {
            write!(f, ": no transition")
        } else {
            write!(f, ": {}", fired.join(", "))
        }
    }
}

/// One entry of a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoryItem {
    /// Simulated time elapsed between two macrosteps.
    Pause { delta: f64 },
    Event(Event),
}

impl fmt::Display for StoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryItem::Pause { delta } => write!(f, "pause {}", delta),
            StoryItem::Event(e) => write!(f, "{}", e),
        }
    }
}

/// Turns a trace into a story made of `started`, `consumed`, `exited`,
/// `processed`, `entered` and `stopped` events, with pauses between
/// macrosteps that happened at different times.
pub fn story_from_trace(trace: &[MacroStep]) -> Vec<StoryItem> {
    let mut story = vec![StoryItem::Event(Event::new("started"))];
    let mut time = 0.0;

    for macro_step in trace {
        if macro_step.time > time {
            story.push(StoryItem::Pause {
                delta: macro_step.time - time,
            });
            time = macro_step.time;
        }
        if let Some(event) = &macro_step.event {
            story.push(StoryItem::Event(
                Event::new("consumed").with("event", event.name.as_str()),
            ));
        }
        for step in &macro_step.steps {
            for state in &step.exited {
                story.push(StoryItem::Event(
                    Event::new("exited").with("state", state.as_str()),
                ));
            }
            if let Some(t) = &step.transition {
                let mut processed = Event::new("processed").with("source", t.source.as_str());
                if let Some(target) = &t.target {
                    processed = processed.with("target", target.as_str());
                }
                if let Some(event) = &t.event {
                    processed = processed.with("event", event.as_str());
                }
                story.push(StoryItem::Event(processed));
            }
            for state in &step.entered {
                story.push(StoryItem::Event(
                    Event::new("entered").with("state", state.as_str()),
                ));
            }
        }
    }

    story.push(StoryItem::Event(Event::new("stopped")));
    story
}
