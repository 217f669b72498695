//! Command execution.
//!
//! Scripts and the REPL share one line-oriented command language, executed
//! against a [`Session`].

use colored::Colorize;
use rstchart_core::{
    story_from_trace, Checkpoint, ConditionKind, Contract, Event, Interpreter, InterpreterOptions,
    MacroStep, Model, StateKind,
};
use serde_json::Value;
use std::sync::mpsc;
use std::sync::Arc;

pub const HELP_TEXT: &str = r#"
Available commands:
  help                       Show this help
  fire <event> [payload]     Send an event (payload: JSON object or @file.json)
  advance <seconds>          Advance the simulated clock
  config                     Show the active configuration
  ctx                        Show the context
  events                     List events the active states react to
  time                       Show the simulated time
  story                      Show the story of this session
  checkpoint [file]          Print a checkpoint, or write it to a file
  quit, exit                 Leave
"#;

/// An interpreter plus what the command language reports about it.
pub struct Session {
    interpreter: Interpreter,
    outputs: mpsc::Receiver<Event>,
    trace: Vec<MacroStep>,
}

impl Session {
    pub fn new(model: Arc<Model>, options: InterpreterOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let interpreter = Interpreter::with_options(model, options)?;
        let initial = interpreter.initial_step().clone();
        let mut session = Self::wrap(interpreter);
        session.trace.push(initial);
        Ok(session)
    }

    pub fn resume(
        model: Arc<Model>,
        checkpoint: &Checkpoint,
        options: InterpreterOptions,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let interpreter = Interpreter::restore_with_options(model, checkpoint, options)?;
        tracing::info!(
            "Resumed {} from checkpoint {} at t={}",
            checkpoint.model,
            checkpoint.id,
            checkpoint.time
        );
        Ok(Self::wrap(interpreter))
    }

    fn wrap(mut interpreter: Interpreter) -> Self {
        let (tx, rx) = mpsc::channel();
        interpreter.subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        Self {
            interpreter,
            outputs: rx,
            trace: Vec::new(),
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Macrosteps performed so far, including the initial one.
    pub fn trace(&self) -> &[MacroStep] {
        &self.trace
    }

    pub fn story(&self) -> String {
        story_from_trace(&self.trace)
            .iter()
            .map(|item| item.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Executes one command line. `Ok(None)` asks the caller to stop.
    pub fn execute(&mut self, line: &str) -> Result<Option<String>, Box<dyn std::error::Error>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Some(String::new()));
        }

        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let cmd = cmd.to_lowercase();

        match cmd.as_str() {
            "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

            "quit" | "exit" | "q" => Ok(None),

            "fire" | "f" => {
                if rest.is_empty() {
                    return Ok(Some("Usage: fire <event> [payload_json]".to_string()));
                }
                let (name, payload) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let event = match payload.trim() {
                    "" => Event::new(name),
                    payload => Event::from_json(name, &parse_json_arg(payload)?)?,
                };
                let result = self.interpreter.fire(event);
                self.report(result)
            }

            "advance" | "a" => {
                if rest.is_empty() {
                    return Ok(Some("Usage: advance <seconds>".to_string()));
                }
                let delta: f64 = rest.parse()?;
                let result = self.interpreter.advance_time(delta);
                self.report(result)
            }

            "config" | "c" => Ok(Some(format_configuration(&self.interpreter))),

            "ctx" => {
                let ctx = serde_json::to_value(self.interpreter.context())?;
                Ok(Some(format_json(&ctx)))
            }

            "events" | "e" => {
                let events = self.interpreter.available_events();
                if events.is_empty() {
                    return Ok(Some("No events".yellow().to_string()));
                }
                Ok(Some(
                    events
                        .iter()
                        .map(|e| format!("  {}", e.cyan()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ))
            }

            "time" | "t" => Ok(Some(format!("t = {}", self.interpreter.time()))),

            "story" => Ok(Some(self.story())),

            "checkpoint" | "ckpt" => {
                let checkpoint = self.interpreter.checkpoint();
                let json = checkpoint.to_json()?;
                if rest.is_empty() {
                    return Ok(Some(json));
                }
                std::fs::write(rest, json)?;
                Ok(Some(format!(
                    "{} checkpoint {} to {}",
                    "Wrote".green(),
                    checkpoint.id.cyan(),
                    rest
                )))
            }

            _ => Ok(Some(format!(
                "Unknown command: {}. Type 'help' for help.",
                cmd
            ))),
        }
    }

    /// Formats the macrosteps of one call followed by the emitted events.
    fn report(
        &mut self,
        result: Result<Vec<MacroStep>, rstchart_core::ChartError>,
    ) -> Result<Option<String>, Box<dyn std::error::Error>> {
        let mut lines = Vec::new();
        let outputs: Vec<Event> = self.outputs.try_iter().collect();

        match result {
            Ok(steps) => {
                for step in steps.iter().filter(|s| !s.is_empty()) {
                    lines.push(step.to_string());
                }
                self.trace.extend(steps);
            }
            Err(e) => {
                tracing::debug!(error_code = e.error_code(), "command failed: {}", e);
                for event in &outputs {
                    eprintln!("  {} {}", "output".magenta(), event);
                }
                return Err(e.into());
            }
        }

        for event in &outputs {
            lines.push(format!("  {} {}", "output".magenta(), event));
        }
        if self.interpreter.is_final() {
            lines.push("statechart is final".dimmed().to_string());
        }
        lines.push(format!("[{}]", self.interpreter.active_leaves().join(", ")).yellow().to_string());
        Ok(Some(lines.join("\n")))
    }
}

/// One-line summary used by `validate`.
pub fn validate(model: &Model) -> String {
    format!(
        "{} {} (checksum: {})",
        "Valid".green(),
        model.to_string().cyan(),
        model.checksum()
    )
}

/// States tree, transitions and outputs of a model.
pub fn inspect(model: &Model) -> String {
    let mut output = format!("{}\n", format!("Statechart {}", model.name().cyan()).bold());
    if let Some(description) = model.description() {
        output.push_str(&format!("{}\n", description.trim().dimmed()));
    }
    output.push_str(&format!("  Checksum: {}\n", model.checksum()));
    if !model.outputs().is_empty() {
        let outputs: Vec<&str> = model.outputs().iter().map(String::as_str).collect();
        output.push_str(&format!("  Outputs: {}\n", outputs.join(", ")));
    }

    output.push_str(&format!("\n{}\n", "States:".bold()));
    let root = model.root();
    for s in std::iter::once(root).chain(model.descendants_of(root)) {
        let node = model.state(s);
        let indent = "  ".repeat(node.depth + 1);
        let kind = match &node.kind {
            StateKind::Compound { initial } => format!("compound, initial {}", model.name_of(*initial)),
            StateKind::History {
                memory: Some(m), ..
            } => format!("{}, memory {}", node.kind_name(), model.name_of(*m)),
            _ => node.kind_name().to_string(),
        };
        output.push_str(&format!("{}{} ({})\n", indent, node.name.yellow(), kind.dimmed()));
        push_contract(&mut output, &indent, &node.contract);
        for t in &node.transitions {
            output.push_str(&format!("{}  {}\n", indent, model.transition_label(*t)));
            push_contract(&mut output, &format!("{}  ", indent), &model.transition(*t).contract);
        }
    }

    let all: Vec<_> = model.states().iter().map(|n| n.id).collect();
    let events = model.events_for(&all);
    if !events.is_empty() {
        output.push_str(&format!("\n{} {}\n", "Events:".bold(), events.join(", ")));
    }
    output
}

fn push_contract(output: &mut String, indent: &str, contract: &Contract) {
    for kind in [
        ConditionKind::Precondition,
        ConditionKind::Postcondition,
        ConditionKind::Invariant,
    ] {
        for condition in contract.conditions(kind) {
            output.push_str(&format!("{}  {} {}\n", indent, kind.to_string().dimmed(), condition.source()));
        }
    }
}

fn format_configuration(interpreter: &Interpreter) -> String {
    format!(
        "  Active: {}\n  Leaves: {}",
        interpreter.configuration().join(", "),
        interpreter.active_leaves().join(", ").yellow()
    )
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
