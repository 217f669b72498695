//! Variable store and evaluator for guards and actions.

use crate::error::EvaluationError;
use crate::event::Event;
use crate::expr::{Action, BinaryOp, Builtin, Expr, Guard, Statement, UnaryOp};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance applied by `after()` and `idle()` so that accumulated floating
/// point error in clock advances never delays a timed guard.
pub const TIME_TOLERANCE: f64 = 1e-9;

/// Receives events produced by `send` statements.
pub trait EventSink {
    fn send(&mut self, event: Event);
}

impl EventSink for Vec<Event> {
    fn send(&mut self, event: Event) {
        self.push(event);
    }
}

/// Everything an expression can observe besides variables.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    /// Current simulated time.
    pub now: f64,
    /// Entry time of the state owning the guard or action.
    pub entered_at: Option<f64>,
    /// Time at which the last event was consumed.
    pub last_event_at: f64,
    /// Event being processed, if any.
    pub event: Option<&'a Event>,
    /// Answers `active(name)`; `None` means nothing is active.
    pub active: Option<&'a dyn Fn(&str) -> bool>,
}

impl<'a> Scope<'a> {
    pub fn at(now: f64) -> Self {
        Self {
            now,
            entered_at: None,
            last_event_at: 0.0,
            event: None,
            active: None,
        }
    }

    pub fn with_entry(mut self, entered_at: f64) -> Self {
        self.entered_at = Some(entered_at);
        self
    }

    pub fn with_event(mut self, event: Option<&'a Event>) -> Self {
        self.event = event;
        self
    }

    pub fn with_last_event(mut self, at: f64) -> Self {
        self.last_event_at = at;
        self
    }

    pub fn with_active(mut self, active: &'a dyn Fn(&str) -> bool) -> Self {
        self.active = Some(active);
        self
    }
}

/// The shared variable store of one interpreter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.vars
    }

    /// Evaluates a guard; the result must be a boolean.
    pub fn check(&self, guard: &Guard, scope: &Scope<'_>) -> Result<bool, EvaluationError> {
        match self.evaluate(guard.expr(), scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvaluationError::NonBooleanGuard {
                found: other.type_name(),
            }),
        }
    }

    /// Executes statements in order.
    ///
    /// Stops at the first failing statement; statements already executed keep
    /// their effect, including events already handed to `sink`.
    pub fn execute(
        &mut self,
        action: &Action,
        scope: &Scope<'_>,
        sink: &mut dyn EventSink,
    ) -> Result<(), EvaluationError> {
        for statement in action.statements() {
            self.execute_statement(statement, scope, sink)?;
        }
        Ok(())
    }

    fn execute_statement(
        &mut self,
        statement: &Statement,
        scope: &Scope<'_>,
        sink: &mut dyn EventSink,
    ) -> Result<(), EvaluationError> {
        match statement {
            Statement::Assign { target, op, value } => {
                let rhs = self.evaluate(value, scope)?;
                let new_value = match op {
                    None => rhs,
                    Some(op) => {
                        let current = self.get(target).cloned().ok_or_else(|| {
                            EvaluationError::UndefinedVariable {
                                name: target.clone(),
                            }
                        })?;
                        apply_binary(*op, current, rhs)?
                    }
                };
                self.vars.insert(target.clone(), new_value);
            }
            Statement::Send { event, args } => {
                let name = match self.evaluate(event, scope)? {
                    Value::Str(name) => name,
                    other => {
                        return Err(EvaluationError::UnexpectedType {
                            expected: "string",
                            found: other.type_name(),
                        })
                    }
                };
                let mut sent = Event::new(name);
                for (key, expr) in args {
                    let value = self.evaluate(expr, scope)?;
                    sent.payload.insert(key.clone(), value);
                }
                sink.send(sent);
            }
        }
        Ok(())
    }

    /// Evaluates an expression against the variables and the scope.
    pub fn evaluate(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, EvaluationError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| EvaluationError::UndefinedVariable { name: name.clone() })
            }
            Expr::EventField(field) => {
                let event = scope.event.ok_or(EvaluationError::NoEvent)?;
                if field == "name" {
                    return Ok(Value::Str(event.name.clone()));
                }
                event
                    .get(field)
                    .cloned()
                    .ok_or_else(|| EvaluationError::MissingEventField {
                        field: field.clone(),
                    })
            }
            Expr::Unary(op, inner) => {
                let value = self.evaluate(inner, scope)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, other) => Err(EvaluationError::UnexpectedType {
                        expected: "number",
                        found: other.type_name(),
                    }),
                    (UnaryOp::Not, other) => Err(EvaluationError::UnexpectedType {
                        expected: "boolean",
                        found: other.type_name(),
                    }),
                }
            }
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), left, right) => {
                let left = self.evaluate_bool(left, scope)?;
                // short-circuit
                match (op, left) {
                    (BinaryOp::And, false) => Ok(Value::Bool(false)),
                    (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                    _ => Ok(Value::Bool(self.evaluate_bool(right, scope)?)),
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.evaluate(left, scope)?;
                let right = self.evaluate(right, scope)?;
                apply_binary(*op, left, right)
            }
            Expr::Call(builtin, arg) => self.call(*builtin, arg, scope),
        }
    }

    fn evaluate_bool(&self, expr: &Expr, scope: &Scope<'_>) -> Result<bool, EvaluationError> {
        match self.evaluate(expr, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvaluationError::UnexpectedType {
                expected: "boolean",
                found: other.type_name(),
            }),
        }
    }

    fn call(&self, builtin: Builtin, arg: &Expr, scope: &Scope<'_>) -> Result<Value, EvaluationError> {
        let arg = self.evaluate(arg, scope)?;
        match builtin {
            Builtin::After | Builtin::Idle => {
                let seconds = arg.as_f64().ok_or(EvaluationError::UnexpectedType {
                    expected: "number",
                    found: arg.type_name(),
                })?;
                let since = if builtin == Builtin::After {
                    scope.entered_at.ok_or_else(|| EvaluationError::NoSourceState {
                        name: builtin.name().to_string(),
                    })?
                } else {
                    scope.last_event_at
                };
                Ok(Value::Bool(scope.now - since + TIME_TOLERANCE >= seconds))
            }
            Builtin::Active => {
                let name = arg.as_str().ok_or(EvaluationError::UnexpectedType {
                    expected: "string",
                    found: arg.type_name(),
                })?;
                Ok(Value::Bool(scope.active.is_some_and(|active| active(name))))
            }
        }
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvaluationError> {
    let mismatch = |left: &Value, right: &Value| EvaluationError::TypeMismatch {
        op: op.symbol().to_string(),
        left: left.type_name(),
        right: right.type_name(),
    };

    match (op, &left, &right) {
        (BinaryOp::Add, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (BinaryOp::Sub, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
        (BinaryOp::Mul, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a * b)),
        (BinaryOp::Div | BinaryOp::Rem, Value::Number(_), Value::Number(b)) if *b == 0.0 => {
            Err(EvaluationError::DivisionByZero)
        }
        (BinaryOp::Div, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a / b)),
        (BinaryOp::Rem, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a % b)),
        (BinaryOp::Eq | BinaryOp::Ne, _, _) => {
            let equal = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Str(a), Value::Str(b)) => a == b,
                _ => return Err(mismatch(&left, &right)),
            };
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, _, _) => {
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => return Err(mismatch(&left, &right)),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        _ => Err(mismatch(&left, &right)),
    }
}
