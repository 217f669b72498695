//! Statechart interpreter - drives a model with run-to-completion semantics.
//!
//! One call ([`Interpreter::execute`], [`Interpreter::fire`] or
//! [`Interpreter::advance_time`]) performs one or more macrosteps. A
//! macrostep is a loop of microsteps:
//!
//! 1. take the trigger: the external event for the first round, then queued
//!    internal events, or no event at all;
//! 2. collect eligible transitions (active source, matching or absent event,
//!    guard true);
//! 3. resolve conflicts: deeper sources win, then declaration order; two
//!    transitions conflict when their sources are nested or when one would
//!    exit the other's source;
//! 4. fire the survivors one after the other (exit actions innermost first,
//!    transition action, entry actions outermost first).
//!
//! The loop stops once no transition is eligible and no internal event is
//! pending.
//!
//! # Failures
//!
//! Firing is not atomic. When a guard or action fails, the statements already
//! executed keep their effect, the remaining actions of that microstep are
//! skipped (its configuration change is still completed, so the structural
//! invariants hold), the rest of the macrostep is abandoned and the error is
//! returned. Internal events still queued are processed by the next call.

use crate::checkpoint::{now_millis, Checkpoint};
use crate::clock::Clock;
use crate::context::{Context, EventSink, Scope};
use crate::emitter::{Emitter, EventFilter};
use crate::error::{ChartError, EvaluationError};
use crate::event::Event;
use crate::expr::{Action, Guard};
use crate::model::{
    ConditionKind, Configuration, Model, StateId, StateKind, Transition, TransitionId,
};
use crate::queue::EventQueue;
use crate::trace::{FiredTransition, MacroStep, MicroStep};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Default bound on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 10_000;

/// Tuning knobs for an interpreter.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// A macrostep firing more transitions than this fails with
    /// [`ChartError::MicrostepLimit`].
    pub max_microsteps: usize,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

/// Whether a macrostep is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Processing,
}

/// Routes `send` output: declared outputs go to the emitter, everything else
/// to the internal queue.
struct Outbox<'a> {
    model: &'a Model,
    queue: &'a mut EventQueue,
    emitter: &'a mut Emitter,
    sent: &'a mut Vec<Event>,
}

impl EventSink for Outbox<'_> {
    fn send(&mut self, event: Event) {
        self.sent.push(event.clone());
        if self.model.is_output(&event.name) {
            self.emitter.emit(&event);
        } else {
            self.queue.push_internal(event);
        }
    }
}

/// Executes one statechart model.
pub struct Interpreter {
    model: Arc<Model>,
    options: InterpreterOptions,
    configuration: Configuration,
    context: Context,
    clock: Clock,
    queue: EventQueue,
    emitter: Emitter,
    entry_times: HashMap<StateId, f64>,
    /// Memory of history states, keyed by the history state.
    history: HashMap<StateId, Vec<StateId>>,
    last_event_time: f64,
    state: EngineState,
    initial_step: MacroStep,
}

impl Interpreter {
    /// Loads a model: runs the preamble, enters the initial configuration and
    /// fires whatever eventless transitions that enables.
    pub fn load(model: Arc<Model>) -> Result<Self, ChartError> {
        Self::with_options(model, InterpreterOptions::default())
    }

    pub fn with_options(model: Arc<Model>, options: InterpreterOptions) -> Result<Self, ChartError> {
        let mut interpreter = Self::blank(model, options);
        interpreter.initialize()?;
        tracing::info!(
            model = %interpreter.model.name(),
            configuration = ?interpreter.configuration(),
            "interpreter loaded"
        );
        Ok(interpreter)
    }

    fn blank(model: Arc<Model>, options: InterpreterOptions) -> Self {
        Self {
            model,
            options,
            configuration: Configuration::new(),
            context: Context::new(),
            clock: Clock::new(),
            queue: EventQueue::new(),
            emitter: Emitter::new(),
            entry_times: HashMap::new(),
            history: HashMap::new(),
            last_event_time: 0.0,
            state: EngineState::Idle,
            initial_step: MacroStep::default(),
        }
    }

    fn initialize(&mut self) -> Result<(), ChartError> {
        let model = Arc::clone(&self.model);
        self.state = EngineState::Processing;
        let result = self.initialize_inner(&model);
        self.state = EngineState::Idle;
        self.initial_step = result?;
        Ok(())
    }

    fn initialize_inner(&mut self, model: &Model) -> Result<MacroStep, ChartError> {
        let mut sent = Vec::new();
        if let Some(preamble) = model.preamble() {
            self.run_action(preamble, None, None, &mut sent)
                .map_err(|e| ChartError::evaluation("preamble", e))?;
        }

        let mut step = MicroStep::default();
        for s in model.default_entry_path(model.root()) {
            self.enter_state(model, s, None, &mut step.entered, &mut sent)?;
        }
        step.sent = sent;
        self.check_state_invariants(model, None)?;

        let mut initial = MacroStep {
            time: self.clock.time(),
            event: None,
            steps: vec![step],
        };
        let stabilized = self.macrostep(model, None)?;
        initial.steps.extend(stabilized.steps);
        Ok(initial)
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Queues an external event without processing it.
    pub fn queue(&mut self, event: impl Into<Event>) {
        self.queue.push_external(event.into());
    }

    /// Queues an event and processes everything pending.
    pub fn fire(&mut self, event: impl Into<Event>) -> Result<Vec<MacroStep>, ChartError> {
        self.queue(event);
        self.execute()
    }

    /// Processes pending events, one macrostep per external event. With no
    /// external event pending, runs a single eventless macrostep.
    pub fn execute(&mut self) -> Result<Vec<MacroStep>, ChartError> {
        self.run(false)
    }

    /// Advances the clock, lets time-triggered transitions react, then
    /// processes pending external events.
    pub fn advance_time(&mut self, delta: f64) -> Result<Vec<MacroStep>, ChartError> {
        let now = self.clock.advance(delta)?;
        tracing::trace!(delta, now, "clock advanced");
        self.run(true)
    }

    fn run(&mut self, clock_tick: bool) -> Result<Vec<MacroStep>, ChartError> {
        let mut trace = Vec::new();
        if self.is_final() {
            tracing::debug!(pending = self.queue.len(), "statechart is final, input ignored");
            return Ok(trace);
        }

        let model = Arc::clone(&self.model);
        self.state = EngineState::Processing;
        let result = self.run_inner(&model, clock_tick, &mut trace);
        self.state = EngineState::Idle;
        result.map(|_| trace)
    }

    fn run_inner(
        &mut self,
        model: &Model,
        clock_tick: bool,
        trace: &mut Vec<MacroStep>,
    ) -> Result<(), ChartError> {
        if clock_tick || self.queue.has_internal() || !self.queue.has_external() {
            let step = self.macrostep(model, None)?;
            if !step.is_empty() {
                trace.push(step);
            }
        }
        while !self.is_final() {
            let Some(event) = self.queue.pop_external() else {
                break;
            };
            trace.push(self.macrostep(model, Some(event))?);
        }
        Ok(())
    }

    // =========================================================================
    // Macrosteps and microsteps
    // =========================================================================

    fn macrostep(&mut self, model: &Model, event: Option<Event>) -> Result<MacroStep, ChartError> {
        let now = self.clock.time();
        let mut result = MacroStep {
            time: now,
            event: event.clone(),
            steps: Vec::new(),
        };
        let mut fired_once: HashSet<TransitionId> = HashSet::new();
        let mut trigger = event;
        let mut first = true;

        loop {
            if !first {
                if self.is_final() {
                    break;
                }
                trigger = self.queue.pop_internal();
            }
            first = false;
            if trigger.is_some() {
                self.last_event_time = now;
            }

            let selected = self.select_transitions(model, trigger.as_ref(), &fired_once)?;
            if selected.is_empty() {
                match &trigger {
                    Some(e) => tracing::debug!(event = %e, "event dropped, no transition"),
                    None if !self.queue.has_internal() => break,
                    None => {}
                }
                continue;
            }

            for tid in selected {
                if result.steps.len() >= self.options.max_microsteps {
                    return Err(ChartError::MicrostepLimit {
                        limit: self.options.max_microsteps,
                    });
                }
                let t = model.transition(tid);
                let timed = t.guard.as_ref().is_some_and(Guard::is_timed);
                if t.is_internal() && t.is_eventless() && timed {
                    // a timed guard stays true until the clock moves again
                    fired_once.insert(tid);
                }

                let (step, error) = self.fire_transition(model, t, trigger.as_ref());
                tracing::debug!(
                    time = now,
                    transition = %model.transition_label(tid),
                    exited = ?step.exited,
                    entered = ?step.entered,
                    "microstep"
                );
                result.steps.push(step);

                if let Some(err) = error {
                    tracing::warn!(error = %err, "microstep failed, macrostep abandoned");
                    return Err(err);
                }
            }

            if let Err(err) = self.check_state_invariants(model, trigger.as_ref()) {
                tracing::warn!(error = %err, "invariant violated, macrostep abandoned");
                return Err(err);
            }
        }

        Ok(result)
    }

    /// Eligible transitions after conflict resolution, in firing order.
    fn select_transitions(
        &self,
        model: &Model,
        trigger: Option<&Event>,
        fired_once: &HashSet<TransitionId>,
    ) -> Result<Vec<TransitionId>, ChartError> {
        let mut eligible = Vec::new();
        for source in self.configuration.iter() {
            for t in model.transitions_from(source) {
                let matches = match (&t.event, trigger) {
                    (None, _) => true,
                    (Some(name), Some(e)) => *name == e.name,
                    (Some(_), None) => false,
                };
                if !matches || fired_once.contains(&t.id) {
                    continue;
                }
                if self.guard_holds(model, t, trigger)? {
                    eligible.push(t);
                }
            }
        }

        eligible.sort_by_key(|t| (Reverse(model.depth(t.source)), t.id));

        let mut selected: Vec<(&Transition, Vec<StateId>)> = Vec::new();
        for t in eligible {
            let exits = self.exit_set(model, t);
            let conflict = selected.iter().any(|(other, other_exits)| {
                t.source == other.source
                    || model.is_ancestor(t.source, other.source)
                    || model.is_ancestor(other.source, t.source)
                    || exits.contains(&other.source)
                    || other_exits.contains(&t.source)
            });
            if !conflict {
                selected.push((t, exits));
            }
        }

        let mut ids: Vec<TransitionId> = selected.into_iter().map(|(t, _)| t.id).collect();
        ids.sort_by_key(|id| (model.transition(*id).source, *id));
        Ok(ids)
    }

    fn guard_holds(
        &self,
        model: &Model,
        t: &Transition,
        trigger: Option<&Event>,
    ) -> Result<bool, ChartError> {
        let Some(guard) = &t.guard else {
            return Ok(true);
        };
        let entered_at = self.entry_times.get(&t.source).copied();
        self.holds(model, guard, entered_at, trigger).map_err(|e| {
            ChartError::evaluation(format!("guard of {}", model.transition_label(t.id)), e)
        })
    }

    fn holds(
        &self,
        model: &Model,
        condition: &Guard,
        entered_at: Option<f64>,
        trigger: Option<&Event>,
    ) -> Result<bool, EvaluationError> {
        let configuration = &self.configuration;
        let active = |name: &str| {
            model
                .state_by_name(name)
                .is_some_and(|id| configuration.contains(id))
        };
        let scope = Scope {
            now: self.clock.time(),
            entered_at,
            last_event_at: self.last_event_time,
            event: trigger,
            active: Some(&active),
        };
        self.context.check(condition, &scope)
    }

    /// Fails on the first condition that does not hold.
    fn check_contract(
        &self,
        model: &Model,
        conditions: &[Guard],
        kind: ConditionKind,
        owner: &dyn Fn() -> String,
        entered_at: Option<f64>,
        trigger: Option<&Event>,
    ) -> Result<(), ChartError> {
        for condition in conditions {
            let holds = self
                .holds(model, condition, entered_at, trigger)
                .map_err(|e| ChartError::evaluation(format!("{} of {}", kind, owner()), e))?;
            if !holds {
                return Err(ChartError::ContractViolation {
                    kind,
                    owner: owner(),
                    condition: condition.source().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Invariants of every active state, outermost first.
    fn check_state_invariants(&self, model: &Model, trigger: Option<&Event>) -> Result<(), ChartError> {
        for s in self.configuration.ordered(model) {
            let node = model.state(s);
            if node.contract.invariants.is_empty() {
                continue;
            }
            self.check_contract(
                model,
                &node.contract.invariants,
                ConditionKind::Invariant,
                &|| format!("state '{}'", node.name),
                self.entry_times.get(&s).copied(),
                trigger,
            )?;
        }
        Ok(())
    }

    /// Fires one transition. Returns the microstep and, if an action failed
    /// or a contract was violated, the error; the configuration change is
    /// completed either way.
    fn fire_transition(
        &mut self,
        model: &Model,
        t: &Transition,
        trigger: Option<&Event>,
    ) -> (MicroStep, Option<ChartError>) {
        let mut step = MicroStep {
            event: trigger.cloned(),
            transition: Some(FiredTransition {
                source: model.name_of(t.source).to_string(),
                target: t.target.map(|s| model.name_of(s).to_string()),
                event: t.event.clone(),
            }),
            ..Default::default()
        };
        let mut sent = Vec::new();
        let source_entered = self.entry_times.get(&t.source).copied();

        let label = || model.transition_label(t.id);
        let contract = &t.contract;
        let mut error = self
            .check_contract(
                model,
                &contract.preconditions,
                ConditionKind::Precondition,
                &label,
                source_entered,
                trigger,
            )
            .and_then(|_| {
                self.check_contract(
                    model,
                    &contract.invariants,
                    ConditionKind::Invariant,
                    &label,
                    source_entered,
                    trigger,
                )
            })
            .err();

        let exits = self.exit_set(model, t);
        self.record_history(model, &exits);
        for s in exits {
            if error.is_none() {
                error = self.leave_state(model, s, trigger, &mut sent).err();
            }
            self.configuration.remove(s);
            self.entry_times.remove(&s);
            step.exited.push(model.name_of(s).to_string());
        }

        if error.is_none() {
            if let Some(action) = &t.action {
                if let Err(e) = self.run_action(action, source_entered, trigger, &mut sent) {
                    error = Some(ChartError::evaluation(format!("action of {}", label()), e));
                }
            }
        }
        if error.is_none() {
            error = [ConditionKind::Invariant, ConditionKind::Postcondition]
                .into_iter()
                .try_for_each(|kind| {
                    self.check_contract(
                        model,
                        contract.conditions(kind),
                        kind,
                        &label,
                        source_entered,
                        trigger,
                    )
                })
                .err();
        }

        for s in self.entry_set(model, t) {
            if error.is_none() {
                error = self.enter_state(model, s, trigger, &mut step.entered, &mut sent).err();
            } else {
                self.activate(model, s, &mut step.entered);
            }
        }

        step.sent = sent;
        (step, error)
    }

    /// Runs the exit action of an active state, then checks its
    /// postconditions. The caller removes it from the configuration.
    fn leave_state(
        &mut self,
        model: &Model,
        s: StateId,
        trigger: Option<&Event>,
        sent: &mut Vec<Event>,
    ) -> Result<(), ChartError> {
        let node = model.state(s);
        let entered_at = self.entry_times.get(&s).copied();
        if let Some(action) = &node.on_exit {
            self.run_action(action, entered_at, trigger, sent)
                .map_err(|e| ChartError::evaluation(format!("on exit of '{}'", node.name), e))?;
        }
        self.check_contract(
            model,
            &node.contract.postconditions,
            ConditionKind::Postcondition,
            &|| format!("state '{}'", node.name),
            entered_at,
            trigger,
        )
    }

    fn activate(&mut self, model: &Model, s: StateId, entered: &mut Vec<String>) {
        self.configuration.insert(s);
        self.entry_times.insert(s, self.clock.time());
        entered.push(model.name_of(s).to_string());
    }

    fn enter_state(
        &mut self,
        model: &Model,
        s: StateId,
        trigger: Option<&Event>,
        entered: &mut Vec<String>,
        sent: &mut Vec<Event>,
    ) -> Result<(), ChartError> {
        self.activate(model, s, entered);
        let node = model.state(s);
        let now = Some(self.clock.time());
        self.check_contract(
            model,
            &node.contract.preconditions,
            ConditionKind::Precondition,
            &|| format!("state '{}'", node.name),
            now,
            trigger,
        )?;
        match &node.on_entry {
            Some(action) => self
                .run_action(action, now, trigger, sent)
                .map_err(|e| ChartError::evaluation(format!("on entry of '{}'", node.name), e)),
            None => Ok(()),
        }
    }

    fn run_action(
        &mut self,
        action: &Action,
        entered_at: Option<f64>,
        trigger: Option<&Event>,
        sent: &mut Vec<Event>,
    ) -> Result<(), EvaluationError> {
        let model = &*self.model;
        let configuration = &self.configuration;
        let active = |name: &str| {
            model
                .state_by_name(name)
                .is_some_and(|id| configuration.contains(id))
        };
        let scope = Scope {
            now: self.clock.time(),
            entered_at,
            last_event_at: self.last_event_time,
            event: trigger,
            active: Some(&active),
        };
        let mut outbox = Outbox {
            model,
            queue: &mut self.queue,
            emitter: &mut self.emitter,
            sent,
        };
        self.context.execute(action, &scope, &mut outbox)
    }

    // =========================================================================
    // Exit and entry sets
    // =========================================================================

    /// Deepest non-parallel proper ancestor of both ends; the region a
    /// transition operates in. `None` means the whole chart is left.
    fn domain(model: &Model, source: StateId, target: StateId) -> Option<StateId> {
        let mut domain = model.least_common_ancestor(source, target);
        while let Some(d) = domain {
            if !model.state(d).is_parallel() {
                break;
            }
            domain = model.parent_of(d);
        }
        domain
    }

    /// Ancestor-or-self of `node` whose parent is `domain` (the root when the
    /// domain is the whole chart).
    fn child_toward(model: &Model, domain: Option<StateId>, node: StateId) -> StateId {
        std::iter::successors(Some(node), |s| model.parent_of(*s))
            .find(|s| model.parent_of(*s) == domain)
            .unwrap_or_else(|| model.root())
    }

    /// Active states left by `t`, innermost first.
    fn exit_set(&self, model: &Model, t: &Transition) -> Vec<StateId> {
        let Some(target) = t.target else {
            return Vec::new();
        };
        let top = Self::child_toward(model, Self::domain(model, t.source, target), t.source);
        let mut exits: Vec<StateId> = self
            .configuration
            .iter()
            .filter(|s| *s == top || model.is_ancestor(top, *s))
            .collect();
        exits.sort_by_key(|s| (Reverse(model.depth(*s)), Reverse(*s)));
        exits
    }

    /// States entered by `t`, outermost first.
    fn entry_set(&self, model: &Model, t: &Transition) -> Vec<StateId> {
        let Some(target) = t.target else {
            return Vec::new();
        };
        let top = Self::child_toward(model, Self::domain(model, t.source, target), target);
        let mut entries = Vec::new();
        if model.state(top).is_history() {
            // The history's parent stays active; only its content is entered.
            let memory = self.history_memory(model, top);
            if let Some(child) = model.parent_of(top).and_then(|p| Self::child_for(model, p, &memory)) {
                self.enter_toward(model, child, &memory, &mut entries);
            }
        } else {
            self.enter_toward(model, top, &[target], &mut entries);
        }
        entries
    }

    /// Enters `s` and, below it, whatever leads to `leaves`; compound states
    /// with no such child enter their initial state, parallel states enter
    /// every child.
    fn enter_toward(&self, model: &Model, s: StateId, leaves: &[StateId], out: &mut Vec<StateId>) {
        out.push(s);
        let node = model.state(s);
        match node.kind {
            StateKind::Compound { initial } => {
                let history = node
                    .children
                    .iter()
                    .copied()
                    .find(|c| model.state(*c).is_history() && leaves.contains(c));
                match history {
                    Some(h) => {
                        let memory = self.history_memory(model, h);
                        let child = Self::child_for(model, s, &memory).unwrap_or(initial);
                        self.enter_toward(model, child, &memory, out);
                    }
                    None => {
                        let child = Self::child_for(model, s, leaves).unwrap_or(initial);
                        self.enter_toward(model, child, leaves, out);
                    }
                }
            }
            StateKind::Parallel => {
                for c in &node.children {
                    self.enter_toward(model, *c, leaves, out);
                }
            }
            _ => {}
        }
    }

    /// Child of `parent` that is, or contains, one of `leaves`.
    fn child_for(model: &Model, parent: StateId, leaves: &[StateId]) -> Option<StateId> {
        model.children_of(parent).iter().copied().find(|c| {
            !model.state(*c).is_history()
                && leaves.iter().any(|l| l == c || model.is_ancestor(*c, *l))
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    fn record_history(&mut self, model: &Model, exits: &[StateId]) {
        for s in exits {
            for h in model.children_of(*s) {
                let StateKind::History { deep, .. } = model.state(*h).kind else {
                    continue;
                };
                let memory: Vec<StateId> = if deep {
                    self.configuration
                        .leaves(model)
                        .into_iter()
                        .filter(|l| model.is_ancestor(*s, *l))
                        .collect()
                } else {
                    model
                        .children_of(*s)
                        .iter()
                        .copied()
                        .filter(|c| self.configuration.contains(*c))
                        .collect()
                };
                self.history.insert(*h, memory);
            }
        }
    }

    /// Remembered states of a history state, falling back on its default
    /// memory, then on its parent's initial state.
    fn history_memory(&self, model: &Model, h: StateId) -> Vec<StateId> {
        if let Some(memory) = self.history.get(&h) {
            return memory.clone();
        }
        if let StateKind::History {
            memory: Some(m), ..
        } = model.state(h).kind
        {
            return vec![m];
        }
        model
            .parent_of(h)
            .and_then(|p| model.state(p).initial())
            .into_iter()
            .collect()
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Active state names, ordered by depth then declaration order.
    pub fn configuration(&self) -> Vec<String> {
        self.configuration.names(&self.model)
    }

    /// Active states without active children.
    pub fn active_leaves(&self) -> Vec<String> {
        self.configuration
            .leaves(&self.model)
            .into_iter()
            .map(|s| self.model.name_of(s).to_string())
            .collect()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.model
            .state_by_name(name)
            .is_some_and(|id| self.configuration.contains(id))
    }

    /// Raw configuration, for invariant checks.
    pub fn active_states(&self) -> &Configuration {
        &self.configuration
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn time(&self) -> f64 {
        self.clock.time()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Entry time of an active state.
    pub fn entry_time(&self, name: &str) -> Option<f64> {
        self.model
            .state_by_name(name)
            .and_then(|id| self.entry_times.get(&id).copied())
    }

    /// Events pending in the queue, in consumption order.
    pub fn pending_events(&self) -> impl Iterator<Item = &Event> {
        self.queue.iter()
    }

    /// Events with a transition leaving one of the active states.
    pub fn available_events(&self) -> Vec<String> {
        let active: Vec<StateId> = self.configuration.iter().collect();
        self.model.events_for(&active)
    }

    /// True once a final child of the root is active; input is then ignored.
    pub fn is_final(&self) -> bool {
        let root = self.model.root();
        self.configuration.iter().any(|s| {
            let node = self.model.state(s);
            node.is_final() && (s == root || node.parent == Some(root))
        })
    }

    /// Macrostep performed while loading.
    pub fn initial_step(&self) -> &MacroStep {
        &self.initial_step
    }

    // =========================================================================
    // Output subscriptions
    // =========================================================================

    /// Receives every output event. Returns the subscription id.
    pub fn subscribe<F>(&mut self, listener: F) -> String
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.emitter.subscribe(listener)
    }

    pub fn subscribe_filtered<F>(&mut self, filter: EventFilter, listener: F) -> String
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.emitter.subscribe_filtered(filter, listener)
    }

    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        self.emitter.unsubscribe(subscription_id)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Captures the interpreter's state.
    pub fn checkpoint(&self) -> Checkpoint {
        let model = &self.model;
        let names = |ids: &[StateId]| -> Vec<String> {
            ids.iter().map(|s| model.name_of(*s).to_string()).collect()
        };
        Checkpoint {
            id: Checkpoint::generate_id(),
            model: model.name().to_string(),
            checksum: model.checksum().to_string(),
            created_at: now_millis(),
            time: self.clock.time(),
            last_event_time: self.last_event_time,
            active_states: self.configuration(),
            context: self.context.clone(),
            entry_timestamps: self
                .entry_times
                .iter()
                .map(|(s, t)| (model.name_of(*s).to_string(), *t))
                .collect(),
            history: self
                .history
                .iter()
                .map(|(h, memory)| (model.name_of(*h).to_string(), names(memory)))
                .collect(),
            internal_events: self.queue.internal().cloned().collect(),
            external_events: self.queue.external().cloned().collect(),
        }
    }

    /// Resumes from a checkpoint taken on the same model. No action runs.
    pub fn restore(model: Arc<Model>, checkpoint: &Checkpoint) -> Result<Self, ChartError> {
        Self::restore_with_options(model, checkpoint, InterpreterOptions::default())
    }

    pub fn restore_with_options(
        model: Arc<Model>,
        checkpoint: &Checkpoint,
        options: InterpreterOptions,
    ) -> Result<Self, ChartError> {
        let invalid = |reason: String| ChartError::InvalidCheckpoint { reason };

        if checkpoint.model != model.name() {
            return Err(invalid(format!(
                "checkpoint is for model '{}', not '{}'",
                checkpoint.model,
                model.name()
            )));
        }
        if checkpoint.checksum != model.checksum() {
            return Err(invalid(format!(
                "checksum mismatch: checkpoint {}, model {}",
                checkpoint.checksum,
                model.checksum()
            )));
        }
        if !checkpoint.time.is_finite() || checkpoint.time < 0.0 {
            return Err(invalid(format!("invalid time {}", checkpoint.time)));
        }

        let lookup = |name: &str| {
            model
                .state_by_name(name)
                .ok_or_else(|| invalid(format!("unknown state '{}'", name)))
        };

        let mut configuration = Configuration::new();
        for name in &checkpoint.active_states {
            configuration.insert(lookup(name)?);
        }
        if configuration.is_empty() {
            return Err(invalid("no active state".to_string()));
        }
        configuration.check_invariants(&model).map_err(invalid)?;

        let mut entry_times = HashMap::new();
        for (name, t) in &checkpoint.entry_timestamps {
            let id = lookup(name)?;
            if !configuration.contains(id) {
                return Err(invalid(format!("entry time for inactive state '{}'", name)));
            }
            entry_times.insert(id, *t);
        }
        if let Some(missing) = configuration.iter().find(|s| !entry_times.contains_key(s)) {
            return Err(invalid(format!(
                "no entry time for active state '{}'",
                model.name_of(missing)
            )));
        }

        let mut history = HashMap::new();
        for (name, memory) in &checkpoint.history {
            let h = lookup(name)?;
            if !model.state(h).is_history() {
                return Err(invalid(format!("'{}' is not a history state", name)));
            }
            let memory = memory
                .iter()
                .map(|m| lookup(m.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            history.insert(h, memory);
        }

        let mut interpreter = Self::blank(model, options);
        interpreter.configuration = configuration;
        interpreter.entry_times = entry_times;
        interpreter.history = history;
        interpreter.context = checkpoint.context.clone();
        interpreter.clock.restore(checkpoint.time);
        interpreter.last_event_time = checkpoint.last_event_time;
        for e in &checkpoint.internal_events {
            interpreter.queue.push_internal(e.clone());
        }
        for e in &checkpoint.external_events {
            interpreter.queue.push_external(e.clone());
        }

        tracing::info!(
            model = %interpreter.model.name(),
            checkpoint = %checkpoint.id,
            time = checkpoint.time,
            "interpreter restored"
        );
        Ok(interpreter)
    }

    /// Entry timestamps keyed by state name.
    pub fn entry_timestamps(&self) -> BTreeMap<String, f64> {
        self.entry_times
            .iter()
            .map(|(s, t)| (self.model.name_of(*s).to_string(), *t))
            .collect()
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("model", &self.model.name())
            .field("time", &self.clock.time())
            .field("configuration", &self.configuration())
            .field("context", &self.context)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, StateSpec, TransitionSpec};
    use crate::value::Value;

    fn load(builder: &ModelBuilder) -> Interpreter {
        Interpreter::load(Arc::new(builder.build().unwrap())).unwrap()
    }

    fn toggle() -> ModelBuilder {
        let mut b = ModelBuilder::new("toggle");
        b.preamble("flips = 0")
            .state(StateSpec::compound("root").initial("off"))
            .state(StateSpec::basic("off").child_of("root"))
            .state(StateSpec::basic("on").child_of("root").on_entry("flips += 1"))
            .transition(TransitionSpec::new("off").event("flip").target("on"))
            .transition(TransitionSpec::new("on").event("flip").target("off"));
        b
    }

    #[test]
    fn test_load_enters_initial_configuration() {
        let it = load(&toggle());
        assert_eq!(it.configuration(), vec!["root", "off"]);
        assert_eq!(it.context().get("flips"), Some(&Value::from(0)));
        assert_eq!(it.state(), EngineState::Idle);
        assert_eq!(it.initial_step().entered_states().collect::<Vec<_>>(), vec!["root", "off"]);
    }

    #[test]
    fn test_fire_toggles() {
        let mut it = load(&toggle());
        let trace = it.fire("flip").unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].exited_states().collect::<Vec<_>>(), vec!["off"]);
        assert_eq!(trace[0].entered_states().collect::<Vec<_>>(), vec!["on"]);
        assert_eq!(it.configuration(), vec!["root", "on"]);

        it.fire("flip").unwrap();
        it.fire("flip").unwrap();
        assert_eq!(it.context().get("flips"), Some(&Value::from(2)));
    }

    #[test]
    fn test_unmatched_event_is_noop() {
        let mut it = load(&toggle());
        let before = (it.configuration(), it.context().clone());
        let trace = it.fire("unknown").unwrap();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].is_empty());
        assert_eq!((it.configuration(), it.context().clone()), before);
    }

    #[test]
    fn test_preamble_error_fails_load() {
        let mut b = toggle();
        b.preamble("x = y + 1");
        let err = Interpreter::load(Arc::new(b.build().unwrap())).unwrap_err();
        assert!(matches!(
            err,
            ChartError::Evaluation {
                source: EvaluationError::UndefinedVariable { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_deepest_source_wins() {
        let mut b = ModelBuilder::new("nested");
        b.state(StateSpec::compound("root").initial("outer"))
            .state(StateSpec::compound("outer").child_of("root").initial("inner"))
            .state(StateSpec::basic("inner").child_of("outer"))
            .state(StateSpec::basic("a").child_of("outer"))
            .state(StateSpec::basic("b").child_of("root"))
            .transition(TransitionSpec::new("outer").event("go").target("b"))
            .transition(TransitionSpec::new("inner").event("go").target("a"));
        let mut it = load(&b);
        it.fire("go").unwrap();
        assert_eq!(it.configuration(), vec!["root", "outer", "a"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let mut b = toggle();
        b.state(StateSpec::basic("other").child_of("root"))
            .transition(TransitionSpec::new("off").event("flip").target("other"));
        let mut it = load(&b);
        it.fire("flip").unwrap();
        assert_eq!(it.configuration(), vec!["root", "on"]);
    }

    #[test]
    fn test_internal_events_processed_before_external() {
        let mut b = ModelBuilder::new("chain");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("root"))
            .state(StateSpec::basic("c").child_of("root"))
            .transition(TransitionSpec::new("a").event("go").target("b").action("send('next')"))
            .transition(TransitionSpec::new("b").event("next").target("c"))
            .transition(TransitionSpec::new("b").event("other").target("a"));
        let mut it = load(&b);
        it.queue("go");
        it.queue("other");
        let trace = it.execute().unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].steps.len(), 2);
        assert_eq!(trace[0].steps[0].sent[0].name, "next");
        assert_eq!(
            trace[0].steps[1].event.as_ref().map(|e| e.name.as_str()),
            Some("next")
        );
        // `other` arrives after `next` moved to c
        assert!(trace[1].is_empty());
        assert_eq!(it.configuration(), vec!["root", "c"]);
    }

    #[test]
    fn test_eventless_transition_fires_on_load() {
        let mut b = ModelBuilder::new("auto");
        b.preamble("ready = true")
            .state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("root"))
            .transition(TransitionSpec::new("a").guard("ready").target("b"));
        let it = load(&b);
        assert_eq!(it.configuration(), vec!["root", "b"]);
        assert_eq!(it.initial_step().steps.len(), 2);
    }

    fn counter() -> ModelBuilder {
        let mut b = ModelBuilder::new("counter");
        b.preamble("n = 0")
            .state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .transition(TransitionSpec::new("a").guard("n < 3").action("n += 1"));
        b
    }

    #[test]
    fn test_internal_eventless_runs_to_stability() {
        let mut it = load(&counter());
        assert_eq!(it.context().get("n"), Some(&Value::from(3)));
        assert_eq!(it.initial_step().steps.len(), 4);

        it.advance_time(1.0).unwrap();
        assert_eq!(it.context().get("n"), Some(&Value::from(3)));
    }

    #[test]
    fn test_unmatched_event_leaves_stable_context_alone() {
        let mut it = load(&counter());
        let before = it.context().clone();
        let trace = it.fire("nobody_listens").unwrap();
        assert!(trace.iter().all(|m| m.is_empty()));
        assert_eq!(it.context(), &before);
        assert!(it.execute().unwrap().is_empty());
        assert_eq!(it.context(), &before);
    }

    #[test]
    fn test_timed_internal_transition_fires_once_per_macrostep() {
        let mut b = ModelBuilder::new("ticker");
        b.preamble("ticks = 0")
            .state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .transition(TransitionSpec::new("a").guard("after(1)").action("ticks += 1"));
        let mut it = load(&b);
        assert_eq!(it.context().get("ticks"), Some(&Value::from(0)));

        it.advance_time(1.0).unwrap();
        assert_eq!(it.context().get("ticks"), Some(&Value::from(1)));
        it.advance_time(0.5).unwrap();
        assert_eq!(it.context().get("ticks"), Some(&Value::from(2)));
    }

    #[test]
    fn test_unbounded_internal_transition_hits_limit() {
        let mut b = ModelBuilder::new("runaway");
        b.preamble("n = 0")
            .state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .transition(TransitionSpec::new("a").guard("n >= 0").action("n += 1"));
        let model = Arc::new(b.build().unwrap());
        let err = Interpreter::with_options(model, InterpreterOptions { max_microsteps: 20 })
            .unwrap_err();
        assert!(matches!(err, ChartError::MicrostepLimit { limit: 20 }));
    }

    fn violation(err: &ChartError) -> (ConditionKind, &str, &str) {
        match err {
            ChartError::ContractViolation {
                kind,
                owner,
                condition,
            } => (*kind, owner.as_str(), condition.as_str()),
            other => panic!("expected a contract violation, got {other:?}"),
        }
    }

    fn door() -> ModelBuilder {
        let mut b = ModelBuilder::new("door");
        b.preamble("opened = 0; limit = 2")
            .state(StateSpec::compound("root").initial("closed"))
            .state(StateSpec::basic("closed").child_of("root"))
            .state(
                StateSpec::basic("open")
                    .child_of("root")
                    .on_entry("opened += 1")
                    .precondition("opened < limit"),
            )
            .transition(TransitionSpec::new("closed").event("push").target("open"))
            .transition(TransitionSpec::new("open").event("pull").target("closed"));
        b
    }

    #[test]
    fn test_state_precondition_checked_before_entry_action() {
        let mut it = load(&door());
        for _ in 0..2 {
            it.fire("push").unwrap();
            it.fire("pull").unwrap();
        }

        let err = it.fire("push").unwrap_err();
        assert_eq!(
            violation(&err),
            (ConditionKind::Precondition, "state 'open'", "opened < limit")
        );
        assert_eq!(err.error_code(), "CONTRACT_VIOLATION");
        // the state is entered, its entry action is not run
        assert_eq!(it.configuration(), vec!["root", "open"]);
        assert_eq!(it.context().get("opened"), Some(&Value::from(2)));

        it.fire("pull").unwrap();
        assert_eq!(it.configuration(), vec!["root", "closed"]);
    }

    #[test]
    fn test_state_postcondition_checked_after_exit_action() {
        let mut b = ModelBuilder::new("jobs");
        b.preamble("jobs = 0; stopped = false")
            .state(StateSpec::compound("root").initial("idle"))
            .state(StateSpec::basic("idle").child_of("root"))
            .state(
                StateSpec::basic("busy")
                    .child_of("root")
                    .on_exit("jobs -= 1")
                    .postcondition("jobs == 0"),
            )
            .transition(TransitionSpec::new("idle").event("start").target("busy").action("jobs += 1"))
            .transition(TransitionSpec::new("busy").event("more").action("jobs += 1"))
            .transition(TransitionSpec::new("busy").event("stop").target("idle").action("stopped = true"));
        let mut it = load(&b);

        it.fire("start").unwrap();
        it.fire("stop").unwrap();
        assert_eq!(it.context().get("stopped"), Some(&Value::from(true)));

        it.fire("start").unwrap();
        it.fire("more").unwrap();
        let err = it.fire("stop").unwrap_err();
        assert_eq!(
            violation(&err),
            (ConditionKind::Postcondition, "state 'busy'", "jobs == 0")
        );
        assert_eq!(it.context().get("jobs"), Some(&Value::from(1)));
        assert_eq!(it.configuration(), vec!["root", "idle"]);
    }

    fn timer(remaining: i64) -> ModelBuilder {
        let mut b = ModelBuilder::new("timer");
        b.preamble(format!("remaining = {remaining}"))
            .state(StateSpec::compound("root").initial("counting"))
            .state(
                StateSpec::basic("counting")
                    .child_of("root")
                    .invariant("remaining >= 0"),
            )
            .transition(TransitionSpec::new("counting").event("tick").action("remaining -= 1"));
        b
    }

    #[test]
    fn test_state_invariant_checked_after_each_round() {
        let mut it = load(&timer(2));
        it.fire("tick").unwrap();
        it.fire("tick").unwrap();

        let err = it.fire("tick").unwrap_err();
        assert_eq!(
            violation(&err),
            (ConditionKind::Invariant, "state 'counting'", "remaining >= 0")
        );
        assert_eq!(it.context().get("remaining"), Some(&Value::from(-1)));
        assert!(!it.is_final());
    }

    #[test]
    fn test_state_invariant_checked_on_load() {
        let err = Interpreter::load(Arc::new(timer(-1).build().unwrap())).unwrap_err();
        assert_eq!(violation(&err).0, ConditionKind::Invariant);
    }

    fn gate() -> ModelBuilder {
        let mut b = ModelBuilder::new("gate");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("root").on_entry("entered = true"))
            .transition(TransitionSpec::new("b").event("back").target("a"));
        b
    }

    #[test]
    fn test_transition_precondition_checked_before_action() {
        let mut b = gate();
        b.preamble("x = 0; entered = false").transition(
            TransitionSpec::new("a")
                .event("go")
                .target("b")
                .precondition("x > 0")
                .action("x = 10"),
        );
        let mut it = load(&b);

        let err = it.fire("go").unwrap_err();
        assert_eq!(
            violation(&err),
            (ConditionKind::Precondition, "a -[go]-> b", "x > 0")
        );
        assert_eq!(it.context().get("x"), Some(&Value::from(0)));
        assert_eq!(it.context().get("entered"), Some(&Value::from(false)));
        assert_eq!(it.configuration(), vec!["root", "b"]);
    }

    #[test]
    fn test_transition_postcondition_checked_after_action() {
        let mut b = gate();
        b.preamble("x = 0; entered = false").transition(
            TransitionSpec::new("a")
                .event("go")
                .target("b")
                .action("x -= 1")
                .postcondition("x >= 0"),
        );
        let mut it = load(&b);

        let err = it.fire("go").unwrap_err();
        assert_eq!(
            violation(&err),
            (ConditionKind::Postcondition, "a -[go]-> b", "x >= 0")
        );
        assert_eq!(it.context().get("x"), Some(&Value::from(-1)));
        assert_eq!(it.context().get("entered"), Some(&Value::from(false)));
    }

    #[test]
    fn test_transition_invariant_checked_before_and_after() {
        let mut b = gate();
        b.preamble("x = 1; entered = false").transition(
            TransitionSpec::new("a")
                .event("go")
                .target("b")
                .invariant("x > 0")
                .action("x -= 1"),
        );
        let mut it = load(&b);

        // holds before the action, broken by it
        let err = it.fire("go").unwrap_err();
        assert_eq!(violation(&err), (ConditionKind::Invariant, "a -[go]-> b", "x > 0"));
        assert_eq!(it.context().get("x"), Some(&Value::from(0)));

        it.fire("back").unwrap();
        // already broken, so the action is skipped
        let err = it.fire("go").unwrap_err();
        assert_eq!(violation(&err).0, ConditionKind::Invariant);
        assert_eq!(it.context().get("x"), Some(&Value::from(0)));
    }

    #[test]
    fn test_failing_condition_is_evaluation_error() {
        let mut b = gate();
        b.preamble("entered = false").transition(
            TransitionSpec::new("a")
                .event("go")
                .target("b")
                .precondition("missing > 0"),
        );
        let mut it = load(&b);
        let err = it.fire("go").unwrap_err();
        match err {
            ChartError::Evaluation { location, source } => {
                assert_eq!(location, "precondition of a -[go]-> b");
                assert!(matches!(source, EvaluationError::UndefinedVariable { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_microstep_limit() {
        let mut b = ModelBuilder::new("loop");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("root"))
            .transition(TransitionSpec::new("a").guard("true").target("b"))
            .transition(TransitionSpec::new("b").guard("true").target("a"));
        let model = Arc::new(b.build().unwrap());
        let err = Interpreter::with_options(model, InterpreterOptions { max_microsteps: 50 })
            .unwrap_err();
        assert!(matches!(err, ChartError::MicrostepLimit { limit: 50 }));
    }

    #[test]
    fn test_action_error_is_not_atomic() {
        let mut b = ModelBuilder::new("faulty");
        b.preamble("x = 0")
            .state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("root").on_entry("entered = true"))
            .transition(
                TransitionSpec::new("a")
                    .event("go")
                    .target("b")
                    .action("x = 1\nx = x / 0\nx = 2"),
            );
        let mut it = load(&b);
        let err = it.fire("go").unwrap_err();
        assert!(matches!(
            err,
            ChartError::Evaluation {
                source: EvaluationError::DivisionByZero,
                ..
            }
        ));
        assert_eq!(it.context().get("x"), Some(&Value::from(1)));
        assert!(it.context().get("entered").is_none());
        assert_eq!(it.configuration(), vec!["root", "b"]);
        assert!(it.active_states().check_invariants(it.model()).is_ok());
        assert_eq!(it.state(), EngineState::Idle);

        // the interpreter keeps working
        assert!(it.fire("go").unwrap()[0].is_empty());
    }

    #[test]
    fn test_guard_error_surfaces() {
        let mut b = toggle();
        b.transition(TransitionSpec::new("off").event("check").guard("missing > 1").target("on"));
        let mut it = load(&b);
        let err = it.fire("check").unwrap_err();
        assert_eq!(err.error_code(), "EVALUATION_ERROR");
        assert_eq!(it.configuration(), vec!["root", "off"]);
    }

    #[test]
    fn test_output_events_reach_subscribers() {
        let mut b = toggle();
        b.output("flipped")
            .transition(TransitionSpec::new("on").event("ping").action("send('flipped', n=flips)"));
        let mut it = load(&b);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        it.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        it.fire("flip").unwrap();
        it.fire("ping").unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("n"), Some(&Value::from(1)));
        assert!(it.pending_events().next().is_none());
    }

    #[test]
    fn test_final_state_stops_interpreter() {
        let mut b = toggle();
        b.state(StateSpec::final_state("done").child_of("root"))
            .transition(TransitionSpec::new("off").event("quit").target("done"));
        let mut it = load(&b);
        it.fire("quit").unwrap();
        assert!(it.is_final());
        assert!(it.fire("flip").unwrap().is_empty());
        assert_eq!(it.configuration(), vec!["root", "done"]);
    }

    fn history_chart(deep: bool) -> ModelBuilder {
        let mut b = ModelBuilder::new("history");
        b.state(StateSpec::compound("root").initial("work"))
            .state(StateSpec::compound("work").child_of("root").initial("first"))
            .state(StateSpec::basic("first").child_of("work"))
            .state(StateSpec::compound("second").child_of("work").initial("s1"))
            .state(StateSpec::basic("s1").child_of("second"))
            .state(StateSpec::basic("s2").child_of("second"))
            .state(StateSpec::history("h", deep).child_of("work"))
            .state(StateSpec::basic("paused").child_of("root"))
            .transition(TransitionSpec::new("first").event("next").target("second"))
            .transition(TransitionSpec::new("s1").event("next").target("s2"))
            .transition(TransitionSpec::new("work").event("pause").target("paused"))
            .transition(TransitionSpec::new("paused").event("resume").target("h"));
        b
    }

    #[test]
    fn test_shallow_history() {
        let mut it = load(&history_chart(false));
        it.fire("next").unwrap();
        it.fire("next").unwrap();
        assert!(it.is_active("s2"));
        it.fire("pause").unwrap();
        assert_eq!(it.configuration(), vec!["root", "paused"]);
        it.fire("resume").unwrap();
        assert_eq!(it.configuration(), vec!["root", "work", "second", "s1"]);
    }

    #[test]
    fn test_deep_history() {
        let mut it = load(&history_chart(true));
        it.fire("next").unwrap();
        it.fire("next").unwrap();
        it.fire("pause").unwrap();
        it.fire("resume").unwrap();
        assert_eq!(it.configuration(), vec!["root", "work", "second", "s2"]);
    }

    fn history_entry_chart(memory: Option<&str>) -> ModelBuilder {
        let mut h = StateSpec::history("h", false).child_of("work");
        if let Some(m) = memory {
            h = h.memory(m);
        }
        let mut b = ModelBuilder::new("history entry");
        b.state(StateSpec::compound("root").initial("outside"))
            .state(StateSpec::basic("outside").child_of("root"))
            .state(StateSpec::compound("work").child_of("root").initial("first"))
            .state(StateSpec::basic("first").child_of("work"))
            .state(StateSpec::basic("second").child_of("work"))
            .state(h)
            .transition(TransitionSpec::new("outside").event("enter").target("h"));
        b
    }

    #[test]
    fn test_history_without_memory_uses_initial() {
        let mut it = load(&history_entry_chart(None));
        it.fire("enter").unwrap();
        assert_eq!(it.configuration(), vec!["root", "work", "first"]);
    }

    #[test]
    fn test_history_default_memory() {
        let mut it = load(&history_entry_chart(Some("second")));
        it.fire("enter").unwrap();
        assert_eq!(it.configuration(), vec!["root", "work", "second"]);
        assert!(!it.is_active("h"));
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut it = load(&toggle());
        it.fire("flip").unwrap();
        it.advance_time(2.5).unwrap();
        it.queue("flip");

        let ckpt = it.checkpoint();
        assert_eq!(ckpt.active_states, vec!["root", "on"]);
        assert_eq!(ckpt.external_events.len(), 1);

        let mut restored = Interpreter::restore(Arc::clone(it.model()), &ckpt).unwrap();
        assert_eq!(restored.configuration(), it.configuration());
        assert_eq!(restored.context(), it.context());
        assert_eq!(restored.time(), 2.5);
        assert_eq!(restored.entry_timestamps(), it.entry_timestamps());

        restored.execute().unwrap();
        assert_eq!(restored.configuration(), vec!["root", "off"]);
    }

    #[test]
    fn test_restore_rejects_mismatches() {
        let it = load(&toggle());
        let model = Arc::clone(it.model());

        let mut bad = it.checkpoint();
        bad.checksum = "00000000".into();
        assert!(matches!(
            Interpreter::restore(Arc::clone(&model), &bad),
            Err(ChartError::InvalidCheckpoint { .. })
        ));

        let mut bad = it.checkpoint();
        bad.active_states = vec!["root".into(), "off".into(), "on".into()];
        bad.entry_timestamps.insert("on".into(), 0.0);
        assert!(matches!(
            Interpreter::restore(Arc::clone(&model), &bad),
            Err(ChartError::InvalidCheckpoint { .. })
        ));

        let mut bad = it.checkpoint();
        bad.active_states.push("ghost".into());
        assert!(matches!(
            Interpreter::restore(Arc::clone(&model), &bad),
            Err(ChartError::InvalidCheckpoint { .. })
        ));

        let mut bad = it.checkpoint();
        bad.entry_timestamps.clear();
        assert!(matches!(
            Interpreter::restore(model, &bad),
            Err(ChartError::InvalidCheckpoint { .. })
        ));
    }

    #[test]
    fn test_advance_rejects_negative_delta() {
        let mut it = load(&toggle());
        it.advance_time(1.0).unwrap();
        assert!(matches!(it.advance_time(-0.5), Err(ChartError::Clock(_))));
        assert_eq!(it.time(), 1.0);
    }

    #[test]
    fn test_available_events() {
        let mut b = toggle();
        b.transition(TransitionSpec::new("root").event("reset").target("off"));
        let it = load(&b);
        assert_eq!(it.available_events(), vec!["flip", "reset"]);
    }
}
