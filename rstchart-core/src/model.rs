//! Statechart model.
//!
//! A [`Model`] is an immutable arena of [`StateNode`]s and [`Transition`]s,
//! built once by [`ModelBuilder`] and shared (usually behind an `Arc`) by
//! every interpreter running it. States are numbered in declaration order;
//! that order breaks every tie the interpreter has to make.

use crate::error::ModelError;
use crate::expr::{Action, Guard};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Index of a state in its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub usize);

/// Index of a transition in its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(pub usize);

/// Kind-specific part of a state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    /// A leaf.
    Basic,
    /// Exactly one child is active while the state is active.
    Compound { initial: StateId },
    /// All children are active while the state is active.
    Parallel,
    /// A leaf with no outgoing transitions.
    Final,
    /// Pseudo-state remembering the last active child (or leaves, if deep)
    /// of its parent. Never part of a configuration.
    History { deep: bool, memory: Option<StateId> },
}

/// A state of the model.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: StateId,
    pub name: String,
    pub kind: StateKind,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub on_entry: Option<Action>,
    pub on_exit: Option<Action>,
    pub contract: Contract,
    /// Outgoing transitions in declaration order.
    pub transitions: Vec<TransitionId>,
    pub depth: usize,
}

impl StateNode {
    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Compound { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StateKind::Parallel)
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Final)
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History { .. })
    }

    pub fn initial(&self) -> Option<StateId> {
        match self.kind {
            StateKind::Compound { initial } => Some(initial),
            _ => None,
        }
    }

    /// Name of the kind, as used in descriptions.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StateKind::Basic => "basic",
            StateKind::Compound { .. } => "compound",
            StateKind::Parallel => "parallel",
            StateKind::Final => "final",
            StateKind::History { deep: false, .. } => "shallow history",
            StateKind::History { deep: true, .. } => "deep history",
        }
    }
}

/// Part of a contract a condition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// `before`: holds when a state is entered, or before a transition runs.
    Precondition,
    /// `after`: holds when a state has been exited, or after a transition ran.
    Postcondition,
    /// `always`: holds while a state is active, and around a transition's action.
    Invariant,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionKind::Precondition => "precondition",
            ConditionKind::Postcondition => "postcondition",
            ConditionKind::Invariant => "invariant",
        })
    }
}

/// Conditions checked while a state or transition is in play.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contract {
    pub preconditions: Vec<Guard>,
    pub postconditions: Vec<Guard>,
    pub invariants: Vec<Guard>,
}

impl Contract {
    fn parse(spec: &ContractSpec) -> Result<Self, ModelError> {
        let parse_all = |sources: &[String]| -> Result<Vec<Guard>, ModelError> {
            sources.iter().map(|c| Guard::parse(c)).collect()
        };
        Ok(Self {
            preconditions: parse_all(&spec.preconditions)?,
            postconditions: parse_all(&spec.postconditions)?,
            invariants: parse_all(&spec.invariants)?,
        })
    }

    pub fn conditions(&self, kind: ConditionKind) -> &[Guard] {
        match kind {
            ConditionKind::Precondition => &self.preconditions,
            ConditionKind::Postcondition => &self.postconditions,
            ConditionKind::Invariant => &self.invariants,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preconditions.is_empty() && self.postconditions.is_empty() && self.invariants.is_empty()
    }

    fn describe(&self, out: &mut String) {
        for kind in [
            ConditionKind::Precondition,
            ConditionKind::Postcondition,
            ConditionKind::Invariant,
        ] {
            for c in self.conditions(kind) {
                out.push_str(&format!("  {} {}\n", kind, c.source()));
            }
        }
    }
}

/// A transition of the model.
#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub source: StateId,
    /// `None` for an internal transition.
    pub target: Option<StateId>,
    /// `None` for an eventless transition.
    pub event: Option<String>,
    pub guard: Option<Guard>,
    pub action: Option<Action>,
    pub contract: Contract,
}

impl Transition {
    pub fn is_internal(&self) -> bool {
        self.target.is_none()
    }

    pub fn is_eventless(&self) -> bool {
        self.event.is_none()
    }
}

/// Validated, indexed statechart.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    description: Option<String>,
    preamble: Option<Action>,
    outputs: BTreeSet<String>,
    states: Vec<StateNode>,
    transitions: Vec<Transition>,
    by_name: HashMap<String, StateId>,
    root: StateId,
    checksum: String,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Statements run once against an empty context when an interpreter loads.
    pub fn preamble(&self) -> Option<&Action> {
        self.preamble.as_ref()
    }

    /// Event names that `send` hands to the emitter instead of the queue.
    pub fn outputs(&self) -> &BTreeSet<String> {
        &self.outputs
    }

    pub fn is_output(&self, event: &str) -> bool {
        self.outputs.contains(event)
    }

    /// crc32c of the model's canonical form.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn root(&self) -> StateId {
        self.root
    }

    pub fn state(&self, id: StateId) -> &StateNode {
        &self.states[id.0]
    }

    pub fn state_by_name(&self, name: &str) -> Option<StateId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: StateId) -> &str {
        &self.states[id.0].name
    }

    /// All states in declaration order.
    pub fn states(&self) -> &[StateNode] {
        &self.states
    }

    /// All transitions in declaration order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.0]
    }

    pub fn children_of(&self, id: StateId) -> &[StateId] {
        &self.states[id.0].children
    }

    pub fn parent_of(&self, id: StateId) -> Option<StateId> {
        self.states[id.0].parent
    }

    pub fn depth(&self, id: StateId) -> usize {
        self.states[id.0].depth
    }

    /// Proper ancestors, root first.
    pub fn ancestors_of(&self, id: StateId) -> Vec<StateId> {
        let mut ancestors = Vec::with_capacity(self.depth(id));
        let mut current = self.parent_of(id);
        while let Some(p) = current {
            ancestors.push(p);
            current = self.parent_of(p);
        }
        ancestors.reverse();
        ancestors
    }

    /// Proper descendants in pre-order.
    pub fn descendants_of(&self, id: StateId) -> Vec<StateId> {
        let mut out = Vec::new();
        let mut stack: Vec<StateId> = self.children_of(id).iter().rev().copied().collect();
        while let Some(s) = stack.pop() {
            out.push(s);
            stack.extend(self.children_of(s).iter().rev().copied());
        }
        out
    }

    /// Returns true if `ancestor` is a proper ancestor of `id`.
    pub fn is_ancestor(&self, ancestor: StateId, id: StateId) -> bool {
        let mut current = self.parent_of(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent_of(p);
        }
        false
    }

    /// Deepest state that is a proper ancestor of both `a` and `b`.
    ///
    /// When `a` is `b`, or one contains the other, the result lies strictly
    /// above both; `None` only when one of them is the root.
    pub fn least_common_ancestor(&self, a: StateId, b: StateId) -> Option<StateId> {
        let left = self.ancestors_of(a);
        let right = self.ancestors_of(b);
        left.iter()
            .zip(right.iter())
            .take_while(|(x, y)| x == y)
            .last()
            .map(|(x, _)| *x)
    }

    /// Outgoing transitions of a state, in declaration order.
    pub fn transitions_from(&self, id: StateId) -> impl Iterator<Item = &Transition> + '_ {
        self.states[id.0]
            .transitions
            .iter()
            .map(move |t| &self.transitions[t.0])
    }

    /// States entered, in pre-order, when `id` is entered by default: the
    /// state itself, then the initial child of a compound or every child of a
    /// parallel state, recursively.
    pub fn default_entry_path(&self, id: StateId) -> Vec<StateId> {
        let mut path = Vec::new();
        let mut stack = vec![id];
        while let Some(s) = stack.pop() {
            path.push(s);
            let node = self.state(s);
            match node.kind {
                StateKind::Compound { initial } => stack.push(initial),
                StateKind::Parallel => stack.extend(node.children.iter().rev().copied()),
                _ => {}
            }
        }
        path
    }

    /// Sorted event names with at least one transition leaving `states`.
    pub fn events_for(&self, states: &[StateId]) -> Vec<String> {
        let events: BTreeSet<&str> = states
            .iter()
            .flat_map(|s| self.transitions_from(*s))
            .filter_map(|t| t.event.as_deref())
            .collect();
        events.into_iter().map(str::to_string).collect()
    }

    /// Human-readable label of a transition, used in logs and traces.
    pub fn transition_label(&self, id: TransitionId) -> String {
        let t = self.transition(id);
        let source = self.name_of(t.source);
        let event = t.event.as_deref().map(|e| format!("[{}]", e)).unwrap_or_default();
        match t.target {
            Some(target) => format!("{} -{}-> {}", source, event, self.name_of(target)),
            None => format!("{} -{}-> (internal)", source, event),
        }
    }
}

/// Set of active states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    active: BTreeSet<StateId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.active.contains(&id)
    }

    pub fn insert(&mut self, id: StateId) -> bool {
        self.active.insert(id)
    }

    pub fn remove(&mut self, id: StateId) -> bool {
        self.active.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active states in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.active.iter().copied()
    }

    /// Active states ordered by depth, then declaration order.
    pub fn ordered(&self, model: &Model) -> Vec<StateId> {
        let mut ids: Vec<StateId> = self.iter().collect();
        ids.sort_by_key(|id| (model.depth(*id), *id));
        ids
    }

    /// Names of [`Configuration::ordered`].
    pub fn names(&self, model: &Model) -> Vec<String> {
        self.ordered(model)
            .into_iter()
            .map(|id| model.name_of(id).to_string())
            .collect()
    }

    /// Active states without an active child, in declaration order.
    pub fn leaves(&self, model: &Model) -> Vec<StateId> {
        self.iter()
            .filter(|id| !model.children_of(*id).iter().any(|c| self.contains(*c)))
            .collect()
    }

    /// Checks the structural invariants of a configuration: ancestor closed,
    /// exactly one active child per active compound state, all children of an
    /// active parallel state active, no history state active.
    pub fn check_invariants(&self, model: &Model) -> Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }
        if !self.contains(model.root()) {
            return Err(format!("root '{}' is not active", model.name_of(model.root())));
        }
        for id in self.iter() {
            let node = model.state(id);
            if node.is_history() {
                return Err(format!("history state '{}' is active", node.name));
            }
            if let Some(parent) = node.parent {
                if !self.contains(parent) {
                    return Err(format!(
                        "'{}' is active but its parent '{}' is not",
                        node.name,
                        model.name_of(parent)
                    ));
                }
            }
            match node.kind {
                StateKind::Compound { .. } => {
                    let active = node.children.iter().filter(|c| self.contains(**c)).count();
                    if active != 1 {
                        return Err(format!(
                            "compound state '{}' has {} active children",
                            node.name, active
                        ));
                    }
                }
                StateKind::Parallel => {
                    if let Some(c) = node.children.iter().find(|c| !self.contains(**c)) {
                        return Err(format!(
                            "parallel state '{}' is active but '{}' is not",
                            node.name,
                            model.name_of(*c)
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl FromIterator<StateId> for Configuration {
    fn from_iter<I: IntoIterator<Item = StateId>>(iter: I) -> Self {
        Self {
            active: iter.into_iter().collect(),
        }
    }
}

/// Flat description of a state, consumed by [`ModelBuilder`].
#[derive(Debug, Clone)]
pub struct StateSpec {
    pub name: String,
    pub parent: Option<String>,
    pub kind: StateSpecKind,
    pub initial: Option<String>,
    pub memory: Option<String>,
    pub on_entry: Option<String>,
    pub on_exit: Option<String>,
    pub contract: ContractSpec,
}

/// Unparsed contract conditions of a [`StateSpec`] or [`TransitionSpec`].
#[derive(Debug, Clone, Default)]
pub struct ContractSpec {
    pub preconditions: Vec<String>,
    pub postconditions: Vec<String>,
    pub invariants: Vec<String>,
}

impl ContractSpec {
    pub fn add(&mut self, kind: ConditionKind, code: impl Into<String>) {
        let list = match kind {
            ConditionKind::Precondition => &mut self.preconditions,
            ConditionKind::Postcondition => &mut self.postconditions,
            ConditionKind::Invariant => &mut self.invariants,
        };
        list.push(code.into());
    }
}

/// Kind requested for a [`StateSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSpecKind {
    Basic,
    Compound,
    Parallel,
    Final,
    History { deep: bool },
}

impl StateSpec {
    fn new(name: impl Into<String>, kind: StateSpecKind) -> Self {
        Self {
            name: name.into(),
            parent: None,
            kind,
            initial: None,
            memory: None,
            on_entry: None,
            on_exit: None,
            contract: ContractSpec::default(),
        }
    }

    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, StateSpecKind::Basic)
    }

    pub fn compound(name: impl Into<String>) -> Self {
        Self::new(name, StateSpecKind::Compound)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, StateSpecKind::Parallel)
    }

    pub fn final_state(name: impl Into<String>) -> Self {
        Self::new(name, StateSpecKind::Final)
    }

    pub fn history(name: impl Into<String>, deep: bool) -> Self {
        Self::new(name, StateSpecKind::History { deep })
    }

    pub fn child_of(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn initial(mut self, initial: impl Into<String>) -> Self {
        self.initial = Some(initial.into());
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn on_entry(mut self, code: impl Into<String>) -> Self {
        self.on_entry = Some(code.into());
        self
    }

    pub fn on_exit(mut self, code: impl Into<String>) -> Self {
        self.on_exit = Some(code.into());
        self
    }

    /// Adds a condition checked when the state is entered.
    pub fn precondition(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Precondition, code);
        self
    }

    /// Adds a condition checked when the state has been exited.
    pub fn postcondition(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Postcondition, code);
        self
    }

    /// Adds a condition checked after every step while the state is active.
    pub fn invariant(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Invariant, code);
        self
    }
}

/// Flat description of a transition, consumed by [`ModelBuilder`].
#[derive(Debug, Clone)]
pub struct TransitionSpec {
    pub source: String,
    pub target: Option<String>,
    pub event: Option<String>,
    pub guard: Option<String>,
    pub action: Option<String>,
    pub contract: ContractSpec,
}

impl TransitionSpec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            event: None,
            guard: None,
            action: None,
            contract: ContractSpec::default(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn precondition(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Precondition, code);
        self
    }

    pub fn postcondition(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Postcondition, code);
        self
    }

    pub fn invariant(mut self, code: impl Into<String>) -> Self {
        self.contract.add(ConditionKind::Invariant, code);
        self
    }
}

/// Collects states and transitions, then validates them into a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    name: String,
    description: Option<String>,
    preamble: Option<String>,
    outputs: Vec<String>,
    states: Vec<StateSpec>,
    transitions: Vec<TransitionSpec>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = Some(description.into());
        self
    }

    pub fn preamble(&mut self, code: impl Into<String>) -> &mut Self {
        self.preamble = Some(code.into());
        self
    }

    pub fn output(&mut self, event: impl Into<String>) -> &mut Self {
        self.outputs.push(event.into());
        self
    }

    pub fn state(&mut self, spec: StateSpec) -> &mut Self {
        self.states.push(spec);
        self
    }

    pub fn transition(&mut self, spec: TransitionSpec) -> &mut Self {
        self.transitions.push(spec);
        self
    }

    /// Validates the collected parts and builds the model.
    pub fn build(&self) -> Result<Model, ModelError> {
        let mut by_name = HashMap::with_capacity(self.states.len());
        for (i, spec) in self.states.iter().enumerate() {
            if by_name.insert(spec.name.clone(), StateId(i)).is_some() {
                return Err(ModelError::DuplicateState {
                    name: spec.name.clone(),
                });
            }
        }
        let lookup = |name: &str| by_name.get(name).copied();

        // Parent links.
        let mut parents = Vec::with_capacity(self.states.len());
        for spec in &self.states {
            let parent = match &spec.parent {
                Some(p) => Some(lookup(p).ok_or_else(|| ModelError::UnknownParent {
                    state: spec.name.clone(),
                    parent: p.clone(),
                })?),
                None => None,
            };
            parents.push(parent);
        }

        // Depths; a walk longer than the number of states means a cycle.
        let mut depths = Vec::with_capacity(self.states.len());
        for (i, spec) in self.states.iter().enumerate() {
            let mut depth = 0;
            let mut current = parents[i];
            while let Some(p) = current {
                depth += 1;
                if depth > self.states.len() {
                    return Err(ModelError::CyclicParent {
                        state: spec.name.clone(),
                    });
                }
                current = parents[p.0];
            }
            depths.push(depth);
        }

        let mut roots = (0..self.states.len()).filter(|i| parents[*i].is_none());
        let root = roots.next().map(StateId).ok_or(ModelError::MissingRoot)?;
        if let Some(second) = roots.next() {
            return Err(ModelError::MultipleRoots {
                first: self.states[root.0].name.clone(),
                second: self.states[second].name.clone(),
            });
        }

        let mut children: Vec<Vec<StateId>> = vec![Vec::new(); self.states.len()];
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = parent {
                if !matches!(
                    self.states[p.0].kind,
                    StateSpecKind::Compound | StateSpecKind::Parallel
                ) {
                    return Err(ModelError::UnexpectedChildren {
                        state: self.states[p.0].name.clone(),
                    });
                }
                children[p.0].push(StateId(i));
            }
        }

        let mut states = Vec::with_capacity(self.states.len());
        for (i, spec) in self.states.iter().enumerate() {
            let kind = self.resolve_kind(i, spec, &parents, &children, &lookup)?;
            states.push(StateNode {
                id: StateId(i),
                name: spec.name.clone(),
                kind,
                parent: parents[i],
                children: std::mem::take(&mut children[i]),
                on_entry: spec.on_entry.as_deref().map(Action::parse).transpose()?,
                on_exit: spec.on_exit.as_deref().map(Action::parse).transpose()?,
                contract: Contract::parse(&spec.contract)?,
                transitions: Vec::new(),
                depth: depths[i],
            });
        }

        let mut transitions = Vec::with_capacity(self.transitions.len());
        for (i, spec) in self.transitions.iter().enumerate() {
            let source = lookup(&spec.source).ok_or_else(|| ModelError::UnknownSource {
                source_state: spec.source.clone(),
            })?;
            let target = match &spec.target {
                Some(t) => Some(lookup(t).ok_or_else(|| ModelError::UnknownTarget {
                    source_state: spec.source.clone(),
                    target: t.clone(),
                })?),
                None => None,
            };
            if states[source.0].is_final() || states[source.0].is_history() {
                return Err(ModelError::UnexpectedTransition {
                    state: spec.source.clone(),
                });
            }
            if target.is_none() && spec.event.is_none() && spec.guard.is_none() {
                return Err(ModelError::EmptyInternalTransition {
                    source_state: spec.source.clone(),
                });
            }
            let id = TransitionId(i);
            states[source.0].transitions.push(id);
            transitions.push(Transition {
                id,
                source,
                target,
                event: spec.event.clone(),
                guard: spec.guard.as_deref().map(Guard::parse).transpose()?,
                action: spec.action.as_deref().map(Action::parse).transpose()?,
                contract: Contract::parse(&spec.contract)?,
            });
        }

        let preamble = self.preamble.as_deref().map(Action::parse).transpose()?;

        let mut model = Model {
            name: self.name.clone(),
            description: self.description.clone(),
            preamble,
            outputs: self.outputs.iter().cloned().collect(),
            states,
            transitions,
            by_name,
            root,
            checksum: String::new(),
        };
        model.checksum = checksum(&model);
        Ok(model)
    }

    fn resolve_kind(
        &self,
        i: usize,
        spec: &StateSpec,
        parents: &[Option<StateId>],
        children: &[Vec<StateId>],
        lookup: &impl Fn(&str) -> Option<StateId>,
    ) -> Result<StateKind, ModelError> {
        let is_history = |id: StateId| matches!(self.states[id.0].kind, StateSpecKind::History { .. });

        match spec.kind {
            StateSpecKind::Basic => Ok(StateKind::Basic),
            StateSpecKind::Final => Ok(StateKind::Final),
            StateSpecKind::Parallel => {
                if children[i].is_empty() {
                    return Err(ModelError::EmptyComposite {
                        state: spec.name.clone(),
                    });
                }
                Ok(StateKind::Parallel)
            }
            StateSpecKind::Compound => {
                if children[i].is_empty() {
                    return Err(ModelError::EmptyComposite {
                        state: spec.name.clone(),
                    });
                }
                let name = spec.initial.as_ref().ok_or_else(|| ModelError::MissingInitial {
                    state: spec.name.clone(),
                })?;
                let initial = lookup(name)
                    .filter(|id| children[i].contains(id) && !is_history(*id))
                    .ok_or_else(|| ModelError::InvalidInitial {
                        state: spec.name.clone(),
                        initial: name.clone(),
                    })?;
                Ok(StateKind::Compound { initial })
            }
            StateSpecKind::History { deep } => {
                let parent = parents[i]
                    .filter(|p| self.states[p.0].kind == StateSpecKind::Compound)
                    .ok_or_else(|| ModelError::InvalidHistory {
                        state: spec.name.clone(),
                    })?;
                let memory = match &spec.memory {
                    Some(name) => Some(
                        lookup(name)
                            .filter(|id| parents[id.0] == Some(parent) && !is_history(*id))
                            .ok_or_else(|| ModelError::InvalidMemory {
                                state: spec.name.clone(),
                                memory: name.clone(),
                            })?,
                    ),
                    None => None,
                };
                Ok(StateKind::History { deep, memory })
            }
        }
    }
}

fn checksum(model: &Model) -> String {
    let mut canonical = String::new();
    canonical.push_str(&model.name);
    canonical.push('\n');
    if let Some(preamble) = &model.preamble {
        canonical.push_str(&format!("preamble {}\n", preamble.source()));
    }
    for output in &model.outputs {
        canonical.push_str(&format!("output {}\n", output));
    }
    for s in &model.states {
        canonical.push_str(&format!(
            "state {} {} {:?} {:?} {:?} {:?} {:?}\n",
            s.name,
            s.kind_name(),
            s.parent.map(|p| model.name_of(p)),
            s.initial().map(|p| model.name_of(p)),
            match s.kind {
                StateKind::History { memory, .. } => memory.map(|m| model.name_of(m)),
                _ => None,
            },
            s.on_entry.as_ref().map(Action::source),
            s.on_exit.as_ref().map(Action::source),
        ));
        s.contract.describe(&mut canonical);
    }
    for t in &model.transitions {
        canonical.push_str(&format!(
            "transition {} {:?} {:?} {:?} {:?}\n",
            model.name_of(t.source),
            t.target.map(|id| model.name_of(id)),
            t.event,
            t.guard.as_ref().map(Guard::source),
            t.action.as_ref().map(Action::source),
        ));
        t.contract.describe(&mut canonical);
    }
    format!("{:08x}", crc32c::crc32c(canonical.as_bytes()))
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} states, {} transitions)",
            self.name,
            self.states.len(),
            self.transitions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopwatch() -> ModelBuilder {
        let mut b = ModelBuilder::new("stopwatch");
        b.preamble("elapsed_time = 0")
            .output("refresh")
            .state(StateSpec::parallel("active"))
            .state(StateSpec::compound("timer").child_of("active").initial("stopped"))
            .state(StateSpec::basic("stopped").child_of("timer"))
            .state(StateSpec::basic("running").child_of("timer"))
            .state(StateSpec::compound("display").child_of("active").initial("actual time"))
            .state(StateSpec::basic("actual time").child_of("display"))
            .state(StateSpec::basic("lap time").child_of("display"))
            .transition(TransitionSpec::new("timer").event("reset").action("elapsed_time = 0"))
            .transition(TransitionSpec::new("stopped").event("start").target("running"))
            .transition(TransitionSpec::new("running").event("stop").target("stopped"))
            .transition(
                TransitionSpec::new("running")
                    .guard("after(1)")
                    .target("running")
                    .action("elapsed_time += 1"),
            )
            .transition(TransitionSpec::new("actual time").event("split").target("lap time"))
            .transition(TransitionSpec::new("lap time").event("split").target("actual time"));
        b
    }

    fn id(model: &Model, name: &str) -> StateId {
        model.state_by_name(name).unwrap()
    }

    #[test]
    fn test_build_stopwatch() {
        let model = stopwatch().build().unwrap();
        assert_eq!(model.states().len(), 7);
        assert_eq!(model.transitions().len(), 6);
        assert_eq!(model.name_of(model.root()), "active");
        assert!(model.is_output("refresh"));
        assert_eq!(model.checksum().len(), 8);

        let running = id(&model, "running");
        assert_eq!(model.depth(running), 2);
        assert_eq!(
            model.ancestors_of(running),
            vec![id(&model, "active"), id(&model, "timer")]
        );
        assert_eq!(model.transitions_from(running).count(), 2);
    }

    #[test]
    fn test_default_entry_path() {
        let model = stopwatch().build().unwrap();
        let names: Vec<&str> = model
            .default_entry_path(model.root())
            .into_iter()
            .map(|s| model.name_of(s))
            .collect();
        assert_eq!(names, vec!["active", "timer", "stopped", "display", "actual time"]);
    }

    #[test]
    fn test_least_common_ancestor() {
        let model = stopwatch().build().unwrap();
        let running = id(&model, "running");
        let stopped = id(&model, "stopped");
        let timer = id(&model, "timer");
        assert_eq!(model.least_common_ancestor(running, stopped), Some(timer));
        // a self transition leaves its source
        assert_eq!(model.least_common_ancestor(running, running), Some(timer));
        assert_eq!(
            model.least_common_ancestor(timer, running),
            Some(id(&model, "active"))
        );
        assert_eq!(model.least_common_ancestor(model.root(), running), None);
    }

    #[test]
    fn test_descendants_and_events() {
        let model = stopwatch().build().unwrap();
        let names: Vec<&str> = model
            .descendants_of(id(&model, "timer"))
            .into_iter()
            .map(|s| model.name_of(s))
            .collect();
        assert_eq!(names, vec!["stopped", "running"]);

        let events = model.events_for(&[id(&model, "timer"), id(&model, "running")]);
        assert_eq!(events, vec!["reset", "stop"]);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = stopwatch().build().unwrap();
        let b = stopwatch().build().unwrap();
        assert_eq!(a.checksum(), b.checksum());

        let mut changed = stopwatch();
        changed.transition(TransitionSpec::new("lap time").event("stop").target("actual time"));
        assert_ne!(a.checksum(), changed.build().unwrap().checksum());
    }

    #[test]
    fn test_configuration_invariants() {
        let model = stopwatch().build().unwrap();
        let ok: Configuration = model.default_entry_path(model.root()).into_iter().collect();
        assert!(ok.check_invariants(&model).is_ok());
        assert_eq!(
            ok.names(&model),
            vec!["active", "timer", "display", "stopped", "actual time"]
        );
        assert_eq!(ok.leaves(&model).len(), 2);

        let mut missing_region = ok.clone();
        missing_region.remove(id(&model, "actual time"));
        missing_region.remove(id(&model, "display"));
        assert!(missing_region.check_invariants(&model).is_err());

        let mut two_children = ok.clone();
        two_children.insert(id(&model, "running"));
        assert!(two_children.check_invariants(&model).is_err());

        let mut orphan = ok;
        orphan.remove(id(&model, "timer"));
        assert!(orphan.check_invariants(&model).is_err());
    }

    #[test]
    fn test_duplicate_state() {
        let mut b = stopwatch();
        b.state(StateSpec::basic("running").child_of("display"));
        assert_eq!(
            b.build().unwrap_err(),
            ModelError::DuplicateState {
                name: "running".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_target() {
        let mut b = stopwatch();
        b.transition(TransitionSpec::new("running").event("x").target("nowhere"));
        assert!(matches!(b.build(), Err(ModelError::UnknownTarget { .. })));
    }

    #[test]
    fn test_unknown_source_and_parent() {
        let mut b = stopwatch();
        b.transition(TransitionSpec::new("ghost").event("x"));
        assert!(matches!(b.build(), Err(ModelError::UnknownSource { .. })));

        let mut b = stopwatch();
        b.state(StateSpec::basic("orphan").child_of("ghost"));
        assert!(matches!(b.build(), Err(ModelError::UnknownParent { .. })));
    }

    #[test]
    fn test_missing_and_invalid_initial() {
        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root"))
            .state(StateSpec::basic("a").child_of("root"));
        assert!(matches!(b.build(), Err(ModelError::MissingInitial { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b"));
        assert!(matches!(b.build(), Err(ModelError::MultipleRoots { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("x"))
            .state(StateSpec::compound("x").child_of("root").initial("y"))
            .state(StateSpec::basic("y").child_of("x"))
            .state(StateSpec::basic("z").child_of("root"));
        let model = b.build().unwrap();
        assert_eq!(model.states().len(), 4);

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("y"))
            .state(StateSpec::compound("x").child_of("root").initial("y"))
            .state(StateSpec::basic("y").child_of("x"));
        assert!(matches!(b.build(), Err(ModelError::InvalidInitial { .. })));
    }

    #[test]
    fn test_cyclic_parents() {
        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::compound("a").child_of("root").initial("b"))
            .state(StateSpec::compound("b").child_of("c").initial("c"))
            .state(StateSpec::compound("c").child_of("b").initial("b"));
        assert!(matches!(b.build(), Err(ModelError::CyclicParent { .. })));
    }

    #[test]
    fn test_missing_root() {
        assert_eq!(ModelBuilder::new("m").build().unwrap_err(), ModelError::MissingRoot);
    }

    #[test]
    fn test_structural_rules() {
        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::parallel("root"));
        assert!(matches!(b.build(), Err(ModelError::EmptyComposite { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::basic("b").child_of("a"));
        assert!(matches!(b.build(), Err(ModelError::UnexpectedChildren { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::final_state("done").child_of("root"))
            .transition(TransitionSpec::new("done").event("x").target("a"));
        assert!(matches!(b.build(), Err(ModelError::UnexpectedTransition { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .transition(TransitionSpec::new("a").action("x = 1"));
        assert!(matches!(
            b.build(),
            Err(ModelError::EmptyInternalTransition { .. })
        ));
    }

    #[test]
    fn test_history_rules() {
        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::parallel("root"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::history("h", false).child_of("root"));
        assert!(matches!(b.build(), Err(ModelError::InvalidHistory { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::history("h", true).child_of("root").memory("nope"));
        assert!(matches!(b.build(), Err(ModelError::InvalidMemory { .. })));

        let mut b = ModelBuilder::new("m");
        b.state(StateSpec::compound("root").initial("a"))
            .state(StateSpec::basic("a").child_of("root"))
            .state(StateSpec::history("h", true).child_of("root").memory("a"));
        let model = b.build().unwrap();
        let h = model.state(model.state_by_name("h").unwrap());
        assert_eq!(h.kind_name(), "deep history");
    }

    #[test]
    fn test_invalid_expression() {
        let mut b = stopwatch();
        b.transition(TransitionSpec::new("running").event("x").guard("a >"));
        assert!(matches!(b.build(), Err(ModelError::InvalidExpression { .. })));
    }

    #[test]
    fn test_contracts_are_parsed() {
        let mut b = stopwatch();
        b.state(
            StateSpec::basic("paused")
                .child_of("timer")
                .precondition("elapsed_time >= 0")
                .invariant("elapsed_time < 3600"),
        )
        .transition(
            TransitionSpec::new("paused")
                .event("resume")
                .target("running")
                .postcondition("active('running')"),
        );
        let model = b.build().unwrap();

        let paused = model.state(model.state_by_name("paused").unwrap());
        assert_eq!(paused.contract.preconditions.len(), 1);
        assert_eq!(
            paused.contract.conditions(ConditionKind::Invariant)[0].source(),
            "elapsed_time < 3600"
        );
        assert!(paused.contract.postconditions.is_empty());
        let t = model.transitions().last().unwrap();
        assert_eq!(t.contract.postconditions[0].source(), "active('running')");
        assert!(model.state(model.root()).contract.is_empty());

        // contracts are part of the model's identity
        let mut plain = stopwatch();
        plain
            .state(StateSpec::basic("paused").child_of("timer"))
            .transition(TransitionSpec::new("paused").event("resume").target("running"));
        assert_ne!(plain.build().unwrap().checksum(), model.checksum());
    }

    #[test]
    fn test_invalid_contract() {
        let mut b = stopwatch();
        b.state(StateSpec::basic("paused").child_of("timer").invariant("x <"));
        assert!(matches!(b.build(), Err(ModelError::InvalidExpression { .. })));

        let mut b = stopwatch();
        b.transition(TransitionSpec::new("running").event("x").precondition("nope(1)"));
        assert!(matches!(b.build(), Err(ModelError::InvalidExpression { .. })));
    }

    #[test]
    fn test_transition_label() {
        let model = stopwatch().build().unwrap();
        assert_eq!(model.transition_label(TransitionId(0)), "timer -[reset]-> (internal)");
        assert_eq!(model.transition_label(TransitionId(1)), "stopped -[start]-> running");
        assert_eq!(model.transition_label(TransitionId(3)), "running --> running");
    }
}
