//! Pending events.

use crate::event::Event;
use std::collections::VecDeque;

/// Two FIFO lanes: internal events (raised by `send` during a step) are
/// always consumed before external ones.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    internal: VecDeque<Event>,
    external: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_external(&mut self, event: Event) {
        self.external.push_back(event);
    }

    pub fn push_internal(&mut self, event: Event) {
        self.internal.push_back(event);
    }

    /// Next event, internal first.
    pub fn pop(&mut self) -> Option<Event> {
        self.internal
            .pop_front()
            .or_else(|| self.external.pop_front())
    }

    pub fn pop_internal(&mut self) -> Option<Event> {
        self.internal.pop_front()
    }

    pub fn pop_external(&mut self) -> Option<Event> {
        self.external.pop_front()
    }

    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    pub fn has_external(&self) -> bool {
        !self.external.is_empty()
    }

    pub fn len(&self) -> usize {
        self.internal.len() + self.external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }

    /// Pending events in consumption order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.internal.iter().chain(self.external.iter())
    }

    pub fn internal(&self) -> impl Iterator<Item = &Event> {
        self.internal.iter()
    }

    pub fn external(&self) -> impl Iterator<Item = &Event> {
        self.external.iter()
    }
}
