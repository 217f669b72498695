//! Delivery of output events to listeners.

use crate::event::Event;

/// Filter applied to a subscription.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only these event names (empty = all).
    pub names: Vec<String>,
}

impl EventFilter {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.names.is_empty() || self.names.contains(&event.name)
    }
}

type Listener = Box<dyn FnMut(&Event) + Send>;

struct Subscription {
    id: String,
    filter: EventFilter,
    listener: Listener,
}

/// Hands events raised with `send` for an output name to subscribers.
///
/// Delivery is synchronous and in subscription order. Events emitted with no
/// subscriber are dropped.
#[derive(Default)]
pub struct Emitter {
    subscriptions: Vec<Subscription>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every emitted event. Returns the subscription id.
    pub fn subscribe<F>(&mut self, listener: F) -> String
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.subscribe_filtered(EventFilter::default(), listener)
    }

    /// Subscribes to events accepted by `filter`.
    pub fn subscribe_filtered<F>(&mut self, filter: EventFilter, listener: F) -> String
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let id = format!("sub-{}", uuid::Uuid::new_v4());
        self.subscriptions.push(Subscription {
            id: id.clone(),
            filter,
            listener: Box::new(listener),
        });
        id
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != subscription_id);
        self.subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn emit(&mut self, event: &Event) {
        tracing::debug!(event = %event, listeners = self.subscriptions.len(), "emit");
        for sub in self.subscriptions.iter_mut() {
            if sub.filter.matches(event) {
                (sub.listener)(event);
            }
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field(
                "subscriptions",
                &self.subscriptions.iter().map(|s| &s.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&Event) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &Event| sink.lock().unwrap().push(e.to_string()))
    }

    #[test]
    fn test_subscribe_and_emit() {
        let mut emitter = Emitter::new();
        let (seen, listener) = recorder();
        let id = emitter.subscribe(listener);
        assert!(id.starts_with("sub-"));

        emitter.emit(&Event::new("refresh").with("time", 1));
        emitter.emit(&Event::new("beep"));
        assert_eq!(*seen.lock().unwrap(), vec!["refresh(time=1)", "beep"]);
    }

    #[test]
    fn test_filtered_subscription() {
        let mut emitter = Emitter::new();
        let (seen, listener) = recorder();
        emitter.subscribe_filtered(EventFilter::names(["beep"]), listener);

        emitter.emit(&Event::new("refresh"));
        emitter.emit(&Event::new("beep"));
        assert_eq!(*seen.lock().unwrap(), vec!["beep"]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut emitter = Emitter::new();
        let (seen, listener) = recorder();
        let id = emitter.subscribe(listener);
        assert_eq!(emitter.subscription_count(), 1);

        assert!(emitter.unsubscribe(&id));
        assert!(!emitter.unsubscribe(&id));
        assert_eq!(emitter.subscription_count(), 0);

        emitter.emit(&Event::new("refresh"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_event_filter_matches() {
        let event = Event::new("refresh");
        assert!(EventFilter::default().matches(&event));
        assert!(EventFilter::names(["refresh", "beep"]).matches(&event));
        assert!(!EventFilter::names(["beep"]).matches(&event));
    }
}
