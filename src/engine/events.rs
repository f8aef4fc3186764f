//! Forwarding local event streams over a connection.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use super::{ConnectionState, Engine};

/// A named event with positional arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub name: String,
    pub args: Vec<Value>,
}

impl ResourceEvent {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// How forwarded events are addressed.
#[derive(Clone, Debug)]
pub enum EventRoute {
    /// Every event is sent on one subject as `[name, ...args]`.
    Subject(String),
    /// Each event is sent on `prefix + name` with `args` as data.
    Prefix(String),
}

impl EventRoute {
    fn address(&self, event: ResourceEvent) -> (String, Value) {
        match self {
            EventRoute::Subject(subject) => {
                let mut data = Vec::with_capacity(event.args.len() + 1);
                data.push(Value::String(event.name));
                data.extend(event.args);
                (subject.clone(), Value::Array(data))
            }
            EventRoute::Prefix(prefix) => (format!("{prefix}{}", event.name), Value::Array(event.args)),
        }
    }
}

pub type EventFilter = Arc<dyn Fn(&ResourceEvent) -> bool + Send + Sync>;

impl Engine {
    /// Send every event from `events` to the peer while connected.
    ///
    /// Forwarding stops when the connection closes or the source ends.
    pub fn extend_events(
        &self,
        mut events: broadcast::Receiver<ResourceEvent>,
        route: EventRoute,
        filter: Option<EventFilter>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        let mut state = self.subscribe_state();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = wait_disconnected(&mut state) => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event forwarder lagged: engine={}, skipped={skipped}", engine.name());
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if filter.as_ref().is_some_and(|f| !f(&event)) || !engine.is_connected() {
                    continue;
                }
                let (subject, data) = route.address(event);
                if let Err(e) = engine.send(&subject, data).await {
                    debug!("failed to forward event: subject={subject}, error={e}");
                }
            }
        })
    }
}

async fn wait_disconnected(state: &mut tokio::sync::watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subject_route_prepends_event_name() {
        let route = EventRoute::Subject("child".into());
        let (subject, data) = route.address(ResourceEvent::new("exit", vec![json!(0)]));
        assert_eq!(subject, "child");
        assert_eq!(data, json!(["exit", 0]));
    }

    #[test]
    fn prefix_route_appends_event_name() {
        let route = EventRoute::Prefix("proc.".into());
        let (subject, data) = route.address(ResourceEvent::new("exit", vec![json!(1)]));
        assert_eq!(subject, "proc.exit");
        assert_eq!(data, json!([1]));
    }
}
