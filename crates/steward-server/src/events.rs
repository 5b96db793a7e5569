//! In-process event handlers in front of the publish socket.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use serde_json::Value;
use steward_protocol::{PublishStream, TransportError};
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{DispatchError, RegistryError};

/// Priority of handlers that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Handler body: `(ctx, payload, captures) -> veto`.
///
/// `captures` holds the pattern's capture groups, with an empty string for a
/// group that did not take part in the match. Returning `Ok(true)` stops the
/// event.
pub type HandlerFn =
    Arc<dyn Fn(&Context, &mut Value, &[String]) -> Result<bool, DispatchError> + Send + Sync>;

/// Where events go after the handlers have seen them.
pub trait FanOut: Send + Sync {
    /// Sends `payload` under `topic`; returns the number of receivers.
    fn send(&self, topic: &str, payload: &Value) -> Result<usize, TransportError>;
}

impl FanOut for PublishStream {
    fn send(&self, topic: &str, payload: &Value) -> Result<usize, TransportError> {
        PublishStream::send(self, topic, payload)
    }
}

/// A callback bound to an event-name pattern.
pub struct EventHandler {
    name: String,
    pattern: String,
    regex: Regex,
    priority: i32,
    callback: HandlerFn,
}

impl EventHandler {
    /// `pattern` is a regex anchored at the start of the event name.
    pub fn new<F>(name: impl Into<String>, pattern: &str, callback: F) -> Result<Self, RegistryError>
    where
        F: Fn(&Context, &mut Value, &[String]) -> Result<bool, DispatchError> + Send + Sync + 'static,
    {
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| RegistryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.into(),
            pattern: pattern.to_string(),
            regex,
            priority: DEFAULT_PRIORITY,
            callback: Arc::new(callback),
        })
    }

    /// Lower runs first.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    fn captures(&self, event: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(event)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Result of one [`EventBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A handler returned `true`; the event went no further.
    Vetoed { by: String },
    /// Handed to the fan-out socket.
    Sent { receivers: usize },
    /// The fan-out socket refused the event.
    Failed,
}

/// Priority-ordered handler chain plus the fan-out socket.
pub struct EventBus {
    handlers: Mutex<Vec<Arc<EventHandler>>>,
    fanout: Arc<dyn FanOut>,
}

impl EventBus {
    pub fn new(fanout: Arc<dyn FanOut>) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            fanout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<EventHandler>>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a handler after every handler of lower or equal priority.
    pub fn add(&self, handler: EventHandler) {
        let mut handlers = self.lock();
        let position = handlers.partition_point(|h| h.priority <= handler.priority);
        debug!(
            handler = %handler.name,
            pattern = %handler.pattern,
            priority = handler.priority,
            "Registering event handler"
        );
        handlers.insert(position, Arc::new(handler));
    }

    /// Handlers in the order they run.
    pub fn handlers(&self) -> Vec<Arc<EventHandler>> {
        self.lock().clone()
    }

    pub fn publish(&self, ctx: &Context, name: &str, mut payload: Value) -> Delivery {
        debug!(event = name, "Publishing event");
        // handlers may publish or register in turn, so run them unlocked
        for handler in self.handlers() {
            let Some(captures) = handler.captures(name) else {
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (handler.callback)(ctx, &mut payload, &captures)
            }))
            .unwrap_or_else(|panic| Err(DispatchError::from_panic(panic)));
            match outcome {
                Ok(true) => {
                    debug!(event = name, handler = %handler.name, "Event blocked by handler");
                    return Delivery::Vetoed {
                        by: handler.name.clone(),
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    error!(event = name, handler = %handler.name, error = ?e, "Event handler failed");
                }
            }
        }

        match self.fanout.send(name, &payload) {
            Ok(receivers) => Delivery::Sent { receivers },
            Err(e) => {
                warn!(event = name, error = %e, "Failed to forward event");
                Delivery::Failed
            }
        }
    }
}
