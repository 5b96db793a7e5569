//! Handle given to every capability, event handler and task body.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use steward_protocol::{ClientId, Kwargs, Response};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{CapabilityResult, DispatchError};
use crate::events::{Delivery, EventBus};
use crate::locks::{KeyGuard, KeyedLocks};
use crate::pool::WorkerPool;
use crate::registry::{Authorizer, Call, Registry};
use crate::tasks::TaskList;

/// State owned by one running server.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) events: EventBus,
    pub(crate) tasks: TaskList,
    pub(crate) pool: WorkerPool,
    pub(crate) locks: KeyedLocks,
    pub(crate) started: DateTime<Utc>,
}

/// Who triggered the current call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    /// Set for commands that arrived over the request socket.
    pub client: Option<ClientId>,
    /// Client context sent with the request.
    pub meta: Kwargs,
}

impl Identity {
    /// Identity of calls the server makes on its own behalf.
    pub fn server() -> Self {
        Self::default()
    }

    pub fn remote(client: ClientId, meta: Kwargs) -> Self {
        Self {
            client: Some(client),
            meta,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.client.is_some()
    }
}

/// A response on its way back to the dispatch loop.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) client: ClientId,
    pub(crate) ticket: Option<u64>,
    pub(crate) response: Response,
}

/// Where responses for one request go.
#[derive(Debug, Clone)]
pub(crate) struct ReplyTo {
    pub(crate) client: ClientId,
    pub(crate) nonce: u64,
    pub(crate) ticket: Option<u64>,
    pub(crate) results: mpsc::UnboundedSender<Outcome>,
}

impl ReplyTo {
    pub(crate) fn send(&self, response: Response) -> bool {
        self.results
            .send(Outcome {
                client: self.client,
                ticket: self.ticket,
                response,
            })
            .is_ok()
    }
}

/// Server access for capability code.
///
/// Cheap to clone; every clone refers to the same server.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
    identity: Arc<Identity>,
    reply: Option<ReplyTo>,
}

impl Context {
    pub(crate) fn server(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            identity: Arc::new(Identity::server()),
            reply: None,
        }
    }

    pub(crate) fn for_request(shared: Arc<Shared>, identity: Identity, reply: ReplyTo) -> Self {
        Self {
            shared,
            identity: Arc::new(identity),
            reply: Some(reply),
        }
    }

    /// Same server and caller, but partials go nowhere.
    pub(crate) fn detached(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            identity: self.identity.clone(),
            reply: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Client context of the caller (empty for server-side calls).
    pub fn meta(&self) -> &Kwargs {
        &self.identity.meta
    }

    /// Runs event handlers for `name`, then forwards the event to subscribers
    /// unless a handler vetoed it.
    pub fn publish(&self, name: &str, payload: Value) -> Delivery {
        self.shared.events.publish(self, name, payload)
    }

    /// Sends a progress notification to the caller before the final result.
    ///
    /// Returns `false` when there is no remote caller to notify.
    pub fn partial(&self, tag: &str, desc: &str) -> bool {
        match &self.reply {
            Some(reply) => {
                trace!(nonce = reply.nonce, tag, "Sending partial response");
                reply.send(Response::partial(reply.nonce, tag, desc))
            }
            None => false,
        }
    }

    /// Calls another capability directly, `Private` ones included.
    ///
    /// Skips authorization; the caller's identity carries over.
    pub async fn invoke(&self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> CapabilityResult {
        let capability = self
            .shared
            .registry
            .lookup(name)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
        debug!(command = name, "Invoking capability");
        capability.call(self.clone(), Call::new(args, kwargs)).await
    }

    /// Holds the named lock until the guard drops.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.shared.locks.lock(key).await
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.shared.locks
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn tasks(&self) -> &TaskList {
        &self.shared.tasks
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// When the server was bound.
    pub fn started(&self) -> DateTime<Utc> {
        self.shared.started
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use steward_protocol::TransportError;

    use crate::events::FanOut;
    use crate::registry::{AllowAll, RegistryBuilder};

    /// Fan-out that remembers every event it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingFanOut {
        pub(crate) sent: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingFanOut {
        pub(crate) fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl FanOut for RecordingFanOut {
        fn send(&self, topic: &str, payload: &Value) -> Result<usize, TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.clone()));
            Ok(1)
        }
    }

    /// A server context with no sockets behind it.
    pub(crate) fn context(registry: RegistryBuilder, fanout: Arc<RecordingFanOut>) -> Context {
        Context::server(Arc::new(Shared {
            registry: registry.build(),
            authorizer: Arc::new(AllowAll),
            events: EventBus::new(fanout),
            tasks: TaskList::new(Duration::from_secs(5)),
            pool: WorkerPool::new(4),
            locks: KeyedLocks::default(),
            started: Utc::now(),
        }))
    }

    /// A context that forwards partials to `results` as if for `nonce`.
    pub(crate) fn request_context(
        ctx: &Context,
        client: ClientId,
        nonce: u64,
        results: mpsc::UnboundedSender<Outcome>,
    ) -> Context {
        Context::for_request(
            ctx.shared.clone(),
            Identity::remote(client, Kwargs::new()),
            ReplyTo {
                client,
                nonce,
                ticket: None,
                results,
            },
        )
    }
}
