//! The request loop.
//!
//! One task owns the router socket. It pulls requests, resolves and
//! authorizes them, hands the work to the worker pool and writes back the
//! responses that workers queue on the results channel. Capability code never
//! touches the socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use steward_protocol::{ClientId, Request, Response, RouterStream, SocketRole, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::{Context, Identity, Outcome, ReplyTo, Shared};
use crate::error::DispatchError;
use crate::pool::{JobKind, guarded};
use crate::registry::{Call, Capability};
use crate::signals::ShutdownSignal;

/// How often a draining server reports what it is waiting for.
const DRAIN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

enum Step {
    Shutdown,
    Inbound(Result<(ClientId, Value), TransportError>),
    Outcome(Outcome),
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    router: RouterStream,
    results_tx: mpsc::UnboundedSender<Outcome>,
    results_rx: mpsc::UnboundedReceiver<Outcome>,
    // REQ peers: the ticket of the request whose response they still expect
    owners: HashMap<ClientId, u64>,
    next_ticket: u64,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, router: RouterStream) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            router,
            results_tx,
            results_rx,
            owners: HashMap::new(),
            next_ticket: 0,
        }
    }

    /// Serves requests until `shutdown` fires.
    pub(crate) async fn run(&mut self, poll: Duration, shutdown: ShutdownSignal) {
        let shutdown = shutdown.wait();
        tokio::pin!(shutdown);

        loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Shutdown,
                Some(outcome) = self.results_rx.recv() => Step::Outcome(outcome),
                received = self.router.receive_timeout(poll) => Step::Inbound(received),
            };
            match step {
                Step::Shutdown => break,
                Step::Outcome(outcome) => self.deliver(outcome),
                Step::Inbound(Ok((client, value))) => self.accept(client, value),
                Step::Inbound(Err(e)) if e.is_retryable() => {}
                Step::Inbound(Err(e)) => {
                    error!(error = %e, "Request socket failed, stopping dispatch");
                    break;
                }
            }
            while let Ok(outcome) = self.results_rx.try_recv() {
                self.deliver(outcome);
            }
        }
    }

    fn accept(&mut self, client: ClientId, value: Value) {
        let nonce = value.get("nonce").filter(|n| !n.is_null()).cloned();
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!(client = %client, error = %e, "Malformed request");
                if let Some(nonce) = nonce {
                    self.reject(client, nonce, format!("malformed request: {e}"));
                }
                return;
            }
        };

        let reply = self.reply_to(client, request.nonce);
        let command = request.cmd;
        let identity = Identity::remote(client, request.meta);
        let capability = match self.authorize(&command, &identity) {
            Ok(capability) => capability,
            Err(e) => {
                info!(client = %client, command = %command, error = %e, "Rejected command");
                reply.send(Response::error(reply.nonce, e.describe(&command)));
                return;
            }
        };

        let call = Call::new(request.args, request.kwargs);
        let label = call.signature(&command);
        debug!(client = %client, nonce = reply.nonce, call = %label, "Dispatching command");

        let ctx = Context::for_request(self.shared.clone(), identity, reply.clone());
        self.shared.pool.spawn(JobKind::Command, label, async move {
            let nonce = reply.nonce;
            let response = match guarded(capability.call(ctx, call)).await {
                Ok(value) => Response::success(nonce, value),
                Err(e) => {
                    error!(command = %command, nonce, error = ?e, "Command failed");
                    Response::error(nonce, e.describe(&command))
                }
            };
            reply.send(response);
        });
    }

    /// Answers a request that could not be decoded, echoing its nonce as sent.
    fn reject(&mut self, client: ClientId, nonce: Value, error: String) {
        if let Some(nonce) = nonce.as_u64() {
            self.reply_to(client, nonce).send(Response::error(nonce, error));
            return;
        }
        // not a valid token; the client can still match it verbatim
        if self.router.peer_role(client) == Some(SocketRole::Req) {
            self.owners.remove(&client);
        }
        let reply = json!({"type": "error", "nonce": nonce, "error": error});
        if let Err(e) = self.router.send(client, &reply) {
            debug!(client = %client, error = %e, "Rejection not delivered");
        }
    }

    fn authorize(&self, command: &str, identity: &Identity) -> Result<Arc<Capability>, DispatchError> {
        let capability = self.shared.registry.resolve(command)?;
        if !self.shared.authorizer.authorize(&capability, identity) {
            return Err(DispatchError::Forbidden(command.to_string()));
        }
        Ok(capability)
    }

    /// Registers a new request from `client`.
    ///
    /// A `REQ` peer waits for one answer at a time, so its newest request
    /// supersedes any older one still running.
    fn reply_to(&mut self, client: ClientId, nonce: u64) -> ReplyTo {
        let ticket = match self.router.peer_role(client) {
            Some(SocketRole::Req) => {
                self.next_ticket += 1;
                if let Some(previous) = self.owners.insert(client, self.next_ticket) {
                    debug!(client = %client, previous, "Request superseded");
                }
                Some(self.next_ticket)
            }
            _ => None,
        };
        ReplyTo {
            client,
            nonce,
            ticket,
            results: self.results_tx.clone(),
        }
    }

    fn deliver(&mut self, outcome: Outcome) {
        let Outcome {
            client,
            ticket,
            response,
        } = outcome;

        if let Some(ticket) = ticket {
            if self.owners.get(&client) != Some(&ticket) {
                debug!(client = %client, nonce = response.nonce(), "Dropping stale response");
                return;
            }
            if response.is_terminal() {
                self.owners.remove(&client);
            }
        }

        let value = match serde_json::to_value(&response) {
            Ok(value) => value,
            Err(e) => {
                error!(client = %client, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self.router.send(client, &value) {
            debug!(client = %client, nonce = response.nonce(), error = %e, "Response not delivered");
        }
    }

    /// Waits for pool jobs to finish, still delivering their responses.
    pub(crate) async fn drain(&mut self, timeout: Duration, poll: Duration) {
        let deadline = Instant::now() + timeout;
        let mut next_report = Instant::now();
        loop {
            // snapshot first: a finished job has already queued its response
            let jobs = self.shared.pool.jobs();
            while let Ok(outcome) = self.results_rx.try_recv() {
                self.deliver(outcome);
            }
            if jobs.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(remaining = jobs.len(), "Drain timed out, abandoning running jobs");
                break;
            }
            if now >= next_report {
                for job in &jobs {
                    info!(kind = %job.kind, job = %job.label, "Waiting for job to finish");
                }
                next_report = now + DRAIN_REPORT_INTERVAL;
            }
            tokio::select! {
                Some(outcome) = self.results_rx.recv() => self.deliver(outcome),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
