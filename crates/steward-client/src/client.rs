//! Clients for the steward request socket.
//!
//! [`Client`] multiplexes any number of requests over one dealer
//! connection and pairs replies with requests by nonce. [`ReqClient`] is the
//! simpler one-at-a-time variant; the server drops replies to any request it
//! has superseded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use steward_protocol::{
    DealerSender, DealerStream, Kwargs, Request, RequestStream, Response, Serializer,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, ClientResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Response>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One step of a call in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A progress notification.
    Partial { tag: String, desc: String },
    /// The call finished successfully.
    Done(Value),
}

/// A call sent with [`Client::call`] whose outcome has not arrived yet.
///
/// Dropping it stops tracking the nonce; a late reply is discarded.
pub struct PendingCall {
    command: String,
    nonce: u64,
    replies: mpsc::UnboundedReceiver<Response>,
    pending: PendingMap,
    timeout: Duration,
}

impl PendingCall {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Waits for the next partial or the final result.
    pub async fn next(&mut self) -> ClientResult<Reply> {
        let response = tokio::time::timeout(self.timeout, self.replies.recv())
            .await
            .map_err(|_| ClientError::Timeout {
                command: self.command.clone(),
                timeout: self.timeout,
            })?
            .ok_or_else(|| ClientError::Closed(self.command.clone()))?;

        match response {
            Response::Partial { partial, desc, .. } => Ok(Reply::Partial { tag: partial, desc }),
            Response::Success { response, .. } => Ok(Reply::Done(response)),
            Response::Error { error, .. } => Err(ClientError::Command(error)),
        }
    }

    /// Waits for the final result, skipping partials.
    pub async fn wait(mut self) -> ClientResult<Value> {
        loop {
            match self.next().await? {
                Reply::Partial { tag, desc } => {
                    debug!(command = %self.command, tag = %tag, desc = %desc, "Partial response");
                }
                Reply::Done(value) => return Ok(value),
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.nonce);
    }
}

/// Multiplexing client over a dealer connection.
pub struct Client {
    sender: AsyncMutex<DealerSender>,
    pending: PendingMap,
    next_nonce: AtomicU64,
    meta: Kwargs,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connects to the request socket at `path`.
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> ClientResult<Self> {
        let path = path.as_ref();
        debug!(socket = %path.display(), codec = %serializer.codec, "Connecting to server");
        let (sender, mut receiver) = DealerStream::connect(path, serializer).await?.into_split();

        let pending = PendingMap::default();
        let routes = pending.clone();
        let reader = tokio::spawn(async move {
            loop {
                let raw = match receiver.receive().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(error = %e, "Server connection ended");
                        break;
                    }
                };
                let response: Response = match serde_json::from_value(raw) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed response");
                        continue;
                    }
                };
                let nonce = response.nonce();
                let terminal = response.is_terminal();
                let mut table = lock(&routes);
                match table.get(&nonce) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => trace!(nonce, "Dropping reply nobody waits for"),
                }
                if terminal {
                    table.remove(&nonce);
                }
            }
            // wakes every waiter with `Closed`
            lock(&routes).clear();
        });

        Ok(Self {
            sender: AsyncMutex::new(sender),
            pending,
            next_nonce: AtomicU64::new(1),
            meta: Kwargs::new(),
            timeout: DEFAULT_TIMEOUT,
            reader,
        })
    }

    /// Client context attached to every request.
    #[must_use]
    pub fn with_meta(mut self, meta: Kwargs) -> Self {
        self.meta = meta;
        self
    }

    /// How long a call may take before [`ClientError::Timeout`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a request without waiting for its outcome.
    pub async fn call(&self, command: &str, args: Vec<Value>, kwargs: Kwargs) -> ClientResult<PendingCall> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(command, nonce)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_meta(self.meta.clone());
        let value = serde_json::to_value(&request)
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {e}")))?;

        let (tx, replies) = mpsc::unbounded_channel();
        lock(&self.pending).insert(nonce, tx);
        let call = PendingCall {
            command: command.to_string(),
            nonce,
            replies,
            pending: self.pending.clone(),
            timeout: self.timeout,
        };

        trace!(command, nonce, "Sending request");
        self.sender.lock().await.send(&value).await?;
        Ok(call)
    }

    /// Sends a request and waits for its outcome.
    pub async fn cmd(&self, command: &str, args: Vec<Value>, kwargs: Kwargs) -> ClientResult<Value> {
        self.call(command, args, kwargs).await?.wait().await
    }

    /// Number of calls still waiting for a terminal reply.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One-request-at-a-time client over a request connection.
pub struct ReqClient {
    stream: RequestStream,
    next_nonce: u64,
    meta: Kwargs,
    timeout: Duration,
}

impl ReqClient {
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> ClientResult<Self> {
        Ok(Self {
            stream: RequestStream::connect(path, serializer).await?,
            next_nonce: 1,
            meta: Kwargs::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Kwargs) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a request and waits for its outcome.
    ///
    /// Partials are logged and skipped; replies to earlier requests are
    /// ignored.
    pub async fn cmd(&mut self, command: &str, args: Vec<Value>, kwargs: Kwargs) -> ClientResult<Value> {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        let request = Request::new(command, nonce)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_meta(self.meta.clone());
        let value = serde_json::to_value(&request)
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {e}")))?;
        self.stream.send(&value).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let raw = match self.stream.receive_timeout(remaining).await {
                Ok(raw) => raw,
                Err(e) if e.is_retryable() => {
                    return Err(ClientError::Timeout {
                        command: command.to_string(),
                        timeout: self.timeout,
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let response: Response = serde_json::from_value(raw)
                .map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))?;
            if response.nonce() != nonce {
                trace!(nonce = response.nonce(), "Ignoring reply to an earlier request");
                continue;
            }
            match response {
                Response::Partial { partial, desc, .. } => {
                    debug!(command, tag = %partial, desc = %desc, "Partial response");
                }
                Response::Success { response, .. } => return Ok(response),
                Response::Error { error, .. } => return Err(ClientError::Command(error)),
            }
        }
    }
}
