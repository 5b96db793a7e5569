//! Server side of the request socket.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BoundPath, SocketRole, accept_greeting, bind_listener, single_part};
use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::framing::Parts;

/// Requests buffered across all clients before readers wait.
const INBOUND_BUFFER: usize = 1024;

/// Identity assigned to each connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// A fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

struct Peer {
    role: SocketRole,
    // unbounded so one slow reader never stalls the dispatch loop
    outbound: mpsc::UnboundedSender<Parts>,
}

type PeerMap = Arc<Mutex<HashMap<ClientId, Peer>>>;

fn lock(peers: &PeerMap) -> MutexGuard<'_, HashMap<ClientId, Peer>> {
    peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serves many `REQ`/`DEALER` peers on one path.
///
/// `receive` yields `(client, value)` in arrival order across all clients;
/// `send` addresses a reply to one client.
pub struct RouterStream {
    path: BoundPath,
    serializer: Serializer,
    peers: PeerMap,
    inbound: mpsc::Receiver<(ClientId, Value)>,
    accept_task: JoinHandle<()>,
}

impl RouterStream {
    /// Binds `path`. With `cleanup_stale`, a socket file nobody listens on is
    /// removed first.
    pub async fn bind(
        path: impl AsRef<Path>,
        serializer: Serializer,
        cleanup_stale: bool,
    ) -> TransportResult<Self> {
        let (listener, path) = bind_listener(path.as_ref(), cleanup_stale).await?;
        info!(path = %path.path().display(), codec = %serializer.codec, "Router listening");

        let peers = PeerMap::default();
        let (tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let accept_task = tokio::spawn(accept_loop(listener, serializer, peers.clone(), tx));

        Ok(Self {
            path,
            serializer,
            peers,
            inbound,
            accept_task,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.path()
    }

    /// Next request from any client.
    pub async fn receive(&mut self) -> TransportResult<(ClientId, Value)> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> TransportResult<(ClientId, Value)> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "router receive",
            })?
    }

    /// Queues a reply for `client`.
    pub fn send(&self, client: ClientId, value: &Value) -> TransportResult<()> {
        let payload = self.serializer.serialize(value)?;
        let peers = lock(&self.peers);
        let peer = peers
            .get(&client)
            .ok_or_else(|| TransportError::UnknownClient(client.to_string()))?;
        peer.outbound
            .send(vec![payload])
            .map_err(|_| TransportError::Closed)
    }

    /// Role the client announced when it connected.
    pub fn peer_role(&self, client: ClientId) -> Option<SocketRole> {
        lock(&self.peers).get(&client).map(|peer| peer.role)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.peers).len()
    }
}

impl Drop for RouterStream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: UnixListener,
    serializer: Serializer,
    peers: PeerMap,
    inbound: mpsc::Sender<(ClientId, Value)>,
) {
    // dropping the set on abort tears down every connection
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let peers = peers.clone();
                    let inbound = inbound.clone();
                    connections.spawn(async move {
                        let client = ClientId::new();
                        if let Err(e) = serve_peer(stream, client, serializer, &peers, inbound).await {
                            warn!(client = %client, error = %e, "Closing client connection");
                        }
                        if lock(&peers).remove(&client).is_some() {
                            debug!(client = %client, "Client disconnected");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_peer(
    stream: tokio::net::UnixStream,
    client: ClientId,
    serializer: Serializer,
    peers: &PeerMap,
    inbound: mpsc::Sender<(ClientId, Value)>,
) -> TransportResult<()> {
    let (role, mut reader, mut writer) = accept_greeting(stream, SocketRole::Router).await?;
    let (outbound, mut replies) = mpsc::unbounded_channel::<Parts>();
    lock(peers).insert(client, Peer { role, outbound });
    debug!(client = %client, role = %role, "Client connected");

    let read = async {
        while let Some(parts) = reader.read_frame().await? {
            let value = serializer
                .deserialize(&single_part(parts)?)
                .map_err(ProtocolError::from)?;
            if inbound.send((client, value)).await.is_err() {
                break;
            }
        }
        Ok::<_, TransportError>(())
    };
    let write = async {
        while let Some(parts) = replies.recv().await {
            writer.write_frame(&parts).await?;
        }
        Ok::<_, TransportError>(())
    };

    tokio::select! {
        result = read => result,
        result = write => result,
    }
}
