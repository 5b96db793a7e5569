//! Socket roles over Unix domain sockets.
//!
//! Two sockets bind ([`RouterStream`], [`PublishStream`]) and three connect to
//! them ([`RequestStream`], [`DealerStream`], [`SubscribeStream`]). On connect
//! both ends send a one-part greeting naming their role and each side checks
//! that it can talk to the other: a router serves `REQ` and `DEALER` peers, a
//! publisher serves `SUB` peers. Anything else closes the connection.
//!
//! Every payload frame holds one serialized [`Value`](serde_json::Value),
//! except publish frames which put the topic first so subscribers can be
//! filtered without decoding the payload.

mod dealer;
mod publish;
mod request;
mod router;
mod subscribe;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub use dealer::{DealerReceiver, DealerSender, DealerStream};
pub use publish::PublishStream;
pub use request::RequestStream;
pub use router::{ClientId, RouterStream};
pub use subscribe::SubscribeStream;

use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::framing::{FrameReader, FrameWriter, Parts};

/// How long a peer gets to send its greeting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered per connection before the reader waits.
const INBOUND_BUFFER: usize = 256;

/// The five socket roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    /// Synchronous client: one request, one reply.
    Req,
    /// Asynchronous client multiplexing many requests.
    Dealer,
    /// Server side of `Req`/`Dealer`, replies addressed by client identity.
    Router,
    /// Fan-out publisher.
    Pub,
    /// Topic-prefix subscriber.
    Sub,
}

impl SocketRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
        }
    }

    /// Whether sockets of this role bind a path rather than connect to one.
    pub fn binds(self) -> bool {
        matches!(self, Self::Router | Self::Pub)
    }

    /// Whether a socket of this role serves a peer of role `peer`.
    pub fn accepts(self, peer: SocketRole) -> bool {
        matches!(
            (self, peer),
            (Self::Router, Self::Req | Self::Dealer) | (Self::Pub, Self::Sub)
        )
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQ" => Ok(Self::Req),
            "DEALER" => Ok(Self::Dealer),
            "ROUTER" => Ok(Self::Router),
            "PUB" => Ok(Self::Pub),
            "SUB" => Ok(Self::Sub),
            other => Err(ProtocolError::Handshake(format!("unknown role '{other}'"))),
        }
    }
}

/// Any socket role behind one type.
pub enum Stream {
    Request(RequestStream),
    Dealer(DealerStream),
    Router(RouterStream),
    Publish(PublishStream),
    Subscribe(SubscribeStream),
}

impl Stream {
    /// Binds (`ROUTER`, `PUB`) or connects (the others) a socket of `role`.
    ///
    /// Binding removes a stale socket file left behind by a dead process.
    pub async fn open(
        role: SocketRole,
        path: impl AsRef<Path>,
        serializer: Serializer,
    ) -> TransportResult<Self> {
        let path = path.as_ref();
        Ok(match role {
            SocketRole::Req => Self::Request(RequestStream::connect(path, serializer).await?),
            SocketRole::Dealer => Self::Dealer(DealerStream::connect(path, serializer).await?),
            SocketRole::Router => Self::Router(RouterStream::bind(path, serializer, true).await?),
            SocketRole::Pub => Self::Publish(PublishStream::bind(path, serializer, true).await?),
            SocketRole::Sub => Self::Subscribe(SubscribeStream::connect(path, serializer).await?),
        })
    }

    pub fn role(&self) -> SocketRole {
        match self {
            Self::Request(_) => SocketRole::Req,
            Self::Dealer(_) => SocketRole::Dealer,
            Self::Router(_) => SocketRole::Router,
            Self::Publish(_) => SocketRole::Pub,
            Self::Subscribe(_) => SocketRole::Sub,
        }
    }

    /// Adds a topic prefix. Only valid on a subscriber.
    pub async fn subscribe(&mut self, prefix: &str) -> TransportResult<()> {
        match self {
            Self::Subscribe(sub) => sub.subscribe(prefix).await,
            other => Err(TransportError::wrong_role(other.role(), "subscribe")),
        }
    }

    /// Removes a topic prefix. Only valid on a subscriber.
    pub async fn unsubscribe(&mut self, prefix: &str) -> TransportResult<()> {
        match self {
            Self::Subscribe(sub) => sub.unsubscribe(prefix).await,
            other => Err(TransportError::wrong_role(other.role(), "unsubscribe")),
        }
    }

    pub fn into_request(self) -> TransportResult<RequestStream> {
        match self {
            Self::Request(s) => Ok(s),
            other => Err(TransportError::wrong_role(other.role(), "request")),
        }
    }

    pub fn into_dealer(self) -> TransportResult<DealerStream> {
        match self {
            Self::Dealer(s) => Ok(s),
            other => Err(TransportError::wrong_role(other.role(), "dealer")),
        }
    }

    pub fn into_router(self) -> TransportResult<RouterStream> {
        match self {
            Self::Router(s) => Ok(s),
            other => Err(TransportError::wrong_role(other.role(), "router")),
        }
    }

    pub fn into_publish(self) -> TransportResult<PublishStream> {
        match self {
            Self::Publish(s) => Ok(s),
            other => Err(TransportError::wrong_role(other.role(), "publish")),
        }
    }

    pub fn into_subscribe(self) -> TransportResult<SubscribeStream> {
        match self {
            Self::Subscribe(s) => Ok(s),
            other => Err(TransportError::wrong_role(other.role(), "subscribe")),
        }
    }
}

/// Socket file owned by a bound stream; removed on drop.
#[derive(Debug)]
pub(crate) struct BoundPath(PathBuf);

impl BoundPath {
    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for BoundPath {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_file(&self.0) {
                warn!(path = %self.0.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(path = %self.0.display(), "Removed socket file");
            }
        }
    }
}

/// Binds a listener, optionally clearing a stale socket file first.
pub(crate) async fn bind_listener(
    path: &Path,
    cleanup_stale: bool,
) -> TransportResult<(UnixListener, BoundPath)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        return Err(TransportError::SocketPathInvalid {
            path: parent.display().to_string(),
        });
    }

    if path.exists() {
        if !cleanup_stale || UnixStream::connect(path).await.is_ok() {
            return Err(TransportError::SocketInUse {
                path: path.display().to_string(),
            });
        }
        info!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    Ok((listener, BoundPath(path.to_path_buf())))
}

/// Binding side of the greeting exchange.
///
/// Sends our role, then waits for the peer's and checks it.
pub(crate) async fn accept_greeting(
    stream: UnixStream,
    local: SocketRole,
) -> TransportResult<(SocketRole, FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    writer.write_frame(&[local.as_str().as_bytes()]).await?;
    let peer = read_greeting(&mut reader).await?;
    if !local.accepts(peer) {
        return Err(ProtocolError::Handshake(format!("{local} socket cannot serve a {peer} peer")).into());
    }
    Ok((peer, reader, writer))
}

/// Connecting side of the greeting exchange.
pub(crate) async fn connect_greeting(
    path: &Path,
    local: SocketRole,
) -> TransportResult<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let stream = UnixStream::connect(path).await?;
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    writer.write_frame(&[local.as_str().as_bytes()]).await?;
    let remote = read_greeting(&mut reader).await?;
    if !remote.accepts(local) {
        return Err(ProtocolError::Handshake(format!("{local} socket cannot talk to a {remote} socket")).into());
    }
    debug!(path = %path.display(), role = %local, remote = %remote, "Connected");
    Ok((reader, writer))
}

async fn read_greeting(reader: &mut FrameReader<OwnedReadHalf>) -> TransportResult<SocketRole> {
    let parts = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_parts(1))
        .await
        .map_err(|_| TransportError::Timeout { operation: "handshake" })??
        .ok_or(TransportError::Closed)?;
    let name = std::str::from_utf8(&parts[0])
        .map_err(|_| ProtocolError::Handshake("greeting is not UTF-8".into()))?;
    Ok(name.parse::<SocketRole>()?)
}

/// Connected half of a connecting socket.
///
/// A background task owns the read half so receives can be cancelled or timed
/// out without losing half a frame.
pub(crate) struct Link {
    writer: FrameWriter<OwnedWriteHalf>,
    inbound: Inbound,
}

impl Link {
    pub(crate) async fn connect(path: &Path, role: SocketRole) -> TransportResult<Self> {
        let (reader, writer) = connect_greeting(path, role).await?;
        Ok(Self {
            writer,
            inbound: Inbound::spawn(reader, role),
        })
    }

    pub(crate) async fn send<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> TransportResult<()> {
        self.writer.write_frame(parts).await?;
        Ok(())
    }

    pub(crate) fn split(self) -> (FrameWriter<OwnedWriteHalf>, Inbound) {
        (self.writer, self.inbound)
    }

    pub(crate) fn inbound(&mut self) -> &mut Inbound {
        &mut self.inbound
    }
}

/// Frames read by a background task.
pub(crate) struct Inbound {
    rx: mpsc::Receiver<Result<Parts, ProtocolError>>,
    task: JoinHandle<()>,
}

impl Inbound {
    fn spawn(mut reader: FrameReader<OwnedReadHalf>, role: SocketRole) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let task = tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(Some(parts)) => {
                        trace!(role = %role, parts = parts.len(), "Frame received");
                        if tx.send(Ok(parts)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(role = %role, "Peer closed connection");
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Self { rx, task }
    }

    /// Next frame, or `Closed` once the peer hung up.
    pub(crate) async fn next(&mut self) -> TransportResult<Parts> {
        match self.rx.recv().await {
            Some(Ok(parts)) => Ok(parts),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }

    pub(crate) async fn next_timeout(
        &mut self,
        timeout: Duration,
        operation: &'static str,
    ) -> TransportResult<Parts> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| TransportError::Timeout { operation })?
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pulls the single payload part out of a frame.
pub(crate) fn single_part(mut parts: Parts) -> Result<Vec<u8>, ProtocolError> {
    if parts.len() != 1 {
        return Err(ProtocolError::PartCount {
            expected: 1,
            received: parts.len(),
        });
    }
    Ok(parts.swap_remove(0))
}
