//! Fan-out publisher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::{BoundPath, SocketRole, accept_greeting, bind_listener};
use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::framing::Parts;

/// Control verbs a subscriber sends as the first part of a two-part frame.
pub(crate) const SUBSCRIBE: &[u8] = b"subscribe";
pub(crate) const UNSUBSCRIBE: &[u8] = b"unsubscribe";

/// Events queued per subscriber before new ones are dropped.
const SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    prefixes: Vec<String>,
    outbound: mpsc::Sender<Parts>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.prefixes.iter().any(|prefix| topic.starts_with(prefix.as_str()))
    }
}

type SubscriberMap = Arc<Mutex<HashMap<u64, Subscriber>>>;

fn lock(subs: &SubscriberMap) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
    subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Publishes `(topic, payload)` frames to every connected `SUB` peer whose
/// subscriptions prefix-match the topic.
///
/// Delivery is best effort: a subscriber that falls too far behind loses
/// events rather than slowing the publisher down.
pub struct PublishStream {
    path: BoundPath,
    serializer: Serializer,
    subscribers: SubscriberMap,
    accept_task: JoinHandle<()>,
}

impl PublishStream {
    pub async fn bind(
        path: impl AsRef<Path>,
        serializer: Serializer,
        cleanup_stale: bool,
    ) -> TransportResult<Self> {
        let (listener, path) = bind_listener(path.as_ref(), cleanup_stale).await?;
        info!(path = %path.path().display(), codec = %serializer.codec, "Publisher listening");

        let subscribers = SubscriberMap::default();
        let accept_task = tokio::spawn(accept_loop(listener, subscribers.clone()));
        Ok(Self {
            path,
            serializer,
            subscribers,
            accept_task,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.path()
    }

    /// Sends `payload` under `topic`. Returns how many subscribers it was
    /// queued for.
    pub fn send(&self, topic: &str, payload: &Value) -> TransportResult<usize> {
        let parts = vec![topic.as_bytes().to_vec(), self.serializer.serialize(payload)?];
        let mut delivered = 0;
        for (id, sub) in lock(&self.subscribers).iter() {
            if !sub.wants(topic) {
                continue;
            }
            match sub.outbound.try_send(parts.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, topic, "Subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        trace!(topic, delivered, "Published");
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Total number of prefixes across all subscribers.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscribers)
            .values()
            .map(|sub| sub.prefixes.len())
            .sum()
    }
}

impl Drop for PublishStream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: UnixListener, subscribers: SubscriberMap) {
    let mut connections = JoinSet::new();
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_id += 1;
                    let id = next_id;
                    let subscribers = subscribers.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_subscriber(stream, id, &subscribers).await {
                            warn!(subscriber = id, error = %e, "Closing subscriber connection");
                        }
                        if lock(&subscribers).remove(&id).is_some() {
                            debug!(subscriber = id, "Subscriber disconnected");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept subscriber"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_subscriber(
    stream: UnixStream,
    id: u64,
    subscribers: &SubscriberMap,
) -> TransportResult<()> {
    let (_, mut reader, mut writer) = accept_greeting(stream, SocketRole::Pub).await?;
    let (outbound, mut events) = mpsc::channel::<Parts>(SUBSCRIBER_BUFFER);
    lock(subscribers).insert(
        id,
        Subscriber {
            prefixes: Vec::new(),
            outbound,
        },
    );
    debug!(subscriber = id, "Subscriber connected");

    let control = async {
        while let Some(parts) = reader.read_parts(2).await? {
            let prefix = String::from_utf8(parts[1].clone())
                .map_err(|_| ProtocolError::invalid("subscription prefix is not UTF-8"))?;
            let mut subs = lock(subscribers);
            let Some(sub) = subs.get_mut(&id) else {
                break;
            };
            match parts[0].as_slice() {
                SUBSCRIBE => {
                    debug!(subscriber = id, prefix = %prefix, "Subscribed");
                    sub.prefixes.push(prefix);
                }
                UNSUBSCRIBE => {
                    debug!(subscriber = id, prefix = %prefix, "Unsubscribed");
                    if let Some(pos) = sub.prefixes.iter().position(|p| *p == prefix) {
                        sub.prefixes.remove(pos);
                    }
                }
                other => {
                    return Err(ProtocolError::invalid(format!(
                        "unknown control verb '{}'",
                        String::from_utf8_lossy(other)
                    ))
                    .into());
                }
            }
        }
        Ok::<_, TransportError>(())
    };
    let deliver = async {
        while let Some(parts) = events.recv().await {
            writer.write_frame(&parts).await?;
        }
        Ok::<_, TransportError>(())
    };

    tokio::select! {
        result = control => result,
        result = deliver => result,
    }
}
