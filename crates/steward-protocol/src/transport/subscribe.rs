//! Topic-prefix subscriber.

use std::path::Path;
use std::time::Duration;

use super::publish::{SUBSCRIBE, UNSUBSCRIBE};
use super::{Link, SocketRole};
use crate::Event;
use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportResult};
use crate::framing::Parts;

/// Receives events from a [`PublishStream`](super::PublishStream).
///
/// A fresh subscriber receives nothing until it subscribes; the empty prefix
/// matches every topic.
pub struct SubscribeStream {
    link: Link,
    serializer: Serializer,
    prefixes: Vec<String>,
}

impl SubscribeStream {
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> TransportResult<Self> {
        Ok(Self {
            link: Link::connect(path.as_ref(), SocketRole::Sub).await?,
            serializer,
            prefixes: Vec::new(),
        })
    }

    pub async fn subscribe(&mut self, prefix: &str) -> TransportResult<()> {
        self.link.send(&[SUBSCRIBE, prefix.as_bytes()]).await?;
        self.prefixes.push(prefix.to_string());
        Ok(())
    }

    pub async fn unsubscribe(&mut self, prefix: &str) -> TransportResult<()> {
        self.link.send(&[UNSUBSCRIBE, prefix.as_bytes()]).await?;
        if let Some(pos) = self.prefixes.iter().position(|p| p == prefix) {
            self.prefixes.remove(pos);
        }
        Ok(())
    }

    /// Prefixes currently subscribed.
    pub fn subscriptions(&self) -> &[String] {
        &self.prefixes
    }

    pub async fn receive(&mut self) -> TransportResult<Event> {
        let parts = self.link.inbound().next().await?;
        self.decode(parts)
    }

    pub async fn receive_timeout(&mut self, timeout: Duration) -> TransportResult<Event> {
        let parts = self
            .link
            .inbound()
            .next_timeout(timeout, "subscribe receive")
            .await?;
        self.decode(parts)
    }

    fn decode(&self, parts: Parts) -> TransportResult<Event> {
        let [topic, payload]: [Vec<u8>; 2] =
            parts.try_into().map_err(|parts: Parts| ProtocolError::PartCount {
                expected: 2,
                received: parts.len(),
            })?;
        let topic = String::from_utf8(topic).map_err(|_| ProtocolError::invalid("topic is not UTF-8"))?;
        let payload = self
            .serializer
            .deserialize(&payload)
            .map_err(ProtocolError::from)?;
        Ok(Event::new(topic, payload))
    }
}
