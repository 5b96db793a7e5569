//! Event subscriber.

use std::path::Path;
use std::time::Duration;

use steward_protocol::{Event, Serializer, SubscribeStream};
use tracing::debug;

use crate::error::ClientResult;

/// Receives events whose names start with one of the subscribed prefixes.
pub struct Subscriber {
    stream: SubscribeStream,
}

impl Subscriber {
    /// Connects to the event socket at `path`. Nothing arrives until
    /// [`subscribe`](Self::subscribe) is called.
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> ClientResult<Self> {
        let path = path.as_ref();
        debug!(socket = %path.display(), "Connecting to event socket");
        Ok(Self {
            stream: SubscribeStream::connect(path, serializer).await?,
        })
    }

    /// Starts receiving events named `prefix*`. The empty prefix matches all.
    pub async fn subscribe(&mut self, prefix: &str) -> ClientResult<()> {
        self.stream.subscribe(prefix).await?;
        Ok(())
    }

    pub async fn unsubscribe(&mut self, prefix: &str) -> ClientResult<()> {
        self.stream.unsubscribe(prefix).await?;
        Ok(())
    }

    pub fn subscriptions(&self) -> &[String] {
        self.stream.subscriptions()
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> ClientResult<Event> {
        Ok(self.stream.receive().await?)
    }

    /// Waits at most `timeout` for the next event.
    pub async fn next_event_timeout(&mut self, timeout: Duration) -> ClientResult<Event> {
        Ok(self.stream.receive_timeout(timeout).await?)
    }
}
