//! Asynchronous multiplexing client socket.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::net::unix::OwnedWriteHalf;

use super::{Inbound, Link, SocketRole, single_part};
use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportResult};
use crate::framing::{FrameWriter, Parts};

/// Client socket that may have many requests in flight.
///
/// Frames carry no addressing; pairing replies with requests is left to the
/// nonce in the application payload.
pub struct DealerStream {
    link: Link,
    serializer: Serializer,
}

impl DealerStream {
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> TransportResult<Self> {
        Ok(Self {
            link: Link::connect(path.as_ref(), SocketRole::Dealer).await?,
            serializer,
        })
    }

    pub async fn send(&mut self, value: &Value) -> TransportResult<()> {
        let payload = self.serializer.serialize(value)?;
        self.link.send(&[&payload]).await
    }

    pub async fn receive(&mut self) -> TransportResult<Value> {
        let parts = self.link.inbound().next().await?;
        decode(self.serializer, parts)
    }

    pub async fn receive_timeout(&mut self, timeout: Duration) -> TransportResult<Value> {
        let parts = self
            .link
            .inbound()
            .next_timeout(timeout, "dealer receive")
            .await?;
        decode(self.serializer, parts)
    }

    /// Splits into halves that can live in different tasks.
    pub fn into_split(self) -> (DealerSender, DealerReceiver) {
        let (writer, inbound) = self.link.split();
        (
            DealerSender {
                writer,
                serializer: self.serializer,
            },
            DealerReceiver {
                inbound,
                serializer: self.serializer,
            },
        )
    }
}

/// Write half of a [`DealerStream`].
pub struct DealerSender {
    writer: FrameWriter<OwnedWriteHalf>,
    serializer: Serializer,
}

impl DealerSender {
    pub async fn send(&mut self, value: &Value) -> TransportResult<()> {
        let payload = self.serializer.serialize(value)?;
        self.writer.write_frame(&[payload]).await?;
        Ok(())
    }
}

/// Read half of a [`DealerStream`].
pub struct DealerReceiver {
    inbound: Inbound,
    serializer: Serializer,
}

impl DealerReceiver {
    pub async fn receive(&mut self) -> TransportResult<Value> {
        let parts = self.inbound.next().await?;
        decode(self.serializer, parts)
    }
}

fn decode(serializer: Serializer, parts: Parts) -> TransportResult<Value> {
    let payload = single_part(parts)?;
    Ok(serializer.deserialize(&payload).map_err(ProtocolError::from)?)
}
