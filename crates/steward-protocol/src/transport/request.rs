//! Synchronous request socket.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use super::{Link, SocketRole, single_part};
use crate::codec::Serializer;
use crate::error::{ProtocolError, TransportResult};

/// Client socket for one-at-a-time request/reply.
///
/// The router treats a new request from a `REQ` peer as superseding any
/// earlier one still running, so a reply always belongs to the latest request.
pub struct RequestStream {
    link: Link,
    serializer: Serializer,
}

impl RequestStream {
    pub async fn connect(path: impl AsRef<Path>, serializer: Serializer) -> TransportResult<Self> {
        Ok(Self {
            link: Link::connect(path.as_ref(), SocketRole::Req).await?,
            serializer,
        })
    }

    /// Writes one serialized value.
    pub async fn send(&mut self, value: &Value) -> TransportResult<()> {
        let payload = self.serializer.serialize(value)?;
        self.link.send(&[&payload]).await
    }

    /// Waits for the next value.
    pub async fn receive(&mut self) -> TransportResult<Value> {
        let parts = self.link.inbound().next().await?;
        decode(self.serializer, parts)
    }

    /// Waits at most `timeout` for the next value.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> TransportResult<Value> {
        let parts = self
            .link
            .inbound()
            .next_timeout(timeout, "request receive")
            .await?;
        decode(self.serializer, parts)
    }
}

fn decode(serializer: Serializer, parts: Vec<Vec<u8>>) -> TransportResult<Value> {
    let payload = single_part(parts)?;
    Ok(serializer.deserialize(&payload).map_err(ProtocolError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::RouterStream;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn request_reply_with_compression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("router.sock");
        let serializer = Serializer::json().compressed();
        let mut router = RouterStream::bind(&path, serializer, true).await.unwrap();
        let mut req = RequestStream::connect(&path, serializer).await.unwrap();

        req.send(&json!({"cmd": "ping"})).await.unwrap();
        let (client, value) = router.receive().await.unwrap();
        assert_eq!(value, json!({"cmd": "ping"}));

        router.send(client, &json!("pong")).unwrap();
        assert_eq!(
            req.receive_timeout(Duration::from_secs(5)).await.unwrap(),
            json!("pong")
        );
    }

    #[tokio::test]
    async fn timed_out_receive_keeps_the_stream_usable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("router.sock");
        let mut router = RouterStream::bind(&path, Serializer::json(), true)
            .await
            .unwrap();
        let mut req = RequestStream::connect(&path, Serializer::json()).await.unwrap();

        req.send(&json!(1)).await.unwrap();
        let (client, _) = router.receive().await.unwrap();

        let err = req
            .receive_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));

        router.send(client, &json!("late but whole")).unwrap();
        assert_eq!(req.receive().await.unwrap(), json!("late but whole"));
    }

    #[tokio::test]
    async fn server_gone_is_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("router.sock");
        let router = RouterStream::bind(&path, Serializer::json(), true)
            .await
            .unwrap();
        let mut req = RequestStream::connect(&path, Serializer::json()).await.unwrap();
        drop(router);

        assert!(matches!(req.receive().await, Err(TransportError::Closed)));
    }
}
