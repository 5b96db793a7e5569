//! Wire messages.
//!
//! These are logical shapes; the bytes depend on the configured
//! [`Serializer`](crate::Serializer).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyword arguments and client context maps.
pub type Kwargs = Map<String, Value>;

/// A command invocation sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Dotted capability path, e.g. `tasks.schedule`.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Client context attached to every request (user name, host, ...).
    #[serde(default)]
    pub meta: Kwargs,
    /// Correlation token chosen by the client and echoed in every response.
    pub nonce: u64,
}

impl Request {
    pub fn new(cmd: impl Into<String>, nonce: u64) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            meta: Kwargs::new(),
            nonce,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Kwargs) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// A reply to one [`Request`].
///
/// Exactly one `Success` or `Error` ends a nonce; any number of `Partial`
/// may come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    #[serde(rename = "response")]
    Success { nonce: u64, response: Value },
    Error { nonce: u64, error: String },
    Partial {
        nonce: u64,
        partial: String,
        #[serde(default)]
        desc: String,
    },
}

impl Response {
    pub fn success(nonce: u64, response: impl Into<Value>) -> Self {
        Self::Success {
            nonce,
            response: response.into(),
        }
    }

    pub fn error(nonce: u64, error: impl Into<String>) -> Self {
        Self::Error {
            nonce,
            error: error.into(),
        }
    }

    pub fn partial(nonce: u64, tag: impl Into<String>, desc: impl Into<String>) -> Self {
        Self::Partial {
            nonce,
            partial: tag.into(),
            desc: desc.into(),
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Self::Success { nonce, .. } | Self::Error { nonce, .. } | Self::Partial { nonce, .. } => {
                *nonce
            }
        }
    }

    /// Whether this response ends its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }

    /// Converts a terminal response into its outcome. Partials yield `None`.
    pub fn into_outcome(self) -> Option<Result<Value, String>> {
        match self {
            Self::Success { response, .. } => Some(Ok(response)),
            Self::Error { error, .. } => Some(Err(error)),
            Self::Partial { .. } => None,
        }
    }
}

/// An event on the publish socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Serializer;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = Request::new("deploy.start", 7)
            .arg("web")
            .arg(3)
            .kwarg("force", true)
            .with_meta(Kwargs::from_iter([("user".to_string(), json!("ops"))]));

        insta::assert_json_snapshot!(request, @r#"
        {
          "cmd": "deploy.start",
          "args": [
            "web",
            3
          ],
          "kwargs": {
            "force": true
          },
          "meta": {
            "user": "ops"
          },
          "nonce": 7
        }
        "#);
    }

    #[test]
    fn response_wire_shapes() {
        insta::assert_json_snapshot!(Response::success(1, json!({"ok": 1})), @r#"
        {
          "type": "response",
          "nonce": 1,
          "response": {
            "ok": 1
          }
        }
        "#);
        insta::assert_json_snapshot!(Response::error(2, "no such command"), @r#"
        {
          "type": "error",
          "nonce": 2,
          "error": "no such command"
        }
        "#);
        insta::assert_json_snapshot!(Response::partial(3, "progress", "2/5 hosts"), @r#"
        {
          "type": "partial",
          "nonce": 3,
          "partial": "progress",
          "desc": "2/5 hosts"
        }
        "#);
    }

    #[test]
    fn minimal_request_fills_defaults() {
        let request: Request = serde_json::from_value(json!({"cmd": "ping", "nonce": 1})).unwrap();
        assert_eq!(request, Request::new("ping", 1));
    }

    #[test]
    fn request_without_nonce_is_rejected() {
        let result = serde_json::from_value::<Request>(json!({"cmd": "ping"}));
        assert!(result.is_err());
    }

    #[test]
    fn terminal_and_partial() {
        assert!(Response::success(1, true).is_terminal());
        assert!(Response::error(1, "x").is_terminal());
        assert!(!Response::partial(1, "t", "d").is_terminal());
        assert_eq!(Response::partial(9, "t", "d").nonce(), 9);
        assert_eq!(
            Response::error(1, "boom").into_outcome(),
            Some(Err("boom".to_string()))
        );
        assert_eq!(Response::partial(1, "t", "d").into_outcome(), None);
    }

    #[test]
    fn messages_survive_binary_codec() {
        let serializer = Serializer::cbor().compressed();
        let request = Request::new("sh", 42).arg("uptime").kwarg("timeout", 1.5);
        let bytes = serializer.encode(&request).unwrap();
        assert_eq!(serializer.decode::<Request>(&bytes).unwrap(), request);

        let response = Response::partial(42, "stdout", "load average");
        let bytes = serializer.encode(&response).unwrap();
        assert_eq!(serializer.decode::<Response>(&bytes).unwrap(), response);
    }
}
