//! Wire protocol for steward.
//!
//! Three layers, bottom up:
//!
//! - [`framing`]: multipart frames over a byte stream
//!   (`[u8 part count]` then `[u32 BE length][bytes]` per part).
//! - [`codec`]: a [`Serializer`] turning dynamic values into bytes, as JSON or
//!   CBOR, optionally zlib-compressed.
//! - [`transport`]: socket roles (request, dealer, router, publish,
//!   subscribe) over Unix domain sockets.
//!
//! # Example
//!
//! ```rust
//! use steward_protocol::{Request, Response, Serializer};
//!
//! let serializer = Serializer::cbor().compressed();
//! let bytes = serializer.encode(&Request::new("ping", 1)).unwrap();
//! let request: Request = serializer.decode(&bytes).unwrap();
//! assert_eq!(request.cmd, "ping");
//!
//! let reply = Response::success(request.nonce, "pong");
//! assert!(reply.is_terminal());
//! ```

pub mod codec;
mod error;
pub mod framing;
pub mod transport;
mod types;

pub use codec::{Codec, DecodeError, Serializer};
pub use error::{ProtocolError, ProtocolResult, TransportError, TransportResult};
pub use framing::{FrameReader, FrameWriter, Parts, decode_frame, encode_frame};
pub use transport::{
    ClientId, DealerReceiver, DealerSender, DealerStream, PublishStream, RequestStream,
    RouterStream, SocketRole, Stream, SubscribeStream,
};
pub use types::{Event, Kwargs, Request, Response};

/// Maximum size of one frame part (16 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;
