//! CLI, multiplexed socket client, event subscriber
//!
//! This crate provides the `steward` command-line interface and the client
//! types it is built on.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use steward_client::Client;
//! use steward_protocol::{Kwargs, Serializer};
//!
//! # async fn demo() -> steward_client::ClientResult<()> {
//! let client = Client::connect("/tmp/steward.sock", Serializer::json()).await?;
//! let pong = client.cmd("ping", Vec::new(), Kwargs::new()).await?;
//! assert_eq!(pong, json!("pong"));
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod subscriber;

pub use cli::Cli;
pub use client::{Client, PendingCall, Reply, ReqClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use subscriber::Subscriber;
