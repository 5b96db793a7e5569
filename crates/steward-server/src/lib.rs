//! Daemon: dispatch loop, event bus, task scheduler.
//!
//! This crate provides the steward server that:
//! - Accepts commands from many clients over a router socket and runs them on
//!   a bounded worker pool
//! - Resolves dotted command names against a capability registry frozen at
//!   startup
//! - Runs priority-ordered event handlers before fanning events out to
//!   subscribers
//! - Fires cron and interval tasks without blocking dispatch
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use steward_server::{Builtin, Server, ServerConfig, Visibility};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = Server::builder(ServerConfig::default());
//!     builder.extension(Builtin)?;
//!     builder.capability("deploy.start", Visibility::Public, "Start a deploy", |ctx, call| async move {
//!         let target: String = call.required(0, "target")?;
//!         ctx.publish("deploy.started", json!({ "target": target }));
//!         Ok(json!(true))
//!     })?;
//!
//!     let server = builder.bind().await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod context;
mod dispatch;
mod error;
mod events;
pub mod extensions;
mod locks;
mod pidfile;
mod pool;
mod registry;
mod server;
mod signals;
pub mod tasks;

pub use config::{ServerConfig, default_pid_path, default_publish_path, default_socket_path};
pub use context::{Context, Identity};
pub use error::{CapabilityResult, DispatchError, RegistryError, ServerError, ServerResult};
pub use events::{DEFAULT_PRIORITY, Delivery, EventBus, EventHandler, FanOut, HandlerFn};
pub use extensions::{Builtin, Extension};
pub use locks::{KeyGuard, KeyedLocks};
pub use pidfile::PidFile;
pub use pool::{Job, JobKind, WorkerPool};
pub use registry::{
    AllowAll, Authorizer, Call, Capability, CapabilityFn, Registry, RegistryBuilder, Visibility,
};
pub use server::{Server, ServerBuilder};
pub use signals::{ShutdownHandle, ShutdownSignal, spawn_signal_listener};
pub use tasks::{Interval, Limited, Schedule, ScheduleError, Task, TaskList};
