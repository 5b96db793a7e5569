//! Extensions bundle capabilities, event handlers, tasks and start hooks.
//!
//! An [`Extension`] is registered on a [`ServerBuilder`] before the server
//! binds; after that the capability table is frozen.

mod builtin;

pub use builtin::{Builtin, format_elapsed};

use crate::error::RegistryError;
use crate::server::ServerBuilder;

/// A unit of server functionality.
pub trait Extension {
    /// Unique name; loading the same name twice is an error.
    fn name(&self) -> &str;

    /// Adds this extension's parts to `server`.
    fn register(&self, server: &mut ServerBuilder) -> Result<(), RegistryError>;
}
