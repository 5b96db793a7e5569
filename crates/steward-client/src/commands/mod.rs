//! Subcommand implementations.

pub mod remote;
pub mod server;
