//! Server command: runs the daemon in the foreground.
//!
//! Writes the pid file, loads the builtin extension, binds both sockets and
//! serves until SIGTERM or SIGINT.

use std::path::PathBuf;

use tracing::info;

use steward_server::{Builtin, PidFile, Server, ServerConfig, ServerError, spawn_signal_listener};

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Builds the daemon configuration from the client configuration.
pub fn server_config(
    config: &ClientConfig,
    workers: Option<usize>,
    pid_file: Option<PathBuf>,
) -> ServerConfig {
    let mut server = ServerConfig::new(config.socket_path(), config.publish_path())
        .with_codec(config.codec)
        .with_compression(config.compress)
        .with_pid_path(pid_file.unwrap_or_else(|| config.pid_path()));
    if let Some(workers) = workers.or(config.server.workers) {
        server = server.with_workers(workers);
    }
    server
}

/// Starts the server daemon in the foreground.
///
/// Blocks until a shutdown signal is received and running commands have
/// drained.
pub async fn run(server_config: ServerConfig) -> ClientResult<()> {
    let _pid_file = PidFile::create(&server_config.pid_path)?;

    let mut builder = Server::builder(server_config);
    builder.extension(Builtin).map_err(ServerError::from)?;
    let server = builder.bind().await?;

    let listener = spawn_signal_listener(server.shutdown_handle())?;
    info!(pid = std::process::id(), "Daemon running");
    let result = server.run().await;
    listener.abort();
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_the_file() {
        let mut config = ClientConfig::default();
        config.server.socket_path = Some("/tmp/a.sock".into());
        config.server.workers = Some(2);

        let server = server_config(&config, Some(7), Some("/tmp/a.pid".into()));
        assert_eq!(server.socket_path, PathBuf::from("/tmp/a.sock"));
        assert_eq!(server.workers, 7);
        assert_eq!(server.pid_path, PathBuf::from("/tmp/a.pid"));

        let server = server_config(&config, None, None);
        assert_eq!(server.workers, 2);
    }
}
