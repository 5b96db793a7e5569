//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use steward_protocol::{Codec, Serializer};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the request (router) socket.
    pub socket_path: PathBuf,

    /// Path of the event (publish) socket.
    pub publish_path: PathBuf,

    /// Codec spoken on both sockets.
    pub codec: Codec,

    /// Whether payloads are zlib-compressed.
    pub compress: bool,

    /// Capabilities and tasks that may run at once.
    pub workers: usize,

    /// How long the dispatch loop waits for a request before checking for
    /// shutdown.
    pub poll_interval: Duration,

    /// Scheduler sleep while no task is registered.
    pub scheduler_idle: Duration,

    /// Upper bound on a single scheduler sleep.
    pub scheduler_max_sleep: Duration,

    /// Delay before retrying a task whose schedule failed.
    pub schedule_retry: Duration,

    /// How long shutdown waits for running jobs.
    pub drain_timeout: Duration,

    /// Whether to remove stale sockets on startup.
    pub cleanup_stale_socket: bool,

    /// Pid file written by `steward server`.
    pub pid_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            publish_path: default_publish_path(),
            codec: Codec::default(),
            compress: false,
            workers: 10,
            poll_interval: Duration::from_millis(100),
            scheduler_idle: Duration::from_secs(5),
            scheduler_max_sleep: Duration::from_secs(5),
            schedule_retry: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            cleanup_stale_socket: true,
            pid_path: default_pid_path(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the given socket paths.
    pub fn new(socket_path: impl Into<PathBuf>, publish_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            publish_path: publish_path.into(),
            ..Default::default()
        }
    }

    /// Builder: set codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Builder: enable or disable compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Builder: set worker count. Zero is raised to one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Builder: set dispatch poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder: set scheduler idle and max sleep.
    pub fn with_scheduler_sleep(mut self, idle: Duration, max_sleep: Duration) -> Self {
        self.scheduler_idle = idle;
        self.scheduler_max_sleep = max_sleep;
        self
    }

    /// Builder: set schedule retry interval.
    pub fn with_schedule_retry(mut self, retry: Duration) -> Self {
        self.schedule_retry = retry;
        self
    }

    /// Builder: set drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: set pid file path.
    pub fn with_pid_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_path = path.into();
        self
    }

    /// The serializer both sockets use.
    pub fn serializer(&self) -> Serializer {
        Serializer::new(self.codec, self.compress)
    }
}

/// Returns the default request socket path.
///
/// Uses `$XDG_RUNTIME_DIR/steward.sock` if available,
/// otherwise falls back to `/tmp/steward-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    runtime_path("steward.sock", "sock")
}

/// Returns the default publish socket path.
pub fn default_publish_path() -> PathBuf {
    runtime_path("steward-pub.sock", "pub.sock")
}

/// Returns the default pid file path.
pub fn default_pid_path() -> PathBuf {
    runtime_path("steward.pid", "pid")
}

fn runtime_path(name: &str, extension: &str) -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join(name)
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/steward-{uid}.{extension}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert!(config.socket_path.to_string_lossy().contains("steward"));
        assert_eq!(config.workers, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.schedule_retry, Duration::from_secs(5));
        assert_eq!(config.codec, Codec::Json);
        assert!(!config.compress);
        assert!(config.cleanup_stale_socket);
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::new("/run/a.sock", "/run/b.sock")
            .with_codec(Codec::Cbor)
            .with_compression(true)
            .with_workers(0)
            .with_cleanup_stale_socket(false);

        assert_eq!(config.socket_path, PathBuf::from("/run/a.sock"));
        assert_eq!(config.publish_path, PathBuf::from("/run/b.sock"));
        assert_eq!(config.workers, 1);
        assert!(!config.cleanup_stale_socket);
        assert_eq!(config.serializer(), Serializer::cbor().compressed());
    }

    #[test]
    fn default_paths_are_distinct() {
        let request = default_socket_path();
        let publish = default_publish_path();
        let pid = default_pid_path();
        assert_ne!(request, publish);
        assert!(request.to_string_lossy().ends_with(".sock"));
        assert!(publish.to_string_lossy().ends_with(".sock"));
        assert!(pid.to_string_lossy().ends_with(".pid"));
    }
}
