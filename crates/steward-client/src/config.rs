//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/steward/config.toml` by default:
//!
//! ```toml
//! codec = "cbor"
//! compress = true
//!
//! [server]
//! socket_path = "/run/steward/steward.sock"
//! timeout = 10
//!
//! [meta]
//! user = "ops"
//!
//! [aliases]
//! up = "deploy.start"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_protocol::{Codec, Kwargs, Serializer};

use crate::error::{ClientError, ClientResult};

/// Configuration for the steward client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Codec spoken with the server.
    pub codec: Codec,

    /// Whether payloads are zlib-compressed.
    pub compress: bool,

    /// Server/connection settings.
    pub server: ServerSettings,

    /// Client context sent with every request.
    pub meta: Kwargs,

    /// Short names expanding to full command paths.
    pub aliases: BTreeMap<String, String>,
}

/// Server/connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path of the request socket.
    pub socket_path: Option<PathBuf>,

    /// Path of the event socket.
    pub publish_path: Option<PathBuf>,

    /// Pid file used by `steward server`.
    pub pid_path: Option<PathBuf>,

    /// Seconds to wait for a command to finish.
    pub timeout: u64,

    /// Worker slots for `steward server`.
    pub workers: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            publish_path: None,
            pid_path: None,
            timeout: 30,
            workers: None,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path; a missing file is the
    /// default configuration.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            ClientError::config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("steward")
            .join("config.toml")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.server
            .socket_path
            .clone()
            .unwrap_or_else(steward_server::default_socket_path)
    }

    pub fn publish_path(&self) -> PathBuf {
        self.server
            .publish_path
            .clone()
            .unwrap_or_else(steward_server::default_publish_path)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.server
            .pid_path
            .clone()
            .unwrap_or_else(steward_server::default_pid_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    pub fn serializer(&self) -> Serializer {
        Serializer::new(self.codec, self.compress)
    }

    /// Expands `command` if it names an alias.
    pub fn resolve_alias<'a>(&'a self, command: &'a str) -> &'a str {
        self.aliases.get(command).map_or(command, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_file_is_default() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.codec, Codec::Json);
        assert!(!config.compress);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.meta.is_empty());
    }

    #[test]
    fn full_file() {
        let config: ClientConfig = toml::from_str(
            r#"
codec = "cbor"
compress = true

[server]
socket_path = "/run/steward.sock"
publish_path = "/run/steward-pub.sock"
timeout = 10

[meta]
user = "ops"
level = 3

[aliases]
up = "deploy.start"
"#,
        )
        .unwrap();

        assert_eq!(config.serializer(), Serializer::cbor().compressed());
        assert_eq!(config.socket_path(), PathBuf::from("/run/steward.sock"));
        assert_eq!(config.publish_path(), PathBuf::from("/run/steward-pub.sock"));
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.meta.get("user"), Some(&json!("ops")));
        assert_eq!(config.meta.get("level"), Some(&json!(3)));
        assert_eq!(config.resolve_alias("up"), "deploy.start");
        assert_eq!(config.resolve_alias("ping"), "ping");
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let result: Result<ClientConfig, _> = toml::from_str(r#"codec = "pickle""#);
        assert!(result.is_err());
    }

    #[test]
    fn load_from_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "compress = \"yes\"").unwrap();

        let err = ClientConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"), "{err}");
    }
}
