//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use steward_protocol::{Codec, Kwargs};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// steward - run commands on a steward server
#[derive(Debug, Parser)]
#[command(name = "steward")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "STEWARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Path to the server request socket
    #[arg(long, env = "STEWARD_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// Path to the server event socket
    #[arg(long, env = "STEWARD_PUB_SOCKET")]
    pub publish_path: Option<PathBuf>,

    /// Codec spoken with the server (json or cbor)
    #[arg(long)]
    pub codec: Option<Codec>,

    /// Compress payloads with zlib
    #[arg(long)]
    pub compress: bool,

    /// Seconds to wait for a command to finish
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(ref path) = self.socket_path {
            config.server.socket_path = Some(path.clone());
        }
        if let Some(ref path) = self.publish_path {
            config.server.publish_path = Some(path.clone());
        }
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if self.compress {
            config.compress = true;
        }
        if let Some(timeout) = self.timeout {
            config.server.timeout = timeout;
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the server daemon in the foreground
    Server {
        /// Number of commands and tasks that may run at once
        #[arg(long)]
        workers: Option<usize>,

        /// Path to the pid file
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Log one JSON object per line
        #[arg(long)]
        json_logs: bool,
    },

    /// Run a command on the server
    ///
    /// Arguments are parsed as JSON when they parse and taken as strings
    /// otherwise; `key=value` arguments are passed by keyword.
    Call {
        /// Command path or alias
        command: String,

        /// Positional and key=value arguments
        args: Vec<String>,
    },

    /// Publish an event
    Pub {
        /// Event name
        channel: String,

        /// key=value pairs forming the payload
        args: Vec<String>,
    },

    /// Print events as they are published
    Sub {
        /// Event name prefixes (all events when empty)
        prefixes: Vec<String>,
    },

    /// List the server's commands
    Commands,

    /// Show running commands and tasks
    Status,
}

/// Splits command-line words into positional and keyword arguments.
pub fn parse_arguments(words: &[String]) -> ClientResult<(Vec<Value>, Kwargs)> {
    let mut args = Vec::new();
    let mut kwargs = Kwargs::new();
    for word in words {
        match word.split_once('=') {
            Some((key, value)) if is_keyword(key) => {
                kwargs.insert(key.to_string(), parse_value(value));
            }
            _ if !kwargs.is_empty() => {
                return Err(ClientError::usage(format!(
                    "positional argument '{word}' follows a keyword argument"
                )));
            }
            _ => args.push(parse_value(word)),
        }
    }
    Ok((args, kwargs))
}

/// Like [`parse_arguments`] but every word must be `key=value`.
pub fn parse_keywords(words: &[String]) -> ClientResult<Kwargs> {
    let (args, kwargs) = parse_arguments(words)?;
    match args.first() {
        Some(extra) => Err(ClientError::usage(format!("expected key=value, got {extra}"))),
        None => Ok(kwargs),
    }
}

fn is_keyword(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(word: &str) -> Value {
    serde_json::from_str(word).unwrap_or_else(|_| Value::String(word.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn values_are_json_when_they_parse() {
        let (args, kwargs) =
            parse_arguments(&words(&["web1", "3", "[1,2]", "dry_run=true", "note=hi there"]))
                .unwrap();
        assert_eq!(args, vec![json!("web1"), json!(3), json!([1, 2])]);
        assert_eq!(kwargs.get("dry_run"), Some(&json!(true)));
        assert_eq!(kwargs.get("note"), Some(&json!("hi there")));
    }

    #[test]
    fn equals_inside_a_value_is_positional() {
        let (args, kwargs) = parse_arguments(&words(&["a==b", "--x=1"])).unwrap();
        assert_eq!(args, vec![json!("a==b"), json!("--x=1")]);
        assert!(kwargs.is_empty());
    }

    #[test]
    fn positional_after_keyword_is_rejected() {
        let err = parse_arguments(&words(&["k=1", "extra"])).unwrap_err();
        assert!(matches!(err, ClientError::Usage(_)));
    }

    #[test]
    fn pub_needs_keywords() {
        assert!(parse_keywords(&words(&["host=web1"])).is_ok());
        assert!(parse_keywords(&words(&["web1"])).is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let cli = Cli::try_parse_from([
            "steward",
            "--socket-path",
            "/tmp/s.sock",
            "--codec",
            "cbor",
            "--timeout",
            "3",
            "call",
            "ping",
        ])
        .unwrap();
        let mut config = ClientConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/s.sock"));
        assert_eq!(config.codec, Codec::Cbor);
        assert_eq!(config.server.timeout, 3);
        assert!(matches!(cli.command, Command::Call { ref command, .. } if command == "ping"));
    }
}
