//! Commands that talk to a running server.

use serde_json::{Value, json};
use tracing::debug;

use crate::cli::{parse_arguments, parse_keywords};
use crate::client::{Client, Reply};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::subscriber::Subscriber;

async fn connect(config: &ClientConfig) -> ClientResult<Client> {
    Ok(Client::connect(config.socket_path(), config.serializer())
        .await?
        .with_meta(config.meta.clone())
        .with_timeout(config.timeout()))
}

/// Runs one command, printing partials to stderr and the result to stdout.
pub async fn call(config: &ClientConfig, command: &str, words: &[String]) -> ClientResult<()> {
    let command = config.resolve_alias(command);
    let (args, kwargs) = parse_arguments(words)?;
    let client = connect(config).await?;

    let mut pending = client.call(command, args, kwargs).await?;
    loop {
        match pending.next().await? {
            Reply::Partial { tag, desc } => eprintln!("[{tag}] {desc}"),
            Reply::Done(value) => {
                if let Some(text) = render_value(&value) {
                    println!("{text}");
                }
                return Ok(());
            }
        }
    }
}

/// Publishes `channel` with the `key=value` words as payload.
pub async fn publish(config: &ClientConfig, channel: &str, words: &[String]) -> ClientResult<()> {
    let kwargs = parse_keywords(words)?;
    let client = connect(config).await?;
    client.cmd("pub", vec![json!(channel)], kwargs).await?;
    Ok(())
}

/// Lists the server's commands with the first line of their docs.
pub async fn commands(config: &ClientConfig) -> ClientResult<()> {
    let client = connect(config).await?;
    let listing = client.cmd("commands", Vec::new(), Default::default()).await?;
    println!("{}", render_listing(&listing)?);
    Ok(())
}

pub async fn status(config: &ClientConfig) -> ClientResult<()> {
    let client = connect(config).await?;
    let status = client.cmd("status", Vec::new(), Default::default()).await?;
    if let Some(text) = render_value(&status) {
        println!("{text}");
    }
    Ok(())
}

/// Prints events until the connection closes or Ctrl+C.
pub async fn subscribe(config: &ClientConfig, prefixes: &[String]) -> ClientResult<()> {
    let mut subscriber = Subscriber::connect(config.publish_path(), config.serializer()).await?;
    if prefixes.is_empty() {
        subscriber.subscribe("").await?;
    }
    for prefix in prefixes {
        subscriber.subscribe(prefix).await?;
    }

    loop {
        tokio::select! {
            event = subscriber.next_event() => {
                let event = event?;
                println!("{} {}", event.topic, event.payload);
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted, leaving");
                return Ok(());
            }
        }
    }
}

/// Text for a command result; `None` prints nothing.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.trim_end_matches('\n').to_string()),
        other => Some(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
    }
}

/// Renders `[[name, doc], ...]` as aligned lines.
pub fn render_listing(listing: &Value) -> ClientResult<String> {
    let malformed = || ClientError::Protocol("unexpected command listing".into());
    let rows = listing
        .as_array()
        .ok_or_else(malformed)?
        .iter()
        .map(|row| {
            let name = row.get(0).and_then(Value::as_str).ok_or_else(malformed)?;
            let doc = row.get(1).and_then(Value::as_str).unwrap_or_default();
            let summary = doc.trim().lines().next().unwrap_or_default();
            Ok((name, summary))
        })
        .collect::<ClientResult<Vec<_>>>()?;

    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    let lines: Vec<String> = rows
        .iter()
        .map(|(name, summary)| format!("{name:<width$}  {summary}").trim_end().to_string())
        .collect();
    Ok(lines.join("\n"))
}
