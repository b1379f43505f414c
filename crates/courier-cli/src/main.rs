//! # courier
//!
//! Manual client for the shared messaging transport: listen on a user's
//! topic, send a single message, or print the effective settings.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use courier_core::{CredentialSource, EnvToken, MessageEnvelope, StaticToken, Topic};
use courier_settings::CourierSettings;
use courier_transport::{ConnectionManager, ConnectionState, ConsumerCallbacks, TransportConfig};
use tracing::{info, warn};

/// Courier messaging client.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Courier messaging client", version)]
struct Cli {
    /// Settings file (default: ~/.courier/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Broker URL, overriding settings.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer token (default: $COURIER_TOKEN).
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every message for a user as JSON lines until Ctrl-C.
    Listen {
        /// Recipient whose topic to follow.
        #[arg(long)]
        user: String,
    },
    /// Send one message.
    Send {
        /// Sender id.
        #[arg(long)]
        from: String,
        /// Recipient id.
        #[arg(long)]
        to: String,
        /// Message content.
        #[arg(long)]
        text: String,
        /// Message type.
        #[arg(long, default_value = courier_core::DEFAULT_MESSAGE_KIND)]
        kind: String,
    },
    /// Print the effective settings as JSON.
    Config,
}

impl Cli {
    fn load_settings(&self) -> Result<CourierSettings> {
        let mut settings = match &self.settings {
            Some(path) => courier_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => courier_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(url) = &self.url {
            settings.transport.url.clone_from(url);
            settings.validate().context("Invalid --url")?;
        }
        Ok(settings)
    }

    fn credentials(&self) -> Arc<dyn CredentialSource> {
        match &self.token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(EnvToken::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    if let Err(e) = courier_logging::init_logging(&settings.logging) {
        eprintln!("courier: logging disabled: {e}");
    }

    match &cli.command {
        Command::Config => print_config(&settings),
        Command::Listen { user } => {
            let manager = build_manager(&settings, cli.credentials());
            listen(&manager, user).await
        }
        Command::Send {
            from,
            to,
            text,
            kind,
        } => {
            let manager = build_manager(&settings, cli.credentials());
            let envelope = MessageEnvelope::new(from.as_str(), to.as_str(), text.as_str(), kind.as_str());
            send_once(&manager, &envelope).await
        }
    }
}

fn build_manager(
    settings: &CourierSettings,
    credentials: Arc<dyn CredentialSource>,
) -> ConnectionManager {
    ConnectionManager::websocket(TransportConfig::from_settings(&settings.transport), credentials)
}

fn print_config(settings: &CourierSettings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
    println!("{json}");
    Ok(())
}

async fn listen(manager: &ConnectionManager, user: &str) -> Result<()> {
    let topic = Topic::for_recipient(user);
    let callbacks = ConsumerCallbacks::new()
        .on_message(|envelope| match envelope.to_json() {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to print message"),
        })
        .on_error(|error| warn!(error = %error, kind = error.error_kind(), "connection error"))
        .on_connected(|| info!("connected"));
    let handle = manager
        .attach(&topic, callbacks)
        .context("Failed to attach listener")?;
    info!(%topic, "listening, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    let _ = handle.detach();
    info!(stats = ?manager.stats(), "stopped");
    Ok(())
}

async fn send_once(manager: &ConnectionManager, envelope: &MessageEnvelope) -> Result<()> {
    let topic = Topic::for_recipient(&envelope.sender_id);
    let handle = manager
        .attach(&topic, ConsumerCallbacks::new())
        .context("Failed to attach sender")?;

    // one connect timeout for the socket, one for CONNECTED
    let wait = manager.config().connect_timeout * 2;
    if !manager.wait_for_state(ConnectionState::Connected, wait).await {
        bail!(
            "Not connected to {} after {:?} (state: {})",
            manager.config().url,
            wait,
            manager.state()
        );
    }
    handle.send(envelope).await.context("Failed to send message")?;
    info!(recipient_id = %envelope.recipient_id, "message sent");
    let _ = handle.detach();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_send() {
        let cli = Cli::try_parse_from([
            "courier", "send", "--from", "U1", "--to", "U2", "--text", "hi",
        ])
        .unwrap();
        match cli.command {
            Command::Send { from, to, text, kind } => {
                assert_eq!((from.as_str(), to.as_str(), text.as_str()), ("U1", "U2", "hi"));
                assert_eq!(kind, "TEXT");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "courier",
            "listen",
            "--user",
            "U1",
            "--url",
            "ws://example:9000/ws",
            "--token",
            "t",
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("ws://example:9000/ws"));
        assert_eq!(cli.token.as_deref(), Some("t"));
    }

    #[test]
    fn send_requires_text() {
        assert!(Cli::try_parse_from(["courier", "send", "--from", "U1", "--to", "U2"]).is_err());
    }

    #[test]
    fn url_flag_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"transport": {{"url": "ws://from-file:1/ws"}}}}"#).unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["courier", "--settings", path, "config"]).unwrap();
        assert!(cli.load_settings().unwrap().transport.url.starts_with("ws://"));

        let cli = Cli::try_parse_from([
            "courier",
            "--settings",
            path,
            "--url",
            "wss://override/ws",
            "config",
        ])
        .unwrap();
        assert_eq!(cli.load_settings().unwrap().transport.url, "wss://override/ws");
    }

    #[test]
    fn bad_url_flag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let cli = Cli::try_parse_from([
            "courier",
            "--settings",
            path.to_str().unwrap(),
            "--url",
            "http://nope",
            "config",
        ])
        .unwrap();
        assert!(cli.load_settings().is_err());
    }

    #[test]
    fn token_flag_wins() {
        let cli = Cli::try_parse_from(["courier", "--token", "abc", "config"]).unwrap();
        assert!(cli.credentials().bearer_token().is_some());
    }
}
