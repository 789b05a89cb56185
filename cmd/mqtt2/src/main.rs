//! mqtt2 CLI - publish and subscribe exactly once over MQTT 5.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mqtt2::{Client, ClientConfig, MqttConnection};

/// mqtt2 CLI - exactly-once (QoS 2) MQTT 5 client.
///
/// Connection settings come from a YAML connection section (--config) and
/// are overridden by the flags below.
#[derive(Parser)]
#[command(name = "mqtt2")]
#[command(about = "Exactly-once MQTT 5 client")]
#[command(version)]
pub struct Cli {
    /// Connection section file (YAML: host, port, timeout_ms, username, password)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Broker host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Client ID (default: mqtt2-<pid>)
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Username
    #[arg(long, global = true)]
    pub username: Option<String>,

    /// Password
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Connect and acknowledgment timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish one message
    Pub(PubCommand),
    /// Subscribe and print messages
    Sub(SubCommand),
}

#[derive(Args)]
pub struct PubCommand {
    /// Topic to publish to
    #[arg(short = 't', long)]
    topic: String,

    /// Message text
    #[arg(short = 'm', long)]
    message: String,
}

#[derive(Args)]
pub struct SubCommand {
    /// Topic filter to subscribe to
    #[arg(short = 't', long)]
    topic: String,

    /// Exit after this many messages
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

impl Cli {
    /// Merge the connection section with command line overrides.
    fn client_config(&self) -> Result<ClientConfig> {
        let mut conn = match &self.config {
            Some(path) => MqttConnection::from_yaml_file(path)
                .with_context(|| format!("failed to load {}", path))?,
            None => MqttConnection {
                host: "127.0.0.1".to_string(),
                ..Default::default()
            },
        };

        if let Some(host) = &self.host {
            conn.host = host.clone();
        }
        if self.port.is_some() {
            conn.port = self.port;
        }
        if self.username.is_some() {
            conn.username = self.username.clone();
        }
        if self.password.is_some() {
            conn.password = self.password.clone();
        }
        if self.timeout_ms.is_some() {
            conn.timeout_ms = self.timeout_ms;
        }

        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt2-{}", std::process::id()));

        // A one-shot CLI client does not keep a broker session.
        Ok(conn.client_config(client_id).with_clean_start(true))
    }
}

impl PubCommand {
    async fn run(&self, cli: &Cli) -> Result<()> {
        let client = Client::new(cli.client_config()?)?;

        client
            .publish_str(&self.topic, &self.message)
            .await
            .with_context(|| format!("publish to {} failed", self.topic))?;
        info!("Published {} bytes to {}", self.message.len(), self.topic);

        client.disconnect().await?;
        Ok(())
    }
}

impl SubCommand {
    async fn run(&self, cli: &Cli) -> Result<()> {
        let client = Client::new(cli.client_config()?)?;

        let stream = client
            .subscribe_stream(&self.topic)
            .await
            .with_context(|| format!("subscribe to {} failed", self.topic))?;
        info!("Subscribed to {}", self.topic);

        let mut stream = match self.count {
            Some(n) => stream.take(n).boxed(),
            None => stream.boxed(),
        };

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    match msg.payload_str() {
                        Some(text) => println!("{}: {}", msg.topic, text),
                        None => println!("{}: <{} bytes>", msg.topic, msg.payload.len()),
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        tokio::time::timeout(Duration::from_secs(5), client.disconnect())
            .await
            .context("disconnect timed out")??;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Pub(cmd) => cmd.run(&cli).await,
        Commands::Sub(cmd) => cmd.run(&cli).await,
    }
}
