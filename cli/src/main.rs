// signal-bridge: operator CLI for the signal bridge relay
//
// Generates shared secrets, signs and checks envelopes by hand, manages the
// relay/client config file, and runs an in-process relay demo.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rand::RngCore;
use signal_bridge_core::{
    now_ms, verify, BridgeClient, ClientConfig, ClientTransport, Envelope, MemoryNetwork,
    RelayNode, ReplayGuard, SharedSecret,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "signal-bridge")]
#[command(about = "Signal Bridge: trust-mediating message relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random shared secret
    Keygen {
        #[arg(short, long, default_value = "32")]
        bytes: usize,
    },
    /// Build and sign an envelope, printing it as JSON
    Sign {
        /// Message type
        #[arg(short = 't', long = "type")]
        message_type: String,
        /// JSON payload
        #[arg(short, long, default_value = "null")]
        payload: String,
        /// Sender id
        #[arg(short, long)]
        source: String,
        /// Shared secret (overrides the config file)
        #[arg(long)]
        secret: Option<String>,
    },
    /// Check an envelope's signature and freshness
    Verify {
        /// Envelope JSON file, or stdin when omitted
        file: Option<PathBuf>,
        /// Shared secret (overrides the config file)
        #[arg(long)]
        secret: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a relay and a few clients in-process and exchange messages
    Demo {
        #[arg(short = 'n', long, default_value = "3")]
        clients: usize,
        #[arg(short, long, default_value = "2")]
        messages: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Keygen { bytes } => cmd_keygen(bytes),
        Commands::Sign {
            message_type,
            payload,
            source,
            secret,
        } => {
            let config = config::Config::load(config_path)?;
            cmd_sign(&config, &message_type, &payload, &source, secret)
        }
        Commands::Verify { file, secret } => {
            let config = config::Config::load(config_path)?;
            cmd_verify(&config, file, secret)
        }
        Commands::Config { action } => cmd_config(config_path, action),
        Commands::Demo { clients, messages } => {
            let config = config::Config::load(config_path)?;
            cmd_demo(&config, clients, messages).await
        }
    }
}

fn resolve_secret(config: &config::Config, flag: Option<String>) -> Result<SharedSecret> {
    let secret = match flag {
        Some(text) => SharedSecret::from_text(&text),
        None => config.client.secret.clone(),
    };
    if secret.is_empty() {
        anyhow::bail!(
            "No shared secret configured; pass --secret or run `signal-bridge config set secret <value>`"
        );
    }
    Ok(secret)
}

fn cmd_keygen(bytes: usize) -> Result<()> {
    if bytes == 0 {
        anyhow::bail!("Secret length must be non-zero");
    }
    let mut key = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut key);
    println!("{}", hex::encode(&key));
    Ok(())
}

fn cmd_sign(
    config: &config::Config,
    message_type: &str,
    payload: &str,
    source: &str,
    secret: Option<String>,
) -> Result<()> {
    let secret = resolve_secret(config, secret)?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let envelope = Envelope::signed(message_type, payload, source, &secret)
        .context("Failed to sign envelope")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("Failed to serialize envelope")?
    );
    Ok(())
}

fn cmd_verify(config: &config::Config, file: Option<PathBuf>, secret: Option<String>) -> Result<()> {
    let secret = resolve_secret(config, secret)?;

    let raw = match file {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    let envelope = signal_bridge_core::decode_envelope(&raw).context("Not a valid envelope")?;

    let signature_ok = verify(&envelope, &secret);
    let mut guard =
        ReplayGuard::with_skew(config.client.replay_window_ms, config.client.clock_skew_ms());
    let freshness = guard.check(&envelope.nonce, envelope.timestamp, now_ms());

    println!("{}", "Envelope".bold());
    println!("  ID:        {}", envelope.id);
    println!("  Type:      {}", envelope.message_type.bright_cyan());
    println!("  Source:    {}", envelope.source_id);
    println!("  Timestamp: {}", envelope.timestamp);
    if signature_ok {
        println!("  {} Signature valid", "✓".green());
    } else {
        println!("  {} Signature invalid", "✗".red());
    }
    match freshness {
        Ok(()) => println!("  {} Within replay window", "✓".green()),
        Err(reason) => println!("  {} {}", "✗".red(), reason),
    }

    if !signature_ok {
        anyhow::bail!("Verification failed");
    }
    Ok(())
}

fn cmd_config(path: Option<&std::path::Path>, action: ConfigAction) -> Result<()> {
    let file = match path {
        Some(path) => path.to_path_buf(),
        None => config::Config::config_file()?,
    };

    match action {
        ConfigAction::Path => {
            println!("{}", file.display());
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load(path)?;
            match config.get(&key) {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = if file.exists() {
                config::Config::load_from(&file)?
            } else {
                config::Config::default()
            };
            config.set(&key, &value)?;
            config.save_to(&file)?;
            println!("{} {} updated", "✓".green(), key.bright_cyan());
        }
        ConfigAction::List => {
            let config = config::Config::load(path)?;
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:28} {}", key, value.bright_yellow());
            }
        }
    }
    Ok(())
}

async fn cmd_demo(config: &config::Config, clients: usize, messages: usize) -> Result<()> {
    if clients < 2 {
        anyhow::bail!("The demo needs at least two clients");
    }

    let secret = if config.relay.secret.is_empty() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        SharedSecret::from_bytes(&key)
    } else {
        config.relay.secret.clone()
    };

    let relay_origin = "https://bridge.local";
    let origins: Vec<String> = (0..clients)
        .map(|i| format!("https://peer-{}.local", i))
        .collect();

    let mut relay_config = config.relay.clone();
    relay_config.secret = secret.clone();
    relay_config.allowed_origins = origins.clone();
    tracing::debug!("Demo relay config: {:?}", relay_config);

    println!("{}", "Starting in-process relay...".bold());
    let network = MemoryNetwork::new();
    let inbound = network.bind_endpoint(&relay_config.relay_id, relay_origin)?;
    let broadcast = network.broadcast(relay_origin, &relay_config.channel_name);
    let node = RelayNode::new(relay_config.clone(), Arc::new(broadcast))
        .context("Invalid relay configuration")?;
    let relay = Arc::new(node).spawn(inbound);
    println!("  {} Relay {} at {}", "✓".green(), relay_config.relay_id.bright_cyan(), relay_origin);

    let mut peers = Vec::new();
    for (i, origin) in origins.iter().enumerate() {
        let client_config = ClientConfig {
            client_id: Some(format!("peer-{}", i)),
            relay_endpoint: relay_config.relay_id.clone(),
            allowed_origins: vec![relay_origin.to_string()],
            secret: secret.clone(),
            channel_name: relay_config.channel_name.clone(),
            ..config.client.clone()
        };
        let transport = ClientTransport {
            connector: Arc::new(network.connector(origin, &relay_config.relay_id)),
            broadcast: Arc::new(network.broadcast(origin, &relay_config.channel_name)),
        };
        let client = BridgeClient::new(client_config, transport)?;

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let name = client.client_id().to_string();
        client.on_message(move |envelope| {
            counter.fetch_add(1, Ordering::Relaxed);
            println!(
                "  {} {} <- {} {}",
                "•".bright_green(),
                name.bright_cyan(),
                envelope.source_id,
                envelope.payload.to_string().dimmed()
            );
        });

        client
            .ensure_handshake()
            .await
            .with_context(|| format!("{} failed to register", client.client_id()))?;
        println!("  {} {} registered from {}", "✓".green(), client.client_id().bright_cyan(), origin);
        peers.push((client, received));
    }

    println!();
    println!("{}", "Exchanging messages...".bold());
    for seq in 0..messages {
        for (client, _) in &peers {
            client
                .send("demo", serde_json::json!({ "seq": seq }))
                .await
                .context("Send failed")?;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!();
    println!("{}", "Summary".bold());
    let expected = (clients - 1) * messages;
    for (client, received) in &peers {
        let count = received.load(Ordering::Relaxed);
        let mark = if count == expected { "✓".green() } else { "✗".red() };
        println!("  {} {} received {}/{}", mark, client.client_id(), count, expected);
    }

    let stats = relay.node().stats();
    println!("  Accepted:   {}", stats.envelopes_accepted);
    println!("  Rejected:   {}", stats.envelopes_rejected);
    println!("  Deliveries: {}", stats.deliveries);

    for (client, _) in &peers {
        client.destroy();
    }
    relay.shutdown().await;
    Ok(())
}
