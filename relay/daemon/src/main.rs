//! Relay Daemon - Broadcast Relay Server
//!
//! Runs one relay process: subscribes to the broker, accepts tunnel clients
//! over TCP, and pushes every broker message to every connected client. Run
//! as many processes as needed behind a load balancer; with the Redis broker
//! each of them sees every message.
//!
//! # Usage
//!
//! ```bash
//! # Serve tunnels (default subcommand)
//! relay-daemon serve --listen 0.0.0.0:9001
//!
//! # Publish one message to every relay process
//! relay-daemon publish '{"intent":"lights.on"}'
//!
//! # Watch a relay as a tunnel client
//! relay-daemon watch --addr 127.0.0.1:9001 --count 5
//!
//! # With config file and verbose logging
//! RUST_LOG=debug relay-daemon --config /etc/voice-relay/relay.toml serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//!
//! # Exit Status
//!
//! Non-zero when the broker is unreachable at startup, or when the broker
//! subscription ends while serving.
//!
//! # Brokers
//!
//! The daemon needs Redis. The in-memory broker only reaches its own process,
//! and nothing inside the daemon publishes, so it is left to library users
//! who embed a relay next to their producer.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use relay_core::{
    load_config_from_path, Broker, BrokerKind, ConfigOverrides, QueueMessage, RedisBroker, Relay,
    RelayConfig, TransportError, TunnelClient, TunnelRequest,
};

use server::{DaemonServer, ServerConfig};

/// Relay Daemon - fans broker messages out to streaming clients
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    /// Broker implementation (memory, redis)
    #[arg(long, value_name = "KIND", global = true)]
    broker: Option<BrokerKind>,

    /// Redis address (host:port, or :port for localhost)
    #[arg(long, value_name = "ADDR", global = true)]
    redis_addr: Option<String>,

    /// Pub/sub channel name
    #[arg(long, value_name = "NAME", global = true)]
    channel: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept tunnel clients and relay broker messages to them
    Serve {
        /// Tunnel listen address
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Publish one message on the broker
    Publish {
        /// Message body; read from stdin when omitted
        body: Option<String>,
    },

    /// Connect as a tunnel client and print every message received
    Watch {
        /// Relay address to connect to
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,

        /// Client label sent in the handshake
        #[arg(long, default_value = "relay-watch")]
        client: String,

        /// Exit after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let tunnel_addr = match &self.command {
            Some(Command::Serve { listen }) => listen.clone(),
            _ => None,
        };
        ConfigOverrides {
            broker: self.broker,
            redis_addr: self.redis_addr.clone(),
            channel: self.channel.clone(),
            tunnel_addr,
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args
        .config
        .clone()
        .or_else(relay_core::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        broker = %config.broker,
        channel = %config.channel,
        source = %config.source(),
        "Configuration resolved"
    );
    Ok(config)
}

/// Build the configured broker
///
/// Probes Redis with backoff; an unreachable broker is fatal. The in-memory
/// broker is refused.
async fn build_broker(config: &RelayConfig) -> Result<Arc<dyn Broker>> {
    match config.broker {
        BrokerKind::Memory => bail!(
            "The in-memory broker only reaches its own process and nothing in the daemon \
             publishes to it; use --broker redis"
        ),
        BrokerKind::Redis => {
            let broker = RedisBroker::connect(&config.redis_addr, &config.connect_retry)
                .await
                .with_context(|| format!("Redis unreachable at {}", config.redis_addr))?
                .with_channel(config.channel.clone())
                .with_subscription_capacity(config.subscription_capacity);
            Ok(Arc::new(broker))
        }
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

async fn serve(config: RelayConfig) -> Result<()> {
    let broker = build_broker(&config).await?;
    let (relay, dispatcher) = Relay::new()
        .with_send_timeout(config.send_timeout())
        .attach(broker.as_ref())
        .await
        .context("Failed to start relay")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!(error = %e, "Signal handling unavailable"),
        }
        // A dropped sender reads as shutdown; hold it until the server is done
        shutdown_tx.closed().await;
    });

    let server = DaemonServer::new(
        ServerConfig {
            listen_addr: config.tunnel_addr.clone(),
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout(),
        },
        relay,
    );
    server.run(dispatcher, shutdown_rx).await
}

async fn publish(config: &RelayConfig, body: Option<String>) -> Result<()> {
    let broker = build_broker(config).await?;

    let body = match body {
        Some(body) => body.into_bytes(),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read message body from stdin")?;
            buf
        }
    };

    let len = body.len();
    broker
        .broadcast(QueueMessage::new(body))
        .await
        .context("Failed to publish message")?;

    info!(bytes = len, channel = %config.channel, "Message published");
    Ok(())
}

async fn watch(addr: &str, client: String, count: Option<usize>) -> Result<()> {
    let request = TunnelRequest {
        client: Some(client),
    };
    let mut tunnel = TunnelClient::connect(addr, &request)
        .await
        .with_context(|| format!("Failed to connect to relay at {addr}"))?;

    info!(addr, "Watching relay");

    let mut received = 0usize;
    while count.map_or(true, |max| received < max) {
        match tunnel.recv().await {
            Ok(response) => {
                received += 1;
                println!("{}", String::from_utf8_lossy(response.body()));
            }
            Err(TransportError::ConnectionClosed) => {
                info!(received, "Relay closed the tunnel");
                break;
            }
            Err(e) => return Err(e).context("Tunnel failed"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;

    let result = match args.command {
        None | Some(Command::Serve { .. }) => serve(config).await,
        Some(Command::Publish { body }) => publish(&config, body).await,
        Some(Command::Watch {
            addr,
            client,
            count,
        }) => {
            let addr = addr.unwrap_or_else(|| config.tunnel_addr.clone());
            watch(&addr, client, count).await
        }
    };

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay daemon stopped with error");
            Err(e)
        }
    }
}
