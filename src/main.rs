//! sockmux CLI - runs a multiplexed echo server or talks to one.
//!
//! See the `sockmux` library for the protocol and channel types.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use sockmux::{
    Channel, Config, MultiplexedChannel, MultiplexedServer, MuxEvent, MuxServerEvent, SubChannel,
    SubChannelEvent,
};
use std::path::PathBuf;
use std::time::Duration;

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "sockmux")]
#[command(version)]
#[command(about = "Many logical sub-channels over one TCP connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multiplexed server that echoes every sub-channel message
    Serve {
        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Listen backlog (overrides config)
        #[arg(long)]
        max_pending: Option<u32>,
        /// Explicit config file instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send one message on a sub-channel and print the first reply
    Send {
        /// Server address, e.g. 127.0.0.1:7700
        addr: String,
        /// Sub-channel id
        subchannel: String,
        /// Message to send
        message: String,
        /// How long to wait for a reply
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("SOCKMUX_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_pending,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => {
                    let mut cfg = Config::load_from(&path)?;
                    cfg.apply_env_overrides();
                    cfg
                }
                None => Config::load()?,
            };
            if let Some(host) = host {
                cfg.host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(max_pending) = max_pending {
                cfg.max_pending = max_pending;
            }
            serve(&cfg).await
        }
        Commands::Send {
            addr,
            subchannel,
            message,
            timeout_ms,
        } => send(&addr, &subchannel, &message, Duration::from_millis(timeout_ms)).await,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    if !config.message_mode {
        bail!("serve requires message_mode = true");
    }

    let server = MultiplexedServer::bind(config.bind_addr())?;
    server.on_event(|event| match event {
        MuxServerEvent::Connect(mux) => attach_echo(mux),
        MuxServerEvent::Close { host } => log::info!("Server on {host} closed"),
    });
    server.start(config.max_pending)?;
    log::info!("Listening on {}", server.host());
    println!("sockmux listening on {}", server.host());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutdown signal received");
    server.close();
    Ok(())
}

fn attach_echo(mux: &MultiplexedChannel) {
    let peer = mux.peer_addr();
    log::info!("Client {peer} connected");

    mux.on_event(move |event| match event {
        MuxEvent::Subchannel(sub) => {
            log::info!("Client {peer} opened sub-channel {sub:?}");
            let echo = sub.clone();
            sub.on_event(move |event| match event {
                SubChannelEvent::Read(body) => echo_back(&echo, body),
                SubChannelEvent::Close => log::info!("Client {peer} closed {echo:?}"),
            });
        }
        MuxEvent::Channel(sockmux::ChannelEvent::Close) => {
            log::info!("Client {peer} disconnected");
        }
        MuxEvent::Channel(_) => {}
    });
}

fn echo_back(sub: &SubChannel, body: &[u8]) {
    if let Err(e) = sub.send(body) {
        log::warn!("Echo on {sub:?} failed: {e}");
    }
}

async fn send(addr: &str, subchannel: &str, message: &str, wait: Duration) -> Result<()> {
    if message.is_empty() {
        bail!("Message must not be empty");
    }

    let channel = Channel::connect(addr, true).await?;
    let mux = MultiplexedChannel::new(channel)?;
    let sub = mux.get_subchannel(subchannel)?;
    let mut replies = sub.subscribe();

    sub.send(message.as_bytes())?;

    let reply = tokio::time::timeout(wait, async {
        while let Some(event) = replies.recv().await {
            match event {
                SubChannelEvent::Read(body) => return Some(body),
                SubChannelEvent::Close => return None,
            }
        }
        None
    })
    .await;

    let result = match reply {
        Ok(Some(body)) => {
            println!("{}", String::from_utf8_lossy(&body));
            Ok(())
        }
        Ok(None) => Err(anyhow::anyhow!("Sub-channel closed before a reply arrived")),
        Err(_) => Err(anyhow::anyhow!("No reply within {}ms", wait.as_millis())),
    };

    sub.close();
    mux.close();
    result
}
