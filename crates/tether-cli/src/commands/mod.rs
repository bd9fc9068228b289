use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;

use tether_config::{ConfigLoader, LoggingConfig, TetherConfig, WarningSeverity};
use tether_core::{Event, TetherError};

mod demo;
#[cfg(feature = "webrtc")]
mod signal;

/// Tether: serverless peer mesh for media sessions
#[derive(Parser)]
#[command(name = "tether", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to tether.toml config file
    #[arg(short, long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Form an in-process mesh over the loopback transport
    Demo {
        /// Number of peers to join, one after another
        #[arg(short = 'n', long, default_value = "3")]
        peers: usize,

        /// Give every peer a synthetic camera stream
        #[arg(long)]
        media: bool,

        /// Print the connection table as JSON
        #[arg(long)]
        json: bool,

        /// Seconds to wait for the mesh to converge
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print a first offer, then read the answer from stdin
    Offer {
        /// Local peer identity (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Send a synthetic camera stream
        #[arg(long)]
        media: bool,
    },
    /// Read a first offer from stdin and print the answer
    Answer {
        /// Local peer identity (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Send a synthetic camera stream
        #[arg(long)]
        media: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration
    Doctor,
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> tether_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.logging.level.clone())
        };
        init_tracing(&config.logging, &log_level);

        match self.command {
            Commands::Demo {
                peers,
                media,
                json,
                timeout,
            } => demo::cmd_demo(config, peers, media, json, timeout).await,
            #[cfg(feature = "webrtc")]
            Commands::Offer { id, media } => signal::cmd_offer(&config_loader, id, media).await,
            #[cfg(feature = "webrtc")]
            Commands::Answer { id, media } => signal::cmd_answer(&config_loader, id, media).await,
            #[cfg(not(feature = "webrtc"))]
            Commands::Offer { .. } | Commands::Answer { .. } => Err(TetherError::Config(
                "this build has no network transport; rebuild with --features webrtc".into(),
            )),
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Doctor => Self::cmd_doctor(config, &config_loader),
            Commands::Version => Self::cmd_version(),
        }
    }

    fn cmd_config(config: TetherConfig, json: bool) -> tether_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| TetherError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: TetherConfig, loader: &ConfigLoader) -> tether_core::Result<()> {
        println!("{}", style("Tether Doctor: configuration audit").bold());
        println!("   Config file: {}", loader.path().display());
        if !loader.path().exists() {
            println!("   {}", style("(not found, using defaults)").dim());
        }
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            let line = w.to_string();
            match w.severity {
                WarningSeverity::Warning => {
                    warn_count += 1;
                    println!("  {}", style(line).yellow());
                }
                WarningSeverity::Info => {
                    info_count += 1;
                    println!("  {}", style(line).cyan());
                }
                WarningSeverity::Error => println!("  {}", style(line).red()),
            }
        }

        println!();
        println!(
            "  glare rule: {}, idle timeout: {}s, ICE gather timeout: {}",
            config.peer.glare_rule.as_str(),
            config.peer.idle_timeout_secs,
            match config.session.ice_gather_timeout() {
                Some(t) => format!("{}s", t.as_secs()),
                None => "unbounded".into(),
            }
        );
        #[cfg(not(feature = "webrtc"))]
        println!(
            "  {}",
            style("built without the webrtc feature, only the loopback transport is available")
                .dim()
        );
        println!("  {warn_count} warnings, {info_count} suggestions");

        Ok(())
    }

    fn cmd_version() -> tether_core::Result<()> {
        println!("Tether v{}", env!("CARGO_PKG_VERSION"));
        println!("   Rust edition: 2024");
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(feature = "webrtc")]
        println!("   Transports: loopback, webrtc");
        #[cfg(not(feature = "webrtc"))]
        println!("   Transports: loopback");
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }
}

fn init_tracing(logging: &LoggingConfig, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

/// One line per mesh event, for commands that follow a live peer.
fn describe_event(event: &Event) -> String {
    match event {
        Event::ConnectionAdded { peer_id, pending } => {
            if *pending {
                format!("+ connection {} (identity pending)", peer_id.short())
            } else {
                format!("+ connection {peer_id}")
            }
        }
        Event::ConnectionRekeyed { from, to } => format!("~ {} is {to}", from.short()),
        Event::ConnectionStateChanged { peer_id, state } => format!("  {peer_id}: {state}"),
        Event::ConnectionRemoved { peer_id, reason } => {
            format!("- connection {peer_id} ({reason:?})")
        }
        Event::LocalStreamAdded { stream_id } => format!("+ local stream {}", stream_id.short()),
        Event::LocalStreamRemoved { stream_id } => {
            format!("- local stream {}", stream_id.short())
        }
        Event::RemoteStreamAdded { peer_id, stream_id } => {
            format!("+ stream {} from {peer_id}", stream_id.short())
        }
        Event::RemoteStreamRemoved { peer_id, stream_id } => {
            format!("- stream {} from {peer_id}", stream_id.short())
        }
        Event::MessageRelayed { label, from, to } => format!("> relayed {label}: {from} -> {to}"),
        Event::Shutdown => "shut down".into(),
    }
}
