// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use reelcache::cache::CacheStore;
use reelcache::catalog::MemoryCatalog;
use reelcache::config::{default_config_path, load_config, save_config, Config, SourceConfig};
use reelcache::download::DownloadPipeline;
use reelcache::events::{EventLog, FileEventLog, MemoryEventLog, TracingEventLog};
use reelcache::lanserver::{LanServer, DEFAULT_LAN_PORT};
use reelcache::server::Server;
use reelcache::stream::StreamProxy;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// reelcache - Video streaming proxy with a bounded local cache.
#[derive(Parser)]
#[command(name = "reelcache")]
#[command(version = VERSION)]
#[command(about = "Video streaming proxy with a bounded local cache.")]
#[command(long_about = "reelcache - Video streaming proxy with a bounded local cache\n\n\
    Start the server:    reelcache\n\
    Cache usage:         reelcache cache stats\n\
    Configure:           reelcache config show\n\
    Share a folder:      reelcache lan-serve --root /media/videos\n\n\
    Watched videos are kept on disk; the next one is fetched ahead of time.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.reelcache/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the playback server (default)
    ///
    /// Examples:
    ///   reelcache serve
    ///   reelcache serve --port 8080 --bind 0.0.0.0
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect or clear the video cache
    Cache {
        #[command(subcommand)]
        command: Option<CacheCommands>,
    },

    /// Show recorded cache events
    Events {
        /// Number of most recent events to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Configure settings
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },

    /// Serve a local media folder to other reelcache instances on the LAN
    ///
    /// Examples:
    ///   reelcache lan-serve --root D:\KidsVideos --token secret
    LanServe {
        /// Folder to expose
        #[arg(long)]
        root: PathBuf,
        /// Shared token required in the x-auth-token header
        #[arg(long)]
        token: Option<String>,
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_LAN_PORT)]
        port: u16,
        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum CacheCommands {
    /// Show cache usage (default)
    Stats,
    /// Delete every cached video
    Clear,
}

#[derive(Subcommand, Clone, Copy)]
enum ConfigCommands {
    /// Show the effective configuration (default)
    Show,
    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "[✗]".red().bold(), e);
        std::process::exit(exit_codes::ERROR);
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_filter = if verbose {
        "reelcache=debug,tower_http=debug"
    } else if quiet {
        "reelcache=warn"
    } else {
        "reelcache=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();

    match cli.command {
        None => serve(load_config(config_path.as_deref())?, None, None).await,
        Some(Commands::Serve { port, bind }) => serve(load_config(config_path.as_deref())?, port, bind).await,
        Some(Commands::Cache { command }) => {
            let config = load_config(config_path.as_deref())?;
            handle_cache(&config, command.unwrap_or(CacheCommands::Stats))
        }
        Some(Commands::Events { limit }) => {
            let config = load_config(config_path.as_deref())?;
            show_events(&config, limit)
        }
        Some(Commands::Config { command }) => {
            let path = config_path.unwrap_or_else(default_config_path);
            handle_config(&path, command.unwrap_or(ConfigCommands::Show))
        }
        Some(Commands::LanServe { root, token, port, bind }) => {
            LanServer::new(root, token)
                .with_port(port)
                .with_bind_address(bind)
                .start()
                .await
        }
    }
}

fn build_event_log(config: &Config) -> Result<Arc<dyn EventLog>> {
    let events: Arc<dyn EventLog> = match &config.event_log_path {
        Some(path) => Arc::new(FileEventLog::open(path.clone())?),
        None => Arc::new(MemoryEventLog::default()),
    };
    Ok(events)
}

async fn serve(mut config: Config, port: Option<u16>, bind: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }

    let Some(source_config) = config.source.as_ref() else {
        eprintln!(
            "{} No remote source configured. Add a \"source\" section to {}",
            "[✗]".red().bold(),
            default_config_path().display()
        );
        std::process::exit(exit_codes::CONFIG);
    };
    let source = reelcache::remote::from_config(source_config)?;

    let events = build_event_log(&config)?;
    let store = Arc::new(
        CacheStore::open(config.cache.cache_dir(), config.cache.capacity_bytes(), events.clone())
            .context("Failed to open cache")?,
    );
    let catalog = Arc::new(MemoryCatalog::load(&config.catalog_path())?);
    let pipeline = DownloadPipeline::start(store.clone(), source.clone(), events.clone());
    let proxy = StreamProxy::new(store.clone(), pipeline, source, catalog.clone(), config.cache.prefetch_next);

    println!();
    println!("{}", format!("=== reelcache v{} ===", VERSION).bright_cyan().bold());
    println!("  Source:   {}", describe_source(source_config));
    println!("  Catalog:  {} videos", catalog.len());
    println!(
        "  Cache:    {} of {} used ({})",
        format_bytes(store.total_bytes()),
        format_bytes(store.capacity_bytes()),
        store.dir().display()
    );
    println!("  Prefetch: {}", if config.cache.prefetch_next { "on" } else { "off" });
    println!(
        "  Listening on {}",
        format!("http://{}:{}", config.bind_address, config.port).green()
    );
    println!();

    let served = Server::new(proxy, events)
        .with_port(config.port)
        .with_bind_address(config.bind_address)
        .start()
        .await;
    if let Err(e) = store.flush() {
        tracing::warn!("Failed to write cache index on shutdown: {}", e);
    }
    served
}

fn handle_cache(config: &Config, command: CacheCommands) -> Result<()> {
    let store = CacheStore::attach(
        config.cache.cache_dir(),
        config.cache.capacity_bytes(),
        Arc::new(TracingEventLog),
    )
    .context("Failed to open cache")?;

    match command {
        CacheCommands::Stats => {
            let stats = store.stats();
            println!();
            println!("{}", "=== Cache Statistics ===".bright_cyan().bold());
            println!();
            println!("  Videos cached:  {}", stats.completed.to_string().bold());
            if stats.in_progress > 0 {
                println!("  Downloading:    {}", stats.in_progress);
            }
            println!(
                "  Used:           {} of {} ({:.1}%)",
                format_bytes(stats.total_bytes),
                format_bytes(stats.capacity_bytes),
                stats.usage_percent()
            );
            println!("  Location:       {}", store.dir().display().to_string().dimmed());
            println!();
        }
        CacheCommands::Clear => {
            let (removed, freed) = store.clear().context("Failed to clear cache")?;
            if removed == 0 {
                println!("{} Cache is already empty", "[i]".cyan());
            } else {
                println!(
                    "{} Removed {} videos, freed {}",
                    "[✓]".green(),
                    removed,
                    format_bytes(freed)
                );
            }
        }
    }
    Ok(())
}

fn show_events(config: &Config, limit: usize) -> Result<()> {
    let Some(path) = &config.event_log_path else {
        println!(
            "{} No event_log_path configured; events are only kept in the running server (GET /cache/events)",
            "[i]".cyan()
        );
        return Ok(());
    };
    let log = FileEventLog::open(path.clone())?;
    let events = log.read_all()?;
    let skip = events.len().saturating_sub(limit);
    for event in events.iter().skip(skip) {
        let kind = if event.kind.is_failure() {
            event.kind.as_str().yellow()
        } else {
            event.kind.as_str().normal()
        };
        println!(
            "{}  {:<18}  {}",
            event.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            kind,
            event.message
        );
    }
    if events.is_empty() {
        println!("{} No events recorded yet", "[i]".cyan());
    }
    Ok(())
}

fn handle_config(path: &std::path::Path, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = load_config(Some(path))?;
            println!();
            println!("{}", "=== reelcache Configuration ===".bright_cyan().bold());
            println!();
            println!(
                "  Source:         {}",
                config
                    .source
                    .as_ref()
                    .map(describe_source)
                    .unwrap_or_else(|| "(not set)".dimmed().to_string())
            );
            println!("  Listen:         {}:{}", config.bind_address, config.port);
            println!("  Cache dir:      {}", config.cache.cache_dir().display());
            println!("  Cache capacity: {}", format_bytes(config.cache.capacity_bytes()));
            println!("  Prefetch next:  {}", config.cache.prefetch_next);
            println!("  Catalog:        {}", config.catalog_path().display());
            if let Some(events) = &config.event_log_path {
                println!("  Event log:      {}", events.display());
            }
            println!();
            println!("Config file: {}", path.display());
            println!();
        }
        ConfigCommands::Init => {
            if path.exists() {
                println!("{} Config already exists at {}", "[i]".cyan(), path.display());
                return Ok(());
            }
            save_config(&Config::default(), path)?;
            println!("{} Wrote default config to {}", "[✓]".green(), path.display());
        }
    }
    Ok(())
}

/// Source summary without credentials.
fn describe_source(source: &SourceConfig) -> String {
    match source {
        SourceConfig::CloudDrive { api_base, .. } => format!("cloud drive ({})", api_base),
        SourceConfig::Lan { base_url, token } => format!(
            "LAN server {}{}",
            base_url,
            if token.as_deref().is_some_and(|t| !t.is_empty()) {
                " (token set)"
            } else {
                ""
            }
        ),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
