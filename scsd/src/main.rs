//! Shader Compile Server - daemon
//!
//! Accepts compile jobs over TCP, answers repeats from a content-addressed
//! cache, runs the native compiler for everything else, and reports
//! compiler errors by mail.

#![forbid(unsafe_code)]

mod cache;
mod config;
mod context;
mod dispatch;
mod error_log;
mod executor;
mod fallback;
mod mailer;
mod maintenance;
mod server;
mod shader_list;
mod stats;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use scs_common::{LogConfig, LogFormat, init_logging};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use cache::CompileCache;
use config::ServerConfig;
use context::ServerContext;

#[derive(Parser)]
#[command(name = "scsd")]
#[command(author, version, about = "Shader compile server - cached compile job daemon")]
struct Cli {
    /// Server root holding Cache/, Error/, ShaderList/, Temp/ and pid.txt
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Configuration file [default: <root>/config.ini]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Console log format (pretty or json)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Also write daily-rotated JSON logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c, running until killed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_format(cli.log_format);
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_log_dir(dir);
    }
    let _log_guards = init_logging(&log_config)?;

    info!("Starting shader compile server...");

    std::fs::create_dir_all(&cli.root)
        .with_context(|| format!("creating server root {}", cli.root.display()))?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join("config.ini"));
    let mut config = ServerConfig::load(&config_path, cli.root.clone())
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    debug!(config = %serde_json::to_string(&config)?, "effective configuration");

    for dir in [
        config.cache_dir(),
        config.error_dir(),
        config.shader_list_dir(),
        config.temp_dir.clone(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(config.pid_file(), std::process::id().to_string())
        .with_context(|| format!("writing {}", config.pid_file().display()))?;

    let cache = if config.caching {
        CompileCache::open(&config.cache_dir())?
    } else {
        info!("caching disabled");
        CompileCache::in_memory()
    };
    let stats = cache.stats();
    info!(
        entries = stats.entries,
        blobs = stats.blobs,
        log = ?cache.log_path(),
        "cache ready"
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(
        port = config.port,
        compilers = ?config.compilers.keys().collect::<Vec<_>>(),
        mail = config.mail_enabled(),
        "Listening"
    );

    let ctx = ServerContext::new(config, cache);
    if !ctx.fallback.is_empty() {
        info!(peers = ?ctx.fallback.peers(), threshold = ctx.config.fallback_threshold, "fallback servers");
    }

    let maintenance = maintenance::start(ctx.clone());
    server::serve(listener, ctx.clone(), shutdown_signal()).await;

    maintenance.abort();
    maintenance::flush_all(&ctx).await;

    info!(
        uptime_secs = ctx.started_at.elapsed().as_secs(),
        compiles = %serde_json::to_string(&ctx.stats.snapshot())?,
        cache = %serde_json::to_string(&ctx.cache.stats())?,
        "shader compile server stopped"
    );
    if let Err(err) = std::fs::remove_file(ctx.config.pid_file()) {
        warn!("failed to remove pid file: {err}");
    }
    Ok(())
}
