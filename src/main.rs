//! Stealth trap server
//!
//! Sits in front of a web origin, bans misbehaving IPs and proxies everything else.
//!
//! Configuration comes from a TOML file (`--config`); `--write-default-config`
//! writes the default file and exits. Log verbosity follows `RUST_LOG`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stealth_trap::ban_log::{DurableLog, SqliteLog};
use stealth_trap::cache::{MemoryCache, RedisCache, TtlCache};
use stealth_trap::config::{CacheBackend, Config};
use stealth_trap::geo::{GeoProvider, JsonCountryProvider};
use stealth_trap::maintenance::spawn_maintenance;
use stealth_trap::{TrapContext, TrapServer};

/// Stealth bot trap
#[derive(Parser, Debug)]
#[command(name = "stealth-trap")]
#[command(version)]
#[command(about = "Self-hosted bot trap and reverse proxy", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Write the default configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    if let Some(path) = &args.write_default_config {
        Config::default()
            .to_file(path)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            warn!("No config file given, using defaults");
            Config::default()
        }
    };

    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    config.validate()?;

    info!("Starting stealth trap v{}", env!("CARGO_PKG_VERSION"));
    if config.detection.test_mode {
        warn!("Test mode is on: violations are logged, nothing is blocked");
    }

    let cache: Arc<dyn TtlCache> = match config.storage.cache_backend {
        CacheBackend::Memory => {
            info!("Using in-process TTL cache");
            Arc::new(MemoryCache::new())
        }
        CacheBackend::Redis => {
            info!("Using Redis TTL cache at {}", config.storage.redis_url);
            Arc::new(RedisCache::new(&config.storage.redis_url).await?)
        }
    };

    let log: Arc<dyn DurableLog> = if config.storage.sqlite_path == ":memory:" {
        Arc::new(SqliteLog::open_in_memory()?)
    } else {
        info!("Ban log: {}", config.storage.sqlite_path);
        Arc::new(SqliteLog::open(&config.storage.sqlite_path)?)
    };

    let geo_timeout = Duration::from_secs(config.detection.geo_timeout_secs);
    let geo_providers: Vec<Arc<dyn GeoProvider>> = vec![
        Arc::new(JsonCountryProvider::ipapi_co(geo_timeout)?),
        Arc::new(JsonCountryProvider::ip2location(geo_timeout)?),
    ];

    let ctx = Arc::new(TrapContext::new(
        config.detection.clone(),
        cache,
        log,
        geo_providers,
    ));

    let _maintenance = spawn_maintenance(ctx.clone(), &config.maintenance);

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_addr))?;

    let server = Arc::new(TrapServer::new(&config, ctx));
    server
        .run_until(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
}
