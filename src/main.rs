//! nodegate - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use nodegate::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nodegate")]
#[command(version = VERSION)]
#[command(about = "Exit-node fleet registry and HTTP/SOCKS5 routing gateway")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Status API address (overrides config)
    #[arg(long = "ext-ctl")]
    external_controller: Option<String>,

    /// Status API secret (overrides config)
    #[arg(long = "secret")]
    secret: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs")]
    json_logs: bool,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("nodegate-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    // RUST_LOG wins over the config file
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(format!("nodegate={},tower_http=info", level)),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loaded = Config::load_async(&args.config).await;
    let level = loaded
        .as_ref()
        .ok()
        .and_then(|c| c.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level, args.json_logs)?;

    info!("nodegate v{}", VERSION);
    info!("loading configuration from: {}", args.config.display());

    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(ext_ctl) = args.external_controller {
        config.external_controller = Some(ext_ctl);
    }
    if let Some(secret) = args.secret {
        config.secret = Some(secret);
    }

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
