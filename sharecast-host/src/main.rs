//! sharecast host — entry point.
//!
//! ```text
//! sharecast-host                   Run with sharecast-host.toml (or defaults)
//! sharecast-host --config <path>   Load a custom config TOML
//! sharecast-host --gen-config      Write default config to stdout
//! sharecast-host --code AB12CD     Share with a fixed invitation code
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sharecast_host::config::HostConfig;
use sharecast_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sharecast-host", about = "Share this screen with viewers holding an invitation code")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "sharecast-host.toml")]
    config: PathBuf,

    /// Override the listen address.
    #[arg(short, long)]
    listen: Option<String>,

    /// Use this invitation code instead of generating one.
    #[arg(long)]
    code: Option<String>,

    /// Limit the number of successful joins.
    #[arg(long)]
    max_uses: Option<u32>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen = listen;
    }
    if let Some(code) = cli.code {
        config.session.code = code;
    }
    if let Some(max_uses) = cli.max_uses {
        config.session.max_uses = max_uses;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sharecast-host v{}", env!("CARGO_PKG_VERSION"));
    info!("capture: {}x{} @ {} Hz", config.capture.width, config.capture.height, config.capture.rate_hz);

    let service = HostService::new(config);
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await
}
