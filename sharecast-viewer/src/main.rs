//! sharecast viewer — entry point.
//!
//! ```text
//! sharecast-viewer --code AB12CD                 Join the host in the config
//! sharecast-viewer --code AB12CD --host <addr>   Join a specific host
//! sharecast-viewer --gen-config                  Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sharecast_core::ViewerClient;
use sharecast_viewer::config::ViewerConfig;
use sharecast_viewer::watch::watch;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sharecast-viewer", about = "Watch a shared screen using an invitation code")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "sharecast-viewer.toml")]
    config: PathBuf,

    /// Host address (overrides config). Example: 192.168.1.100:7340
    #[arg(long)]
    host: Option<String>,

    /// Invitation code.
    #[arg(long, required_unless_present = "gen_config")]
    code: Option<String>,

    /// Name shown to the host (overrides config).
    #[arg(long)]
    identity: Option<String>,

    /// Leave after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ViewerConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.network.host_address = host;
    }
    if let Some(identity) = cli.identity {
        config.network.identity = identity;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sharecast-viewer v{}", env!("CARGO_PKG_VERSION"));

    let code = cli.code.unwrap_or_default();
    let mut client = ViewerClient::join_with(
        config.network.host_address.as_str(),
        &code,
        &config.network.identity,
        config.to_client_config(),
    )
    .await?;
    info!(session = %client.session_id(), "streaming from {}", config.network.host_address);

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, leaving");
        ctrl_c.cancel();
    });

    let summary = watch(&mut client, cli.frames, stop).await?;
    info!(
        frames = summary.frames,
        keyframes = summary.keyframes,
        skipped = summary.skipped,
        bytes = summary.bytes,
        elapsed = ?summary.elapsed,
        "done"
    );
    match summary.closed {
        Some(reason) => info!("host ended the stream: {reason}"),
        None => client.leave().await?,
    }
    Ok(())
}
