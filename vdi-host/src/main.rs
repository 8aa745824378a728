//! VDI host: entry point.
//!
//! ```text
//! vdi-host                   Run in the foreground
//! vdi-host --config <path>   Load a custom config TOML
//! vdi-host --gen-config      Write default config to stdout
//! vdi-host --init            Write default config to --config path
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vdi_core::HostService;
use vdi_host::config::HostFileConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vdi-host", about = "VDI host peer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vdi-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the config path and exit.
    #[arg(long)]
    init: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostFileConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.init {
        HostFileConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = HostFileConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.open_file()? {
        Some(file) => subscriber.with_writer(Mutex::new(file)).with_ansi(false).init(),
        None => subscriber.init(),
    }

    info!("vdi-host v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}", config.network.listen_address);
    info!("codecs: {:?}", config.capabilities.codecs);
    info!("frames: {} fps, {} bytes", config.frames.fps, config.frames.size);

    let service =
        HostService::bind(config.network.listen_address.as_str(), config.to_host_config()).await?;
    let handle = service.handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        handle.stop();
    });

    service.run().await;

    Ok(())
}
