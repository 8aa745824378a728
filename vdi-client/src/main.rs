//! VDI client: entry point.
//!
//! ```text
//! vdi-client                      Connect to the configured resource
//! vdi-client --resource <name>    Override the resource to open
//! vdi-client --token <token>      Override the session token
//! vdi-client --config <path>      Load a custom config TOML
//! vdi-client --gen-config         Write default config to stdout
//! vdi-client --init               Write default config to --config path
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vdi_client::config::ClientConfig;
use vdi_core::{Session, SessionManager, SessionToken};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vdi-client", about = "VDI remote desktop session client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vdi-client.toml")]
    config: PathBuf,

    /// Resource to open, overriding `connection.resource`.
    #[arg(short, long)]
    resource: Option<String>,

    /// Session token, overriding `connection.token`.
    #[arg(short, long)]
    token: Option<String>,

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
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.init {
        ClientConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(resource) = cli.resource {
        config.connection.resource = resource;
    }
    if let Some(token) = cli.token {
        config.connection.token = token;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.open_file()? {
        Some(file) => subscriber.with_writer(Mutex::new(file)).with_ansi(false).init(),
        None => subscriber.init(),
    }

    info!("vdi-client v{}", env!("CARGO_PKG_VERSION"));
    info!("resource: {}", config.connection.resource);
    info!("tls: {}", config.connection.tls);

    let manager = SessionManager::new(
        config.connector()?,
        Arc::new(config.resolver()),
        config.to_session_config(),
    );
    let session = manager.connect(
        config.connection.resource.as_str(),
        SessionToken::new(config.connection.token.clone()),
    )?;
    let id = session.id();

    let states = tokio::spawn(log_states(session.clone()));
    let mut quality = Box::pin(manager.observe_quality(id)?);
    tokio::spawn(async move {
        while let Some(sample) = quality.next().await {
            info!(
                latency_ms = sample.latency_ms,
                loss = format!("{:.3}", sample.loss_rate),
                class = %sample.classification,
                "quality"
            );
        }
    });

    match session.established().await {
        Ok(caps) => info!(codec = ?caps.preferred_codec(), "session established"),
        Err(e) => {
            error!("connect failed: {e}");
            let _ = states.await;
            return Err(e.into());
        }
    }

    let mut terminal = session.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, disconnecting");
            manager.disconnect(id).await?;
        }
        _ = terminal.wait_for(|s| s.is_terminal()) => {}
    }
    let _ = states.await;

    let d = session.diagnostics();
    info!(
        frames = d.frames_delivered,
        missing = d.frames_missing,
        reconnects = d.reconnect_attempts,
        dropped = d.packets_dropped,
        "session finished"
    );

    match session.last_error() {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

async fn log_states(session: Session) {
    let mut states = Box::pin(session.state_stream());
    while let Some(state) = states.next().await {
        match session.last_error() {
            Some(failure) if state.is_terminal() => warn!(%state, "session ended: {failure}"),
            _ => info!(%state, "session state"),
        }
    }
}
