//! LED driver fleet host entry point.
//!
//! Loads the configuration, seeds the registry and starts one controller
//! session per configured serial port, then runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML from --config, defaults if missing
//!  └─ RegistryStore          -- seeded from [[controllers]]
//!  └─ start services
//!       ├─ one session task per controller with a port (serial link)
//!       └─ button engine     (CAN button reports → learning, toggles, ramps)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ledlink_host::application::buttons::spawn_button_engine;
use ledlink_host::application::link::LinkConnector;
use ledlink_host::application::registry_store::RegistryStore;
use ledlink_host::application::session::{spawn_session, SessionPool};
use ledlink_host::infrastructure::api_bridge::EngineState;
use ledlink_host::infrastructure::storage::config::{load_config, render_config};
use ledlink_host::infrastructure::transport::serial::SerialConnector;
use ledlink_core::ControllerInput;

/// Button reports buffered between the sessions and the button engine.
const BUTTON_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "ledlink-host", version, about = "Runs controller sessions for an LED driver fleet")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "LEDLINK_CONFIG", default_value = "ledlink.toml")]
    config: PathBuf,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.print_config {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(config = %cli.config.display(), "ledlink host starting");

    // ── Registry ──────────────────────────────────────────────────────────────
    let store = RegistryStore::default();
    let seeded = store
        .seed_controllers(config.controllers.iter().map(ControllerInput::from))
        .await
        .context("seeding controllers from config")?;
    info!(controllers = seeded.len(), "registry seeded");

    // ── Sessions ──────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let sessions = SessionPool::new();
    let session_config = config.engine.session_config();
    let (button_tx, button_rx) = mpsc::channel(BUTTON_QUEUE_DEPTH);
    let mut tasks = Vec::new();

    for controller in &seeded {
        let Some(port) = controller.port.clone() else {
            warn!(controller_id = %controller.id, "no port configured; session not started");
            continue;
        };
        let connector: Arc<dyn LinkConnector> = Arc::new(SerialConnector::new(port, controller.baudrate));
        info!(controller_id = %controller.id, link = %connector.describe(), "starting session");
        let (handle, task) = spawn_session(
            controller.id.clone(),
            connector,
            store.clone(),
            session_config.clone(),
            Some(button_tx.clone()),
            cancel.child_token(),
        );
        sessions.insert(handle).await;
        tasks.push(task);
    }
    drop(button_tx);

    // ── Buttons ───────────────────────────────────────────────────────────────
    let state = EngineState::new(store, sessions);
    tasks.push(spawn_button_engine(
        Arc::clone(&state.dispatcher),
        button_rx,
        cancel.child_token(),
    ));

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!("ledlink host ready.  Press Ctrl-C to exit.");
    cancel.cancelled().await;

    for task in tasks {
        if let Err(e) = task.await {
            error!("task ended abnormally: {e}");
        }
    }

    info!("ledlink host stopped");
    Ok(())
}
