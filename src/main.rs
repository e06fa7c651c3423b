pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod session;
pub mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use colored::Colorize;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::mqtt::mqtt_handler::RumqttConnector;
use crate::persistence::KeyValueStore;
use crate::session::{Connected, MqttSession};

/// Operator console for the conveyor color-sorting rig.
#[derive(Debug, Parser)]
#[command(name = "esteira-control", version, about)]
struct Args {
    /// Config file (default: <config dir>/esteira-control/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic carrying classification events
    #[arg(long)]
    receive_topic: Option<String>,

    /// Topic for commands to the device
    #[arg(long)]
    send_topic: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Mode {
    /// Interactive console (default)
    Console,
    /// Print classification events as they arrive
    Monitor,
    /// Ask the device for the camera server address and exit
    Discover,
    /// Toggle the conveyor once and exit
    Toggle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.verbose)?;

    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_init(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load config: {}", e))?;
    if let Some(topic) = args.receive_topic {
        config.topics.receive = topic;
    }
    if let Some(topic) = args.send_topic {
        config.topics.send = topic;
    }
    debug!("Effective config: {:?}", config);

    let mqtt_config = config
        .mqtt_config()
        .map_err(|e| eyre!("Invalid broker settings: {}", e))?;
    if mqtt_config.credentials.is_none() {
        warn!(
            "No broker credentials configured (set {} and {})",
            config::USERNAME_ENV,
            config::PASSWORD_ENV
        );
    }

    let store = Arc::new(KeyValueStore::open(config.settings_path()).await?);
    if let Some(path) = store.path() {
        info!("Operator settings stored in {}", path.display());
    }
    let connector = Arc::new(RumqttConnector::new(mqtt_config));

    let session = MqttSession::create(config.session_settings(), connector, Some(store.clone()))
        .await
        .connect()
        .await
        .map_err(|e| eyre!("Could not connect to {}: {}", config.broker.url, e))?;

    let outcome = run(&session, args.mode.unwrap_or(Mode::Console), store).await;

    let closed = session.disconnect().await;
    let snapshot = closed.final_snapshot();
    info!(
        "Session closed: {} received, {} sent, {} classified",
        snapshot.status.messages_received,
        snapshot.status.messages_sent,
        snapshot.counters().total()
    );
    outcome
}

async fn run(session: &MqttSession<Connected>, mode: Mode, store: Arc<KeyValueStore>) -> Result<()> {
    match mode {
        Mode::Console => ui::console::run_console(session, Some(store)).await,
        Mode::Monitor => ui::console::run_monitor(session).await,
        Mode::Discover => {
            let value = session.request_remote_value().await?;
            println!("{}", value);
            Ok(())
        }
        Mode::Toggle => {
            let state = session.toggle_actuator().await?;
            println!("{}", ui::dashboard::actuator_button(state));
            // Teardown would cancel the confirmation timer.
            let mut rx = session.subscribe();
            let settled = tokio::time::timeout(
                session.settings().toggle_mode.settle_after() + Duration::from_secs(1),
                rx.wait_for(|s| !s.actuator.is_pending()),
            )
            .await;
            match settled {
                Ok(Ok(snapshot)) => println!("{}", ui::dashboard::actuator_button(snapshot.actuator)),
                _ => println!("{}", "Sem confirmação do dispositivo".yellow()),
            }
            Ok(())
        }
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
