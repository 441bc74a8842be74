use anyhow::Result;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_controller::clock::{Clock, SystemClock};
use irrigation_controller::config::{self, FileSettings, Settings, SettingsSource};
use irrigation_controller::controller::Controller;
use irrigation_controller::engine::Engine;
use irrigation_controller::events::{EventKind, EventLog};
use irrigation_controller::programs::ProgramStore;
use irrigation_controller::record::RecordStore;
use irrigation_controller::supervisor::{LinkStateMonitor, Supervisor};
use irrigation_controller::valve::RelayBoard;
use irrigation_controller::web::WebService;
use irrigation_controller::zones::ZoneActuator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Settings ────────────────────────────────────────────────────
    // A broken file is fatal at startup; later edits fall back to the last
    // good settings instead.
    let initial = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "settings file not found, using factory defaults");
        Settings::default()
    };
    let settings: Arc<dyn SettingsSource> = Arc::new(FileSettings::new(&config_path));

    let events = EventLog::new();
    events.info(
        EventKind::System,
        format!(
            "controller starting, {} zone(s), safety relay {}",
            initial.zones.len(),
            if initial.safety_relay.is_some() { "configured" } else { "absent" }
        ),
    );

    // ── Relay board ─────────────────────────────────────────────────
    let board = open_board(&initial)?;

    // ── Persisted state ─────────────────────────────────────────────
    let record = RecordStore::open(data_dir.join("program_state.json"), events.clone())?;
    record.reset_on_boot()?;
    let programs = ProgramStore::open(data_dir.join("programs.json"), events.clone())?;

    // ── Core ────────────────────────────────────────────────────────
    let zones = ZoneActuator::new(board, settings.clone(), record.clone(), events.clone());
    if let Err(e) = zones.deactivate_all() {
        warn!("initial reset of zones incomplete: {e}");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::new(
        zones.clone(),
        record.clone(),
        programs.clone(),
        settings.clone(),
        clock.clone(),
        events.clone(),
    );

    let mut supervisor = Supervisor::new(
        zones.clone(),
        record.clone(),
        programs.clone(),
        engine.clone(),
        events.clone(),
    );
    if let Ok(iface) = env::var("NET_IFACE") {
        info!(%iface, "monitoring network link");
        supervisor = supervisor.with_network(Arc::new(LinkStateMonitor::new(&iface)));
    }

    let controller = Controller::new(
        settings,
        record,
        zones.clone(),
        programs,
        engine.clone(),
        clock,
        events.clone(),
    )
    .with_health(supervisor.health());

    // ── Web server ──────────────────────────────────────────────────
    let web = Arc::new(WebService::new(
        controller.clone(),
        SocketAddr::from(([0, 0, 0, 0], port)),
    ));
    web.start().await?;
    let supervisor = supervisor.with_service(web);

    // ── Background loops ────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(controller.scheduler().run(shutdown.clone()));
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));
    events.info(EventKind::System, "controller ready");

    tokio::signal::ctrl_c().await?;

    // Fail-safe: nothing stays open once we stop supervising it.
    info!("shutdown requested");
    shutdown.cancel();
    engine.stop();
    if let Err(e) = zones.deactivate_all() {
        warn!("final reset of zones incomplete: {e}");
    }
    scheduler_task.abort();
    supervisor_task.abort();
    Ok(())
}

#[cfg(feature = "gpio")]
fn open_board(settings: &Settings) -> Result<Box<dyn RelayBoard>> {
    use irrigation_controller::valve::GpioBoard;
    Ok(Box::new(GpioBoard::new(
        &settings.zone_pins(),
        settings.safety_relay_pin(),
        settings.relay_active_low,
    )?))
}

#[cfg(not(feature = "gpio"))]
fn open_board(settings: &Settings) -> Result<Box<dyn RelayBoard>> {
    use irrigation_controller::valve::MockBoard;
    Ok(Box::new(MockBoard::new(
        &settings.zone_pins(),
        settings.safety_relay_pin(),
    )))
}
