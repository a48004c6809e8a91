use anyhow::{Context, Result};
use std::sync::Arc;
use tatami_core::Detector;
use tatami_hw::Camera;
use tatami_store::SqliteStore;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector;
mod engine;
mod session;
#[cfg(test)]
mod testing;

use config::{BusKind, Config};
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use detector::ProcessDetector;
use session::SessionConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("tatamid starting");
    let config = Config::from_env();
    let matcher = config.matcher().context("invalid TATAMI_MATCH_THRESHOLD")?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    if !std::path::Path::new(&config.camera_device).is_dir() {
        for dev in Camera::list_devices() {
            tracing::debug!(path = %dev.path, name = %dev.name, driver = %dev.driver, "capture device");
        }
    }

    let (program, args) = config
        .detector_command()
        .context("TATAMI_DETECTOR_CMD is empty")?;
    let device = config.camera_device.clone();
    let engine = engine::spawn_engine(
        Box::new(move || {
            ProcessDetector::spawn(&program, &args).map(|d| Box::new(d) as Box<dyn Detector + Send>)
        }),
        Box::new(move || tatami_hw::open_source(&device)),
        config.warmup_frames,
    )?;

    let service = KioskService::new(
        Arc::clone(&store),
        engine,
        SessionConfig {
            poll_interval: config.poll_interval(),
            detect_timeout: config.detect_timeout(),
            threshold: matcher.threshold(),
        },
        config.camera_device.clone(),
    );

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        camera = %config.camera_device,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        "tatamid ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("tatamid shutting down");

    let iface = conn
        .object_server()
        .interface::<_, KioskService>(OBJECT_PATH)
        .await?;
    iface.get().await.shutdown().await;

    Ok(())
}
