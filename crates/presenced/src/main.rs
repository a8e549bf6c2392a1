use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::SharedStatus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        confidence_threshold = config.confidence_threshold,
        movement_threshold = config.movement_threshold,
        "configuration loaded"
    );

    let status = SharedStatus::new(&config.camera_device);
    let db_path = config.db_path.clone();
    let engine = tokio::task::spawn_blocking({
        let status = status.clone();
        move || engine::spawn_engine(config, status)
    })
    .await
    .context("engine startup task panicked")?
    .context("failed to start recognition engine")?;

    let service = AttendanceService {
        status,
        stop: engine.stop.clone(),
        db_path,
    };
    // D-Bus is a convenience; the session runs without it.
    let _connection = match zbus::connection::Builder::session()
        .and_then(|b| b.name(BUS_NAME))
        .and_then(|b| b.serve_at(OBJECT_PATH, service))
    {
        Ok(builder) => match builder.build().await {
            Ok(conn) => {
                tracing::info!(name = BUS_NAME, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; continuing without control interface");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; continuing without control interface");
            None
        }
    };

    tracing::info!("presenced ready");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let stop = engine.stop.clone();
    let mut done = engine.done;

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        _ = sigterm.recv() => None,
        result = &mut done => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("shutdown signal received; stopping session");
            stop.stop();
            done.await
        }
    };

    match result {
        Ok(Ok(summary)) => {
            tracing::info!(frames = summary.frames, marked = summary.marked.len(), "presenced shutting down");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("recognition session failed"),
        Err(_) => bail!("engine thread exited without reporting a result"),
    }
}
