use crate::engine::SharedStatus;
use presence_core::StopSignal;
use chrono::NaiveDate;
use presence_store::Store;
use std::path::{Path, PathBuf};
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus control interface for the attendance daemon.
///
/// Bus name: org.presence.Attendance1 (session bus)
/// Object path: /org/presence/Attendance1
pub struct AttendanceService {
    pub status: SharedStatus,
    pub stop: StopSignal,
    pub db_path: PathBuf,
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Engine state as JSON: running flag, frame count, people marked so far.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.status.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": snapshot,
            "stop_requested": self.stop.is_stopped(),
        })
        .to_string())
    }

    /// Today's ledger entries as a JSON array, including other sessions' writes.
    async fn today(&self) -> zbus::fdo::Result<String> {
        let today = chrono::Local::now().date_naive();
        let db_path = self.db_path.clone();
        // SQLite may wait out the busy timeout; keep it off the bus executor.
        tokio::task::spawn_blocking(move || entries_json(&db_path, today))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("ledger query task failed: {e}")))?
            .map_err(zbus::fdo::Error::Failed)
    }

    /// Ask the session to stop after the current frame. False if already stopping.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        let first = !self.stop.is_stopped();
        tracing::info!(first, "stop requested over D-Bus");
        self.stop.stop();
        Ok(first)
    }
}

/// Ledger entries for `day` serialized as a JSON array.
fn entries_json(db_path: &Path, day: NaiveDate) -> Result<String, String> {
    let entries = Store::open(db_path)
        .and_then(|store| store.entries_for_day(day))
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&entries).map_err(|e| e.to_string())
}
