//! presence-store — SQLite identity directory and attendance ledger.
//!
//! One database file holds both tables. Attendance rows are write-once:
//! `UNIQUE(identity_id, day)` plus `ON CONFLICT DO NOTHING` keeps at most one
//! entry per person and day even when several sessions share the file.

mod attendance;
mod db;
mod error;
mod identities;

pub use db::Store;
pub use error::StoreError;

use std::path::PathBuf;

/// `$XDG_DATA_HOME/presence/attendance.db`.
pub fn default_db_path() -> PathBuf {
    presence_core::data_home().join("presence").join("attendance.db")
}
