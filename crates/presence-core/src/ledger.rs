//! Attendance ledger and identity directory contracts.

use crate::types::IdentityId;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Another writer holds the store; retrying later may succeed.
    #[error("ledger busy: {0}")]
    Busy(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// One durable "present" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub identity: IdentityId,
    pub name: String,
    pub day: NaiveDate,
    pub time: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Recorded,
    /// The ledger already holds an entry for this identity and day.
    AlreadyExists,
}

/// Per-day, per-identity write-once attendance store.
///
/// `append` must keep at most one entry per (identity, day) even with
/// concurrent writers. Entries are never rewritten or deleted.
pub trait AttendanceLedger {
    fn has_entry(&self, identity: IdentityId, day: NaiveDate) -> Result<bool, LedgerError>;
    fn append(&mut self, entry: &AttendanceEntry) -> Result<AppendOutcome, LedgerError>;
}

/// A person known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
}

/// Read-only id → display name mapping for the duration of a session.
#[derive(Debug, Clone, Default)]
pub struct IdentityDirectory {
    names: BTreeMap<IdentityId, String>,
}

impl IdentityDirectory {
    pub fn from_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        Self {
            names: records.into_iter().map(|r| (r.id, r.name)).collect(),
        }
    }

    pub fn name(&self, id: IdentityId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lookup() {
        let dir = IdentityDirectory::from_records([
            IdentityRecord { id: IdentityId(7), name: "Ada".into() },
            IdentityRecord { id: IdentityId(9), name: "Grace".into() },
        ]);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.name(IdentityId(7)), Some("Ada"));
        assert_eq!(dir.name(IdentityId(8)), None);
        assert!(IdentityDirectory::default().is_empty());
    }

    #[test]
    fn test_entry_serializes_plain_dates() {
        let entry = AttendanceEntry {
            identity: IdentityId(7),
            name: "Ada".into(),
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            time: NaiveTime::from_hms_opt(9, 15, 2).unwrap(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["identity"], 7);
        assert_eq!(json["day"], "2024-03-01");
        assert_eq!(json["time"], "09:15:02");
    }
}
