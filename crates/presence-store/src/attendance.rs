//! The attendance ledger backed by the `attendance` table.

use crate::db::Store;
use crate::error::StoreError;
use chrono::{NaiveDate, NaiveTime};
use presence_core::{AppendOutcome, AttendanceEntry, AttendanceLedger, IdentityId, LedgerError};
use rusqlite::types::Type;
use rusqlite::{params, Row};

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

impl Store {
    /// Entries recorded on `day`, in the order they were written.
    pub fn entries_for_day(&self, day: NaiveDate) -> Result<Vec<AttendanceEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity_id, name, day, time FROM attendance WHERE day = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![day.format(DAY_FORMAT).to_string()], entry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Days that have at least one entry, most recent first.
    pub fn recorded_days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT day FROM attendance ORDER BY day DESC")?;
        let rows = stmt.query_map([], |row| parse_column(row, 0, |s| NaiveDate::parse_from_str(s, DAY_FORMAT)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn entry_exists(&self, identity: IdentityId, day: NaiveDate) -> Result<bool, StoreError> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM attendance WHERE identity_id = ?1 AND day = ?2)",
            params![identity.0, day.format(DAY_FORMAT).to_string()],
            |row| row.get(0),
        )?)
    }

    fn insert_entry(&self, entry: &AttendanceEntry) -> Result<AppendOutcome, StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO attendance (identity_id, name, day, time) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (identity_id, day) DO NOTHING",
            params![
                entry.identity.0,
                entry.name,
                entry.day.format(DAY_FORMAT).to_string(),
                entry.time.format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(if inserted == 1 {
            AppendOutcome::Recorded
        } else {
            AppendOutcome::AlreadyExists
        })
    }
}

impl AttendanceLedger for Store {
    fn has_entry(&self, identity: IdentityId, day: NaiveDate) -> Result<bool, LedgerError> {
        Ok(self.entry_exists(identity, day)?)
    }

    fn append(&mut self, entry: &AttendanceEntry) -> Result<AppendOutcome, LedgerError> {
        let outcome = self.insert_entry(entry)?;
        tracing::debug!(identity = %entry.identity, day = %entry.day, ?outcome, "ledger append");
        Ok(outcome)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEntry> {
    Ok(AttendanceEntry {
        identity: IdentityId(row.get(0)?),
        name: row.get(1)?,
        day: parse_column(row, 2, |s| NaiveDate::parse_from_str(s, DAY_FORMAT))?,
        time: parse_column(row, 3, |s| NaiveTime::parse_from_str(s, TIME_FORMAT))?,
    })
}

fn parse_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, chrono::ParseError>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, name: &str, day: u32, hms: (u32, u32, u32)) -> AttendanceEntry {
        AttendanceEntry {
            identity: IdentityId(id),
            name: name.into(),
            day: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            time: NaiveTime::from_hms_opt(hms.0, hms.1, hms.2).unwrap(),
        }
    }

    #[test]
    fn test_append_once_per_day() {
        let mut store = Store::open_in_memory().unwrap();
        let first = entry(7, "Ada", 1, (9, 0, 3));
        assert_eq!(store.append(&first).unwrap(), AppendOutcome::Recorded);
        assert!(store.has_entry(IdentityId(7), first.day).unwrap());

        // A later sighting the same day never overwrites the first time.
        let later = entry(7, "Ada", 1, (17, 30, 0));
        assert_eq!(store.append(&later).unwrap(), AppendOutcome::AlreadyExists);
        assert_eq!(store.entries_for_day(first.day).unwrap(), vec![first]);
    }

    #[test]
    fn test_days_and_identities_are_independent() {
        let mut store = Store::open_in_memory().unwrap();
        store.append(&entry(7, "Ada", 1, (9, 0, 0))).unwrap();
        store.append(&entry(8, "Grace", 1, (9, 5, 0))).unwrap();
        assert_eq!(store.append(&entry(7, "Ada", 2, (8, 0, 0))).unwrap(), AppendOutcome::Recorded);

        let day1 = store.entries_for_day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).unwrap();
        assert_eq!(day1.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["Ada", "Grace"]);
        assert!(!store.has_entry(IdentityId(8), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()).unwrap());
        assert_eq!(
            store.recorded_days().unwrap(),
            vec![
                NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            ]
        );
    }

    #[test]
    fn test_concurrent_writers_keep_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        Store::open(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut store = Store::open(&path).unwrap();
                    store.append(&entry(7, "Ada", 1, (9, 0, i))).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<AppendOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| **o == AppendOutcome::Recorded).count(), 1);
        let store = Store::open(&path).unwrap();
        assert_eq!(store.entries_for_day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        {
            let mut store = Store::open(&path).unwrap();
            store.append(&entry(7, "Ada", 1, (9, 0, 0))).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.has_entry(IdentityId(7), day).unwrap());
    }

    #[test]
    fn test_busy_maps_to_retryable_error() {
        let err = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(matches!(LedgerError::from(err), LedgerError::Busy(_)));
        let err = StoreError::InvalidName("x".into());
        assert!(matches!(LedgerError::from(err), LedgerError::Storage(_)));
    }
}
