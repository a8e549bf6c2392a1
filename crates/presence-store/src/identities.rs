//! Enrolled identities: the id → name directory sessions resolve labels from.

use crate::db::Store;
use crate::error::StoreError;
use presence_core::{IdentityDirectory, IdentityId, IdentityRecord};
use rusqlite::{params, OptionalExtension};

const MAX_NAME_LEN: usize = 64;

impl Store {
    /// Register a new identity. Ids are assigned by the operator and match
    /// the ids used in the enrolled gallery.
    pub fn add_identity(&self, id: IdentityId, name: &str) -> Result<IdentityRecord, StoreError> {
        let name = validate_name(name)?;

        let exists = self
            .conn
            .query_row("SELECT 1 FROM identities WHERE id = ?1", params![id.0], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateIdentity(id.0));
        }

        let created_at = chrono::Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string();
        self.conn.execute(
            "INSERT INTO identities (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id.0, name, created_at],
        )?;
        tracing::info!(identity = %id, name, "identity added");

        Ok(IdentityRecord {
            id,
            name: name.to_string(),
        })
    }

    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM identities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityRecord {
                id: IdentityId(row.get(0)?),
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Snapshot of all identities for a recognition session.
    pub fn load_directory(&self) -> Result<IdentityDirectory, StoreError> {
        Ok(IdentityDirectory::from_records(self.list_identities()?))
    }
}

fn validate_name(name: &str) -> Result<&str, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidName("name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::InvalidName(format!("longer than {MAX_NAME_LEN} characters")));
    }
    if name.chars().any(char::is_control) {
        return Err(StoreError::InvalidName("contains control characters".into()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_list() {
        let store = Store::open_in_memory().unwrap();
        store.add_identity(IdentityId(9), "Grace").unwrap();
        let ada = store.add_identity(IdentityId(7), "  Ada ").unwrap();
        assert_eq!(ada.name, "Ada");

        let ids: Vec<u32> = store.list_identities().unwrap().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![7, 9]);

        let dir = store.load_directory().unwrap();
        assert_eq!(dir.name(IdentityId(7)), Some("Ada"));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.add_identity(IdentityId(7), "Ada").unwrap();
        assert!(matches!(
            store.add_identity(IdentityId(7), "Someone Else"),
            Err(StoreError::DuplicateIdentity(7))
        ));
        assert_eq!(store.load_directory().unwrap().name(IdentityId(7)), Some("Ada"));
    }

    #[test]
    fn test_name_validation() {
        let store = Store::open_in_memory().unwrap();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        for bad in ["", "   ", "line\nbreak", long.as_str()] {
            assert!(matches!(
                store.add_identity(IdentityId(1), bad),
                Err(StoreError::InvalidName(_))
            ));
        }
        assert!(store.list_identities().unwrap().is_empty());
    }
}
