use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

/// Durable record store backing the topology registry.
///
/// One table keyed by (kind, id) with the record serialized as JSON. The
/// store is a cache of what this process installed: it is reloaded at
/// startup and reconciled against live kernel enumeration, never trusted as
/// ground truth.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::system(
                    "record store",
                    format!("failed to create {}: {e}", parent.display()),
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            Error::system(
                "record store",
                format!("failed to open {}: {e}", path.display()),
            )
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;

        Self::create_tables(&conn)?;

        info!("record store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                kind       TEXT NOT NULL,
                id         TEXT NOT NULL,
                data       TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );",
        )
        .map_err(store_err)
    }

    pub fn upsert<T: Serialize>(&self, kind: &str, id: &str, record: &T) -> Result<()> {
        let data = serde_json::to_string(record)
            .map_err(|e| Error::system("record store", e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let conn = self.lock();
        conn.execute(
            "INSERT INTO records (kind, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (kind, id) DO UPDATE SET data = ?3, updated_at = ?4",
            rusqlite::params![kind, id, data, now],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn delete(&self, kind: &str, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM records WHERE kind = ?1 AND id = ?2",
            rusqlite::params![kind, id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Load every record of one kind. Records that no longer deserialize
    /// (schema drift) are skipped rather than failing the whole reload.
    pub fn load_kind<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT data FROM records WHERE kind = ?1")
            .map_err(store_err)?;

        let rows = stmt
            .query_map(rusqlite::params![kind], |row| row.get::<_, String>(0))
            .map_err(store_err)?;

        let mut records = Vec::new();
        for row in rows {
            let data = row.map_err(store_err)?;
            match serde_json::from_str(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("skipping undecodable {kind} record: {e}");
                }
            }
        }
        Ok(records)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::system("record store", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NatRuleKind, NatRuleRecord, Protocol, RuleState};

    #[test]
    fn test_upsert_load_delete() {
        let store = RecordStore::open_in_memory().unwrap();

        let mut rule = NatRuleRecord::new("ab12cd34", NatRuleKind::Dnat, Protocol::Tcp);
        rule.port = Some(8080);
        store.upsert("nat_rule", &rule.id.clone(), &rule).unwrap();

        let loaded: Vec<NatRuleRecord> = store.load_kind("nat_rule").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].port, Some(8080));

        // Upsert overwrites in place.
        rule.state = RuleState::Active;
        store.upsert("nat_rule", &rule.id.clone(), &rule).unwrap();
        let loaded: Vec<NatRuleRecord> = store.load_kind("nat_rule").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, RuleState::Active);

        store.delete("nat_rule", "ab12cd34").unwrap();
        let loaded: Vec<NatRuleRecord> = store.load_kind("nat_rule").unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_reload_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = RecordStore::open(&path).unwrap();
            let rule = NatRuleRecord::new("77fe10aa", NatRuleKind::Masquerade, Protocol::All);
            store.upsert("nat_rule", "77fe10aa", &rule).unwrap();
        }

        // Simulates a process restart: records survive the reopen.
        let store = RecordStore::open(&path).unwrap();
        let loaded: Vec<NatRuleRecord> = store.load_kind("nat_rule").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "77fe10aa");
    }

    #[test]
    fn test_kinds_are_isolated() {
        let store = RecordStore::open_in_memory().unwrap();
        let rule = NatRuleRecord::new("ab12cd34", NatRuleKind::Acl, Protocol::Tcp);
        store.upsert("nat_rule", "ab12cd34", &rule).unwrap();

        let bridges: Vec<NatRuleRecord> = store.load_kind("bridge").unwrap();
        assert!(bridges.is_empty());
    }
}
