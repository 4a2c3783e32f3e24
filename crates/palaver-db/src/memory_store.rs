use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use palaver_common::{Error, Result};
use rusqlite::{params, Connection};
use tracing::info;

/// One long-term fact about the user, injected into the persona block of
/// the system prompt on every turn.
#[derive(Debug, Clone)]
pub struct MemoryFact {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Backing store for user profile memory.
#[derive(Clone)]
pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening memory store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open memory database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS memories (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
            )
            .map_err(|e| Error::Database(format!("memory migration failed: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_fact(&self, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock()
            .execute(
                "INSERT INTO memories (id, content, created_at) VALUES (?1, ?2, ?3)",
                params![id, content, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to add memory: {e}")))?;
        Ok(id)
    }

    pub fn facts(&self) -> Result<Vec<MemoryFact>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, content, created_at FROM memories ORDER BY created_at ASC")
            .map_err(|e| Error::Database(format!("failed to prepare memory query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let created: String = row.get(2)?;
                Ok(MemoryFact {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load memories: {e}")))?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row.map_err(|e| Error::Database(format!("failed to read memory: {e}")))?);
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;

    #[test]
    fn facts_round_trip_in_insertion_order() {
        let store = MemoryStore::in_memory().expect("in-memory store");
        store.add_fact("prefers terse answers").unwrap();
        store.add_fact("works in UTC+2").unwrap();

        let facts = store.facts().unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].content, "prefers terse answers");
        assert_eq!(facts[1].content, "works in UTC+2");
    }
}
