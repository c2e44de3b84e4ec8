//! SQLite snapshot of the cache table between sessions.
//!
//! On shutdown every entry that holds data is written out; on start the rows
//! are read back and seeded into the store as `stale`, so the presentation
//! layer shows last-known data while the first revalidation runs.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::policy::{policy_for, Tier};

/// A persisted entry read back from disk.
#[derive(Debug, Clone)]
pub struct PersistedEntry {
  pub key: CacheKey,
  pub tier: Tier,
  pub data: Value,
  pub cached_at: DateTime<Utc>,
}

/// SQLite-backed cache snapshot.
pub struct SqliteSnapshot {
  conn: Mutex<Connection>,
}

impl SqliteSnapshot {
  /// Open (or create) the snapshot database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory snapshot, mostly useful for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("gq").join("cache.db"))
  }

  /// Replace the snapshot with every entry that holds data.
  ///
  /// Returns the number of rows written.
  pub fn save(&self, entries: &[CacheEntry]) -> Result<usize> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_snapshot", [])
      .map_err(|e| eyre!("Failed to clear cache snapshot: {}", e))?;

    let mut written = 0;
    for entry in entries {
      let Some(data) = &entry.data else {
        continue;
      };
      let key = serde_json::to_string(&entry.key)
        .map_err(|e| eyre!("Failed to serialize key {}: {}", entry.key, e))?;
      let data =
        serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize {}: {}", entry.key, e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_snapshot (cache_key, tier, data, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![key, entry.tier.name(), data],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", entry.key, e))?;
      written += 1;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache snapshot: {}", e))?;
    Ok(written)
  }

  /// Read back every row still within its tier's retention window.
  ///
  /// Rows that fail to parse are skipped.
  pub fn load(&self) -> Result<Vec<PersistedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT cache_key, tier, data, cached_at FROM cache_snapshot")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, Vec<u8>, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query cache snapshot: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let now = Utc::now();
    let entries = rows
      .into_iter()
      .filter_map(|(key, tier, data, cached_at)| {
        let key: CacheKey = serde_json::from_str(&key).ok()?;
        let tier: Tier = tier.parse().ok()?;
        let data: Value = serde_json::from_slice(&data).ok()?;
        let cached_at = parse_datetime(&cached_at).ok()?;
        Some(PersistedEntry {
          key,
          tier,
          data,
          cached_at,
        })
      })
      .filter(|entry| {
        let retention = chrono::Duration::from_std(policy_for(entry.tier).gc_time)
          .unwrap_or_else(|_| chrono::Duration::zero());
        now - entry.cached_at <= retention
      })
      .collect();

    Ok(entries)
  }
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_snapshot (
    cache_key TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, EntryStatus, StalenessRegistry};
  use crate::cache_key;
  use serde_json::json;

  #[tokio::test]
  async fn test_save_and_load_entries_with_data() {
    let store = CacheStore::new(StalenessRegistry::default());
    store.put(&cache_key!["video", "items"], json!([{"id": 1}]), EntryStatus::Fresh);
    store.put(&cache_key!["social", "posts", 0, 20], json!({"posts": []}), EntryStatus::Stale);
    let _empty = store.subscribe(&cache_key!["wallet", "u1"]);

    let snapshot = SqliteSnapshot::open_in_memory().unwrap();
    assert_eq!(snapshot.save(&store.snapshot()).unwrap(), 2);

    let mut loaded = snapshot.load().unwrap();
    loaded.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].key, cache_key!["social", "posts", 0, 20]);
    assert_eq!(loaded[0].tier, Tier::Dynamic);
    assert_eq!(loaded[1].data, json!([{"id": 1}]));
  }

  #[tokio::test]
  async fn test_save_replaces_previous_snapshot() {
    let snapshot = SqliteSnapshot::open_in_memory().unwrap();
    let store = CacheStore::new(StalenessRegistry::default());
    store.put(&cache_key!["video", "items"], json!([]), EntryStatus::Fresh);
    snapshot.save(&store.snapshot()).unwrap();

    let other = CacheStore::new(StalenessRegistry::default());
    other.put(&cache_key!["video", "categories"], json!([]), EntryStatus::Fresh);
    snapshot.save(&other.snapshot()).unwrap();

    let loaded = snapshot.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].key, cache_key!["video", "categories"]);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-05-01 12:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-05-01T12:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }

  #[test]
  fn test_open_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    SqliteSnapshot::open(&path).unwrap();
    assert!(path.exists());
  }
}
