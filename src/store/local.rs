//! On-device key/value store backed by SQLite.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::model::{Category, StoreData};

/// Key holding tasks and sessions.
pub const DATA_KEY: &str = "focusgrid_data";
/// Key used by older releases; moved to `DATA_KEY` on open.
const LEGACY_DATA_KEY: &str = "pomodoro_data";
/// Key holding the persisted auth session.
pub const AUTH_SESSION_KEY: &str = "focusgrid_auth";

/// Schema for the key/value table.
const LOCAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Key/value store that stands in for browser local storage.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store inside `dir`.
  pub fn open(dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;

    let path = dir.join("focusgrid.db");
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory db: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(LOCAL_SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.migrate_legacy_key()?;
    Ok(store)
  }

  fn migrate_legacy_key(&self) -> Result<()> {
    if self.get(DATA_KEY)?.is_some() {
      return Ok(());
    }
    if let Some(legacy) = self.get(LEGACY_DATA_KEY)? {
      info!("moving data from legacy key {}", LEGACY_DATA_KEY);
      self.set(DATA_KEY, &legacy)?;
      self.remove(LEGACY_DATA_KEY)?;
    }
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;

    Ok(())
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete key {}: {}", key, e))?;

    Ok(())
  }

  /// Read a JSON value. Missing or corrupt entries read as `None`.
  pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = match self.get(key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key, error = %e, "local read failed");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, error = %e, "discarding corrupt local data");
        None
      }
    }
  }

  pub fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let raw =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self.set(key, &raw)
  }

  /// All tasks and sessions. Never fails: missing or corrupt data is empty.
  pub fn read_all(&self) -> StoreData {
    self.load_json(DATA_KEY).unwrap_or_default()
  }

  /// Replace everything stored under the data key.
  pub fn write_all(&self, data: &StoreData) -> Result<()> {
    self.save_json(DATA_KEY, data)
  }

  fn courses_key(category: Category) -> String {
    format!("focusgrid_courses_{}", category.as_str())
  }

  /// Sorted course list for a category.
  pub fn courses(&self, category: Category) -> Vec<String> {
    self
      .load_json(&Self::courses_key(category))
      .unwrap_or_default()
  }

  /// Add a course; blanks and duplicates are ignored. Returns the new list.
  pub fn add_course(&self, category: Category, name: &str) -> Result<Vec<String>> {
    let name = name.trim();
    let mut courses = self.courses(category);
    if name.is_empty() || courses.iter().any(|c| c == name) {
      return Ok(courses);
    }
    courses.push(name.to_string());
    courses.sort();
    self.save_json(&Self::courses_key(category), &courses)?;
    Ok(courses)
  }

  pub fn remove_course(&self, category: Category, name: &str) -> Result<Vec<String>> {
    let mut courses = self.courses(category);
    courses.retain(|c| c != name.trim());
    self.save_json(&Self::courses_key(category), &courses)?;
    Ok(courses)
  }

  fn migration_key(user_id: &str) -> String {
    format!("focusgrid_migrated_{}", user_id)
  }

  /// Whether local data has already been copied to this user's remote store.
  pub fn is_migrated(&self, user_id: &str) -> bool {
    match self.get(&Self::migration_key(user_id)) {
      Ok(flag) => flag.is_some(),
      Err(e) => {
        warn!(error = %e, "could not read migration flag");
        false
      }
    }
  }

  pub fn mark_migrated(&self, user_id: &str) -> Result<()> {
    self.set(&Self::migration_key(user_id), "1")
  }

  #[cfg(test)]
  pub fn set_raw(&self, key: &str, value: &str) -> Result<()> {
    self.set(key, value)
  }
}
