//! JSON export and import of the full `{tasks, sessions}` document.

use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::model::StoreData;
use crate::store::{Backend, Stores};
use crate::sync::{SessionLog, SyncCache};

#[derive(Debug, Error)]
pub enum ImportError {
  #[error("Invalid file format. Please select a valid FocusGrid export file.")]
  InvalidFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
  pub tasks: usize,
  pub sessions: usize,
}

pub fn default_file_name(today: NaiveDate) -> String {
  format!("focusgrid-data-{}.json", today.format("%Y-%m-%d"))
}

/// Serialize everything in the active store. Reads the store directly rather
/// than the cache so the export reflects what is actually persisted.
pub async fn export(stores: &Stores) -> Result<String> {
  let data = match stores.backend() {
    Backend::Remote(remote, identity) => StoreData {
      tasks: remote
        .list_tasks(&identity)
        .await
        .map_err(|e| eyre!("Failed to read tasks for export: {}", e))?,
      sessions: remote
        .list_sessions(&identity)
        .await
        .map_err(|e| eyre!("Failed to read sessions for export: {}", e))?,
    },
    Backend::Local => stores.local.read_all(),
  };

  serde_json::to_string_pretty(&data).map_err(|e| eyre!("Failed to serialize export: {}", e))
}

/// Parse an export document. Both arrays must be present; nothing is imported
/// from a document that fails to parse as a whole.
pub fn parse_import(text: &str) -> Result<StoreData, ImportError> {
  let value: Value = serde_json::from_str(text).map_err(|_| ImportError::InvalidFormat)?;
  let has_array = |key: &str| value.get(key).is_some_and(Value::is_array);
  if !(has_array("tasks") || has_array("todos")) || !has_array("sessions") {
    return Err(ImportError::InvalidFormat);
  }
  serde_json::from_value(value).map_err(|_| ImportError::InvalidFormat)
}

/// Write an imported document through the active store, then reload.
///
/// Signed in, every row is inserted for the current user. Signed out, the
/// document replaces local data.
pub async fn import(
  stores: &Stores,
  tasks: &SyncCache,
  sessions: &SessionLog,
  data: StoreData,
) -> Result<ImportSummary> {
  let summary = ImportSummary {
    tasks: data.tasks.len(),
    sessions: data.sessions.len(),
  };

  match stores.backend() {
    Backend::Remote(remote, identity) => {
      for task in &data.tasks {
        remote
          .insert_task(&identity, task)
          .await
          .map_err(|e| eyre!("Failed to import task {}: {}", task.id, e))?;
      }
      for session in &data.sessions {
        remote
          .insert_session(&identity, session)
          .await
          .map_err(|e| eyre!("Failed to import session: {}", e))?;
      }
    }
    Backend::Local => stores.local.write_all(&data)?,
  }

  info!(tasks = summary.tasks, sessions = summary.sessions, "import finished");
  tasks.invalidate_all();
  sessions.invalidate();
  tasks.load(false).await;
  sessions.load().await;
  Ok(summary)
}
