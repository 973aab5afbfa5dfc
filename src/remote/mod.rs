//! Remote data service: the backend trait and the adapter the sync core talks to.
//!
//! Every call goes through [`RemoteAdapter`], which bounds it with a timeout and,
//! on failure, refreshes credentials once and retries once.

mod client;

pub use client::{AuthSession, RestClient, SignUpOutcome};

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::model::{Identity, Session, Task, TaskFields, TaskId};

#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("credentials expired or rejected")]
  Unauthorized,

  #[error("not signed in")]
  NoSession,

  #[error("server returned {status}: {message}")]
  Status { status: u16, message: String },

  #[error("invalid request url: {0}")]
  Url(#[from] url::ParseError),

  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),
}

/// Raw operations of a network-backed data service, scoped per user.
pub trait RemoteStore: Send + Sync {
  fn list_tasks<'a>(&'a self, identity: &'a Identity)
    -> BoxFuture<'a, Result<Vec<Task>, RemoteError>>;

  fn insert_task<'a>(
    &'a self,
    identity: &'a Identity,
    task: &'a Task,
  ) -> BoxFuture<'a, Result<(), RemoteError>>;

  fn update_task<'a>(
    &'a self,
    id: TaskId,
    fields: &'a TaskFields,
  ) -> BoxFuture<'a, Result<(), RemoteError>>;

  fn set_task_completion(
    &self,
    id: TaskId,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
  ) -> BoxFuture<'_, Result<(), RemoteError>>;

  fn delete_task(&self, id: TaskId) -> BoxFuture<'_, Result<(), RemoteError>>;

  /// Insert or replace by task id, so re-running is harmless.
  fn upsert_tasks<'a>(
    &'a self,
    identity: &'a Identity,
    tasks: &'a [Task],
  ) -> BoxFuture<'a, Result<(), RemoteError>>;

  fn list_sessions<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<Session>, RemoteError>>;

  fn insert_sessions<'a>(
    &'a self,
    identity: &'a Identity,
    sessions: &'a [Session],
  ) -> BoxFuture<'a, Result<(), RemoteError>>;

  /// Deadlines of tasks that are not done yet.
  fn list_deadline_dates<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<NaiveDate>, RemoteError>>;

  /// Exchange the refresh token for a new access token.
  fn refresh_session(&self) -> BoxFuture<'_, Result<(), RemoteError>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub request_timeout: Duration,
  pub refresh_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(8),
      refresh_timeout: Duration::from_secs(5),
    }
  }
}

impl From<&RemoteConfig> for RetryPolicy {
  fn from(config: &RemoteConfig) -> Self {
    Self {
      request_timeout: config.request_timeout(),
      refresh_timeout: config.refresh_timeout(),
    }
  }
}

/// Wraps a [`RemoteStore`] with timeouts and the refresh-and-retry-once policy.
pub struct RemoteAdapter {
  store: Arc<dyn RemoteStore>,
  policy: RetryPolicy,
}

impl RemoteAdapter {
  pub fn new(store: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
    Self { store, policy }
  }

  async fn bounded<T, Fut>(limit: Duration, request: Fut) -> Result<T, RemoteError>
  where
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    tokio::time::timeout(limit, request)
      .await
      .unwrap_or(Err(RemoteError::Timeout(limit)))
  }

  /// Run `request`; on failure refresh credentials once and run it again.
  /// A second failure is returned to the caller.
  async fn call<'a, T, F>(&'a self, op: &'static str, request: F) -> Result<T, RemoteError>
  where
    F: Fn(&'a dyn RemoteStore) -> BoxFuture<'a, Result<T, RemoteError>>,
  {
    let store: &'a dyn RemoteStore = self.store.as_ref();
    match Self::bounded(self.policy.request_timeout, request(store)).await {
      Ok(value) => Ok(value),
      Err(first) => {
        warn!(op, error = %first, "remote call failed, refreshing credentials");
        match Self::bounded(self.policy.refresh_timeout, store.refresh_session()).await {
          Ok(()) => debug!(op, "credentials refreshed"),
          Err(e) => warn!(op, error = %e, "credential refresh failed"),
        }
        Self::bounded(self.policy.request_timeout, request(store))
          .await
          .inspect_err(|e| warn!(op, error = %e, "remote call failed after retry"))
      }
    }
  }

  pub async fn list_tasks(&self, identity: &Identity) -> Result<Vec<Task>, RemoteError> {
    self
      .call("list_tasks", |store| store.list_tasks(identity))
      .await
  }

  pub async fn insert_task(&self, identity: &Identity, task: &Task) -> Result<(), RemoteError> {
    self
      .call("insert_task", |store| store.insert_task(identity, task))
      .await
  }

  pub async fn update_task(&self, id: TaskId, fields: &TaskFields) -> Result<(), RemoteError> {
    self
      .call("update_task", |store| store.update_task(id, fields))
      .await
  }

  pub async fn set_task_completion(
    &self,
    id: TaskId,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), RemoteError> {
    self
      .call("set_task_completion", |store| {
        store.set_task_completion(id, completed, completed_at)
      })
      .await
  }

  pub async fn delete_task(&self, id: TaskId) -> Result<(), RemoteError> {
    self
      .call("delete_task", |store| store.delete_task(id))
      .await
  }

  pub async fn upsert_tasks(&self, identity: &Identity, tasks: &[Task]) -> Result<(), RemoteError> {
    self
      .call("upsert_tasks", |store| store.upsert_tasks(identity, tasks))
      .await
  }

  pub async fn list_sessions(&self, identity: &Identity) -> Result<Vec<Session>, RemoteError> {
    self
      .call("list_sessions", |store| store.list_sessions(identity))
      .await
  }

  pub async fn insert_session(
    &self,
    identity: &Identity,
    session: &Session,
  ) -> Result<(), RemoteError> {
    self
      .call("insert_session", |store| {
        store.insert_sessions(identity, std::slice::from_ref(session))
      })
      .await
  }

  pub async fn insert_sessions(
    &self,
    identity: &Identity,
    sessions: &[Session],
  ) -> Result<(), RemoteError> {
    self
      .call("insert_sessions", |store| store.insert_sessions(identity, sessions))
      .await
  }

  pub async fn list_deadline_dates(&self, identity: &Identity) -> Result<Vec<NaiveDate>, RemoteError> {
    self
      .call("list_deadline_dates", |store| store.list_deadline_dates(identity))
      .await
  }
}
