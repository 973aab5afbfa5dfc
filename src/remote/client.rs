//! HTTP backend speaking the PostgREST data API and the GoTrue auth API.

use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::config::RemoteConfig;
use crate::event::AuthEvent;
use crate::model::{Identity, Session, Task, TaskFields, TaskId};

const TASKS_TABLE: &str = "todos";
const SESSIONS_TABLE: &str = "sessions";

/// Tokens for a signed-in user. Persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
  pub access_token: String,
  pub refresh_token: String,
  pub user: Identity,
}

/// Result of a sign-up request.
#[derive(Debug)]
pub enum SignUpOutcome {
  SignedIn(Identity),
  /// The account exists but the email address must be confirmed first
  ConfirmationRequired,
}

/// Check password strength before sending it anywhere.
pub fn validate_password(password: &str) -> Result<(), &'static str> {
  if password.chars().count() < 8 {
    return Err("Password must be at least 8 characters long.");
  }
  if !password.chars().any(|c| c.is_ascii_digit()) {
    return Err("Password must contain at least one number.");
  }
  if !password.chars().any(|c| c.is_ascii_alphabetic()) {
    return Err("Password must contain at least one letter.");
  }
  Ok(())
}

#[derive(Serialize)]
struct TaskRow<'a> {
  #[serde(flatten)]
  task: &'a Task,
  user_id: &'a str,
}

#[derive(Serialize)]
struct SessionRow<'a> {
  #[serde(flatten)]
  session: &'a Session,
  user_id: &'a str,
}

#[derive(Serialize)]
struct CompletionPatch {
  completed: bool,
  completed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct DeadlineRow {
  #[serde(default)]
  deadline: Option<String>,
}

#[derive(Serialize)]
struct Credentials<'a> {
  email: &'a str,
  password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
  refresh_token: &'a str,
}

#[derive(Deserialize)]
struct SignUpResponse {
  access_token: Option<String>,
  refresh_token: Option<String>,
  user: Option<Identity>,
}

#[derive(Deserialize, Default)]
struct AuthErrorBody {
  error_description: Option<String>,
  msg: Option<String>,
  message: Option<String>,
}

impl AuthErrorBody {
  fn into_message(self, status: StatusCode) -> String {
    self
      .error_description
      .or(self.msg)
      .or(self.message)
      .unwrap_or_else(|| status.to_string())
  }
}

/// Remote client for a hosted backend
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  session: Mutex<Option<AuthSession>>,
  events: mpsc::UnboundedSender<AuthEvent>,
}

impl RestClient {
  pub fn new(
    config: &RemoteConfig,
    api_key: String,
    events: mpsc::UnboundedSender<AuthEvent>,
  ) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;

    let http = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      session: Mutex::new(None),
      events,
    })
  }

  /// Reinstate tokens saved by an earlier run. Does not emit an event.
  pub fn restore(&self, session: AuthSession) {
    *self.lock_session() = Some(session);
  }

  pub fn session(&self) -> Option<AuthSession> {
    self.lock_session().clone()
  }

  pub fn identity(&self) -> Option<Identity> {
    self.lock_session().as_ref().map(|s| s.user.clone())
  }

  fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<AuthSession>> {
    self.session.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: AuthEvent) {
    // Receiver gone means the app is shutting down
    let _ = self.events.send(event);
  }

  fn bearer(&self) -> String {
    self
      .lock_session()
      .as_ref()
      .map(|s| s.access_token.clone())
      .unwrap_or_else(|| self.api_key.clone())
  }

  fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, RemoteError> {
    let mut url = self.base.join(&format!("rest/v1/{}", table))?;
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
  }

  fn auth_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, RemoteError> {
    let mut url = self.base.join(&format!("auth/v1/{}", path))?;
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = request
      .header("apikey", &self.api_key)
      .bearer_auth(self.bearer())
      .send()
      .await?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
      return Err(RemoteError::Unauthorized);
    }
    if !status.is_success() {
      let message = response.text().await.unwrap_or_default();
      return Err(RemoteError::Status {
        status: status.as_u16(),
        message,
      });
    }
    Ok(response)
  }

  fn user_filter(identity: &Identity) -> (&'static str, String) {
    ("user_id", format!("eq.{}", identity.id))
  }

  fn id_filter(id: TaskId) -> (&'static str, String) {
    ("id", format!("eq.{}", id))
  }

  async fn post_auth<B: Serialize>(&self, url: Url, body: &B) -> Result<Response> {
    let response = self
      .http
      .post(url)
      .header("apikey", &self.api_key)
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Auth request failed: {}", e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body: AuthErrorBody = response.json().await.unwrap_or_default();
    Err(eyre!(body.into_message(status)))
  }

  /// Sign in with email and password. Errors are meant to be shown to the user.
  pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Identity> {
    let url = self
      .auth_url("token", &[("grant_type", "password")])
      .map_err(|e| eyre!("{}", e))?;
    let session: AuthSession = self
      .post_auth(url, &Credentials { email, password })
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Unexpected sign-in response: {}", e))?;

    let identity = session.user.clone();
    *self.lock_session() = Some(session);
    info!(user = %identity.id, "signed in");
    self.emit(AuthEvent::signed_in(identity.clone()));
    Ok(identity)
  }

  pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
    validate_password(password).map_err(|msg| eyre!(msg))?;

    let url = self.auth_url("signup", &[]).map_err(|e| eyre!("{}", e))?;
    let response: SignUpResponse = self
      .post_auth(url, &Credentials { email, password })
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Unexpected sign-up response: {}", e))?;

    match response {
      SignUpResponse {
        access_token: Some(access_token),
        refresh_token: Some(refresh_token),
        user: Some(user),
      } => {
        *self.lock_session() = Some(AuthSession {
          access_token,
          refresh_token,
          user: user.clone(),
        });
        self.emit(AuthEvent::signed_in(user.clone()));
        Ok(SignUpOutcome::SignedIn(user))
      }
      _ => Ok(SignUpOutcome::ConfirmationRequired),
    }
  }

  /// Forget the local session first, then tell the server. Server errors are only logged.
  pub async fn sign_out(&self) -> Result<()> {
    let previous = self.lock_session().take();
    self.emit(AuthEvent::signed_out());

    let Some(previous) = previous else {
      return Ok(());
    };

    let url = self.auth_url("logout", &[]).map_err(|e| eyre!("{}", e))?;
    let result = self
      .http
      .post(url)
      .header("apikey", &self.api_key)
      .bearer_auth(&previous.access_token)
      .send()
      .await;

    match result {
      Ok(response) if !response.status().is_success() => {
        warn!(status = %response.status(), "sign-out rejected by server");
      }
      Err(e) => warn!(error = %e, "sign-out request failed"),
      Ok(_) => {}
    }
    Ok(())
  }

  async fn refresh(&self) -> Result<(), RemoteError> {
    let refresh_token = self
      .lock_session()
      .as_ref()
      .map(|s| s.refresh_token.clone())
      .ok_or(RemoteError::NoSession)?;

    let url = self.auth_url("token", &[("grant_type", "refresh_token")])?;
    let response = self
      .http
      .post(url)
      .header("apikey", &self.api_key)
      .json(&RefreshRequest {
        refresh_token: &refresh_token,
      })
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(RemoteError::Status {
        status: status.as_u16(),
        message: response.text().await.unwrap_or_default(),
      });
    }

    let session: AuthSession = response.json().await?;
    let identity = session.user.clone();
    *self.lock_session() = Some(session);
    self.emit(AuthEvent::other(Some(identity)));
    Ok(())
  }
}

impl RemoteStore for RestClient {
  fn list_tasks<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<Task>, RemoteError>> {
    async move {
      let url = self.table_url(
        TASKS_TABLE,
        &[
          ("select", "*".to_string()),
          Self::user_filter(identity),
          ("order", "id.asc".to_string()),
        ],
      )?;
      let tasks = self.send(self.http.get(url)).await?.json().await?;
      Ok(tasks)
    }
    .boxed()
  }

  fn insert_task<'a>(
    &'a self,
    identity: &'a Identity,
    task: &'a Task,
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(TASKS_TABLE, &[])?;
      let row = TaskRow {
        task,
        user_id: &identity.id,
      };
      self.send(self.http.post(url).json(&row)).await?;
      Ok(())
    }
    .boxed()
  }

  fn update_task<'a>(
    &'a self,
    id: TaskId,
    fields: &'a TaskFields,
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(TASKS_TABLE, &[Self::id_filter(id)])?;
      self.send(self.http.patch(url).json(fields)).await?;
      Ok(())
    }
    .boxed()
  }

  fn set_task_completion(
    &self,
    id: TaskId,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
  ) -> BoxFuture<'_, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(TASKS_TABLE, &[Self::id_filter(id)])?;
      let patch = CompletionPatch {
        completed,
        completed_at,
      };
      self.send(self.http.patch(url).json(&patch)).await?;
      Ok(())
    }
    .boxed()
  }

  fn delete_task(&self, id: TaskId) -> BoxFuture<'_, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(TASKS_TABLE, &[Self::id_filter(id)])?;
      self.send(self.http.delete(url)).await?;
      Ok(())
    }
    .boxed()
  }

  fn upsert_tasks<'a>(
    &'a self,
    identity: &'a Identity,
    tasks: &'a [Task],
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(TASKS_TABLE, &[("on_conflict", "id".to_string())])?;
      let rows: Vec<TaskRow<'_>> = tasks
        .iter()
        .map(|task| TaskRow {
          task,
          user_id: &identity.id,
        })
        .collect();
      let request = self
        .http
        .post(url)
        .header("Prefer", "resolution=merge-duplicates")
        .json(&rows);
      self.send(request).await?;
      Ok(())
    }
    .boxed()
  }

  fn list_sessions<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<Session>, RemoteError>> {
    async move {
      let url = self.table_url(
        SESSIONS_TABLE,
        &[("select", "*".to_string()), Self::user_filter(identity)],
      )?;
      let sessions = self.send(self.http.get(url)).await?.json().await?;
      Ok(sessions)
    }
    .boxed()
  }

  fn insert_sessions<'a>(
    &'a self,
    identity: &'a Identity,
    sessions: &'a [Session],
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      let url = self.table_url(SESSIONS_TABLE, &[])?;
      let rows: Vec<SessionRow<'_>> = sessions
        .iter()
        .map(|session| SessionRow {
          session,
          user_id: &identity.id,
        })
        .collect();
      self.send(self.http.post(url).json(&rows)).await?;
      Ok(())
    }
    .boxed()
  }

  fn list_deadline_dates<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<NaiveDate>, RemoteError>> {
    async move {
      let url = self.table_url(
        TASKS_TABLE,
        &[
          ("select", "deadline".to_string()),
          ("completed", "eq.false".to_string()),
          ("deadline", "not.is.null".to_string()),
          Self::user_filter(identity),
        ],
      )?;
      let rows: Vec<DeadlineRow> = self.send(self.http.get(url)).await?.json().await?;
      Ok(
        rows
          .into_iter()
          .filter_map(|row| row.deadline?.parse().ok())
          .collect(),
      )
    }
    .boxed()
  }

  fn refresh_session(&self) -> BoxFuture<'_, Result<(), RemoteError>> {
    self.refresh().boxed()
  }
}
