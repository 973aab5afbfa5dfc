//! In-memory remote backend for tests.

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::model::{Identity, Session, Task, TaskFields, TaskId};
use crate::remote::{RemoteAdapter, RemoteError, RemoteStore, RetryPolicy};
use crate::store::{LocalStore, Stores};

pub fn identity(id: &str) -> Identity {
  Identity {
    id: id.to_string(),
    email: Some(format!("{}@example.com", id)),
  }
}

/// Remote store keeping rows in memory, with knobs for failures and stalls.
#[derive(Default)]
pub struct MemoryRemote {
  tasks: Mutex<Vec<(String, Task)>>,
  sessions: Mutex<Vec<(String, Session)>>,
  list_calls: AtomicUsize,
  refresh_calls: AtomicUsize,
  upsert_calls: AtomicUsize,
  deleted: Mutex<Vec<TaskId>>,
  fail_next: AtomicUsize,
  fail_writes: AtomicBool,
  hang_reads: AtomicBool,
  read_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn seed_task(&self, user: &str, task: Task) {
    self.tasks.lock().unwrap().push((user.to_string(), task));
  }

  pub fn tasks_for(&self, user: &str) -> Vec<Task> {
    self
      .tasks
      .lock()
      .unwrap()
      .iter()
      .filter(|(owner, _)| owner == user)
      .map(|(_, task)| task.clone())
      .collect()
  }

  pub fn sessions_for(&self, user: &str) -> Vec<Session> {
    self
      .sessions
      .lock()
      .unwrap()
      .iter()
      .filter(|(owner, _)| owner == user)
      .map(|(_, session)| session.clone())
      .collect()
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn refresh_calls(&self) -> usize {
    self.refresh_calls.load(Ordering::SeqCst)
  }

  pub fn upsert_calls(&self) -> usize {
    self.upsert_calls.load(Ordering::SeqCst)
  }

  pub fn deleted(&self) -> Vec<TaskId> {
    self.deleted.lock().unwrap().clone()
  }

  /// The next `n` calls of any kind fail as unauthorized.
  pub fn fail_next_calls(&self, n: usize) {
    self.fail_next.store(n, Ordering::SeqCst);
  }

  /// Every write fails until turned off again.
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Reads never complete.
  pub fn hang_reads(&self) {
    self.hang_reads.store(true, Ordering::SeqCst);
  }

  /// Task reads snapshot their rows, then wait for `release_reads` before answering.
  pub fn hold_reads(&self) {
    *self.read_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_reads(&self, n: usize) {
    if let Some(gate) = self.read_gate.lock().unwrap().as_ref() {
      gate.add_permits(n);
    }
  }

  fn take_failure(&self) -> Result<(), RemoteError> {
    let injected = self
      .fail_next
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if injected {
      Err(RemoteError::Unauthorized)
    } else {
      Ok(())
    }
  }

  fn check_write(&self) -> Result<(), RemoteError> {
    self.take_failure()?;
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(RemoteError::Status {
        status: 503,
        message: "unavailable".to_string(),
      });
    }
    Ok(())
  }

  fn update_row(&self, id: TaskId, apply: impl FnOnce(&mut Task)) {
    if let Some((_, task)) = self
      .tasks
      .lock()
      .unwrap()
      .iter_mut()
      .find(|(_, task)| task.id == id)
    {
      apply(task);
    }
  }
}

impl RemoteStore for MemoryRemote {
  fn list_tasks<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<Task>, RemoteError>> {
    async move {
      self.list_calls.fetch_add(1, Ordering::SeqCst);
      if self.hang_reads.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
      }
      self.take_failure()?;
      let mut rows = self.tasks_for(&identity.id);
      rows.sort_by_key(|task| task.id);

      let gate = self.read_gate.lock().unwrap().clone();
      if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
          permit.forget();
        }
      }
      Ok(rows)
    }
    .boxed()
  }

  fn insert_task<'a>(
    &'a self,
    identity: &'a Identity,
    task: &'a Task,
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      self.check_write()?;
      self.seed_task(&identity.id, task.clone());
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
      self.check_write()?;
      self.update_row(id, |task| task.apply(fields));
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
      self.check_write()?;
      self.update_row(id, |task| {
        task.completed = completed;
        task.completed_at = completed_at;
      });
      Ok(())
    }
    .boxed()
  }

  fn delete_task(&self, id: TaskId) -> BoxFuture<'_, Result<(), RemoteError>> {
    async move {
      self.check_write()?;
      self.tasks.lock().unwrap().retain(|(_, task)| task.id != id);
      self.deleted.lock().unwrap().push(id);
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
      self.check_write()?;
      self.upsert_calls.fetch_add(1, Ordering::SeqCst);
      let mut rows = self.tasks.lock().unwrap();
      for task in tasks {
        rows.retain(|(_, existing)| existing.id != task.id);
        rows.push((identity.id.clone(), task.clone()));
      }
      Ok(())
    }
    .boxed()
  }

  fn list_sessions<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<Session>, RemoteError>> {
    async move {
      self.take_failure()?;
      Ok(self.sessions_for(&identity.id))
    }
    .boxed()
  }

  fn insert_sessions<'a>(
    &'a self,
    identity: &'a Identity,
    sessions: &'a [Session],
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
      self.check_write()?;
      let mut rows = self.sessions.lock().unwrap();
      rows.extend(sessions.iter().map(|s| (identity.id.clone(), s.clone())));
      Ok(())
    }
    .boxed()
  }

  fn list_deadline_dates<'a>(
    &'a self,
    identity: &'a Identity,
  ) -> BoxFuture<'a, Result<Vec<NaiveDate>, RemoteError>> {
    async move {
      self.take_failure()?;
      Ok(
        self
          .tasks_for(&identity.id)
          .into_iter()
          .filter(|task| !task.completed)
          .filter_map(|task| task.deadline)
          .collect(),
      )
    }
    .boxed()
  }

  fn refresh_session(&self) -> BoxFuture<'_, Result<(), RemoteError>> {
    async move {
      self.refresh_calls.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    .boxed()
  }
}

/// Stores wired to an in-memory local database and `remote`, signed out.
pub fn stores_with(remote: &Arc<MemoryRemote>) -> Arc<Stores> {
  let adapter = RemoteAdapter::new(remote.clone(), RetryPolicy::default());
  Arc::new(Stores::new(
    LocalStore::open_in_memory().unwrap(),
    Some(adapter),
  ))
}

/// Local-only stores.
pub fn local_stores() -> Arc<Stores> {
  Arc::new(Stores::new(LocalStore::open_in_memory().unwrap(), None))
}

/// Give spawned tasks a chance to run on the current-thread test runtime.
pub async fn settle() {
  for _ in 0..20 {
    tokio::task::yield_now().await;
  }
}
