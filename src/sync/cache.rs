//! In-memory task cache mediating between the UI and the active store.
//!
//! The cache owns the task list for the lifetime of a session. Reads are served
//! from memory once loaded. Mutations are applied to memory first and written to
//! the backing store in the background; a failed write drops the cache and
//! reloads from the store, which is the source of truth.
//!
//! Two counters guard against stale fetches overwriting newer state:
//! - `generation` is bumped by every optimistic mutation
//! - `epoch` is bumped by every full invalidation (sign-in, sign-out, failed write)
//!
//! A fetch records both when it is issued. If either moved by the time it
//! resolves, its result is dropped.

use chrono::{Duration, NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{next_task_id, Identity, Task, TaskFields, TaskId, TaskInput};
use crate::remote::{RemoteAdapter, RemoteError};
use crate::store::{Backend, Stores};
use crate::views;

type FetchResult = Result<Vec<Task>, Arc<RemoteError>>;

/// A remote fetch that concurrent loads can share.
#[derive(Clone)]
struct Inflight {
  id: u64,
  generation: u64,
  epoch: u64,
  fetch: Shared<BoxFuture<'static, FetchResult>>,
}

#[derive(Default)]
struct CacheState {
  /// `None` means unloaded or invalidated
  tasks: Option<Vec<Task>>,
  generation: u64,
  epoch: u64,
  inflight: Option<Inflight>,
  next_fetch_id: u64,
}

struct Inner {
  stores: Arc<Stores>,
  retention: Duration,
  state: Mutex<CacheState>,
  snapshots: watch::Sender<Vec<Task>>,
  /// Background writes not yet finished
  pending: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the shared task cache. Clones share state.
#[derive(Clone)]
pub struct SyncCache {
  inner: Arc<Inner>,
}

impl SyncCache {
  pub fn new(stores: Arc<Stores>, retention: Duration) -> Self {
    let (snapshots, _) = watch::channel(Vec::new());
    Self {
      inner: Arc::new(Inner {
        stores,
        retention,
        state: Mutex::new(CacheState::default()),
        snapshots,
        pending: Mutex::new(Vec::new()),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, CacheState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Every snapshot produced by a load, including background reloads.
  #[cfg(test)]
  pub fn subscribe(&self) -> watch::Receiver<Vec<Task>> {
    self.inner.snapshots.subscribe()
  }

  #[cfg(test)]
  pub fn generation(&self) -> u64 {
    self.state().generation
  }

  #[cfg(test)]
  pub fn is_loaded(&self) -> bool {
    self.state().tasks.is_some()
  }

  /// Return the task list sorted by deadline (undated last).
  ///
  /// Served from memory unless nothing is cached or `force_refresh` is set.
  /// `None` means a remote read failed and there was nothing to fall back on;
  /// callers should keep showing whatever they had.
  pub async fn load(&self, force_refresh: bool) -> Option<Vec<Task>> {
    let cached = if force_refresh {
      None
    } else {
      self.sorted_cache()
    };

    let tasks = match cached {
      Some(tasks) => tasks,
      None => self.load_fresh(force_refresh).await?,
    };

    self.inner.snapshots.send_replace(tasks.clone());
    Some(tasks)
  }

  fn sorted_cache(&self) -> Option<Vec<Task>> {
    let mut state = self.state();
    let tasks = state.tasks.as_mut()?;
    sort_by_deadline(tasks);
    Some(tasks.clone())
  }

  async fn load_fresh(&self, force_refresh: bool) -> Option<Vec<Task>> {
    let backend = self.inner.stores.backend();
    let fetched = match &backend {
      Backend::Remote(remote, identity) => {
        let inflight = self.join_or_start_fetch(Arc::clone(remote), identity.clone());
        let result = inflight.fetch.clone().await;
        match self.settle_fetch(&inflight, result, force_refresh) {
          Fetched::Fresh(tasks) => tasks,
          Fetched::Settled(tasks) => return tasks,
        }
      }
      Backend::Local => self.inner.stores.local.read_all().tasks,
    };

    let cutoff = Utc::now() - self.inner.retention;
    let (expired, mut tasks): (Vec<Task>, Vec<Task>) =
      fetched.into_iter().partition(|task| task.is_expired(cutoff));
    sort_by_deadline(&mut tasks);

    if !expired.is_empty() {
      info!(count = expired.len(), "removing completed tasks past retention");
    }

    match &backend {
      Backend::Remote(remote, _) => {
        for task in expired {
          let remote = Arc::clone(remote);
          self.track(tokio::spawn(async move {
            if let Err(e) = remote.delete_task(task.id).await {
              warn!(task_id = task.id, error = %e, "retention delete failed");
            }
          }));
        }
      }
      Backend::Local => {
        let mut data = self.inner.stores.local.read_all();
        data.tasks = tasks.clone();
        self.inner.stores.persist_local(&data);
      }
    }

    self.state().tasks = Some(tasks.clone());
    Some(tasks)
  }

  fn join_or_start_fetch(&self, remote: Arc<RemoteAdapter>, identity: Identity) -> Inflight {
    let mut state = self.state();
    if let Some(inflight) = &state.inflight {
      debug!(fetch = inflight.id, "joining in-flight task fetch");
      return inflight.clone();
    }

    state.next_fetch_id += 1;
    let fetch = async move { remote.list_tasks(&identity).await.map_err(Arc::new) }
      .boxed()
      .shared();
    let inflight = Inflight {
      id: state.next_fetch_id,
      generation: state.generation,
      epoch: state.epoch,
      fetch,
    };
    state.inflight = Some(inflight.clone());
    inflight
  }

  /// Decide what a finished fetch means for the cache.
  fn settle_fetch(&self, inflight: &Inflight, result: FetchResult, force_refresh: bool) -> Fetched {
    let mut state = self.state();
    if state.inflight.as_ref().is_some_and(|f| f.id == inflight.id) {
      state.inflight = None;
    }

    let superseded = state.epoch != inflight.epoch || state.generation != inflight.generation;
    match result {
      Ok(_) if superseded => {
        debug!(fetch = inflight.id, "discarding fetch superseded by local changes");
        Fetched::Settled(state.tasks.clone())
      }
      Ok(tasks) => Fetched::Fresh(tasks),
      Err(e) => {
        warn!(error = %e, "task fetch failed");
        if force_refresh {
          Fetched::Settled(state.tasks.clone())
        } else {
          Fetched::Settled(None)
        }
      }
    }
  }

  fn track(&self, handle: JoinHandle<()>) {
    let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
  }

  /// Wait for background writes, including any reload a failed write starts.
  pub async fn flush(&self) {
    loop {
      let handles: Vec<JoinHandle<()>> = std::mem::take(
        &mut *self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner),
      );
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        if let Err(e) = handle.await {
          warn!(error = %e, "background write task aborted");
        }
      }
    }
  }

  /// Drop everything cached, abandoning any in-flight fetch.
  pub fn invalidate_all(&self) {
    let mut state = self.state();
    state.tasks = None;
    state.inflight = None;
    state.epoch += 1;
    debug!(epoch = state.epoch, "task cache invalidated");
  }

  /// Apply `mutate` to the cached list if there is one. Returns whether it did.
  fn mutate_cached(&self, mutate: impl FnOnce(&mut Vec<Task>)) -> bool {
    let mut state = self.state();
    match state.tasks.as_mut() {
      Some(tasks) => {
        mutate(tasks);
        state.generation += 1;
        true
      }
      None => false,
    }
  }

  /// Optimistic remote mutation.
  ///
  /// With a cache: apply in memory now, write in the background, and on failure
  /// invalidate and reload. Without one: wait for the write, then invalidate
  /// (abandoning any fetch still in flight) so the next load starts clean.
  async fn write_through<W>(&self, op: &'static str, mutate: impl FnOnce(&mut Vec<Task>), write: W)
  where
    W: Future<Output = Result<(), RemoteError>> + Send + 'static,
  {
    if self.mutate_cached(mutate) {
      let cache = self.clone();
      self.track(tokio::spawn(async move {
        if let Err(e) = write.await {
          warn!(op, error = %e, "background write failed, reloading from store");
          cache.invalidate_all();
          cache.load(false).await;
        }
      }));
    } else {
      if let Err(e) = write.await {
        warn!(op, error = %e, "write failed");
      }
      // A fetch issued before the write saw the old rows
      self.invalidate_all();
    }
  }

  /// Local mode: the store is both target and source, so edit it directly.
  fn write_local(&self, edit: impl FnOnce(&mut Vec<Task>) -> bool) -> bool {
    let mut data = self.inner.stores.local.read_all();
    if !edit(&mut data.tasks) {
      return false;
    }
    self.inner.stores.persist_local(&data);
    true
  }

  /// Create a task. Invalid input is ignored and yields `None`.
  pub async fn add(&self, input: &TaskInput) -> Option<Task> {
    let Some(fields) = input.validate() else {
      debug!("rejected task input");
      return None;
    };
    let task = Task::new(next_task_id(), fields, Utc::now());

    match self.inner.stores.backend() {
      Backend::Local => {
        self.write_local(|tasks| {
          tasks.push(task.clone());
          true
        });
        self.mutate_cached(|tasks| tasks.push(task.clone()));
      }
      Backend::Remote(remote, identity) => {
        let row = task.clone();
        let write = async move { remote.insert_task(&identity, &row).await };
        self
          .write_through("insert_task", |tasks| tasks.push(task.clone()), write)
          .await;
      }
    }

    self.refresh_views().await;
    Some(task)
  }

  /// Replace the editable fields of a task. Returns `false` when the input is
  /// invalid or, in local mode, the task does not exist.
  pub async fn update(&self, id: TaskId, input: &TaskInput) -> bool {
    let Some(fields) = input.validate() else {
      debug!(task_id = id, "rejected task input");
      return false;
    };

    match self.inner.stores.backend() {
      Backend::Local => {
        let found = self.write_local(|tasks| apply_to(tasks, id, |task| task.apply(&fields)));
        if !found {
          return false;
        }
        self.mutate_cached(|tasks| {
          apply_to(tasks, id, |task| task.apply(&fields));
        });
      }
      Backend::Remote(remote, _) => {
        let patch: TaskFields = fields.clone();
        let write = async move { remote.update_task(id, &patch).await };
        self
          .write_through(
            "update_task",
            |tasks| {
              apply_to(tasks, id, |task| task.apply(&fields));
            },
            write,
          )
          .await;
      }
    }

    self.refresh_views().await;
    true
  }

  /// Mark a task done or not done; `completed_at` follows.
  pub async fn toggle_complete(&self, id: TaskId, completed: bool) {
    let now = Utc::now();
    let completed_at = completed.then_some(now);

    match self.inner.stores.backend() {
      Backend::Local => {
        self.write_local(|tasks| apply_to(tasks, id, |task| task.set_completed(completed, now)));
        self.mutate_cached(|tasks| {
          apply_to(tasks, id, |task| task.set_completed(completed, now));
        });
      }
      Backend::Remote(remote, _) => {
        let write = async move { remote.set_task_completion(id, completed, completed_at).await };
        self
          .write_through(
            "set_task_completion",
            |tasks| {
              apply_to(tasks, id, |task| task.set_completed(completed, now));
            },
            write,
          )
          .await;
      }
    }

    self.refresh_views().await;
  }

  pub async fn delete(&self, id: TaskId) {
    match self.inner.stores.backend() {
      Backend::Local => {
        self.write_local(|tasks| {
          tasks.retain(|task| task.id != id);
          true
        });
        self.mutate_cached(|tasks| tasks.retain(|task| task.id != id));
      }
      Backend::Remote(remote, _) => {
        let write = async move { remote.delete_task(id).await };
        self
          .write_through("delete_task", |tasks| tasks.retain(|task| task.id != id), write)
          .await;
      }
    }

    self.refresh_views().await;
  }

  /// Re-derive the snapshot after a mutation so subscribers re-render.
  async fn refresh_views(&self) {
    self.load(false).await;
  }

  /// Look a task up by id, loading if needed.
  pub async fn get(&self, id: TaskId) -> Option<Task> {
    self
      .load(false)
      .await?
      .into_iter()
      .find(|task| task.id == id)
  }

  /// Dates to mark on the calendar: deadlines of tasks not yet done.
  pub async fn deadline_dates(&self) -> BTreeSet<NaiveDate> {
    let cached = self.state().tasks.clone();
    if let Some(tasks) = cached {
      return views::deadline_dates(&tasks);
    }

    match self.inner.stores.backend() {
      Backend::Remote(remote, identity) => match remote.list_deadline_dates(&identity).await {
        Ok(dates) => dates.into_iter().collect(),
        Err(e) => {
          warn!(error = %e, "deadline fetch failed");
          BTreeSet::new()
        }
      },
      Backend::Local => views::deadline_dates(&self.inner.stores.local.read_all().tasks),
    }
  }
}

enum Fetched {
  /// Accepted fetch result, still to be swept and stored
  Fresh(Vec<Task>),
  /// Nothing to store; return this as-is
  Settled(Option<Vec<Task>>),
}

/// Dated tasks first, ascending; undated tasks keep their relative order.
fn sort_by_deadline(tasks: &mut [Task]) {
  tasks.sort_by(|a, b| match (a.deadline, b.deadline) {
    (Some(a), Some(b)) => a.cmp(&b),
    (Some(_), None) => std::cmp::Ordering::Less,
    (None, Some(_)) => std::cmp::Ordering::Greater,
    (None, None) => std::cmp::Ordering::Equal,
  });
}

/// Run `edit` on the task with `id`. Returns whether it was found.
fn apply_to(tasks: &mut [Task], id: TaskId, edit: impl FnOnce(&mut Task)) -> bool {
  match tasks.iter_mut().find(|task| task.id == id) {
    Some(task) => {
      edit(task);
      true
    }
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Category, Priority, Quadrant, StoreData, Urgency};
  use crate::testing::{identity, local_stores, settle, stores_with, MemoryRemote};

  fn input(name: &str, minutes: u32) -> TaskInput {
    TaskInput {
      name: name.to_string(),
      minutes,
      ..Default::default()
    }
  }

  fn task(id: TaskId, name: &str, deadline: Option<&str>) -> Task {
    let mut task = Task::new(id, input(name, 30).validate().unwrap(), Utc::now());
    task.deadline = deadline.map(|d| d.parse().unwrap());
    task
  }

  fn completed_days_ago(id: TaskId, days: i64) -> Task {
    let mut task = task(id, &format!("done-{}", id), None);
    task.set_completed(true, Utc::now() - Duration::days(days));
    task
  }

  fn retention() -> Duration {
    Duration::days(7)
  }

  fn signed_in(remote: &Arc<MemoryRemote>) -> SyncCache {
    let stores = stores_with(remote);
    stores.set_identity(Some(identity("u1")));
    SyncCache::new(stores, retention())
  }

  #[tokio::test]
  async fn test_second_load_is_served_from_memory() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);

    let first = cache.load(false).await.unwrap();
    let second = cache.load(false).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(remote.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_sorts_by_deadline_with_undated_last() {
    let stores = local_stores();
    stores.persist_local(&StoreData {
      tasks: vec![
        task(1, "later", Some("2024-05-01")),
        task(2, "undated", None),
        task(3, "sooner", Some("2024-04-01")),
      ],
      sessions: Vec::new(),
    });
    let cache = SyncCache::new(stores, retention());

    let names: Vec<String> = cache
      .load(false)
      .await
      .unwrap()
      .into_iter()
      .map(|t| t.name)
      .collect();
    assert_eq!(names, vec!["sooner", "later", "undated"]);
  }

  #[tokio::test]
  async fn test_retention_sweep_local() {
    let stores = local_stores();
    stores.persist_local(&StoreData {
      tasks: vec![completed_days_ago(1, 8), completed_days_ago(2, 6)],
      sessions: Vec::new(),
    });
    let cache = SyncCache::new(stores.clone(), retention());

    let ids: Vec<TaskId> = cache.load(false).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![2]);

    let stored: Vec<TaskId> = stores.local.read_all().tasks.iter().map(|t| t.id).collect();
    assert_eq!(stored, vec![2]);
  }

  #[tokio::test]
  async fn test_retention_sweep_remote_issues_delete() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", completed_days_ago(1, 8));
    remote.seed_task("u1", completed_days_ago(2, 6));
    let cache = signed_in(&remote);

    let ids: Vec<TaskId> = cache.load(false).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![2]);

    settle().await;
    assert_eq!(remote.deleted(), vec![1]);
  }

  #[tokio::test]
  async fn test_local_add_stores_estimate_and_lands_in_do_quadrant() {
    let stores = local_stores();
    let cache = SyncCache::new(stores.clone(), retention());

    let form = TaskInput {
      name: "Essay".to_string(),
      hours: 1,
      minutes: 30,
      category: Category::University,
      priority: Priority::High,
      urgency: Urgency::Critical,
      ..Default::default()
    };
    let added = cache.add(&form).await.unwrap();
    assert_eq!(added.estimated_minutes, 90);
    assert_eq!(stores.local.read_all().tasks, vec![added.clone()]);

    let tasks = cache.load(false).await.unwrap();
    let matrix = views::matrix(&tasks, Category::University);
    assert_eq!(matrix.cell(Quadrant::Do).len(), 1);
    assert_eq!(matrix.cell(Quadrant::Do)[0].name, "Essay");
  }

  #[tokio::test]
  async fn test_invalid_input_is_a_no_op() {
    let stores = local_stores();
    let cache = SyncCache::new(stores.clone(), retention());
    cache.load(false).await;
    let generation = cache.generation();

    assert!(cache.add(&input("Nothing", 0)).await.is_none());
    assert!(!cache.update(1, &input("", 10)).await);
    assert_eq!(cache.generation(), generation);
    assert!(stores.local.read_all().tasks.is_empty());
  }

  #[tokio::test]
  async fn test_toggle_sets_and_clears_completed_at() {
    let cache = SyncCache::new(local_stores(), retention());
    let added = cache.add(&input("Essay", 30)).await.unwrap();

    cache.toggle_complete(added.id, true).await;
    let done = cache.get(added.id).await.unwrap();
    assert!(done.completed);
    assert!(done.completed_at.is_some());

    cache.toggle_complete(added.id, false).await;
    let undone = cache.get(added.id).await.unwrap();
    assert!(!undone.completed);
    assert_eq!(undone.completed_at, None);
  }

  #[tokio::test]
  async fn test_local_update_and_delete() {
    let stores = local_stores();
    let cache = SyncCache::new(stores.clone(), retention());
    let added = cache.add(&input("Draft", 20)).await.unwrap();

    assert!(cache.update(added.id, &input("Final draft", 40)).await);
    let updated = cache.get(added.id).await.unwrap();
    assert_eq!(updated.name, "Final draft");
    assert_eq!(updated.estimated_minutes, 40);
    assert_eq!(updated.created_at, added.created_at);

    assert!(!cache.update(added.id + 1000, &input("Ghost", 10)).await);

    cache.delete(added.id).await;
    assert!(cache.get(added.id).await.is_none());
    assert!(stores.local.read_all().tasks.is_empty());
  }

  #[tokio::test]
  async fn test_optimistic_add_visible_before_write_resolves() {
    let remote = Arc::new(MemoryRemote::new());
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    let added = cache.add(&input("Essay", 30)).await.unwrap();

    // The background write has not run yet
    assert!(remote.tasks_for("u1").is_empty());
    let tasks = cache.load(false).await.unwrap();
    assert_eq!(tasks, vec![added.clone()]);

    cache.flush().await;
    assert_eq!(remote.tasks_for("u1"), vec![added]);
  }

  #[tokio::test]
  async fn test_failed_write_reconciles_from_store() {
    let remote = Arc::new(MemoryRemote::new());
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.fail_writes(true);
    let added = cache.add(&input("Essay", 30)).await.unwrap();
    assert_eq!(cache.load(false).await.unwrap(), vec![added]);

    let mut snapshots = cache.subscribe();
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
      loop {
        snapshots.changed().await.unwrap();
        if snapshots.borrow().is_empty() {
          break;
        }
      }
    })
    .await
    .unwrap();

    assert!(cache.load(false).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_write_without_cache_waits_then_invalidates() {
    let remote = Arc::new(MemoryRemote::new());
    let cache = signed_in(&remote);

    let added = cache.add(&input("Essay", 30)).await.unwrap();

    // The write landed before the reload, so the reload sees it
    assert_eq!(remote.tasks_for("u1"), vec![added.clone()]);
    assert_eq!(cache.load(false).await.unwrap(), vec![added]);
    assert_eq!(remote.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_write_without_cache_discards_fetch_issued_before_it() {
    let remote = Arc::new(MemoryRemote::new());
    remote.hold_reads();
    let cache = signed_in(&remote);

    // This read sees the store before the insert
    let loading = cache.clone();
    let load = tokio::spawn(async move { loading.load(false).await });
    settle().await;
    assert_eq!(remote.list_calls(), 1);

    let adding = cache.clone();
    let add = tokio::spawn(async move { adding.add(&input("Essay", 30)).await });
    settle().await;
    assert_eq!(remote.tasks_for("u1").len(), 1);

    remote.release_reads(2);
    load.await.unwrap();
    let added = add.await.unwrap().unwrap();

    assert_eq!(cache.load(false).await.unwrap(), vec![added]);
    assert_eq!(remote.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_optimistic_update_visible_before_write_resolves() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();
    let generation = cache.generation();

    assert!(cache.update(1, &input("Essay draft", 45)).await);
    assert_eq!(cache.generation(), generation + 1);
    assert_eq!(remote.tasks_for("u1")[0].name, "Essay");

    let updated = cache.get(1).await.unwrap();
    assert_eq!(updated.name, "Essay draft");
    assert_eq!(updated.estimated_minutes, 45);

    cache.flush().await;
    assert_eq!(remote.tasks_for("u1")[0].name, "Essay draft");
    assert_eq!(remote.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_failed_update_reconciles_from_store() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.fail_writes(true);
    assert!(cache.update(1, &input("Essay draft", 45)).await);
    assert_eq!(cache.get(1).await.unwrap().name, "Essay draft");

    cache.flush().await;
    assert_eq!(cache.get(1).await.unwrap().name, "Essay");
    assert_eq!(remote.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_optimistic_delete_visible_before_write_resolves() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    remote.seed_task("u1", task(2, "Lab report", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();
    let generation = cache.generation();

    cache.delete(1).await;
    assert_eq!(cache.generation(), generation + 1);
    assert_eq!(remote.tasks_for("u1").len(), 2);
    let ids: Vec<TaskId> = cache.load(false).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![2]);

    cache.flush().await;
    assert_eq!(remote.deleted(), vec![1]);
    assert_eq!(remote.tasks_for("u1").len(), 1);
  }

  #[tokio::test]
  async fn test_failed_delete_reconciles_from_store() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    remote.seed_task("u1", task(2, "Lab report", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.fail_writes(true);
    cache.delete(1).await;
    assert!(cache.get(1).await.is_none());

    cache.flush().await;
    let ids: Vec<TaskId> = cache.load(false).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(remote.deleted().is_empty());
  }

  #[tokio::test]
  async fn test_optimistic_toggle_and_failed_toggle() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    cache.toggle_complete(1, true).await;
    assert!(!remote.tasks_for("u1")[0].completed);
    assert!(cache.get(1).await.unwrap().completed);
    cache.flush().await;
    let stored = &remote.tasks_for("u1")[0];
    assert!(stored.completed);
    assert!(stored.completed_at.is_some());

    remote.fail_writes(true);
    cache.toggle_complete(1, false).await;
    assert!(!cache.get(1).await.unwrap().completed);
    cache.flush().await;
    assert!(cache.get(1).await.unwrap().completed);
  }

  #[tokio::test]
  async fn test_update_and_delete_without_cache_wait_for_write() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    remote.seed_task("u1", task(2, "Lab report", None));
    let cache = signed_in(&remote);

    assert!(cache.update(1, &input("Essay draft", 45)).await);
    assert_eq!(remote.tasks_for("u1")[0].name, "Essay draft");
    assert_eq!(cache.get(1).await.unwrap().name, "Essay draft");
    assert_eq!(remote.list_calls(), 1);

    cache.invalidate_all();
    cache.delete(2).await;
    assert_eq!(remote.deleted(), vec![2]);
    let ids: Vec<TaskId> = cache.load(false).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1]);
    assert_eq!(remote.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_forced_refresh_discarded_after_concurrent_mutation() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.hold_reads();
    let refreshing = cache.clone();
    let refresh = tokio::spawn(async move { refreshing.load(true).await });
    settle().await;
    assert_eq!(remote.list_calls(), 2);

    // Mutation lands while the refresh is outstanding
    cache.toggle_complete(1, true).await;
    remote.release_reads(1);

    let refreshed = refresh.await.unwrap().unwrap();
    assert!(refreshed[0].completed);
    assert!(cache.get(1).await.unwrap().completed);
  }

  #[tokio::test]
  async fn test_forced_refresh_replaces_cache_when_nothing_changed() {
    let remote = Arc::new(MemoryRemote::new());
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.seed_task("u1", task(7, "From another device", None));
    let refreshed = cache.load(true).await.unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(cache.load(false).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_fetch() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    remote.hold_reads();
    let cache = signed_in(&remote);

    let (a, b, _) = tokio::join!(cache.load(false), cache.load(false), async {
      settle().await;
      remote.release_reads(1);
    });

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(remote.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_failed_forced_refresh_keeps_stale_cache() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    let cache = signed_in(&remote);
    cache.load(false).await.unwrap();

    remote.fail_next_calls(2);
    let tasks = cache.load(true).await.unwrap();
    assert_eq!(tasks.len(), 1);
  }

  #[tokio::test]
  async fn test_failed_first_load_leaves_cache_empty() {
    let remote = Arc::new(MemoryRemote::new());
    let cache = signed_in(&remote);

    remote.fail_next_calls(2);
    assert!(cache.load(false).await.is_none());
    assert!(!cache.is_loaded());
  }

  #[tokio::test]
  async fn test_fetch_abandoned_by_invalidation_is_ignored() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", None));
    remote.hold_reads();
    let cache = signed_in(&remote);

    let loading = cache.clone();
    let load = tokio::spawn(async move { loading.load(false).await });
    settle().await;

    cache.invalidate_all();
    remote.release_reads(1);

    assert!(load.await.unwrap().is_none());
    assert!(!cache.is_loaded());
  }

  #[tokio::test]
  async fn test_deadline_dates_skip_completed() {
    let cache = SyncCache::new(local_stores(), retention());
    let mut form = input("Essay", 30);
    form.deadline = Some("2024-05-01".parse().unwrap());
    let essay = cache.add(&form).await.unwrap();
    form.name = "Lab report".to_string();
    form.deadline = Some("2024-05-03".parse().unwrap());
    cache.add(&form).await.unwrap();

    cache.toggle_complete(essay.id, true).await;
    let dates: Vec<NaiveDate> = cache.deadline_dates().await.into_iter().collect();
    assert_eq!(dates, vec!["2024-05-03".parse::<NaiveDate>().unwrap()]);
  }

  #[tokio::test]
  async fn test_deadline_dates_from_remote_before_load() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_task("u1", task(1, "Essay", Some("2024-06-01")));
    let cache = signed_in(&remote);

    let dates = cache.deadline_dates().await;
    assert!(dates.contains(&"2024-06-01".parse().unwrap()));
    assert_eq!(remote.list_calls(), 0);
  }
}
