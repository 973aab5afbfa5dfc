//! Reacts to sign-in and sign-out notifications: switches the active store,
//! resets the caches, and moves local data to the remote store the first time
//! a user signs in.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::event::{AuthEvent, AuthEventKind};
use crate::model::Identity;
use crate::store::Stores;
use crate::sync::{SessionLog, SyncCache};

/// What handling an auth notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  /// Startup has not finished; queued for later
  Deferred,
  SignedIn,
  SignedOut,
  Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
  AlreadyMigrated,
  Migrated { tasks: usize, sessions: usize },
  /// Some step failed; the flag stays unset so the next sign-in tries again
  Failed,
}

#[derive(Default)]
struct InitGuard {
  ready: bool,
  pending: VecDeque<AuthEvent>,
}

pub struct IdentityLifecycle {
  stores: Arc<Stores>,
  tasks: SyncCache,
  sessions: Arc<SessionLog>,
  guard: Mutex<InitGuard>,
}

impl IdentityLifecycle {
  pub fn new(stores: Arc<Stores>, tasks: SyncCache, sessions: Arc<SessionLog>) -> Self {
    Self {
      stores,
      tasks,
      sessions,
      guard: Mutex::new(InitGuard::default()),
    }
  }

  fn guard(&self) -> MutexGuard<'_, InitGuard> {
    self.guard.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// First load with whatever identity was restored from disk. Notifications
  /// that arrived meanwhile are handled once this is done.
  pub async fn startup(&self, restored: Option<Identity>) {
    if let Some(identity) = &restored {
      info!(user = %identity.id, "restored session");
      self.stores.set_identity(restored.clone());
      self.migrate(identity).await;
    }

    tokio::join!(self.tasks.load(false), self.sessions.load());
    self.tasks.deadline_dates().await;

    self.guard().ready = true;
    debug!("startup load finished");

    while let Some(event) = self.next_pending() {
      self.apply(event).await;
    }
  }

  fn next_pending(&self) -> Option<AuthEvent> {
    self.guard().pending.pop_front()
  }

  /// Handle one auth notification, or queue it if startup is still running.
  pub async fn handle(&self, event: AuthEvent) -> Transition {
    {
      let mut guard = self.guard();
      if !guard.ready {
        debug!(kind = ?event.kind, "deferring auth event until startup completes");
        guard.pending.push_back(event);
        return Transition::Deferred;
      }
    }
    self.apply(event).await
  }

  async fn apply(&self, event: AuthEvent) -> Transition {
    let current = self.stores.identity();
    match (event.kind, event.identity) {
      (AuthEventKind::SignedIn, Some(identity)) => {
        if current.as_ref().is_some_and(|c| c.id == identity.id) {
          return Transition::Ignored;
        }
        self.sign_in(identity).await;
        Transition::SignedIn
      }
      (AuthEventKind::SignedOut, _) => {
        if current.is_none() {
          return Transition::Ignored;
        }
        self.sign_out().await;
        Transition::SignedOut
      }
      (AuthEventKind::Other, Some(identity)) => {
        // Token refresh or profile update for the same user: keep caches
        if current.as_ref().is_some_and(|c| c.id == identity.id) {
          self.stores.set_identity(Some(identity));
        }
        Transition::Ignored
      }
      (kind, _) => {
        debug!(?kind, "ignoring auth event without a definite transition");
        Transition::Ignored
      }
    }
  }

  async fn sign_in(&self, identity: Identity) {
    info!(user = %identity.id, "signed in");
    self.stores.set_identity(Some(identity.clone()));
    self.tasks.invalidate_all();
    self.sessions.invalidate();

    self.migrate(&identity).await;

    self.tasks.load(false).await;
    self.sessions.load().await;
    self.tasks.deadline_dates().await;
  }

  async fn sign_out(&self) {
    info!("signed out");
    self.stores.set_identity(None);
    self.tasks.invalidate_all();
    self.sessions.invalidate();

    self.tasks.load(false).await;
    self.sessions.load().await;
    self.tasks.deadline_dates().await;
  }

  /// Copy local tasks and sessions to the remote store once per user.
  pub async fn migrate(&self, identity: &Identity) -> MigrationOutcome {
    let local = &self.stores.local;
    if local.is_migrated(&identity.id) {
      return MigrationOutcome::AlreadyMigrated;
    }
    let Some(remote) = self.stores.remote() else {
      return MigrationOutcome::Failed;
    };

    let data = local.read_all();
    let mut ok = true;

    if !data.tasks.is_empty() {
      if let Err(e) = remote.upsert_tasks(identity, &data.tasks).await {
        warn!(user = %identity.id, error = %e, "task migration failed");
        ok = false;
      }
    }
    if ok && !data.sessions.is_empty() {
      if let Err(e) = remote.insert_sessions(identity, &data.sessions).await {
        warn!(user = %identity.id, error = %e, "session migration failed");
        ok = false;
      }
    }
    if !ok {
      return MigrationOutcome::Failed;
    }

    if let Err(e) = local.mark_migrated(&identity.id) {
      warn!(user = %identity.id, error = %e, "could not record migration");
      return MigrationOutcome::Failed;
    }

    info!(
      user = %identity.id,
      tasks = data.tasks.len(),
      sessions = data.sessions.len(),
      "migrated local data"
    );
    MigrationOutcome::Migrated {
      tasks: data.tasks.len(),
      sessions: data.sessions.len(),
    }
  }
}
