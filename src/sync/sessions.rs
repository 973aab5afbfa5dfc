use chrono::{Local, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::config::ModesConfig;
use crate::model::{Session, Task, TimerMode};
use crate::store::{Backend, Stores};
use crate::views::{self, DailyStats, Insights, WeekRange};

#[derive(Default)]
struct SessionState {
  sessions: Option<Vec<Session>>,
  epoch: u64,
}

/// Append-only session history with a read cache.
pub struct SessionLog {
  stores: Arc<Stores>,
  modes: ModesConfig,
  state: Mutex<SessionState>,
}

impl SessionLog {
  pub fn new(stores: Arc<Stores>, modes: ModesConfig) -> Self {
    Self {
      stores,
      modes,
      state: Mutex::new(SessionState::default()),
    }
  }

  fn state(&self) -> MutexGuard<'_, SessionState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn invalidate(&self) {
    let mut state = self.state();
    state.sessions = None;
    state.epoch += 1;
  }

  /// Record a finished work interval of `mode`, optionally against a task name.
  pub async fn log(&self, mode: TimerMode, task: Option<String>) -> Session {
    let session = Session::new(mode, task, self.modes.work_minutes(mode), Utc::now());

    match self.stores.backend() {
      Backend::Remote(remote, identity) => {
        if let Err(e) = remote.insert_session(&identity, &session).await {
          warn!(error = %e, "session log failed");
        }
      }
      Backend::Local => {
        let mut data = self.stores.local.read_all();
        data.sessions.push(session.clone());
        self.stores.persist_local(&data);
      }
    }

    self.invalidate();
    session
  }

  /// Cached history, fetched on first use. `None` when the remote read failed.
  pub async fn load(&self) -> Option<Vec<Session>> {
    let epoch = {
      let state = self.state();
      if let Some(sessions) = &state.sessions {
        return Some(sessions.clone());
      }
      state.epoch
    };

    let sessions = match self.stores.backend() {
      Backend::Remote(remote, identity) => match remote.list_sessions(&identity).await {
        Ok(sessions) => sessions,
        Err(e) => {
          warn!(error = %e, "session fetch failed");
          return None;
        }
      },
      Backend::Local => self.stores.local.read_all().sessions,
    };

    let mut state = self.state();
    if state.epoch == epoch {
      state.sessions = Some(sessions.clone());
    } else {
      debug!("session history invalidated during fetch, not caching");
    }
    Some(sessions)
  }

  /// Today's totals; `None` when history could not be read.
  pub async fn stats(&self) -> Option<DailyStats> {
    let sessions = self.load().await?;
    Some(views::daily_stats(&sessions, Local::now().date_naive()))
  }

  /// Weekly report. An unreadable history reads as an empty week.
  pub async fn insights(&self, tasks: &[Task], week: WeekRange) -> Insights {
    let sessions = self.load().await.unwrap_or_default();
    views::insights(&sessions, tasks, week)
  }
}
