//! Store selection: local storage when signed out, the remote backend when signed in.

mod local;

pub use local::{LocalStore, AUTH_SESSION_KEY};

use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::model::{Identity, StoreData};
use crate::remote::RemoteAdapter;

/// Where reads and writes go right now.
#[derive(Clone)]
pub enum Backend {
  Local,
  Remote(Arc<RemoteAdapter>, Identity),
}

/// The two stores plus the current identity.
pub struct Stores {
  pub local: Arc<LocalStore>,
  remote: Option<Arc<RemoteAdapter>>,
  identity: Mutex<Option<Identity>>,
}

impl Stores {
  pub fn new(local: LocalStore, remote: Option<RemoteAdapter>) -> Self {
    Self {
      local: Arc::new(local),
      remote: remote.map(Arc::new),
      identity: Mutex::new(None),
    }
  }

  /// Remote only when a backend is configured and someone is signed in.
  pub fn backend(&self) -> Backend {
    match (&self.remote, self.identity()) {
      (Some(remote), Some(identity)) => Backend::Remote(Arc::clone(remote), identity),
      _ => Backend::Local,
    }
  }

  pub fn remote(&self) -> Option<Arc<RemoteAdapter>> {
    self.remote.clone()
  }

  pub fn identity(&self) -> Option<Identity> {
    self
      .identity
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_identity(&self, identity: Option<Identity>) {
    *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
  }

  /// Write local data, logging instead of failing.
  pub fn persist_local(&self, data: &StoreData) {
    if let Err(e) = self.local.write_all(data) {
      warn!(error = %e, "local write failed");
    }
  }
}
