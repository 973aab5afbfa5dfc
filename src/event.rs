use tokio::sync::mpsc;

use crate::model::Identity;

/// What the auth service reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
  SignedIn,
  SignedOut,
  /// Token refresh, user update and anything else that is not a definite transition
  Other,
}

/// Auth state change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
  pub kind: AuthEventKind,
  pub identity: Option<Identity>,
}

impl AuthEvent {
  pub fn signed_in(identity: Identity) -> Self {
    Self {
      kind: AuthEventKind::SignedIn,
      identity: Some(identity),
    }
  }

  pub fn signed_out() -> Self {
    Self {
      kind: AuthEventKind::SignedOut,
      identity: None,
    }
  }

  pub fn other(identity: Option<Identity>) -> Self {
    Self {
      kind: AuthEventKind::Other,
      identity,
    }
  }
}

/// Channel carrying auth notifications from the remote client to the app
pub struct AuthEvents {
  tx: mpsc::UnboundedSender<AuthEvent>,
  rx: mpsc::UnboundedReceiver<AuthEvent>,
}

impl AuthEvents {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender handed to whoever talks to the auth service
  pub fn sender(&self) -> mpsc::UnboundedSender<AuthEvent> {
    self.tx.clone()
  }

  /// Take an already queued event without waiting
  pub fn try_next(&mut self) -> Option<AuthEvent> {
    self.rx.try_recv().ok()
  }
}
