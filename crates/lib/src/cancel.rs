//! Cooperative cancellation of a build.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared cancellation flag.
///
/// Cancelling is one-way: once set the flag never clears. Rules that have not
/// started executing refuse to start, and a rule that is executing stops
/// after its current step finishes.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives in `self`, so the channel cannot close while we wait.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}
