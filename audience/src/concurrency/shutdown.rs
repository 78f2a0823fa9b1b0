//! Broadcast shutdown for the scheduler and the task workers.
//!
//! A single [`ShutdownTx`] is owned by the [`crate::pipeline::AudiencePipeline`], each component
//! holds its own [`ShutdownRx`]. Once shutdown is requested it stays requested: receivers created
//! afterwards observe it immediately through [`ShutdownRx::is_shutdown`].

use tokio::sync::watch;

/// Sender side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests shutdown of every subscribed component.
    ///
    /// Returns an error when no receiver is alive anymore, which callers usually ignore.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<bool>> {
        self.0.send(true)
    }

    /// Returns whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Creates a new receiver for this channel.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    ///
    /// Resolves immediately if it already was. If the sender is dropped without requesting
    /// shutdown, the future never resolves, since nothing can request it anymore.
    pub async fn wait_for_shutdown(&mut self) {
        if self.0.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a new shutdown channel in the "running" state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
