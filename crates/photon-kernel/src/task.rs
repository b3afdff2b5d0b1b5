//! [`TaskHandle`] – owner of one periodic background task.
//!
//! The heartbeat bridge and every sensor monitor run as their own tokio
//! task.  The handle carries a shutdown flag the task polls between ticks
//! and the join handle used to wait for it.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a spawned periodic task.
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `body` on the current runtime.  `body` receives a receiver
    /// that flips to `true` when [`TaskHandle::shutdown`] is called.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(body(rx));
        debug!(task = %name, "task spawned");
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the task to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await
            && !e.is_cancelled()
        {
            warn!(task = %self.name, error = %e, "task ended abnormally");
        }
    }

    /// Cancel the task at its next await point without waiting.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Resolves once `rx` reads `true` or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
