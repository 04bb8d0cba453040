//! Handles to the running roles of a pool.
//!
//! Every role (worker, dispatch manager, distribution, collection, fragment
//! pump) runs as its own task and owns the resources it acquired at start.
//! A [`RoleHandle`] lets the pool, and anyone supervising it, inspect, stop
//! and join that task.

use std::future::Future;
use tokio::{
    sync::Mutex,
    task::{AbortHandle, JoinHandle},
};
use tracing::Instrument;

/// What a role does within its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    /// Runs the user's [`Worker`](crate::Worker) hooks.
    Worker,
    /// Routes queued requests onto idle workers (shared-memory backend).
    Manager,
    /// Publishes requests to workers by identity (socket backend).
    Distribution,
    /// Gathers worker responses into the output channel (socket backend).
    Collection,
    /// Files fragments from the output channel into the correlator.
    Pump,
}

/// Handle to one running role.
#[derive(Debug)]
pub struct RoleHandle {
    name: String,
    kind: RoleKind,
    join: Mutex<Option<JoinHandle<()>>>,
    abort: AbortHandle,
}

impl RoleHandle {
    /// Spawns an async role on the current runtime.
    pub(crate) fn spawn<F>(name: String, kind: RoleKind, role: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("role", name = %name, kind = ?kind);
        Self::from_join(name, kind, tokio::spawn(role.instrument(span)))
    }

    /// Spawns a role that blocks its thread for its whole lifetime.
    pub(crate) fn spawn_blocking<F>(name: String, kind: RoleKind, role: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let span = tracing::debug_span!("role", name = %name, kind = ?kind);
        Self::from_join(
            name,
            kind,
            tokio::task::spawn_blocking(move || span.in_scope(role)),
        )
    }

    fn from_join(name: String, kind: RoleKind, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            kind,
            abort: handle.abort_handle(),
            join: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    /// Whether the role's task has exited.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Force-stops the role. Blocking roles cannot be interrupted and exit
    /// when they next observe the pool's quit token.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Waits for the role to exit. Joining twice returns immediately.
    ///
    /// The task handle is only released once the role exited, so a join
    /// abandoned halfway leaves the next one waiting as well.
    pub(crate) async fn join(&self) {
        let mut slot = self.join.lock().await;
        let Some(handle) = slot.as_mut() else {
            return;
        };
        let result = handle.await;
        *slot = None;
        match result {
            Ok(()) => tracing::trace!(role = %self.name, "Role joined"),
            Err(e) if e.is_cancelled() => {
                tracing::debug!(role = %self.name, "Role was aborted");
            }
            Err(e) => tracing::error!(role = %self.name, "Role panicked: {e}"),
        }
    }
}

/// Joins every role in `roles` concurrently.
pub(crate) async fn join_all(roles: &[RoleHandle]) {
    futures::future::join_all(roles.iter().map(RoleHandle::join)).await;
}
