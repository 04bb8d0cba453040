//! Single-use rendezvous between a role and the orchestrator that started
//! it: one value is written once and read once.
//!
//! Used for the address handshake of the socket roles and for worker
//! readiness. A role that exits before publishing drops its [`Publisher`],
//! which the waiting side observes as a failed handshake instead of a hang.

use crate::error::{Error, Result};
use core::time::Duration;
use tokio::sync::oneshot;

/// Write side of a rendezvous, owned by the role.
#[derive(Debug)]
pub(crate) struct Publisher<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Publisher<T> {
    /// Publishes `value`. Returns `false` if nobody is waiting anymore.
    pub(crate) fn publish(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Read side of a rendezvous, owned by the orchestrator.
#[derive(Debug)]
pub(crate) struct Awaiter<T> {
    role: String,
    rx: oneshot::Receiver<T>,
}

impl<T> Awaiter<T> {
    /// Waits up to `timeout` for the role to publish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the role dropped its publisher or did
    /// not publish in time.
    pub(crate) async fn wait(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                tracing::error!(role = %self.role, "Role exited before the handshake");
                Err(Error::Handshake { role: self.role })
            }
            Err(_) => {
                tracing::error!(role = %self.role, ?timeout, "Handshake timed out");
                Err(Error::Handshake { role: self.role })
            }
        }
    }
}

/// Creates a rendezvous for the role called `role`.
pub(crate) fn rendezvous<T>(role: impl Into<String>) -> (Publisher<T>, Awaiter<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Publisher { tx },
        Awaiter {
            role: role.into(),
            rx,
        },
    )
}
