//! The distribution role: one PUB socket fanning requests out to workers.
//!
//! Request ids are allocated on the submitting side by an atomic counter
//! owned by the [`Outbox`], so `put` can return an id before the request
//! is published. The role itself only encodes and publishes.

use super::{BIND_ENDPOINT, codec};
use crate::{
    error::{Error, Result},
    rendezvous::Publisher,
    types::RequestId,
};
use bytes::Bytes;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;
use zeromq::{PubSocket, Socket, SocketSend};

/// A request waiting to be published.
#[derive(Debug)]
pub(crate) struct Outgoing {
    identity: Arc<str>,
    id: RequestId,
    payload: Bytes,
}

/// Submitting side of the distribution role.
#[derive(Debug)]
pub(crate) struct Outbox {
    next_id: AtomicU64,
    next_worker: AtomicUsize,
    identities: Arc<[Arc<str>]>,
    tx: flume::Sender<Outgoing>,
}

impl Outbox {
    pub(crate) fn new(identities: Arc<[Arc<str>]>, tx: flume::Sender<Outgoing>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            next_worker: AtomicUsize::new(0),
            identities,
            tx,
        }
    }

    /// Allocates the next request id, starting at 1.
    pub(crate) fn allocate(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the identity of the next worker to receive work (round-robin).
    fn next_identity(&self) -> Arc<str> {
        let slot = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.identities.len();
        Arc::clone(&self.identities[slot])
    }

    /// Queues request `id` for the next worker in turn.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the distribution role is gone.
    pub(crate) async fn send(&self, id: RequestId, payload: Bytes) -> Result<()> {
        let outgoing = Outgoing {
            identity: self.next_identity(),
            id,
            payload,
        };
        self.tx
            .send_async(outgoing)
            .await
            .map_err(|_| Error::ServiceShutdown)
    }
}

/// Binds the PUB socket, reports its address, then publishes queued
/// requests until `quit` fires or the queue closes.
pub(crate) async fn run_distribution(
    queue: flume::Receiver<Outgoing>,
    address: Publisher<String>,
    quit: CancellationToken,
) {
    let mut socket = PubSocket::new();
    let endpoint = match socket.bind(BIND_ENDPOINT).await {
        Ok(endpoint) => endpoint.to_string(),
        Err(e) => {
            tracing::error!("Failed to bind distribution socket: {e}");
            return;
        }
    };
    tracing::debug!(%endpoint, "Distribution bound");
    if !address.publish(endpoint) {
        return;
    }

    loop {
        let outgoing = tokio::select! {
            biased;

            () = quit.cancelled() => break,

            outgoing = queue.recv_async() => match outgoing {
                Ok(outgoing) => outgoing,
                Err(_) => break,
            },
        };

        let id = outgoing.id;
        let msg = codec::encode_request(&outgoing.identity, id, outgoing.payload);
        if let Err(e) = socket.send(msg).await {
            tracing::error!(request_id = id, "Distribution socket failed: {e}");
            break;
        }
        tracing::trace!(request_id = id, identity = %outgoing.identity, "Published");
    }
    tracing::debug!("Distribution stopped");
}
