//! The collection role: one PULL socket per worker, merged into the pool's
//! output channel.
//!
//! Every worker pushes to an endpoint of its own, so each PULL socket only
//! ever has a single peer. Fragments of one reply stay in the order their
//! worker sent them.

use super::{BIND_ENDPOINT, codec};
use crate::{rendezvous::Publisher, types::Fragment};
use tokio_util::sync::CancellationToken;
use zeromq::{PullSocket, Socket, SocketRecv};

/// Binds `worker_num` PULL sockets, reports their addresses by worker
/// index, then forwards decoded fragments from all of them until `quit`
/// fires or the output channel closes.
pub(crate) async fn run_collection(
    output: flume::Sender<Fragment>,
    worker_num: usize,
    addresses: Publisher<Vec<String>>,
    quit: CancellationToken,
) {
    let mut sockets = Vec::with_capacity(worker_num);
    let mut endpoints = Vec::with_capacity(worker_num);
    for index in 0..worker_num {
        let mut socket = PullSocket::new();
        match socket.bind(BIND_ENDPOINT).await {
            Ok(endpoint) => endpoints.push(endpoint.to_string()),
            Err(e) => {
                tracing::error!(index, "Failed to bind collection socket: {e}");
                return;
            }
        }
        sockets.push(socket);
    }
    tracing::debug!(?endpoints, "Collection bound");
    if !addresses.publish(endpoints) {
        return;
    }

    futures::future::join_all(
        sockets
            .into_iter()
            .enumerate()
            .map(|(index, socket)| drain(index, socket, &output, &quit)),
    )
    .await;
    tracing::debug!("Collection stopped");
}

/// Forwards fragments from the socket of worker `index`.
async fn drain(
    index: usize,
    mut socket: PullSocket,
    output: &flume::Sender<Fragment>,
    quit: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;

            () = quit.cancelled() => break,

            msg = socket.recv() => match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(index, "Collection socket failed: {e}");
                    break;
                }
            },
        };

        let fragment = match codec::decode_fragment(msg) {
            Ok(fragment) => fragment,
            Err(e) => {
                tracing::warn!(index, "Dropping malformed fragment: {e}");
                continue;
            }
        };
        if output.send_async(fragment).await.is_err() {
            break;
        }
    }
}
