use super::codec;
use crate::{
    error::{Error, Result},
    rendezvous::Publisher,
    types::{Fragment, RequestId},
    worker::{Worker, WorkerFactory, WorkerInfo, emit_fragments, run_hook},
};
use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use zeromq::{PushSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// Addresses a worker connects to: the distribution PUB socket and the
/// collection PULL socket reserved for this worker.
#[derive(Clone, Debug)]
pub(crate) struct Endpoints {
    pub(crate) distribution: String,
    pub(crate) collection: String,
}

struct Sockets {
    requests: SubSocket,
    responses: PushSocket,
}

impl Sockets {
    async fn connect(identity: &str, endpoints: &Endpoints) -> Result<Self> {
        let mut requests = SubSocket::new();
        requests.connect(&endpoints.distribution).await?;
        requests.subscribe(identity).await?;

        let mut responses = PushSocket::new();
        responses.connect(&endpoints.collection).await?;
        Ok(Self {
            requests,
            responses,
        })
    }
}

/// A socket-backend worker. Runs on a blocking thread and drives its
/// sockets through the runtime handle, so hooks never stall async roles.
pub(crate) struct ZmqWorker {
    pub(crate) info: WorkerInfo,
    /// Routing key this worker subscribes to.
    pub(crate) identity: Arc<str>,
    pub(crate) factory: WorkerFactory,
    pub(crate) endpoints: Endpoints,
    pub(crate) quit: CancellationToken,
    pub(crate) log_timing: bool,
    pub(crate) runtime: Handle,
}

impl ZmqWorker {
    /// Connects, runs `on_start`, reports readiness through `ready`, then
    /// serves requests addressed to this worker until quit.
    pub(crate) fn run(self, ready: Publisher<()>) {
        let name = self.info.name.as_str();
        let identity = &*self.identity;
        let mut sockets = match self.runtime.block_on(Sockets::connect(identity, &self.endpoints)) {
            Ok(sockets) => sockets,
            Err(e) => {
                tracing::error!(worker = name, "Failed to connect worker sockets: {e}");
                return;
            }
        };

        let mut worker = (self.factory)(&self.info);
        if !run_hook(name, "on_start", || worker.on_start()) {
            return;
        }
        if !ready.publish(()) {
            tracing::debug!(worker = name, "Nobody waiting for readiness");
        }
        tracing::debug!(worker = name, "Worker ready");

        loop {
            let received = self.until_quit(sockets.requests.recv());
            let msg = match received {
                Ok(msg) => msg,
                Err(Error::ServiceShutdown) => break,
                Err(e) => {
                    tracing::error!(worker = name, "Worker stopping: {e}");
                    break;
                }
            };

            let request = match codec::decode_request(msg) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(worker = name, "Dropping malformed request: {e}");
                    continue;
                }
            };
            // Subscriptions match by prefix: `g_1` also receives messages
            // addressed to `g_10`.
            if request.identity != identity.as_bytes() {
                continue;
            }

            match self.handle(&mut *worker, &mut sockets, request.id, request.payload) {
                Ok(()) => {}
                Err(Error::ServiceShutdown) => break,
                Err(e) => {
                    tracing::error!(worker = name, request_id = request.id, "Worker stopping: {e}");
                    break;
                }
            }
        }

        run_hook(name, "on_stop", || worker.on_stop());
        tracing::debug!(worker = name, "Worker stopped");
    }

    /// Runs `on_request` and pushes the reply. Hook failures are logged and
    /// swallowed; only transport failures are returned.
    fn handle(
        &self,
        worker: &mut dyn Worker,
        sockets: &mut Sockets,
        id: RequestId,
        payload: Bytes,
    ) -> Result<()> {
        let started = Instant::now();
        let size = payload.len();
        let reply = match worker.on_request(payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(worker = %self.info.name, request_id = id, "on_request failed: {e}");
                return Ok(());
            }
        };
        let worker_id = self.info.index;
        let fragments = emit_fragments(reply, |seq, marker, payload| {
            let fragment = Fragment::new(id, worker_id, seq, marker, payload);
            self.push(&mut sockets.responses, codec::encode_fragment(&fragment))
        })?;
        if self.log_timing {
            tracing::debug!(
                worker = %self.info.name,
                request_id = id,
                size,
                fragments,
                elapsed = ?started.elapsed(),
                "Handled request"
            );
        }
        Ok(())
    }

    fn push(&self, socket: &mut PushSocket, msg: ZmqMessage) -> Result<()> {
        self.until_quit(socket.send(msg))
    }

    /// Blocks on `op` unless the quit token fires first.
    fn until_quit<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = zeromq::ZmqResult<T>>,
    {
        self.runtime.block_on(async {
            tokio::select! {
                biased;

                () = self.quit.cancelled() => Err(Error::ServiceShutdown),

                out = op => out.map_err(Error::from),
            }
        })
    }
}
