//! Socket backend.
//!
//! A distribution role publishes every request on a PUB socket, prefixed
//! with the identity of the worker chosen round-robin. Each worker
//! subscribes to its own identity `{group}_{index}`, runs its hooks and
//! pushes response fragments to a PULL socket the collection role keeps for
//! that worker alone. Collection decodes them onto the pool's output
//! channel, and a pump task files them into the pool's [`Correlator`].
//!
//! Every socket binds to an ephemeral loopback port; the bound addresses
//! reach the workers through a startup handshake.

mod codec;
mod collection;
mod distribution;
mod worker;

use crate::{
    config::PoolConfig,
    correlation::{Correlator, pump_fragments},
    error::{Error, Result},
    rendezvous::{Awaiter, rendezvous},
    role::{RoleHandle, RoleKind, join_all},
    types::{Fragment, RequestId, Seq, WorkerId},
    worker::{Worker, WorkerFactory, WorkerInfo, boxed_factory},
};
use bytes::Bytes;
use collection::run_collection;
use core::time::Duration;
use distribution::{Outbox, Outgoing, run_distribution};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use worker::{Endpoints, ZmqWorker};

/// Every socket binds an ephemeral port on the loopback interface.
pub(crate) const BIND_ENDPOINT: &str = "tcp://127.0.0.1:0";

/// Pause after every worker reported ready, so the PUB socket has processed
/// all subscriptions before the first request is published.
const SUBSCRIPTION_SETTLE: Duration = Duration::from_millis(100);

/// Grace period between joining the socket roles and joining the workers.
const JOIN_GRACE: Duration = Duration::from_secs(1);

struct Staged {
    factory: WorkerFactory,
    queue: flume::Receiver<Outgoing>,
    output_tx: flume::Sender<Fragment>,
    output_rx: flume::Receiver<Fragment>,
}

/// A worker pool connected through PUB/SUB fan-out and PUSH/PULL fan-in.
///
/// Requests are assigned to workers round-robin by identity, whether or not
/// the chosen worker is busy.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use ipc_worker::{HookResult, PoolConfig, Reply, Worker, WorkerInfo, ZmqPool};
///
/// struct Count;
///
/// impl Worker for Count {
///     fn on_request(&mut self, _: Bytes) -> HookResult<Reply> {
///         Ok(Reply::stream((1..=3u8).map(|i| Bytes::from(vec![i]))))
///     }
/// }
///
/// # async fn run() -> ipc_worker::Result<()> {
/// let config = PoolConfig::builder().worker_num(2).build()?;
/// let mut pool = ZmqPool::new(config, |_: &WorkerInfo| Count)?;
/// pool.start().await?;
///
/// let id = pool.put(Bytes::new()).await?;
/// for _ in 0..3 {
///     let item = pool.get(id, None).await;
///     assert!(item.is_some());
/// }
///
/// pool.terminate();
/// pool.join().await;
/// # Ok(())
/// # }
/// ```
pub struct ZmqPool {
    config: PoolConfig,
    correlator: Arc<Correlator>,
    outbox: Outbox,
    identities: Arc<[Arc<str>]>,
    distribution_endpoint: Option<String>,
    collection_endpoints: Vec<String>,
    staged: Option<Staged>,
    managers: Vec<RoleHandle>,
    workers: Vec<RoleHandle>,
    pump: Vec<RoleHandle>,
}

impl ZmqPool {
    /// Builds the pool's queues and worker identities. No role runs until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new<F, W>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn(&WorkerInfo) -> W + Send + Sync + 'static,
        W: Worker,
    {
        config.validate()?;
        let identities: Arc<[Arc<str>]> = (0..config.worker_num)
            .map(|i| Arc::from(format!("{}_{i}", config.group_name)))
            .collect();
        let (queue_tx, queue_rx) = flume::bounded(config.queue_size);
        let (output_tx, output_rx) = flume::bounded(config.queue_size);

        Ok(Self {
            correlator: Arc::new(Correlator::new()),
            outbox: Outbox::new(Arc::clone(&identities), queue_tx),
            identities,
            distribution_endpoint: None,
            collection_endpoints: Vec::new(),
            staged: Some(Staged {
                factory: boxed_factory(factory),
                queue: queue_rx,
                output_tx,
                output_rx,
            }),
            managers: Vec::new(),
            workers: Vec::new(),
            pump: Vec::new(),
            config,
        })
    }

    /// Spawns collection and distribution, waits for their bound addresses,
    /// then spawns every worker and waits until all of them subscribed.
    ///
    /// On failure every role spawned so far is terminated.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] on a second call.
    /// - [`Error::Handshake`] if a role exits or stays silent for longer
    ///   than `startup_timeout`.
    pub async fn start(&mut self) -> Result<()> {
        let staged = self.staged.take().ok_or(Error::AlreadyStarted)?;
        if let Err(e) = self.spawn_roles(staged).await {
            self.terminate();
            return Err(e);
        }
        tracing::info!(
            group = %self.config.group_name,
            workers = self.config.worker_num,
            distribution = self.distribution_endpoint().unwrap_or_default(),
            "Socket pool started"
        );
        Ok(())
    }

    async fn spawn_roles(&mut self, staged: Staged) -> Result<()> {
        let group = Arc::clone(&self.config.group_name);
        let quit = &self.config.quit;
        let timeout = self.config.startup_timeout;

        self.pump.push(RoleHandle::spawn(
            format!("{group}_pump"),
            RoleKind::Pump,
            pump_fragments(Arc::clone(&self.correlator), staged.output_rx, quit.clone()),
        ));

        let name = format!("{group}_collection");
        let (addresses, collection) = rendezvous(name.as_str());
        self.managers.push(RoleHandle::spawn(
            name,
            RoleKind::Collection,
            run_collection(
                staged.output_tx,
                self.identities.len(),
                addresses,
                quit.clone(),
            ),
        ));

        let name = format!("{group}_distribution");
        let (address, distribution) = rendezvous(name.as_str());
        self.managers.push(RoleHandle::spawn(
            name,
            RoleKind::Distribution,
            run_distribution(staged.queue, address, quit.clone()),
        ));

        self.collection_endpoints = collection.wait(timeout).await?;
        let distribution = distribution.wait(timeout).await?;
        self.distribution_endpoint = Some(distribution.clone());

        let runtime = Handle::current();
        let mut readiness: Vec<Awaiter<()>> = Vec::with_capacity(self.identities.len());
        for (i, identity) in self.identities.iter().enumerate() {
            let info = WorkerInfo {
                index: i as WorkerId,
                group: Arc::clone(&group),
                name: format!("{group}_worker_{i}"),
            };
            let (ready, awaiter) = rendezvous(info.name.as_str());
            readiness.push(awaiter);

            let role = info.name.clone();
            let worker = ZmqWorker {
                info,
                identity: Arc::clone(identity),
                factory: Arc::clone(&staged.factory),
                endpoints: Endpoints {
                    distribution: distribution.clone(),
                    collection: self.collection_endpoints[i].clone(),
                },
                quit: quit.clone(),
                log_timing: self.config.log_timing,
                runtime: runtime.clone(),
            };
            self.workers.push(RoleHandle::spawn_blocking(
                role,
                RoleKind::Worker,
                move || worker.run(ready),
            ));
        }

        for awaiter in readiness {
            awaiter.wait(timeout).await?;
        }
        tokio::time::sleep(SUBSCRIPTION_SETTLE).await;
        Ok(())
    }

    /// Submits a request to the next worker in turn and returns its id.
    ///
    /// Waits while the distribution queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the pool is shutting down.
    pub async fn put(&self, payload: impl Into<Bytes>) -> Result<RequestId> {
        if self.config.quit.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        let id = self.outbox.allocate();
        self.correlator.track(id);
        if let Err(e) = self.outbox.send(id, payload.into()).await {
            self.correlator.forget(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Waits for the next fragment of request `id`.
    ///
    /// See [`Correlator::receive`] for the meaning of `seq` and of a `None`
    /// result.
    pub async fn get(&self, id: RequestId, seq: Option<Seq>) -> Option<Bytes> {
        self.correlator.receive(id, seq).await
    }

    /// Waits for distribution and collection to exit, allows workers a
    /// short grace period, then waits for the workers and the pump.
    pub async fn join(&self) {
        join_all(&self.managers).await;
        if self.workers.iter().any(|w| !w.is_finished()) {
            tokio::time::sleep(JOIN_GRACE).await;
        }
        join_all(&self.workers).await;
        join_all(&self.pump).await;
    }

    /// Signals quit to every role and force-stops the async ones. Waiters
    /// blocked in [`get`](Self::get) are released.
    pub fn terminate(&self) {
        self.config.quit.cancel();
        for role in self.managers.iter().chain(&self.workers).chain(&self.pump) {
            role.abort();
        }
        self.correlator.close();
        tracing::info!(group = %self.config.group_name, "Socket pool terminated");
    }

    /// Handles to the distribution and collection roles.
    pub fn managers(&self) -> &[RoleHandle] {
        &self.managers
    }

    /// Handles to the workers.
    pub fn workers(&self) -> &[RoleHandle] {
        &self.workers
    }

    /// Identities workers subscribe to, by worker index.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|identity| &**identity)
    }

    /// Address of the distribution PUB socket, once started.
    pub fn distribution_endpoint(&self) -> Option<&str> {
        self.distribution_endpoint.as_deref()
    }

    /// Addresses of the collection PULL sockets by worker index, once
    /// started.
    pub fn collection_endpoints(&self) -> impl Iterator<Item = &str> {
        self.collection_endpoints.iter().map(String::as_str)
    }

    /// The pool's quit token.
    pub fn quit_token(&self) -> &CancellationToken {
        &self.config.quit
    }

    /// The pool's correlator.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

impl Drop for ZmqPool {
    fn drop(&mut self) {
        if self.config.daemon && self.staged.is_none() {
            self.terminate();
        }
    }
}
