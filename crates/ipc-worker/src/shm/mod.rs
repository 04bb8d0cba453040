//! Shared-memory backend.
//!
//! Requests flow from [`ShmPool::put`] through a bounded input queue to a
//! set of dispatch managers. A manager admits a request only while a worker
//! is free (a counting semaphore sized to the worker count), claims an idle
//! worker and writes the payload into that worker's private segment. Workers
//! run their hooks on blocking threads and push response fragments into one
//! bounded output channel, which a pump task files into the pool's
//! [`Correlator`].
//!
//! Dispatch is "any idle worker", not strict round robin.

mod dispatch;
mod segment;
mod worker;

pub use dispatch::WorkerState;

use crate::{
    config::PoolConfig,
    correlation::{Correlator, pump_fragments},
    error::{Error, Result},
    role::{RoleHandle, RoleKind, join_all},
    types::{Fragment, RequestId, Seq, WorkerId},
    worker::{Worker, WorkerFactory, WorkerInfo, boxed_factory},
};
use bytes::Bytes;
use dispatch::{Dispatcher, WorkerSignal};
use segment::{SegmentReader, SegmentWriter, segment};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use worker::ShmWorker;

/// Channel ends created at construction and handed to the roles by `start`.
struct Staged {
    factory: WorkerFactory,
    input: flume::Receiver<(RequestId, Bytes)>,
    output_tx: flume::Sender<Fragment>,
    output_rx: flume::Receiver<Fragment>,
    readers: Vec<SegmentReader>,
}

/// A worker pool whose workers receive requests through per-worker
/// segments of fixed capacity.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use ipc_worker::{HookResult, PoolConfig, Reply, ShmPool, Worker, WorkerInfo};
///
/// struct Echo;
///
/// impl Worker for Echo {
///     fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
///         Ok(Reply::Single(payload))
///     }
/// }
///
/// # async fn run() -> ipc_worker::Result<()> {
/// let config = PoolConfig::builder().worker_num(2).build()?;
/// let mut pool = ShmPool::new(config, |_: &WorkerInfo| Echo)?;
/// pool.start().await?;
///
/// let id = pool.put(Bytes::from_static(b"x")).await?;
/// assert_eq!(pool.get(id, None).await.as_deref(), Some(&b"x"[..]));
///
/// pool.terminate();
/// pool.join().await;
/// # Ok(())
/// # }
/// ```
pub struct ShmPool {
    config: PoolConfig,
    correlator: Arc<Correlator>,
    input: flume::Sender<(RequestId, Bytes)>,
    admission: Arc<Semaphore>,
    signals: Arc<[WorkerSignal]>,
    segments: Arc<[SegmentWriter]>,
    staged: Option<Staged>,
    managers: Vec<RoleHandle>,
    workers: Vec<RoleHandle>,
    pump: Vec<RoleHandle>,
}

impl ShmPool {
    /// Builds the pool's channels, segments and admission semaphore. No role
    /// runs until [`start`](Self::start).
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
        let (input_tx, input_rx) = flume::bounded(config.queue_size);
        let (output_tx, output_rx) = flume::bounded(config.queue_size);
        let (writers, readers): (Vec<_>, Vec<_>) = (0..config.worker_num)
            .map(|i| segment(format!("{}_jid_{i}", config.group_name), config.shm_size))
            .unzip();
        let signals: Arc<[WorkerSignal]> =
            (0..config.worker_num).map(|_| WorkerSignal::new()).collect();

        Ok(Self {
            correlator: Arc::new(Correlator::new()),
            input: input_tx,
            admission: Arc::new(Semaphore::new(config.worker_num)),
            signals,
            segments: Arc::from(writers),
            staged: Some(Staged {
                factory: boxed_factory(factory),
                input: input_rx,
                output_tx,
                output_rx,
                readers,
            }),
            managers: Vec::new(),
            workers: Vec::new(),
            pump: Vec::new(),
            config,
        })
    }

    /// Spawns every worker, every dispatch manager and the fragment pump.
    ///
    /// Workers become eligible for dispatch once their `on_start` hook
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call.
    pub async fn start(&mut self) -> Result<()> {
        let staged = self.staged.take().ok_or(Error::AlreadyStarted)?;
        let group = &self.config.group_name;
        let runtime = Handle::current();

        for (i, reader) in staged.readers.into_iter().enumerate() {
            let info = WorkerInfo {
                index: i as WorkerId,
                group: Arc::clone(group),
                name: format!("{group}_worker_{i}"),
            };
            let role = info.name.clone();
            let worker = ShmWorker {
                info,
                factory: Arc::clone(&staged.factory),
                segment: reader,
                output: staged.output_tx.clone(),
                signals: Arc::clone(&self.signals),
                admission: Arc::clone(&self.admission),
                quit: self.config.quit.clone(),
                log_timing: self.config.log_timing,
                runtime: runtime.clone(),
            };
            self.workers.push(RoleHandle::spawn_blocking(
                role,
                RoleKind::Worker,
                move || worker.run(),
            ));
        }

        for i in 0..self.config.manager_num {
            let dispatcher = Dispatcher {
                index: i,
                input: staged.input.clone(),
                admission: Arc::clone(&self.admission),
                signals: Arc::clone(&self.signals),
                segments: Arc::clone(&self.segments),
                quit: self.config.quit.clone(),
            };
            self.managers.push(RoleHandle::spawn(
                format!("{group}_manager_{i}"),
                RoleKind::Manager,
                dispatcher.run(),
            ));
        }

        self.pump.push(RoleHandle::spawn(
            format!("{group}_pump"),
            RoleKind::Pump,
            pump_fragments(
                Arc::clone(&self.correlator),
                staged.output_rx,
                self.config.quit.clone(),
            ),
        ));

        tracing::info!(
            group = %group,
            workers = self.config.worker_num,
            managers = self.config.manager_num,
            segment_size = self.config.shm_size,
            "Shared-memory pool started"
        );
        Ok(())
    }

    /// Submits a request and returns its id.
    ///
    /// Waits while the input queue is full.
    ///
    /// # Errors
    ///
    /// - [`Error::PayloadTooLarge`] if `payload` does not fit in a segment.
    /// - [`Error::ServiceShutdown`] if the pool is shutting down.
    pub async fn put(&self, payload: impl Into<Bytes>) -> Result<RequestId> {
        let payload = payload.into();
        if payload.len() > self.config.shm_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                capacity: self.config.shm_size,
            });
        }
        if self.config.quit.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let id = self.correlator.allocate();
        if self.input.send_async((id, payload)).await.is_err() {
            self.correlator.forget(id);
            return Err(Error::ServiceShutdown);
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

    /// Waits for every manager, then every worker, then the pump to exit.
    pub async fn join(&self) {
        join_all(&self.managers).await;
        join_all(&self.workers).await;
        join_all(&self.pump).await;
    }

    /// Signals quit to every role and force-stops the async ones. Waiters
    /// blocked in [`get`](Self::get) are released.
    pub fn terminate(&self) {
        self.config.quit.cancel();
        for role in self.all_roles() {
            role.abort();
        }
        self.correlator.close();
        tracing::info!(group = %self.config.group_name, "Shared-memory pool terminated");
    }

    /// Handles to the dispatch managers.
    pub fn managers(&self) -> &[RoleHandle] {
        &self.managers
    }

    /// Handles to the workers.
    pub fn workers(&self) -> &[RoleHandle] {
        &self.workers
    }

    /// Current state of every worker, by worker index.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.signals.iter().map(WorkerSignal::state).collect()
    }

    /// Names of the per-worker segments, by worker index.
    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().map(SegmentWriter::name).collect()
    }

    /// Byte capacity of each segment.
    pub fn segment_capacity(&self) -> usize {
        self.segments
            .first()
            .map_or(self.config.shm_size, SegmentWriter::capacity)
    }

    /// The pool's quit token.
    pub fn quit_token(&self) -> &CancellationToken {
        &self.config.quit
    }

    /// The pool's correlator.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn all_roles(&self) -> impl Iterator<Item = &RoleHandle> {
        self.managers
            .iter()
            .chain(&self.workers)
            .chain(&self.pump)
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        if self.config.daemon && self.staged.is_none() {
            self.terminate();
        }
    }
}
