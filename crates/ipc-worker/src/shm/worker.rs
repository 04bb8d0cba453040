use super::{
    dispatch::{WorkerSignal, WorkerState, retire_permit},
    segment::{Job, Read, SegmentReader},
};
use crate::{
    error::{Error, Result},
    types::{Fragment, RequestId, WorkerId},
    worker::{Worker, WorkerFactory, WorkerInfo, emit_fragments, run_hook},
};
use bytes::Bytes;
use core::time::Duration;
use std::{sync::Arc, time::Instant};
use tokio::{runtime::Handle, sync::Semaphore};
use tokio_util::sync::CancellationToken;

/// How long a blocked worker waits before re-checking the quit token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything a shared-memory worker needs, moved onto its blocking thread.
pub(crate) struct ShmWorker {
    pub(crate) info: WorkerInfo,
    pub(crate) factory: WorkerFactory,
    pub(crate) segment: SegmentReader,
    pub(crate) output: flume::Sender<Fragment>,
    pub(crate) signals: Arc<[WorkerSignal]>,
    pub(crate) admission: Arc<Semaphore>,
    pub(crate) quit: CancellationToken,
    pub(crate) log_timing: bool,
    pub(crate) runtime: Handle,
}

/// Marks the worker stopped on every exit path, including panics in a hook,
/// and retires its admission permit while the pool is still running.
struct StopGuard {
    name: String,
    index: usize,
    signals: Arc<[WorkerSignal]>,
    admission: Arc<Semaphore>,
    quit: CancellationToken,
    runtime: Handle,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.signals[self.index].set(WorkerState::Stopped);
        if self.quit.is_cancelled() {
            return;
        }
        tracing::warn!(worker = %self.name, "Worker exited while the pool is running");
        self.runtime.spawn(retire_permit(
            Arc::clone(&self.admission),
            self.quit.clone(),
        ));
    }
}

impl ShmWorker {
    pub(crate) fn run(self) {
        let index = self.info.index as usize;
        let _guard = StopGuard {
            name: self.info.name.clone(),
            index,
            signals: Arc::clone(&self.signals),
            admission: Arc::clone(&self.admission),
            quit: self.quit.clone(),
            runtime: self.runtime.clone(),
        };

        let mut worker = (self.factory)(&self.info);
        if !run_hook(&self.info.name, "on_start", || worker.on_start()) {
            return;
        }
        self.signals[index].set(WorkerState::Idle);
        tracing::debug!(worker = %self.info.name, "Worker ready");

        while !self.quit.is_cancelled() {
            let job = match self.segment.read(POLL_INTERVAL) {
                Read::Job(job) => job,
                Read::Empty => continue,
                Read::Closed => break,
            };
            self.signals[index].set(WorkerState::Running);

            let Job {
                id,
                payload,
                permit,
            } = job;
            match self.handle(&mut *worker, id, payload) {
                Ok(()) => {}
                Err(Error::ServiceShutdown) => break,
                Err(e) => {
                    tracing::error!(worker = %self.info.name, request_id = id, "Worker stopping: {e}");
                    break;
                }
            }

            // Idle must be visible before the permit frees up capacity.
            self.signals[index].set(WorkerState::Idle);
            drop(permit);
        }

        run_hook(&self.info.name, "on_stop", || worker.on_stop());
        tracing::debug!(worker = %self.info.name, "Worker stopped");
    }

    /// Runs `on_request` and forwards the reply. Hook failures are logged
    /// and swallowed; only a broken output channel is returned.
    fn handle(&self, worker: &mut dyn Worker, id: RequestId, payload: Bytes) -> Result<()> {
        let started = Instant::now();
        let size = payload.len();
        let reply = match worker.on_request(payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(worker = %self.info.name, request_id = id, "on_request failed: {e}");
                return Ok(());
            }
        };
        let worker_id: WorkerId = self.info.index;
        let fragments = emit_fragments(reply, |seq, marker, payload| {
            self.send(Fragment::new(id, worker_id, seq, marker, payload))
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

    /// Sends one fragment, waiting for room in the output channel.
    fn send(&self, mut fragment: Fragment) -> Result<()> {
        loop {
            match self.output.send_timeout(fragment, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(flume::SendTimeoutError::Timeout(f)) => {
                    if self.quit.is_cancelled() {
                        return Err(Error::ServiceShutdown);
                    }
                    fragment = f;
                }
                Err(flume::SendTimeoutError::Disconnected(_)) => {
                    return Err(Error::channel("output channel closed"));
                }
            }
        }
    }
}
