//! Admission control and dispatch for the shared-memory backend.
//!
//! Every worker publishes its state through a [`WorkerSignal`]. A counting
//! semaphore sized to the worker count admits at most that many requests at
//! once; a manager that obtained a permit claims an idle worker with a single
//! compare-and-swap and writes the request into that worker's segment. The
//! permit travels with the request and returns to the semaphore when the
//! worker finishes it.

use super::segment::{Job, SegmentWriter};
use crate::types::RequestId;
use bytes::Bytes;
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Back-off before a manager retries a claim that found no idle worker.
const CLAIM_RETRY: Duration = Duration::from_millis(5);

/// Lifecycle state of a shared-memory worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Running `on_start`; not accepting requests yet.
    Starting = 0,
    /// Waiting for a request.
    Idle = 1,
    /// Claimed by a manager; a request is on its way.
    Dispatched = 2,
    /// Executing `on_request`.
    Running = 3,
    /// Exited. Never dispatched to again.
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Idle,
            2 => Self::Dispatched,
            3 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Per-worker state cell shared between the worker and every manager.
#[derive(Debug)]
pub(crate) struct WorkerSignal(AtomicU8);

impl WorkerSignal {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Starting as u8))
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves the worker from idle to dispatched. Fails if it was not idle.
    fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Dispatched as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Claims the first idle worker at or after `start`, wrapping around.
pub(crate) fn claim_idle(signals: &[WorkerSignal], start: usize) -> Option<usize> {
    let len = signals.len();
    (0..len)
        .map(|offset| (start + offset) % len)
        .find(|&slot| signals[slot].try_claim())
}

/// One dispatch manager.
pub(crate) struct Dispatcher {
    pub(crate) index: usize,
    pub(crate) input: flume::Receiver<(RequestId, Bytes)>,
    pub(crate) admission: Arc<Semaphore>,
    pub(crate) signals: Arc<[WorkerSignal]>,
    pub(crate) segments: Arc<[SegmentWriter]>,
    pub(crate) quit: CancellationToken,
}

impl Dispatcher {
    /// Moves requests from the input queue into idle workers' segments
    /// until the quit token fires or the input queue closes.
    pub(crate) async fn run(self) {
        tracing::debug!(manager = self.index, "Dispatch manager started");
        let mut cursor = self.index;
        loop {
            let (id, payload) = tokio::select! {
                biased;

                () = self.quit.cancelled() => break,

                request = self.input.recv_async() => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };

            let mut job_payload = payload;
            loop {
                let Some((slot, permit)) = self.admit(&mut cursor).await else {
                    tracing::debug!(request_id = id, "Dropping request on shutdown");
                    return;
                };
                let segment = &self.segments[slot];
                let job = Job {
                    id,
                    payload: job_payload,
                    permit,
                };
                match segment.write(job).await {
                    Ok(()) => {
                        tracing::trace!(request_id = id, segment = segment.name(), "Dispatched");
                        break;
                    }
                    Err(job) => {
                        // The worker exited between the claim and the write.
                        tracing::warn!(
                            request_id = id,
                            segment = segment.name(),
                            "Segment closed, redispatching"
                        );
                        self.signals[slot].set(WorkerState::Stopped);
                        job_payload = job.payload;
                    }
                }
            }
        }
        tracing::debug!(manager = self.index, "Dispatch manager stopped");
    }

    /// Waits for a free permit and claims an idle worker for it.
    async fn admit(&self, cursor: &mut usize) -> Option<(usize, OwnedSemaphorePermit)> {
        loop {
            let permit = tokio::select! {
                biased;

                () = self.quit.cancelled() => return None,

                permit = Arc::clone(&self.admission).acquire_owned() => permit.ok()?,
            };

            if let Some(slot) = claim_idle(&self.signals, *cursor) {
                *cursor = slot + 1;
                return Some((slot, permit));
            }

            // Workers still starting, or a stopped worker's permit has not
            // been retired yet.
            drop(permit);
            tracing::trace!(manager = self.index, "No idle worker for admitted request");
            tokio::select! {
                biased;

                () = self.quit.cancelled() => return None,

                () = tokio::time::sleep(CLAIM_RETRY) => {}
            }
        }
    }
}

/// Permanently removes one permit from `admission`, waiting for it to be
/// released if necessary. Used when a worker exits so the semaphore keeps
/// matching the number of live workers.
pub(crate) async fn retire_permit(admission: Arc<Semaphore>, quit: CancellationToken) {
    tokio::select! {
        biased;

        () = quit.cancelled() => {}

        permit = admission.acquire_owned() => {
            if let Ok(permit) = permit {
                permit.forget();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::segment::{Read, segment};

    fn signals(states: &[WorkerState]) -> Arc<[WorkerSignal]> {
        states
            .iter()
            .map(|&state| {
                let signal = WorkerSignal::new();
                signal.set(state);
                signal
            })
            .collect()
    }

    #[test]
    fn claim_skips_busy_and_stopped_workers() {
        use WorkerState::*;
        let signals = signals(&[Running, Stopped, Idle, Idle]);
        assert_eq!(claim_idle(&signals, 0), Some(2));
        assert_eq!(signals[2].state(), Dispatched);
        assert_eq!(claim_idle(&signals, 0), Some(3));
        assert_eq!(claim_idle(&signals, 0), None);
    }

    #[test]
    fn claim_wraps_around_from_cursor() {
        let signals = signals(&[WorkerState::Idle, WorkerState::Idle]);
        assert_eq!(claim_idle(&signals, 1), Some(1));
        assert_eq!(claim_idle(&signals, 2), Some(0));
    }

    #[test]
    fn new_signal_is_starting() {
        assert_eq!(WorkerSignal::new().state(), WorkerState::Starting);
    }

    #[tokio::test]
    async fn dispatcher_routes_to_idle_worker_only() {
        let signals = signals(&[WorkerState::Running, WorkerState::Idle]);
        let (w0, _r0) = segment("t_jid_0".into(), 64);
        let (w1, r1) = segment("t_jid_1".into(), 64);
        let (input_tx, input_rx) = flume::bounded(4);
        let admission = Arc::new(Semaphore::new(2));
        let quit = CancellationToken::new();

        let dispatcher = Dispatcher {
            index: 0,
            input: input_rx,
            admission: Arc::clone(&admission),
            signals: Arc::clone(&signals),
            segments: Arc::from(vec![w0, w1]),
            quit: quit.clone(),
        };
        let task = tokio::spawn(dispatcher.run());

        input_tx.send_async((1, Bytes::from_static(b"x"))).await.unwrap();
        let job = tokio::task::spawn_blocking(move || match r1.read(Duration::from_secs(1)) {
            Read::Job(job) => job,
            other => panic!("unexpected {other:?}"),
        })
        .await
        .unwrap();

        assert_eq!(job.id, 1);
        assert_eq!(signals[1].state(), WorkerState::Dispatched);
        assert_eq!(admission.available_permits(), 1);
        drop(job);
        assert_eq!(admission.available_permits(), 2);

        quit.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retired_permit_shrinks_admission() {
        let admission = Arc::new(Semaphore::new(2));
        retire_permit(Arc::clone(&admission), CancellationToken::new()).await;
        assert_eq!(admission.available_permits(), 1);
    }
}
