//! The load the binary puts on a pool.

use crate::config::RunConfig;
use bytes::Bytes;
use core::time::Duration;
use ipc_worker::{HookResult, Reply, RequestId, Seq, ShmPool, Worker, ZmqPool};
use std::{future::Future, time::Instant};
use tokio_util::sync::CancellationToken;

/// Replays the request payload `stream_len` times.
pub struct Replay {
    pub stream_len: usize,
}

impl Worker for Replay {
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        if self.stream_len == 1 {
            return Ok(Reply::Single(payload));
        }
        Ok(Reply::stream(std::iter::repeat_n(payload, self.stream_len)))
    }
}

/// The submit/get contract shared by both pools.
pub trait Pool {
    fn put(&self, payload: Bytes) -> impl Future<Output = ipc_worker::Result<RequestId>>;
    fn get(&self, id: RequestId, seq: Option<Seq>) -> impl Future<Output = Option<Bytes>>;
}

impl Pool for ShmPool {
    fn put(&self, payload: Bytes) -> impl Future<Output = ipc_worker::Result<RequestId>> {
        ShmPool::put(self, payload)
    }

    fn get(&self, id: RequestId, seq: Option<Seq>) -> impl Future<Output = Option<Bytes>> {
        ShmPool::get(self, id, seq)
    }
}

impl Pool for ZmqPool {
    fn put(&self, payload: Bytes) -> impl Future<Output = ipc_worker::Result<RequestId>> {
        ZmqPool::put(self, payload)
    }

    fn get(&self, id: RequestId, seq: Option<Seq>) -> impl Future<Output = Option<Bytes>> {
        ZmqPool::get(self, id, seq)
    }
}

#[derive(Debug, Default)]
pub struct Report {
    pub completed: usize,
    pub fragments: usize,
    pub elapsed: Duration,
}

impl Report {
    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.completed as f64 / secs
    }
}

/// Submits `config.requests` requests in batches of `config.in_flight` and
/// drains every reply. Stops early once `quit` fires.
pub async fn drive(pool: &impl Pool, config: &RunConfig, quit: &CancellationToken) -> Report {
    let payload = Bytes::from(vec![b'x'; config.payload_size]);
    let started = Instant::now();
    let mut report = Report::default();

    'run: while report.completed < config.requests {
        let batch = config.in_flight.min(config.requests - report.completed);
        let mut ids = Vec::with_capacity(batch);
        for _ in 0..batch {
            match pool.put(payload.clone()).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!("Submission stopped: {e}");
                    break 'run;
                }
            }
        }

        for id in ids {
            for _ in 0..config.stream_len {
                if pool.get(id, None).await.is_none() {
                    tracing::warn!(request_id = id, "Reply not delivered");
                    break 'run;
                }
                report.fragments += 1;
            }
            // A streamed reply stays pending until its end marker is read.
            if config.stream_len > 1 && pool.get(id, None).await.is_some() {
                tracing::warn!(request_id = id, "Reply longer than expected");
            }
            report.completed += 1;
        }

        if quit.is_cancelled() {
            break;
        }
    }

    report.elapsed = started.elapsed();
    report
}
