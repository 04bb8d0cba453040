//! Request/response correlation shared by both pool backends.
//!
//! The [`Correlator`] owns two tables, guarded by one lock:
//!
//! - **pending requests**: every id handed out by `put` that still has
//!   fragments to deliver, with its last-touched timestamp;
//! - **pending responses**: fragments that arrived on the pool's single
//!   output channel and have not been claimed yet, kept per request id in
//!   ascending `seq` order.
//!
//! Fragments from all workers interleave on one channel, so a fragment is
//! always filed under its own request id and never handed to a caller
//! waiting on another id. Waiters park on a per-request [`Notify`] and are
//! woken when a fragment for their id arrives.
//!
//! Abandoned entries are reclaimed by a coarse sweep: at most once every
//! [`SWEEP_INTERVAL`], anything untouched for [`ENTRY_TTL`] is dropped.


use crate::{
    time::{MonotonicClock, TimeSource},
    types::{Fragment, Marker, RequestId, Seq},
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Minimum wall time between two garbage-collection sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Age after which an untouched entry is considered abandoned.
pub const ENTRY_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on how long a waiter sleeps before refreshing its entry.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct PendingRequest {
    last_touched: u64,
    waker: Arc<Notify>,
    consumed: u32,
    /// Number of data fragments in the reply, once known.
    total: Option<u32>,
}

impl PendingRequest {
    fn new(now: u64) -> Self {
        Self {
            last_touched: now,
            waker: Arc::new(Notify::new()),
            consumed: 0,
            total: None,
        }
    }

    /// True once every data fragment of the reply was consumed.
    fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.consumed >= total)
    }

    /// True if `seq` lies past the end of a reply of known length.
    fn is_beyond_end(&self, seq: Option<Seq>) -> bool {
        matches!((seq, self.total), (Some(seq), Some(total)) if seq >= total)
    }
}

struct PendingResponse {
    last_touched: u64,
    fragments: VecDeque<Fragment>,
}

impl PendingResponse {
    fn new(now: u64) -> Self {
        Self {
            last_touched: now,
            fragments: VecDeque::new(),
        }
    }

    /// Inserts `fragment` keeping the buffer ascending by `seq`.
    fn insert(&mut self, fragment: Fragment) {
        let pos = self.fragments.partition_point(|f| f.seq <= fragment.seq);
        self.fragments.insert(pos, fragment);
    }

    /// Removes the end marker, if it arrived, and returns its count.
    ///
    /// A stream's end marker carries the highest `seq` of its reply, so it
    /// always sits at the back of the buffer.
    fn take_end(&mut self) -> Option<u32> {
        if !self.fragments.back()?.is_end() {
            return None;
        }
        self.fragments.pop_back().map(|end| end.seq)
    }

    /// Removes the fragment with `seq`, or the lowest one if `seq` is `None`.
    fn take(&mut self, seq: Option<Seq>) -> Option<Fragment> {
        match seq {
            None => self.fragments.pop_front(),
            Some(seq) => {
                let pos = self.fragments.iter().position(|f| f.seq == seq)?;
                self.fragments.remove(pos)
            }
        }
    }
}

#[derive(Default)]
struct Tables {
    next_id: RequestId,
    last_sweep: u64,
    closed: bool,
    requests: HashMap<RequestId, PendingRequest>,
    responses: HashMap<RequestId, PendingResponse>,
}

impl Tables {
    fn sweep(&mut self, now: u64) {
        if now.saturating_sub(self.last_sweep) < SWEEP_INTERVAL.as_millis() as u64 {
            return;
        }
        self.last_sweep = now;

        let ttl = ENTRY_TTL.as_millis() as u64;
        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.last_touched) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            tracing::debug!(?expired, "Removing stale requests");
        }
        for id in expired {
            if let Some(request) = self.requests.remove(&id) {
                request.waker.notify_waiters();
            }
        }
        self.responses
            .retain(|_, r| now.saturating_sub(r.last_touched) < ttl);
    }
}

enum Lookup {
    Done(Option<Bytes>),
    Wait(Arc<Notify>),
}

/// Correlates submitted requests with the fragments workers send back.
///
/// One instance belongs to exactly one pool. All table mutations happen
/// under a single lock that is never held across an `.await`.
pub struct Correlator<T: TimeSource = MonotonicClock> {
    tables: Mutex<Tables>,
    time: T,
}

impl Correlator<MonotonicClock> {
    pub fn new() -> Self {
        Self::with_time(MonotonicClock::new())
    }
}

impl Default for Correlator<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> Correlator<T> {
    /// Creates a correlator reading time from `time`.
    pub fn with_time(time: T) -> Self {
        let now = time.current_millis();
        Self {
            tables: Mutex::new(Tables {
                last_sweep: now,
                ..Tables::default()
            }),
            time,
        }
    }

    /// Allocates the next request id and records it as pending.
    ///
    /// Ids start at 1 and are strictly increasing for the lifetime of the
    /// correlator.
    pub fn allocate(&self) -> RequestId {
        let now = self.time.current_millis();
        let mut tables = self.tables.lock();
        tables.next_id += 1;
        let id = tables.next_id;
        tables.requests.insert(id, PendingRequest::new(now));
        id
    }

    /// Records an id allocated elsewhere as pending.
    pub fn track(&self, id: RequestId) {
        let now = self.time.current_millis();
        let mut tables = self.tables.lock();
        tables.next_id = tables.next_id.max(id);
        tables
            .requests
            .entry(id)
            .or_insert_with(|| PendingRequest::new(now));
    }

    /// Drops every trace of `id`, e.g. after its submission failed.
    pub fn forget(&self, id: RequestId) {
        let mut tables = self.tables.lock();
        tables.responses.remove(&id);
        if let Some(request) = tables.requests.remove(&id) {
            request.waker.notify_waiters();
        }
    }

    /// Files a fragment under its request id and wakes that id's waiters.
    pub fn deliver(&self, fragment: Fragment) {
        let now = self.time.current_millis();
        let id = fragment.request_id;
        let mut tables = self.tables.lock();
        let buffer = tables
            .responses
            .entry(id)
            .or_insert_with(|| PendingResponse::new(now));
        buffer.last_touched = now;
        buffer.insert(fragment);
        if let Some(request) = tables.requests.get(&id) {
            request.waker.notify_waiters();
        }
    }

    /// Waits for the next fragment of `id`.
    ///
    /// With `seq == None` the lowest buffered sequence number is returned;
    /// otherwise only the fragment with exactly that sequence number. Returns
    /// `None` immediately if `id` is unknown (never submitted, fully consumed
    /// or reclaimed), once its stream ended with nothing left to deliver or
    /// `seq` lies past that end, and when the correlator is closed with
    /// nothing left to deliver. Otherwise waits without bound.
    pub async fn receive(&self, id: RequestId, seq: Option<Seq>) -> Option<Bytes> {
        loop {
            let waker = match self.try_take(id, seq) {
                Lookup::Done(out) => return out,
                Lookup::Wait(waker) => waker,
            };
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A fragment may have landed between the lookup and `enable`.
            if let Lookup::Done(out) = self.try_take(id, seq) {
                return out;
            }
            let _ = tokio::time::timeout(REFRESH_INTERVAL, notified).await;
        }
    }

    fn try_take(&self, id: RequestId, seq: Option<Seq>) -> Lookup {
        let now = self.time.current_millis();
        let mut tables = self.tables.lock();

        if !tables.requests.contains_key(&id) {
            tracing::error!(request_id = id, "Bad request id");
            tables.sweep(now);
            return Lookup::Done(None);
        }

        let (end, taken) = match tables.responses.get_mut(&id) {
            Some(buffer) => {
                buffer.last_touched = now;
                let end = buffer.take_end();
                let fragment = buffer.take(seq);
                if buffer.fragments.is_empty() {
                    tables.responses.remove(&id);
                }
                (end, fragment)
            }
            None => (None, None),
        };

        let closed = tables.closed;
        let Some(request) = tables.requests.get_mut(&id) else {
            return Lookup::Done(None);
        };
        request.last_touched = now;
        if end.is_some() {
            request.total = end;
        }
        if let Some(fragment) = &taken {
            request.consumed += 1;
            if fragment.marker == Marker::Last {
                request.total = Some(fragment.seq + 1);
            }
        }

        let out = taken.map(|fragment| fragment.payload);
        if request.is_complete() {
            tables.requests.remove(&id);
        } else if out.is_none() && !closed && !request.is_beyond_end(seq) {
            return Lookup::Wait(Arc::clone(&request.waker));
        }
        tables.sweep(now);
        Lookup::Done(out)
    }

    /// Runs a garbage-collection sweep if the last one is old enough.
    pub fn gc(&self) {
        let now = self.time.current_millis();
        self.tables.lock().sweep(now);
    }

    /// Stops waiting: parked and future receivers return whatever is
    /// buffered, then `None`.
    pub fn close(&self) {
        let mut tables = self.tables.lock();
        tables.closed = true;
        for request in tables.requests.values() {
            request.waker.notify_waiters();
        }
    }

    /// Whether `id` is still pending.
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.tables.lock().requests.contains_key(&id)
    }

    /// Number of pending requests.
    pub fn pending_requests(&self) -> usize {
        self.tables.lock().requests.len()
    }

    /// Number of request ids with buffered, unclaimed fragments.
    pub fn pending_responses(&self) -> usize {
        self.tables.lock().responses.len()
    }
}

/// Drains the pool's output channel into `correlator` until the channel
/// disconnects or `quit` fires, then closes the correlator.
pub(crate) async fn pump_fragments<T: TimeSource>(
    correlator: Arc<Correlator<T>>,
    output: flume::Receiver<Fragment>,
    quit: CancellationToken,
) {
    tracing::debug!("Fragment pump started");
    loop {
        tokio::select! {
            biased;

            () = quit.cancelled() => break,

            fragment = output.recv_async() => match fragment {
                Ok(fragment) => correlator.deliver(fragment),
                Err(_) => break,
            },
        }
    }
    correlator.close();
    tracing::debug!("Fragment pump stopped");
}
