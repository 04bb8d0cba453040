//! The business-logic contract implemented by pool users.
//!
//! A [`Worker`] owns whatever state its requests need and is driven through
//! three hooks: [`on_start`](Worker::on_start) once before the first request,
//! [`on_request`](Worker::on_request) once per request, and
//! [`on_stop`](Worker::on_stop) once when the pool tells it to quit. The
//! orchestration code depends only on this trait.
//!
//! Hooks are synchronous and run on a blocking thread, so CPU-heavy work does
//! not stall the async roles of the pool.

use crate::types::{MAX_FRAGMENTS, Marker, Seq, WorkerId};
use bytes::Bytes;
use std::sync::Arc;

/// Error type returned by worker hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by worker hooks.
pub type HookResult<T> = core::result::Result<T, HookError>;

/// Identity of a worker, handed to the factory that builds it.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    /// Position of the worker in its pool, `0..worker_num`.
    pub index: WorkerId,
    /// Group name of the owning pool.
    pub group: Arc<str>,
    /// Unique name of the worker, derived from the group name.
    pub name: String,
}

/// Result of a single [`Worker::on_request`] call.
pub enum Reply {
    /// A single response, delivered as one fragment with `seq == 0`.
    Single(Bytes),
    /// A lazily produced sequence; each element becomes its own fragment.
    Stream(Box<dyn Iterator<Item = Bytes> + Send>),
}

impl Reply {
    /// Builds a streamed reply from anything iterable.
    pub fn stream<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(Box::new(items.into_iter()))
    }
}

impl From<Bytes> for Reply {
    fn from(payload: Bytes) -> Self {
        Self::Single(payload)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(payload: Vec<u8>) -> Self {
        Self::Single(Bytes::from(payload))
    }
}

impl From<&'static [u8]> for Reply {
    fn from(payload: &'static [u8]) -> Self {
        Self::Single(Bytes::from_static(payload))
    }
}

impl core::fmt::Debug for Reply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Single(payload) => f.debug_tuple("Single").field(payload).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Business logic executed by every worker of a pool.
pub trait Worker: Send + 'static {
    /// Invoked once when the worker begins, before it accepts requests.
    fn on_start(&mut self) -> HookResult<()> {
        Ok(())
    }

    /// Invoked once per received request.
    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply>;

    /// Invoked once when the worker is told to quit, after its last request.
    fn on_stop(&mut self) -> HookResult<()> {
        Ok(())
    }
}

impl<W: Worker + ?Sized> Worker for Box<W> {
    fn on_start(&mut self) -> HookResult<()> {
        (**self).on_start()
    }

    fn on_request(&mut self, payload: Bytes) -> HookResult<Reply> {
        (**self).on_request(payload)
    }

    fn on_stop(&mut self) -> HookResult<()> {
        (**self).on_stop()
    }
}

/// Type-erased worker factory shared by every worker slot of a pool.
pub(crate) type WorkerFactory = Arc<dyn Fn(&WorkerInfo) -> Box<dyn Worker> + Send + Sync>;

pub(crate) fn boxed_factory<F, W>(factory: F) -> WorkerFactory
where
    F: Fn(&WorkerInfo) -> W + Send + Sync + 'static,
    W: Worker,
{
    Arc::new(move |info| Box::new(factory(info)) as Box<dyn Worker>)
}

/// Feeds `reply` to `sink` as `(seq, marker, payload)`.
///
/// Each streamed element goes out as soon as the iterator yields it, with
/// sequence numbers starting at 0, and the stream is closed by a
/// [`Marker::End`] fragment. Stops at the first sink error and returns it;
/// returns the number of data fragments emitted otherwise.
pub(crate) fn emit_fragments<E, F>(reply: Reply, sink: F) -> Result<usize, E>
where
    F: FnMut(Seq, Marker, Bytes) -> Result<(), E>,
{
    emit_bounded(reply, MAX_FRAGMENTS, sink)
}

fn emit_bounded<E, F>(reply: Reply, limit: Seq, mut sink: F) -> Result<usize, E>
where
    F: FnMut(Seq, Marker, Bytes) -> Result<(), E>,
{
    match reply {
        Reply::Single(payload) => {
            sink(0, Marker::Last, payload)?;
            Ok(1)
        }
        Reply::Stream(items) => {
            let mut seq: Seq = 0;
            for payload in items {
                if seq == limit {
                    tracing::warn!(limit, "Stream truncated");
                    break;
                }
                sink(seq, Marker::More, payload)?;
                seq += 1;
            }
            sink(seq, Marker::End, Bytes::new())?;
            Ok(seq as usize)
        }
    }
}

/// Runs a hook and logs its failure. Returns whether the hook succeeded.
pub(crate) fn run_hook(
    name: &str,
    hook: &'static str,
    f: impl FnOnce() -> HookResult<()>,
) -> bool {
    match f() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(worker = name, hook, "Worker hook failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collect(reply: Reply) -> Vec<(Seq, Marker, Bytes)> {
        let mut out = Vec::new();
        emit_fragments::<(), _>(reply, |seq, marker, payload| {
            out.push((seq, marker, payload));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn single_reply_is_one_last_fragment() {
        let out = collect(Reply::from(Bytes::from_static(b"x")));
        assert_eq!(out, vec![(0, Marker::Last, Bytes::from_static(b"x"))]);
    }

    #[test]
    fn stream_is_closed_by_an_end_marker() {
        let out = collect(Reply::stream(
            ["a", "b", "c"].map(|s| Bytes::from_static(s.as_bytes())),
        ));
        let marks: Vec<_> = out.iter().map(|(seq, marker, _)| (*seq, *marker)).collect();
        assert_eq!(
            marks,
            vec![
                (0, Marker::More),
                (1, Marker::More),
                (2, Marker::More),
                (3, Marker::End)
            ]
        );
        assert_eq!(out[2].2, Bytes::from_static(b"c"));
        assert!(out[3].2.is_empty());
    }

    #[test]
    fn empty_stream_emits_only_the_end_marker() {
        let out = collect(Reply::stream(Vec::<Bytes>::new()));
        assert_eq!(out, vec![(0, Marker::End, Bytes::new())]);
    }

    #[test]
    fn elements_are_sent_before_the_next_is_produced() {
        let (tx, rx) = mpsc::channel::<u32>();
        let items = (0..3u32).map(move |i| {
            // Every element must already have reached the sink by the time
            // the iterator is polled for the following one.
            if i > 0 {
                assert_eq!(rx.try_recv(), Ok(i - 1));
            }
            Bytes::new()
        });
        let sent = emit_fragments::<(), _>(Reply::stream(items), |seq, marker, _| {
            if marker == Marker::More {
                tx.send(seq).unwrap();
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(sent, 3);
    }

    #[test]
    fn overlong_stream_is_truncated_and_still_closed() {
        let mut out = Vec::new();
        let sent = emit_bounded::<(), _>(
            Reply::stream(std::iter::repeat(Bytes::new()).take(10)),
            4,
            |seq, marker, _| {
                out.push((seq, marker));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(out.len(), 5);
        assert_eq!(out[4], (4, Marker::End));
    }

    #[test]
    fn sink_error_stops_emission() {
        let mut calls = 0;
        let result = emit_fragments(
            Reply::stream(vec![Bytes::new(), Bytes::new(), Bytes::new()]),
            |_, _, _| {
                calls += 1;
                if calls == 2 { Err("closed") } else { Ok(()) }
            },
        );
        assert_eq!(result, Err("closed"));
        assert_eq!(calls, 2);
    }
}
