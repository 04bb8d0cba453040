//! # Shared Request/Response Types
//!
//! Identifiers and the response fragment exchanged between workers and the
//! pool orchestrators.
//!
//! - [`RequestId`] - Allocated once per `put`, strictly increasing, never
//!   reused within a pool.
//! - [`WorkerId`] - Index of the worker that produced a fragment.
//! - [`Seq`] - Position of a fragment within one reply, starting at 0.
//! - [`Fragment`] - One unit of a worker's response.

use bytes::Bytes;

/// Identifier of a submitted request.
pub type RequestId = u64;

/// Index of a worker within its pool.
pub type WorkerId = u32;

/// Position of a fragment within a single reply.
pub type Seq = u32;

/// Upper bound on the data fragments of a single reply. Longer streams are
/// cut off there and closed with an end marker.
pub const MAX_FRAGMENTS: Seq = (1 << 30) - 1;

/// Where a fragment sits within its reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// A streamed element; more may follow.
    More,
    /// The only fragment of a non-streamed reply.
    Last,
    /// Closes a stream. Carries no payload; its `seq` is the number of
    /// data fragments that preceded it.
    End,
}

/// One unit of a worker's response.
///
/// A non-streamed reply is a single [`Marker::Last`] fragment with
/// `seq == 0`. A streamed reply sends every element as soon as it is
/// produced, with consecutive sequence numbers, followed by one
/// [`Marker::End`] fragment. Either way the correlator learns how many
/// fragments the reply holds and retires the request once all of them were
/// consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub seq: Seq,
    pub marker: Marker,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(
        request_id: RequestId,
        worker_id: WorkerId,
        seq: Seq,
        marker: Marker,
        payload: Bytes,
    ) -> Self {
        Self {
            request_id,
            worker_id,
            seq,
            marker,
            payload,
        }
    }

    /// The end marker of a stream that produced `count` data fragments.
    pub fn end(request_id: RequestId, worker_id: WorkerId, count: Seq) -> Self {
        Self::new(request_id, worker_id, count, Marker::End, Bytes::new())
    }

    pub fn is_end(&self) -> bool {
        self.marker == Marker::End
    }
}
