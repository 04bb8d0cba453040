//! Multipart frame layout of the socket backend.
//!
//! Requests published by the distribution role:
//!
//! ```text
//! [identity][payload][request_id: u64 LE]
//! ```
//!
//! Fragments pushed by workers to the collection role:
//!
//! ```text
//! [request_id: u64 LE][worker_id: u32 LE][seq: u32 LE][payload]
//! ```
//!
//! The two top bits of the `seq` field carry the fragment's [`Marker`]:
//! bit 31 for [`Marker::Last`], bit 30 for [`Marker::End`]. Sequence numbers
//! never exceed [`MAX_FRAGMENTS`], so they stay clear of both. The layout
//! never leaves the local machine and is not versioned.

use crate::types::{Fragment, MAX_FRAGMENTS, Marker, RequestId, Seq, WorkerId};
use bytes::Bytes;
use zeromq::ZmqMessage;

const LAST_FLAG: u32 = 1 << 31;
const END_FLAG: u32 = 1 << 30;

/// Reasons a received message is rejected.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("expected {expected} frames, got {got}")]
    FrameCount { expected: usize, got: usize },

    #[error("seq field {0:#010x} sets both marker bits")]
    Marker(u32),

    #[error("{field} frame is {got} bytes, expected {expected}")]
    FieldWidth {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}

/// A request as seen by a worker.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) identity: Bytes,
    pub(crate) id: RequestId,
    pub(crate) payload: Bytes,
}

pub(crate) fn encode_request(identity: &str, id: RequestId, payload: Bytes) -> ZmqMessage {
    let mut msg = ZmqMessage::from(Bytes::copy_from_slice(identity.as_bytes()));
    msg.push_back(payload);
    msg.push_back(Bytes::copy_from_slice(&id.to_le_bytes()));
    msg
}

pub(crate) fn decode_request(msg: ZmqMessage) -> Result<Request, FrameError> {
    let [identity, payload, id] = frames::<3>(msg)?;
    Ok(Request {
        identity,
        id: RequestId::from_le_bytes(field("request_id", &id)?),
        payload,
    })
}

pub(crate) fn encode_fragment(fragment: &Fragment) -> ZmqMessage {
    debug_assert!(fragment.seq <= MAX_FRAGMENTS, "seq overflows the wire format");
    let seq = match fragment.marker {
        Marker::More => fragment.seq,
        Marker::Last => fragment.seq | LAST_FLAG,
        Marker::End => fragment.seq | END_FLAG,
    };
    let mut msg = ZmqMessage::from(Bytes::copy_from_slice(&fragment.request_id.to_le_bytes()));
    msg.push_back(Bytes::copy_from_slice(&fragment.worker_id.to_le_bytes()));
    msg.push_back(Bytes::copy_from_slice(&seq.to_le_bytes()));
    msg.push_back(fragment.payload.clone());
    msg
}

pub(crate) fn decode_fragment(msg: ZmqMessage) -> Result<Fragment, FrameError> {
    let [id, worker_id, seq, payload] = frames::<4>(msg)?;
    let raw = Seq::from_le_bytes(field("seq", &seq)?);
    let marker = match (raw & LAST_FLAG != 0, raw & END_FLAG != 0) {
        (false, false) => Marker::More,
        (true, false) => Marker::Last,
        (false, true) => Marker::End,
        (true, true) => return Err(FrameError::Marker(raw)),
    };
    Ok(Fragment::new(
        RequestId::from_le_bytes(field("request_id", &id)?),
        WorkerId::from_le_bytes(field("worker_id", &worker_id)?),
        raw & !(LAST_FLAG | END_FLAG),
        marker,
        payload,
    ))
}

fn frames<const N: usize>(msg: ZmqMessage) -> Result<[Bytes; N], FrameError> {
    let frames = msg.into_vec();
    let got = frames.len();
    <[Bytes; N]>::try_from(frames).map_err(|_| FrameError::FrameCount { expected: N, got })
}

fn field<const N: usize>(name: &'static str, frame: &Bytes) -> Result<[u8; N], FrameError> {
    <[u8; N]>::try_from(frame.as_ref()).map_err(|_| FrameError::FieldWidth {
        field: name,
        expected: N,
        got: frame.len(),
    })
}
