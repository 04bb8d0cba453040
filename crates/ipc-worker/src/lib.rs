//! # `ipc-worker`: Worker Pools with Correlated, Streamed Responses
//!
//! Client code submits opaque payloads to a pool of workers with `put`,
//! receives a request id, and later retrieves the response with `get`. A
//! worker may answer with a single payload or a stream; every response item
//! is a [`Fragment`] tagged with a sequence number, and `get` hands items
//! out in sequence order as soon as the worker produced them, then `None`
//! once the reply is exhausted.
//!
//! Two backends implement the same contract:
//!
//! - [`ShmPool`]: per-worker segments of fixed capacity, gated by a counting
//!   semaphore so a request is only dispatched to an idle worker.
//! - [`ZmqPool`]: PUB/SUB fan-out by worker identity and PUSH/PULL fan-in,
//!   over ZeroMQ sockets bound on the loopback interface.
//!
//! Business logic lives behind the [`Worker`] trait; the pools only depend
//! on its three hooks.

mod config;
mod correlation;
mod error;
mod rendezvous;
mod role;
mod shm;
mod time;
mod types;
mod worker;
mod zmq;

pub use crate::config::*;
pub use crate::correlation::{Correlator, ENTRY_TTL, REFRESH_INTERVAL, SWEEP_INTERVAL};
pub use crate::error::*;
pub use crate::role::*;
pub use crate::shm::{ShmPool, WorkerState};
pub use crate::time::*;
pub use crate::types::*;
pub use crate::worker::{HookError, HookResult, Reply, Worker, WorkerInfo};
pub use crate::zmq::ZmqPool;
