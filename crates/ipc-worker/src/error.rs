//! Error types for the worker pools.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable failure a pool can surface to its owner. Failures local to a
//! single worker (a hook returning an error, a socket dropping) never reach
//! this type: they are logged where they happen and the pool keeps running
//! with the remaining workers.
//!
//! ## Error Cases
//! - `InvalidConfig`: A [`PoolConfig`](crate::PoolConfig) failed validation.
//! - `PayloadTooLarge`: A payload does not fit in a worker segment.
//! - `ChannelError`: An internal channel was closed or refused a message.
//! - `Handshake`: A role did not publish its address or readiness in time.
//! - `Socket`: The ZeroMQ transport reported an error.
//! - `AlreadyStarted`: `start` was called twice.
//! - `ServiceShutdown`: The pool's quit token fired or its channels closed.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for both pool backends.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool configuration is unusable.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// A payload exceeds the byte capacity of the per-worker segment.
    #[error("Payload of {size} bytes exceeds segment capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    /// Internal channel send/receive failure (e.g. closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A role failed to publish its bound address or readiness signal.
    #[error("Handshake with {role} failed")]
    Handshake { role: String },

    /// Underlying ZeroMQ socket failure.
    #[error("Socket error: {0}")]
    Socket(#[from] zeromq::ZmqError),

    /// `start` was called on a pool that is already running.
    #[error("Pool already started")]
    AlreadyStarted,

    /// The pool is shutting down or has shut down.
    #[error("Pool is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn channel(context: impl Into<String>) -> Self {
        Self::ChannelError {
            context: context.into(),
        }
    }
}
