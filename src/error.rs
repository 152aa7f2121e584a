use std::sync::Arc;

/// The errors a request completion can carry.
///
/// [`Error::Timeout`] and [`Error::PendingRequestsOverflow`] are per-request
///  and leave the connection alone. [`Error::Connection`] means the connection
///  was torn down; the variant is shared between all requests that were in
///  flight at that moment, which is why it is `Clone` over an `Arc`.
///  [`Error::Protocol`] reports a programming error on one of the endpoints
///  and also terminates the connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The request's deadline elapsed before a response arrived.
    #[error("timeout")]
    Timeout,

    /// The client's pending-request queue is at capacity.
    #[error("pending requests overflowed")]
    PendingRequestsOverflow,

    /// The connection failed. Carries dial / handshake / socket / codec context.
    #[error("{0}")]
    Connection(Arc<anyhow::Error>),

    /// A contract violation, e.g. a nonce collision in the pending-response map.
    #[error("protocol bug: {0}")]
    Protocol(Arc<str>),
}

impl Error {
    pub fn conn(err: anyhow::Error) -> Error {
        Error::Connection(Arc::new(err))
    }

    pub fn protocol(msg: impl Into<Arc<str>>) -> Error {
        Error::Protocol(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Error::PendingRequestsOverflow)
    }
}
