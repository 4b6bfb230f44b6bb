use thiserror::Error;

use crate::type_alias::*;

/// Errors produced by the RPC runtime.
///
/// Setup and allocation errors are returned synchronously from the failing
/// call. Errors that occur after a request is in flight are delivered through
/// the request's awaitable instead, and never affect unrelated requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The buffer arena cannot grow any further.
    #[error("out of memory: buffer arena cannot grow")]
    OutOfMemory,

    /// The NIC rejected a memory region registration.
    #[error("memory region registration failed")]
    RegistrationFailed,

    /// The session number space of this endpoint is exhausted.
    #[error("no free session number")]
    NoFreeSession,

    /// A request was enqueued on a session that is not connected.
    #[error("session {0} is not connected")]
    SessionNotConnected(SessId),

    /// All request slots of the session are occupied. The caller may retry
    /// after running the event loop to drain responses.
    #[error("no credits left on session {0}")]
    NoCredits(SessId),

    /// The session was torn down while the request was outstanding.
    /// The request and response buffers are returned to the caller unchanged.
    #[error("session reset with requests outstanding")]
    SessionReset,

    /// The remote peer refused the connection request.
    #[error("connection refused by remote peer")]
    ConnectRefused,

    /// Out-of-band session setup did not complete within the budget.
    #[error("session setup timed out")]
    SetupTimeout,

    /// The transport hit an unrecoverable error. The endpoint is dead and
    /// all of its sessions have been reset.
    #[error("unrecoverable transport failure")]
    FatalTransport,
}
