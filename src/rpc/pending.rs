use crate::handler::ReqHandlerFuture;
use crate::type_alias::*;

/// A request handler that returned `Pending` and is parked until a later
/// event-loop pass.
pub(super) struct PendingHandler {
    /// Session ID.
    pub sess_id: SessId,

    /// Incarnation stamp of the session at park time.
    pub stamp: u64,

    /// Slot index.
    pub sslot_idx: usize,

    /// Request handler body.
    pub handler: ReqHandlerFuture,
}

/// A fully-reassembled request waiting for its handler to be invoked.
pub(super) struct ReadyReq {
    /// Session ID.
    pub sess_id: SessId,

    /// Incarnation stamp of the session at completion time.
    pub stamp: u64,

    /// Slot index.
    pub sslot_idx: usize,
}
