use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::type_alias::*;

/// Details of a [`SmEvent`].
#[derive(Debug, Clone)]
pub(crate) enum SmEventDetails {
    /// A request sent from a remote peer to connect to a local [`Rpc`](crate::Rpc).
    ConnectRequest {
        cli_sess_id: SessId,
        ep_blob: Vec<u8>,
    },

    /// Positive response to a `ConnectRequest`.
    ConnectAcknowledge {
        cli_sess_id: SessId,
        svr_sess_id: SessId,
        ep_blob: Vec<u8>,
    },

    /// Negative response to a `ConnectRequest`.
    ConnectRefuse { cli_sess_id: SessId },

    /// Disconnect request from a remote client session.
    DisconnectRequest {
        cli_sess_id: SessId,
        svr_sess_id: SessId,
    },

    /// Acknowledgement of a disconnect request.
    DisconnectAcknowledge { cli_sess_id: SessId },
}

/// Event routed by the [`Nexus`](crate::Nexus) and handled by an [`Rpc`](crate::Rpc)
/// instance on its own event-loop thread.
#[derive(Debug, Clone)]
pub(crate) struct SmEvent {
    /// Management URI of the Nexus this event came from.
    pub(crate) src_uri: SocketAddr,

    /// The ID of the `Rpc` instance that this event comes from.
    pub(crate) src_rpc_id: RpcId,

    /// The ID of the `Rpc` instance that this event is targeted at.
    pub(crate) dst_rpc_id: RpcId,

    /// The details of this event, including its type and necessary parameters.
    pub(crate) details: SmEventDetails,
}

/// Event sender.
pub(crate) struct SmEventTx(Arc<SegQueue<SmEvent>>);

impl SmEventTx {
    /// Send an event.
    pub(crate) fn send(&self, event: SmEvent) {
        self.0.push(event);
    }
}

/// Event receiver.
pub(crate) struct SmEventRx(Arc<SegQueue<SmEvent>>);

impl SmEventRx {
    /// Receive an event.
    pub(crate) fn recv(&self) -> Option<SmEvent> {
        self.0.pop()
    }

    /// Returns `true` if there is no event in the queue.
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Create a pair of event sender and receiver.
pub(crate) fn sm_event_channel() -> (SmEventTx, SmEventRx) {
    let queue = Arc::new(SegQueue::new());
    (SmEventTx(queue.clone()), SmEventRx(queue))
}
