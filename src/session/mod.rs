mod handle;
mod sslot;

use std::net::SocketAddr;

pub use self::handle::SessionHandle;
pub(crate) use self::sslot::*;
use crate::transport::TpPeer;
use crate::type_alias::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// No peer attached; the initial and final state.
    Disconnected,

    /// Out-of-band hello sent, waiting for the acknowledgement.
    ConnectInProgress,

    /// Fully established; the only state that accepts requests.
    Connected,

    /// Out-of-band goodbye sent, waiting for the acknowledgement.
    DisconnectInProgress,

    /// Local teardown underway: slots are being failed and resources
    /// returned. The session number becomes reusable when this completes.
    ResetInProgress,
}

/// Per-peer state: one reliable request/response channel between two
/// endpoints. The slot pool doubles as the credit window: a request holds
/// its slot (and thus a credit) from enqueue until its response has been
/// fully received and observed.
pub(crate) struct Session {
    pub role: SessionRole,
    pub state: SessionState,

    /// Uniqueness stamp: distinguishes incarnations after session-number
    /// reuse, so stale handles and awaitables cannot touch a new session.
    pub stamp: u64,

    /// Set when the remote peer refused the connection.
    pub refused: bool,

    /// Management URI of the remote Nexus.
    pub remote_uri: SocketAddr,

    /// Remote peer's Rpc ID.
    pub peer_rpc_id: RpcId,

    /// Remote peer's session ID.
    pub peer_sess_id: SessId,

    /// Remote peer routing information.
    pub peer: Option<TpPeer>,

    /// Session request slots.
    pub slots: Vec<SSlot>,

    /// Indices of unoccupied slots.
    pub free_slots: Vec<usize>,
}

impl Session {
    /// Create a new session with the given number of request slots.
    pub fn new(
        role: SessionRole,
        stamp: u64,
        remote_uri: SocketAddr,
        peer_rpc_id: RpcId,
        num_slots: usize,
    ) -> Self {
        Self {
            role,
            state: SessionState::Disconnected,
            stamp,
            refused: false,
            remote_uri,
            peer_rpc_id,
            peer_sess_id: 0,
            peer: None,
            slots: (0..num_slots).map(SSlot::new).collect(),
            free_slots: (0..num_slots).rev().collect(),
        }
    }

    /// Return `true` if this session is a client, otherwise server.
    #[inline(always)]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Return `true` if this session is connected.
    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}
