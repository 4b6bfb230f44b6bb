use std::ptr;

use bitvec::vec::BitVec;
use quanta::Instant;

use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::type_alias::*;

/// Lifecycle of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No request occupies the slot.
    Free,

    /// Client: request in flight, response not yet complete.
    CliPending,

    /// Client: response complete (or the request failed); the awaitable has
    /// not observed the outcome yet. The credit is released on observation.
    CliDone,

    /// Server: receiving request packets.
    SrvRx,

    /// Server: request complete, handler running (possibly parked).
    SrvPending,

    /// Server: response stored and (re)transmittable.
    SrvResponded,
}

/// One outstanding-request container within a session.
///
/// The request number is slot-scoped: it starts at the slot index and
/// advances by the slot count on every reuse, so `req_idx % slots` always
/// recovers the owning slot and `(session, req_idx)` uniquely identifies a
/// request for duplicate detection.
pub(crate) struct SSlot {
    pub state: SlotState,
    pub req_idx: ReqIdx,
    pub req_type: ReqType,

    // Client-side fields.
    /// The user's request buffer, borrowed for the lifetime of the request.
    pub req: *const MsgBuf,
    /// The user's response buffer; the response is reassembled in place.
    pub resp: *mut MsgBuf,
    /// Packets in the request.
    pub req_pkts: usize,
    /// Request packets handed to the transport so far.
    pub req_sent: usize,
    /// Cumulative contiguous request packets acknowledged by the receiver.
    pub req_acked: usize,
    /// Packets in the response; zero until the first response packet.
    pub resp_pkts: usize,
    /// Which response packets have arrived.
    pub resp_rx: BitVec,
    /// Count of distinct response packets received.
    pub resp_rcvd: usize,
    /// Next response packet index to pull with an `Rfr`.
    pub rfr_next: usize,
    /// Retransmission deadline while `CliPending`.
    pub rtx_deadline: Instant,
    /// Outcome reported to the awaitable in `CliDone`.
    pub result: Result<(), Error>,

    // Server-side fields.
    /// Pre-allocated copy target for single-packet requests, so the receive
    /// ring can be replenished before the handler runs.
    pub pre_req: Option<MsgBuf>,
    /// Pre-allocated MTU-sized response buffer handed to handlers.
    pub pre_resp: Option<MsgBuf>,
    /// The request visible to the handler: an alias of `pre_req`, or an
    /// owned reassembly buffer for multi-packet requests.
    pub srv_req: Option<MsgBuf>,
    /// Packets in the request being received.
    pub srv_req_pkts: usize,
    /// Which request packets have arrived.
    pub srv_rx: BitVec,
    /// Count of distinct request packets received.
    pub srv_rcvd: usize,
    /// Contiguous request packets received from index 0, returned as credit.
    pub srv_contig: usize,
    /// The stored response, kept for duplicate-request replay until the slot
    /// is reused by the next request.
    pub resp_stored: Option<MsgBuf>,
}

impl SSlot {
    pub fn new(idx: usize) -> Self {
        Self {
            state: SlotState::Free,
            req_idx: idx as ReqIdx,
            req_type: 0,

            req: ptr::null(),
            resp: ptr::null_mut(),
            req_pkts: 0,
            req_sent: 0,
            req_acked: 0,
            resp_pkts: 0,
            resp_rx: BitVec::new(),
            resp_rcvd: 0,
            rfr_next: 0,
            rtx_deadline: Instant::now(),
            result: Ok(()),

            pre_req: None,
            pre_resp: None,
            srv_req: None,
            srv_req_pkts: 0,
            srv_rx: BitVec::new(),
            srv_rcvd: 0,
            srv_contig: 0,
            resp_stored: None,
        }
    }

    /// Occupy the slot for a new client request.
    pub fn begin_client_request(
        &mut self,
        slots: usize,
        req_type: ReqType,
        req: *const MsgBuf,
        resp: *mut MsgBuf,
        req_pkts: usize,
        now: Instant,
        rtx_timeout: std::time::Duration,
    ) -> ReqIdx {
        debug_assert_eq!(self.state, SlotState::Free);
        self.req_idx += slots as ReqIdx;
        self.state = SlotState::CliPending;
        self.req_type = req_type;
        self.req = req;
        self.resp = resp;
        self.req_pkts = req_pkts;
        self.req_sent = 0;
        self.req_acked = 0;
        self.resp_pkts = 0;
        self.resp_rx.clear();
        self.resp_rcvd = 0;
        self.rfr_next = 0;
        self.rtx_deadline = now + rtx_timeout;
        self.result = Ok(());
        self.req_idx
    }

    /// Mark the client request finished with the given result.
    /// The slot stays occupied until the awaitable observes the outcome.
    pub fn complete_client(&mut self, result: Result<(), Error>) {
        debug_assert_eq!(self.state, SlotState::CliPending);
        self.state = SlotState::CliDone;
        self.result = result;
    }

    /// Return the slot to the free pool. Clears the borrowed user buffers.
    pub fn release(&mut self) {
        self.state = SlotState::Free;
        self.req = ptr::null();
        self.resp = ptr::null_mut();
    }

    /// Occupy the slot for a new incoming request.
    pub fn begin_server_rx(&mut self, req_idx: ReqIdx, req_type: ReqType, req_pkts: usize) {
        self.req_idx = req_idx;
        self.req_type = req_type;
        self.state = SlotState::SrvRx;
        self.srv_req = None;
        self.srv_req_pkts = req_pkts;
        self.srv_rx.clear();
        self.srv_rx.resize(req_pkts, false);
        self.srv_rcvd = 0;
        self.srv_contig = 0;
        // The previous response is buried here; a duplicate of the previous
        // request arriving from now on is stale and ignored.
        self.resp_stored = None;
    }
}
