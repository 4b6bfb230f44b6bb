mod pending;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};
use std::time::Duration;
use std::{array, mem, ptr};

use futures::future::FutureExt;
use futures::task::noop_waker_ref;
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rmp_serde as rmps;

use self::pending::*;
use crate::config::Config;
use crate::error::Error;
use crate::handler::{ReqHandler, RequestHandle};
use crate::msgbuf::MsgBuf;
use crate::nexus::wire::{SmFrame, SmPktKind};
use crate::nexus::{Nexus, SmEventDetails, SmEventRx};
use crate::pkthdr::*;
use crate::request::Request;
use crate::session::*;
use crate::transport::*;
use crate::type_alias::*;
use crate::util::thread_check::do_thread_check;
use crate::util::{buddy::*, likely::*, math::*};

/// Retransmission timeout for in-flight requests. The fabric is assumed
/// mostly lossless, so this only needs to cover rare drops; retries are
/// unbounded and surface in [`RpcStats`], not as errors.
const RTX_TIMEOUT: Duration = Duration::from_millis(5);

/// Number of pre-allocated header-only buffers for credit and pull packets.
/// Sized so one event-loop pass cannot reuse a buffer that is still queued.
const CTRL_RING_SIZE: usize = 256;

const HDR_SIZE: usize = mem::size_of::<PacketHeader>();

/// Datapath counters of an endpoint, updated on its event-loop thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcStats {
    /// Packets handed to the transport.
    pub tx_pkts: u64,

    /// Packets received from the transport.
    pub rx_pkts: u64,

    /// Expired retransmission deadlines.
    pub retransmissions: u64,

    /// Explicit credit returns sent.
    pub credit_returns: u64,

    /// Response packets pulled with request-for-response packets.
    pub resp_pulls: u64,

    /// Outbound packets dropped by fault injection.
    pub faults_injected: u64,

    /// Sessions torn down with requests outstanding.
    pub sessions_reset: u64,
}

/// Interior-mutable state of an [`Rpc`] instance.
struct RpcInterior {
    /// Parked request handlers.
    // Declared before `sessions`: handler futures hold slot pointers and
    // must drop first.
    pending_handlers: Vec<PendingHandler>,

    /// Torn-down sessions whose storage may still be referenced by a handler
    /// on the current stack. Reclaimed at the top of the event loop.
    graveyard: Vec<Box<Session>>,

    /// Sessions, indexed by session number. Boxed so slot addresses stay
    /// stable across vector growth.
    sessions: Vec<Option<Box<Session>>>,

    /// Reusable session numbers.
    free_sess_ids: Vec<SessId>,

    /// Transport layer.
    // Declared before `allocator` so that memory regions deregister before
    // arena pages can unmap.
    tp: ActiveTransport,

    /// Buffer arena.
    allocator: Rc<BuddyAllocator>,

    /// Header-only buffers for credit returns and response pulls.
    ctrl_ring: Vec<MsgBuf>,

    /// Next control buffer to reuse.
    ctrl_next: usize,

    /// Session incarnation stamp source.
    next_stamp: u64,

    /// Datapath counters.
    stats: RpcStats,

    /// Fault-injection randomness.
    rng: SmallRng,
}

impl RpcInterior {
    /// Look up a live session by number, checking its incarnation stamp.
    fn session_mut(&mut self, sess_id: SessId, stamp: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(sess_id as usize)?
            .as_deref_mut()
            .filter(|sess| sess.stamp == stamp)
    }

    /// Like [`Self::session_mut`], but only answers liveness.
    fn session_alive(&self, sess_id: SessId, stamp: u64) -> bool {
        self.sessions
            .get(sess_id as usize)
            .and_then(|s| s.as_deref())
            .is_some_and(|sess| sess.stamp == stamp)
    }

    /// Reserve a session number.
    fn alloc_sess_id(&mut self) -> Result<SessId, Error> {
        if let Some(id) = self.free_sess_ids.pop() {
            return Ok(id);
        }
        if self.sessions.len() > SessId::MAX as usize {
            return Err(Error::NoFreeSession);
        }
        self.sessions.push(None);
        Ok((self.sessions.len() - 1) as SessId)
    }

    fn take_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Allocate a `MsgBuf` with header slots for `len` bytes of data.
    fn alloc_msgbuf(&mut self, len: usize) -> Result<MsgBuf, Error> {
        let max_data = self.tp.max_data_per_pkt();
        let max_pkts = num_pkts(len, max_data);
        let overall = roundup(len, 8) + max_pkts * HDR_SIZE;
        let allocator = self.allocator.clone();
        let buf = allocator.alloc(overall, &mut self.tp)?;
        Ok(MsgBuf::owned(buf, len, max_data))
    }
}

/// Thread-local RPC endpoint.
///
/// An `Rpc` owns one transport instance, its buffer arena, a vector of
/// sessions, and a handler table. It is driven entirely by [`Rpc::progress`]
/// calls from the thread that created it: all slot mutation, handler
/// invocation, and awaitable completion happens inside those calls, and
/// none of them ever blocks.
///
/// This is the main type of this library.
pub struct Rpc {
    /// ID of this RPC instance.
    id: RpcId,
    /// Nexus this RPC is bound to.
    nexus: Pin<Arc<Nexus>>,
    /// Endpoint configuration.
    config: Config,
    /// The only thread allowed to use this endpoint.
    pub(crate) thread_id: ThreadId,
    /// Set on an unrecoverable transport error; terminal.
    failed: Cell<bool>,
    /// Depth of request handlers on the current call stack.
    handler_depth: Cell<usize>,

    /// Session management frame sender.
    /// Uses an independent socket, no need to delegate to the Nexus.
    sm_tx: UdpSocket,
    /// Session management event receiver.
    sm_rx: SmEventRx,

    /// Request handler table, keyed by request type.
    handlers: [Option<ReqHandler>; ReqType::MAX as usize + 1],

    /// Interior-mutable state of this RPC.
    state: RefCell<RpcInterior>,

    /// Pending packet transmissions.
    ///
    /// Placed in a separate `RefCell`, so that code running in RPC handler
    /// contexts can queue packets without borrowing `RpcInterior` again.
    pending_tx: RefCell<Vec<TxItem<ActiveTransport>>>,

    /// Fully-received requests whose handlers have not been invoked yet.
    /// Separate from `RpcInterior` for the same reason as `pending_tx`.
    ready_reqs: RefCell<VecDeque<ReadyReq>>,

    /// Handlers of torn-down sessions, parked until they can be dropped.
    /// A handler future may hold nested request awaitables whose drop code
    /// borrows `RpcInterior`, so they must never be dropped while it is
    /// borrowed; teardown paths move them here instead.
    doomed_handlers: RefCell<Vec<PendingHandler>>,
}

// Public API.
impl Rpc {
    /// Create a new `Rpc` instance bound to a [`Nexus`] with a certain ID.
    /// Will operate on the specified NIC with the given configuration.
    /// The given ID must be unique among all RPCs in the same Nexus.
    ///
    /// # Panics
    ///
    /// - Panic if the given ID is already used.
    /// - Panic if there is no such NIC, or the configuration is inconsistent.
    pub fn new(nexus: &Pin<Arc<Nexus>>, id: RpcId, nic: &str, config: Config) -> Result<Self, Error> {
        assert!(config.session_slots >= 1, "need at least one session slot");
        assert!(
            (0.0..1.0).contains(&config.pkt_loss_prob),
            "packet loss probability out of range"
        );

        // Create the SM event channel first, so that it will immediately
        // panic if the given ID is already used.
        let sm_rx = nexus.register_event_channel(id);

        let mut tp = ActiveTransport::new(nic, config.phy_port, &config)?;
        let allocator = Rc::new(BuddyAllocator::new(config.numa_node));

        // Pre-allocate the control-packet ring.
        let max_data = tp.max_data_per_pkt();
        let mut ctrl_ring = Vec::with_capacity(CTRL_RING_SIZE);
        for _ in 0..CTRL_RING_SIZE {
            let buf = allocator.alloc(HDR_SIZE, &mut tp)?;
            ctrl_ring.push(MsgBuf::owned(buf, 0, max_data));
        }

        Ok(Self {
            id,
            nexus: nexus.clone(),
            config,
            thread_id: thread::current().id(),
            failed: Cell::new(false),
            handler_depth: Cell::new(0),
            sm_tx: UdpSocket::bind("0.0.0.0:0").map_err(|_| Error::FatalTransport)?,
            sm_rx,
            handlers: array::from_fn(|_| None),
            state: RefCell::new(RpcInterior {
                pending_handlers: Vec::new(),
                graveyard: Vec::new(),
                sessions: Vec::new(),
                free_sess_ids: Vec::new(),
                tp,
                allocator,
                ctrl_ring,
                ctrl_next: 0,
                next_stamp: 0,
                stats: RpcStats::default(),
                rng: SmallRng::seed_from_u64(0x5eed ^ id as u64),
            }),
            pending_tx: RefCell::new(Vec::new()),
            ready_reqs: RefCell::new(VecDeque::new()),
            doomed_handlers: RefCell::new(Vec::new()),
        })
    }

    /// Return the ID of this RPC instance.
    #[inline(always)]
    pub fn id(&self) -> RpcId {
        self.id
    }

    /// Return the Nexus this RPC is bound to.
    #[inline(always)]
    pub fn nexus(&self) -> &Nexus {
        &self.nexus
    }

    /// Return a snapshot of the datapath counters.
    #[inline]
    pub fn stats(&self) -> RpcStats {
        self.state.borrow().stats
    }

    /// Set the handler for the given request type.
    /// Handlers must be registered before the event loop first runs.
    pub fn set_handler<H, F>(&mut self, req_type: ReqType, handler: H) -> &mut Self
    where
        H: Fn(RequestHandle) -> F + 'static,
        F: Future<Output = MsgBuf> + 'static,
    {
        self.handlers[req_type as usize] = Some(Box::new(move |req| Box::pin(handler(req))));
        self
    }

    /// Allocate a `MsgBuf` that can accommodate at least `len` bytes of
    /// application data.
    ///
    /// The allocated `MsgBuf` will have an initial length of `len`, but the
    /// contents are uninitialized. Asking for zero bytes yields a buffer of
    /// the smallest size class. The buffer returns to the arena when dropped.
    #[inline]
    pub fn alloc_msgbuf(&self, len: usize) -> Result<MsgBuf, Error> {
        do_thread_check(self);
        self.state.borrow_mut().alloc_msgbuf(len)
    }

    /// Reserve a session number for a connection to the remote `Rpc`
    /// identified by `(remote_uri, remote_rpc_id)`.
    ///
    /// The session is created disconnected; drive the returned handle's
    /// [`connect`](SessionHandle::connect) awaitable to establish it.
    ///
    /// # Panics
    ///
    /// Panic if the given URI cannot be resolved.
    pub fn create_session(
        &self,
        remote_uri: impl ToSocketAddrs,
        remote_rpc_id: RpcId,
    ) -> Result<SessionHandle<'_>, Error> {
        do_thread_check(self);
        if unlikely(self.failed.get()) {
            return Err(Error::FatalTransport);
        }

        let remote_uri = remote_uri
            .to_socket_addrs()
            .expect("failed to resolve remote URI")
            .next()
            .expect("failed to resolve remote URI");

        let mut state = self.state.borrow_mut();
        let sess_id = state.alloc_sess_id()?;
        let stamp = state.take_stamp();
        let sess = Session::new(
            SessionRole::Client,
            stamp,
            remote_uri,
            remote_rpc_id,
            self.config.session_slots,
        );
        state.sessions[sess_id as usize] = Some(Box::new(sess));
        Ok(SessionHandle::new(self, sess_id, stamp, remote_uri))
    }

    /// Return a handle to an existing session.
    pub fn get_session(&self, sess_id: SessId) -> Option<SessionHandle<'_>> {
        let state = self.state.borrow();
        let sess = state.sessions.get(sess_id as usize)?.as_deref()?;
        Some(SessionHandle::new(
            self,
            sess_id,
            sess.stamp,
            sess.remote_uri,
        ))
    }

    /// Run an iteration of the event loop to make progress.
    /// Performs a bounded amount of work of each kind:
    /// - draining session management events from the Nexus,
    /// - polling parked request handlers,
    /// - receiving and dispatching datapath packets,
    /// - retransmitting requests whose deadline expired,
    /// - transmitting queued packets.
    pub fn progress(&self) {
        do_thread_check(self);

        // Drop handlers of torn-down sessions. Safe here: no state borrow is
        // held, and a future that is currently being polled is never doomed.
        let doomed = mem::take(&mut *self.doomed_handlers.borrow_mut());
        drop(doomed);

        // Sessions torn down from handler context are parked in the
        // graveyard; reclaim them only when no handler is on the stack.
        if self.handler_depth.get() == 0 {
            if let Ok(mut state) = self.state.try_borrow_mut() {
                state.graveyard.clear();
            }
        }

        if unlikely(!self.sm_rx.is_empty()) {
            self.process_sm_events();
        }

        // Ordering:
        // - Parked handlers are polled before Rx, or requests arriving in
        //   this pass would be polled twice, the second time being largely
        //   meaningless.
        // - Tx runs last because every other step may queue packets.
        self.poll_pending_handlers();
        self.process_rx();
        self.process_ready_handlers();
        self.process_timeouts();
        self.process_tx();
    }

    /// Run event-loop iterations for (at least) the given duration.
    pub fn progress_for(&self, duration: Duration) {
        let start = Instant::now();
        loop {
            self.progress();
            if start.elapsed() >= duration {
                break;
            }
        }
    }
}

// Crate-internal API used by session handles and request awaitables.
impl Rpc {
    /// Enqueue a request on a session. See [`SessionHandle::request`].
    pub(crate) fn enqueue_request<'a>(
        &'a self,
        sess_id: SessId,
        stamp: u64,
        req_type: ReqType,
        req: &'a MsgBuf,
        resp: &'a mut MsgBuf,
    ) -> Result<Request<'a>, Error> {
        do_thread_check(self);
        if unlikely(self.failed.get()) {
            return Err(Error::FatalTransport);
        }

        let mut state = self.state.borrow_mut();
        let state: &mut RpcInterior = &mut state;
        let max_data = state.tp.max_data_per_pkt();

        let Some(sess) = state.session_mut(sess_id, stamp) else {
            return Err(Error::SessionNotConnected(sess_id));
        };
        if unlikely(!sess.is_client() || !sess.is_connected()) {
            return Err(Error::SessionNotConnected(sess_id));
        }

        let Some(sslot_idx) = sess.free_slots.pop() else {
            return Err(Error::NoCredits(sess_id));
        };

        let req_pkts = num_pkts(req.len(), max_data);
        assert!(req_pkts <= PktIdx::MAX as usize, "request too large");
        let tail_len = (req.len() - (req_pkts - 1) * max_data) as u16;

        let window = sess.slots.len();
        let peer_sess_id = sess.peer_sess_id;
        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;

        let sslot = &mut sess.slots[sslot_idx];
        let req_idx = sslot.begin_client_request(
            window,
            req_type,
            req,
            resp,
            req_pkts,
            Instant::now(),
            RTX_TIMEOUT,
        );

        // Write the per-packet headers into the request buffer.
        for i in 0..req_pkts {
            let pkt_type = match (req_pkts, i) {
                (1, _) => PktType::SmallReq,
                (_, 0) => PktType::LargeReqFirst,
                _ => PktType::LargeReqCont,
            };
            // SAFETY: header slots belong to the endpoint while the request
            // is in flight; they never overlap user-visible payload.
            unsafe {
                ptr::write(
                    req.pkt_hdr(i),
                    PacketHeader::new(
                        req_type,
                        peer_sess_id,
                        req_idx,
                        pkt_type,
                        req_pkts as PktIdx,
                        i as PktIdx,
                        tail_len,
                    ),
                );
            }
        }

        // Queue the initial burst; continuations beyond the window are
        // clocked out by explicit credit returns.
        let burst = req_pkts.min(window);
        let mut pending_tx = self.pending_tx.borrow_mut();
        for i in 0..burst {
            pending_tx.push(TxItem {
                sess_id,
                peer,
                msgbuf: req,
                pkt_idx: i,
            });
        }
        sess.slots[sslot_idx].req_sent = burst;

        Ok(Request::new(self, sess_id, stamp, sslot_idx, req_idx))
    }

    /// Check whether a request has completed; frees its slot on observation.
    pub(crate) fn request_outcome(
        &self,
        sess_id: SessId,
        stamp: u64,
        sslot_idx: usize,
        req_idx: ReqIdx,
    ) -> Option<Result<(), Error>> {
        let mut state = self.state.borrow_mut();
        let Some(sess) = state.session_mut(sess_id, stamp) else {
            // The session was torn down under the request.
            return Some(Err(Error::SessionReset));
        };

        let sslot = &mut sess.slots[sslot_idx];
        if sslot.req_idx != req_idx {
            return Some(Err(Error::SessionReset));
        }
        match sslot.state {
            SlotState::CliDone => {
                let result = sslot.result;
                sslot.release();
                sess.free_slots.push(sslot_idx);
                Some(result)
            }
            _ => None,
        }
    }

    /// Abandon an in-flight request whose awaitable was dropped. The slot is
    /// released immediately; a late response is discarded by its stale
    /// request number.
    pub(crate) fn abandon_request(
        &self,
        sess_id: SessId,
        stamp: u64,
        sslot_idx: usize,
        req_idx: ReqIdx,
    ) {
        let mut state = self.state.borrow_mut();
        let Some(sess) = state.session_mut(sess_id, stamp) else {
            return;
        };
        let sslot = &mut sess.slots[sslot_idx];
        if sslot.req_idx != req_idx || sslot.state == SlotState::Free {
            return;
        }

        // Purge queued packets that reference the user's buffers.
        let req = sslot.req;
        let resp = sslot.resp as *const MsgBuf;
        self.pending_tx
            .borrow_mut()
            .retain(|item| item.msgbuf != req && item.msgbuf != resp);

        sslot.release();
        sess.free_slots.push(sslot_idx);
    }

    /// Return whether the session is in the connected state.
    pub(crate) fn session_is_connected(&self, sess_id: SessId, stamp: u64) -> bool {
        let mut state = self.state.borrow_mut();
        state
            .session_mut(sess_id, stamp)
            .is_some_and(|sess| sess.is_connected())
    }

    /// Transition a session into `ConnectInProgress`.
    pub(crate) fn mark_session_connecting(&self, sess_id: SessId, stamp: u64) {
        let mut state = self.state.borrow_mut();
        if let Some(sess) = state.session_mut(sess_id, stamp) {
            if sess.state == SessionState::Disconnected {
                sess.state = SessionState::ConnectInProgress;
                sess.refused = false;
            }
        }
    }

    /// Build the encoded ConnectReq frame for a session.
    /// Returns an empty frame if the session is already gone.
    pub(crate) fn connect_frame(&self, sess_id: SessId) -> Vec<u8> {
        let state = self.state.borrow();
        let ep_blob =
            rmps::to_vec(&state.tp.endpoint()).expect("failed to serialize local endpoint");
        let Some(sess) = state.sessions.get(sess_id as usize).and_then(|s| s.as_deref()) else {
            return Vec::new();
        };
        SmFrame {
            kind: SmPktKind::ConnectReq,
            src_uri: self.nexus.uri().to_string(),
            src_rpc_id: self.id,
            src_sess_id: sess_id,
            dst_rpc_id: sess.peer_rpc_id,
            dst_sess_id: 0,
            ep_blob,
        }
        .encode()
    }

    /// Check whether a connection attempt has concluded.
    pub(crate) fn session_connect_outcome(
        &self,
        sess_id: SessId,
        stamp: u64,
    ) -> Option<Result<(), Error>> {
        if unlikely(self.failed.get()) {
            return Some(Err(Error::FatalTransport));
        }
        let mut state = self.state.borrow_mut();
        let Some(sess) = state.session_mut(sess_id, stamp) else {
            return Some(Err(Error::SessionReset));
        };
        match sess.state {
            SessionState::Connected => Some(Ok(())),
            SessionState::Disconnected if sess.refused => Some(Err(Error::ConnectRefused)),
            _ => None,
        }
    }

    /// Begin tearing down a session. Cancels outstanding requests and
    /// returns the encoded DisconnectReq frame, or `None` if there is no
    /// connected peer to notify.
    pub(crate) fn begin_disconnect(&self, sess_id: SessId, stamp: u64) -> Option<Vec<u8>> {
        do_thread_check(self);
        let mut state = self.state.borrow_mut();
        let Some(sess) = state.session_mut(sess_id, stamp) else {
            return None;
        };
        if !sess.is_client() || sess.state != SessionState::Connected {
            return None;
        }

        sess.state = SessionState::DisconnectInProgress;
        let mut cancelled = 0;
        for sslot in &mut sess.slots {
            if sslot.state == SlotState::CliPending {
                sslot.complete_client(Err(Error::SessionReset));
                cancelled += 1;
            }
        }
        let peer_rpc_id = sess.peer_rpc_id;
        let peer_sess_id = sess.peer_sess_id;
        if cancelled > 0 {
            state.stats.sessions_reset += 1;
        }

        self.pending_tx
            .borrow_mut()
            .retain(|item| item.sess_id != sess_id);

        Some(
            SmFrame {
                kind: SmPktKind::DisconnectReq,
                src_uri: self.nexus.uri().to_string(),
                src_rpc_id: self.id,
                src_sess_id: sess_id,
                dst_rpc_id: peer_rpc_id,
                dst_sess_id: peer_sess_id,
                ep_blob: Vec::new(),
            }
            .encode(),
        )
    }

    /// Check whether a disconnect has been acknowledged.
    pub(crate) fn session_disconnect_done(&self, sess_id: SessId, stamp: u64) -> bool {
        let mut state = self.state.borrow_mut();
        match state.session_mut(sess_id, stamp) {
            Some(sess) => sess.state == SessionState::Disconnected,
            None => true,
        }
    }

    /// Tear a session down locally and return its number to the free pool.
    pub(crate) fn release_session(&self, sess_id: SessId, stamp: u64) {
        let mut state = self.state.borrow_mut();
        if state.session_alive(sess_id, stamp) {
            self.remove_session(&mut state, sess_id);
        }
    }

    /// Send a raw session-management frame.
    pub(crate) fn sm_send_raw(&self, msg: &[u8], dst: SocketAddr) {
        self.sm_tx
            .send_to(msg, dst)
            .expect("failed to send session management frame");
    }
}

// Internal session-management routines.
impl Rpc {
    fn send_sm(
        &self,
        kind: SmPktKind,
        dst_uri: SocketAddr,
        src_sess_id: SessId,
        dst_rpc_id: RpcId,
        dst_sess_id: SessId,
        ep_blob: Vec<u8>,
    ) {
        let frame = SmFrame {
            kind,
            src_uri: self.nexus.uri().to_string(),
            src_rpc_id: self.id,
            src_sess_id,
            dst_rpc_id,
            dst_sess_id,
            ep_blob,
        };
        self.sm_send_raw(&frame.encode(), dst_uri);
    }

    fn send_connect_ack(
        &self,
        state: &RpcInterior,
        dst_uri: SocketAddr,
        dst_rpc_id: RpcId,
        cli_sess_id: SessId,
        svr_sess_id: SessId,
    ) {
        let ep_blob =
            rmps::to_vec(&state.tp.endpoint()).expect("failed to serialize local endpoint");
        self.send_sm(
            SmPktKind::ConnectResp,
            dst_uri,
            svr_sess_id,
            dst_rpc_id,
            cli_sess_id,
            ep_blob,
        );
    }

    /// Refusals are ConnectResp frames with an empty endpoint blob.
    fn send_connect_refuse(&self, dst_uri: SocketAddr, dst_rpc_id: RpcId, cli_sess_id: SessId) {
        self.send_sm(
            SmPktKind::ConnectResp,
            dst_uri,
            0,
            dst_rpc_id,
            cli_sess_id,
            Vec::new(),
        );
    }

    fn handle_connect_request(
        &self,
        state: &mut RpcInterior,
        src_uri: SocketAddr,
        src_rpc_id: RpcId,
        cli_sess_id: SessId,
        ep_blob: Vec<u8>,
    ) {
        // The client retries ConnectReq on an interval; if the session
        // already exists, the earlier acknowledgement was lost. Resend it.
        let existing = state.sessions.iter().position(|s| {
            s.as_deref().is_some_and(|s| {
                s.role == SessionRole::Server
                    && s.remote_uri == src_uri
                    && s.peer_rpc_id == src_rpc_id
                    && s.peer_sess_id == cli_sess_id
            })
        });
        if let Some(svr_sess_id) = existing {
            self.send_connect_ack(state, src_uri, src_rpc_id, cli_sess_id, svr_sess_id as SessId);
            return;
        }

        // Endpoint deserialization error means some severe control-plane
        // network error or a bug in the peer. Although we can ignore, the log
        // level should be raised to `error` to draw attention.
        let Ok(ep) = rmps::from_slice::<TpEndpoint>(&ep_blob) else {
            log::error!(
                "RPC {}: ignoring ConnectRequest for client session {} with invalid endpoint info",
                self.id,
                cli_sess_id
            );
            return;
        };

        let Ok(svr_sess_id) = state.alloc_sess_id() else {
            log::warn!(
                "RPC {}: session number space exhausted, refusing connect",
                self.id
            );
            self.send_connect_refuse(src_uri, src_rpc_id, cli_sess_id);
            return;
        };

        let max_data = state.tp.max_data_per_pkt();
        let stamp = state.take_stamp();
        let mut sess = Session::new(
            SessionRole::Server,
            stamp,
            src_uri,
            src_rpc_id,
            self.config.session_slots,
        );
        sess.peer_sess_id = cli_sess_id;
        sess.peer = Some(state.tp.create_peer(ep));

        // Pre-allocate per-slot request and response buffers.
        let mut alloc_ok = true;
        for sslot in &mut sess.slots {
            match (state.alloc_msgbuf(max_data), state.alloc_msgbuf(max_data)) {
                (Ok(pre_req), Ok(pre_resp)) => {
                    sslot.pre_req = Some(pre_req);
                    sslot.pre_resp = Some(pre_resp);
                }
                _ => {
                    alloc_ok = false;
                    break;
                }
            }
        }
        if !alloc_ok {
            log::warn!(
                "RPC {}: out of memory for session buffers, refusing connect",
                self.id
            );
            state.free_sess_ids.push(svr_sess_id);
            self.send_connect_refuse(src_uri, src_rpc_id, cli_sess_id);
            return;
        }

        sess.state = SessionState::Connected;
        state.sessions[svr_sess_id as usize] = Some(Box::new(sess));
        self.send_connect_ack(state, src_uri, src_rpc_id, cli_sess_id, svr_sess_id);
    }

    /// Process received session management events.
    fn process_sm_events(&self) {
        // Abort if progressing recursively.
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior = &mut state;

        while let Some(event) = self.sm_rx.recv() {
            log::trace!("RPC {}: received SM event {:#?}", self.id, event);
            debug_assert_eq!(event.dst_rpc_id, self.id, "bad SM event dispatch");

            match event.details {
                SmEventDetails::ConnectRequest {
                    cli_sess_id,
                    ep_blob,
                } => {
                    self.handle_connect_request(
                        state,
                        event.src_uri,
                        event.src_rpc_id,
                        cli_sess_id,
                        ep_blob,
                    );
                }
                SmEventDetails::ConnectAcknowledge {
                    cli_sess_id,
                    svr_sess_id,
                    ep_blob,
                } => {
                    let Some(sess) = state
                        .sessions
                        .get_mut(cli_sess_id as usize)
                        .and_then(|s| s.as_deref_mut())
                    else {
                        log::warn!(
                            "RPC {}: ignoring ConnectAcknowledge for non-existent session {}",
                            self.id,
                            cli_sess_id
                        );
                        continue;
                    };
                    if !sess.is_client() || sess.state != SessionState::ConnectInProgress {
                        log::warn!(
                            "RPC {}: ignoring ConnectAcknowledge for session {} not connecting",
                            self.id,
                            cli_sess_id
                        );
                        continue;
                    }

                    let Ok(ep) = rmps::from_slice::<TpEndpoint>(&ep_blob) else {
                        log::error!(
                            "RPC {}: ignoring ConnectAcknowledge for session {} with invalid endpoint info",
                            self.id,
                            cli_sess_id
                        );
                        continue;
                    };

                    sess.peer_sess_id = svr_sess_id;
                    sess.peer = Some(state.tp.create_peer(ep));
                    sess.state = SessionState::Connected;
                }
                SmEventDetails::ConnectRefuse { cli_sess_id } => {
                    let Some(sess) = state
                        .sessions
                        .get_mut(cli_sess_id as usize)
                        .and_then(|s| s.as_deref_mut())
                    else {
                        log::warn!(
                            "RPC {}: ignoring ConnectRefuse for non-existent session {}",
                            self.id,
                            cli_sess_id
                        );
                        continue;
                    };
                    if sess.state != SessionState::ConnectInProgress {
                        continue;
                    }

                    log::warn!(
                        "RPC {}: session {} refused by remote peer",
                        self.id,
                        cli_sess_id
                    );
                    sess.state = SessionState::Disconnected;
                    sess.refused = true;
                }
                SmEventDetails::DisconnectRequest {
                    cli_sess_id,
                    svr_sess_id,
                } => {
                    let matches = state
                        .sessions
                        .get(svr_sess_id as usize)
                        .and_then(|s| s.as_deref())
                        .is_some_and(|sess| {
                            sess.role == SessionRole::Server
                                && sess.peer_rpc_id == event.src_rpc_id
                                && sess.peer_sess_id == cli_sess_id
                        });
                    if matches {
                        self.remove_session(state, svr_sess_id);
                    }

                    // Acknowledge unconditionally: teardown is idempotent and
                    // the earlier acknowledgement may have been lost.
                    self.send_sm(
                        SmPktKind::DisconnectResp,
                        event.src_uri,
                        svr_sess_id,
                        event.src_rpc_id,
                        cli_sess_id,
                        Vec::new(),
                    );
                }
                SmEventDetails::DisconnectAcknowledge { cli_sess_id } => {
                    let Some(sess) = state
                        .sessions
                        .get_mut(cli_sess_id as usize)
                        .and_then(|s| s.as_deref_mut())
                    else {
                        continue;
                    };
                    if sess.state == SessionState::DisconnectInProgress {
                        sess.state = SessionState::Disconnected;
                    }
                }
            }
        }
    }

    /// Tear down a session: fail its outstanding requests, drop its parked
    /// handlers and queued packets, and recycle its number. The storage goes
    /// to the graveyard in case a handler on the current stack still
    /// references it.
    fn remove_session(&self, state: &mut RpcInterior, sess_id: SessId) {
        let Some(mut sess) = state.sessions[sess_id as usize].take() else {
            return;
        };
        sess.state = SessionState::ResetInProgress;

        let mut had_outstanding = false;
        for sslot in &mut sess.slots {
            match sslot.state {
                SlotState::CliPending => {
                    had_outstanding = true;
                    sslot.complete_client(Err(Error::SessionReset));
                }
                SlotState::SrvRx | SlotState::SrvPending | SlotState::SrvResponded => {
                    had_outstanding = true;
                }
                _ => {}
            }
        }
        if had_outstanding {
            state.stats.sessions_reset += 1;
        }

        let stamp = sess.stamp;
        // Park the session's handlers for a later drop: dropping them here
        // would re-borrow endpoint state from inside this borrow.
        let (doomed, kept): (Vec<_>, Vec<_>) = mem::take(&mut state.pending_handlers)
            .into_iter()
            .partition(|ph| ph.sess_id == sess_id && ph.stamp == stamp);
        state.pending_handlers = kept;
        self.doomed_handlers.borrow_mut().extend(doomed);
        self.pending_tx
            .borrow_mut()
            .retain(|item| item.sess_id != sess_id);
        self.ready_reqs
            .borrow_mut()
            .retain(|r| !(r.sess_id == sess_id && r.stamp == stamp));

        sess.state = SessionState::Disconnected;
        state.graveyard.push(sess);
        state.free_sess_ids.push(sess_id);
    }

    /// Enter the terminal failed state: every session is reset and all
    /// future operations fail with `FatalTransport`.
    fn fail(&self, state: &mut RpcInterior) {
        if self.failed.replace(true) {
            return;
        }
        log::error!(
            "RPC {}: unrecoverable transport error, resetting all sessions",
            self.id
        );
        for sess_id in 0..state.sessions.len() {
            self.remove_session(state, sess_id as SessId);
        }
    }
}

// Internal progress routines.
impl Rpc {
    /// Write a header into the next control-ring buffer and queue it.
    fn push_ctrl(
        pending_tx: &RefCell<Vec<TxItem<ActiveTransport>>>,
        ctrl_ring: &[MsgBuf],
        ctrl_next: &mut usize,
        sess_id: SessId,
        peer: *const TpPeer,
        hdr: PacketHeader,
    ) {
        let msgbuf = &ctrl_ring[*ctrl_next];
        *ctrl_next = (*ctrl_next + 1) % CTRL_RING_SIZE;

        // SAFETY: control buffers are header-only and owned by the endpoint.
        unsafe { ptr::write(msgbuf.pkt_hdr(0), hdr) };
        pending_tx.borrow_mut().push(TxItem {
            sess_id,
            peer,
            msgbuf,
            pkt_idx: 0,
        });
    }

    /// Process an incoming request data packet (server side).
    fn process_request_pkt(
        &self,
        state: &mut RpcInterior,
        hdr: &PacketHeader,
        data: *const u8,
        data_len: usize,
    ) {
        let RpcInterior {
            sessions,
            tp,
            allocator,
            ctrl_ring,
            ctrl_next,
            stats,
            ..
        } = state;
        let max_data = tp.max_data_per_pkt();
        let sess_id = hdr.dst_sess_id();

        let Some(sess) = sessions
            .get_mut(sess_id as usize)
            .and_then(|s| s.as_deref_mut())
        else {
            log::warn!(
                "RPC {}: dropping request packet for non-existent session {}",
                self.id,
                sess_id
            );
            return;
        };
        if unlikely(sess.is_client() || !sess.is_connected()) {
            log::warn!(
                "RPC {}: dropping request packet for non-serving session {}",
                self.id,
                sess_id
            );
            return;
        }

        let window = sess.slots.len();
        let sslot_idx = (hdr.req_idx() % window as ReqIdx) as usize;
        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
        let stamp = sess.stamp;
        let peer_sess_id = sess.peer_sess_id;
        let sslot = &mut sess.slots[sslot_idx];

        if unlikely(hdr.req_idx() < sslot.req_idx) {
            log::trace!("RPC {}: dropping stale request packet", self.id);
            return;
        }

        if hdr.req_idx() > sslot.req_idx {
            if unlikely(sslot.state == SlotState::SrvPending) {
                // The previous request on this slot is still in its handler;
                // admitting the new one would pull the buffers out from under
                // it. The client keeps retransmitting, so just wait.
                log::trace!("RPC {}: deferring new request, handler busy", self.id);
                return;
            }
            sslot.begin_server_rx(hdr.req_idx(), hdr.req_type(), hdr.total_pkts() as usize);
        }

        match sslot.state {
            SlotState::SrvRx => {
                let total = sslot.srv_req_pkts;
                let this_pkt = hdr.this_pkt() as usize;
                assert!(this_pkt < total, "packet index out of range");
                assert_eq!(
                    data_len,
                    hdr.pkt_data_len(hdr.this_pkt(), max_data),
                    "payload length mismatch"
                );

                // Make sure there is a reassembly target.
                if sslot.srv_req.is_none() {
                    let msg_len = hdr.msg_len(max_data);
                    if total == 1 {
                        // Single-packet request: copy into the slot buffer so
                        // the receive ring can be replenished immediately.
                        let mut view = sslot.pre_req.as_ref().unwrap().clone_borrowed();
                        view.set_len(msg_len);
                        sslot.srv_req = Some(view);
                    } else {
                        let overall = roundup(msg_len, 8) + total * HDR_SIZE;
                        match allocator.alloc(overall, tp) {
                            Ok(buf) => {
                                sslot.srv_req = Some(MsgBuf::owned(buf, msg_len, max_data));
                            }
                            Err(_) => {
                                // No reassembly buffer: drop the packet and
                                // withhold the credit. The sender stalls and
                                // retransmits until memory frees up.
                                log::warn!(
                                    "RPC {}: no memory for reassembly, withholding credit",
                                    self.id
                                );
                                return;
                            }
                        }
                    }
                }

                let target = sslot.srv_req.as_ref().unwrap();
                if !sslot.srv_rx[this_pkt] {
                    sslot.srv_rx.set(this_pkt, true);
                    // SAFETY: `this_pkt` is in range; the target holds the
                    // whole message.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            data,
                            target.as_ptr().add(this_pkt * max_data),
                            data_len,
                        )
                    };
                    sslot.srv_rcvd += 1;
                    while sslot.srv_contig < total && sslot.srv_rx[sslot.srv_contig] {
                        sslot.srv_contig += 1;
                    }
                }

                if sslot.srv_rcvd == total {
                    sslot.state = SlotState::SrvPending;
                    self.ready_reqs.borrow_mut().push_back(ReadyReq {
                        sess_id,
                        stamp,
                        sslot_idx,
                    });
                } else if hdr.pkt_type() != PktType::SmallReq {
                    // Return a cumulative credit so the sender can advance
                    // its packet window. Re-credit duplicates too: the
                    // original credit may have been lost.
                    let cr = PacketHeader::new(
                        sslot.req_type,
                        peer_sess_id,
                        sslot.req_idx,
                        PktType::ExplCR,
                        0,
                        sslot.srv_contig as PktIdx,
                        0,
                    );
                    Self::push_ctrl(&self.pending_tx, ctrl_ring, ctrl_next, sess_id, peer, cr);
                    stats.credit_returns += 1;
                }
            }
            // Duplicate while the handler is still running: nothing to do.
            SlotState::SrvPending => {}
            SlotState::SrvResponded => {
                // Duplicate of a completed request: replay the first response
                // packet. The client pulls any continuations itself.
                self.pending_tx.borrow_mut().push(TxItem {
                    sess_id,
                    peer,
                    msgbuf: sslot.resp_stored.as_ref().unwrap(),
                    pkt_idx: 0,
                });
            }
            other => unreachable!("client slot state {:?} on server session", other),
        }
    }

    /// Process an incoming response data packet (client side).
    fn process_response_pkt(
        &self,
        state: &mut RpcInterior,
        hdr: &PacketHeader,
        data: *const u8,
        data_len: usize,
    ) {
        let RpcInterior {
            sessions,
            tp,
            ctrl_ring,
            ctrl_next,
            stats,
            ..
        } = state;
        let max_data = tp.max_data_per_pkt();
        let sess_id = hdr.dst_sess_id();

        let Some(sess) = sessions
            .get_mut(sess_id as usize)
            .and_then(|s| s.as_deref_mut())
        else {
            log::warn!(
                "RPC {}: dropping response packet for non-existent session {}",
                self.id,
                sess_id
            );
            return;
        };
        if unlikely(!sess.is_client() || !sess.is_connected()) {
            log::trace!("RPC {}: dropping response packet on session {}", self.id, sess_id);
            return;
        }

        let window = sess.slots.len();
        let sslot_idx = (hdr.req_idx() % window as ReqIdx) as usize;
        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
        let peer_sess_id = sess.peer_sess_id;
        let sslot = &mut sess.slots[sslot_idx];

        if sslot.state != SlotState::CliPending || hdr.req_idx() != sslot.req_idx {
            log::trace!("RPC {}: dropping stale response packet", self.id);
            return;
        }

        let this_pkt = hdr.this_pkt() as usize;
        let total = hdr.total_pkts() as usize;
        assert!(this_pkt < total, "packet index out of range");
        assert_eq!(
            data_len,
            hdr.pkt_data_len(hdr.this_pkt(), max_data),
            "payload length mismatch"
        );

        // SAFETY: the response buffer stays borrowed while the slot is pending.
        let resp = unsafe { &mut *sslot.resp };

        if sslot.resp_pkts == 0 {
            let msg_len = hdr.msg_len(max_data);
            assert!(
                resp.capacity() >= msg_len,
                "response buffer too small: {} < {}",
                resp.capacity(),
                msg_len
            );
            sslot.resp_pkts = total;
            sslot.resp_rx.clear();
            sslot.resp_rx.resize(total, false);
            sslot.resp_rcvd = 0;
            sslot.rfr_next = 1;
        }
        debug_assert_eq!(total, sslot.resp_pkts);

        if !sslot.resp_rx[this_pkt] {
            sslot.resp_rx.set(this_pkt, true);
            // SAFETY: capacity checked above; the response is reassembled in
            // place in the user's buffer.
            unsafe {
                ptr::copy_nonoverlapping(data, resp.as_ptr().add(this_pkt * max_data), data_len)
            };
            sslot.resp_rcvd += 1;
        }

        if sslot.resp_rcvd == sslot.resp_pkts {
            resp.set_len(hdr.msg_len(max_data));
            sslot.complete_client(Ok(()));
        } else {
            // Pull further continuations, keeping a bounded number of pulls
            // outstanding.
            while sslot.rfr_next < sslot.resp_pkts && sslot.rfr_next - sslot.resp_rcvd < window {
                let rfr = PacketHeader::new(
                    sslot.req_type,
                    peer_sess_id,
                    sslot.req_idx,
                    PktType::Rfr,
                    0,
                    sslot.rfr_next as PktIdx,
                    0,
                );
                Self::push_ctrl(&self.pending_tx, ctrl_ring, ctrl_next, sess_id, peer, rfr);
                sslot.rfr_next += 1;
                stats.resp_pulls += 1;
            }
            sslot.rtx_deadline = Instant::now() + RTX_TIMEOUT;
        }
    }

    /// Process an explicit credit return (client side).
    fn process_credit_return(&self, state: &mut RpcInterior, hdr: &PacketHeader) {
        let sess_id = hdr.dst_sess_id();
        let Some(sess) = state
            .sessions
            .get_mut(sess_id as usize)
            .and_then(|s| s.as_deref_mut())
        else {
            return;
        };
        if !sess.is_client() || !sess.is_connected() {
            return;
        }

        let window = sess.slots.len();
        let sslot_idx = (hdr.req_idx() % window as ReqIdx) as usize;
        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
        let sslot = &mut sess.slots[sslot_idx];

        if sslot.state != SlotState::CliPending || hdr.req_idx() != sslot.req_idx {
            return;
        }

        let acked = hdr.this_pkt() as usize;
        if acked > sslot.req_acked {
            sslot.req_acked = acked;
        }

        // Slide the send window.
        let mut pending_tx = self.pending_tx.borrow_mut();
        while sslot.req_sent < sslot.req_pkts && sslot.req_sent < sslot.req_acked + window {
            pending_tx.push(TxItem {
                sess_id,
                peer,
                msgbuf: sslot.req,
                pkt_idx: sslot.req_sent,
            });
            sslot.req_sent += 1;
        }
        sslot.rtx_deadline = Instant::now() + RTX_TIMEOUT;
    }

    /// Process a request-for-response pull (server side).
    fn process_resp_pull(&self, state: &mut RpcInterior, hdr: &PacketHeader) {
        let max_data = state.tp.max_data_per_pkt();
        let sess_id = hdr.dst_sess_id();
        let Some(sess) = state
            .sessions
            .get_mut(sess_id as usize)
            .and_then(|s| s.as_deref_mut())
        else {
            return;
        };
        if sess.is_client() || !sess.is_connected() {
            return;
        }

        let window = sess.slots.len();
        let sslot_idx = (hdr.req_idx() % window as ReqIdx) as usize;
        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
        let sslot = &mut sess.slots[sslot_idx];

        if hdr.req_idx() != sslot.req_idx || sslot.state != SlotState::SrvResponded {
            // The response is not ready (or long gone); the client re-pulls.
            log::trace!("RPC {}: ignoring premature response pull", self.id);
            return;
        }

        let resp = sslot.resp_stored.as_ref().unwrap();
        let pkt_idx = hdr.this_pkt() as usize;
        assert!(
            pkt_idx < num_pkts(resp.len(), max_data),
            "response pull index out of range"
        );

        self.pending_tx.borrow_mut().push(TxItem {
            sess_id,
            peer,
            msgbuf: resp,
            pkt_idx,
        });
    }

    /// Process received datapath packets.
    fn process_rx(&self) {
        // Abort if progressing recursively.
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior = &mut state;

        let n = match state.tp.rx_burst() {
            Ok(n) => n,
            Err(_) => {
                self.fail(state);
                return;
            }
        };

        for _ in 0..n {
            let item = state.tp.rx_next().expect("failed to fetch received packet");
            state.stats.rx_pkts += 1;

            // SAFETY: guaranteed not null and aligned; copy the header out so
            // the ring slot can be handled uniformly below.
            let hdr = unsafe { *item.pkt_hdr(0) };
            assert_eq!(
                hdr.flags(),
                PKT_FLAGS_MAGIC,
                "malformed data-plane packet header"
            );

            match hdr.pkt_type() {
                PktType::SmallReq | PktType::LargeReqFirst | PktType::LargeReqCont => {
                    self.process_request_pkt(state, &hdr, item.as_ptr(), item.len());
                }
                PktType::SmallResp | PktType::LargeRespFirst | PktType::LargeRespCont => {
                    self.process_response_pkt(state, &hdr, item.as_ptr(), item.len());
                }
                PktType::ExplCR => {
                    debug_assert_eq!(item.len(), 0);
                    self.process_credit_return(state, &hdr);
                }
                PktType::Rfr => {
                    debug_assert_eq!(item.len(), 0);
                    self.process_resp_pull(state, &hdr);
                }
            }

            // Payloads are consumed synchronously above, so the ring slot can
            // be replenished right away.
            // SAFETY: `item` came from `rx_next` and is released only once.
            unsafe { state.tp.rx_release(item) };
        }
    }

    /// Invoke handlers for requests that completed reassembly this pass.
    fn process_ready_handlers(&self) {
        loop {
            let Some(ready) = self.ready_reqs.borrow_mut().pop_front() else {
                break;
            };

            let (sslot_ptr, req_type) = {
                let mut state = self.state.borrow_mut();
                let Some(sess) = state.session_mut(ready.sess_id, ready.stamp) else {
                    continue;
                };
                let sslot = &mut sess.slots[ready.sslot_idx];
                debug_assert_eq!(sslot.state, SlotState::SrvPending);
                (sslot as *mut SSlot, sslot.req_type)
            };

            let Some(handler) = self.handlers[req_type as usize].as_ref() else {
                log::warn!(
                    "RPC {}: received request for unknown request type {}",
                    self.id,
                    req_type
                );
                continue;
            };

            // Invoke the handler and immediately poll the returned future.
            // Synchronous handlers complete here; asynchronous handlers are
            // pushed to their first yield point and parked.
            let mut handler_fut = handler(RequestHandle::new(self, sslot_ptr));
            let mut cx = Context::from_waker(noop_waker_ref());

            self.handler_depth.set(self.handler_depth.get() + 1);
            let polled = handler_fut.poll_unpin(&mut cx);
            self.handler_depth.set(self.handler_depth.get() - 1);

            match polled {
                Poll::Ready(resp) => {
                    let mut state = self.state.borrow_mut();
                    self.finish_response(&mut state, ready.sess_id, ready.stamp, ready.sslot_idx, resp);
                }
                Poll::Pending => self.state.borrow_mut().pending_handlers.push(PendingHandler {
                    sess_id: ready.sess_id,
                    stamp: ready.stamp,
                    sslot_idx: ready.sslot_idx,
                    handler: handler_fut,
                }),
            }
        }
    }

    /// Poll parked request handlers.
    fn poll_pending_handlers(&self) {
        let mut pending = {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            if likely(state.pending_handlers.is_empty()) {
                return;
            }
            mem::take(&mut state.pending_handlers)
        };

        let mut cx = Context::from_waker(noop_waker_ref());
        let mut still_pending = Vec::with_capacity(pending.len());
        for mut ph in pending.drain(..) {
            // The session may have been torn down since the handler parked;
            // dropping the future is then the whole cleanup.
            let alive = self
                .state
                .borrow()
                .session_alive(ph.sess_id, ph.stamp);
            if !alive {
                continue;
            }

            self.handler_depth.set(self.handler_depth.get() + 1);
            let polled = ph.handler.poll_unpin(&mut cx);
            self.handler_depth.set(self.handler_depth.get() - 1);

            match polled {
                Poll::Ready(resp) => {
                    let mut state = self.state.borrow_mut();
                    self.finish_response(&mut state, ph.sess_id, ph.stamp, ph.sslot_idx, resp);
                }
                Poll::Pending => still_pending.push(ph),
            }
        }
        self.state.borrow_mut().pending_handlers.extend(still_pending);
    }

    /// Store a handler's response in its slot, write the wire headers, and
    /// queue the first packet.
    fn finish_response(
        &self,
        state: &mut RpcInterior,
        sess_id: SessId,
        stamp: u64,
        sslot_idx: usize,
        resp: MsgBuf,
    ) {
        let max_data = state.tp.max_data_per_pkt();
        let Some(sess) = state.session_mut(sess_id, stamp) else {
            // Session torn down while the handler ran; drop the response.
            return;
        };

        let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
        let peer_sess_id = sess.peer_sess_id;
        let sslot = &mut sess.slots[sslot_idx];
        debug_assert_eq!(sslot.state, SlotState::SrvPending);

        let resp_pkts = num_pkts(resp.len(), max_data);
        assert!(resp_pkts <= PktIdx::MAX as usize, "response too large");
        let tail_len = (resp.len() - (resp_pkts - 1) * max_data) as u16;

        for i in 0..resp_pkts {
            let pkt_type = match (resp_pkts, i) {
                (1, _) => PktType::SmallResp,
                (_, 0) => PktType::LargeRespFirst,
                _ => PktType::LargeRespCont,
            };
            // SAFETY: the header slots of `resp` belong to the endpoint.
            unsafe {
                ptr::write(
                    resp.pkt_hdr(i),
                    PacketHeader::new(
                        sslot.req_type,
                        peer_sess_id,
                        sslot.req_idx,
                        pkt_type,
                        resp_pkts as PktIdx,
                        i as PktIdx,
                        tail_len,
                    ),
                );
            }
        }

        // Store the response buffer in the slot. It is kept for duplicate
        // replay until the next request reuses the slot.
        sslot.resp_stored = Some(resp);
        sslot.state = SlotState::SrvResponded;

        // Send the first packet; the client pulls any continuations.
        self.pending_tx.borrow_mut().push(TxItem {
            sess_id,
            peer,
            msgbuf: sslot.resp_stored.as_ref().unwrap(),
            pkt_idx: 0,
        });
    }

    /// Repost packets of requests whose retransmission deadline expired.
    fn process_timeouts(&self) {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior = &mut state;
        let RpcInterior {
            sessions,
            ctrl_ring,
            ctrl_next,
            stats,
            ..
        } = state;

        let now = Instant::now();
        for (sess_id, sess) in sessions.iter_mut().enumerate() {
            let Some(sess) = sess.as_deref_mut() else {
                continue;
            };
            if !sess.is_client() || !sess.is_connected() {
                continue;
            }

            let sess_id = sess_id as SessId;
            let window = sess.slots.len();
            let peer = sess.peer.as_ref().unwrap() as *const TpPeer;
            let peer_sess_id = sess.peer_sess_id;

            for sslot in sess.slots.iter_mut() {
                if sslot.state != SlotState::CliPending || now < sslot.rtx_deadline {
                    continue;
                }
                stats.retransmissions += 1;

                if sslot.resp_pkts > 0 {
                    // The response has started arriving; re-pull the holes.
                    let mut pulls = 0;
                    for i in 0..sslot.resp_pkts {
                        if sslot.resp_rx[i] {
                            continue;
                        }
                        if i == 0 {
                            // The first response packet cannot be pulled; a
                            // duplicate request packet makes the server
                            // replay it.
                            self.pending_tx.borrow_mut().push(TxItem {
                                sess_id,
                                peer,
                                msgbuf: sslot.req,
                                pkt_idx: sslot.req_pkts - 1,
                            });
                        } else {
                            let rfr = PacketHeader::new(
                                sslot.req_type,
                                peer_sess_id,
                                sslot.req_idx,
                                PktType::Rfr,
                                0,
                                i as PktIdx,
                                0,
                            );
                            Self::push_ctrl(
                                &self.pending_tx,
                                ctrl_ring,
                                ctrl_next,
                                sess_id,
                                peer,
                                rfr,
                            );
                            stats.resp_pulls += 1;
                        }
                        pulls += 1;
                        if pulls == window {
                            break;
                        }
                    }
                } else {
                    // Repost the unacknowledged request packets with the same
                    // headers. Covers both lost request packets and a lost
                    // response: the server replays a stored response when it
                    // sees a duplicate of a completed request.
                    let mut pending_tx = self.pending_tx.borrow_mut();
                    for i in sslot.req_acked..sslot.req_sent {
                        pending_tx.push(TxItem {
                            sess_id,
                            peer,
                            msgbuf: sslot.req,
                            pkt_idx: i,
                        });
                    }
                }

                sslot.rtx_deadline = now + RTX_TIMEOUT;
            }
        }
    }

    /// Transmit pending packets.
    fn process_tx(&self) {
        // Abort if progressing recursively.
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior = &mut state;

        let mut pending_tx = self.pending_tx.borrow_mut();
        if unlikely(!pending_tx.is_empty()) {
            // Fault injection: drop a configured fraction of outbound
            // packets before the transport sees them.
            if unlikely(self.config.pkt_loss_prob > 0.0) {
                let RpcInterior { rng, stats, .. } = state;
                let prob = self.config.pkt_loss_prob;
                pending_tx.retain(|_| {
                    let keep = !rng.gen_bool(prob);
                    if !keep {
                        stats.faults_injected += 1;
                    }
                    keep
                });
            }

            state.stats.tx_pkts += pending_tx.len() as u64;

            // SAFETY: items in `pending_tx` all point to valid peers and
            // `MsgBuf`s; teardown paths purge items before invalidating them.
            if unsafe { state.tp.tx_burst(&pending_tx) }.is_err() {
                pending_tx.clear();
                drop(pending_tx);
                self.fail(state);
                return;
            }
            pending_tx.clear();
            state.tp.tx_flush();
        }
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        // Drop parked and doomed handlers while the endpoint is still whole:
        // their futures may hold nested request awaitables that borrow
        // endpoint state on drop.
        let parked = mem::take(&mut self.state.borrow_mut().pending_handlers);
        drop(parked);
        let doomed = mem::take(&mut *self.doomed_handlers.borrow_mut());
        drop(doomed);

        // Destroy the SM event channel.
        self.nexus.destroy_event_channel(self.id);
    }
}
