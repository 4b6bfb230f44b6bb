use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use quanta::Instant;

use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::request::Request;
use crate::rpc::Rpc;
use crate::type_alias::*;
use crate::util::likely::*;

/// Interval between out-of-band retries during setup and teardown.
pub(crate) const SM_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Budget for a whole out-of-band exchange. A connect that has not been
/// acknowledged within this budget resolves to [`Error::SetupTimeout`] and
/// releases its session number.
pub(crate) const SM_BUDGET: Duration = Duration::from_millis(500);

/// Handle to a session that points to a specific remote `Rpc` endpoint.
#[derive(Clone, Copy)]
pub struct SessionHandle<'r> {
    /// The RPC instance that owns this session.
    rpc: &'r Rpc,

    /// Session ID.
    sess_id: SessId,

    /// Incarnation stamp of the session this handle refers to.
    stamp: u64,

    /// Peer Nexus SM URI.
    remote_uri: SocketAddr,
}

impl<'r> SessionHandle<'r> {
    /// Create a new session handle.
    #[inline(always)]
    pub(crate) fn new(rpc: &'r Rpc, sess_id: SessId, stamp: u64, remote_uri: SocketAddr) -> Self {
        Self {
            rpc,
            sess_id,
            stamp,
            remote_uri,
        }
    }
}

impl<'r> SessionHandle<'r> {
    /// Return the session ID.
    #[inline(always)]
    pub fn id(&self) -> SessId {
        self.sess_id
    }

    /// Return the RPC instance that owns this session.
    #[inline(always)]
    pub fn rpc(&self) -> &'r Rpc {
        self.rpc
    }

    /// Return `true` if the session is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.rpc.session_is_connected(self.sess_id, self.stamp)
    }

    /// Connect the session to the remote peer.
    ///
    /// This method returns an awaitable that resolves once the out-of-band
    /// exchange concludes. On [`Error::SetupTimeout`] or
    /// [`Error::ConnectRefused`], the reserved session number is released.
    /// Note that the connection makes no progress until the first poll.
    pub fn connect<'a>(&'a self) -> impl Future<Output = Result<(), Error>> + 'a
    where
        'r: 'a,
    {
        let msg = if likely(!self.is_connected()) {
            self.rpc.mark_session_connecting(self.sess_id, self.stamp);
            self.rpc.connect_frame(self.sess_id)
        } else {
            Vec::new()
        };

        SessionConnect {
            rpc: self.rpc,
            sess_id: self.sess_id,
            stamp: self.stamp,
            remote_uri: self.remote_uri,
            msg,
            last_send: Instant::now() - SM_RETRY_INTERVAL,
            started: Instant::now(),
        }
    }

    /// Disconnect the session.
    ///
    /// Outstanding requests fail with [`Error::SessionReset`]; their buffers
    /// are returned to the caller unchanged. The awaitable resolves once the
    /// peer acknowledges the teardown (or the exchange budget runs out, in
    /// which case the session is torn down locally anyway). The session
    /// number returns to the free pool either way.
    pub fn disconnect<'a>(&'a self) -> impl Future<Output = Result<(), Error>> + 'a
    where
        'r: 'a,
    {
        let msg = self.rpc.begin_disconnect(self.sess_id, self.stamp);

        SessionDisconnect {
            rpc: self.rpc,
            sess_id: self.sess_id,
            stamp: self.stamp,
            remote_uri: self.remote_uri,
            msg,
            last_send: Instant::now() - SM_RETRY_INTERVAL,
            started: Instant::now(),
        }
    }

    /// Send a request in this session.
    ///
    /// Fails fast with [`Error::NoCredits`] when all slots are occupied and
    /// [`Error::SessionNotConnected`] outside the connected state. On
    /// success, the returned awaitable resolves when the response has been
    /// fully received into `resp_msgbuf` (resized to the response length;
    /// it must be allocated large enough, or the endpoint panics).
    pub fn request<'a>(
        &'a self,
        req_type: ReqType,
        req_msgbuf: &'a MsgBuf,
        resp_msgbuf: &'a mut MsgBuf,
    ) -> Result<Request<'a>, Error>
    where
        'r: 'a,
    {
        self.rpc
            .enqueue_request(self.sess_id, self.stamp, req_type, req_msgbuf, resp_msgbuf)
    }
}

/// Session connection awaitable.
struct SessionConnect<'a> {
    rpc: &'a Rpc,
    sess_id: SessId,
    stamp: u64,

    /// URI of the remote peer's Nexus.
    remote_uri: SocketAddr,

    /// The encoded frame to (re)send to the remote peer's Nexus.
    msg: Vec<u8>,

    /// The time when the last SM frame was sent.
    last_send: Instant,

    /// The time when the exchange started.
    started: Instant,
}

impl Future for SessionConnect<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Check if the connection outcome has already been determined.
        if let Some(result) = self.rpc.session_connect_outcome(self.sess_id, self.stamp) {
            if result.is_err() {
                self.rpc.release_session(self.sess_id, self.stamp);
            }
            return Poll::Ready(result);
        }

        if unlikely(self.started.elapsed() >= SM_BUDGET) {
            self.rpc.release_session(self.sess_id, self.stamp);
            return Poll::Ready(Err(Error::SetupTimeout));
        }

        // (Re)send the connect request to the remote peer on the retry interval.
        if self.last_send.elapsed() >= SM_RETRY_INTERVAL {
            self.rpc.sm_send_raw(&self.msg, self.remote_uri);
            self.last_send = Instant::now();
        }

        self.rpc.progress();
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Session teardown awaitable.
struct SessionDisconnect<'a> {
    rpc: &'a Rpc,
    sess_id: SessId,
    stamp: u64,

    /// URI of the remote peer's Nexus.
    remote_uri: SocketAddr,

    /// The encoded frame to (re)send; `None` if there is nothing to tear
    /// down remotely.
    msg: Option<Vec<u8>>,

    /// The time when the last SM frame was sent.
    last_send: Instant,

    /// The time when the exchange started.
    started: Instant,
}

impl Future for SessionDisconnect<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.msg.is_none() {
            // Nothing was connected; tear down locally.
            self.rpc.release_session(self.sess_id, self.stamp);
            return Poll::Ready(Ok(()));
        }

        if self.rpc.session_disconnect_done(self.sess_id, self.stamp) {
            self.rpc.release_session(self.sess_id, self.stamp);
            return Poll::Ready(Ok(()));
        }

        if unlikely(self.started.elapsed() >= SM_BUDGET) {
            // The peer is unresponsive; force the local teardown. Resources
            // are already cancelled, so this only drops the session state.
            log::warn!(
                "session {}: disconnect not acknowledged, tearing down locally",
                self.sess_id
            );
            self.rpc.release_session(self.sess_id, self.stamp);
            return Poll::Ready(Ok(()));
        }

        if self.last_send.elapsed() >= SM_RETRY_INTERVAL {
            let msg = self.msg.clone().unwrap();
            self.rpc.sm_send_raw(&msg, self.remote_uri);
            self.last_send = Instant::now();
        }

        self.rpc.progress();
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
