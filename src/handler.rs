//! Types used by RPC request handlers.

use std::future::Future;
use std::pin::Pin;

use crate::msgbuf::MsgBuf;
use crate::rpc::Rpc;
use crate::session::SSlot;
use crate::type_alias::*;

/// RPC request handler function return type.
pub(crate) type ReqHandlerFuture = Pin<Box<dyn Future<Output = MsgBuf> + 'static>>;

/// RPC request handler function trait.
///
/// A handler receives a [`RequestHandle`] and returns a future that resolves
/// to the response `MsgBuf` — either the handle's pre-allocated response
/// buffer or one allocated from the endpoint. Synchronous handlers simply
/// return a ready future; a handler that awaits is parked and its response
/// is sent on a later event-loop pass.
pub(crate) type ReqHandler = Box<dyn Fn(RequestHandle) -> ReqHandlerFuture + 'static>;

/// Handle to an incoming request, passed to the registered handler.
///
/// The handle (and the request buffer behind it) stays valid until the
/// handler's future completes, even if it suspends across event-loop passes.
pub struct RequestHandle {
    /// Pointer to the `Rpc` instance that invoked the handler.
    rpc: *const Rpc,

    /// Pointer to the session slot of this request.
    sslot: *mut SSlot,
}

impl RequestHandle {
    /// Construct a request handle.
    #[inline(always)]
    pub(crate) fn new(rpc: &Rpc, sslot: *mut SSlot) -> Self {
        Self { rpc, sslot }
    }
}

impl RequestHandle {
    /// Return the `Rpc` instance that invoked the handler.
    #[inline(always)]
    pub fn rpc(&self) -> &Rpc {
        // SAFETY: the endpoint outlives every handler it invokes.
        unsafe { &*self.rpc }
    }

    /// Return the type of this request.
    #[inline(always)]
    pub fn req_type(&self) -> ReqType {
        // SAFETY: the slot stays valid for the lifetime of the handler.
        unsafe { (*self.sslot).req_type }
    }

    /// Return the request buffer.
    #[inline(always)]
    pub fn req_buf(&self) -> &MsgBuf {
        // SAFETY: the slot stays valid for the lifetime of the handler, and
        // `srv_req` is populated before the handler is invoked.
        unsafe { (*self.sslot).srv_req.as_ref().unwrap() }
    }

    /// Return the pre-allocated response buffer.
    ///
    /// This buffer can only accommodate single-packet data (MTU minus header
    /// size). For larger responses, allocate with
    /// [`Rpc::alloc_msgbuf`](crate::Rpc::alloc_msgbuf).
    #[inline(always)]
    pub fn pre_resp_buf(&self) -> MsgBuf {
        // SAFETY: the slot stays valid for the lifetime of the handler; the
        // returned alias is outlived by the slot-owned buffer it points to.
        unsafe { (*self.sslot).pre_resp.as_ref().unwrap().clone_borrowed() }
    }
}
