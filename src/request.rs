use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::rpc::Rpc;
use crate::type_alias::*;

/// An in-flight RPC request.
///
/// Resolves when the response has been fully received into the response
/// buffer supplied to [`Session::request`](crate::Session::request), or with
/// [`Error::SessionReset`] if the session is torn down first. Each poll runs
/// one event-loop pass, so awaiting the request drives the endpoint.
///
/// Dropping an unresolved `Request` abandons it: the slot (and its credit)
/// is released immediately and a late response is discarded by its stale
/// request number.
pub struct Request<'a> {
    rpc: &'a Rpc,
    sess_id: SessId,
    stamp: u64,
    sslot_idx: usize,
    req_idx: ReqIdx,
    done: bool,
}

impl<'a> Request<'a> {
    #[inline(always)]
    pub(crate) fn new(
        rpc: &'a Rpc,
        sess_id: SessId,
        stamp: u64,
        sslot_idx: usize,
        req_idx: ReqIdx,
    ) -> Self {
        Self {
            rpc,
            sess_id,
            stamp,
            sslot_idx,
            req_idx,
            done: false,
        }
    }
}

impl Future for Request<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) =
            self.rpc
                .request_outcome(self.sess_id, self.stamp, self.sslot_idx, self.req_idx)
        {
            self.done = true;
            return Poll::Ready(result);
        }

        self.rpc.progress();
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rpc
                .abandon_request(self.sess_id, self.stamp, self.sslot_idx, self.req_idx);
        }
    }
}
