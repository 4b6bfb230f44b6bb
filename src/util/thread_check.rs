use std::thread;

use crate::rpc::Rpc;

/// Check that the given `Rpc` is used on the thread that created it.
/// All session and slot state is single-threaded by design; crossing threads
/// would corrupt it silently, so this fails loudly instead.
#[cfg(not(feature = "skip_safety_checks"))]
#[inline(always)]
pub(crate) fn do_thread_check(rpc: &Rpc) {
    #[inline(never)]
    #[cold]
    fn do_thread_check_fail() {
        panic!("Rpc must not be used on a different thread than it was created on");
    }

    if thread::current().id() != rpc.thread_id {
        do_thread_check_fail()
    }
}

#[cfg(feature = "skip_safety_checks")]
#[inline(always)]
pub(crate) fn do_thread_check(_: &Rpc) {}
