//! Control-plane functionalities: creating RPCs, sessions, and tearing them down.

use quanta::Instant;

use super::*;

/// Test if `Rpc`s can be created.
#[test]
fn create_rpcs() {
    let nexus = Nexus::new((LOCALHOST, next_port()));
    let handles = (1..=16).map(|i| {
        let nexus = nexus.clone();
        thread::spawn(move || {
            let _ = Rpc::new(&nexus, i, LOCALHOST, test_config()).unwrap();
        })
    });
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Test if `Session`s can be created and connected.
#[test]
fn connect_rpcs() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let rpc = Rpc::new(&nx, 3, LOCALHOST, test_config()).unwrap();
        while rx.try_recv().is_err() {
            rpc.progress();
        }
    });

    let nx = Nexus::new((LOCALHOST, cli_port));
    let r1 = Rpc::new(&nx, 1, LOCALHOST, test_config()).unwrap();
    let r2 = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();

    (0..10).for_each(|i| {
        let sess = r1.create_session((LOCALHOST, svr_port), 3).unwrap();
        assert_eq!(sess.id(), i);
        assert!(!sess.is_connected());

        block_on(sess.connect()).unwrap();
        assert!(sess.is_connected());
    });
    (0..10).for_each(|i| {
        let sess = r2.create_session((LOCALHOST, svr_port), 3).unwrap();
        assert_eq!(sess.id(), i);
        assert!(!sess.is_connected());

        block_on(sess.connect()).unwrap();
        assert!(sess.is_connected());
    });

    tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Sessions created and torn down in sequence must reuse their numbers:
/// the session number space does not leak.
#[test]
fn session_churn() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        while rx.try_recv().is_err() {
            rpc.progress();
        }
    });

    let nx = Nexus::new((LOCALHOST, cli_port));
    let rpc = Rpc::new(&nx, 1, LOCALHOST, test_config()).unwrap();

    for _ in 0..100 {
        let sess = rpc.create_session((LOCALHOST, svr_port), 2).unwrap();
        assert_eq!(sess.id(), 0);

        block_on(sess.connect()).unwrap();
        assert!(sess.is_connected());

        block_on(sess.disconnect()).unwrap();
        assert!(!sess.is_connected());
    }

    tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Connecting to a peer that does not exist must resolve to `SetupTimeout`
/// within the exchange budget, and release the reserved session number.
#[test]
fn unreachable_peer() {
    let cli_port = next_port();
    let dead_port = next_port(); // Nothing listens here.

    let nx = Nexus::new((LOCALHOST, cli_port));
    let rpc = Rpc::new(&nx, 1, LOCALHOST, test_config()).unwrap();

    let sess = rpc.create_session((LOCALHOST, dead_port), 9).unwrap();
    assert_eq!(sess.id(), 0);

    let start = Instant::now();
    let result = block_on(sess.connect());
    assert_eq!(result, Err(Error::SetupTimeout));
    assert!(start.elapsed() < Duration::from_secs(2));

    // The session number must be reusable now.
    let sess = rpc.create_session((LOCALHOST, dead_port), 9).unwrap();
    assert_eq!(sess.id(), 0);
}

/// Disconnecting with a request outstanding must fail the request with
/// `SessionReset` and leave the user's buffers untouched.
#[test]
fn reset_outstanding_request() {
    let cli_port = next_port();
    let svr_port = next_port();

    const RPC_UNSERVED: ReqType = 77;
    const FILL: u8 = 0x5A;

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        // No handler registered: requests of RPC_UNSERVED are never answered.
        let rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        tx2.send(()).unwrap();
        while rx.try_recv().is_err() {
            rpc.progress();
        }
    });

    let nx = Nexus::new((LOCALHOST, cli_port));
    let rpc = Rpc::new(&nx, 1, LOCALHOST, test_config()).unwrap();

    rx2.recv().unwrap();
    let sess = rpc.create_session((LOCALHOST, svr_port), 2).unwrap();
    block_on(sess.connect()).unwrap();

    let req_buf = rpc.alloc_msgbuf(64).unwrap();
    let mut resp_buf = rpc.alloc_msgbuf(64).unwrap();
    unsafe { ptr::write_bytes(req_buf.as_ptr(), FILL, req_buf.len()) };

    let request = sess.request(RPC_UNSERVED, &req_buf, &mut resp_buf).unwrap();

    // Give the request time to actually reach the wire.
    rpc.progress_for(Duration::from_millis(20));

    block_on(sess.disconnect()).unwrap();
    assert_eq!(block_on(request), Err(Error::SessionReset));

    // The request payload is returned unchanged.
    assert!(payload_of(&req_buf).iter().all(|&b| b == FILL));

    tx.send(()).unwrap();
    handle.join().unwrap();
}
