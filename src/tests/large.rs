//! Tests for large (multi-packet) RPCs.

use super::*;

const HELLO_WORLD: &str = "hello, world!";
const RPC_HELLO: ReqType = 42;
const RPC_CHECKSUM: ReqType = 44;

const LARGE_MSG_LEN: usize = 65536;

/// Test RPCs with large requests.
#[test]
fn large_req() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    // Request fill byte, intentionally random to verify it.
    let req_byte = rand::thread_rng().gen::<u8>();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        rpc.set_handler(RPC_HELLO, move |req| async move {
            assert_eq!(req.req_buf().len(), LARGE_MSG_LEN);
            let payload = unsafe { req.req_buf().as_slice() };
            assert!(payload.iter().all(|&b| b == req_byte));

            let mut resp_buf = req.pre_resp_buf();
            unsafe {
                ptr::copy_nonoverlapping(
                    HELLO_WORLD.as_ptr(),
                    resp_buf.as_ptr(),
                    HELLO_WORLD.len(),
                )
            };
            resp_buf.set_len(HELLO_WORLD.len());
            resp_buf
        });

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

    for _ in 0..100 {
        // Prepare buffer.
        let req_buf = rpc.alloc_msgbuf(LARGE_MSG_LEN).unwrap();
        let mut resp_buf = rpc.alloc_msgbuf(16).unwrap();

        // Send request.
        unsafe { ptr::write_bytes(req_buf.as_ptr(), req_byte, req_buf.len()) };
        let request = sess.request(RPC_HELLO, &req_buf, &mut resp_buf).unwrap();
        block_on(request).unwrap();

        // Validation.
        assert_eq!(payload_of(&resp_buf), HELLO_WORLD.as_bytes());
    }

    tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Test RPCs with large responses.
#[test]
fn large_resp() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    // Response length, intentionally some magic to verify it.
    const RESP_LEN: usize = 46382;
    let resp_byte = rand::thread_rng().gen::<u8>();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        rpc.set_handler(RPC_HELLO, move |req| async move {
            let resp_buf = req.rpc().alloc_msgbuf(RESP_LEN).unwrap();
            unsafe { ptr::write_bytes(resp_buf.as_ptr(), resp_byte, RESP_LEN) };
            resp_buf
        });

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

    for _ in 0..100 {
        // Prepare buffer.
        let req_buf = rpc.alloc_msgbuf(16).unwrap();
        let mut resp_buf = rpc.alloc_msgbuf(50000).unwrap();

        // Send request.
        unsafe { ptr::write_bytes(req_buf.as_ptr(), 0, req_buf.len()) };
        let request = sess.request(RPC_HELLO, &req_buf, &mut resp_buf).unwrap();
        block_on(request).unwrap();

        // Validation.
        assert_eq!(resp_buf.len(), RESP_LEN);
        let payload = unsafe { resp_buf.as_slice() };
        assert!(payload.iter().all(|&b| b == resp_byte));
    }

    tx.send(()).unwrap();
    handle.join().unwrap();
}

/// 1MiB requests of random bytes; the handler answers with the checksum.
#[test]
fn checksum_1mib() {
    let cli_port = next_port();
    let svr_port = next_port();

    const MSG_LEN: usize = 1 << 20;
    const ITERS: usize = 50;

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        rpc.set_handler(RPC_CHECKSUM, |req| async move {
            let sum = checksum(unsafe { req.req_buf().as_slice() });
            let mut resp_buf = req.pre_resp_buf();
            unsafe { ptr::copy_nonoverlapping(sum.to_le_bytes().as_ptr(), resp_buf.as_ptr(), 8) };
            resp_buf.set_len(8);
            resp_buf
        });

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

    let req_buf = rpc.alloc_msgbuf(MSG_LEN).unwrap();
    let mut resp_buf = rpc.alloc_msgbuf(8).unwrap();
    let mut rng = rand::thread_rng();

    for _ in 0..ITERS {
        let payload: Vec<u8> = (0..MSG_LEN).map(|_| rng.gen()).collect();
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), req_buf.as_ptr(), MSG_LEN) };

        let request = sess.request(RPC_CHECKSUM, &req_buf, &mut resp_buf).unwrap();
        block_on(request).unwrap();

        assert_eq!(payload_of(&resp_buf), checksum(&payload).to_le_bytes());
    }

    tx.send(()).unwrap();
    handle.join().unwrap();
}
