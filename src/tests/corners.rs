//! Corner-case tests.

use super::*;

const RPC_NOMSG: ReqType = 99;
const RPC_ECHO_SUM: ReqType = 98;

/// Test if zero-sized requests & responses can be correctly handled.
#[test]
fn zero_sized() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        rpc.set_handler(RPC_NOMSG, |req| async move {
            assert_eq!(req.req_buf().len(), 0);
            let mut resp_buf = req.pre_resp_buf();
            resp_buf.set_len(0);
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

    // A zero-byte allocation still yields a usable buffer.
    let req_buf = rpc.alloc_msgbuf(0).unwrap();
    assert_eq!(req_buf.len(), 0);
    let mut resp_buf = rpc.alloc_msgbuf(1).unwrap();

    // Send request.
    let request = sess.request(RPC_NOMSG, &req_buf, &mut resp_buf).unwrap();
    block_on(request).unwrap();

    // Validation.
    assert_eq!(resp_buf.len(), 0);

    tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A request of exactly one packet's payload takes the single-packet path;
/// one byte more takes the two-packet path with reassembly.
#[test]
fn mtu_boundary() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, test_config()).unwrap();
        rpc.set_handler(RPC_ECHO_SUM, |req| async move {
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

    let max_data = test_config().mtu - mem::size_of::<crate::pkthdr::PacketHeader>();

    for (len, expected_req_pkts) in [(max_data, 1u64), (max_data + 1, 2u64)] {
        let req_buf = rpc.alloc_msgbuf(len).unwrap();
        let mut resp_buf = rpc.alloc_msgbuf(8).unwrap();

        let fill: Vec<u8> = (0..len).map(|i| i as u8).collect();
        unsafe { ptr::copy_nonoverlapping(fill.as_ptr(), req_buf.as_ptr(), len) };

        let before = rpc.stats();
        let request = sess.request(RPC_ECHO_SUM, &req_buf, &mut resp_buf).unwrap();
        block_on(request).unwrap();
        let after = rpc.stats();

        assert_eq!(payload_of(&resp_buf), checksum(&fill).to_le_bytes());

        // Packet counts are only meaningful if nothing was retransmitted.
        if after.retransmissions == before.retransmissions {
            assert_eq!(after.tx_pkts - before.tx_pkts, expected_req_pkts);
        }
    }

    tx.send(()).unwrap();
    handle.join().unwrap();
}
