//! End-to-end behavior under injected packet loss.
//!
//! Both endpoints drop a tenth of their outbound packets; every request must
//! still complete with correct bytes via the retransmission machinery.

use super::*;

const RPC_CHECKSUM: ReqType = 44;

#[test]
fn injected_loss() {
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();

    let cli_port = next_port();
    let svr_port = next_port();

    const MSG_LEN: usize = 32768;
    const ITERS: usize = 200;

    let lossy_config = || Config {
        pkt_loss_prob: 0.1,
        ..test_config()
    };

    let (tx, rx) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new((LOCALHOST, svr_port));
        let mut rpc = Rpc::new(&nx, 2, LOCALHOST, lossy_config()).unwrap();
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
    let rpc = Rpc::new(&nx, 1, LOCALHOST, lossy_config()).unwrap();

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

    // Loss must actually have been injected and recovered from.
    let stats = rpc.stats();
    assert!(stats.faults_injected > 0);
    assert!(stats.retransmissions > 0);

    tx.send(()).unwrap();
    handle.join().unwrap();
}
