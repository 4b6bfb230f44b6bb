use std::collections::VecDeque;
use std::mem;
use std::ptr::{self, NonNull};

use rrddmma::{
    bindings::*,
    prelude::*,
    rdma::{
        mr::Permission,
        qp::{QpEndpoint, QpPeer},
    },
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::transport::{LKey, TxItem, UnreliableTransport};
use crate::util::{huge_alloc::*, likely::*};

const CACHELINE_SIZE: usize = 64;
const HDR_SIZE: usize = mem::size_of::<PacketHeader>();

/// Endpoint information exchanged over the out-of-band channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct UdEndpoint {
    qp: QpEndpoint,
}

/// Received but unreturned packet metadata.
struct RxItem {
    /// Receive unit index.
    idx: u16,

    /// Packet length in bytes, header included.
    len: u16,
}

/// RDMA UD transport.
pub(crate) struct UdTransport {
    /// The UD queue pair.
    qp: Qp,
    /// Memory region registry.
    mrs: Vec<Mr>,

    /// Send packet sequence number.
    /// Used to check whether to signal a batch of send requests.
    tx_pkt_idx: usize,
    /// Send SGE buffer, two entries per WR for header/payload gather.
    tx_sgl: Vec<[ibv_sge; 2]>,
    /// Send work request buffer.
    tx_wr: Vec<ibv_send_wr>,

    /// Recv memory buffer.
    // Placed after `mrs` so that it is dropped after memory regions.
    #[allow(unused)]
    rx_buf: HugeAlloc,
    /// Recv SGE buffer.
    #[allow(unused)]
    rx_sge: Vec<ibv_sge>,
    /// Recv work request buffer.
    rx_wr: Vec<ibv_recv_wr>,
    /// Recv work completion buffer.
    rx_wc: Vec<Wc>,
    /// Received but unreturned packets.
    rx_items: VecDeque<RxItem>,
    /// Number of pending receive work requests to repost.
    rx_repost_pending: usize,

    /// Myself as a peer. Used for `tx_flush`.
    peer_to_myself: QpPeer,
}

impl UdTransport {
    const GRH_SIZE: usize = 40;
    const MTU: usize = 1 << 12;

    const SQ_SIZE: usize = 1 << 8;
    const SQ_SIGNAL_BATCH: usize = 1 << 6;

    const RQ_POLL_BATCH: usize = 1 << 4;
    const RQ_POSTLIST_SIZE: usize = 1 << 6;
    const RX_UNIT_ALLOC_SIZE: usize = CACHELINE_SIZE + Self::MTU;

    /// Get the offset of the `i`-th receive unit in the entire buffer.
    /// This will point to the beginning of the GRH.
    #[inline(always)]
    const fn rx_offset(i: usize) -> usize {
        i * Self::RX_UNIT_ALLOC_SIZE + (CACHELINE_SIZE - Self::GRH_SIZE)
    }

    /// Get the offset of the `i`-th receive unit's payload in the entire buffer.
    /// This will point to the packet header.
    #[inline(always)]
    const fn rx_payload_offset(i: usize) -> usize {
        i * Self::RX_UNIT_ALLOC_SIZE + CACHELINE_SIZE
    }
}

impl UnreliableTransport for UdTransport {
    type Endpoint = UdEndpoint;
    type Peer = QpPeer;

    fn new(nic: &str, phy_port: u8, config: &Config) -> Result<Self, Error> {
        assert!(
            CACHELINE_SIZE >= Self::GRH_SIZE,
            "GRH too large, cannot fit in cacheline"
        );
        assert!(
            config.mtu == Self::MTU,
            "the verbs transport carries a fixed 4KiB MTU, configured {}",
            config.mtu
        );
        let rq_size = config.rx_ring_size;
        assert!(rq_size.is_power_of_two() && rq_size <= u16::MAX as usize + 1);

        // Initialize QP.
        let Nic { context, ports } = Nic::finder()
            .dev_name(nic)
            .port_num(phy_port)
            .probe_nth_port(0)
            .expect("failed to find target NIC or physical port");
        let port = ports.into_iter().next().unwrap();
        assert!(
            port.mtu().bytes() == Self::MTU,
            "path active MTU must be 4KiB"
        );

        let pd = Pd::new(&context).expect("failed to allocate protection domain");
        let qp = {
            let send_cq =
                Cq::new(&context, Self::SQ_SIZE as _).expect("failed to allocate UD send CQ");
            let recv_cq = Cq::new(&context, rq_size as _).expect("failed to allocate UD recv CQ");
            let mut qp = Qp::builder()
                .qp_type(QpType::Ud)
                .send_cq(&send_cq)
                .recv_cq(&recv_cq)
                .caps(QpCaps {
                    max_send_wr: Self::SQ_SIZE as _,
                    max_recv_wr: rq_size as _,
                    max_send_sge: 2,
                    max_recv_sge: 1,
                    ..QpCaps::default()
                })
                .sq_sig_all(false)
                .build(&pd)
                .expect("failed to create UD queue pair");
            qp.bind_local_port(&port, None)
                .expect("failed to bind UD QP to port");
            qp
        };

        // Create a peer for myself.
        let peer_to_myself = qp
            .make_peer(&qp.endpoint().unwrap())
            .expect("failed to create peer for myself");

        // Initialize send WRs.
        let mut tx_sgl = vec![[ibv_sge::default(); 2]; Self::SQ_SIZE + 1];
        let mut tx_wr = (0..(Self::SQ_SIZE + 1))
            .map(|i| ibv_send_wr {
                wr_id: i as _,
                sg_list: tx_sgl[i].as_mut_ptr(),
                num_sge: 2,
                opcode: ibv_wr_opcode::IBV_WR_SEND,
                ..unsafe { mem::zeroed() }
            })
            .collect::<Vec<_>>();
        for i in 0..Self::SQ_SIZE {
            tx_wr[i].next = &mut tx_wr[i + 1] as *mut _;
        }

        // Initialize recv buffer.
        let rx_buf = alloc_raw(rq_size * Self::RX_UNIT_ALLOC_SIZE, config.numa_node)?;
        assert!(rx_buf.ptr as usize % CACHELINE_SIZE == 0);

        // SAFETY: correct freshly-allocated buffer.
        let rx_mr = unsafe {
            Mr::reg(&pd, rx_buf.ptr, rx_buf.len, Permission::LOCAL_WRITE)
                .map_err(|_| Error::RegistrationFailed)?
        };

        // Initialize recv WRs.
        let mut rx_sge = (0..Self::RQ_POSTLIST_SIZE)
            .map(|_| ibv_sge {
                addr: 0,
                length: (Self::GRH_SIZE + Self::MTU) as _,
                lkey: rx_mr.lkey(),
            })
            .collect::<Vec<_>>();

        let mut rx_wr = (0..Self::RQ_POSTLIST_SIZE)
            .map(|i| ibv_recv_wr {
                sg_list: &mut rx_sge[i],
                num_sge: 1,
                ..unsafe { mem::zeroed() }
            })
            .collect::<Vec<_>>();
        for i in 0..(Self::RQ_POSTLIST_SIZE - 1) {
            rx_wr[i].next = &mut rx_wr[i + 1];
        }

        // Post recv WRs in batches.
        for start in (0..rq_size).step_by(Self::RQ_POSTLIST_SIZE) {
            let end = (start + Self::RQ_POSTLIST_SIZE).min(rq_size);

            for i in 0..(end - start) {
                let offset = Self::rx_offset(start + i);

                // SAFETY: in the same allocated buffer.
                rx_sge[i].addr = unsafe { rx_buf.ptr.add(offset) } as _;
                rx_wr[i].wr_id = (start + i) as _;
            }

            // SAFETY: all work requests are correctly constructed.
            unsafe {
                qp.post_raw_recv(&rx_wr[0])
                    .expect("failed to post recv WRs");
            }
        }

        // Initialize recv WC buffer.
        let rx_wc = vec![Wc::default(); Self::RQ_POLL_BATCH];
        let rx_items = VecDeque::with_capacity(Self::RQ_POLL_BATCH);

        Ok(Self {
            qp,
            mrs: vec![rx_mr],

            tx_pkt_idx: 0,
            tx_sgl,
            tx_wr,

            rx_buf,
            rx_sge,
            rx_wr,
            rx_wc,
            rx_items,
            rx_repost_pending: 0,

            peer_to_myself,
        })
    }

    #[inline(always)]
    fn mtu(&self) -> usize {
        Self::MTU
    }

    fn endpoint(&self) -> UdEndpoint {
        UdEndpoint {
            qp: self.qp.endpoint().unwrap(),
        }
    }

    fn create_peer(&self, ep: UdEndpoint) -> QpPeer {
        self.qp
            .make_peer(&ep.qp)
            .expect("failed to create peer from endpoint")
    }

    unsafe fn reg_mem(&mut self, buf: *mut u8, len: usize) -> Result<LKey, Error> {
        let mr = Mr::reg(self.qp.pd(), buf, len, Permission::default())
            .map_err(|_| Error::RegistrationFailed)?;
        let lkey = mr.lkey();
        self.mrs.push(mr);
        Ok(lkey)
    }

    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }

        // Split the many packets into batches.
        // Batch size must not be larger than `SQ_SIGNAL_BATCH`, or it will get
        // stuck when trying to poll CQEs from unposted WRs and break the
        // invariant that there is always exactly one unpolled CQE (after the
        // first Tx packet).
        if unlikely(items.len() > Self::SQ_SIGNAL_BATCH) {
            // SAFETY: recursion (induction).
            for chunk in items.chunks(Self::SQ_SIGNAL_BATCH) {
                self.tx_burst(chunk)?;
            }
            return Ok(());
        }

        let max_data = self.max_data_per_pkt();
        for (i, item) in items.iter().enumerate() {
            // SAFETY: the caller ensures that memory handles are valid.
            let sgl = &mut self.tx_sgl[i];
            let wr = &mut self.tx_wr[i];
            debug_assert_eq!(wr.sg_list, sgl.as_mut_ptr());

            // Set signaled flag + poll send CQ if needed.
            wr.send_flags = if self.tx_pkt_idx % Self::SQ_SIGNAL_BATCH == 0 {
                if self.tx_pkt_idx > 0 {
                    self.qp.scq().poll_one_blocking_consumed();
                }
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            };
            self.tx_pkt_idx += 1;

            // Gather the header slot and the payload slice.
            let msgbuf = &*item.msgbuf;
            let payload_len = (msgbuf.pkt_size(item.pkt_idx, max_data) - HDR_SIZE) as u32;
            sgl[0] = ibv_sge {
                addr: msgbuf.pkt_hdr(item.pkt_idx) as _,
                length: HDR_SIZE as _,
                lkey: msgbuf.lkey(),
            };
            sgl[1] = ibv_sge {
                addr: msgbuf.as_ptr().add(item.pkt_idx * max_data) as _,
                length: payload_len,
                lkey: msgbuf.lkey(),
            };
            wr.num_sge = if payload_len > 0 { 2 } else { 1 };

            // Fill in routing information.
            // Safety requirements should be upheld by the caller, no need to check here.
            wr.wr.ud = (*item.peer).ud();
        }

        // Break the linked list chain.
        self.tx_wr[items.len() - 1].next = ptr::null_mut();

        // SAFETY: all work requests are correctly constructed.
        let ret = self.qp.post_raw_send(&self.tx_wr[0]);

        // Restore the linked list chain.
        self.tx_wr[items.len() - 1].next = &mut self.tx_wr[items.len()] as *mut _;

        ret.map_err(|e| {
            log::error!("failed to post send WRs: {}", e);
            Error::FatalTransport
        })
    }

    fn tx_flush(&mut self) {
        if unlikely(self.tx_pkt_idx == 0) {
            return;
        }

        // There must be exactly one unpolled CQE. Poll it.
        self.qp.scq().poll_one_blocking_consumed();

        // Send a packet that will be dropped by myself.
        let buf = [0u8; 1];
        let mut sge = ibv_sge {
            addr: buf.as_ptr() as _,
            length: 1,
            lkey: 0,
        };

        let mut wr = ibv_send_wr {
            sg_list: &mut sge,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: (ibv_send_flags::IBV_SEND_INLINE | ibv_send_flags::IBV_SEND_SIGNALED).0,

            // SAFETY: POD type.
            ..unsafe { mem::zeroed() }
        };

        self.peer_to_myself.set_ud_peer(&mut wr);
        wr.wr.ud.remote_qpn = 0;

        // SAFETY: all work requests are correctly constructed.
        unsafe {
            self.qp
                .post_raw_send(&wr)
                .expect("failed to post send WR (tx_flush)");
        }

        // Poll the CQE.
        self.qp.scq().poll_one_blocking_consumed();

        // Reset signal counter.
        self.tx_pkt_idx = 0;
    }

    fn rx_burst(&mut self) -> Result<usize, Error> {
        let n = self
            .qp
            .rcq()
            .poll_into(&mut self.rx_wc)
            .map_err(|e| {
                log::error!("failed to poll recv CQ: {}", e);
                Error::FatalTransport
            })? as usize;
        for i in 0..n {
            let wc = &self.rx_wc[i];
            let wc_len = wc.ok().map_err(|e| {
                log::error!("recv completion failed: {}", e);
                Error::FatalTransport
            })? as usize;
            self.rx_items.push_back(RxItem {
                idx: wc.wr_id() as _,
                len: (wc_len - Self::GRH_SIZE) as _,
            });
        }
        Ok(n)
    }

    #[inline]
    fn rx_next(&mut self) -> Option<MsgBuf> {
        let RxItem { idx, len } = self.rx_items.pop_front()?;
        let offset = Self::rx_payload_offset(idx as _);

        // SAFETY: pointer guaranteed not-null, and within the same allocated buffer.
        let buf = unsafe { NonNull::new_unchecked(self.rx_buf.ptr.add(offset)) };

        // Embed the index into the unused `lkey` so that we do not need to
        // perform division to recover it from the pointer during release.
        // SAFETY: the recv buffer layout ensures the buffer's validity.
        Some(unsafe { MsgBuf::borrowed(buf, len as usize - HDR_SIZE, idx as _) })
    }

    unsafe fn rx_release(&mut self, item: MsgBuf) {
        let idx = item.lkey() as usize;
        self.rx_sge[self.rx_repost_pending].addr = self.rx_buf.ptr.add(Self::rx_offset(idx)) as _;
        self.rx_wr[self.rx_repost_pending].wr_id = idx as _;
        self.rx_repost_pending += 1;

        if unlikely(self.rx_repost_pending == Self::RQ_POSTLIST_SIZE) {
            // SAFETY: all work requests are correctly constructed.
            self.qp
                .post_raw_recv(&self.rx_wr[0])
                .expect("failed to post recv WRs");
            self.rx_repost_pending = 0;
        }
    }
}
