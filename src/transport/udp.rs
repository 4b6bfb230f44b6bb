use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::mem;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ptr::NonNull;
use std::slice;

use crate::config::Config;
use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::transport::{LKey, TxItem, UnreliableTransport};
use crate::util::{huge_alloc::*, likely::*};

const HDR_SIZE: usize = mem::size_of::<PacketHeader>();

/// Received but unreturned packet metadata.
struct RxItem {
    /// Receive ring slot index.
    idx: u16,

    /// Datagram length in bytes, header included.
    len: u16,
}

/// Unreliable datagram transport over a non-blocking UDP socket.
///
/// This is the portable transport: it keeps the same receive-ring discipline
/// as the verbs transport (pre-carved MTU-sized units, explicit release and
/// repost) so the layers above see identical semantics, just without the
/// kernel bypass. The `nic` argument is the local interface address to bind.
pub(crate) struct UdpTransport {
    /// The datapath socket, non-blocking.
    socket: UdpSocket,

    /// Transport MTU, header included.
    mtu: usize,

    /// Recv ring memory, carved into `rx_ring_size` MTU-sized units.
    rx_buf: HugeAlloc,

    /// Free (postable) recv ring slot indices.
    rx_free: Vec<u16>,

    /// Received but unreturned packets.
    rx_items: VecDeque<RxItem>,

    /// Scratch buffer for assembling non-contiguous outbound packets.
    tx_scratch: Vec<u8>,
}

impl UdpTransport {
    const RQ_POLL_BATCH: usize = 16;
}

impl UnreliableTransport for UdpTransport {
    type Endpoint = SocketAddr;
    type Peer = SocketAddr;

    fn new(nic: &str, _phy_port: u8, config: &Config) -> Result<Self, Error> {
        assert!(
            config.mtu > HDR_SIZE && config.mtu <= 65507,
            "MTU {} not expressible in a UDP datagram",
            config.mtu
        );
        assert!(config.rx_ring_size > 0 && config.rx_ring_size <= u16::MAX as usize);

        let ip: IpAddr = nic
            .parse()
            .unwrap_or_else(|_| panic!("not a local interface address: {}", nic));
        let socket = UdpSocket::bind((ip, 0)).map_err(|e| {
            log::error!("failed to bind datapath socket on {}: {}", ip, e);
            Error::FatalTransport
        })?;
        socket.set_nonblocking(true).map_err(|_| Error::FatalTransport)?;

        let rx_buf = alloc_raw(config.rx_ring_size * config.mtu, config.numa_node)?;

        Ok(Self {
            socket,
            mtu: config.mtu,
            rx_buf,
            rx_free: (0..config.rx_ring_size as u16).rev().collect(),
            rx_items: VecDeque::with_capacity(Self::RQ_POLL_BATCH),
            tx_scratch: vec![0; config.mtu],
        })
    }

    #[inline(always)]
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn endpoint(&self) -> SocketAddr {
        self.socket.local_addr().expect("socket has no local address")
    }

    #[inline(always)]
    fn create_peer(&self, ep: SocketAddr) -> SocketAddr {
        ep
    }

    /// Registration is a no-op for a kernel socket; the returned key is a
    /// placeholder so the allocator logic stays transport-agnostic.
    unsafe fn reg_mem(&mut self, _buf: *mut u8, _len: usize) -> Result<LKey, Error> {
        Ok(0)
    }

    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) -> Result<(), Error> {
        for item in items {
            // SAFETY: the caller ensures the items are valid.
            let msgbuf = &*item.msgbuf;
            let peer = *item.peer;

            let pkt_size = msgbuf.pkt_size(item.pkt_idx, self.max_data_per_pkt());
            let payload_len = pkt_size - HDR_SIZE;

            let dgram: &[u8] = if likely(item.pkt_idx == 0) {
                // Header slot 0 directly precedes the payload; send in place.
                slice::from_raw_parts(msgbuf.pkt_hdr(0) as *const u8, pkt_size)
            } else {
                // Continuation headers live after the payload region; gather
                // into the scratch buffer.
                let hdr = msgbuf.pkt_hdr(item.pkt_idx) as *const u8;
                let payload = msgbuf.as_ptr().add(item.pkt_idx * self.max_data_per_pkt());
                self.tx_scratch[..HDR_SIZE].copy_from_slice(slice::from_raw_parts(hdr, HDR_SIZE));
                self.tx_scratch[HDR_SIZE..pkt_size]
                    .copy_from_slice(slice::from_raw_parts(payload, payload_len));
                &self.tx_scratch[..pkt_size]
            };

            match self.socket.send_to(dgram, peer) {
                Ok(_) => {}
                // Queue full or peer not yet reachable: silent drop, the
                // retransmission path recovers.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        IoErrorKind::WouldBlock
                            | IoErrorKind::Interrupted
                            | IoErrorKind::ConnectionRefused
                    ) => {}
                Err(e) => {
                    log::error!("datapath send to {} failed: {}", peer, e);
                    return Err(Error::FatalTransport);
                }
            }
        }
        Ok(())
    }

    /// Sockets have no doorbell to ring.
    #[inline(always)]
    fn tx_flush(&mut self) {}

    fn rx_burst(&mut self) -> Result<usize, Error> {
        let mut n = 0;
        while n < Self::RQ_POLL_BATCH {
            let Some(idx) = self.rx_free.pop() else {
                // Ring exhausted until the caller releases some packets.
                break;
            };

            // SAFETY: slot `idx` is within the ring and currently unposted.
            let slot = unsafe {
                slice::from_raw_parts_mut(self.rx_buf.ptr.add(idx as usize * self.mtu), self.mtu)
            };

            match self.socket.recv_from(slot) {
                Ok((amt, _)) if unlikely(amt < HDR_SIZE) => {
                    // Runt datagram from an unrelated sender; reuse the slot.
                    log::debug!("dropping runt datagram of {} bytes", amt);
                    self.rx_free.push(idx);
                }
                Ok((amt, _)) => {
                    self.rx_items.push_back(RxItem {
                        idx,
                        len: amt as u16,
                    });
                    n += 1;
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        IoErrorKind::WouldBlock
                            | IoErrorKind::Interrupted
                            | IoErrorKind::ConnectionRefused
                    ) =>
                {
                    self.rx_free.push(idx);
                    if e.kind() == IoErrorKind::WouldBlock {
                        break;
                    }
                }
                Err(e) => {
                    self.rx_free.push(idx);
                    log::error!("datapath recv failed: {}", e);
                    return Err(Error::FatalTransport);
                }
            }
        }
        Ok(n)
    }

    #[inline]
    fn rx_next(&mut self) -> Option<MsgBuf> {
        let RxItem { idx, len } = self.rx_items.pop_front()?;

        // SAFETY: pointer guaranteed not-null, within the ring buffer.
        let buf = unsafe { NonNull::new_unchecked(self.rx_buf.ptr.add(idx as usize * self.mtu)) };

        // Embed the ring index into the unused `lkey` so that release does
        // not need a division to recover it from the pointer.
        // SAFETY: the ring slot layout ensures the buffer's validity.
        Some(unsafe { MsgBuf::borrowed(buf, len as usize - HDR_SIZE, idx as LKey) })
    }

    unsafe fn rx_release(&mut self, item: MsgBuf) {
        self.rx_free.push(item.lkey() as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let config = Config {
            rx_ring_size: 64,
            ..Config::default()
        };
        let mut a = UdpTransport::new("127.0.0.1", 1, &config).unwrap();
        let mut b = UdpTransport::new("127.0.0.1", 1, &config).unwrap();
        assert_eq!(a.max_data_per_pkt(), config.mtu - HDR_SIZE);

        // A raw single-packet message: header slot + payload, 8-aligned.
        let mut raw = vec![0u64; config.mtu / 8];
        let base = raw.as_mut_ptr() as *mut u8;
        let hdr = PacketHeader::new(7, 0, 1, crate::pkthdr::PktType::SmallReq, 1, 0, 4);
        // SAFETY: `raw` is large enough, writable, and 8-aligned.
        unsafe {
            std::ptr::write(base as *mut PacketHeader, hdr);
            std::ptr::copy_nonoverlapping(b"ping".as_ptr(), base.add(HDR_SIZE), 4);
        }

        let msgbuf = unsafe { MsgBuf::borrowed(NonNull::new(base).unwrap(), 4, 0) };
        let peer = b.create_peer(b.endpoint());
        let item = TxItem {
            sess_id: 0,
            peer: &peer,
            msgbuf: &msgbuf,
            pkt_idx: 0,
        };
        unsafe { a.tx_burst(std::slice::from_ref(&item)).unwrap() };

        // Poll the receiver for a while; UDP delivery is asynchronous.
        let mut got = None;
        for _ in 0..1000 {
            if b.rx_burst().unwrap() > 0 {
                got = b.rx_next();
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        let got = got.expect("datagram not delivered on loopback");
        assert_eq!(got.len(), 4);
        assert_eq!(unsafe { got.as_slice() }, b"ping");
        unsafe { b.rx_release(got) };
    }
}
