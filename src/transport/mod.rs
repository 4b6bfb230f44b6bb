mod udp;

#[cfg(feature = "rdma")]
mod verbs;

use std::mem;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::Config;
use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::type_alias::SessId;

pub(crate) use self::udp::UdpTransport;

#[cfg(feature = "rdma")]
pub(crate) use self::verbs::UdTransport;

/// Memory region handle type.
pub type LKey = u32;

/// The transport the crate is built against, selected at compile time like
/// the rest of the datapath constants.
#[cfg(not(feature = "rdma"))]
pub(crate) type ActiveTransport = UdpTransport;
#[cfg(feature = "rdma")]
pub(crate) type ActiveTransport = UdTransport;

pub(crate) type TpEndpoint = <ActiveTransport as UnreliableTransport>::Endpoint;
pub(crate) type TpPeer = <ActiveTransport as UnreliableTransport>::Peer;

/// One packet to transmit.
pub(crate) struct TxItem<Tp: UnreliableTransport> {
    /// Session this packet belongs to.
    pub sess_id: SessId,

    /// Peer for this packet.
    pub peer: *const Tp::Peer,

    /// Message buffer.
    pub msgbuf: *const MsgBuf,

    /// Index of this packet in the entire message.
    pub pkt_idx: usize,
}

/// Trait for generalized possibly-unreliable datagram transport.
///
/// The transport may drop or reorder packets arbitrarily; the session layer
/// above is responsible for reliability. Queue-full conditions on transmit
/// are silent drops, recovered by the retransmission path. Errors returned
/// from the burst methods are unrecoverable: the endpoint treats them as
/// fatal and resets all of its sessions.
pub(crate) trait UnreliableTransport: Sized {
    /// Endpoint information type, used for out-of-band routing exchange.
    /// Must not contain any data dependent on local resources.
    type Endpoint: Sized + Clone + Serialize + DeserializeOwned + 'static;

    /// Peer information type, used for sending data.
    /// Can contain data dependent on local resources, e.g., `*mut ibv_ah`.
    type Peer: Sized;

    /// Create a new transport instance bound to the given NIC and port.
    fn new(nic: &str, phy_port: u8, config: &Config) -> Result<Self, Error>;

    /// Return the MTU of the transport, header included.
    fn mtu(&self) -> usize;

    /// Return the maximum amount of application data in a packet.
    #[inline(always)]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - mem::size_of::<PacketHeader>()
    }

    /// Return the endpoint information representing the transport instance.
    fn endpoint(&self) -> Self::Endpoint;

    /// Construct a peer from the given endpoint information.
    fn create_peer(&self, ep: Self::Endpoint) -> Self::Peer;

    /// Register memory so that it is accessible by the transport.
    /// Return a handle to the registered memory region.
    ///
    /// # Safety
    ///
    /// The memory region `[buf, buf + len)` must be valid for access.
    unsafe fn reg_mem(&mut self, buf: *mut u8, len: usize) -> Result<LKey, Error>;

    /// Transmit a batch of packets.
    ///
    /// # Safety
    ///
    /// The items in the batch must all point to valid peers and `MsgBuf`s.
    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) -> Result<(), Error>;

    /// Issue the doorbell for any sends whose signaling was deferred.
    fn tx_flush(&mut self);

    /// Receive a batch of packets.
    /// Return the number of packets received.
    fn rx_burst(&mut self) -> Result<usize, Error>;

    /// Return the next received packet.
    fn rx_next(&mut self) -> Option<MsgBuf>;

    /// Mark a received packet as released, replenishing the receive ring.
    ///
    /// # Safety
    ///
    /// - Only `MsgBuf`s returned by `rx_next` can be released.
    /// - A `MsgBuf` must not be used after it is released, nor released twice.
    unsafe fn rx_release(&mut self, item: MsgBuf);
}
