use std::{fmt, hint};

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_le::<$integral_ty>().into()
        }
    };

    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $integral_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

/// Magic value carried in the `flags` field of every packet.
/// A mismatch on receive means wire corruption or a foreign datagram and is fatal.
pub(crate) const PKT_FLAGS_MAGIC: u8 = 0xC3;

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Single-packet request.
    SmallReq = 0,

    /// Single-packet response.
    SmallResp = 1,

    /// First packet of a multi-packet request.
    LargeReqFirst = 2,

    /// Continuation packet of a multi-packet request.
    LargeReqCont = 3,

    /// First packet of a multi-packet response.
    LargeRespFirst = 4,

    /// Continuation packet of a multi-packet response, pulled by an `Rfr`.
    LargeRespCont = 5,

    /// Explicit credit return: cumulative acknowledgement of request packets.
    ExplCR = 6,

    /// Request for response: pulls one response packet by index.
    Rfr = 7,
}

impl From<u8> for PktType {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::SmallReq,
            1 => Self::SmallResp,
            2 => Self::LargeReqFirst,
            3 => Self::LargeReqCont,
            4 => Self::LargeRespFirst,
            5 => Self::LargeRespCont,
            6 => Self::ExplCR,
            7 => Self::Rfr,

            // SAFETY: only used by `PacketHeader::pkt_type()`, which will only
            // pass 3-bit values to this function.
            _ => unsafe { hint::unreachable_unchecked() },
        }
    }
}

/// Packet header, padded to one cache line (64 bytes).
///
/// `tail_len` is the payload length of the *final* packet of the message;
/// every earlier packet carries exactly `mtu - 64` bytes. Any packet of a
/// message therefore determines the total message length, which is what lets
/// the receiver allocate the reassembly buffer on whichever packet arrives
/// first.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | req_type     |
/// |   8 |  23 | dst_sess_id  |
/// |  24 |  87 | req_idx      |
/// |  88 |  90 | pkt_type     |
/// |  91 |  95 | (reserved)   |
/// |  96 | 103 | flags        |
/// | 104 | 119 | total_pkts   |
/// | 120 | 135 | this_pkt     |
/// | 136 | 151 | tail_len     |
/// | 152 | 511 | (padding)    |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PacketHeader {
    bits: bv::BitArr!(for 512),
}

impl PacketHeader {
    impl_accessor!(req_type, ReqType, 0, 7);
    impl_accessor!(dst_sess_id, SessId, 8, 23);
    impl_accessor!(req_idx, ReqIdx, 24, 87);
    impl_accessor!(pkt_type, PktType, u8, 88, 90);
    impl_accessor!(flags, u8, 96, 103);
    impl_accessor!(total_pkts, PktIdx, 104, 119);
    impl_accessor!(this_pkt, PktIdx, 120, 135);
    impl_accessor!(tail_len, u16, 136, 151);

    pub fn new(
        req_type: ReqType,
        dst_sess_id: SessId,
        req_idx: ReqIdx,
        pkt_type: PktType,
        total_pkts: PktIdx,
        this_pkt: PktIdx,
        tail_len: u16,
    ) -> Self {
        let mut this = Self::default();
        this.set_req_type(req_type);
        this.set_dst_sess_id(dst_sess_id);
        this.set_req_idx(req_idx);
        this.set_pkt_type(pkt_type);
        this.set_flags(PKT_FLAGS_MAGIC);
        this.set_total_pkts(total_pkts);
        this.set_this_pkt(this_pkt);
        this.set_tail_len(tail_len);
        this
    }

    /// Total length of the message this packet belongs to.
    #[inline(always)]
    pub fn msg_len(&self, max_data_per_pkt: usize) -> usize {
        (self.total_pkts() as usize - 1) * max_data_per_pkt + self.tail_len() as usize
    }

    /// Payload length of the packet at `pkt_idx` within this message.
    #[inline(always)]
    pub fn pkt_data_len(&self, pkt_idx: PktIdx, max_data_per_pkt: usize) -> usize {
        if pkt_idx + 1 == self.total_pkts() {
            self.tail_len() as usize
        } else {
            max_data_per_pkt
        }
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("req_type", &self.req_type())
            .field("dst_sess_id", &self.dst_sess_id())
            .field("req_idx", &self.req_idx())
            .field("pkt_type", &self.pkt_type())
            .field("total_pkts", &self.total_pkts())
            .field("this_pkt", &self.this_pkt())
            .field("tail_len", &self.tail_len())
            .finish()
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            bits: bv::BitArray::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_pkthdr_layout() {
        assert_eq!(mem::size_of::<PacketHeader>(), 64);
        assert_eq!(mem::align_of::<PacketHeader>() % 8, 0);
    }

    #[test]
    fn test_pkthdr_roundtrip() {
        let hdr = PacketHeader::new(42, 7, 0x1234_5678_9abc, PktType::LargeReqCont, 257, 19, 1000);
        assert_eq!(hdr.req_type(), 42);
        assert_eq!(hdr.dst_sess_id(), 7);
        assert_eq!(hdr.req_idx(), 0x1234_5678_9abc);
        assert_eq!(hdr.pkt_type(), PktType::LargeReqCont);
        assert_eq!(hdr.flags(), PKT_FLAGS_MAGIC);
        assert_eq!(hdr.total_pkts(), 257);
        assert_eq!(hdr.this_pkt(), 19);
        assert_eq!(hdr.tail_len(), 1000);
    }

    #[test]
    fn test_msg_len() {
        let max_data = 4032;
        let hdr = PacketHeader::new(0, 0, 0, PktType::LargeReqFirst, 3, 0, 100);
        assert_eq!(hdr.msg_len(max_data), 2 * max_data + 100);
        assert_eq!(hdr.pkt_data_len(0, max_data), max_data);
        assert_eq!(hdr.pkt_data_len(2, max_data), 100);

        let hdr = PacketHeader::new(0, 0, 0, PktType::SmallReq, 1, 0, 0);
        assert_eq!(hdr.msg_len(max_data), 0);
    }
}
