use std::ptr::NonNull;
use std::{cmp, mem, slice};

use crate::pkthdr::*;
use crate::transport::LKey;
use crate::util::{buffer::*, likely::*, math::*};

/// A zero-copy message buffer.
///
/// The application-visible payload is a contiguous region; packet headers
/// live in reserved slots of the same backing buffer, one immediately before
/// the payload and the rest after it, so the transport never needs a copy to
/// prepend a header and header bytes never overlap payload bytes.
pub struct MsgBuf {
    /// Pointer to the first *application data* byte.
    data: NonNull<u8>,

    /// Max data bytes in the MsgBuf.
    max_len: usize,

    /// Valid data bytes in the MsgBuf.
    len: usize,

    /// Max number of packets in the MsgBuf.
    max_pkts: usize,

    /// Backing buffer.
    buffer: Buffer,
}

/// Protected methods.
impl MsgBuf {
    /// Create a new MsgBuf on an owned buffer.
    pub(crate) fn owned(buf: Buffer, data_len: usize, max_data_per_pkt: usize) -> Self {
        let max_pkts = num_pkts(data_len, max_data_per_pkt);

        let overall_len = roundup(data_len, 8) + max_pkts * mem::size_of::<PacketHeader>();
        assert!(
            overall_len <= buf.len(),
            "buffer too small: {} < {}",
            buf.len(),
            overall_len
        );

        Self {
            // SAFETY: guaranteed not null; the first header slot precedes the data.
            data: unsafe { NonNull::new_unchecked(buf.as_ptr().add(mem::size_of::<PacketHeader>())) },
            max_pkts,
            max_len: data_len,
            len: data_len,
            buffer: buf,
        }
    }

    /// Create a new MsgBuf on a not-owned buffer.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a valid `PacketHeader` slot right before `len`
    /// bytes of accessible application data.
    pub(crate) unsafe fn borrowed(hdr: NonNull<u8>, len: usize, lkey: LKey) -> Self {
        Self {
            data: NonNull::new_unchecked(hdr.as_ptr().add(mem::size_of::<PacketHeader>())),
            max_pkts: 1,
            max_len: len,
            len,
            buffer: Buffer::fake(lkey),
        }
    }

    /// Create a borrowed alias of this MsgBuf that shares the same memory.
    ///
    /// The alias spans the full capacity and does not keep the backing buffer
    /// alive; the caller must ensure the original outlives every alias.
    pub(crate) fn clone_borrowed(&self) -> MsgBuf {
        Self {
            data: self.data,
            max_pkts: 1,
            max_len: self.max_len,
            len: self.max_len,
            buffer: Buffer::fake(self.lkey()),
        }
    }

    /// Get a pointer to a packet header slot.
    #[inline]
    pub(crate) fn pkt_hdr(&self, pkt_idx: usize) -> *mut PacketHeader {
        debug_assert!(
            pkt_idx < self.max_pkts,
            "invalid packet index: max {}, got {}",
            self.max_pkts - 1,
            pkt_idx
        );

        // SAFETY: header slots and application data live in the same allocated buffer.
        let hdr = unsafe {
            if likely(pkt_idx == 0) {
                self.data.as_ptr().sub(mem::size_of::<PacketHeader>())
            } else {
                self.data
                    .as_ptr()
                    .add(roundup(self.max_len, 8) + (pkt_idx - 1) * mem::size_of::<PacketHeader>())
            }
        };
        debug_assert!(
            (hdr as usize) % mem::align_of::<PacketHeader>() == 0,
            "misaligned header"
        );
        hdr as _
    }

    /// Get the wire size (header + payload) of a packet.
    #[inline]
    pub(crate) fn pkt_size(&self, pkt_idx: usize, max_data_per_pkt: usize) -> usize {
        debug_assert!(
            pkt_idx < self.max_pkts,
            "invalid packet index: max {}, got {}",
            self.max_pkts - 1,
            pkt_idx
        );

        let offset = pkt_idx * max_data_per_pkt;
        mem::size_of::<PacketHeader>() + cmp::min(max_data_per_pkt, self.len - offset)
    }

    /// Get the memory handle of the backing buffer.
    #[inline(always)]
    pub(crate) fn lkey(&self) -> LKey {
        self.buffer.lkey()
    }
}

/// Public methods.
impl MsgBuf {
    /// Return a pointer to the first *application data* byte.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Return the length of application data.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if the buffer holds no application data.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the capacity of application data.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Set the application data length of the message buffer.
    ///
    /// # Panics
    ///
    /// Panic if `len` is larger than the capacity.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.max_len,
            "len {} > MsgBuf capacity {}",
            len,
            self.max_len
        );
        self.len = len;
    }

    /// View the application data as a `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`std::slice::from_raw_parts()`].
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// View the application data as a mutable `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`std::slice::from_raw_parts_mut()`].
    #[inline(always)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::{ActiveTransport, UnreliableTransport};
    use crate::util::buddy::BuddyAllocator;
    use std::rc::Rc;

    fn alloc_msgbuf(len: usize) -> MsgBuf {
        let mut tp = ActiveTransport::new("127.0.0.1", 1, &Config::default()).unwrap();
        let allocator = Rc::new(BuddyAllocator::new(None));
        let max_data = tp.max_data_per_pkt();
        let max_pkts = num_pkts(len, max_data);
        let overall = roundup(len, 8) + max_pkts * mem::size_of::<PacketHeader>();
        let buf = allocator.alloc(overall, &mut tp).unwrap();
        MsgBuf::owned(buf, len, max_data)
    }

    /// Header slots must never overlap the payload region.
    #[test]
    fn headers_do_not_overlap_payload() {
        let max_data = 4096 - mem::size_of::<PacketHeader>();
        let len = 3 * max_data + 17;
        let msgbuf = alloc_msgbuf(len);

        let data_start = msgbuf.as_ptr() as usize;
        let data_end = data_start + len;
        for i in 0..4 {
            let hdr_start = msgbuf.pkt_hdr(i) as usize;
            let hdr_end = hdr_start + mem::size_of::<PacketHeader>();
            assert!(hdr_end <= data_start || hdr_start >= data_end);
        }
    }

    #[test]
    fn zero_len_has_one_packet() {
        let msgbuf = alloc_msgbuf(0);
        assert_eq!(msgbuf.len(), 0);
        assert_eq!(msgbuf.max_pkts, 1);
        assert_eq!(
            msgbuf.pkt_size(0, 4032),
            mem::size_of::<PacketHeader>()
        );
    }

    #[test]
    fn shrink_len() {
        let mut msgbuf = alloc_msgbuf(1024);
        msgbuf.set_len(10);
        assert_eq!(msgbuf.len(), 10);
        assert_eq!(msgbuf.capacity(), 1024);
    }

    #[test]
    #[should_panic]
    fn grow_past_capacity_panics() {
        let mut msgbuf = alloc_msgbuf(16);
        msgbuf.set_len(17);
    }
}
