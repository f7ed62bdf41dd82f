//! Chained packet buffers and their backing pool.
//!
//! Packets cross the bridge as chains of fixed-size segments rather than
//! one contiguous allocation. A chain is owned by exactly one holder at a
//! time and is released by dropping it, so there is no reference counting
//! to get wrong across thread boundaries.

use std::{
   fmt,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use smallvec::SmallVec;

/// One fixed-capacity slice of packet payload.
///
/// `len` is the filled prefix of `data`; the remainder is scratch left
/// over from the pool's segment size.
pub struct Segment {
   data: Box<[u8]>,
   len: usize,
}

impl Segment {
   fn with_capacity(capacity: usize, len: usize) -> Self {
      debug_assert!(len <= capacity);
      Self {
         data: vec![0u8; capacity].into_boxed_slice(),
         len,
      }
   }

   /// Filled payload bytes of this segment.
   pub fn payload(&self) -> &[u8] {
      &self.data[..self.len]
   }

   /// Mutable view of the filled payload, for staged fills.
   pub fn payload_mut(&mut self) -> &mut [u8] {
      &mut self.data[..self.len]
   }

   pub fn len(&self) -> usize {
      self.len
   }
}

impl fmt::Debug for Segment {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Segment")
         .field("len", &self.len)
         .field("capacity", &self.data.len())
         .finish()
   }
}

/// An owned chain of segments holding one packet.
///
/// Chains are move-only: handing a packet to the queue or to the host
/// stack transfers ownership, and dropping the chain returns its lease
/// to the pool that allocated it. Most packets fit one segment, hence
/// the inline capacity.
pub struct PacketBuf {
   segments: SmallVec<[Segment; 1]>,
   lease: Option<PoolLease>,
}

impl PacketBuf {
   /// Builds an unpooled single-segment packet from `data`.
   ///
   /// Used by host stack adapters that copy straight out of a socket
   /// and by tests. An empty slice yields an empty chain.
   pub fn from_slice(data: &[u8]) -> Self {
      let mut segments = SmallVec::new();
      if !data.is_empty() {
         let mut seg = Segment::with_capacity(data.len(), data.len());
         seg.payload_mut().copy_from_slice(data);
         segments.push(seg);
      }
      Self {
         segments,
         lease: None,
      }
   }

   /// Total payload length across all segments.
   pub fn total_len(&self) -> usize {
      self.segments.iter().map(Segment::len).sum()
   }

   /// Segments in payload order.
   pub fn segments(&self) -> &[Segment] {
      &self.segments
   }

   /// Mutable segments, for filling a freshly allocated chain.
   pub fn segments_mut(&mut self) -> &mut [Segment] {
      &mut self.segments
   }

   /// Copies the chain's payload into `dst`, concatenating segments.
   ///
   /// Copies at most `dst.len()` bytes and returns the number copied,
   /// so a caller with a bounded wire buffer gets a truncated packet
   /// rather than a panic.
   pub fn copy_to(&self, dst: &mut [u8]) -> usize {
      let mut copied = 0;
      for seg in &self.segments {
         if copied == dst.len() {
            break;
         }
         let take = seg.len().min(dst.len() - copied);
         dst[copied..copied + take].copy_from_slice(&seg.payload()[..take]);
         copied += take;
      }
      copied
   }

   /// Contiguous copy of the whole payload.
   pub fn to_vec(&self) -> Vec<u8> {
      let mut out = Vec::with_capacity(self.total_len());
      for seg in &self.segments {
         out.extend_from_slice(seg.payload());
      }
      out
   }
}

impl fmt::Debug for PacketBuf {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PacketBuf")
         .field("segments", &self.segments.len())
         .field("total_len", &self.total_len())
         .field("pooled", &self.lease.is_some())
         .finish()
   }
}

/// Allocator for inbound packet chains.
///
/// Allocation is fallible under memory pressure; callers drop the frame
/// and count it rather than blocking the event context.
pub trait BufferPool: Send + Sync {
   /// Allocates a chain with exactly `len` payload bytes, segmented by
   /// the pool's granularity. Returns `None` when the pool is exhausted.
   fn alloc_chain(&self, len: usize) -> Option<PacketBuf>;

   /// Number of chains currently leased out.
   fn outstanding(&self) -> usize;
}

pub type PoolHandle = Arc<dyn BufferPool>;

struct PoolShared {
   outstanding: AtomicUsize,
}

/// Keeps the pool's outstanding count honest while a chain is alive.
pub struct PoolLease {
   shared: Arc<PoolShared>,
}

impl Drop for PoolLease {
   fn drop(&mut self) {
      self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
   }
}

/// Heap-backed pool with a fixed segment size and a buffer cap.
///
/// The cap bounds how many chains may be live at once, standing in for
/// the fixed buffer memory an embedded pool would carve up.
pub struct HeapPool {
   segment_size: usize,
   max_buffers: usize,
   shared: Arc<PoolShared>,
}

impl HeapPool {
   pub fn new(segment_size: usize, max_buffers: usize) -> Self {
      assert!(segment_size > 0, "segment size must be non-zero");
      Self {
         segment_size,
         max_buffers,
         shared: Arc::new(PoolShared {
            outstanding: AtomicUsize::new(0),
         }),
      }
   }
}

impl BufferPool for HeapPool {
   fn alloc_chain(&self, len: usize) -> Option<PacketBuf> {
      let mut count = self.shared.outstanding.load(Ordering::Acquire);
      loop {
         if count >= self.max_buffers {
            return None;
         }
         match self.shared.outstanding.compare_exchange_weak(
            count,
            count + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
         ) {
            Ok(_) => break,
            Err(actual) => count = actual,
         }
      }

      let mut segments = SmallVec::new();
      let mut remaining = len;
      while remaining > 0 {
         let seg_len = remaining.min(self.segment_size);
         segments.push(Segment::with_capacity(self.segment_size, seg_len));
         remaining -= seg_len;
      }
      Some(PacketBuf {
         segments,
         lease: Some(PoolLease {
            shared: self.shared.clone(),
         }),
      })
   }

   fn outstanding(&self) -> usize {
      self.shared.outstanding.load(Ordering::Acquire)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_chain_sizing_matches_request() {
      let pool = HeapPool::new(8, 4);
      let buf = pool.alloc_chain(17).unwrap();
      assert_eq!(buf.total_len(), 17);
      let lens: Vec<usize> = buf.segments().iter().map(Segment::len).collect();
      assert_eq!(lens, vec![8, 8, 1]);

      let empty = pool.alloc_chain(0).unwrap();
      assert_eq!(empty.total_len(), 0);
      assert!(empty.segments().is_empty());
   }

   #[test]
   fn test_copy_to_is_bounded() {
      let pool = HeapPool::new(4, 4);
      let mut buf = pool.alloc_chain(10).unwrap();
      let mut byte = 0u8;
      for seg in buf.segments_mut() {
         for b in seg.payload_mut() {
            *b = byte;
            byte += 1;
         }
      }

      let mut exact = [0u8; 10];
      assert_eq!(buf.copy_to(&mut exact), 10);
      assert_eq!(exact, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

      let mut short = [0u8; 6];
      assert_eq!(buf.copy_to(&mut short), 6);
      assert_eq!(short, [0, 1, 2, 3, 4, 5]);

      let mut long = [0xffu8; 16];
      assert_eq!(buf.copy_to(&mut long), 10);
      assert_eq!(&long[10..], &[0xff; 6]);
   }

   #[test]
   fn test_pool_exhaustion_and_release() {
      let pool = HeapPool::new(64, 2);
      let a = pool.alloc_chain(10).unwrap();
      let b = pool.alloc_chain(10).unwrap();
      assert_eq!(pool.outstanding(), 2);
      assert!(pool.alloc_chain(10).is_none());

      drop(a);
      assert_eq!(pool.outstanding(), 1);
      let c = pool.alloc_chain(128).unwrap();
      assert_eq!(c.segments().len(), 2);
      assert_eq!(pool.outstanding(), 2);

      drop(b);
      drop(c);
      assert_eq!(pool.outstanding(), 0);
   }

   #[test]
   fn test_from_slice_is_unpooled() {
      let buf = PacketBuf::from_slice(&[1, 2, 3]);
      assert_eq!(buf.total_len(), 3);
      assert_eq!(buf.to_vec(), vec![1, 2, 3]);

      let empty = PacketBuf::from_slice(&[]);
      assert_eq!(empty.total_len(), 0);
      assert!(empty.segments().is_empty());
   }
}
