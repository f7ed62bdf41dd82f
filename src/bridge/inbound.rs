//! Inbound frame reassembly into host stack buffers.

use std::sync::Arc;

use log::{error, warn};

use crate::net::{
   buffer::{BufferPool, PoolHandle},
   netif::{HostHandle, HostStack, Netif},
};

/// Rebuilds received frames into pooled chains and feeds the host stack.
///
/// Runs entirely in the bridge actor. Every failure mode ends with the
/// frame dropped and counted, never with an error back to the transport.
pub struct Inbound {
   pool: PoolHandle,
   host: HostHandle,
   netif: Arc<Netif>,
}

impl Inbound {
   pub fn new(pool: PoolHandle, host: HostHandle, netif: Arc<Netif>) -> Self {
      Self { pool, host, netif }
   }

   /// Copies one raw frame into a freshly allocated chain and delivers it.
   pub fn deliver(&self, frame: &[u8]) {
      let Some(mut packet) = self.pool.alloc_chain(frame.len()) else {
         warn!("No buffer for {} byte inbound frame, dropping", frame.len());
         self.netif.stats.count_rx_dropped();
         return;
      };

      let mut remaining = frame.len();
      let mut offset = 0;
      for seg in packet.segments_mut() {
         if remaining == 0 {
            break;
         }
         let take = seg.len().min(remaining);
         seg.payload_mut()[..take].copy_from_slice(&frame[offset..offset + take]);
         offset += take;
         remaining -= take;
      }
      if remaining != 0 {
         error!(
            "Inbound copy shortfall, {offset} of {} bytes placed, discarding frame",
            frame.len()
         );
         self.netif.stats.count_rx_dropped();
         return;
      }

      match self.host.input(&self.netif, packet) {
         Ok(()) => self.netif.stats.count_rx_delivered(),
         Err(rejected) => {
            error!(
               "Host stack refused {} byte frame: {}",
               rejected.packet.total_len(),
               rejected.reason
            );
            self.netif.stats.count_rx_dropped();
         },
      }
   }

   /// Chains currently out with the host stack, for diagnostics.
   pub fn pool_outstanding(&self) -> usize {
      self.pool.outstanding()
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, Ordering};

   use parking_lot::Mutex;

   use super::*;
   use crate::{
      bridge::outbound::BridgeTx,
      net::{
         buffer::{HeapPool, PacketBuf},
         netif::InputRejected,
      },
   };

   #[derive(Default)]
   struct MockHost {
      delivered: Mutex<Vec<Vec<u8>>>,
      refuse: AtomicBool,
   }

   impl HostStack for MockHost {
      fn register_link(&self, _netif: Arc<Netif>, _output: BridgeTx, _default_route: bool) {}

      fn input(&self, _netif: &Netif, packet: PacketBuf) -> Result<(), InputRejected> {
         if self.refuse.load(Ordering::Relaxed) {
            return Err(InputRejected {
               packet,
               reason: "refused",
            });
         }
         self.delivered.lock().push(packet.to_vec());
         Ok(())
      }
   }

   fn fixture(
      segment: usize,
      buffers: usize,
   ) -> (Arc<HeapPool>, Arc<MockHost>, Arc<Netif>, Inbound) {
      let pool = Arc::new(HeapPool::new(segment, buffers));
      let host = Arc::new(MockHost::default());
      let netif = Arc::new(Netif::new("bt0", 1600));
      let inbound = Inbound::new(pool.clone(), host.clone(), netif.clone());
      (pool, host, netif, inbound)
   }

   #[test]
   fn test_multi_segment_frame_reconstructed() {
      let (pool, host, netif, inbound) = fixture(4, 4);
      let frame: Vec<u8> = (0u8..10).collect();

      inbound.deliver(&frame);

      assert_eq!(host.delivered.lock().as_slice(), &[frame]);
      assert_eq!(pool.outstanding(), 0);
      assert_eq!(netif.stats.snapshot().rx_delivered, 1);
   }

   #[test]
   fn test_allocation_failure_drops_frame() {
      let (pool, host, netif, inbound) = fixture(64, 1);
      let held = pool.alloc_chain(8).unwrap();

      inbound.deliver(&[1, 2, 3]);

      assert!(host.delivered.lock().is_empty());
      assert_eq!(netif.stats.snapshot().rx_dropped, 1);
      assert_eq!(pool.outstanding(), 1);
      drop(held);
      assert_eq!(pool.outstanding(), 0);
   }

   #[test]
   fn test_host_rejection_releases_once() {
      let (pool, host, netif, inbound) = fixture(64, 4);
      host.refuse.store(true, Ordering::Relaxed);

      inbound.deliver(&[1, 2, 3, 4]);

      assert!(host.delivered.lock().is_empty());
      assert_eq!(pool.outstanding(), 0);
      assert_eq!(netif.stats.snapshot().rx_dropped, 1);
      assert_eq!(netif.stats.snapshot().rx_delivered, 0);
   }

   #[test]
   fn test_empty_frame_is_delivered() {
      let (pool, host, _netif, inbound) = fixture(16, 4);

      inbound.deliver(&[]);

      assert_eq!(host.delivered.lock().as_slice(), &[Vec::<u8>::new()]);
      assert_eq!(pool.outstanding(), 0);
   }
}
