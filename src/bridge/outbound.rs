//! Credit-paced outbound path from the host stack to the BNEP channel.

use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::{
   bluetooth::bnep::{BnepStack, ChannelId},
   bridge::{link::BridgeCommand, queue::TxQueue},
   net::{buffer::PacketBuf, netif::Netif},
};

/// Transmit entry point handed to the host stack at registration.
///
/// Callable from any host thread. It only touches the queue and the
/// actor inbox, never the channel handle, so it has no idea whether a
/// link exists and does not need one.
#[derive(Clone)]
pub struct BridgeTx {
   queue: Arc<TxQueue>,
   inbox: mpsc::Sender<BridgeCommand>,
   netif: Arc<Netif>,
}

impl BridgeTx {
   pub(crate) fn new(
      queue: Arc<TxQueue>,
      inbox: mpsc::Sender<BridgeCommand>,
      netif: Arc<Netif>,
   ) -> Self {
      Self { queue, inbox, netif }
   }

   /// Queues one packet for transmission, taking ownership.
   ///
   /// Blocks while the queue is full. Only the push that finds the queue
   /// empty posts a wakeup, later pushes ride on the processing cycle
   /// that wakeup started.
   pub fn submit(&self, packet: PacketBuf) {
      self.netif.stats.count_tx_submitted();
      match self.queue.push(packet) {
         Ok(true) => {
            if let Err(e) = self.inbox.try_send(BridgeCommand::ProcessOutgoing) {
               warn!("Channel overflow sending queue wakeup: {e}");
            }
         },
         Ok(false) => {},
         Err(packet) => {
            error!(
               "Transmit queue stalled on {}, dropping {} byte packet",
               self.netif.name(),
               packet.total_len()
            );
            self.netif.stats.count_tx_dropped();
         },
      }
   }
}

/// Consumer half of the outbound path, owned by the bridge actor.
///
/// Holds the in-flight slot: at most one packet is ever waiting on a
/// credit, and a new credit is requested only while the slot is empty.
pub struct Outbound {
   queue: Arc<TxQueue>,
   in_flight: Option<PacketBuf>,
   scratch: Box<[u8]>,
   netif: Arc<Netif>,
}

impl Outbound {
   pub fn new(queue: Arc<TxQueue>, netif: Arc<Netif>, frame_limit: usize) -> Self {
      Self {
         queue,
         in_flight: None,
         scratch: vec![0u8; frame_limit].into_boxed_slice(),
         netif,
      }
   }

   /// Starts one send cycle if none is in progress.
   ///
   /// Moves the oldest queued packet into the in-flight slot and asks
   /// the transport for a credit. With the slot occupied a request is
   /// already outstanding and this does nothing.
   pub fn on_channel_ready(&mut self, stack: &dyn BnepStack, channel: ChannelId) {
      if self.in_flight.is_some() {
         return;
      }
      if let Some(packet) = self.queue.try_pop() {
         self.in_flight = Some(packet);
         stack.request_credit(channel);
      }
   }

   /// Spends one granted credit on the in-flight packet.
   ///
   /// The packet is copied into the scratch wire buffer, bounded by the
   /// transport's frame limit, handed to the transport, and released
   /// whatever the send outcome. If more packets are queued the next
   /// cycle starts immediately.
   pub fn on_credit_granted(&mut self, stack: &dyn BnepStack, channel: ChannelId) {
      let Some(packet) = self.in_flight.take() else {
         error!("Credit granted with no packet in flight, ignoring");
         return;
      };

      let total = packet.total_len();
      let copied = packet.copy_to(&mut self.scratch);
      if copied < total {
         debug!("Truncating {total} byte packet to {copied} byte frame limit");
      }

      match stack.send_frame(channel, &self.scratch[..copied]) {
         Ok(()) => self.netif.stats.count_tx_sent(),
         Err(e) => {
            warn!("Frame send failed on channel {channel}: {e}");
            self.netif.stats.count_tx_dropped();
         },
      }
      drop(packet);

      if !self.queue.is_empty() {
         self.on_channel_ready(stack, channel);
      }
   }

   /// Releases the in-flight slot and every queued packet.
   pub fn drain(&mut self) -> usize {
      let mut released = self.queue.drain();
      if self.in_flight.take().is_some() {
         released += 1;
      }
      for _ in 0..released {
         self.netif.stats.count_tx_dropped();
      }
      released
   }

   pub fn has_in_flight(&self) -> bool {
      self.in_flight.is_some()
   }

   pub fn queued(&self) -> usize {
      self.queue.len()
   }
}

#[cfg(test)]
mod tests {
   use std::{
      sync::atomic::{AtomicBool, Ordering},
      time::Duration,
   };

   use bluer::Address;
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      bluetooth::bnep::TxError,
      net::buffer::{BufferPool, HeapPool},
   };

   struct MockStack {
      credit_requests: Mutex<Vec<ChannelId>>,
      sent: Mutex<Vec<Vec<u8>>>,
      limit: usize,
      fail_sends: AtomicBool,
   }

   impl MockStack {
      fn new(limit: usize) -> Self {
         Self {
            credit_requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            limit,
            fail_sends: AtomicBool::new(false),
         }
      }

      fn requests(&self) -> usize {
         self.credit_requests.lock().len()
      }

      fn sent(&self) -> Vec<Vec<u8>> {
         self.sent.lock().clone()
      }
   }

   impl BnepStack for MockStack {
      fn request_credit(&self, channel: ChannelId) {
         self.credit_requests.lock().push(channel);
      }

      fn send_frame(&self, _channel: ChannelId, frame: &[u8]) -> Result<(), TxError> {
         if self.fail_sends.load(Ordering::Relaxed) {
            return Err(TxError::NoSession);
         }
         self.sent.lock().push(frame.to_vec());
         Ok(())
      }

      fn frame_limit(&self) -> usize {
         self.limit
      }

      fn local_address(&self) -> Option<Address> {
         None
      }
   }

   fn fixture(
      capacity: usize,
      limit: usize,
   ) -> (Arc<TxQueue>, Arc<Netif>, Outbound, MockStack, ChannelId) {
      let queue = Arc::new(TxQueue::new(capacity, Duration::from_millis(100)));
      let netif = Arc::new(Netif::new("bt0", 1600));
      let outbound = Outbound::new(queue.clone(), netif.clone(), limit);
      let stack = MockStack::new(limit);
      let channel = ChannelId::new(0x41).unwrap();
      (queue, netif, outbound, stack, channel)
   }

   #[test]
   fn test_three_packet_fifo_cycle() {
      let (queue, netif, mut outbound, stack, channel) = fixture(8, 64);
      for byte in [1u8, 2, 3] {
         queue.push(PacketBuf::from_slice(&[byte])).unwrap();
      }

      outbound.on_channel_ready(&stack, channel);
      assert!(outbound.has_in_flight());
      assert_eq!(stack.requests(), 1);

      outbound.on_channel_ready(&stack, channel);
      assert_eq!(stack.requests(), 1);

      outbound.on_credit_granted(&stack, channel);
      outbound.on_credit_granted(&stack, channel);
      outbound.on_credit_granted(&stack, channel);

      assert_eq!(stack.sent(), vec![vec![1], vec![2], vec![3]]);
      assert_eq!(stack.requests(), 3);
      assert!(!outbound.has_in_flight());
      assert!(queue.is_empty());
      assert_eq!(netif.stats.snapshot().tx_sent, 3);
   }

   #[test]
   fn test_credit_without_request_is_ignored() {
      let (_queue, netif, mut outbound, stack, channel) = fixture(8, 64);

      outbound.on_credit_granted(&stack, channel);
      assert!(stack.sent().is_empty());
      assert_eq!(stack.requests(), 0);
      assert_eq!(netif.stats.snapshot().tx_sent, 0);
   }

   #[test]
   fn test_send_bounded_by_frame_limit() {
      let (queue, _netif, mut outbound, stack, channel) = fixture(8, 8);
      queue
         .push(PacketBuf::from_slice(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]))
         .unwrap();

      outbound.on_channel_ready(&stack, channel);
      outbound.on_credit_granted(&stack, channel);
      assert_eq!(stack.sent(), vec![vec![0, 1, 2, 3, 4, 5, 6, 7]]);
   }

   #[test]
   fn test_fragmented_packet_sent_in_order() {
      let (queue, _netif, mut outbound, stack, channel) = fixture(8, 64);
      let pool = HeapPool::new(4, 4);
      let mut packet = pool.alloc_chain(10).unwrap();
      let mut byte = 0u8;
      for seg in packet.segments_mut() {
         for b in seg.payload_mut() {
            *b = byte;
            byte += 1;
         }
      }
      queue.push(packet).unwrap();

      outbound.on_channel_ready(&stack, channel);
      outbound.on_credit_granted(&stack, channel);
      assert_eq!(stack.sent(), vec![vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]]);
      assert_eq!(pool.outstanding(), 0);
   }

   #[test]
   fn test_send_failure_releases_and_continues() {
      let (queue, netif, mut outbound, stack, channel) = fixture(8, 64);
      let pool = HeapPool::new(64, 4);
      queue.push(pool.alloc_chain(4).unwrap()).unwrap();
      queue.push(pool.alloc_chain(4).unwrap()).unwrap();
      stack.fail_sends.store(true, Ordering::Relaxed);

      outbound.on_channel_ready(&stack, channel);
      outbound.on_credit_granted(&stack, channel);

      assert!(stack.sent().is_empty());
      assert_eq!(pool.outstanding(), 1);
      assert_eq!(stack.requests(), 2);
      assert!(outbound.has_in_flight());
      assert_eq!(netif.stats.snapshot().tx_dropped, 1);
   }

   #[test]
   fn test_drain_releases_slot_and_queue() {
      let (queue, netif, mut outbound, stack, channel) = fixture(8, 64);
      let pool = HeapPool::new(64, 4);
      for _ in 0..3 {
         queue.push(pool.alloc_chain(8).unwrap()).unwrap();
      }

      outbound.on_channel_ready(&stack, channel);
      assert!(outbound.has_in_flight());
      assert_eq!(pool.outstanding(), 3);

      assert_eq!(outbound.drain(), 3);
      assert!(!outbound.has_in_flight());
      assert!(queue.is_empty());
      assert_eq!(pool.outstanding(), 0);
      assert_eq!(netif.stats.snapshot().tx_dropped, 3);
   }

   #[test]
   fn test_submit_wakes_only_on_empty_transition() {
      let queue = Arc::new(TxQueue::new(4, Duration::from_millis(100)));
      let netif = Arc::new(Netif::new("bt0", 1600));
      let (inbox_tx, mut inbox_rx) = mpsc::channel(8);
      let tx = BridgeTx::new(queue.clone(), inbox_tx, netif.clone());

      tx.submit(PacketBuf::from_slice(&[1]));
      assert!(matches!(inbox_rx.try_recv(), Ok(BridgeCommand::ProcessOutgoing)));

      tx.submit(PacketBuf::from_slice(&[2]));
      assert!(inbox_rx.try_recv().is_err());

      assert_eq!(queue.len(), 2);
      assert_eq!(netif.stats.snapshot().tx_submitted, 2);
   }
}
