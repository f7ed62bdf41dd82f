//! Bounded transmit queue between host threads and the bridge actor.

use std::{
   collections::VecDeque,
   mem,
   time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::net::buffer::PacketBuf;

/// Fixed-depth FIFO of outbound packets.
///
/// Producers block while the queue is full, which is how backpressure
/// reaches the host stack. Whether the queue was empty before a push is
/// decided inside the queue's own critical section, so exactly one
/// producer per idle period observes the transition and wakes the
/// consumer.
pub struct TxQueue {
   inner: Mutex<VecDeque<PacketBuf>>,
   space: Condvar,
   capacity: usize,
   push_timeout: Duration,
}

impl TxQueue {
   pub fn new(capacity: usize, push_timeout: Duration) -> Self {
      assert!(capacity > 0, "queue capacity must be non-zero");
      Self {
         inner: Mutex::new(VecDeque::with_capacity(capacity)),
         space: Condvar::new(),
         capacity,
         push_timeout,
      }
   }

   /// Appends `packet`, blocking while the queue is full.
   ///
   /// `Ok(true)` means the queue was empty just before this push and the
   /// consumer needs a wakeup. If no slot frees up within the push
   /// timeout the packet comes back as `Err` for the caller to release.
   pub fn push(&self, packet: PacketBuf) -> Result<bool, PacketBuf> {
      let deadline = Instant::now() + self.push_timeout;
      let mut q = self.inner.lock();
      while q.len() >= self.capacity {
         if self.space.wait_until(&mut q, deadline).timed_out() {
            return Err(packet);
         }
      }
      let was_empty = q.is_empty();
      q.push_back(packet);
      Ok(was_empty)
   }

   /// Takes the oldest packet, if any, and frees one producer slot.
   pub fn try_pop(&self) -> Option<PacketBuf> {
      let mut q = self.inner.lock();
      let packet = q.pop_front();
      if packet.is_some() {
         self.space.notify_one();
      }
      packet
   }

   /// Releases every queued packet and returns how many there were.
   pub fn drain(&self) -> usize {
      let drained = {
         let mut q = self.inner.lock();
         let taken = mem::take(&mut *q);
         if !taken.is_empty() {
            self.space.notify_all();
         }
         taken
      };
      drained.len()
   }

   pub fn len(&self) -> usize {
      self.inner.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.inner.lock().is_empty()
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, thread};

   use super::*;
   use crate::net::buffer::{BufferPool, HeapPool};

   #[test]
   fn test_fifo_order_and_empty_transition() {
      let q = TxQueue::new(4, Duration::from_millis(100));
      assert!(q.push(PacketBuf::from_slice(&[1])).unwrap());
      assert!(!q.push(PacketBuf::from_slice(&[2])).unwrap());

      assert_eq!(q.try_pop().unwrap().to_vec(), vec![1]);
      assert!(!q.push(PacketBuf::from_slice(&[3])).unwrap());

      assert_eq!(q.try_pop().unwrap().to_vec(), vec![2]);
      assert_eq!(q.try_pop().unwrap().to_vec(), vec![3]);
      assert!(q.try_pop().is_none());

      assert!(q.push(PacketBuf::from_slice(&[4])).unwrap());
   }

   #[test]
   fn test_push_blocks_until_space() {
      let q = Arc::new(TxQueue::new(1, Duration::from_secs(5)));
      q.push(PacketBuf::from_slice(&[1])).unwrap();

      let producer = {
         let q = q.clone();
         thread::spawn(move || {
            let started = Instant::now();
            q.push(PacketBuf::from_slice(&[2])).unwrap();
            started.elapsed()
         })
      };

      thread::sleep(Duration::from_millis(50));
      assert_eq!(q.len(), 1);
      assert_eq!(q.try_pop().unwrap().to_vec(), vec![1]);

      let blocked_for = producer.join().unwrap();
      assert!(blocked_for >= Duration::from_millis(30));
      assert_eq!(q.try_pop().unwrap().to_vec(), vec![2]);
   }

   #[test]
   fn test_push_timeout_returns_packet() {
      let q = TxQueue::new(1, Duration::from_millis(50));
      q.push(PacketBuf::from_slice(&[1])).unwrap();

      let back = q.push(PacketBuf::from_slice(&[9])).unwrap_err();
      assert_eq!(back.to_vec(), vec![9]);
      assert_eq!(q.len(), 1);
   }

   #[test]
   fn test_drain_releases_everything() {
      let pool = HeapPool::new(64, 8);
      let q = TxQueue::new(8, Duration::from_millis(100));
      for _ in 0..3 {
         q.push(pool.alloc_chain(16).unwrap()).unwrap();
      }
      assert_eq!(pool.outstanding(), 3);

      assert_eq!(q.drain(), 3);
      assert_eq!(pool.outstanding(), 0);
      assert!(q.is_empty());
      assert_eq!(q.drain(), 0);
   }
}
