//! Interface descriptor shared between the bridge and the host stack.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use serde_json::json;
use smol_str::SmolStr;

use crate::{bridge::outbound::BridgeTx, net::buffer::PacketBuf};

/// Interface can carry link-layer broadcast.
pub const FLAG_BROADCAST: u8 = 1 << 0;
/// Interface participates in address resolution.
pub const FLAG_ARP: u8 = 1 << 1;
/// Interface is administratively enabled.
pub const FLAG_ADMIN_UP: u8 = 1 << 2;

/// Operational state of the bridged link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum LinkState {
   #[strum(serialize = "down")]
   Down,
   #[strum(serialize = "up")]
   Up,
}

impl LinkState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Packet counters for one interface.
///
/// Relaxed ordering is enough here, the counters are diagnostics and
/// never gate control flow.
#[derive(Debug, Default)]
pub struct NetifStats {
   tx_submitted: AtomicU64,
   tx_sent: AtomicU64,
   tx_dropped: AtomicU64,
   rx_delivered: AtomicU64,
   rx_dropped: AtomicU64,
}

/// Point-in-time copy of [`NetifStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
   pub tx_submitted: u64,
   pub tx_sent: u64,
   pub tx_dropped: u64,
   pub rx_delivered: u64,
   pub rx_dropped: u64,
}

impl NetifStats {
   pub fn count_tx_submitted(&self) {
      self.tx_submitted.fetch_add(1, Ordering::Relaxed);
   }

   pub fn count_tx_sent(&self) {
      self.tx_sent.fetch_add(1, Ordering::Relaxed);
   }

   pub fn count_tx_dropped(&self) {
      self.tx_dropped.fetch_add(1, Ordering::Relaxed);
   }

   pub fn count_rx_delivered(&self) {
      self.rx_delivered.fetch_add(1, Ordering::Relaxed);
   }

   pub fn count_rx_dropped(&self) {
      self.rx_dropped.fetch_add(1, Ordering::Relaxed);
   }

   pub fn snapshot(&self) -> StatsSnapshot {
      StatsSnapshot {
         tx_submitted: self.tx_submitted.load(Ordering::Relaxed),
         tx_sent: self.tx_sent.load(Ordering::Relaxed),
         tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
         rx_delivered: self.rx_delivered.load(Ordering::Relaxed),
         rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
      }
   }
}

impl StatsSnapshot {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "tx_submitted": self.tx_submitted,
          "tx_sent": self.tx_sent,
          "tx_dropped": self.tx_dropped,
          "rx_delivered": self.rx_delivered,
          "rx_dropped": self.rx_dropped,
      })
   }
}

/// The bridged network interface as the host stack sees it.
///
/// Link state and hardware address flip from the Bluetooth event context
/// while host threads read them, so both live in atomic cells.
pub struct Netif {
   name: SmolStr,
   mtu: u16,
   flags: u8,
   hwaddr: AtomicCell<Option<Address>>,
   state: AtomicCell<LinkState>,
   pub stats: NetifStats,
}

impl Netif {
   pub fn new(name: &str, mtu: u16) -> Self {
      Self {
         name: SmolStr::new(name),
         mtu,
         flags: FLAG_BROADCAST | FLAG_ARP | FLAG_ADMIN_UP,
         hwaddr: AtomicCell::new(None),
         state: AtomicCell::new(LinkState::Down),
         stats: NetifStats::default(),
      }
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn mtu(&self) -> u16 {
      self.mtu
   }

   pub fn flags(&self) -> u8 {
      self.flags
   }

   pub fn link_state(&self) -> LinkState {
      self.state.load()
   }

   pub fn is_up(&self) -> bool {
      self.link_state() == LinkState::Up
   }

   /// Address of the remote endpoint the interface is bridged to.
   ///
   /// The last value is retained after link-down for diagnostics.
   pub fn hwaddr(&self) -> Option<Address> {
      self.hwaddr.load()
   }

   /// Marks the link usable and records the remote's address as ours.
   pub fn set_link_up(&self, remote: Address) {
      self.hwaddr.store(Some(remote));
      self.state.store(LinkState::Up);
   }

   pub fn set_link_down(&self) {
      self.state.store(LinkState::Down);
   }
}

/// Returned by [`HostStack::input`] when the stack does not take a packet.
///
/// The chain rides back with the rejection so ownership stays single,
/// the caller releases it exactly once.
pub struct InputRejected {
   pub packet: PacketBuf,
   pub reason: &'static str,
}

/// The host network stack the bridge feeds.
pub trait HostStack: Send + Sync {
   /// Attaches an interface and hands over the transmit path for it.
   fn register_link(&self, netif: Arc<Netif>, output: BridgeTx, default_route: bool);

   /// Delivers one received packet to the stack, transferring ownership
   /// on success.
   fn input(&self, netif: &Netif, packet: PacketBuf) -> Result<(), InputRejected>;
}

pub type HostHandle = Arc<dyn HostStack>;
