//! BNEP channel types shared between the bridge and the transport.
//!
//! The bridge never talks to sockets directly. It sees a channel as an
//! opaque id plus a small command surface, and the transport reports
//! everything that happens on the channel as [`BnepEvent`]s.

use std::{fmt, num::NonZeroU16, sync::Arc};

use bluer::Address;
use smallvec::SmallVec;
use thiserror::Error;

pub type Frame = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) assigned to BNEP
pub const BNEP_PSM: u16 = 0x000F;
/// Minimum L2CAP MTU a BNEP channel must carry per the profile
pub const BNEP_MIN_MTU: usize = 1691;

/// Identifier of one established BNEP channel.
///
/// Ids are never zero and never reused within a transport's lifetime, so
/// a command carrying a stale id is detectable after reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ChannelId(NonZeroU16);

impl ChannelId {
   pub fn new(raw: u16) -> Option<Self> {
      NonZeroU16::new(raw).map(Self)
   }

   pub fn get(self) -> u16 {
      self.0.get()
   }
}

impl fmt::Display for ChannelId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}", self.0.get())
   }
}

/// Endpoints of an established channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
   pub channel: ChannelId,
   pub remote: Address,
   pub local: Address,
}

/// Why a channel attempt did not produce a usable link.
#[derive(Debug, Clone, Copy)]
pub struct OpenFailed {
   pub remote: Address,
   pub reason: &'static str,
}

/// Everything the transport reports to the bridge, in arrival order.
#[derive(Debug)]
pub enum BnepEvent {
   /// A connection attempt concluded.
   ChannelOpened(Result<ChannelInfo, OpenFailed>),
   /// The current channel is gone. Safe to deliver twice.
   ChannelClosed,
   /// One previously requested send permission arrived.
   CreditGranted,
   /// One Ethernet frame arrived from the remote.
   DataReceived(Frame),
}

/// Send-path failures surfaced by [`BnepStack::send_frame`].
#[derive(Debug, Error)]
pub enum TxError {
   #[error("no BNEP session")]
   NoSession,
   #[error("transport backlogged")]
   Backlogged,
}

/// Command surface of the Bluetooth transport.
///
/// All methods are non-blocking. Effects and answers come back through
/// the event feed.
pub trait BnepStack: Send + Sync {
   /// Asks for one send permission on `channel`. The transport answers
   /// with [`BnepEvent::CreditGranted`] when the channel can take a frame.
   fn request_credit(&self, channel: ChannelId);

   /// Hands one complete frame to the transport for transmission.
   fn send_frame(&self, channel: ChannelId, frame: &[u8]) -> Result<(), TxError>;

   /// Largest frame the transport accepts in one send.
   fn frame_limit(&self) -> usize;

   /// Address of the local adapter, once known.
   fn local_address(&self) -> Option<Address>;
}

pub type StackHandle = Arc<dyn BnepStack>;
