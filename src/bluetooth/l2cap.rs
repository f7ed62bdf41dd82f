//! BNEP transport over an L2CAP seq-packet socket.
//!
//! This module owns the socket and all connection state. The bridge
//! talks to it through the [`BnepStack`] command surface and hears back
//! through the event feed, so channel lifetime never leaks outside the
//! driver task.

use std::{future::Future, sync::Arc, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, AddressType, Session,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use crossbeam::atomic::AtomicCell;
use futures::{Stream, stream::StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::{
   select,
   sync::mpsc::{self, error::TrySendError},
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   bluetooth::bnep::{
      BNEP_MIN_MTU, BnepEvent, BnepStack, ChannelId, ChannelInfo, Frame, OpenFailed, TxError,
   },
   bridge::link::EventFeed,
   config::Config,
   error::{BridgeError, Result},
};

/// Command buffer between the bridge actor and the driver task
const CMD_BUFFER_SIZE: usize = 128;
/// Ethernet header length, the interesting prefix for frame logging
const ETH_HDR_LEN: usize = 14;
/// How often the known-device list is re-polled while waiting for the peer
const PEER_POLL_INTERVAL: Duration = Duration::from_secs(5);

static PAN_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x00001115_0000_1000_8000_00805f9b34fb), // PANU
   Uuid::from_u128(0x00001116_0000_1000_8000_00805f9b34fb), // NAP
   Uuid::from_u128(0x00001117_0000_1000_8000_00805f9b34fb), // GN
];

enum LinkCmd {
   RequestCredit { channel: ChannelId },
   Send { channel: ChannelId, frame: Frame },
}

enum SessionEnd {
   /// Connection dropped, worth reconnecting.
   Lost,
   /// Bridge side is gone, stop for good.
   Shutdown,
}

/// Command half of the transport, shared with the bridge actor.
pub struct PanTransport {
   cmd_tx: mpsc::Sender<LinkCmd>,
   local: AtomicCell<Option<Address>>,
   frame_limit: usize,
}

impl PanTransport {
   /// Creates the shared command handle and the driver that serves it.
   pub fn new(config: &Config, peer: Address) -> (Arc<Self>, TransportDriver) {
      let (cmd_tx, cmd_rx) = mpsc::channel(CMD_BUFFER_SIZE);
      let shared = Arc::new(Self {
         cmd_tx,
         local: AtomicCell::new(None),
         frame_limit: BNEP_MIN_MTU,
      });
      let driver = TransportDriver {
         peer,
         psm: config.psm,
         connect_timeout: config.connect_timeout(),
         max_retry_delay: Duration::from_secs(config.reconnect_max_delay_secs),
         channel_seq: 0,
         cmd_rx,
         shared: shared.clone(),
      };
      (shared, driver)
   }
}

impl BnepStack for PanTransport {
   fn request_credit(&self, channel: ChannelId) {
      if let Err(e) = self.cmd_tx.try_send(LinkCmd::RequestCredit { channel }) {
         warn!("Channel overflow sending credit request: {e}");
      }
   }

   fn send_frame(&self, channel: ChannelId, frame: &[u8]) -> std::result::Result<(), TxError> {
      self
         .cmd_tx
         .try_send(LinkCmd::Send {
            channel,
            frame: Frame::from_slice(frame),
         })
         .map_err(|e| match e {
            TrySendError::Full(_) => TxError::Backlogged,
            TrySendError::Closed(_) => TxError::NoSession,
         })
   }

   fn frame_limit(&self) -> usize {
      self.frame_limit
   }

   fn local_address(&self) -> Option<Address> {
      self.local.load()
   }
}

/// Owns the connection lifecycle: find the peer, connect, pump frames,
/// reconnect with backoff when the channel drops.
pub struct TransportDriver {
   peer: Address,
   psm: u16,
   connect_timeout: Duration,
   max_retry_delay: Duration,
   channel_seq: u16,
   cmd_rx: mpsc::Receiver<LinkCmd>,
   shared: Arc<PanTransport>,
}

impl TransportDriver {
   pub async fn run(mut self, feed: EventFeed) {
      info!("Transport driver starting for peer {}", self.peer);

      let mut retry_count: u32 = 0;
      loop {
         match self.establish(&feed).await {
            Ok(SessionEnd::Shutdown) => {
               info!("Transport driver shutting down");
               return;
            },
            Ok(SessionEnd::Lost) => {
               retry_count = 0;
               feed.push(BnepEvent::ChannelClosed).await;
            },
            Err(e) => {
               warn!("Session setup for {} failed: {e}", self.peer);
               feed
                  .push(BnepEvent::ChannelOpened(Err(OpenFailed {
                     remote: self.peer,
                     reason: "session setup failed",
                  })))
                  .await;
               retry_count += 1;
            },
         }

         let delay = calc_retry_delay(retry_count, self.max_retry_delay);
         info!("Reconnecting to {} in {delay:?}", self.peer);
         time::sleep(delay).await;
      }
   }

   /// One connection attempt plus the pump loop that follows it.
   async fn establish(&mut self, feed: &EventFeed) -> Result<SessionEnd> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;

      self.wait_for_peer(&adapter).await?;

      if let Ok(device) = adapter.device(self.peer) {
         match device.is_paired().await {
            Ok(false) => warn!("{} is not paired, connection may be refused", self.peer),
            Ok(true) => {},
            Err(e) => debug!("Could not query pairing state of {}: {e}", self.peer),
         }
         if let Ok(Some(uuids)) = device.uuids().await {
            if !uuids.iter().any(|u| PAN_SERVICES.contains(u)) {
               warn!("{} does not advertise a PAN service", self.peer);
            }
         }
      }

      match adapter.address().await {
         Ok(addr) => self.shared.local.store(Some(addr)),
         Err(e) => debug!("Could not read adapter address: {e}"),
      }

      let socket = Socket::new_seq_packet()?;
      let addr = SocketAddr::new(self.peer, AddressType::BrEdr, self.psm);
      debug!("Connecting to {} psm {:#06x}", self.peer, self.psm);

      let sp = match time::timeout(self.connect_timeout, socket.connect(addr)).await {
         Ok(conn) => conn?,
         Err(_) => return Err(BridgeError::ConnectTimeout),
      };

      let channel = self.next_channel();
      let local = self.shared.local.load().unwrap_or_else(Address::any);
      feed
         .push(BnepEvent::ChannelOpened(Ok(ChannelInfo {
            channel,
            remote: self.peer,
            local,
         })))
         .await;
      info!("BNEP channel {channel} open to {}", self.peer);

      let sp = Arc::new(sp);
      let mut recv_task = tokio::spawn(recv_pump(sp.clone(), feed.clone(), channel));
      loop {
         select! {
            cmd = self.cmd_rx.recv() => {
               let Some(cmd) = cmd else {
                  recv_task.abort();
                  return Ok(SessionEnd::Shutdown);
               };
               handle_cmd(&sp, feed, channel, cmd).await;
            },
            _ = &mut recv_task => {
               break;
            },
         }
      }

      Ok(SessionEnd::Lost)
   }

   /// Resolves once the peer is known to the adapter.
   async fn wait_for_peer(&self, adapter: &Adapter) -> Result<()> {
      // Subscribe before the first look at the device list; a peer
      // registered between the two has already had its event.
      let events = adapter.events().await?;
      watch_for_peer(
         events,
         || adapter.device_addresses(),
         self.peer,
         PEER_POLL_INTERVAL,
      )
      .await
   }

   fn next_channel(&mut self) -> ChannelId {
      loop {
         self.channel_seq = self.channel_seq.wrapping_add(1);
         if let Some(id) = ChannelId::new(self.channel_seq) {
            return id;
         }
      }
   }
}

async fn handle_cmd(sp: &SeqPacket, feed: &EventFeed, current: ChannelId, cmd: LinkCmd) {
   match cmd {
      LinkCmd::RequestCredit { channel } => {
         if channel != current {
            debug!("Dropping credit request for stale channel {channel}");
            return;
         }
         // Commands are processed serially, so by the time a request is
         // seen every earlier frame has been handed to the socket.
         feed.push(BnepEvent::CreditGranted).await;
      },
      LinkCmd::Send { channel, frame } => {
         if channel != current {
            warn!("Dropping {} byte frame for stale channel {channel}", frame.len());
            return;
         }
         debug!(
            "→ channel {channel}: {} bytes, hdr {}",
            frame.len(),
            hex::encode(&frame[..frame.len().min(ETH_HDR_LEN)])
         );
         if let Err(e) = sp.send(&frame).await {
            warn!("Failed to send frame: {e}");
         }
      },
   }
}

async fn recv_pump(sp: Arc<SeqPacket>, feed: EventFeed, channel: ChannelId) {
   let mut buf = [0u8; BNEP_MIN_MTU];
   loop {
      match sp.recv(&mut buf).await {
         Ok(0) => {
            info!("Channel {channel} closed by remote");
            return;
         },
         Ok(n) => {
            debug!(
               "← channel {channel}: {n} bytes, hdr {}",
               hex::encode(&buf[..n.min(ETH_HDR_LEN)])
            );
            feed
               .push(BnepEvent::DataReceived(Frame::from_slice(&buf[..n])))
               .await;
         },
         Err(e) => {
            warn!("Receive error on channel {channel}: {e}");
            return;
         },
      }
   }
}

/// Completes once `peer` shows up, through the adapter event stream or
/// the periodic re-poll of the known-device list. The poll catches
/// devices BlueZ registered before the subscription or without emitting
/// a discovery event.
async fn watch_for_peer<S, F, Fut>(
   mut events: S,
   mut known: F,
   peer: Address,
   poll_interval: Duration,
) -> Result<()>
where
   S: Stream<Item = AdapterEvent> + Unpin,
   F: FnMut() -> Fut,
   Fut: Future<Output = bluer::Result<Vec<Address>>>,
{
   if known().await?.contains(&peer) {
      return Ok(());
   }

   info!("Waiting for {peer} to appear");
   let mut poll = time::interval(poll_interval);
   poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
   loop {
      select! {
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(addr)) if addr == peer => {
               debug!("Peer {addr} appeared");
               return Ok(());
            },
            Some(_) => {},
            None => return Err(BridgeError::AdapterLost),
         },
         _ = poll.tick() => {
            if known().await?.contains(&peer) {
               debug!("Peer {peer} appeared in the device list");
               return Ok(());
            }
         },
      }
   }
}

fn calc_retry_delay(retry_count: u32, max_delay: Duration) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(max_delay);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use std::future::ready;

   use futures::stream;

   use super::*;

   fn peer() -> Address {
      Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
   }

   #[tokio::test]
   async fn test_known_peer_is_found_without_an_event() {
      // Registered before the subscription: the event already fired, only
      // the device list still shows the peer.
      let result = watch_for_peer(
         stream::pending(),
         || ready(Ok(vec![Address::any(), peer()])),
         peer(),
         Duration::from_millis(1),
      )
      .await;
      assert!(result.is_ok());
   }

   #[tokio::test]
   async fn test_poll_finds_peer_registered_without_an_event() {
      let mut polls = 0;
      let result = watch_for_peer(
         stream::pending(),
         move || {
            polls += 1;
            ready(Ok(if polls < 3 { Vec::new() } else { vec![peer()] }))
         },
         peer(),
         Duration::from_millis(1),
      )
      .await;
      assert!(result.is_ok());
   }

   #[tokio::test]
   async fn test_device_added_event_finishes_the_wait() {
      let events = stream::iter(vec![
         AdapterEvent::DeviceAdded(Address::any()),
         AdapterEvent::DeviceAdded(peer()),
      ]);
      let result = watch_for_peer(
         events,
         || ready(Ok(Vec::new())),
         peer(),
         Duration::from_secs(60),
      )
      .await;
      assert!(result.is_ok());
   }

   #[tokio::test]
   async fn test_ended_event_stream_fails_the_wait() {
      let result = watch_for_peer(
         stream::iter(Vec::<AdapterEvent>::new()),
         || ready(Ok(Vec::new())),
         peer(),
         Duration::from_secs(60),
      )
      .await;
      assert!(matches!(result, Err(BridgeError::AdapterLost)));
   }
}
