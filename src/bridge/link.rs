//! Link lifecycle actor.
//!
//! Owns the channel handle and the outbound in-flight slot. Everything
//! the transport observes and every producer wakeup funnels through one
//! inbox, so channel state is only ever touched from this actor's task.

use std::sync::Arc;

use bluer::Address;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::{
   bluetooth::bnep::{BnepEvent, BnepStack, ChannelId, StackHandle},
   bridge::{
      inbound::Inbound,
      outbound::{BridgeTx, Outbound},
      queue::TxQueue,
   },
   config::Config,
   error::{BridgeError, Result},
   event::{EventBus, EventSender, LinkEvent},
   net::{
      buffer::PoolHandle,
      netif::{HostHandle, HostStack, LinkState, Netif, StatsSnapshot},
   },
};

const CHANNEL_BUFFER_SIZE: usize = 64;

/// Commands processed by the bridge actor.
pub enum BridgeCommand {
   /// Transport event, in the order the transport observed it.
   Event(BnepEvent),
   /// Wakeup from a producer whose push found the queue empty.
   ProcessOutgoing,
   Status(oneshot::Sender<BridgeStatus>),
}

/// Point-in-time view of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeStatus {
   pub link: LinkState,
   pub remote: Option<Address>,
   pub local: Option<Address>,
   pub channel: Option<u16>,
   pub queued: usize,
   pub in_flight: bool,
   pub pool_outstanding: usize,
   pub stats: StatsSnapshot,
}

impl BridgeStatus {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "link": self.link.to_str(),
          "remote": self.remote.map(|a| a.to_string()),
          "local": self.local.map(|a| a.to_string()),
          "channel": self.channel,
          "queued": self.queued,
          "in_flight": self.in_flight,
          "pool_outstanding": self.pool_outstanding,
          "stats": self.stats.to_json(),
      })
   }
}

/// Transport-side handle feeding events into the actor.
#[derive(Clone)]
pub struct EventFeed {
   inbox: mpsc::Sender<BridgeCommand>,
}

impl EventFeed {
   pub async fn push(&self, event: BnepEvent) {
      if self.inbox.send(BridgeCommand::Event(event)).await.is_err() {
         warn!("Bridge actor gone, dropping transport event");
      }
   }
}

/// Cheaply cloneable handle to the bridge actor.
#[derive(Clone)]
pub struct PanBridge {
   inbox: mpsc::Sender<BridgeCommand>,
}

impl PanBridge {
   /// Builds the bridge, registers the interface with the host stack and
   /// spawns the actor task.
   pub fn bring_up(
      config: &Config,
      netif: Arc<Netif>,
      stack: StackHandle,
      host: HostHandle,
      pool: PoolHandle,
      events: EventSender,
   ) -> (Self, EventFeed) {
      let queue = Arc::new(TxQueue::new(config.queue_depth, config.submit_timeout()));
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      let output = BridgeTx::new(queue.clone(), command_tx.clone(), netif.clone());
      host.register_link(netif.clone(), output, true);

      let actor = BridgeActor {
         channel: None,
         outbound: Outbound::new(queue, netif.clone(), stack.frame_limit()),
         inbound: Inbound::new(pool, host, netif.clone()),
         netif,
         stack,
         events,
         command_rx,
      };
      tokio::spawn(actor.run());

      (
         Self {
            inbox: command_tx.clone(),
         },
         EventFeed { inbox: command_tx },
      )
   }

   pub async fn status(&self) -> Result<BridgeStatus> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(BridgeCommand::Status(tx))
         .await
         .map_err(|_| BridgeError::BridgeShutdown)?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }
}

// === Bridge Actor ===

struct BridgeActor {
   /// Active channel, sentinel `None` while the link is down.
   channel: Option<ChannelId>,
   outbound: Outbound,
   inbound: Inbound,
   netif: Arc<Netif>,
   stack: StackHandle,
   events: EventSender,
   command_rx: mpsc::Receiver<BridgeCommand>,
}

impl BridgeActor {
   async fn run(mut self) {
      info!("Bridge actor starting for {}", self.netif.name());

      while let Some(cmd) = self.command_rx.recv().await {
         self.handle_command(cmd);
         // A wakeup lost to inbox pressure must not strand the queue.
         if let Some(channel) = self.channel {
            self.outbound.on_channel_ready(self.stack.as_ref(), channel);
         }
      }

      info!("Bridge actor shutting down");
      let released = self.outbound.drain();
      if released > 0 {
         debug!("Released {released} packets at shutdown");
      }
   }

   fn handle_command(&mut self, cmd: BridgeCommand) {
      match cmd {
         BridgeCommand::Event(event) => self.handle_event(event),
         BridgeCommand::ProcessOutgoing => match self.channel {
            Some(channel) => self.outbound.on_channel_ready(self.stack.as_ref(), channel),
            None => {
               let released = self.outbound.drain();
               if released > 0 {
                  debug!("No channel up, released {released} queued packets");
               }
            },
         },
         BridgeCommand::Status(reply) => {
            _ = reply.send(self.status());
         },
      }
   }

   fn handle_event(&mut self, event: BnepEvent) {
      match event {
         BnepEvent::ChannelOpened(Ok(info)) => {
            if let Some(old) = self.channel {
               warn!("Channel {} opened while {old} is active, replacing", info.channel);
            }
            // Every session starts with an empty queue.
            let stale = self.outbound.drain();
            if stale > 0 {
               info!("Discarded {stale} packets queued before link up");
            }
            self.channel = Some(info.channel);
            self.netif.set_link_up(info.remote);
            self.events.emit(LinkEvent::LinkUp(info.remote));
            info!(
               "Link up on {}: {} via channel {} (local {})",
               self.netif.name(),
               info.remote,
               info.channel,
               info.local
            );
         },
         BnepEvent::ChannelOpened(Err(failed)) => {
            warn!("Channel open to {} failed: {}", failed.remote, failed.reason);
         },
         BnepEvent::ChannelClosed => {
            let had_channel = self.channel.take().is_some();
            let released = self.outbound.drain();
            self.netif.set_link_down();
            if had_channel {
               self.events.emit(LinkEvent::LinkDown);
               info!(
                  "Link down on {}, released {released} pending packets",
                  self.netif.name()
               );
            } else if released > 0 {
               debug!("Channel already closed, released {released} queued packets");
            }
         },
         BnepEvent::CreditGranted => match self.channel {
            Some(channel) => self.outbound.on_credit_granted(self.stack.as_ref(), channel),
            None => error!("Credit granted with no channel up, ignoring"),
         },
         BnepEvent::DataReceived(frame) => self.inbound.deliver(&frame),
      }
   }

   fn status(&self) -> BridgeStatus {
      BridgeStatus {
         link: self.netif.link_state(),
         remote: self.netif.hwaddr(),
         local: self.stack.local_address(),
         channel: self.channel.map(ChannelId::get),
         queued: self.outbound.queued(),
         in_flight: self.outbound.has_in_flight(),
         pool_outstanding: self.inbound.pool_outstanding(),
         stats: self.netif.stats.snapshot(),
      }
   }
}
