//! Bluetooth PAN bridge daemon.
//!
//! Maintains a BNEP link to one PAN peer and bridges Ethernet frames
//! between that link and a host network stack endpoint, exposing link
//! state over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bridge::link::PanBridge;
use bluetooth::l2cap::PanTransport;
use dbus::PanService;
use event::{EventBus, LinkEvent};
use net::{buffer::HeapPool, netif::Netif, socket::DatagramStack};

mod bluetooth;
mod bridge;
mod config;
mod dbus;
mod error;
mod event;
mod net;

use crate::{
   dbus::PanServiceSignals,
   error::{BridgeError, Result},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btpand bridge service...");

   // Load configuration
   let config = config::Config::load()?;
   let peer = config
      .peer_address()?
      .ok_or(BridgeError::PeerNotConfigured)?;
   info!("Bridging peer {peer} to interface {}", config.interface);

   // Create event channel
   let event_bus = EventProcessor::new();

   // Wire the bridge to its two boundaries
   let pool = Arc::new(HeapPool::new(config.pool_segment, config.pool_buffers));
   let netif = Arc::new(Netif::new(&config.interface, config.mtu));
   let host = DatagramStack::bind(&config.socket_path)?;
   let (transport, driver) = PanTransport::new(&config, peer);

   let (bridge, feed) = PanBridge::bring_up(
      &config,
      netif,
      transport,
      host.clone(),
      pool,
      event_bus.clone(),
   );

   host.spawn_pump()?;
   tokio::spawn(driver.run(feed));

   // Create D-Bus service
   let service = PanService::new(bridge);

   let connection = connection::Builder::session()?
      .name("org.btpand")?
      .serve_at("/org/btpand/bridge", service)?
      .build()
      .await?;

   info!("btpand D-Bus service started at org.btpand");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btpand...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<LinkEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<PanService>, event: LinkEvent) -> Result<()> {
      match event {
         LinkEvent::LinkUp(address) => {
            iface.link_up(&address.to_string()).await?;
         },
         LinkEvent::LinkDown => {
            iface.link_down().await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PanService>("/org/btpand/bridge")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
