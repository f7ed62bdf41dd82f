use zbus::{interface, object_server::SignalEmitter};

use crate::bridge::link::PanBridge;

pub struct PanService {
   bridge: PanBridge,
}

impl PanService {
   pub const fn new(bridge: PanBridge) -> Self {
      Self { bridge }
   }
}

#[interface(name = "org.btpand.Bridge")]
impl PanService {
   /// Full bridge state as a JSON document.
   async fn status(&self) -> zbus::fdo::Result<String> {
      let status = self
         .bridge
         .status()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(status.to_json().to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn link_up(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn link_down(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn link(&self) -> String {
      match self.bridge.status().await {
         Ok(status) => status.link.to_str().to_owned(),
         Err(_) => "down".to_owned(),
      }
   }

   #[zbus(property)]
   async fn remote(&self) -> String {
      match self.bridge.status().await {
         Ok(status) => status.remote.map(|a| a.to_string()).unwrap_or_default(),
         Err(_) => String::new(),
      }
   }

   #[zbus(property)]
   async fn packets_sent(&self) -> u64 {
      match self.bridge.status().await {
         Ok(status) => status.stats.tx_sent,
         Err(_) => 0,
      }
   }

   #[zbus(property)]
   async fn packets_received(&self) -> u64 {
      match self.bridge.status().await {
         Ok(status) => status.stats.rx_delivered,
         Err(_) => 0,
      }
   }
}
