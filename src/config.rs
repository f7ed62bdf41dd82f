//! Configuration management for the bridge daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the interface geometry and the Bluetooth peer to bridge to.

use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{BridgeError, Result};

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Name the virtual link is registered under.
   #[serde(default = "default_interface")]
   pub interface: SmolStr,

   /// Fixed interface MTU; must stay below the BNEP minimum L2CAP MTU.
   #[serde(default = "default_mtu")]
   pub mtu: u16,

   /// Capacity of the outbound packet queue.
   #[serde(default = "default_queue_depth")]
   pub queue_depth: usize,

   /// How long an outbound submission may wait for queue space.
   #[serde(default = "default_submit_timeout")]
   pub submit_timeout_secs: u64,

   /// Segment size the buffer pool hands out.
   #[serde(default = "default_pool_segment")]
   pub pool_segment: usize,

   /// Maximum number of pool buffers outstanding at once.
   #[serde(default = "default_pool_buffers")]
   pub pool_buffers: usize,

   /// Unix datagram socket the host stack attaches to.
   #[serde(default = "default_socket_path")]
   pub socket_path: String,

   /// Bluetooth address of the PAN peer (NAP) to bridge to.
   #[serde(default)]
   pub peer: Option<String>,

   /// L2CAP PSM of the peer's BNEP service.
   #[serde(default = "default_psm")]
   pub psm: u16,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_secs: u64,

   #[serde(default = "default_reconnect_max_delay")]
   pub reconnect_max_delay_secs: u64,
}

fn default_interface() -> SmolStr {
   SmolStr::new_static("bt0")
}

const fn default_mtu() -> u16 {
   1600
}

const fn default_queue_depth() -> usize {
   16
}

const fn default_submit_timeout() -> u64 {
   30
}

const fn default_pool_segment() -> usize {
   512
}

const fn default_pool_buffers() -> usize {
   64
}

fn default_socket_path() -> String {
   "/run/btpand.sock".to_string()
}

const fn default_psm() -> u16 {
   crate::bluetooth::bnep::BNEP_PSM
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_reconnect_max_delay() -> u64 {
   120
}

impl Default for Config {
   fn default() -> Self {
      Self {
         interface: default_interface(),
         mtu: default_mtu(),
         queue_depth: default_queue_depth(),
         submit_timeout_secs: default_submit_timeout(),
         pool_segment: default_pool_segment(),
         pool_buffers: default_pool_buffers(),
         socket_path: default_socket_path(),
         peer: None,
         psm: default_psm(),
         connect_timeout_secs: default_connect_timeout(),
         reconnect_max_delay_secs: default_reconnect_max_delay(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      let config: Self = if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         toml::from_str(&contents)?
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         config
      };
      config.validate()?;
      Ok(config)
   }

   /// Rejects zero-sized link geometry before anything is built from it.
   fn validate(&self) -> Result<()> {
      if self.queue_depth == 0 {
         return Err(BridgeError::InvalidConfig("queue_depth must be nonzero"));
      }
      if self.pool_segment == 0 {
         return Err(BridgeError::InvalidConfig("pool_segment must be nonzero"));
      }
      if self.pool_buffers == 0 {
         return Err(BridgeError::InvalidConfig("pool_buffers must be nonzero"));
      }
      if self.mtu == 0 {
         return Err(BridgeError::InvalidConfig("mtu must be nonzero"));
      }
      Ok(())
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(bridge_home) = env::var("BTPAND_HOME") {
         PathBuf::from(bridge_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btpand").join("config.toml"))
   }

   /// Parses the configured peer address, if any.
   pub fn peer_address(&self) -> Result<Option<Address>> {
      match &self.peer {
         None => Ok(None),
         Some(s) => Address::from_str(s)
            .map(Some)
            .map_err(|_| BridgeError::InvalidPeerAddress(s.clone())),
      }
   }

   pub const fn submit_timeout(&self) -> Duration {
      Duration::from_secs(self.submit_timeout_secs)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }
}
