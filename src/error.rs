//! Error types for the PAN bridge daemon.
//!
//! This module defines all error types that can occur during the operation
//! of the bridge, including Bluetooth, D-Bus, I/O, and configuration
//! errors.

use thiserror::Error;

/// Main error type for the bridge daemon.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("Adapter event stream ended")]
   AdapterLost,

   #[error("L2CAP connect timed out")]
   ConnectTimeout,

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid peer address '{0}'")]
   InvalidPeerAddress(String),

   #[error("No peer device configured")]
   PeerNotConfigured,

   #[error("Invalid configuration: {0}")]
   InvalidConfig(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Bridge has been shut down")]
   BridgeShutdown,
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
