//! Bluetooth side of the bridge.
//!
//! This module provides the BNEP channel abstraction the bridge core
//! consumes and the L2CAP transport driver that implements it.

pub mod bnep;
pub mod l2cap;
