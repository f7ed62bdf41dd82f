//! Host network stack boundary.
//!
//! This module models the host stack side of the bridge: chained packet
//! buffers and their pool, the interface descriptor the bridge registers,
//! and a datagram-socket host stack adapter for out-of-process stacks.

pub mod buffer;
pub mod netif;
pub mod socket;
