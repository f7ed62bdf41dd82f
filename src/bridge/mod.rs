//! The PAN bridge core.
//!
//! Ties the Bluetooth transport to the host stack: a bounded transmit
//! queue fed by host threads, credit-paced outbound sends, inbound
//! frame reassembly, and the actor that owns the channel lifecycle.

pub mod inbound;
pub mod link;
pub mod outbound;
pub mod queue;
