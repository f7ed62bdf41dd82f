//! Event handling system for link state updates.
//!
//! This module provides the event infrastructure for notifying about
//! bridge state changes, primarily the link coming up or going down.

use std::sync::Arc;

use bluer::Address;

/// Events that can be emitted by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
   /// The data channel opened and the link is usable; carries the remote
   /// device address now serving as the interface hardware address.
   LinkUp(Address),
   /// The data channel closed and all pending traffic was discarded.
   LinkDown,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
