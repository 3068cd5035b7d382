//! Tunnel Protocol Definitions
//!
//! Shared value types for the tunnel manager: the destination key that
//! identifies a tunnel, and the lifecycle events published to observers.

pub mod destination;
pub mod events;

pub use destination::{Destination, DestinationParseError};
pub use events::TunnelEvent;

/// Well-known remote ports for the protocols layered on top of tunnels
pub const RDP_PORT: u16 = 3389;
pub const SSH_PORT: u16 = 22;
