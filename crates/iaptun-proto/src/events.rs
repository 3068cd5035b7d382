//! Tunnel lifecycle events

use crate::Destination;
use serde::{Deserialize, Serialize};

/// Event published by the tunnel broker whenever a tunnel opens or closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Tunnel established and probed successfully
    Opened {
        destination: Destination,
        local_port: u16,
    },
    /// Tunnel closed and removed from the registry
    Closed { destination: Destination },
}

impl TunnelEvent {
    pub fn destination(&self) -> &Destination {
        match self {
            TunnelEvent::Opened { destination, .. } => destination,
            TunnelEvent::Closed { destination } => destination,
        }
    }
}
