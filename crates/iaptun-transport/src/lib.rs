//! Relay transport abstraction for in-process tunnels
//!
//! The tunnel manager does not speak any relay wire protocol itself. An
//! in-process tunnel only needs two capabilities from the transport:
//!
//! 1. open a bidirectional byte stream to a destination, once per local
//!    client connection
//! 2. probe a destination end to end, so that "access denied" can be told
//!    apart from "listener never came up"
//!
//! ```text
//! ┌──────────────┐   accept   ┌──────────────────┐  connect   ┌──────────┐
//! │ RDP/SSH      │ ─────────> │ local listener   │ ─────────> │ relay    │ ──> VM
//! │ client       │            │ (iaptun-client)  │            │ transport│
//! └──────────────┘            └──────────────────┘            └──────────┘
//! ```

pub mod direct;

pub use direct::DirectTransport;

use async_trait::async_trait;
use iaptun_proto::Destination;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A transport that can carry tunnel traffic to a destination
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Byte stream to the destination
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to the destination
    async fn connect(&self, destination: &Destination) -> TransportResult<Self::Stream>;

    /// Check that the destination is reachable through this transport
    async fn probe(&self, destination: &Destination, timeout: Duration) -> TransportResult<()>;

    /// Human-readable name used in logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: RelayTransport> RelayTransport for Arc<T> {
    type Stream = T::Stream;

    async fn connect(&self, destination: &Destination) -> TransportResult<Self::Stream> {
        (**self).connect(destination).await
    }

    async fn probe(&self, destination: &Destination, timeout: Duration) -> TransportResult<()> {
        (**self).probe(destination, timeout).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
