//! Tunnel handles
//!
//! A [`TunnelHandle`] describes one established tunnel. Its fields never
//! change after creation; the only mutable aspect is the one-shot teardown,
//! which is delegated to the strategy-specific [`TunnelControl`].

use crate::error::TunnelError;
use async_trait::async_trait;
use iaptun_proto::Destination;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Traffic statistics, as seen from the client side of the tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStatistics {
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
    pub connections: u64,
}

/// Strategy-specific operations behind a tunnel handle
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Tear down the listener or helper process. Invoked at most once.
    fn close(&self) -> Result<(), TunnelError>;

    /// End-to-end connectivity check. Strategies that cannot probe report
    /// success.
    async fn probe(&self, _timeout: Duration) -> Result<(), TunnelError> {
        Ok(())
    }

    fn statistics(&self) -> TunnelStatistics {
        TunnelStatistics::default()
    }
}

/// An established tunnel from `localhost:<local_port>` to a destination
pub struct TunnelHandle {
    id: Uuid,
    destination: Destination,
    local_port: u16,
    process_id: Option<u32>,
    opened_at: SystemTime,
    control: Box<dyn TunnelControl>,
    closed: AtomicBool,
}

impl TunnelHandle {
    pub fn new(
        destination: Destination,
        local_port: u16,
        control: impl TunnelControl + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            local_port,
            process_id: None,
            opened_at: SystemTime::now(),
            control: Box::new(control),
            closed: AtomicBool::new(false),
        }
    }

    /// Record the PID of the helper process backing this tunnel
    pub fn with_process_id(mut self, process_id: Option<u32>) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Endpoint that protocol clients should connect to
    pub fn local_endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    pub fn statistics(&self) -> TunnelStatistics {
        self.control.statistics()
    }

    pub async fn probe(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.control.probe(timeout).await
    }

    /// Tear the tunnel down. Only the first call has an effect.
    pub fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.control.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("local_port", &self.local_port)
            .field("process_id", &self.process_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
