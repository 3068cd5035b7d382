//! Direct TCP transport
//!
//! Reaches the instance with a plain TCP connection, for clients that have
//! network-level access to the VPC (VPN, Interconnect, or a peered network).
//! By default the instance is addressed by its zonal internal DNS name.

use crate::{RelayTransport, TransportError, TransportResult};
use async_trait::async_trait;
use iaptun_proto::Destination;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

type Resolver = Arc<dyn Fn(&Destination) -> String + Send + Sync>;

/// Transport that connects straight to the instance over TCP
#[derive(Clone)]
pub struct DirectTransport {
    resolver: Resolver,
}

impl DirectTransport {
    /// Address instances by `INSTANCE.ZONE.c.PROJECT.internal:PORT`
    pub fn zonal_dns() -> Self {
        Self::with_resolver(|destination| {
            format!(
                "{}:{}",
                destination.zonal_dns_name(),
                destination.remote_port
            )
        })
    }

    /// Use a custom mapping from destination to `host:port`
    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn(&Destination) -> String + Send + Sync + 'static,
    {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    fn address(&self, destination: &Destination) -> String {
        (self.resolver)(destination)
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::zonal_dns()
    }
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport").finish_non_exhaustive()
    }
}

fn map_connect_error(address: &str, e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            TransportError::AccessDenied(format!("{}: {}", address, e))
        }
        _ => TransportError::ConnectionFailed(format!("{}: {}", address, e)),
    }
}

#[async_trait]
impl RelayTransport for DirectTransport {
    type Stream = TcpStream;

    async fn connect(&self, destination: &Destination) -> TransportResult<TcpStream> {
        let address = self.address(destination);
        debug!(destination = %destination, address = %address, "Opening direct stream");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| map_connect_error(&address, e))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn probe(&self, destination: &Destination, timeout: Duration) -> TransportResult<()> {
        let address = self.address(destination);

        match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => {
                debug!(destination = %destination, "Probe succeeded");
                Ok(())
            }
            Ok(Err(e)) => Err(map_connect_error(&address, e)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    fn name(&self) -> &str {
        "direct"
    }
}
