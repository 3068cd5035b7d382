//! In-process tunnel listener
//!
//! Binds `127.0.0.1:<port>` and relays every accepted client connection
//! through a [`RelayTransport`]. The accept loop runs as a background task
//! owned by a [`CancellationToken`]; closing the handle cancels the token,
//! which stops the loop, drops the listener and tears down in-flight
//! connections.

use crate::error::TunnelError;
use crate::factory::TunnelFactory;
use crate::handle::{TunnelControl, TunnelHandle, TunnelStatistics};
use crate::ports::{PortFinder, PortReservation};
use async_trait::async_trait;
use iaptun_proto::Destination;
use iaptun_transport::RelayTransport;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Opens tunnels as local listeners relaying through `T`
pub struct RelayListenerFactory<T> {
    transport: Arc<T>,
    ports: PortFinder,
}

impl<T: RelayTransport> RelayListenerFactory<T> {
    pub fn new(transport: T, ports: PortFinder) -> Self {
        Self {
            transport: Arc::new(transport),
            ports,
        }
    }

    pub fn ports(&self) -> &PortFinder {
        &self.ports
    }
}

#[async_trait]
impl<T: RelayTransport> TunnelFactory for RelayListenerFactory<T> {
    /// The listener accepts connections as soon as the bind succeeds, so the
    /// timeout is not needed here; end-to-end reachability is covered by the
    /// probe.
    async fn open(
        &self,
        destination: &Destination,
        _timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        let reservation = self.ports.find_free_port()?;
        let port = reservation.port();

        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TunnelError::BindFailed {
                port,
                reason: e.to_string(),
            })?;

        let token = CancellationToken::new();
        let stats = Arc::new(RelayStats::default());

        tokio::spawn(run_accept_loop(
            listener,
            destination.clone(),
            Arc::clone(&self.transport),
            token.clone(),
            Arc::clone(&stats),
        ));

        info!(
            destination = %destination,
            local_port = port,
            transport = self.transport.name(),
            "Tunnel listener started"
        );

        Ok(TunnelHandle::new(
            destination.clone(),
            port,
            ListenerControl {
                destination: destination.clone(),
                transport: Arc::clone(&self.transport),
                token,
                stats,
                reservation: Mutex::new(Some(reservation)),
            },
        ))
    }
}

#[derive(Default)]
struct RelayStats {
    bytes_transmitted: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
}

struct ListenerControl<T> {
    destination: Destination,
    transport: Arc<T>,
    token: CancellationToken,
    stats: Arc<RelayStats>,
    reservation: Mutex<Option<PortReservation>>,
}

#[async_trait]
impl<T: RelayTransport> TunnelControl for ListenerControl<T> {
    fn close(&self) -> Result<(), TunnelError> {
        debug!(destination = %self.destination, "Cancelling tunnel listener");
        self.token.cancel();
        self.reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.transport
            .probe(&self.destination, timeout)
            .await
            .map_err(|e| TunnelError::from_probe(&self.destination, e))
    }

    fn statistics(&self) -> TunnelStatistics {
        TunnelStatistics {
            bytes_transmitted: self.stats.bytes_transmitted.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            connections: self.stats.connections.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for ListenerControl<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_accept_loop<T: RelayTransport>(
    listener: TcpListener,
    destination: Destination,
    transport: Arc<T>,
    token: CancellationToken,
    stats: Arc<RelayStats>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(destination = %destination, "Tunnel listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    stats.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(destination = %destination, peer = %peer, "Accepted tunnel client");

                    tokio::spawn(relay_connection(
                        socket,
                        peer,
                        destination.clone(),
                        Arc::clone(&transport),
                        token.child_token(),
                        Arc::clone(&stats),
                    ));
                }
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Accept failed");
                    // Brief pause before retrying
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn relay_connection<T: RelayTransport>(
    mut socket: TcpStream,
    peer: SocketAddr,
    destination: Destination,
    transport: Arc<T>,
    token: CancellationToken,
    stats: Arc<RelayStats>,
) {
    let remote = tokio::select! {
        _ = token.cancelled() => return,
        connected = transport.connect(&destination) => match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(destination = %destination, peer = %peer, error = %e, "Failed to open relay stream");
                return;
            }
        }
    };

    let (client_read, client_write) = socket.split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    tokio::select! {
        _ = token.cancelled() => {
            debug!(destination = %destination, peer = %peer, "Closing relayed connection");
        }
        result = async {
            tokio::try_join!(
                pump(client_read, remote_write, &stats.bytes_transmitted),
                pump(remote_read, client_write, &stats.bytes_received),
            )
        } => match result {
            Ok(_) => debug!(destination = %destination, peer = %peer, "Relayed connection closed"),
            Err(e) => debug!(destination = %destination, peer = %peer, error = %e, "Relayed connection failed"),
        }
    }
}

/// Copy from `reader` to `writer` until EOF, counting bytes as they pass
async fn pump<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_counts_bytes_and_shuts_down() {
        let (mut client, server) = tokio::io::duplex(64);
        let (mut sink_reader, sink_writer) = tokio::io::duplex(64);
        let counter = AtomicU64::new(0);

        client.write_all(b"hello tunnel").await.unwrap();
        drop(client);

        pump(server, sink_writer, &counter).await.unwrap();

        let mut received = Vec::new();
        sink_reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello tunnel");
        assert_eq!(counter.load(Ordering::Relaxed), 12);
    }
}
