//! Local port allocation
//!
//! Tunnel listeners bind to `localhost:<port>` where the port is chosen by
//! scanning a fixed candidate range in ascending order and skipping every
//! port that the host's TCP table reports as in use, either by a listener
//! or by an established connection.
//!
//! Ports handed out are additionally tracked in a reserved set until the
//! returned [`PortReservation`] is dropped, so two tunnels that are opened
//! concurrently never receive the same port even though neither has bound
//! it yet.

use crate::error::TunnelError;
use std::collections::HashSet;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// State of a TCP socket as far as port allocation cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    Other,
}

/// One row of the host's TCP table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpEntry {
    pub local_port: u16,
    pub state: TcpState,
}

/// Source of the host's active TCP listeners and connections
#[cfg_attr(test, mockall::automock)]
pub trait TcpTable: Send + Sync {
    fn entries(&self) -> io::Result<Vec<TcpEntry>>;
}

/// All local ports that are in use, in any state
pub fn occupied_ports(entries: &[TcpEntry]) -> HashSet<u16> {
    entries.iter().map(|e| e.local_port).collect()
}

/// Whether some socket is listening on the given local port
pub fn is_listening(table: &dyn TcpTable, port: u16) -> io::Result<bool> {
    Ok(table
        .entries()?
        .iter()
        .any(|e| e.local_port == port && e.state == TcpState::Listen))
}

/// TCP table of the local host.
///
/// On Linux this reads `/proc/net/tcp` and `/proc/net/tcp6`; elsewhere it
/// parses the output of `netstat -an`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTcpTable;

impl TcpTable for SystemTcpTable {
    #[cfg(target_os = "linux")]
    fn entries(&self) -> io::Result<Vec<TcpEntry>> {
        let mut entries = Vec::new();
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match std::fs::read_to_string(path) {
                Ok(content) => entries.extend(parse_proc_net_tcp(&content)),
                // tcp6 is absent when IPv6 is disabled
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    #[cfg(not(target_os = "linux"))]
    fn entries(&self) -> io::Result<Vec<TcpEntry>> {
        let output = std::process::Command::new("netstat").arg("-an").output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("netstat exited with {}", output.status),
            ));
        }
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the kernel's `/proc/net/tcp` format.
///
/// ```text
///   sl  local_address rem_address   st ...
///    0: 0100007F:1F90 00000000:0000 0A ...
/// ```
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_net_tcp(content: &str) -> Vec<TcpEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            Some(TcpEntry {
                local_port,
                state: if *state == "0A" {
                    TcpState::Listen
                } else {
                    TcpState::Other
                },
            })
        })
        .collect()
}

/// Parse `netstat -an` output from macOS/BSD or Windows.
///
/// ```text
/// tcp4       0      0  127.0.0.1.631          *.*                    LISTEN
///   TCP    0.0.0.0:135            0.0.0.0:0              LISTENING
/// ```
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_netstat(content: &str) -> Vec<TcpEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if !fields.first()?.to_ascii_lowercase().starts_with("tcp") {
                return None;
            }
            // BSD: proto recv-q send-q local foreign state
            // Windows: proto local foreign state
            let local = if fields.len() >= 6 {
                fields[3]
            } else {
                *fields.get(1)?
            };
            let port = local.rsplit([':', '.']).next()?.parse::<u16>().ok()?;
            let state = fields.last()?;
            Some(TcpEntry {
                local_port: port,
                state: if state.starts_with("LISTEN") {
                    TcpState::Listen
                } else {
                    TcpState::Other
                },
            })
        })
        .collect()
}

/// Finds unused local ports for tunnel listeners
#[derive(Clone)]
pub struct PortFinder {
    range: Range<u16>,
    table: Arc<dyn TcpTable>,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortFinder {
    pub fn new(range: Range<u16>, table: Arc<dyn TcpTable>) -> Self {
        Self {
            range,
            table,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Port finder backed by the host's TCP table
    pub fn system(range: Range<u16>) -> Self {
        Self::new(range, Arc::new(SystemTcpTable))
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    pub fn table(&self) -> Arc<dyn TcpTable> {
        Arc::clone(&self.table)
    }

    /// Pick the lowest port in range that is neither in use nor reserved.
    ///
    /// There is a window between this call and the actual bind in which
    /// another process may take the port; callers report that as
    /// [`TunnelError::BindFailed`] rather than retrying the same port.
    pub fn find_free_port(&self) -> Result<PortReservation, TunnelError> {
        let occupied = occupied_ports(&self.table.entries()?);
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);

        let port = self
            .range
            .clone()
            .find(|port| !occupied.contains(port) && !reserved.contains(port))
            .ok_or(TunnelError::PortExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;

        reserved.insert(port);
        debug!(port, "Reserved local port");

        Ok(PortReservation {
            port,
            reserved: Arc::clone(&self.reserved),
        })
    }

    /// Number of ports currently reserved
    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for PortFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortFinder")
            .field("range", &self.range)
            .field("reserved", &self.reserved_count())
            .finish()
    }
}

/// A port handed out by [`PortFinder`]; released when dropped
pub struct PortReservation {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PortReservation").field(&self.port).finish()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}
