//! IAP tunnel manager - Public API
//!
//! Opens local tunnels to VM instances and keeps at most one tunnel per
//! destination. Protocol clients (RDP, SSH) connect to the tunnel's local
//! port on `127.0.0.1`.

pub mod broker;
pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod helper;
pub mod listener;
pub mod ports;

pub use broker::TunnelBroker;
pub use config::{TunnelConfig, TunnelConfigBuilder, DEFAULT_PORT_RANGE};
pub use error::{TunnelError, TunnelErrorKind};
pub use factory::TunnelFactory;
pub use handle::{TunnelControl, TunnelHandle, TunnelStatistics};
pub use helper::HelperProcessFactory;
pub use listener::RelayListenerFactory;
pub use ports::{PortFinder, PortReservation, SystemTcpTable, TcpEntry, TcpState, TcpTable};

pub use iaptun_proto::{Destination, TunnelEvent};
