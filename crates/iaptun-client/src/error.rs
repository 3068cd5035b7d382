//! Tunnel manager errors

use iaptun_proto::Destination;
use iaptun_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the tunnel manager.
///
/// `Clone` because a single connection attempt is shared by every caller
/// waiting on the same destination, and each of them receives the outcome.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("No free local port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Failed to bind local port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("The installed Cloud SDK is outdated and does not support IAP tunnels. Update the Cloud SDK and try again.\n\n{0}")]
    OutdatedTooling(String),

    #[error("Tunnel helper command failed: {0}")]
    HelperCommandFailed(String),

    #[error("Tunnel helper '{program}' not found. Make sure the Cloud SDK is installed and on the PATH.")]
    HelperNotFound { program: String },

    #[error("Connecting to {destination} timed out after {timeout:?}. Verify that a firewall rule allows ingress from the IAP range (35.235.240.0/20) to the remote port.")]
    Timeout {
        destination: Destination,
        timeout: Duration,
    },

    #[error("Access to the instance was denied: {0}")]
    AccessDenied(String),

    #[error("Tunnel probe failed: {0}")]
    ProbeFailed(String),

    #[error("No tunnel to {0}")]
    NotFound(Destination),

    #[error("Tunnel to {0} is still connecting")]
    StillConnecting(Destination),

    #[error("Failed to close {} tunnel(s): {}", .0.len(), join_errors(.0))]
    AggregateFailure(Vec<TunnelError>),

    #[error("IO error: {0}")]
    Io(String),
}

/// Coarse classification of [`TunnelError`] for callers that pick a message
/// or remediation by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelErrorKind {
    PortExhausted,
    BindFailed,
    OutdatedTooling,
    HelperCommandFailed,
    HelperNotFound,
    Timeout,
    AccessDenied,
    ProbeFailed,
    NotFound,
    StillConnecting,
    AggregateFailure,
    Io,
}

impl TunnelError {
    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::PortExhausted { .. } => TunnelErrorKind::PortExhausted,
            TunnelError::BindFailed { .. } => TunnelErrorKind::BindFailed,
            TunnelError::OutdatedTooling(_) => TunnelErrorKind::OutdatedTooling,
            TunnelError::HelperCommandFailed(_) => TunnelErrorKind::HelperCommandFailed,
            TunnelError::HelperNotFound { .. } => TunnelErrorKind::HelperNotFound,
            TunnelError::Timeout { .. } => TunnelErrorKind::Timeout,
            TunnelError::AccessDenied(_) => TunnelErrorKind::AccessDenied,
            TunnelError::ProbeFailed(_) => TunnelErrorKind::ProbeFailed,
            TunnelError::NotFound(_) => TunnelErrorKind::NotFound,
            TunnelError::StillConnecting(_) => TunnelErrorKind::StillConnecting,
            TunnelError::AggregateFailure(_) => TunnelErrorKind::AggregateFailure,
            TunnelError::Io(_) => TunnelErrorKind::Io,
        }
    }

    /// Map a probe failure reported by the relay transport
    pub fn from_probe(destination: &Destination, error: TransportError) -> Self {
        match error {
            TransportError::AccessDenied(reason) => TunnelError::AccessDenied(reason),
            TransportError::Timeout(timeout) => TunnelError::Timeout {
                destination: destination.clone(),
                timeout,
            },
            other => TunnelError::ProbeFailed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Io(e.to_string())
    }
}

fn join_errors(errors: &[TunnelError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
