//! Tunnel factories
//!
//! A factory turns a destination into a bound local endpoint that forwards
//! to it. Two strategies exist:
//!
//! - [`RelayListenerFactory`](crate::listener::RelayListenerFactory): binds
//!   the local port in-process and relays through a
//!   [`RelayTransport`](iaptun_transport::RelayTransport)
//! - [`HelperProcessFactory`](crate::helper::HelperProcessFactory): launches
//!   the Cloud SDK's `start-iap-tunnel` command and waits for it to bind
//!
//! The broker only sees this trait and never cares which one it got.

use crate::error::TunnelError;
use crate::handle::TunnelHandle;
use async_trait::async_trait;
use iaptun_proto::Destination;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait TunnelFactory: Send + Sync + 'static {
    /// Open a tunnel to `destination`.
    ///
    /// On success the local port is accepting connections. On failure
    /// nothing is left running and no port stays reserved.
    async fn open(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError>;
}

#[async_trait]
impl<F: TunnelFactory + ?Sized> TunnelFactory for Arc<F> {
    async fn open(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        (**self).open(destination, timeout).await
    }
}

#[async_trait]
impl<F: TunnelFactory + ?Sized> TunnelFactory for Box<F> {
    async fn open(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        (**self).open(destination, timeout).await
    }
}
