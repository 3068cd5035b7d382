//! Tunnel broker
//!
//! Keeps at most one tunnel per destination. Concurrent `connect` calls for
//! the same destination share a single connection attempt; a failed attempt
//! leaves a faulted entry that the next `connect` replaces.
//!
//! The map is guarded by a plain mutex that is never held across an await.
//! Connection attempts run on their own task, so a caller that gives up
//! waiting does not cancel the attempt for everyone else.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::factory::TunnelFactory;
use crate::handle::TunnelHandle;
use futures::future::{BoxFuture, FutureExt, Shared};
use iaptun_proto::{Destination, TunnelEvent};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type ConnectOutcome = Result<Arc<TunnelHandle>, TunnelError>;
type Attempt = Shared<BoxFuture<'static, ConnectOutcome>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

enum TunnelEntry {
    Connecting { attempt_id: u64, attempt: Attempt },
    Established(Arc<TunnelHandle>),
    Faulted(TunnelError),
}

struct BrokerInner<F> {
    factory: F,
    probe_timeout: Duration,
    tunnels: Mutex<HashMap<Destination, TunnelEntry>>,
    events: broadcast::Sender<TunnelEvent>,
    next_attempt_id: AtomicU64,
}

/// Registry of tunnels keyed by destination
pub struct TunnelBroker<F> {
    inner: Arc<BrokerInner<F>>,
}

impl<F> Clone for TunnelBroker<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TunnelFactory> TunnelBroker<F> {
    pub fn new(factory: F) -> Self {
        Self::with_probe_timeout(factory, TunnelConfig::default().probe_timeout)
    }

    pub fn from_config(factory: F, config: &TunnelConfig) -> Self {
        Self::with_probe_timeout(factory, config.probe_timeout)
    }

    pub fn with_probe_timeout(factory: F, probe_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                factory,
                probe_timeout,
                tunnels: Mutex::new(HashMap::new()),
                events,
                next_attempt_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the tunnel for `destination`, opening one if needed.
    ///
    /// Callers arriving while an attempt is in flight wait for that attempt
    /// and receive its outcome. A faulted entry is replaced by a new attempt.
    pub async fn connect(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Arc<TunnelHandle>, TunnelError> {
        let attempt = {
            let mut tunnels = self.inner.lock_tunnels();
            match tunnels.get(destination) {
                Some(TunnelEntry::Established(handle)) => {
                    debug!(destination = %destination, "Reusing established tunnel");
                    return Ok(Arc::clone(handle));
                }
                Some(TunnelEntry::Connecting { attempt, .. }) => {
                    debug!(destination = %destination, "Joining pending connection attempt");
                    attempt.clone()
                }
                Some(TunnelEntry::Faulted(_)) | None => {
                    let (attempt_id, attempt) = self.start_attempt(destination, timeout);
                    tunnels.insert(
                        destination.clone(),
                        TunnelEntry::Connecting {
                            attempt_id,
                            attempt: attempt.clone(),
                        },
                    );
                    attempt
                }
            }
        };

        attempt.await
    }

    fn start_attempt(&self, destination: &Destination, timeout: Duration) -> (u64, Attempt) {
        let attempt_id = self.inner.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let destination = destination.clone();

        debug!(destination = %destination, attempt_id, "Opening tunnel");

        let task = {
            let inner = Arc::clone(&inner);
            let destination = destination.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(inner.open_and_probe(&destination, timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(TunnelError::Io("connection attempt panicked".to_string()))
                    });
                inner.complete_attempt(&destination, attempt_id, &outcome);
                outcome
            })
        };

        let attempt = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The task never reached its own transition
                    let outcome: ConnectOutcome =
                        Err(TunnelError::Io(format!("connection attempt aborted: {}", e)));
                    inner.complete_attempt(&destination, attempt_id, &outcome);
                    outcome
                }
            }
        }
        .boxed()
        .shared();

        (attempt_id, attempt)
    }

    /// Whether an established tunnel exists for `destination`
    pub fn is_connected(&self, destination: &Destination) -> bool {
        matches!(
            self.inner.lock_tunnels().get(destination),
            Some(TunnelEntry::Established(_))
        )
    }

    /// Close the tunnel for `destination` and forget it.
    ///
    /// A faulted entry is simply evicted. The entry is removed even when the
    /// teardown fails; the teardown error is still returned.
    pub fn close(&self, destination: &Destination) -> Result<(), TunnelError> {
        let entry = {
            let mut tunnels = self.inner.lock_tunnels();
            match tunnels.get(destination) {
                None => return Err(TunnelError::NotFound(destination.clone())),
                Some(TunnelEntry::Connecting { .. }) => {
                    return Err(TunnelError::StillConnecting(destination.clone()))
                }
                Some(_) => {}
            }
            tunnels.remove(destination)
        };

        let Some(TunnelEntry::Established(handle)) = entry else {
            debug!(destination = %destination, "Evicted faulted tunnel entry");
            return Ok(());
        };

        let result = handle.close();
        match &result {
            Ok(()) => info!(destination = %destination, "Tunnel closed"),
            Err(e) => warn!(destination = %destination, error = %e, "Tunnel teardown failed"),
        }
        let _ = self.inner.events.send(TunnelEvent::Closed {
            destination: destination.clone(),
        });

        result
    }

    /// Close every tunnel, collecting the failures.
    ///
    /// Entries that disappear concurrently are skipped. Entries still
    /// connecting are reported as failures and left in place.
    pub fn close_all(&self) -> Result<(), TunnelError> {
        let destinations: Vec<Destination> = self.inner.lock_tunnels().keys().cloned().collect();

        let failures: Vec<TunnelError> = destinations
            .iter()
            .filter_map(|destination| match self.close(destination) {
                Ok(()) | Err(TunnelError::NotFound(_)) => None,
                Err(e) => Some(e),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::AggregateFailure(failures))
        }
    }

    /// Snapshot of all established tunnels
    pub fn open_tunnels(&self) -> Vec<Arc<TunnelHandle>> {
        self.inner
            .lock_tunnels()
            .values()
            .filter_map(|entry| match entry {
                TunnelEntry::Established(handle) => Some(Arc::clone(handle)),
                _ => None,
            })
            .collect()
    }

    /// Receive tunnel opened/closed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl<F: TunnelFactory> BrokerInner<F> {
    fn lock_tunnels(&self) -> MutexGuard<'_, HashMap<Destination, TunnelEntry>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_and_probe(&self, destination: &Destination, timeout: Duration) -> ConnectOutcome {
        let handle = tokio::time::timeout(timeout, self.factory.open(destination, timeout))
            .await
            .map_err(|_| TunnelError::Timeout {
                destination: destination.clone(),
                timeout,
            })??;

        if let Err(e) = handle.probe(self.probe_timeout).await {
            if let Err(close_error) = handle.close() {
                debug!(destination = %destination, error = %close_error, "Teardown after failed probe failed");
            }
            return Err(e);
        }

        Ok(Arc::new(handle))
    }

    fn complete_attempt(&self, destination: &Destination, attempt_id: u64, outcome: &ConnectOutcome) {
        let mut tunnels = self.lock_tunnels();

        let current = matches!(
            tunnels.get(destination),
            Some(TunnelEntry::Connecting { attempt_id: id, .. }) if *id == attempt_id
        );
        if !current {
            // The entry was replaced; do not leave an orphaned tunnel running
            if let Ok(handle) = outcome {
                let _ = handle.close();
            }
            return;
        }

        match outcome {
            Ok(handle) => {
                tunnels.insert(destination.clone(), TunnelEntry::Established(Arc::clone(handle)));
                drop(tunnels);

                info!(
                    destination = %destination,
                    local_port = handle.local_port(),
                    "Tunnel established"
                );
                let _ = self.events.send(TunnelEvent::Opened {
                    destination: destination.clone(),
                    local_port: handle.local_port(),
                });
            }
            Err(e) => {
                debug!(destination = %destination, error = %e, "Connection attempt failed");
                tunnels.insert(destination.clone(), TunnelEntry::Faulted(e.clone()));
            }
        }
    }
}

impl<F> std::fmt::Debug for TunnelBroker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tunnels = self.inner.tunnels.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TunnelBroker")
            .field("entries", &tunnels.len())
            .field("probe_timeout", &self.inner.probe_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelErrorKind;
    use crate::handle::TunnelControl;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize};
    use tokio::sync::Notify;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn destination(instance: &str) -> Destination {
        Destination::new("proj-1", "us-central1-a", instance, 3389)
    }

    struct FakeControl {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
        fail_probe: bool,
    }

    #[async_trait]
    impl TunnelControl for FakeControl {
        fn close(&self) -> Result<(), TunnelError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(TunnelError::Io("kill failed".to_string()))
            } else {
                Ok(())
            }
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), TunnelError> {
            if self.fail_probe {
                Err(TunnelError::ProbeFailed("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Factory whose behavior the tests steer through shared flags
    #[derive(Default)]
    struct FakeFactory {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        next_port: AtomicU16,
        fail_open: AtomicBool,
        fail_probe: AtomicBool,
        fail_close: AtomicBool,
        panic_open: AtomicBool,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl FakeFactory {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TunnelFactory for FakeFactory {
        async fn open(
            &self,
            destination: &Destination,
            _timeout: Duration,
        ) -> Result<TunnelHandle, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic_open.load(Ordering::SeqCst) {
                panic!("factory blew up");
            }
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(TunnelError::HelperCommandFailed("boom".to_string()));
            }

            let port = 20000 + self.next_port.fetch_add(1, Ordering::SeqCst);
            Ok(TunnelHandle::new(
                destination.clone(),
                port,
                FakeControl {
                    closes: Arc::clone(&self.closes),
                    fail_close: self.fail_close.load(Ordering::SeqCst),
                    fail_probe: self.fail_probe.load(Ordering::SeqCst),
                },
            ))
        }
    }

    fn broker(factory: FakeFactory) -> TunnelBroker<Arc<FakeFactory>> {
        TunnelBroker::new(Arc::new(factory))
    }

    #[tokio::test]
    async fn test_connect_establishes_tunnel() {
        let broker = broker(FakeFactory::default());
        let dest = destination("vm-1");

        let handle = broker.connect(&dest, TIMEOUT).await.unwrap();

        assert_eq!(handle.destination(), &dest);
        assert!(broker.is_connected(&dest));
        assert_eq!(broker.open_tunnels().len(), 1);
        assert_eq!(broker.factory().opens(), 1);
    }

    #[tokio::test]
    async fn test_connect_reuses_established_tunnel() {
        let broker = broker(FakeFactory::default());
        let dest = destination("vm-1");

        let first = broker.connect(&dest, TIMEOUT).await.unwrap();
        let second = broker.connect(&dest, TIMEOUT).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.factory().opens(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let broker = broker(FakeFactory {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let dest = destination("vm-1");

        let results = futures::future::join_all(
            (0..10).map(|_| broker.connect(&dest, TIMEOUT)),
        )
        .await;

        let handles: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(broker.factory().opens(), 1);
        assert_eq!(broker.open_tunnels().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_tunnels() {
        let broker = broker(FakeFactory::default());

        let a = broker.connect(&destination("vm-1"), TIMEOUT).await.unwrap();
        let b = broker.connect(&destination("vm-2"), TIMEOUT).await.unwrap();

        assert_ne!(a.local_port(), b.local_port());
        assert_eq!(broker.open_tunnels().len(), 2);
        assert_eq!(broker.factory().opens(), 2);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_replaced_on_next_connect() {
        let broker = broker(FakeFactory::default());
        broker.factory().fail_open.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");

        let error = broker.connect(&dest, TIMEOUT).await.unwrap_err();
        assert_eq!(error.kind(), TunnelErrorKind::HelperCommandFailed);
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());

        broker.factory().fail_open.store(false, Ordering::SeqCst);
        broker.connect(&dest, TIMEOUT).await.unwrap();

        assert!(broker.is_connected(&dest));
        assert_eq!(broker.factory().opens(), 2);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_replaced_on_next_connect() {
        let broker = broker(FakeFactory::default());
        broker.factory().panic_open.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");

        let error = broker.connect(&dest, TIMEOUT).await.unwrap_err();
        assert_eq!(error.kind(), TunnelErrorKind::Io);
        assert!(!broker.is_connected(&dest));

        broker.factory().panic_open.store(false, Ordering::SeqCst);
        broker.connect(&dest, TIMEOUT).await.unwrap();

        assert!(broker.is_connected(&dest));
        assert_eq!(broker.factory().opens(), 2);
        broker.close(&dest).unwrap();
    }

    #[tokio::test]
    async fn test_panicking_attempt_can_be_closed() {
        let broker = broker(FakeFactory::default());
        broker.factory().panic_open.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");

        broker.connect(&dest, TIMEOUT).await.unwrap_err();

        broker.close(&dest).unwrap();
        broker.close_all().unwrap();
    }

    #[tokio::test]
    async fn test_slow_open_times_out_and_is_replaced() {
        let broker = broker(FakeFactory {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let dest = destination("vm-1");

        let error = broker
            .connect(&dest, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), TunnelErrorKind::Timeout);
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());

        broker.connect(&dest, TIMEOUT).await.unwrap();

        assert!(broker.is_connected(&dest));
        assert_eq!(broker.factory().opens(), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_fails_connect_and_closes_handle() {
        let broker = broker(FakeFactory::default());
        broker.factory().fail_probe.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");

        let error = broker.connect(&dest, TIMEOUT).await.unwrap_err();

        assert_eq!(error.kind(), TunnelErrorKind::ProbeFailed);
        assert_eq!(broker.factory().closes(), 1);
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_attempt() {
        let gate = Arc::new(Notify::new());
        let broker = broker(FakeFactory {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let dest = destination("vm-1");

        let abandoned = {
            let broker = broker.clone();
            let dest = dest.clone();
            tokio::spawn(async move { broker.connect(&dest, TIMEOUT).await })
        };
        while broker.factory().opens() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();

        gate.notify_one();
        let handle = broker.connect(&dest, TIMEOUT).await.unwrap();

        assert_eq!(handle.destination(), &dest);
        assert_eq!(broker.factory().opens(), 1);
    }

    #[tokio::test]
    async fn test_close_tears_down_and_forgets_tunnel() {
        let broker = broker(FakeFactory::default());
        let dest = destination("vm-1");
        let handle = broker.connect(&dest, TIMEOUT).await.unwrap();

        broker.close(&dest).unwrap();

        assert!(handle.is_closed());
        assert_eq!(broker.factory().closes(), 1);
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_close_unknown_destination_is_not_found() {
        let broker = broker(FakeFactory::default());
        let error = broker.close(&destination("vm-1")).unwrap_err();
        assert_eq!(error.kind(), TunnelErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_close_evicts_faulted_entry() {
        let broker = broker(FakeFactory::default());
        broker.factory().fail_open.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");
        broker.connect(&dest, TIMEOUT).await.unwrap_err();

        broker.close(&dest).unwrap();

        assert_eq!(
            broker.close(&dest).unwrap_err().kind(),
            TunnelErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_close_while_connecting_is_rejected() {
        let gate = Arc::new(Notify::new());
        let broker = broker(FakeFactory {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let dest = destination("vm-1");

        let pending = {
            let broker = broker.clone();
            let dest = dest.clone();
            tokio::spawn(async move { broker.connect(&dest, TIMEOUT).await })
        };
        while broker.factory().opens() == 0 {
            tokio::task::yield_now().await;
        }

        let error = broker.close(&dest).unwrap_err();
        assert_eq!(error.kind(), TunnelErrorKind::StillConnecting);
        assert!(!broker.is_connected(&dest));

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(broker.is_connected(&dest));
    }

    #[tokio::test]
    async fn test_close_removes_entry_even_if_teardown_fails() {
        let broker = broker(FakeFactory::default());
        broker.factory().fail_close.store(true, Ordering::SeqCst);
        let dest = destination("vm-1");
        broker.connect(&dest, TIMEOUT).await.unwrap();

        assert!(broker.close(&dest).is_err());
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_with_no_tunnels() {
        let broker = broker(FakeFactory::default());
        broker.close_all().unwrap();
    }

    #[tokio::test]
    async fn test_close_all_closes_every_tunnel() {
        let broker = broker(FakeFactory::default());
        for instance in ["vm-1", "vm-2", "vm-3"] {
            broker.connect(&destination(instance), TIMEOUT).await.unwrap();
        }

        broker.close_all().unwrap();

        assert!(broker.open_tunnels().is_empty());
        assert_eq!(broker.factory().closes(), 3);
    }

    #[tokio::test]
    async fn test_close_all_aggregates_failures() {
        let broker = broker(FakeFactory::default());
        broker.connect(&destination("vm-1"), TIMEOUT).await.unwrap();
        broker.factory().fail_close.store(true, Ordering::SeqCst);
        broker.connect(&destination("vm-2"), TIMEOUT).await.unwrap();

        match broker.close_all() {
            Err(TunnelError::AggregateFailure(failures)) => assert_eq!(failures.len(), 1),
            other => panic!("expected aggregate failure, got {:?}", other),
        }
        assert!(broker.open_tunnels().is_empty());
        assert_eq!(broker.factory().closes(), 2);
    }

    #[tokio::test]
    async fn test_events_follow_tunnel_lifecycle() {
        let broker = broker(FakeFactory::default());
        let mut events = broker.subscribe();
        let dest = destination("vm-1");

        let handle = broker.connect(&dest, TIMEOUT).await.unwrap();
        broker.connect(&dest, TIMEOUT).await.unwrap();
        broker.close(&dest).unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Opened {
                destination: dest.clone(),
                local_port: handle.local_port(),
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Closed { destination: dest }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_connect_emits_no_event() {
        let broker = broker(FakeFactory::default());
        broker.factory().fail_probe.store(true, Ordering::SeqCst);
        let mut events = broker.subscribe();

        broker.connect(&destination("vm-1"), TIMEOUT).await.unwrap_err();

        assert!(events.try_recv().is_err());
    }
}
