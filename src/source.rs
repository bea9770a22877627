//! Workload identity source: the shared "current identity" of a process
//!
//! An [`IdentitySource`] subscribes to an [`IdentityProvider`] on a background
//! task and republishes every snapshot the provider emits. Readers always get
//! a whole `Arc<IdentityMaterial>`; a rotation swaps that reference and never
//! touches a snapshot somebody may still be handshaking with.

use crate::config::WorkloadApiConfig;
use crate::error::{Error, Result};
use crate::svid::IdentityMaterial;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Stream of snapshots, in the provider's emission order
pub type IdentityUpdates = BoxStream<'static, Result<IdentityMaterial>>;

/// The external identity provider, seen through its subscription interface
///
/// Implementations open one long-lived subscription per call. Errors from
/// `subscribe` and errors yielded on the stream use the provider taxonomy:
/// [`Error::Unreachable`], [`Error::Unauthenticated`] and [`Error::Malformed`].
pub trait IdentityProvider: Send + Sync + 'static {
    /// Open a subscription to identity updates
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityUpdates>>;
}

/// Lifecycle of an identity source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    /// Waiting for the provider's first answer
    Pending,
    /// Subscribed and serving material
    Active,
    /// The subscription ended; the last good material is still served
    Disconnected,
    /// The initial fetch failed
    Failed,
    /// `close` was called
    Closed,
}

#[derive(Clone)]
enum SourceState {
    Pending,
    Ready(Arc<IdentityMaterial>),
    Failed(Arc<Error>),
    Closed,
}

type Listener = Arc<dyn Fn(Arc<IdentityMaterial>) + Send + Sync>;

/// Handle returned by [`IdentitySource::watch`], used to unregister
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Shared {
    state: watch::Sender<SourceState>,
    listeners: RwLock<Vec<(WatchId, Listener)>>,
    next_listener: AtomicU64,
    generation: AtomicU64,
    disconnected: Mutex<bool>,
}

impl Shared {
    fn has_material(&self) -> bool {
        matches!(&*self.state.borrow(), SourceState::Ready(_))
    }

    fn publish(&self, material: IdentityMaterial) {
        let material = Arc::new(material);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            spiffe_id = %material.spiffe_id(),
            serial = material.serial_number(),
            not_after = %material.not_after(),
            generation,
            "Identity material updated"
        );

        let previous = self.state.send_replace(SourceState::Ready(material.clone()));
        if matches!(previous, SourceState::Closed) {
            // Lost a race with close(); stay closed.
            self.state.send_replace(SourceState::Closed);
            return;
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(material.clone());
        }
    }

    fn fail(&self, err: Error) {
        error!(error = %err, "Initial identity fetch failed");
        self.state.send_if_modified(|state| match state {
            SourceState::Pending => {
                *state = SourceState::Failed(Arc::new(err));
                true
            }
            _ => false,
        });
    }

    fn disconnect(&self, reason: &str) {
        *self.disconnected.lock() = true;
        if self.has_material() {
            error!(reason, "Identity subscription lost, keeping last good material");
        } else {
            self.fail(Error::Unreachable(reason.to_string()));
        }
    }
}

/// Process-wide view of the workload's current identity
pub struct IdentitySource {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    fetch_timeout: Duration,
}

impl IdentitySource {
    /// Subscribe to `provider` on a background task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(provider: Arc<dyn IdentityProvider>, fetch_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SourceState::Pending);
        let shared = Arc::new(Shared {
            state,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            disconnected: Mutex::new(false),
        });

        let task = tokio::spawn(run_subscription(provider, shared.clone()));

        IdentitySource {
            shared,
            task: Mutex::new(Some(task)),
            fetch_timeout,
        }
    }

    /// Connect to the SPIFFE Workload API described by `config`
    pub fn workload_api(config: &WorkloadApiConfig) -> Self {
        let client = crate::workload::WorkloadApiClient::new(config.clone());
        Self::new(Arc::new(client), config.fetch_timeout())
    }

    /// Return the current snapshot, waiting for the provider's first answer
    ///
    /// A first answer that does not arrive within the fetch timeout surfaces as
    /// [`Error::Unreachable`]. A failed initial fetch is returned to every
    /// caller.
    pub async fn fetch(&self) -> Result<Arc<IdentityMaterial>> {
        let mut rx = self.shared.state.subscribe();

        let waited = tokio::time::timeout(
            self.fetch_timeout,
            rx.wait_for(|state| !matches!(state, SourceState::Pending)),
        )
        .await;

        let state = match waited {
            Err(_) => {
                return Err(Error::Unreachable(format!(
                    "no identity from provider within {:?}",
                    self.fetch_timeout
                )))
            }
            Ok(Err(_)) => return Err(Error::SourceClosed),
            Ok(Ok(state)) => state.clone(),
        };

        match state {
            SourceState::Ready(material) => Ok(material),
            SourceState::Failed(err) => Err(err.replay()),
            SourceState::Closed => Err(Error::SourceClosed),
            SourceState::Pending => Err(Error::Unreachable("identity still pending".into())),
        }
    }

    /// Return the current snapshot without waiting
    pub fn current(&self) -> Option<Arc<IdentityMaterial>> {
        match &*self.shared.state.borrow() {
            SourceState::Ready(material) => Some(material.clone()),
            _ => None,
        }
    }

    /// Number of snapshots published so far
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn status(&self) -> SourceStatus {
        match &*self.shared.state.borrow() {
            SourceState::Pending => SourceStatus::Pending,
            SourceState::Failed(_) => SourceStatus::Failed,
            SourceState::Closed => SourceStatus::Closed,
            SourceState::Ready(_) if *self.shared.disconnected.lock() => {
                SourceStatus::Disconnected
            }
            SourceState::Ready(_) => SourceStatus::Active,
        }
    }

    /// Register a callback invoked with every new snapshot
    ///
    /// Callbacks run on the subscription task in emission order. Each
    /// invocation replaces whatever the previous one delivered.
    pub fn watch<F>(&self, on_rotate: F) -> WatchId
    where
        F: Fn(Arc<IdentityMaterial>) + Send + Sync + 'static,
    {
        let id = WatchId(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));
        self.shared.listeners.write().push((id, Arc::new(on_rotate)));
        debug!(watch_id = id.0, "Registered identity listener");
        id
    }

    /// Remove a callback registered with [`watch`](Self::watch)
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Receiver that observes every state change, for async consumers
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<IdentityMaterial>>> {
        let mut states = self.shared.state.subscribe();
        let initial = match &*states.borrow_and_update() {
            SourceState::Ready(material) => Some(material.clone()),
            _ => None,
        };
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let next = match &*states.borrow_and_update() {
                    SourceState::Ready(material) => Some(material.clone()),
                    SourceState::Closed => None,
                    _ => continue,
                };
                let closed = next.is_none();
                if tx.send(next).is_err() || closed {
                    break;
                }
            }
        });

        rx
    }

    /// Stop the subscription and release the provider connection
    ///
    /// Idempotent. Snapshots already handed out stay valid until their
    /// holders drop them.
    pub fn close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            self.shared.state.send_replace(SourceState::Closed);
            self.shared.listeners.write().clear();
            info!("Identity source closed");
        }
    }
}

impl Drop for IdentitySource {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_subscription(provider: Arc<dyn IdentityProvider>, shared: Arc<Shared>) {
    let mut updates = match provider.subscribe().await {
        Ok(updates) => updates,
        Err(err) => {
            shared.fail(err);
            return;
        }
    };

    while let Some(update) = updates.next().await {
        match update {
            Ok(material) => shared.publish(material),
            Err(Error::Malformed(reason)) if shared.has_material() => {
                warn!(reason, "Discarding malformed identity update");
            }
            Err(err) if shared.has_material() => {
                shared.disconnect(&err.to_string());
                return;
            }
            Err(err) => {
                shared.fail(err);
                return;
            }
        }
    }

    shared.disconnect("provider closed the identity stream");
}

/// Provider fed by the caller instead of an external service
///
/// Useful for credentials already present on disk and for exercising rotation.
pub struct StaticIdentityProvider {
    sender: mpsc::UnboundedSender<Result<IdentityMaterial>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<IdentityMaterial>>>>,
}

impl StaticIdentityProvider {
    /// Create a provider with nothing queued
    pub fn empty() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        StaticIdentityProvider {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Create a provider whose first update is `material`
    pub fn new(material: IdentityMaterial) -> Self {
        let provider = Self::empty();
        provider.rotate(material);
        provider
    }

    /// Load `svid.pem`, `svid_key.pem` and `bundle.pem` style files
    pub fn from_pem_files(
        cert_chain: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        bundle: impl AsRef<Path>,
    ) -> Result<Self> {
        let chain_pem = std::fs::read(cert_chain)?;
        let key_pem = zeroize::Zeroizing::new(std::fs::read(private_key)?);
        let bundle_pem = std::fs::read(bundle)?;

        let material = IdentityMaterial::from_pem(&chain_pem, &key_pem, &bundle_pem)?;
        Ok(Self::new(material))
    }

    /// Emit a new snapshot
    pub fn rotate(&self, material: IdentityMaterial) {
        // The receiver only goes away with the subscription; nothing to deliver to then.
        let _ = self.sender.send(Ok(material));
    }

    /// Emit a failure
    pub fn fail(&self, err: Error) {
        let _ = self.sender.send(Err(err));
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityUpdates>> {
        Box::pin(async move {
            let receiver = self.receiver.lock().take().ok_or_else(|| {
                Error::Unreachable("static provider supports a single subscription".into())
            })?;
            Ok(UnboundedReceiverStream::new(receiver).boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCa;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn wait_for_generation(source: &IdentitySource, generation: u64) {
        let mut rx = source.shared.state.subscribe();
        tokio::time::timeout(TIMEOUT, async {
            while source.generation() < generation {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_returns_initial_material() {
        let ca = TestCa::new("example.org");
        let provider = StaticIdentityProvider::new(ca.material("spiffe://example.org/web"));
        let source = IdentitySource::new(Arc::new(provider), TIMEOUT);

        let material = source.fetch().await.unwrap();
        assert_eq!(material.spiffe_id().to_string(), "spiffe://example.org/web");
        assert_eq!(source.status(), SourceStatus::Active);
        assert_eq!(source.generation(), 1);
    }

    #[tokio::test]
    async fn test_fetch_times_out_as_unreachable() {
        let source = IdentitySource::new(
            Arc::new(StaticIdentityProvider::empty()),
            Duration::from_millis(50),
        );

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_initial_fetch_is_fatal() {
        let provider = StaticIdentityProvider::empty();
        provider.fail(Error::malformed("leaf SAN mismatch"));
        let source = IdentitySource::new(Arc::new(provider), TIMEOUT);

        assert!(matches!(source.fetch().await, Err(Error::Malformed(_))));
        assert_eq!(source.status(), SourceStatus::Failed);
        // Every later caller sees the same failure.
        assert!(matches!(source.fetch().await, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn test_unauthenticated_initial_fetch_is_reported() {
        let provider = StaticIdentityProvider::empty();
        provider.fail(Error::Unauthenticated("no registration entry".into()));
        let source = IdentitySource::new(Arc::new(provider), TIMEOUT);

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rotation_swaps_snapshot_and_notifies_in_order() {
        let ca = TestCa::new("example.org");
        let provider = Arc::new(StaticIdentityProvider::new(
            ca.material("spiffe://example.org/web"),
        ));
        let source = IdentitySource::new(provider.clone(), TIMEOUT);
        let first = source.fetch().await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        source.watch(move |material| {
            let _ = seen_tx.send(material.serial_number().to_string());
        });

        let second = ca.material("spiffe://example.org/web");
        let third = ca.material("spiffe://example.org/web");
        let expected = vec![
            second.serial_number().to_string(),
            third.serial_number().to_string(),
        ];
        provider.rotate(second);
        provider.rotate(third);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let serial = tokio::time::timeout(TIMEOUT, seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(serial);
        }
        assert_eq!(seen, expected);
        assert_eq!(source.generation(), 3);
        let current = source.fetch().await.unwrap();
        assert_eq!(current.serial_number(), expected[1]);
        // The old snapshot is untouched and still usable by whoever holds it.
        assert_ne!(first.serial_number(), current.serial_number());
        assert!(!first.is_expired());
    }

    #[tokio::test]
    async fn test_malformed_rotation_keeps_last_good_material() {
        let ca = TestCa::new("example.org");
        let provider = Arc::new(StaticIdentityProvider::new(
            ca.material("spiffe://example.org/web"),
        ));
        let source = IdentitySource::new(provider.clone(), TIMEOUT);
        let first = source.fetch().await.unwrap();

        provider.fail(Error::malformed("bad rotation"));
        let next = ca.material("spiffe://example.org/web");
        let next_serial = next.serial_number().to_string();
        provider.rotate(next);
        wait_for_generation(&source, 2).await;

        assert_eq!(source.status(), SourceStatus::Active);
        let current = source.fetch().await.unwrap();
        assert_eq!(current.serial_number(), next_serial);
        assert_ne!(current.serial_number(), first.serial_number());
    }

    #[tokio::test]
    async fn test_lost_subscription_keeps_serving_material() {
        let ca = TestCa::new("example.org");
        let provider = Arc::new(StaticIdentityProvider::new(
            ca.material("spiffe://example.org/web"),
        ));
        let source = IdentitySource::new(provider.clone(), TIMEOUT);
        let first = source.fetch().await.unwrap();

        provider.fail(Error::Unreachable("agent restarted".into()));
        tokio::time::timeout(TIMEOUT, async {
            while source.status() != SourceStatus::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let current = source.fetch().await.unwrap();
        assert_eq!(current.serial_number(), first.serial_number());
    }

    #[tokio::test]
    async fn test_unwatch_stops_notifications() {
        let ca = TestCa::new("example.org");
        let provider = Arc::new(StaticIdentityProvider::new(
            ca.material("spiffe://example.org/web"),
        ));
        let source = IdentitySource::new(provider.clone(), TIMEOUT);
        source.fetch().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = source.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(source.unwatch(id));
        assert!(!source.unwatch(id));

        provider.rotate(ca.material("spiffe://example.org/web"));
        wait_for_generation(&source, 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ca = TestCa::new("example.org");
        let provider = StaticIdentityProvider::new(ca.material("spiffe://example.org/web"));
        let source = IdentitySource::new(Arc::new(provider), TIMEOUT);
        let held = source.fetch().await.unwrap();

        source.close();
        source.close();

        assert_eq!(source.status(), SourceStatus::Closed);
        assert!(source.current().is_none());
        assert!(matches!(source.fetch().await, Err(Error::SourceClosed)));
        // Snapshots handed out before close remain intact.
        assert_eq!(held.spiffe_id().to_string(), "spiffe://example.org/web");
    }

    #[tokio::test]
    async fn test_subscribe_receives_rotations() {
        let ca = TestCa::new("example.org");
        let provider = Arc::new(StaticIdentityProvider::new(
            ca.material("spiffe://example.org/web"),
        ));
        let source = IdentitySource::new(provider.clone(), TIMEOUT);
        source.fetch().await.unwrap();

        let mut rx = source.subscribe();
        assert!(rx.borrow().is_some());

        let next = ca.material("spiffe://example.org/web");
        let serial = next.serial_number().to_string();
        provider.rotate(next);

        tokio::time::timeout(TIMEOUT, rx.changed())
            .await
            .unwrap()
            .unwrap();
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.serial_number(), serial);
    }

    #[tokio::test]
    async fn test_static_provider_single_subscription() {
        let provider = StaticIdentityProvider::empty();
        assert!(provider.subscribe().await.is_ok());
        assert!(matches!(
            provider.subscribe().await,
            Err(Error::Unreachable(_))
        ));
    }
}
