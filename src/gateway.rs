use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::address::Address;
use crate::advertisement::{DeviceDiscovered, ScanFilterKind};
use crate::attribute::Service;
use crate::cache::AttributeCache;
use crate::config::GatewayConfig;
use crate::discovery::GattClient;
use crate::error::GatewayError;
use crate::events::{AdapterState, AdapterStateStore, EventBus, GatewayEvent};
use crate::lifecycle::{ConnectionManager, ConnectionRecord};
use crate::radio::{Radio, RadioEvent};
use crate::scheduler::{ScanScheduler, WatchEntry};
use crate::subscriptions::{Subscription, SubscriptionFanout};

#[derive(Debug)]
struct DemuxHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Entry point tying the radio to connections, attribute caching,
/// notification fan-out and scanning.
///
/// ```
/// # async fn demo() -> Result<(), blegate::GatewayError> {
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use blegate::{FakeRadio, FakeRadioConfig, Gateway, GatewayConfig};
///
/// let radio = Arc::new(FakeRadio::new(FakeRadioConfig::builder().build()));
/// let gateway = Gateway::new(radio, GatewayConfig::default());
/// gateway.open().await?;
/// gateway.ensure_available().await?;
/// let found = gateway
///     .start_scan(None, Some(Duration::from_millis(10)))
///     .await?;
/// assert!(found.is_empty());
/// gateway.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Gateway {
    radio: Arc<dyn Radio>,
    config: GatewayConfig,
    events: EventBus,
    adapter_state: Arc<AdapterStateStore>,
    cache: Arc<AttributeCache>,
    subscriptions: Arc<SubscriptionFanout>,
    connections: Arc<ConnectionManager>,
    gatt: GattClient,
    scheduler: Arc<ScanScheduler>,
    demux: Mutex<Option<DemuxHandle>>,
}

impl Gateway {
    #[must_use]
    pub fn new(radio: Arc<dyn Radio>, config: GatewayConfig) -> Self {
        let events = EventBus::new(config.event_capacity());
        let adapter_state = Arc::new(AdapterStateStore::new(events.clone()));
        let cache = Arc::new(AttributeCache::new());
        let subscriptions = Arc::new(SubscriptionFanout::new(
            Arc::clone(&radio),
            Arc::clone(&cache),
            events.clone(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&radio),
            events.clone(),
            Arc::clone(&adapter_state),
            Arc::clone(&subscriptions),
            config.backoff(),
        ));
        let gatt = GattClient::new(
            Arc::clone(&radio),
            Arc::clone(&cache),
            Arc::clone(&connections),
            Arc::clone(&subscriptions),
            events.clone(),
        );
        let scheduler = Arc::new(ScanScheduler::new(
            Arc::clone(&radio),
            events.clone(),
            Arc::clone(&adapter_state),
            Arc::clone(&connections),
            config.scan_timing(),
        ));

        Self {
            radio,
            config,
            events,
            adapter_state,
            cache,
            subscriptions,
            connections,
            gatt,
            scheduler,
            demux: Mutex::new(None),
        }
    }

    /// Initialises the radio, starts routing its events and starts the scan
    /// timer. Addresses listed in the configuration are watched immediately.
    ///
    /// # Errors
    ///
    /// Returns radio errors from initialisation.
    #[instrument(skip(self), level = "info")]
    pub async fn open(&self) -> Result<(), GatewayError> {
        {
            let mut demux = self.demux.lock().await;
            if demux.is_none() {
                *demux = Some(self.spawn_demux());
            }
        }

        let enabled = self.radio.initialize().await?;
        self.adapter_state.update(|state| {
            state.ble_enabled = enabled;
            if enabled {
                state.available = true;
            }
        });
        self.scheduler.start().await;
        if !self.config.watch().is_empty() {
            self.scheduler.watch(self.config.watch().iter().cloned()).await;
        }
        info!(enabled, "gateway opened");
        Ok(())
    }

    /// Stops scanning and event routing and clears every availability flag.
    #[instrument(skip(self), level = "info")]
    pub async fn close(&self) {
        self.scheduler.stop().await;
        if let Some(DemuxHandle { cancel, task }) = self.demux.lock().await.take() {
            cancel.cancel();
            if let Err(error) = task.await {
                warn!(%error, "radio event task failed");
            }
        }
        self.adapter_state.update(|state| *state = AdapterState::default());
        info!("gateway closed");
    }

    /// Checks permission, radio power and location services, requesting
    /// what can be requested, and mirrors the outcome into [`AdapterState`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PermissionDenied`],
    /// [`GatewayError::RadioDisabled`] or [`GatewayError::LocationRequired`].
    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_available(&self) -> Result<(), GatewayError> {
        let result = self.check_availability().await;
        let available = result.is_ok();
        self.adapter_state.update(|state| state.available = available);
        if let Err(error) = &result {
            warn!(%error, "adapter unavailable");
        }
        result
    }

    async fn check_availability(&self) -> Result<(), GatewayError> {
        if !self.radio.has_permission().await? && !self.radio.request_permission().await? {
            return Err(GatewayError::PermissionDenied);
        }
        let enabled = self.radio.is_enabled().await?;
        self.adapter_state.update(|state| state.ble_enabled = enabled);
        if !enabled {
            return Err(GatewayError::RadioDisabled);
        }
        if !self.radio.has_location().await? && !self.radio.request_location().await? {
            return Err(GatewayError::LocationRequired);
        }
        Ok(())
    }

    fn spawn_demux(&self) -> DemuxHandle {
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let mut radio_events = self.radio.events();
        let router = EventRouter {
            scheduler: Arc::clone(&self.scheduler),
            subscriptions: Arc::clone(&self.subscriptions),
            connections: Arc::clone(&self.connections),
            adapter_state: Arc::clone(&self.adapter_state),
        };

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = stopped.cancelled() => break,
                    event = radio_events.recv() => event,
                };
                match event {
                    Ok(event) => router.route(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "radio event router lagged");
                    }
                    Err(RecvError::Closed) => {
                        info!("radio event stream closed");
                        break;
                    }
                }
            }
            debug!("radio event router stopped");
        });
        DemuxHandle { cancel, task }
    }

    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.adapter_state.current()
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<GatewayEvent> {
        self.events.stream()
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Connects to a device. See [`ConnectionManager::connect`].
    ///
    /// # Errors
    ///
    /// Propagates connection errors.
    pub async fn connect(&self, address: &Address) -> Result<ConnectionRecord, GatewayError> {
        self.connections.connect(address).await
    }

    /// Drops the link to a device. The cached attribute tree is kept.
    ///
    /// # Errors
    ///
    /// Propagates teardown errors other than "already disconnected".
    pub async fn disconnect(&self, address: &str) -> Result<(), GatewayError> {
        self.connections.disconnect(address).await
    }

    /// # Errors
    ///
    /// Propagates discovery errors.
    pub async fn discover(&self, address: &str) -> Result<Arc<Vec<Service>>, GatewayError> {
        self.gatt.discover(address).await
    }

    /// Cached attribute tree from the last discovery of `address`.
    pub async fn services(&self, address: &str) -> Option<Arc<Vec<Service>>> {
        self.cache.services(address).await
    }

    /// # Errors
    ///
    /// Propagates path, lookup and radio errors.
    pub async fn read_characteristic(
        &self,
        address: &str,
        path: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        self.gatt.read_characteristic(address, path).await
    }

    /// # Errors
    ///
    /// Propagates path, lookup and radio errors.
    pub async fn write_characteristic(
        &self,
        address: &str,
        path: &str,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), GatewayError> {
        self.gatt
            .write_characteristic(address, path, bytes, ack)
            .await
    }

    /// # Errors
    ///
    /// Propagates path, lookup and radio errors.
    pub async fn read_descriptor(&self, address: &str, path: &str) -> Result<Vec<u8>, GatewayError> {
        self.gatt.read_descriptor(address, path).await
    }

    /// # Errors
    ///
    /// Propagates path, lookup, subscription and radio errors.
    pub async fn write_descriptor(
        &self,
        address: &str,
        path: &str,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), GatewayError> {
        self.gatt.write_descriptor(address, path, bytes, ack).await
    }

    /// # Errors
    ///
    /// Propagates path, lookup and radio errors.
    pub async fn subscribe(&self, address: &str, path: &str) -> Result<Subscription, GatewayError> {
        self.subscriptions.subscribe(address, path).await
    }

    /// # Errors
    ///
    /// Propagates path, lookup and radio errors.
    pub async fn unsubscribe(&self, address: &str, path: &str) -> Result<(), GatewayError> {
        self.subscriptions.unsubscribe(address, path).await
    }

    pub async fn watch<I, S>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scheduler.watch(addresses).await
    }

    pub async fn unwatch<I, S>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scheduler.unwatch(addresses).await
    }

    pub async fn beacons(&self) -> Vec<WatchEntry> {
        self.scheduler.beacons().await
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::ScanInProgress`] or radio errors.
    pub async fn start_scan(
        &self,
        filter: Option<ScanFilterKind>,
        timeout: Option<Duration>,
    ) -> Result<Vec<DeviceDiscovered>, GatewayError> {
        self.scheduler.start_scan(filter, timeout).await
    }

    pub async fn stop_scan(&self) {
        self.scheduler.stop_scan().await;
    }

    pub async fn connections(&self) -> Vec<ConnectionRecord> {
        self.connections.connections().await
    }

    pub async fn connection(&self, address: &str) -> Option<ConnectionRecord> {
        self.connections.connection(address).await
    }

    pub async fn retry_wait(&self, address: &str) -> Duration {
        self.connections.retry_wait(address).await
    }

    #[must_use]
    pub fn scheduler(&self) -> &ScanScheduler {
        &self.scheduler
    }
}

struct EventRouter {
    scheduler: Arc<ScanScheduler>,
    subscriptions: Arc<SubscriptionFanout>,
    connections: Arc<ConnectionManager>,
    adapter_state: Arc<AdapterStateStore>,
}

impl EventRouter {
    async fn route(&self, event: RadioEvent) {
        match event {
            RadioEvent::ScanResult(record) => self.scheduler.handle_scan_result(record).await,
            RadioEvent::Notification {
                address,
                path,
                value,
            } => {
                self.subscriptions
                    .handle_notification(&address, &path, &value)
                    .await;
            }
            RadioEvent::LinkLost { address } => {
                self.connections.handle_link_lost(&address).await;
            }
            RadioEvent::AdapterEnabled(enabled) => {
                trace!(enabled, "adapter power changed");
                self.adapter_state.update(|state| {
                    state.ble_enabled = enabled;
                    if !enabled {
                        state.available = false;
                    }
                });
            }
        }
    }
}
