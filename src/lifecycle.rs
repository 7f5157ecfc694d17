use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_with::{DurationSeconds, serde_as};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::address::Address;
use crate::advertisement::{Advertisement, DeviceDiscovered};
use crate::error::{GatewayError, RadioError};
use crate::events::{AdapterStateStore, EventBus, GatewayEvent};
use crate::radio::{Radio, TeardownPrimitive};
use crate::subscriptions::SubscriptionFanout;

/// Additive connect-timeout backoff.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectBackoff {
    floor: Duration,
    increment: Duration,
    ceiling: Duration,
}

impl ConnectBackoff {
    #[must_use]
    pub fn new(floor: Duration, increment: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            increment,
            ceiling,
        }
    }

    #[must_use]
    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Wait to use after a timeout at `current`.
    #[must_use]
    pub fn grow(&self, current: Duration) -> Duration {
        (current + self.increment).min(self.ceiling)
    }
}

/// A device known to be connected.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ConnectionRecord {
    address: Address,
    #[serde(with = "time::serde::timestamp")]
    connected_at: OffsetDateTime,
    #[serde_as(as = "DurationSeconds<u64>")]
    retry_wait: Duration,
    rssi: Option<i16>,
}

impl ConnectionRecord {
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn connected_at(&self) -> OffsetDateTime {
        self.connected_at
    }

    #[must_use]
    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Last sampled RSSI, if any sample succeeded.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

enum ConnectFailure {
    TimedOut,
    Radio(RadioError),
}

/// Counts an in-flight connect and mirrors it into the adapter state.
struct ConnectingGuard<'a> {
    in_flight: &'a AtomicUsize,
    adapter_state: &'a AdapterStateStore,
}

impl<'a> ConnectingGuard<'a> {
    fn new(in_flight: &'a AtomicUsize, adapter_state: &'a AdapterStateStore) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        adapter_state.update(|state| state.connecting = true);
        Self {
            in_flight,
            adapter_state,
        }
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.adapter_state.update(|state| state.connecting = false);
        }
    }
}

/// Owns connection records and drives the connect/disconnect state machine.
///
/// This is the only component that calls the radio's connect and teardown
/// primitives.
#[derive(Debug)]
pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    events: EventBus,
    adapter_state: Arc<AdapterStateStore>,
    subscriptions: Arc<SubscriptionFanout>,
    backoff: ConnectBackoff,
    records: RwLock<HashMap<String, ConnectionRecord>>,
    retry_waits: Mutex<HashMap<String, Duration>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: AtomicUsize,
}

impl ConnectionManager {
    pub(crate) fn new(
        radio: Arc<dyn Radio>,
        events: EventBus,
        adapter_state: Arc<AdapterStateStore>,
        subscriptions: Arc<SubscriptionFanout>,
        backoff: ConnectBackoff,
    ) -> Self {
        Self {
            radio,
            events,
            adapter_state,
            subscriptions,
            backoff,
            records: RwLock::new(HashMap::new()),
            retry_waits: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Connects to a device, or returns the existing record.
    ///
    /// Concurrent calls for one address share a single attempt: later callers
    /// wait for the first and then observe its record.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectTimeout`] when the attempt exceeds the
    /// current retry wait, [`GatewayError::ZombieConnection`] when recovery
    /// from a stale stack state fails, and radio errors otherwise.
    #[instrument(skip(self), level = "debug", fields(address = %address))]
    pub async fn connect(&self, address: &Address) -> Result<ConnectionRecord, GatewayError> {
        if let Some(record) = self.connection(address.as_str()).await {
            trace!("already connected");
            return Ok(record);
        }

        let gate = self.gate(address.as_str()).await;
        let result = {
            let _serialised = gate.lock().await;
            if let Some(record) = self.connection(address.as_str()).await {
                debug!("connected by a concurrent attempt");
                Ok(record)
            } else {
                let _connecting = ConnectingGuard::new(&self.in_flight, &self.adapter_state);
                self.try_connection(address).await
            }
        };
        self.release_gate(address.as_str(), gate).await;
        result
    }

    /// Tears the link down and forgets the device's connection state.
    ///
    /// Safe to call for devices that are not connected.
    ///
    /// # Errors
    ///
    /// Returns an error only when the radio's teardown fails for a reason
    /// other than the link already being gone.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self, address: &str) -> Result<(), GatewayError> {
        self.kill(address).await?;
        self.forget(address).await;
        info!(address, "disconnected");
        Ok(())
    }

    /// Handles an unsolicited disconnect reported by the radio.
    pub(crate) async fn handle_link_lost(&self, address: &str) {
        if self.records.read().await.contains_key(address) {
            warn!(address, "link lost");
            self.forget(address).await;
        } else {
            trace!(address, "ignoring link loss for unknown device");
        }
    }

    /// Samples RSSI for every connected device, one at a time.
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh_rssi(&self) {
        let addresses: Vec<Address> = self
            .connections()
            .await
            .into_iter()
            .map(|record| record.address)
            .collect();

        for address in addresses {
            match self.radio.read_rssi(address.as_str()).await {
                Ok(rssi) => self.record_rssi(&address, rssi).await,
                Err(error) => warn!(%address, %error, "RSSI refresh failed"),
            }
        }
    }

    /// Returns a snapshot of every connection record.
    pub async fn connections(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|left, right| left.address.as_str().cmp(right.address.as_str()));
        records
    }

    pub async fn connection(&self, address: &str) -> Option<ConnectionRecord> {
        self.records.read().await.get(address).cloned()
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.records.read().await.contains_key(address)
    }

    /// Current connect timeout for the address.
    pub async fn retry_wait(&self, address: &str) -> Duration {
        self.retry_waits
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or(self.backoff.floor)
    }

    async fn gate(&self, address: &str) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    /// Drops the address's gate once no other caller holds it.
    async fn release_gate(&self, address: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        // The map and `gate` account for two references.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(address);
        }
    }

    async fn try_connection(&self, address: &Address) -> Result<ConnectionRecord, GatewayError> {
        let wait = self.retry_wait(address.as_str()).await;
        self.kill(address.as_str()).await?;

        match self.timed_connect(address, wait).await {
            Ok(()) => Ok(self.on_connected(address).await),
            Err(ConnectFailure::TimedOut) => Err(self.on_timeout(address, wait).await),
            Err(ConnectFailure::Radio(error)) if error.is_stale_connection() => {
                self.reverify(address, error).await
            }
            Err(ConnectFailure::Radio(error)) if error.is_previously_connected() => {
                self.recover(address, error, wait).await
            }
            Err(ConnectFailure::Radio(error)) => Err(error.into()),
        }
    }

    async fn timed_connect(&self, address: &Address, wait: Duration) -> Result<(), ConnectFailure> {
        debug!(%address, wait_secs = wait.as_secs(), "connecting");
        match timeout(wait, self.radio.connect(address)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ConnectFailure::Radio(error)),
            Err(_elapsed) => Err(ConnectFailure::TimedOut),
        }
    }

    /// The stack claims the device is still connected; ask it again.
    async fn reverify(
        &self,
        address: &Address,
        original: RadioError,
    ) -> Result<ConnectionRecord, GatewayError> {
        match self.radio.is_connected(address.as_str()).await {
            Ok(true) => {
                info!(%address, "stack reports an existing link; adopting it");
                Ok(self.on_connected(address).await)
            }
            Ok(false) => Err(zombie(address, original)),
            Err(error) => {
                debug!(%address, %error, "connection state query failed");
                Err(zombie(address, original))
            }
        }
    }

    /// The stack remembers an earlier link; clear it and retry once.
    async fn recover(
        &self,
        address: &Address,
        original: RadioError,
        wait: Duration,
    ) -> Result<ConnectionRecord, GatewayError> {
        info!(%address, "clearing previous connection state before retrying");
        self.kill(address.as_str()).await?;
        self.events.send(GatewayEvent::ConnectionDown {
            address: address.to_string(),
        });

        match self.timed_connect(address, wait).await {
            Ok(()) => Ok(self.on_connected(address).await),
            Err(ConnectFailure::TimedOut) => Err(self.on_timeout(address, wait).await),
            Err(ConnectFailure::Radio(error)) if error.is_stale_connection() => {
                self.reverify(address, original).await
            }
            Err(ConnectFailure::Radio(error)) => {
                warn!(%address, %error, "retry after clearing previous connection failed");
                Err(zombie(address, original))
            }
        }
    }

    async fn on_connected(&self, address: &Address) -> ConnectionRecord {
        let floor = self.backoff.floor;
        self.retry_waits
            .lock()
            .await
            .insert(address.to_string(), floor);

        let mut record = ConnectionRecord {
            address: address.clone(),
            connected_at: OffsetDateTime::now_utc(),
            retry_wait: floor,
            rssi: None,
        };
        self.records
            .write()
            .await
            .insert(address.to_string(), record.clone());
        info!(%address, "connected");
        self.events.send(GatewayEvent::ConnectionUp {
            address: address.to_string(),
        });

        match self.radio.read_rssi(address.as_str()).await {
            Ok(rssi) => {
                self.record_rssi(address, rssi).await;
                record.rssi = Some(rssi);
            }
            Err(error) => debug!(%address, %error, "initial RSSI sample failed"),
        }
        record
    }

    async fn on_timeout(&self, address: &Address, wait: Duration) -> GatewayError {
        warn!(%address, wait_secs = wait.as_secs(), "connect timed out");
        if let Err(error) = self.kill(address.as_str()).await {
            warn!(%address, %error, "teardown after connect timeout failed");
        }
        self.forget(address.as_str()).await;
        self.events.send(GatewayEvent::ConnectTimedOut {
            address: address.to_string(),
            wait,
        });

        let next = self.backoff.grow(wait);
        self.retry_waits
            .lock()
            .await
            .insert(address.to_string(), next);
        debug!(%address, next_wait_secs = next.as_secs(), "connect timeout grown");

        GatewayError::ConnectTimeout {
            address: address.to_string(),
            wait,
        }
    }

    async fn record_rssi(&self, address: &Address, rssi: i16) {
        if let Some(record) = self.records.write().await.get_mut(address.as_str()) {
            record.rssi = Some(rssi);
        }
        self.events.send(GatewayEvent::DeviceUpdated {
            address: address.to_string(),
            rssi,
        });
        self.events
            .send(GatewayEvent::DeviceDiscovered(DeviceDiscovered::new(
                address.clone(),
                Some(rssi),
                None,
                Advertisement::default(),
            )));
    }

    /// Drops the record and subscriptions, then announces the link as down.
    async fn forget(&self, address: &str) {
        self.records.write().await.remove(address);
        self.subscriptions.invalidate_device(address).await;
        self.events.send(GatewayEvent::ConnectionDown {
            address: address.to_string(),
        });
    }

    /// Drops the link and releases the stack handle, tolerating a link that
    /// is already gone.
    #[instrument(skip(self), level = "trace")]
    async fn kill(&self, address: &str) -> Result<(), GatewayError> {
        let teardown = match self.radio.teardown_primitive() {
            TeardownPrimitive::Disconnect => self.radio.disconnect(address).await,
            TeardownPrimitive::Unbond => self.radio.unbond(address).await,
        };
        match teardown {
            Ok(()) => {}
            Err(error) if error.is_teardown_noop() => trace!(%error, "link already down"),
            Err(error) => return Err(error.into()),
        }

        match self.radio.close(address).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_close_noop() => {
                trace!(%error, "no handle to close");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn zombie(address: &Address, source: RadioError) -> GatewayError {
    GatewayError::ZombieConnection {
        address: address.to_string(),
        source,
    }
}
