use std::time::Duration;

use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::{DurationSeconds, serde_as};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::advertisement::DeviceDiscovered;
use crate::scheduler::WatchEntry;

/// Aggregate availability flags of the gateway.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct AdapterState {
    pub available: bool,
    pub ble_enabled: bool,
    pub scanning: bool,
    /// Always false; the gateway never advertises.
    pub advertising: bool,
    pub connecting: bool,
}

/// Events published to gateway listeners.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    ConnectionUp {
        address: String,
    },
    ConnectionDown {
        address: String,
    },
    /// A connect attempt exceeded its timeout; `wait` is the timeout that elapsed.
    ConnectTimedOut {
        address: String,
        #[serde_as(as = "DurationSeconds<u64>")]
        wait: Duration,
    },
    CharacteristicValueChanged {
        address: String,
        path: String,
        #[serde_as(as = "Hex")]
        value: Vec<u8>,
    },
    DescriptorValueChanged {
        address: String,
        path: String,
        #[serde_as(as = "Hex")]
        value: Vec<u8>,
    },
    DeviceDiscovered(DeviceDiscovered),
    /// Terminal marker of an ad-hoc scan.
    ScanEnded,
    DeviceUpdated {
        address: String,
        rssi: i16,
    },
    BeaconUpdated(WatchEntry),
    StateChanged(AdapterState),
    AdapterError {
        message: String,
    },
}

/// Broadcast fan-out of [`GatewayEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event; having no listeners is not an error.
    pub fn send(&self, event: GatewayEvent) {
        trace!(?event, "publishing gateway event");
        if self.sender.send(event).is_err() {
            trace!("no gateway event listeners");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Returns a stream of events; lagged receivers yield an error item.
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<GatewayEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// Holds the current [`AdapterState`] and announces real changes.
#[derive(Debug)]
pub struct AdapterStateStore {
    state: watch::Sender<AdapterState>,
    events: EventBus,
}

impl AdapterStateStore {
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        let (state, _) = watch::channel(AdapterState::default());
        Self { state, events }
    }

    #[must_use]
    pub fn current(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Applies `change` and emits `StateChanged` when any flag differs afterwards.
    pub fn update(&self, change: impl FnOnce(&mut AdapterState)) -> bool {
        let changed = self.state.send_if_modified(|state| {
            let before = *state;
            change(state);
            *state != before
        });
        if changed {
            self.events.send(GatewayEvent::StateChanged(self.current()));
        }
        changed
    }

    /// Receiver that observes every state revision.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }
}
