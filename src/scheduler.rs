use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::advertisement::{DeviceDiscovered, ScanFilterKind};
use crate::error::GatewayError;
use crate::events::{AdapterStateStore, EventBus, GatewayEvent};
use crate::lifecycle::ConnectionManager;
use crate::radio::{Radio, ScanRecord};

/// A watched address and its most recent sighting.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct WatchEntry {
    address: String,
    last_seen: Option<DeviceDiscovered>,
}

impl WatchEntry {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Most recent scan result for the address; `None` until first seen.
    #[must_use]
    pub fn last_seen(&self) -> Option<&DeviceDiscovered> {
        self.last_seen.as_ref()
    }
}

/// Scan timing and filtering settings.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScanTiming {
    pub watch_period: Duration,
    pub watch_burst: Duration,
    pub scan_timeout: Duration,
    pub scan_filter: ScanFilterKind,
}

#[derive(Debug)]
enum ScanActivity {
    Idle,
    Watch {
        burst: u64,
        reported: HashSet<String>,
    },
    AdHoc {
        filter: ScanFilterKind,
        seen: HashSet<String>,
        found: Vec<DeviceDiscovered>,
        cancel: CancellationToken,
        finished: CancellationToken,
    },
}

#[derive(Debug)]
struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single scan slot, the watch list and the periodic timer.
#[derive(Debug)]
pub struct ScanScheduler {
    radio: Arc<dyn Radio>,
    events: EventBus,
    adapter_state: Arc<AdapterStateStore>,
    connections: Arc<ConnectionManager>,
    timing: ScanTiming,
    activity: Mutex<ScanActivity>,
    watch_list: Mutex<HashMap<String, WatchEntry>>,
    next_burst: AtomicU64,
    kick: Notify,
    timer: Mutex<Option<TimerHandle>>,
}

impl ScanScheduler {
    pub(crate) fn new(
        radio: Arc<dyn Radio>,
        events: EventBus,
        adapter_state: Arc<AdapterStateStore>,
        connections: Arc<ConnectionManager>,
        timing: ScanTiming,
    ) -> Self {
        Self {
            radio,
            events,
            adapter_state,
            connections,
            timing,
            activity: Mutex::new(ScanActivity::Idle),
            watch_list: Mutex::new(HashMap::new()),
            next_burst: AtomicU64::new(0),
            kick: Notify::new(),
            timer: Mutex::new(None),
        }
    }

    /// Starts the periodic timer. Calling it again while running is a no-op.
    pub(crate) async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let stopped = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(scheduler.timing.watch_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    _ = ticker.tick() => scheduler.run_cycle().await,
                    () = scheduler.kick.notified() => scheduler.watch_burst().await,
                }
            }
            debug!("scan timer stopped");
        });
        *timer = Some(TimerHandle { cancel, task });
        info!(
            period_secs = self.timing.watch_period.as_secs(),
            "scan timer started"
        );
    }

    /// Stops the timer and ends any ad-hoc scan.
    pub(crate) async fn stop(&self) {
        if let Some(TimerHandle { cancel, task }) = self.timer.lock().await.take() {
            cancel.cancel();
            if let Err(error) = task.await {
                warn!(%error, "scan timer task failed");
            }
        }
        self.stop_scan().await;
    }

    /// One timer tick: a watch burst, then an RSSI refresh of connected devices.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_cycle(&self) {
        self.watch_burst().await;
        self.connections.refresh_rssi().await;
    }

    /// Adds addresses to the watch list and requests an immediate burst.
    /// Returns the full watch list.
    pub async fn watch<I, S>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut watch_list = self.watch_list.lock().await;
            for address in addresses {
                let address = address.into();
                watch_list
                    .entry(address.clone())
                    .or_insert_with(|| WatchEntry {
                        address,
                        last_seen: None,
                    });
            }
        }
        self.kick.notify_one();
        self.watched().await
    }

    /// Removes addresses from the watch list. A burst already running is not
    /// interrupted. Returns the remaining watch list.
    pub async fn unwatch<I, S>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut watch_list = self.watch_list.lock().await;
            for address in addresses {
                watch_list.remove(address.as_ref());
            }
        }
        self.watched().await
    }

    pub async fn watched(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.watch_list.lock().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Snapshot of every watch entry, sorted by address.
    pub async fn beacons(&self) -> Vec<WatchEntry> {
        let mut entries: Vec<WatchEntry> = self.watch_list.lock().await.values().cloned().collect();
        entries.sort_by(|left, right| left.address.cmp(&right.address));
        entries
    }

    /// Runs a bounded scan of the watch list unless another scan is active.
    #[instrument(skip(self), level = "debug")]
    pub async fn watch_burst(&self) {
        let watched = self.watch_list.lock().await.len();
        if watched == 0 {
            trace!("nothing to watch");
            return;
        }

        let burst = self.next_burst.fetch_add(1, Ordering::SeqCst);
        {
            let mut activity = self.activity.lock().await;
            if !matches!(*activity, ScanActivity::Idle) {
                debug!("scan already active; skipping watch burst");
                return;
            }
            if let Err(error) = self.radio.start_scan().await {
                warn!(%error, "failed to start watch scan");
                self.events.send(GatewayEvent::AdapterError {
                    message: error.to_string(),
                });
                return;
            }
            *activity = ScanActivity::Watch {
                burst,
                reported: HashSet::new(),
            };
        }
        self.adapter_state.update(|state| state.scanning = true);
        info!(watched, burst, "watch burst started");

        sleep(self.timing.watch_burst).await;

        let mut activity = self.activity.lock().await;
        match *activity {
            ScanActivity::Watch { burst: current, .. } if current == burst => {
                if let Err(error) = self.radio.stop_scan().await {
                    warn!(%error, "failed to stop watch scan");
                }
                *activity = ScanActivity::Idle;
                drop(activity);
                self.adapter_state.update(|state| state.scanning = false);
                debug!(burst, "watch burst finished");
            }
            _ => debug!(burst, "watch burst was taken over by an ad-hoc scan"),
        }
    }

    /// Runs an ad-hoc scan until the timeout or [`ScanScheduler::stop_scan`],
    /// then emits `ScanEnded` and returns the deduplicated results.
    ///
    /// A running watch burst is taken over rather than waited for.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ScanInProgress`] when another ad-hoc scan is
    /// running, and radio errors from starting the scan.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_scan(
        &self,
        filter: Option<ScanFilterKind>,
        timeout: Option<Duration>,
    ) -> Result<Vec<DeviceDiscovered>, GatewayError> {
        let filter = filter.unwrap_or(self.timing.scan_filter);
        let timeout = timeout.unwrap_or(self.timing.scan_timeout);
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        {
            let mut activity = self.activity.lock().await;
            match *activity {
                ScanActivity::AdHoc { .. } => return Err(GatewayError::ScanInProgress),
                ScanActivity::Watch { burst, .. } => {
                    info!(burst, "ad-hoc scan takes over the running watch burst");
                }
                ScanActivity::Idle => self.radio.start_scan().await?,
            }
            *activity = ScanActivity::AdHoc {
                filter,
                seen: HashSet::new(),
                found: Vec::new(),
                cancel: cancel.clone(),
                finished: finished.clone(),
            };
        }
        self.adapter_state.update(|state| state.scanning = true);
        info!(?filter, timeout_secs = timeout.as_secs_f32(), "ad-hoc scan started");

        tokio::select! {
            () = sleep(timeout) => {}
            () = cancel.cancelled() => debug!("ad-hoc scan stopped early"),
        }

        let mut activity = self.activity.lock().await;
        if let Err(error) = self.radio.stop_scan().await {
            warn!(%error, "failed to stop ad-hoc scan");
        }
        let found = match std::mem::replace(&mut *activity, ScanActivity::Idle) {
            ScanActivity::AdHoc { found, .. } => found,
            other => {
                *activity = other;
                Vec::new()
            }
        };
        drop(activity);

        self.adapter_state.update(|state| state.scanning = false);
        self.events.send(GatewayEvent::ScanEnded);
        finished.cancel();
        info!(found = found.len(), "ad-hoc scan ended");
        Ok(found)
    }

    /// Ends a running ad-hoc scan early and waits until the radio has stopped.
    /// Does nothing when no ad-hoc scan is running.
    pub async fn stop_scan(&self) {
        let finished = match &*self.activity.lock().await {
            ScanActivity::AdHoc {
                cancel, finished, ..
            } => {
                cancel.cancel();
                finished.clone()
            }
            _ => return,
        };
        finished.cancelled().await;
    }

    pub async fn is_scanning(&self) -> bool {
        !matches!(*self.activity.lock().await, ScanActivity::Idle)
    }

    /// Routes one scan result to the running scan session.
    pub(crate) async fn handle_scan_result(&self, record: ScanRecord) {
        let device = record.into_discovered();
        let mut activity = self.activity.lock().await;
        match &mut *activity {
            ScanActivity::Idle => trace!(address = %device.address(), "scan result outside a scan"),
            ScanActivity::Watch { reported, .. } => {
                let address = device.address().as_str().to_string();
                let updated = {
                    let mut watch_list = self.watch_list.lock().await;
                    watch_list.get_mut(&address).map(|entry| {
                        entry.last_seen = Some(device.clone());
                        entry.clone()
                    })
                };
                let Some(entry) = updated else {
                    return;
                };
                debug!(%address, rssi = ?device.rssi(), "watched device seen");
                self.events.send(GatewayEvent::BeaconUpdated(entry));
                if reported.insert(address) {
                    self.events.send(GatewayEvent::DeviceDiscovered(device));
                }
            }
            ScanActivity::AdHoc {
                filter,
                seen,
                found,
                ..
            } => {
                if !filter.allows(device.advertisement()) {
                    trace!(address = %device.address(), "filtered scan result");
                    return;
                }
                if seen.insert(device.dedup_key()) {
                    found.push(device.clone());
                    self.events.send(GatewayEvent::DeviceDiscovered(device));
                }
            }
        }
    }
}
