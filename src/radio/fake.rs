use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use super::{
    Radio, RadioCharacteristic, RadioEvent, ScanAdvertisement, ScanRecord, TeardownPrimitive,
    WriteMode,
};
use crate::address::Address;
use crate::attribute::{AttributePath, CharacteristicProperties, shorten_uuid};
use crate::codec::RadioValue;
use crate::error::{FixtureError, RadioError};

const EVENT_CAPACITY: usize = 256;

/// Scripted outcome for one connect call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectOutcome {
    Succeed,
    /// The call never resolves.
    Hang,
    Fail(RadioError),
}

/// A descriptor exposed by a fake device.
#[derive(Debug, Clone, Builder)]
pub struct FakeDescriptor {
    #[builder(into)]
    uuid: String,
    #[builder(default)]
    value: Vec<u8>,
}

/// A characteristic exposed by a fake device.
#[derive(Debug, Clone, Builder)]
pub struct FakeCharacteristic {
    #[builder(into)]
    uuid: String,
    properties: CharacteristicProperties,
    #[builder(default)]
    value: Vec<u8>,
    #[builder(default)]
    descriptors: Vec<FakeDescriptor>,
    /// Values pushed as notifications right after a subscribe.
    #[builder(default)]
    notifications: Vec<Vec<u8>>,
    #[builder(default)]
    read_fails: bool,
}

/// A service exposed by a fake device.
#[derive(Debug, Clone, Builder)]
pub struct FakeService {
    #[builder(into)]
    uuid: String,
    #[builder(default)]
    characteristics: Vec<FakeCharacteristic>,
}

/// A scripted peripheral.
#[derive(Debug, Clone, Builder)]
pub struct FakeDevice {
    #[builder(into)]
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    #[builder(default)]
    advertisement: Vec<u8>,
    #[builder(default)]
    services: Vec<FakeService>,
}

impl FakeDevice {
    fn scan_record(&self) -> ScanRecord {
        ScanRecord {
            address: Address::random_static(self.address.clone()),
            name: self.name.clone(),
            rssi: self.rssi,
            advertisement: ScanAdvertisement::Raw(RadioValue::encode(&self.advertisement)),
        }
    }

    fn characteristic(&self, path: &AttributePath) -> Option<&FakeCharacteristic> {
        self.services
            .iter()
            .find(|service| shorten_uuid(&service.uuid) == path.service())
            .and_then(|service| {
                service
                    .characteristics
                    .iter()
                    .find(|characteristic| {
                        shorten_uuid(&characteristic.uuid) == path.characteristic_uuid()
                    })
            })
    }

    fn characteristic_mut(&mut self, path: &AttributePath) -> Option<&mut FakeCharacteristic> {
        self.services
            .iter_mut()
            .find(|service| shorten_uuid(&service.uuid) == path.service())
            .and_then(|service| {
                service
                    .characteristics
                    .iter_mut()
                    .find(|characteristic| {
                        shorten_uuid(&characteristic.uuid) == path.characteristic_uuid()
                    })
            })
    }

    /// Builds a device with a battery service and a device information service.
    #[must_use]
    pub fn with_default_gatt(address: &str, name: Option<String>, rssi: Option<i16>) -> Self {
        let battery_level = FakeCharacteristic::builder()
            .uuid("2a19")
            .properties(CharacteristicProperties {
                read: true,
                notify: true,
                ..CharacteristicProperties::default()
            })
            .value(vec![0x64])
            .descriptors(vec![
                FakeDescriptor::builder().uuid("2902").value(vec![0x00, 0x00]).build(),
            ])
            .notifications(vec![vec![0x63], vec![0x62], vec![0x61]])
            .build();
        let manufacturer = FakeCharacteristic::builder()
            .uuid("2a29")
            .properties(CharacteristicProperties {
                read: true,
                ..CharacteristicProperties::default()
            })
            .value(b"blegate".to_vec())
            .build();

        Self::builder()
            .address(address)
            .maybe_name(name)
            .maybe_rssi(rssi)
            .services(vec![
                FakeService::builder()
                    .uuid("180f")
                    .characteristics(vec![battery_level])
                    .build(),
                FakeService::builder()
                    .uuid("180a")
                    .characteristics(vec![manufacturer])
                    .build(),
            ])
            .build()
    }
}

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<FakeDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }

        let devices = value
            .split(';')
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }
}

fn parse_scan_record(raw_record: &str) -> Result<FakeDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields[0].is_empty() {
        return Err(FixtureError::EmptyAddress);
    }

    let name = match fields[1] {
        "" | "-" => None,
        name => Some(name.to_string()),
    };
    let rssi = match fields[2] {
        "" | "-" => None,
        rssi => Some(rssi.parse::<i16>()?),
    };
    let advertisement = match fields[3] {
        "" | "-" => Vec::new(),
        payload => hex::decode(payload)?,
    };

    let mut device = FakeDevice::with_default_gatt(fields[0], name, rssi);
    device.advertisement = advertisement;
    Ok(device)
}

/// Settings for constructing a fake radio.
#[derive(Debug, Builder)]
pub struct FakeRadioConfig {
    #[builder(default)]
    devices: Vec<FakeDevice>,
    #[builder(default)]
    teardown: TeardownPrimitive,
    #[builder(default = true)]
    enabled: bool,
    #[builder(default = true)]
    permission_granted: bool,
    #[builder(default = true)]
    location_enabled: bool,
}

impl From<ScanFixture> for FakeRadioConfig {
    fn from(fixture: ScanFixture) -> Self {
        Self::builder().devices(fixture.into()).build()
    }
}

#[derive(Debug, Default)]
struct FakeState {
    devices: HashMap<String, FakeDevice>,
    connected: HashSet<String>,
    handles: HashSet<String>,
    subscriptions: HashSet<(String, AttributePath)>,
    connect_script: HashMap<String, VecDeque<ConnectOutcome>>,
    calls: Vec<String>,
    scanning: bool,
    enabled: bool,
    permission_granted: bool,
    location_enabled: bool,
}

/// Scriptable in-memory radio used by tests and fixture-driven CLI runs.
#[derive(Debug)]
pub struct FakeRadio {
    state: Mutex<FakeState>,
    teardown: TeardownPrimitive,
    events: broadcast::Sender<RadioEvent>,
}

impl FakeRadio {
    #[must_use]
    pub fn new(config: FakeRadioConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let devices = config
            .devices
            .into_iter()
            .map(|device| (device.address.clone(), device))
            .collect();

        Self {
            state: Mutex::new(FakeState {
                devices,
                enabled: config.enabled,
                permission_granted: config.permission_granted,
                location_enabled: config.location_enabled,
                ..FakeState::default()
            }),
            teardown: config.teardown,
            events,
        }
    }

    /// Queues outcomes for upcoming connect calls to `address`. Once the
    /// script is exhausted, connects succeed.
    pub async fn script_connect(&self, address: &str, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state
            .lock()
            .await
            .connect_script
            .entry(address.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Marks a device as connected at the stack level without a connect call.
    pub async fn mark_connected(&self, address: &str) {
        let mut state = self.state.lock().await;
        state.connected.insert(address.to_string());
        state.handles.insert(address.to_string());
    }

    /// Number of recorded calls to the named primitive.
    pub async fn call_count(&self, primitive: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(primitive))
            .count()
    }

    /// Recorded calls as `primitive [address] [path]` lines, oldest first.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    pub async fn set_rssi(&self, address: &str, rssi: i16) {
        if let Some(device) = self.state.lock().await.devices.get_mut(address) {
            device.rssi = Some(rssi);
        }
    }

    /// Pushes a scan result as if the stack had just reported it.
    pub fn emit_scan_result(&self, record: ScanRecord) {
        let _ = self.events.send(RadioEvent::ScanResult(record));
    }

    /// Pushes a platform-encoded notification value.
    pub fn notify(&self, address: &str, path: &AttributePath, value: &[u8]) {
        let _ = self.events.send(RadioEvent::Notification {
            address: address.to_string(),
            path: path.clone(),
            value: RadioValue::encode(value),
        });
    }

    /// Drops the link as if the peripheral went out of range.
    pub async fn drop_link(&self, address: &str) {
        let mut state = self.state.lock().await;
        state.connected.remove(address);
        state
            .subscriptions
            .retain(|(subscribed, _)| subscribed != address);
        drop(state);
        let _ = self.events.send(RadioEvent::LinkLost {
            address: address.to_string(),
        });
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.state.lock().await.enabled = enabled;
        let _ = self.events.send(RadioEvent::AdapterEnabled(enabled));
    }

    fn record(state: &mut FakeState, call: String) {
        debug!(%call, "fake radio call");
        state.calls.push(call);
    }

    fn ensure_connected(state: &FakeState, address: &str) -> Result<(), RadioError> {
        if state.connected.contains(address) {
            Ok(())
        } else {
            Err(RadioError::AlreadyDisconnected {
                address: address.to_string(),
            })
        }
    }

    fn characteristic<'a>(
        state: &'a FakeState,
        address: &str,
        path: &AttributePath,
    ) -> Result<&'a FakeCharacteristic, RadioError> {
        Self::ensure_connected(state, address)?;
        state
            .devices
            .get(address)
            .and_then(|device| device.characteristic(path))
            .ok_or_else(|| RadioError::UnknownAttribute {
                uuid: path.to_string(),
            })
    }

    fn characteristic_mut<'a>(
        state: &'a mut FakeState,
        address: &str,
        path: &AttributePath,
    ) -> Result<&'a mut FakeCharacteristic, RadioError> {
        Self::ensure_connected(state, address)?;
        state
            .devices
            .get_mut(address)
            .and_then(|device| device.characteristic_mut(path))
            .ok_or_else(|| RadioError::UnknownAttribute {
                uuid: path.to_string(),
            })
    }

    fn descriptor_mut<'a>(
        state: &'a mut FakeState,
        address: &str,
        path: &AttributePath,
    ) -> Result<&'a mut FakeDescriptor, RadioError> {
        let uuid = path.descriptor_uuid().unwrap_or_default().to_string();
        Self::characteristic_mut(state, address, &path.characteristic_path())?
            .descriptors
            .iter_mut()
            .find(|descriptor| shorten_uuid(&descriptor.uuid) == uuid)
            .ok_or(RadioError::UnknownAttribute { uuid })
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn initialize(&self) -> Result<bool, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "initialize".to_string());
        Ok(state.enabled)
    }

    async fn has_permission(&self) -> Result<bool, RadioError> {
        Ok(self.state.lock().await.permission_granted)
    }

    async fn request_permission(&self) -> Result<bool, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "request_permission".to_string());
        Ok(state.permission_granted)
    }

    async fn is_enabled(&self) -> Result<bool, RadioError> {
        Ok(self.state.lock().await.enabled)
    }

    async fn enable(&self) -> Result<(), RadioError> {
        self.set_enabled(true).await;
        Ok(())
    }

    async fn has_location(&self) -> Result<bool, RadioError> {
        Ok(self.state.lock().await.location_enabled)
    }

    async fn request_location(&self) -> Result<bool, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "request_location".to_string());
        Ok(state.location_enabled)
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        let records: Vec<ScanRecord> = {
            let mut state = self.state.lock().await;
            Self::record(&mut state, "start_scan".to_string());
            if !state.enabled {
                return Err(RadioError::Disabled);
            }
            state.scanning = true;
            let mut devices: Vec<&FakeDevice> = state.devices.values().collect();
            devices.sort_by(|left, right| left.address.cmp(&right.address));
            devices.into_iter().map(FakeDevice::scan_record).collect()
        };

        for record in records {
            self.emit_scan_result(record);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "stop_scan".to_string());
        state.scanning = false;
        Ok(())
    }

    async fn connect(&self, address: &Address) -> Result<(), RadioError> {
        let outcome = {
            let mut state = self.state.lock().await;
            Self::record(&mut state, format!("connect {address}"));
            if !state.devices.contains_key(address.as_str()) {
                return Err(RadioError::UnknownDevice {
                    address: address.to_string(),
                });
            }
            let outcome = state
                .connect_script
                .get_mut(address.as_str())
                .and_then(VecDeque::pop_front)
                .unwrap_or(ConnectOutcome::Succeed);
            if outcome == ConnectOutcome::Succeed {
                state.connected.insert(address.to_string());
                state.handles.insert(address.to_string());
            }
            outcome
        };

        match outcome {
            ConnectOutcome::Succeed => {
                info!(%address, "fake device connected");
                Ok(())
            }
            ConnectOutcome::Hang => std::future::pending().await,
            ConnectOutcome::Fail(error) => Err(error),
        }
    }

    async fn is_connected(&self, address: &str) -> Result<bool, RadioError> {
        Ok(self.state.lock().await.connected.contains(address))
    }

    async fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("disconnect {address}"));
        if !state.connected.remove(address) {
            return Err(RadioError::AlreadyDisconnected {
                address: address.to_string(),
            });
        }
        state
            .subscriptions
            .retain(|(subscribed, _)| subscribed != address);
        Ok(())
    }

    async fn unbond(&self, address: &str) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("unbond {address}"));
        if !state.connected.remove(address) {
            return Err(RadioError::AlreadyUnbonded {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self, address: &str) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("close {address}"));
        if !state.handles.remove(address) {
            return Err(RadioError::NeverConnected {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    fn teardown_primitive(&self) -> TeardownPrimitive {
        self.teardown
    }

    async fn services(&self, address: &str) -> Result<Vec<String>, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("services {address}"));
        Self::ensure_connected(&state, address)?;
        Ok(state
            .devices
            .get(address)
            .map(|device| {
                device
                    .services
                    .iter()
                    .map(|service| service.uuid.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<RadioCharacteristic>, RadioError> {
        let state = self.state.lock().await;
        Self::ensure_connected(&state, address)?;
        let service = shorten_uuid(service);
        Ok(state
            .devices
            .get(address)
            .and_then(|device| {
                device
                    .services
                    .iter()
                    .find(|candidate| shorten_uuid(&candidate.uuid) == service)
            })
            .map(|service| {
                service
                    .characteristics
                    .iter()
                    .map(|characteristic| RadioCharacteristic {
                        uuid: characteristic.uuid.clone(),
                        properties: characteristic.properties,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn descriptors(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Vec<String>, RadioError> {
        let state = self.state.lock().await;
        Ok(Self::characteristic(&state, address, path)?
            .descriptors
            .iter()
            .map(|descriptor| descriptor.uuid.clone())
            .collect())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("read_characteristic {address} {path}"));
        let characteristic = Self::characteristic(&state, address, path)?;
        if characteristic.read_fails {
            return Err(RadioError::Failed {
                message: format!("read of {path} rejected"),
            });
        }
        Ok(RadioValue::encode(&characteristic.value))
    }

    async fn write_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(
            &mut state,
            format!("write_characteristic {address} {path} {mode}"),
        );
        let bytes = value.decode().map_err(|error| RadioError::Failed {
            message: error.to_string(),
        })?;
        Self::characteristic_mut(&mut state, address, path)?.value = bytes;
        Ok(())
    }

    async fn read_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("read_descriptor {address} {path}"));
        let descriptor = Self::descriptor_mut(&mut state, address, path)?;
        Ok(RadioValue::Bytes(descriptor.value.clone()))
    }

    async fn write_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
    ) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("write_descriptor {address} {path}"));
        let bytes = value.decode().map_err(|error| RadioError::Failed {
            message: error.to_string(),
        })?;
        Self::descriptor_mut(&mut state, address, path)?.value = bytes;
        Ok(())
    }

    async fn subscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError> {
        let notifications = {
            let mut state = self.state.lock().await;
            Self::record(&mut state, format!("subscribe {address} {path}"));
            let notifications = Self::characteristic(&state, address, path)?
                .notifications
                .clone();
            if !state
                .subscriptions
                .insert((address.to_string(), path.clone()))
            {
                return Err(RadioError::AlreadySubscribed {
                    characteristic: path.to_string(),
                });
            }
            notifications
        };

        for value in notifications {
            self.notify(address, path, &value);
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("unsubscribe {address} {path}"));
        if !state
            .subscriptions
            .remove(&(address.to_string(), path.clone()))
        {
            return Err(RadioError::AlreadyUnsubscribed {
                characteristic: path.to_string(),
            });
        }
        Ok(())
    }

    async fn read_rssi(&self, address: &str) -> Result<i16, RadioError> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, format!("read_rssi {address}"));
        Self::ensure_connected(&state, address)?;
        state
            .devices
            .get(address)
            .and_then(|device| device.rssi)
            .ok_or_else(|| RadioError::Failed {
                message: format!("no RSSI sample for {address}"),
            })
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB|Tag|-43|", 1)]
    #[case("AA:BB|Tag|-43|0201;CC:DD|-|-|-", 2)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let fixture: ScanFixture = fixture.parse().expect("fixture should parse");
        let devices: Vec<FakeDevice> = fixture.into();
        assert_eq!(expected_count, devices.len());
    }

    #[rstest]
    #[case("", "empty")]
    #[case("AA:BB|Tag|-43", "field count")]
    #[case("|Tag|-43|", "address")]
    #[case("AA:BB|Tag|loud|", "rssi")]
    #[case("AA:BB|Tag|-43|0g", "hex")]
    fn scan_fixture_rejects_malformed_records(#[case] fixture: &str, #[case] reason: &str) {
        let result = fixture.parse::<ScanFixture>();
        match reason {
            "empty" => assert_matches!(result, Err(FixtureError::EmptyFixture)),
            "field count" => assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount)),
            "address" => assert_matches!(result, Err(FixtureError::EmptyAddress)),
            "rssi" => assert_matches!(result, Err(FixtureError::InvalidRssi(_))),
            _ => assert_matches!(result, Err(FixtureError::InvalidHex(_))),
        }
    }

    #[tokio::test]
    async fn scripted_connect_outcomes_run_in_order() {
        let radio = FakeRadio::new(
            FakeRadioConfig::builder()
                .devices(vec![FakeDevice::with_default_gatt("AA", None, None)])
                .build(),
        );
        radio
            .script_connect(
                "AA",
                [ConnectOutcome::Fail(RadioError::PreviouslyConnected {
                    address: "AA".to_string(),
                })],
            )
            .await;
        let address = Address::from("AA");

        assert_matches!(
            radio.connect(&address).await,
            Err(RadioError::PreviouslyConnected { .. })
        );
        assert_matches!(radio.connect(&address).await, Ok(()));
        assert!(radio.is_connected("AA").await.expect("state query"));
        assert_eq!(2, radio.call_count("connect").await);
    }

    #[tokio::test]
    async fn second_subscribe_reports_already_subscribed() {
        let radio = FakeRadio::new(
            FakeRadioConfig::builder()
                .devices(vec![FakeDevice::with_default_gatt("AA", None, None)])
                .build(),
        );
        radio.mark_connected("AA").await;
        let path = AttributePath::characteristic("180f/2a19").expect("path");

        assert_matches!(radio.subscribe("AA", &path).await, Ok(()));
        assert_matches!(
            radio.subscribe("AA", &path).await,
            Err(RadioError::AlreadySubscribed { .. })
        );
    }
}
