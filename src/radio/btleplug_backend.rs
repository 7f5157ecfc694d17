use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
    Radio, RadioCharacteristic, RadioEvent, ScanAdvertisement, ScanRecord, TeardownPrimitive,
    WriteMode,
};
use crate::address::Address;
use crate::advertisement::{Advertisement, ManufacturerData, ServiceData};
use crate::attribute::{AttributePath, CharacteristicProperties, expand_uuid, shorten_uuid};
use crate::codec::RadioValue;
use crate::error::RadioError;

const EVENT_CAPACITY: usize = 256;

/// Radio backed by the first `btleplug` adapter.
#[derive(Debug)]
pub struct BtleplugRadio {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    central_task: JoinHandle<()>,
    notification_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugRadio {
    /// Opens the first available adapter and starts forwarding its events.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform manager cannot be created or no
    /// adapter is present.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RadioError::NoAdapters)?;
        match adapter.adapter_info().await {
            Ok(name) => info!(adapter = %name, "using BLE adapter"),
            Err(error) => debug!(?error, "failed to describe BLE adapter"),
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let central_events = adapter.events().await?;
        let central_task = tokio::spawn(forward_central_events(
            adapter.clone(),
            central_events,
            events.clone(),
        ));

        Ok(Self {
            adapter,
            events,
            central_task,
            notification_tasks: Mutex::new(HashMap::new()),
        })
    }

    #[instrument(skip(self), level = "trace")]
    async fn peripheral(&self, address: &str) -> Result<Peripheral, RadioError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == address)
            .ok_or_else(|| RadioError::UnknownDevice {
                address: address.to_string(),
            })
    }

    async fn characteristic(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<(Peripheral, Characteristic), RadioError> {
        let peripheral = self.peripheral(address).await?;
        let service_uuid = parse_uuid(path.service())?;
        let characteristic_uuid = parse_uuid(path.characteristic_uuid())?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| {
                characteristic.service_uuid == service_uuid
                    && characteristic.uuid == characteristic_uuid
            })
            .ok_or_else(|| RadioError::UnknownAttribute {
                uuid: path.to_string(),
            })?;
        Ok((peripheral, characteristic))
    }

    async fn descriptor(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<(Peripheral, btleplug::api::Descriptor), RadioError> {
        let (peripheral, characteristic) = self
            .characteristic(address, &path.characteristic_path())
            .await?;
        let descriptor_uuid = parse_uuid(path.descriptor_uuid().unwrap_or_default())?;
        let descriptor = characteristic
            .descriptors
            .into_iter()
            .find(|descriptor| descriptor.uuid == descriptor_uuid)
            .ok_or_else(|| RadioError::UnknownAttribute {
                uuid: path.to_string(),
            })?;
        Ok((peripheral, descriptor))
    }

    /// Starts forwarding notifications for a peripheral once per address.
    async fn ensure_notification_forwarding(
        &self,
        address: &str,
        peripheral: &Peripheral,
    ) -> Result<(), RadioError> {
        let mut tasks = self.notification_tasks.lock().await;
        if tasks.get(address).is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|error| radio_error(address, error))?;
        let sender = self.events.clone();
        let owner = address.to_string();
        let characteristics = peripheral.characteristics();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(address = %owner, uuid = %notification.uuid, "notification received");
                let Some(service_uuid) = characteristics
                    .iter()
                    .find(|characteristic| characteristic.uuid == notification.uuid)
                    .map(|characteristic| characteristic.service_uuid)
                else {
                    debug!(uuid = %notification.uuid, "notification for undiscovered characteristic");
                    continue;
                };
                let event = RadioEvent::Notification {
                    address: owner.clone(),
                    path: AttributePath::from_uuids(
                        &service_uuid.to_string(),
                        &notification.uuid.to_string(),
                    ),
                    value: RadioValue::Bytes(notification.value),
                };
                if sender.send(event).is_err() {
                    trace!(address = %owner, "no radio event receivers");
                }
            }
            debug!(address = %owner, "notification stream closed");
        });
        tasks.insert(address.to_string(), task);
        Ok(())
    }

    async fn stop_notification_forwarding(&self, address: &str) {
        if let Some(task) = self.notification_tasks.lock().await.remove(address) {
            task.abort();
        }
    }

    async fn powered_on(&self) -> Result<bool, RadioError> {
        Ok(self.adapter.adapter_state().await? == CentralState::PoweredOn)
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.central_task.abort();
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn initialize(&self) -> Result<bool, RadioError> {
        self.powered_on().await
    }

    // Desktop stacks grant radio access at the OS level.
    async fn has_permission(&self) -> Result<bool, RadioError> {
        Ok(true)
    }

    async fn request_permission(&self) -> Result<bool, RadioError> {
        Ok(true)
    }

    async fn is_enabled(&self) -> Result<bool, RadioError> {
        self.powered_on().await
    }

    async fn enable(&self) -> Result<(), RadioError> {
        if self.powered_on().await? {
            Ok(())
        } else {
            Err(RadioError::Disabled)
        }
    }

    async fn has_location(&self) -> Result<bool, RadioError> {
        Ok(true)
    }

    async fn request_location(&self) -> Result<bool, RadioError> {
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self) -> Result<(), RadioError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(address = %address))]
    async fn connect(&self, address: &Address) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address.as_str()).await?;
        if peripheral.is_connected().await? {
            return Err(RadioError::NotDisconnected {
                address: address.to_string(),
            });
        }
        peripheral
            .connect()
            .await
            .map_err(|error| radio_error(address.as_str(), error))
    }

    async fn is_connected(&self, address: &str) -> Result<bool, RadioError> {
        Ok(self.peripheral(address).await?.is_connected().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let peripheral = match self.peripheral(address).await {
            Ok(peripheral) => peripheral,
            Err(RadioError::UnknownDevice { address }) => {
                return Err(RadioError::NeverConnected { address });
            }
            Err(error) => return Err(error),
        };
        self.stop_notification_forwarding(address).await;
        if !peripheral.is_connected().await? {
            return Err(RadioError::AlreadyDisconnected {
                address: address.to_string(),
            });
        }
        peripheral
            .disconnect()
            .await
            .map_err(|error| radio_error(address, error))
    }

    async fn unbond(&self, address: &str) -> Result<(), RadioError> {
        debug!(address, "bond removal is managed by the host stack");
        Err(RadioError::AlreadyUnbonded {
            address: address.to_string(),
        })
    }

    async fn close(&self, address: &str) -> Result<(), RadioError> {
        self.stop_notification_forwarding(address).await;
        Ok(())
    }

    fn teardown_primitive(&self) -> TeardownPrimitive {
        TeardownPrimitive::Disconnect
    }

    #[instrument(skip(self), level = "debug")]
    async fn services(&self, address: &str) -> Result<Vec<String>, RadioError> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|error| radio_error(address, error))?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| service.uuid.to_string())
            .collect())
    }

    async fn characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<RadioCharacteristic>, RadioError> {
        let peripheral = self.peripheral(address).await?;
        let service_uuid = parse_uuid(service)?;
        Ok(peripheral
            .services()
            .into_iter()
            .filter(|candidate| candidate.uuid == service_uuid)
            .flat_map(|service| service.characteristics)
            .map(|characteristic| RadioCharacteristic {
                uuid: characteristic.uuid.to_string(),
                properties: properties_from_flags(characteristic.properties),
            })
            .collect())
    }

    async fn descriptors(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Vec<String>, RadioError> {
        let (_, characteristic) = self.characteristic(address, path).await?;
        Ok(characteristic
            .descriptors
            .into_iter()
            .map(|descriptor| descriptor.uuid.to_string())
            .collect())
    }

    #[instrument(skip(self), level = "debug", fields(%path))]
    async fn read_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, path).await?;
        let value = peripheral
            .read(&characteristic)
            .await
            .map_err(|error| radio_error(address, error))?;
        Ok(RadioValue::Bytes(value))
    }

    #[instrument(skip(self, value), level = "debug", fields(%path, %mode))]
    async fn write_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, path).await?;
        let bytes = value.decode().map_err(|error| RadioError::Failed {
            message: error.to_string(),
        })?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&characteristic, &bytes, write_type)
            .await
            .map_err(|error| radio_error(address, error))
    }

    async fn read_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError> {
        let (peripheral, descriptor) = self.descriptor(address, path).await?;
        let value = peripheral
            .read_descriptor(&descriptor)
            .await
            .map_err(|error| radio_error(address, error))?;
        Ok(RadioValue::Bytes(value))
    }

    async fn write_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
    ) -> Result<(), RadioError> {
        let (peripheral, descriptor) = self.descriptor(address, path).await?;
        let bytes = value.decode().map_err(|error| RadioError::Failed {
            message: error.to_string(),
        })?;
        peripheral
            .write_descriptor(&descriptor, &bytes)
            .await
            .map_err(|error| radio_error(address, error))
    }

    #[instrument(skip(self), level = "debug", fields(%path))]
    async fn subscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, path).await?;
        self.ensure_notification_forwarding(address, &peripheral)
            .await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|error| radio_error(address, error))
    }

    #[instrument(skip(self), level = "debug", fields(%path))]
    async fn unsubscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, path).await?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|error| radio_error(address, error))
    }

    async fn read_rssi(&self, address: &str) -> Result<i16, RadioError> {
        self.peripheral(address)
            .await?
            .properties()
            .await?
            .and_then(|properties| properties.rssi)
            .ok_or_else(|| RadioError::Failed {
                message: format!("no RSSI sample for {address}"),
            })
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

async fn forward_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    sender: broadcast::Sender<RadioEvent>,
) {
    while let Some(event) = central_events.next().await {
        let radio_event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                match peripheral.properties().await {
                    Ok(Some(properties)) => {
                        RadioEvent::ScanResult(scan_record(id.to_string(), &properties))
                    }
                    Ok(None) => continue,
                    Err(error) => {
                        debug!(?error, "failed to read scan properties");
                        continue;
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => RadioEvent::LinkLost {
                address: id.to_string(),
            },
            CentralEvent::StateUpdate(state) => {
                RadioEvent::AdapterEnabled(state == CentralState::PoweredOn)
            }
            _ => continue,
        };

        if sender.send(radio_event).is_err() {
            trace!("no radio event receivers");
        }
    }
    warn!("adapter event stream closed");
}

fn scan_record(address: String, properties: &PeripheralProperties) -> ScanRecord {
    ScanRecord {
        address: Address::new(address, address_type(properties)),
        name: properties.local_name.clone(),
        rssi: properties.rssi,
        advertisement: ScanAdvertisement::Parsed(advertisement_from_properties(properties)),
    }
}

fn address_type(properties: &PeripheralProperties) -> crate::address::AddressType {
    match properties.address_type {
        Some(btleplug::api::AddressType::Public) => crate::address::AddressType::Public,
        _ => crate::address::AddressType::RandomStatic,
    }
}

fn advertisement_from_properties(properties: &PeripheralProperties) -> Advertisement {
    let mut service_data: Vec<ServiceData> = properties
        .service_data
        .iter()
        .map(|(uuid, data)| ServiceData {
            uuid: shorten_uuid(&uuid.to_string()),
            data: data.clone(),
        })
        .collect();
    service_data.sort_by(|left, right| left.uuid.cmp(&right.uuid));

    let mut manufacturer_data: Vec<ManufacturerData> = properties
        .manufacturer_data
        .iter()
        .map(|(company_id, data)| ManufacturerData {
            company_id: *company_id,
            data: data.clone(),
        })
        .collect();
    manufacturer_data.sort_by_key(|record| record.company_id);

    Advertisement {
        flags: None,
        local_name: properties.local_name.clone(),
        tx_power: properties
            .tx_power_level
            .and_then(|level| i8::try_from(level).ok()),
        service_uuids: properties
            .services
            .iter()
            .map(|uuid| shorten_uuid(&uuid.to_string()))
            .collect(),
        service_data,
        manufacturer_data,
        raw: Vec::new(),
    }
}

fn parse_uuid(uuid: &str) -> Result<Uuid, RadioError> {
    Uuid::parse_str(&expand_uuid(uuid)).map_err(|_| RadioError::UnknownAttribute {
        uuid: uuid.to_string(),
    })
}

fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        broadcast: flags.contains(CharPropFlags::BROADCAST),
        read: flags.contains(CharPropFlags::READ),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        write: flags.contains(CharPropFlags::WRITE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
        authenticated_signed_writes: flags.contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES),
    }
}

fn radio_error(address: &str, error: btleplug::Error) -> RadioError {
    match RadioError::from(error) {
        RadioError::AlreadyDisconnected { .. } => RadioError::AlreadyDisconnected {
            address: address.to_string(),
        },
        RadioError::UnknownDevice { .. } => RadioError::UnknownDevice {
            address: address.to_string(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::advertisement::BeaconKind;

    #[rstest]
    #[case("180f", "0000180f-0000-1000-8000-00805f9b34fb")]
    #[case("00002A19-0000-1000-8000-00805F9B34FB", "00002a19-0000-1000-8000-00805f9b34fb")]
    #[case("6e400001b5a3f393e0a9e50e24dcca9e", "6e400001-b5a3-f393-e0a9-e50e24dcca9e")]
    fn cache_keys_map_back_to_stack_uuids(#[case] key: &str, #[case] expected: &str) {
        let uuid = parse_uuid(key).expect("uuid should parse");
        assert_eq!(expected, uuid.to_string());
        assert_eq!(shorten_uuid(key), shorten_uuid(&uuid.to_string()));
    }

    #[test]
    fn properties_map_flags_one_to_one() {
        let properties =
            properties_from_flags(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert_eq!(vec!["read", "notify"], properties.labels());
    }

    #[test]
    fn stack_parsed_service_data_is_recognised_as_eddystone() {
        let eddystone = Uuid::parse_str("0000feaa-0000-1000-8000-00805f9b34fb")
            .expect("uuid should parse");
        let properties = PeripheralProperties {
            service_data: HashMap::from([(eddystone, vec![0x10, 0x00])]),
            rssi: Some(-58),
            ..PeripheralProperties::default()
        };

        let record = scan_record("AA:BB".to_string(), &properties);
        let discovered = record.into_discovered();

        assert_eq!(
            Some(BeaconKind::Eddystone),
            discovered.advertisement().beacon_kind()
        );
        assert_eq!(Some(-58), discovered.rssi());
    }
}
