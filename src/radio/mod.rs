mod btleplug_backend;
pub mod fake;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use btleplug_backend::BtleplugRadio;

use crate::address::Address;
use crate::advertisement::{Advertisement, DeviceDiscovered};
use crate::attribute::{AttributePath, CharacteristicProperties};
use crate::codec::RadioValue;
use crate::error::RadioError;

/// Which primitive the platform uses to drop a link.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum TeardownPrimitive {
    #[default]
    Disconnect,
    Unbond,
}

/// BLE write mode for characteristic writes.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, derive_more::Display)]
pub enum WriteMode {
    #[default]
    #[display("with-response")]
    WithResponse,
    #[display("without-response")]
    WithoutResponse,
}

impl WriteMode {
    /// Maps the acknowledgement flag used by callers onto a write mode.
    #[must_use]
    pub fn from_ack(ack: bool) -> Self {
        if ack {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}

/// Advertising payload as reported by the stack.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScanAdvertisement {
    /// Raw AD structures, possibly platform-encoded.
    Raw(RadioValue),
    /// Fields already parsed by the stack.
    Parsed(Advertisement),
}

/// A single scan result from the radio.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanRecord {
    pub address: Address,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: ScanAdvertisement,
}

impl ScanRecord {
    /// Normalises the result into the shape published on the event bus.
    ///
    /// Undecodable advertising payloads are replaced by an empty advertisement.
    #[must_use]
    pub fn into_discovered(self) -> DeviceDiscovered {
        let advertisement = match self.advertisement {
            ScanAdvertisement::Parsed(advertisement) => advertisement,
            ScanAdvertisement::Raw(value) => match value.decode() {
                Ok(bytes) => Advertisement::parse(&bytes),
                Err(error) => {
                    tracing::debug!(%error, address = %self.address, "dropping undecodable advertisement");
                    Advertisement::default()
                }
            },
        };
        DeviceDiscovered::new(self.address, self.rssi, self.name, advertisement)
    }
}

/// A characteristic as listed by the radio during discovery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RadioCharacteristic {
    pub uuid: String,
    pub properties: CharacteristicProperties,
}

/// Asynchronous events streamed by the radio.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    ScanResult(ScanRecord),
    Notification {
        address: String,
        path: AttributePath,
        value: RadioValue,
    },
    /// The stack reported an unsolicited disconnect.
    LinkLost { address: String },
    AdapterEnabled(bool),
}

/// The platform radio. Each call resolves or fails exactly once; ongoing
/// results arrive on [`Radio::events`].
#[async_trait]
pub trait Radio: Send + Sync + std::fmt::Debug {
    /// Initialises the stack and returns whether the radio is enabled.
    async fn initialize(&self) -> Result<bool, RadioError>;

    async fn has_permission(&self) -> Result<bool, RadioError>;

    async fn request_permission(&self) -> Result<bool, RadioError>;

    async fn is_enabled(&self) -> Result<bool, RadioError>;

    async fn enable(&self) -> Result<(), RadioError>;

    async fn has_location(&self) -> Result<bool, RadioError>;

    async fn request_location(&self) -> Result<bool, RadioError>;

    /// Starts scanning; results arrive as [`RadioEvent::ScanResult`].
    async fn start_scan(&self) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, address: &Address) -> Result<(), RadioError>;

    async fn is_connected(&self, address: &str) -> Result<bool, RadioError>;

    async fn disconnect(&self, address: &str) -> Result<(), RadioError>;

    async fn unbond(&self, address: &str) -> Result<(), RadioError>;

    /// Releases the stack's handle for the device.
    async fn close(&self, address: &str) -> Result<(), RadioError>;

    /// Returns the primitive used to drop a link on this platform.
    fn teardown_primitive(&self) -> TeardownPrimitive;

    /// Lists service UUIDs of a connected device.
    async fn services(&self, address: &str) -> Result<Vec<String>, RadioError>;

    async fn characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<RadioCharacteristic>, RadioError>;

    /// Lists descriptor UUIDs of the characteristic at `path`.
    async fn descriptors(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Vec<String>, RadioError>;

    async fn read_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError>;

    async fn write_characteristic(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
        mode: WriteMode,
    ) -> Result<(), RadioError>;

    async fn read_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<RadioValue, RadioError>;

    async fn write_descriptor(
        &self,
        address: &str,
        path: &AttributePath,
        value: RadioValue,
    ) -> Result<(), RadioError>;

    /// Enables notifications; values arrive as [`RadioEvent::Notification`].
    async fn subscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError>;

    async fn unsubscribe(&self, address: &str, path: &AttributePath) -> Result<(), RadioError>;

    async fn read_rssi(&self, address: &str) -> Result<i16, RadioError>;

    /// Subscribes to the radio's event stream.
    fn events(&self) -> broadcast::Receiver<RadioEvent>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn raw_scan_record_parses_encoded_advertisement() {
        let record = ScanRecord {
            address: Address::from("AA:BB"),
            name: None,
            rssi: Some(-70),
            advertisement: ScanAdvertisement::Raw(RadioValue::encode(&[
                0x05, 0x09, b'L', b'a', b'm', b'p',
            ])),
        };

        let discovered = record.into_discovered();

        assert_eq!(Some("Lamp"), discovered.name());
        assert_eq!(Some(-70), discovered.rssi());
    }

    #[test]
    fn undecodable_advertisement_is_replaced_by_empty_payload() {
        let record = ScanRecord {
            address: Address::from("AA:BB"),
            name: Some("Tag".to_string()),
            rssi: None,
            advertisement: ScanAdvertisement::Raw(RadioValue::Encoded("%%%".to_string())),
        };

        let discovered = record.into_discovered();

        assert_eq!(&Advertisement::default(), discovered.advertisement());
        assert_eq!(Some("Tag"), discovered.name());
    }

    #[test]
    fn ack_flag_selects_write_mode() {
        assert_eq!(WriteMode::WithResponse, WriteMode::from_ack(true));
        assert_eq!(WriteMode::WithoutResponse, WriteMode::from_ack(false));
    }
}
