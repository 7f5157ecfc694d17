use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;

use crate::address::Address;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;
const AD_TYPE_COMPLETE_UUID16: u8 = 0x03;
const AD_TYPE_INCOMPLETE_UUID32: u8 = 0x04;
const AD_TYPE_COMPLETE_UUID32: u8 = 0x05;
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_TX_POWER: u8 = 0x0A;
const AD_TYPE_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_TYPE_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_TYPE_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;

const APPLE_COMPANY_ID: u16 = 0x004C;
const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];
const IBEACON_MIN_LEN: usize = 23;
const ALTBEACON_PREFIX: [u8; 2] = [0xBE, 0xAC];
const ALTBEACON_MIN_LEN: usize = 24;
const EDDYSTONE_SERVICE_UUID: &str = "feaa";

/// One manufacturer-specific data record.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    #[serde_as(as = "Hex")]
    pub data: Vec<u8>,
}

/// One service data record keyed by shortened service UUID.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceData {
    pub uuid: String,
    #[serde_as(as = "Hex")]
    pub data: Vec<u8>,
}

/// Advertising payload fields.
#[serde_as]
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct Advertisement {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub tx_power: Option<i8>,
    pub service_uuids: Vec<String>,
    pub service_data: Vec<ServiceData>,
    pub manufacturer_data: Vec<ManufacturerData>,
    #[serde_as(as = "Hex")]
    pub raw: Vec<u8>,
}

/// Beacon advertisement formats recognised by the beacon scan filter.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
pub enum BeaconKind {
    #[display("ibeacon")]
    IBeacon,
    #[display("altbeacon")]
    AltBeacon,
    #[display("eddystone")]
    Eddystone,
}

impl Advertisement {
    /// Parses a raw advertising data stream of length-type-value structures.
    ///
    /// Parsing stops at the first zero-length structure or at a structure
    /// that runs past the end of the input; fields parsed before that point
    /// are kept.
    ///
    /// ```
    /// let raw = [0x02, 0x01, 0x06, 0x05, 0x09, b'T', b'a', b'g', b'1'];
    /// let advertisement = blegate::Advertisement::parse(&raw);
    /// assert_eq!(Some(0x06), advertisement.flags);
    /// assert_eq!(Some("Tag1"), advertisement.local_name.as_deref());
    /// ```
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut advertisement = Self {
            raw: raw.to_vec(),
            ..Self::default()
        };

        let mut index = 0usize;
        while index < raw.len() {
            let record_len = usize::from(raw[index]);
            if record_len == 0 {
                break;
            }
            let record_end = index + 1 + record_len;
            if record_end > raw.len() {
                break;
            }

            let ad_type = raw[index + 1];
            let payload = &raw[index + 2..record_end];
            advertisement.apply_record(ad_type, payload);
            index = record_end;
        }

        advertisement
    }

    fn apply_record(&mut self, ad_type: u8, payload: &[u8]) {
        match ad_type {
            AD_TYPE_FLAGS => self.flags = payload.first().copied(),
            AD_TYPE_INCOMPLETE_UUID16 | AD_TYPE_COMPLETE_UUID16 => {
                self.service_uuids.extend(payload.chunks_exact(2).map(uuid_le));
            }
            AD_TYPE_INCOMPLETE_UUID32 | AD_TYPE_COMPLETE_UUID32 => {
                self.service_uuids.extend(payload.chunks_exact(4).map(uuid_le));
            }
            AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                self.service_uuids.extend(payload.chunks_exact(16).map(uuid_le));
            }
            AD_TYPE_SHORT_NAME | AD_TYPE_COMPLETE_NAME => {
                if self.local_name.is_none() || ad_type == AD_TYPE_COMPLETE_NAME {
                    self.local_name = Some(String::from_utf8_lossy(payload).into_owned());
                }
            }
            AD_TYPE_TX_POWER => {
                self.tx_power = payload.first().map(|value| i8::from_le_bytes([*value]));
            }
            AD_TYPE_SERVICE_DATA_UUID16 => self.push_service_data(payload, 2),
            AD_TYPE_SERVICE_DATA_UUID32 => self.push_service_data(payload, 4),
            AD_TYPE_SERVICE_DATA_UUID128 => self.push_service_data(payload, 16),
            AD_TYPE_MANUFACTURER_SPECIFIC if payload.len() >= 2 => {
                self.manufacturer_data.push(ManufacturerData {
                    company_id: u16::from_le_bytes([payload[0], payload[1]]),
                    data: payload[2..].to_vec(),
                });
            }
            _ => {}
        }
    }

    fn push_service_data(&mut self, payload: &[u8], uuid_len: usize) {
        if payload.len() < uuid_len {
            return;
        }
        self.service_data.push(ServiceData {
            uuid: uuid_le(&payload[..uuid_len]),
            data: payload[uuid_len..].to_vec(),
        });
    }

    /// Returns the beacon format this advertisement matches, if any.
    #[must_use]
    pub fn beacon_kind(&self) -> Option<BeaconKind> {
        for record in &self.manufacturer_data {
            if record.company_id == APPLE_COMPANY_ID
                && record.data.len() >= IBEACON_MIN_LEN
                && record.data.starts_with(&IBEACON_PREFIX)
            {
                return Some(BeaconKind::IBeacon);
            }
            if record.data.len() >= ALTBEACON_MIN_LEN && record.data.starts_with(&ALTBEACON_PREFIX)
            {
                return Some(BeaconKind::AltBeacon);
            }
        }

        self.service_data
            .iter()
            .any(|record| record.uuid == EDDYSTONE_SERVICE_UUID)
            .then_some(BeaconKind::Eddystone)
    }
}

/// Formats a little-endian UUID field in shortened (dashless) form.
fn uuid_le(bytes: &[u8]) -> String {
    bytes.iter().rev().map(|byte| format!("{byte:02x}")).collect()
}

/// Which scan results an ad-hoc scan reports.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanFilterKind {
    /// Every result.
    #[default]
    Plain,
    /// Only results shaped like a beacon advertisement.
    Beacon,
}

impl ScanFilterKind {
    /// Whether a result passes this filter.
    #[must_use]
    pub fn allows(self, advertisement: &Advertisement) -> bool {
        match self {
            Self::Plain => true,
            Self::Beacon => advertisement.beacon_kind().is_some(),
        }
    }
}

/// A normalised scan result.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceDiscovered {
    address: Address,
    rssi: Option<i16>,
    name: Option<String>,
    advertisement: Advertisement,
}

impl DeviceDiscovered {
    /// Creates a discovery snapshot; the advertised local name stands in for a
    /// missing device name.
    #[must_use]
    pub fn new(
        address: Address,
        rssi: Option<i16>,
        name: Option<String>,
        advertisement: Advertisement,
    ) -> Self {
        let name = name.or_else(|| advertisement.local_name.clone());
        Self {
            address,
            rssi,
            name,
            advertisement,
        }
    }

    /// Creates a snapshot carrying only an address, as used for fresh watch entries.
    #[must_use]
    pub fn address_only(address: Address) -> Self {
        Self::new(address, None, None, Advertisement::default())
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Key used to suppress repeated results within one scan session.
    pub(crate) fn dedup_key(&self) -> String {
        format!(
            "{}{}",
            self.address.as_str(),
            self.name.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn ibeacon_raw() -> Vec<u8> {
        let mut raw = vec![0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];
        raw.extend_from_slice(&[0x11; 16]);
        raw.extend_from_slice(&[0x00, 0x01, 0x00, 0x02, 0xC5]);
        raw
    }

    #[test]
    fn parse_reads_uuid_lists_and_service_data() {
        let raw = [
            0x03, 0x03, 0xAA, 0xFE, 0x06, 0x16, 0xAA, 0xFE, 0x10, 0x00, 0x01, 0x02, 0x0A, 0xF4,
        ];
        let advertisement = Advertisement::parse(&raw);

        assert_eq!(vec!["feaa".to_string()], advertisement.service_uuids);
        assert_eq!(
            vec![ServiceData {
                uuid: "feaa".to_string(),
                data: vec![0x10, 0x00, 0x01],
            }],
            advertisement.service_data
        );
        assert_eq!(Some(-12), advertisement.tx_power);
    }

    #[test]
    fn parse_keeps_fields_before_a_truncated_record() {
        let raw = [0x02, 0x01, 0x06, 0x09, 0xFF, 0x4C];
        let advertisement = Advertisement::parse(&raw);

        assert_eq!(Some(0x06), advertisement.flags);
        assert!(advertisement.manufacturer_data.is_empty());
        assert_eq!(raw.to_vec(), advertisement.raw);
    }

    #[rstest]
    #[case::ibeacon(ibeacon_raw(), Some(BeaconKind::IBeacon))]
    #[case::eddystone(vec![0x04, 0x16, 0xAA, 0xFE, 0x10], Some(BeaconKind::Eddystone))]
    #[case::plain(vec![0x05, 0x09, b'L', b'a', b'm', b'p'], None)]
    fn beacon_kind_recognises_known_shapes(
        #[case] raw: Vec<u8>,
        #[case] expected: Option<BeaconKind>,
    ) {
        assert_eq!(expected, Advertisement::parse(&raw).beacon_kind());
    }

    #[test]
    fn beacon_filter_drops_plain_advertisements() {
        let plain = Advertisement::parse(&[0x05, 0x09, b'L', b'a', b'm', b'p']);
        let beacon = Advertisement::parse(&ibeacon_raw());

        assert!(ScanFilterKind::Plain.allows(&plain));
        assert!(!ScanFilterKind::Beacon.allows(&plain));
        assert!(ScanFilterKind::Beacon.allows(&beacon));
    }

    #[test]
    fn discovered_device_falls_back_to_advertised_name() {
        let advertisement = Advertisement::parse(&[0x05, 0x09, b'L', b'a', b'm', b'p']);
        let device =
            DeviceDiscovered::new(Address::from("AA:BB"), Some(-60), None, advertisement);

        assert_eq!(Some("Lamp"), device.name());
        assert_eq!("AA:BBLamp", device.dedup_key());
    }
}
