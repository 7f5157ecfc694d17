use std::fmt;

use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::serde_as;

use crate::error::GatewayError;

/// Short UUID of the Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: &str = "2902";
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";
const BASE_UUID_TAIL: &str = "00001000800000805f9b34fb";

/// Reformats a 32-character UUID without dashes into canonical dashed form.
///
/// Any other input is returned unchanged.
///
/// ```
/// assert_eq!(
///     "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
///     blegate::format_uuid_if_necessary("6e400001b5a3f393e0a9e50e24dcca9e"),
/// );
/// assert_eq!("180f", blegate::format_uuid_if_necessary("180f"));
/// ```
#[must_use]
pub fn format_uuid_if_necessary(uuid: &str) -> String {
    if uuid.len() != 32 || !uuid.is_ascii() {
        return uuid.to_string();
    }

    format!(
        "{}-{}-{}-{}-{}",
        &uuid[0..8],
        &uuid[8..12],
        &uuid[12..16],
        &uuid[16..20],
        &uuid[20..32]
    )
}

/// Normalises a UUID for use as a cache key.
///
/// Dashes are stripped and letters lowercased. UUIDs on the Bluetooth base
/// collapse to their 16-bit alias, so `2A19`, `00002a19` and
/// `00002a19-0000-1000-8000-00805f9b34fb` share one key.
///
/// ```
/// assert_eq!("2a19", blegate::shorten_uuid("00002A19-0000-1000-8000-00805F9B34FB"));
/// ```
#[must_use]
pub fn shorten_uuid(uuid: &str) -> String {
    let bare: String = uuid
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let on_base = match bare.len() {
        32 => bare.ends_with(BASE_UUID_TAIL),
        8 => true,
        _ => false,
    };
    if on_base && bare.starts_with("0000") && bare.is_ascii() {
        bare[4..8].to_string()
    } else {
        bare
    }
}

/// Expands a 16-bit short UUID onto the Bluetooth base UUID.
///
/// Longer UUIDs pass through [`format_uuid_if_necessary`].
#[must_use]
pub fn expand_uuid(uuid: &str) -> String {
    let short = shorten_uuid(uuid);
    match short.len() {
        4 => format!("0000{short}{BASE_UUID_SUFFIX}"),
        8 => format!("{short}{BASE_UUID_SUFFIX}"),
        _ => format_uuid_if_necessary(&short),
    }
}

/// Whether a descriptor UUID names the notification-configuration descriptor.
#[must_use]
pub fn is_cccd(uuid: &str) -> bool {
    shorten_uuid(uuid) == CCCD_UUID
}

/// Access properties advertised by a characteristic.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
}

impl CharacteristicProperties {
    /// Whether the characteristic can deliver value-changed notifications.
    #[must_use]
    pub fn supports_subscription(&self) -> bool {
        self.notify || self.indicate
    }

    /// Lowercase labels for every set property.
    #[must_use]
    pub fn labels(&self) -> Vec<&'static str> {
        [
            (self.broadcast, "broadcast"),
            (self.read, "read"),
            (self.write_without_response, "write_without_response"),
            (self.write, "write"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
            (self.authenticated_signed_writes, "authenticated_signed_writes"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
        .collect()
    }
}

/// A descriptor in the cached attribute tree.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Descriptor {
    uuid: String,
    path: String,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
}

impl Descriptor {
    pub(crate) fn new(characteristic_path: &str, uuid: &str, value: Vec<u8>) -> Self {
        let uuid = shorten_uuid(uuid);
        Self {
            path: format!("{characteristic_path}/{uuid}"),
            uuid,
            value,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns `service/characteristic/descriptor`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the last known value; empty when never read.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }
}

/// A characteristic in the cached attribute tree.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Characteristic {
    uuid: String,
    path: String,
    properties: CharacteristicProperties,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
    descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub(crate) fn new(
        service_path: &str,
        uuid: &str,
        properties: CharacteristicProperties,
        value: Vec<u8>,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let uuid = shorten_uuid(uuid);
        Self {
            path: format!("{service_path}/{uuid}"),
            uuid,
            properties,
            value,
            descriptors,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns `service/characteristic`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Returns the last known value; empty when never read.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    #[must_use]
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn descriptor(&self, uuid: &str) -> Option<&Descriptor> {
        let uuid = shorten_uuid(uuid);
        self.descriptors.iter().find(|descriptor| descriptor.uuid == uuid)
    }

    pub(crate) fn descriptor_mut(&mut self, uuid: &str) -> Option<&mut Descriptor> {
        let uuid = shorten_uuid(uuid);
        self.descriptors
            .iter_mut()
            .find(|descriptor| descriptor.uuid == uuid)
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }
}

/// A service in the cached attribute tree.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Service {
    uuid: String,
    path: String,
    characteristics: Vec<Characteristic>,
}

impl Service {
    /// Creates a service, keeping the first characteristic for each UUID.
    pub(crate) fn new(uuid: &str, characteristics: Vec<Characteristic>) -> Self {
        let uuid = shorten_uuid(uuid);
        let mut unique: Vec<Characteristic> = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            if unique
                .iter()
                .all(|existing| existing.uuid != characteristic.uuid)
            {
                unique.push(characteristic);
            }
        }

        Self {
            path: uuid.clone(),
            uuid,
            characteristics: unique,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    #[must_use]
    pub fn characteristic(&self, uuid: &str) -> Option<&Characteristic> {
        let uuid = shorten_uuid(uuid);
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
    }

    pub(crate) fn characteristic_mut(&mut self, uuid: &str) -> Option<&mut Characteristic> {
        let uuid = shorten_uuid(uuid);
        self.characteristics
            .iter_mut()
            .find(|characteristic| characteristic.uuid == uuid)
    }
}

/// A parsed `service/characteristic[/descriptor]` path with shortened UUIDs.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AttributePath {
    service: String,
    characteristic: String,
    descriptor: Option<String>,
}

impl AttributePath {
    /// Parses a characteristic path; trailing segments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] when fewer than two segments are present.
    pub fn characteristic(path: &str) -> Result<Self, GatewayError> {
        let segments = split_segments(path, 2)?;
        Ok(Self {
            service: segments[0].clone(),
            characteristic: segments[1].clone(),
            descriptor: None,
        })
    }

    /// Parses a descriptor path.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] when fewer than three segments are present.
    pub fn descriptor(path: &str) -> Result<Self, GatewayError> {
        let segments = split_segments(path, 3)?;
        Ok(Self {
            service: segments[0].clone(),
            characteristic: segments[1].clone(),
            descriptor: Some(segments[2].clone()),
        })
    }

    pub(crate) fn from_uuids(service: &str, characteristic: &str) -> Self {
        Self {
            service: shorten_uuid(service),
            characteristic: shorten_uuid(characteristic),
            descriptor: None,
        }
    }

    /// Path of a descriptor under this characteristic.
    pub(crate) fn with_descriptor(&self, uuid: &str) -> Self {
        Self {
            descriptor: Some(shorten_uuid(uuid)),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn characteristic_uuid(&self) -> &str {
        &self.characteristic
    }

    #[must_use]
    pub fn descriptor_uuid(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    /// Returns the path of the owning characteristic.
    #[must_use]
    pub fn characteristic_path(&self) -> Self {
        Self {
            descriptor: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)?;
        if let Some(descriptor) = &self.descriptor {
            write!(f, "/{descriptor}")?;
        }
        Ok(())
    }
}

fn split_segments(path: &str, required: usize) -> Result<Vec<String>, GatewayError> {
    let segments: Vec<String> = path.split('/').map(shorten_uuid).collect();
    if segments.len() < required || segments[..required].iter().any(String::is_empty) {
        return Err(GatewayError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(segments)
}
