use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, instrument, trace};

use crate::attribute::{
    AttributePath, Characteristic, CharacteristicProperties, Descriptor, Service, is_cccd,
    shorten_uuid,
};
use crate::cache::AttributeCache;
use crate::codec::RadioValue;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::lifecycle::ConnectionManager;
use crate::radio::{Radio, RadioCharacteristic, WriteMode};
use crate::subscriptions::SubscriptionFanout;

/// Discovers attribute trees and performs reads and writes against them.
#[derive(Debug)]
pub struct GattClient {
    radio: Arc<dyn Radio>,
    cache: Arc<AttributeCache>,
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionFanout>,
    events: EventBus,
}

impl GattClient {
    pub(crate) fn new(
        radio: Arc<dyn Radio>,
        cache: Arc<AttributeCache>,
        connections: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionFanout>,
        events: EventBus,
    ) -> Self {
        Self {
            radio,
            cache,
            connections,
            subscriptions,
            events,
        }
    }

    /// Walks services, characteristics and descriptors of a connected device
    /// and replaces its cached tree with the result.
    ///
    /// Value reads that fail leave the value empty instead of failing the walk.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] when the device has no
    /// connection record, and radio errors from listing attributes.
    #[instrument(skip(self), level = "debug")]
    pub async fn discover(&self, address: &str) -> Result<Arc<Vec<Service>>, GatewayError> {
        if !self.connections.is_connected(address).await {
            return Err(GatewayError::NotConnected {
                address: address.to_string(),
            });
        }

        let service_uuids = self.radio.services(address).await?;
        let services = try_join_all(
            service_uuids
                .iter()
                .map(|uuid| self.discover_service(address, uuid)),
        )
        .await?;

        let mut unique: Vec<Service> = Vec::with_capacity(services.len());
        for service in services {
            if unique.iter().all(|existing| existing.uuid() != service.uuid()) {
                unique.push(service);
            }
        }
        info!(address, service_count = unique.len(), "discovery complete");
        self.cache.replace(address, unique).await;

        self.cache
            .services(address)
            .await
            .ok_or_else(|| GatewayError::NotConnected {
                address: address.to_string(),
            })
    }

    async fn discover_service(&self, address: &str, uuid: &str) -> Result<Service, GatewayError> {
        let service_path = shorten_uuid(uuid);
        let characteristics = self.radio.characteristics(address, uuid).await?;
        let characteristics = try_join_all(
            characteristics
                .into_iter()
                .map(|characteristic| {
                    self.discover_characteristic(address, &service_path, characteristic)
                }),
        )
        .await?;
        Ok(Service::new(uuid, characteristics))
    }

    async fn discover_characteristic(
        &self,
        address: &str,
        service_path: &str,
        characteristic: RadioCharacteristic,
    ) -> Result<Characteristic, GatewayError> {
        let path = AttributePath::from_uuids(service_path, &characteristic.uuid);
        let (descriptors, value) = futures::join!(
            self.discover_descriptors(address, &path),
            self.initial_value(address, &path, characteristic.properties),
        );

        Ok(Characteristic::new(
            service_path,
            &characteristic.uuid,
            characteristic.properties,
            value,
            descriptors?,
        ))
    }

    async fn discover_descriptors(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Vec<Descriptor>, GatewayError> {
        let uuids = self.radio.descriptors(address, path).await?;
        let characteristic_path = path.to_string();
        let descriptors = join_all(uuids.iter().map(|uuid| {
            let descriptor_path = path.with_descriptor(uuid);
            let characteristic_path = &characteristic_path;
            async move {
                let value = match self.radio.read_descriptor(address, &descriptor_path).await {
                    Ok(value) => decode_or_empty(&value, &descriptor_path),
                    Err(error) => {
                        debug!(%descriptor_path, %error, "descriptor read failed during discovery");
                        Vec::new()
                    }
                };
                Descriptor::new(characteristic_path, uuid, value)
            }
        }))
        .await;
        Ok(descriptors)
    }

    async fn initial_value(
        &self,
        address: &str,
        path: &AttributePath,
        properties: CharacteristicProperties,
    ) -> Vec<u8> {
        if !properties.read {
            return Vec::new();
        }
        match self.radio.read_characteristic(address, path).await {
            Ok(value) => decode_or_empty(&value, path),
            Err(error) => {
                debug!(%path, %error, "characteristic read failed during discovery");
                Vec::new()
            }
        }
    }

    /// Reads a characteristic through the radio and caches the value.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] or [`GatewayError::NotFound`]
    /// before any radio call, and radio or decoding errors afterwards.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_characteristic(
        &self,
        address: &str,
        path: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let path = AttributePath::characteristic(path)?;
        self.cache.characteristic(address, &path).await?;

        let bytes = self.radio.read_characteristic(address, &path).await?.decode()?;
        self.cache
            .set_characteristic_value(address, &path, bytes.clone())
            .await?;
        self.events.send(GatewayEvent::CharacteristicValueChanged {
            address: address.to_string(),
            path: path.to_string(),
            value: bytes.clone(),
        });
        Ok(bytes)
    }

    /// Writes a characteristic and caches the bytes that were sent.
    ///
    /// Some stacks echo a stale value after a write, so the cache records the
    /// outgoing bytes rather than a read-back.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] or [`GatewayError::NotFound`]
    /// before any radio call, and radio errors afterwards.
    #[instrument(skip(self, bytes), level = "debug", fields(len = bytes.len()))]
    pub async fn write_characteristic(
        &self,
        address: &str,
        path: &str,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), GatewayError> {
        let path = AttributePath::characteristic(path)?;
        self.cache.characteristic(address, &path).await?;

        self.radio
            .write_characteristic(
                address,
                &path,
                RadioValue::encode(bytes),
                WriteMode::from_ack(ack),
            )
            .await?;
        self.cache
            .set_characteristic_value(address, &path, bytes.to_vec())
            .await?;
        self.events.send(GatewayEvent::CharacteristicValueChanged {
            address: address.to_string(),
            path: path.to_string(),
            value: bytes.to_vec(),
        });
        Ok(())
    }

    /// Reads a descriptor through the radio and caches the value.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] or [`GatewayError::NotFound`]
    /// before any radio call, and radio or decoding errors afterwards.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_descriptor(&self, address: &str, path: &str) -> Result<Vec<u8>, GatewayError> {
        let path = AttributePath::descriptor(path)?;
        self.cache.descriptor(address, &path).await?;

        let bytes = self.radio.read_descriptor(address, &path).await?.decode()?;
        self.cache
            .set_descriptor_value(address, &path, bytes.clone())
            .await?;
        self.events.send(GatewayEvent::DescriptorValueChanged {
            address: address.to_string(),
            path: path.to_string(),
            value: bytes.clone(),
        });
        Ok(bytes)
    }

    /// Writes a descriptor.
    ///
    /// Writes to the notification-configuration descriptor (`2902`) subscribe
    /// the owning characteristic when the first byte is non-zero and
    /// unsubscribe it otherwise; no literal descriptor write is issued.
    /// The radio has no descriptor write mode, so `ack` only shows up in traces.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPath`] or [`GatewayError::NotFound`]
    /// before any radio call, and subscription or radio errors afterwards.
    #[instrument(skip(self, bytes), level = "debug", fields(len = bytes.len()))]
    pub async fn write_descriptor(
        &self,
        address: &str,
        path: &str,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), GatewayError> {
        let path = AttributePath::descriptor(path)?;
        if !ack {
            trace!(%path, "descriptor writes are always acknowledged by the stack");
        }
        let descriptor_uuid = path.descriptor_uuid().unwrap_or_default();

        if is_cccd(descriptor_uuid) {
            let characteristic_path = path.characteristic_path();
            self.cache.characteristic(address, &characteristic_path).await?;
            if bytes.first().is_some_and(|flag| *flag != 0) {
                self.subscriptions
                    .enable_notifications(address, &characteristic_path)
                    .await?;
            } else {
                self.subscriptions
                    .unsubscribe_path(address, &characteristic_path)
                    .await?;
            }
            if let Err(error) = self
                .cache
                .set_descriptor_value(address, &path, bytes.to_vec())
                .await
            {
                debug!(%error, "configuration descriptor was not discovered");
            }
        } else {
            self.cache.descriptor(address, &path).await?;
            self.radio
                .write_descriptor(address, &path, RadioValue::encode(bytes))
                .await?;
            self.cache
                .set_descriptor_value(address, &path, bytes.to_vec())
                .await?;
        }

        self.events.send(GatewayEvent::DescriptorValueChanged {
            address: address.to_string(),
            path: path.to_string(),
            value: bytes.to_vec(),
        });
        Ok(())
    }
}

fn decode_or_empty(value: &RadioValue, path: &AttributePath) -> Vec<u8> {
    value.decode().unwrap_or_else(|error| {
        debug!(%path, %error, "undecodable value during discovery");
        Vec::new()
    })
}
