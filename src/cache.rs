use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use crate::attribute::{AttributePath, Characteristic, Descriptor, Service};
use crate::error::GatewayError;

/// Cached attribute trees keyed by device address.
///
/// Trees are shared as immutable snapshots; updates clone a tree that is still
/// referenced by a reader instead of mutating it in place.
#[derive(Debug, Default)]
pub struct AttributeCache {
    trees: RwLock<HashMap<String, Arc<Vec<Service>>>>,
}

impl AttributeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole tree for a device.
    #[instrument(skip(self, services), level = "debug", fields(service_count = services.len()))]
    pub async fn replace(&self, address: &str, services: Vec<Service>) {
        self.trees
            .write()
            .await
            .insert(address.to_string(), Arc::new(services));
    }

    /// Returns a snapshot of the device tree, if one was discovered.
    pub async fn services(&self, address: &str) -> Option<Arc<Vec<Service>>> {
        self.trees.read().await.get(address).cloned()
    }

    /// Looks up a characteristic by path.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when the device, service or
    /// characteristic is absent from the cache.
    pub async fn characteristic(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Characteristic, GatewayError> {
        let trees = self.trees.read().await;
        trees
            .get(address)
            .and_then(|services| find_characteristic(services, path))
            .cloned()
            .ok_or_else(|| not_found(address, path))
    }

    /// Looks up a descriptor by three-segment path.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when any segment is absent from the cache.
    pub async fn descriptor(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<Descriptor, GatewayError> {
        let descriptor_uuid = path.descriptor_uuid().unwrap_or_default();
        self.characteristic(address, &path.characteristic_path())
            .await?
            .descriptor(descriptor_uuid)
            .cloned()
            .ok_or_else(|| not_found(address, path))
    }

    /// Records the last known value of a characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when the characteristic is not cached.
    pub async fn set_characteristic_value(
        &self,
        address: &str,
        path: &AttributePath,
        value: Vec<u8>,
    ) -> Result<(), GatewayError> {
        let mut trees = self.trees.write().await;
        let characteristic = trees
            .get_mut(address)
            .and_then(|services| {
                find_characteristic_mut(Arc::make_mut(services).as_mut_slice(), path)
            })
            .ok_or_else(|| not_found(address, path))?;
        characteristic.set_value(value);
        Ok(())
    }

    /// Records the last known value of a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when the descriptor is not cached.
    pub async fn set_descriptor_value(
        &self,
        address: &str,
        path: &AttributePath,
        value: Vec<u8>,
    ) -> Result<(), GatewayError> {
        let descriptor_uuid = path.descriptor_uuid().unwrap_or_default();
        let characteristic_path = path.characteristic_path();
        let mut trees = self.trees.write().await;
        let descriptor = trees
            .get_mut(address)
            .and_then(|services| {
                find_characteristic_mut(
                    Arc::make_mut(services).as_mut_slice(),
                    &characteristic_path,
                )
            })
            .and_then(|characteristic| characteristic.descriptor_mut(descriptor_uuid))
            .ok_or_else(|| not_found(address, path))?;
        descriptor.set_value(value);
        Ok(())
    }
}

fn find_characteristic<'a>(
    services: &'a [Service],
    path: &AttributePath,
) -> Option<&'a Characteristic> {
    services
        .iter()
        .find(|service| service.uuid() == path.service())
        .and_then(|service| service.characteristic(path.characteristic_uuid()))
}

fn find_characteristic_mut<'a>(
    services: &'a mut [Service],
    path: &AttributePath,
) -> Option<&'a mut Characteristic> {
    services
        .iter_mut()
        .find(|service| service.uuid() == path.service())
        .and_then(|service| service.characteristic_mut(path.characteristic_uuid()))
}

fn not_found(address: &str, path: &AttributePath) -> GatewayError {
    GatewayError::NotFound {
        address: address.to_string(),
        path: path.to_string(),
    }
}
