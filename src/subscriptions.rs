use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::serde_as;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::attribute::AttributePath;
use crate::cache::AttributeCache;
use crate::codec::RadioValue;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::radio::Radio;

type Listeners = Vec<mpsc::UnboundedSender<Notification>>;

/// A characteristic value delivered to a subscription listener.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Notification {
    address: String,
    path: String,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
}

impl Notification {
    pub(crate) fn new(address: &str, path: &str, value: Vec<u8>) -> Self {
        Self {
            address: address.to_string(),
            path: path.to_string(),
            value,
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Listener half of a subscription. The stream ends when the subscription is
/// removed by `unsubscribe` or by a device disconnect.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Waits for the next notification.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<Notification> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Tracks notify/indicate registrations and routes incoming values.
#[derive(Debug)]
pub struct SubscriptionFanout {
    radio: Arc<dyn Radio>,
    cache: Arc<AttributeCache>,
    events: EventBus,
    entries: Mutex<HashMap<(String, AttributePath), Listeners>>,
}

impl SubscriptionFanout {
    pub(crate) fn new(radio: Arc<dyn Radio>, cache: Arc<AttributeCache>, events: EventBus) -> Self {
        Self {
            radio,
            cache,
            events,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to a characteristic and registers a new listener.
    ///
    /// Every caller gets its own listener; a radio report that the
    /// characteristic is already subscribed counts as success.
    ///
    /// # Errors
    ///
    /// Fails without a radio call for malformed paths, uncached
    /// characteristics, and characteristics without notify or indicate.
    /// Other radio failures are returned after the listener is removed again.
    #[instrument(skip(self), level = "debug")]
    pub async fn subscribe(&self, address: &str, path: &str) -> Result<Subscription, GatewayError> {
        let path = self.subscribable_path(address, path).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.entries
            .lock()
            .await
            .entry((address.to_string(), path.clone()))
            .or_default()
            .push(sender.clone());

        if let Err(error) = self.radio_subscribe(address, &path).await {
            self.remove_listener(address, &path, &sender).await;
            return Err(error);
        }

        info!(address, %path, "subscribed");
        Ok(Subscription { receiver })
    }

    /// Enables notifications without a listener; values still update the
    /// cache and the event bus.
    pub(crate) async fn enable_notifications(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<(), GatewayError> {
        let path = self.subscribable_path(address, &path.to_string()).await?;
        self.radio_subscribe(address, &path).await?;
        self.entries
            .lock()
            .await
            .entry((address.to_string(), path))
            .or_default();
        Ok(())
    }

    /// Unsubscribes and closes every listener of the characteristic.
    ///
    /// # Errors
    ///
    /// Fails for malformed or uncached paths, or when the radio rejects the
    /// call for a reason other than the subscription already being gone.
    #[instrument(skip(self), level = "debug")]
    pub async fn unsubscribe(&self, address: &str, path: &str) -> Result<(), GatewayError> {
        let path = AttributePath::characteristic(path)?;
        self.cache.characteristic(address, &path).await?;
        self.unsubscribe_path(address, &path).await
    }

    pub(crate) async fn unsubscribe_path(
        &self,
        address: &str,
        path: &AttributePath,
    ) -> Result<(), GatewayError> {
        match self.radio.unsubscribe(address, path).await {
            Ok(()) => {}
            Err(error) if error.is_already_unsubscribed() => {
                debug!(address, %path, "characteristic was already unsubscribed");
            }
            Err(error) => return Err(error.into()),
        }

        self.entries
            .lock()
            .await
            .remove(&(address.to_string(), path.clone()));
        info!(address, %path, "unsubscribed");
        Ok(())
    }

    /// Drops every registration for a device without calling the radio.
    pub async fn invalidate_device(&self, address: &str) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|(owner, _), _| owner != address);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(address, removed, "invalidated subscriptions");
        }
    }

    pub async fn is_subscribed(&self, address: &str, path: &AttributePath) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(address.to_string(), path.clone()))
    }

    /// Paths with an active registration for the device, sorted.
    pub async fn subscriptions(&self, address: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .lock()
            .await
            .keys()
            .filter(|(owner, _)| owner == address)
            .map(|(_, path)| path.to_string())
            .collect();
        paths.sort();
        paths
    }

    /// Routes one incoming value to the cache, the event bus and the listeners.
    #[instrument(skip(self, value), level = "trace", fields(%path))]
    pub(crate) async fn handle_notification(
        &self,
        address: &str,
        path: &AttributePath,
        value: &RadioValue,
    ) {
        let bytes = match value.decode() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, address, "dropping undecodable notification");
                return;
            }
        };

        if let Err(error) = self
            .cache
            .set_characteristic_value(address, path, bytes.clone())
            .await
        {
            debug!(%error, "notification for an uncached characteristic");
        }
        self.events.send(GatewayEvent::CharacteristicValueChanged {
            address: address.to_string(),
            path: path.to_string(),
            value: bytes.clone(),
        });

        let notification = Notification::new(address, &path.to_string(), bytes);
        let mut entries = self.entries.lock().await;
        if let Some(listeners) = entries.get_mut(&(address.to_string(), path.clone())) {
            listeners.retain(|listener| listener.send(notification.clone()).is_ok());
        }
    }

    async fn subscribable_path(
        &self,
        address: &str,
        path: &str,
    ) -> Result<AttributePath, GatewayError> {
        let path = AttributePath::characteristic(path)?;
        let characteristic = self.cache.characteristic(address, &path).await?;
        if !characteristic.properties().supports_subscription() {
            return Err(GatewayError::NotSubscribable {
                path: path.to_string(),
            });
        }
        Ok(path)
    }

    async fn radio_subscribe(&self, address: &str, path: &AttributePath) -> Result<(), GatewayError> {
        match self.radio.subscribe(address, path).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_already_subscribed() => {
                debug!(address, %path, "characteristic was already subscribed");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_listener(
        &self,
        address: &str,
        path: &AttributePath,
        sender: &mpsc::UnboundedSender<Notification>,
    ) {
        let key = (address.to_string(), path.clone());
        let mut entries = self.entries.lock().await;
        if let Some(listeners) = entries.get_mut(&key) {
            listeners.retain(|listener| !listener.same_channel(sender));
            if listeners.is_empty() {
                entries.remove(&key);
            }
        }
    }
}
