use std::time::Duration;

use thiserror::Error;

/// Errors reported by the radio stack for a single primitive invocation.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RadioError {
    #[error("device `{address}` was never connected")]
    NeverConnected { address: String },
    #[error("device `{address}` is already disconnected")]
    AlreadyDisconnected { address: String },
    #[error("device `{address}` isn't disconnected")]
    NotDisconnected { address: String },
    #[error("device `{address}` was previously connected")]
    PreviouslyConnected { address: String },
    #[error("device `{address}` is already unbonded")]
    AlreadyUnbonded { address: String },
    #[error("characteristic `{characteristic}` is already subscribed")]
    AlreadySubscribed { characteristic: String },
    #[error("characteristic `{characteristic}` is already unsubscribed")]
    AlreadyUnsubscribed { characteristic: String },
    #[error("bluetooth permission was denied")]
    PermissionDenied,
    #[error("bluetooth radio is disabled")]
    Disabled,
    #[error("location services are required for scanning")]
    LocationRequired,
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("device `{address}` is unknown to the radio")]
    UnknownDevice { address: String },
    #[error("attribute `{uuid}` is unknown to the radio")]
    UnknownAttribute { uuid: String },
    #[error("radio operation failed: {message}")]
    Failed { message: String },
}

impl RadioError {
    /// Whether a disconnect or unbond failure means the link is already gone.
    #[must_use]
    pub fn is_teardown_noop(&self) -> bool {
        matches!(
            self,
            Self::NeverConnected { .. }
                | Self::AlreadyDisconnected { .. }
                | Self::NotDisconnected { .. }
                | Self::AlreadyUnbonded { .. }
        )
    }

    /// Whether a close failure means there was never a handle to close.
    #[must_use]
    pub fn is_close_noop(&self) -> bool {
        matches!(self, Self::NeverConnected { .. })
    }

    /// Whether the stack claims the device is still connected.
    #[must_use]
    pub fn is_stale_connection(&self) -> bool {
        matches!(self, Self::NotDisconnected { .. })
    }

    /// Whether the stack remembers an earlier link to the device.
    #[must_use]
    pub fn is_previously_connected(&self) -> bool {
        matches!(self, Self::PreviouslyConnected { .. })
    }

    /// Whether a subscribe failure only reports an existing subscription.
    #[must_use]
    pub fn is_already_subscribed(&self) -> bool {
        matches!(self, Self::AlreadySubscribed { .. })
    }

    /// Whether an unsubscribe failure only reports a missing subscription.
    #[must_use]
    pub fn is_already_unsubscribed(&self) -> bool {
        matches!(self, Self::AlreadyUnsubscribed { .. })
    }
}

impl From<btleplug::Error> for RadioError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::NotConnected => Self::AlreadyDisconnected {
                address: String::new(),
            },
            btleplug::Error::DeviceNotFound => Self::UnknownDevice {
                address: String::new(),
            },
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }
}

/// Errors returned to callers of the gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("timed out after {}s connecting to `{address}`", .wait.as_secs())]
    ConnectTimeout { address: String, wait: Duration },
    #[error("device `{address}` is stuck in a stale connection state")]
    ZombieConnection {
        address: String,
        #[source]
        source: RadioError,
    },
    #[error("invalid attribute path `{path}`")]
    InvalidPath { path: String },
    #[error("attribute `{path}` was not found on device `{address}`")]
    NotFound { address: String, path: String },
    #[error("device `{address}` is not connected")]
    NotConnected { address: String },
    #[error("characteristic `{path}` does not support notify or indicate")]
    NotSubscribable { path: String },
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("bluetooth permission was denied")]
    PermissionDenied,
    #[error("bluetooth radio is disabled")]
    RadioDisabled,
    #[error("location services are required for scanning")]
    LocationRequired,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("radio operation failed")]
    Radio(#[source] RadioError),
}

impl GatewayError {
    /// Whether remediation needs a system-level permission or settings change.
    #[must_use]
    pub fn is_adapter_unavailable(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::RadioDisabled | Self::LocationRequired
        )
    }

    /// Whether the device could not be reached and a later retry may succeed.
    #[must_use]
    pub fn is_device_unreachable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ZombieConnection { .. } | Self::NotConnected { .. }
        )
    }
}

impl From<RadioError> for GatewayError {
    fn from(error: RadioError) -> Self {
        match error {
            RadioError::PermissionDenied => Self::PermissionDenied,
            RadioError::Disabled => Self::RadioDisabled,
            RadioError::LocationRequired => Self::LocationRequired,
            other => Self::Radio(other),
        }
    }
}

/// Errors returned while decoding platform-encoded payloads.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CodecError {
    #[error("payload `{value}` is not valid base64")]
    InvalidEncoding { value: String },
}

/// Errors returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{path}`")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file `{path}`")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("connect timeout floor ({floor:?}) exceeds the ceiling ({ceiling:?})")]
    BackoffBounds { floor: Duration, ceiling: Duration },
    #[error("`{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Errors returned when parsing fake radio fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot have an empty address")]
    EmptyAddress,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("advertisement payload is not valid hex")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
