mod address;
mod advertisement;
mod app;
mod attribute;
mod cache;
mod cli;
mod codec;
mod config;
mod discovery;
mod error;
mod events;
mod gateway;
mod lifecycle;
pub mod radio;
mod scheduler;
mod subscriptions;
mod telemetry;
mod terminal;
mod utils;

pub use address::{Address, AddressType};
pub use advertisement::{
    Advertisement, BeaconKind, DeviceDiscovered, ManufacturerData, ScanFilterKind, ServiceData,
};
pub use app::{fake_radio, real_radio, run, run_with_clients};
pub use attribute::{
    AttributePath, CCCD_UUID, Characteristic, CharacteristicProperties, Descriptor, Service,
    expand_uuid, format_uuid_if_necessary, is_cccd, shorten_uuid,
};
pub use cache::AttributeCache;
pub use cli::{
    Args, Command, ConnectArgs, FakeArgs, LogLevel, OutputFormat, ScanArgs, WatchArgs,
};
pub use codec::RadioValue;
pub use config::{ConfigOverrides, GatewayConfig};
pub use discovery::GattClient;
pub use error::{CodecError, ConfigError, FixtureError, GatewayError, RadioError};
pub use events::{AdapterState, AdapterStateStore, EventBus, GatewayEvent};
pub use gateway::Gateway;
pub use lifecycle::{ConnectBackoff, ConnectionManager, ConnectionRecord};
pub use radio::fake::{
    ConnectOutcome, FakeCharacteristic, FakeDescriptor, FakeDevice, FakeRadio, FakeRadioConfig,
    FakeService, ScanFixture,
};
pub use radio::{
    BtleplugRadio, Radio, RadioCharacteristic, RadioEvent, ScanAdvertisement, ScanRecord,
    TeardownPrimitive, WriteMode,
};
pub use scheduler::{ScanScheduler, ScanTiming, WatchEntry};
pub use subscriptions::{Notification, Subscription, SubscriptionFanout};
pub use terminal::{SystemTerminalClient, TerminalClient};
