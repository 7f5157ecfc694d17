use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use blegate::{
    Address, CharacteristicProperties, FakeCharacteristic, FakeDescriptor, FakeDevice, FakeRadio,
    FakeRadioConfig, FakeService, Gateway, GatewayConfig, GatewayError, GatewayEvent,
};

const SENSOR: &str = "AA:BB:CC:DD:EE:02";

fn sensor() -> FakeDevice {
    let counter = FakeCharacteristic::builder()
        .uuid("aaaa")
        .properties(CharacteristicProperties {
            notify: true,
            ..CharacteristicProperties::default()
        })
        .value(vec![0xff])
        .build();
    let reading = FakeCharacteristic::builder()
        .uuid("bbbb")
        .properties(CharacteristicProperties {
            read: true,
            write: true,
            ..CharacteristicProperties::default()
        })
        .value(vec![0x01, 0x02])
        .descriptors(vec![
            FakeDescriptor::builder()
                .uuid("2901")
                .value(b"temp".to_vec())
                .build(),
        ])
        .build();
    let battery = FakeCharacteristic::builder()
        .uuid("00002a19-0000-1000-8000-00805f9b34fb")
        .properties(CharacteristicProperties {
            read: true,
            ..CharacteristicProperties::default()
        })
        .value(vec![0x50])
        .read_fails(true)
        .build();

    FakeDevice::builder()
        .address(SENSOR)
        .name("Sensor".to_string())
        .rssi(-50)
        .services(vec![
            FakeService::builder()
                .uuid("1234")
                .characteristics(vec![counter, reading])
                .build(),
            FakeService::builder()
                .uuid("0000180f-0000-1000-8000-00805f9b34fb")
                .characteristics(vec![battery])
                .build(),
        ])
        .build()
}

async fn connected_gateway() -> anyhow::Result<(Arc<FakeRadio>, Gateway)> {
    let radio = Arc::new(FakeRadio::new(
        FakeRadioConfig::builder().devices(vec![sensor()]).build(),
    ));
    let gateway = Gateway::new(radio.clone(), GatewayConfig::default());
    gateway.open().await?;
    gateway.connect(&Address::from(SENSOR)).await?;
    Ok((radio, gateway))
}

#[tokio::test]
async fn discovery_builds_the_tree_with_shortened_uuids() -> anyhow::Result<()> {
    let (_radio, gateway) = connected_gateway().await?;

    let services = gateway.discover(SENSOR).await?;

    let paths: Vec<&str> = services.iter().map(|service| service.path()).collect();
    assert_eq!(vec!["1234", "180f"], paths);

    let custom = &services[0];
    let counter = custom.characteristic("aaaa").expect("counter should be cached");
    assert!(counter.properties().notify);
    assert!(counter.value().is_empty(), "unreadable values stay empty");
    let reading = custom.characteristic("bbbb").expect("reading should be cached");
    assert_eq!(&[0x01, 0x02], reading.value());
    assert_eq!(
        b"temp".as_slice(),
        reading
            .descriptor("2901")
            .expect("descriptor should be cached")
            .value()
    );

    let battery = services[1]
        .characteristic("2a19")
        .expect("battery level should be cached");
    assert_eq!("180f/2a19", battery.path());
    assert!(battery.value().is_empty(), "failed reads leave the value empty");
    Ok(())
}

#[tokio::test]
async fn discovery_requires_a_connection() {
    let radio = Arc::new(FakeRadio::new(
        FakeRadioConfig::builder().devices(vec![sensor()]).build(),
    ));
    let gateway = Gateway::new(radio, GatewayConfig::default());

    let result = gateway.discover(SENSOR).await;

    assert_matches!(result, Err(GatewayError::NotConnected { .. }));
}

#[tokio::test]
async fn bad_paths_fail_before_reaching_the_radio() -> anyhow::Result<()> {
    let (radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;
    let reads_before = radio.call_count("read_characteristic").await;

    assert_matches!(
        gateway.read_characteristic(SENSOR, "1234").await,
        Err(GatewayError::InvalidPath { .. })
    );
    assert_matches!(
        gateway.read_characteristic(SENSOR, "1234/ffff").await,
        Err(GatewayError::NotFound { .. })
    );
    assert_matches!(
        gateway.read_characteristic("00:00:00:00:00:00", "1234/bbbb").await,
        Err(GatewayError::NotFound { .. })
    );
    assert_matches!(
        gateway.read_descriptor(SENSOR, "1234/bbbb").await,
        Err(GatewayError::InvalidPath { .. })
    );
    assert_matches!(
        gateway.read_descriptor(SENSOR, "1234/bbbb/2902").await,
        Err(GatewayError::NotFound { .. })
    );

    assert_eq!(reads_before, radio.call_count("read_characteristic").await);
    // Only the discovery walk read the descriptor.
    assert_eq!(1, radio.call_count("read_descriptor").await);
    Ok(())
}

#[tokio::test]
async fn write_caches_the_bytes_sent() -> anyhow::Result<()> {
    let (radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;
    let mut events = gateway.subscribe_events();

    gateway
        .write_characteristic(SENSOR, "1234/bbbb", &[0x07], false)
        .await?;

    let services = gateway.services(SENSOR).await.expect("tree should be cached");
    let reading = services[0]
        .characteristic("bbbb")
        .expect("reading should be cached");
    assert_eq!(&[0x07], reading.value());
    assert!(
        radio
            .calls()
            .await
            .contains(&format!("write_characteristic {SENSOR} 1234/bbbb without-response"))
    );
    assert_eq!(
        GatewayEvent::CharacteristicValueChanged {
            address: SENSOR.to_string(),
            path: "1234/bbbb".to_string(),
            value: vec![0x07],
        },
        events.try_recv()?
    );
    Ok(())
}

#[tokio::test]
async fn read_refreshes_the_cached_value() -> anyhow::Result<()> {
    let (_radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;

    gateway
        .write_characteristic(SENSOR, "1234/bbbb", &[0x09, 0x08], true)
        .await?;
    let bytes = gateway.read_characteristic(SENSOR, "1234/bbbb").await?;

    assert_eq!(vec![0x09, 0x08], bytes);
    Ok(())
}

#[tokio::test]
async fn plain_descriptors_are_written_through() -> anyhow::Result<()> {
    let (radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;

    gateway
        .write_descriptor(SENSOR, "1234/bbbb/2901", b"heat", true)
        .await?;

    assert_eq!(1, radio.call_count("write_descriptor").await);
    assert_eq!(
        b"heat".to_vec(),
        gateway.read_descriptor(SENSOR, "1234/bbbb/2901").await?
    );
    Ok(())
}

#[tokio::test]
async fn descriptor_writes_ignore_the_acknowledgement_flag() -> anyhow::Result<()> {
    let (radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;

    gateway
        .write_descriptor(SENSOR, "1234/bbbb/2901", b"cold", false)
        .await?;

    assert_eq!(
        vec![format!("write_descriptor {SENSOR} 1234/bbbb/2901")],
        radio
            .calls()
            .await
            .into_iter()
            .filter(|call| call.starts_with("write_descriptor"))
            .collect::<Vec<_>>()
    );
    assert_eq!(
        b"cold".to_vec(),
        gateway.read_descriptor(SENSOR, "1234/bbbb/2901").await?
    );
    Ok(())
}

#[tokio::test]
async fn cached_tree_survives_disconnect() -> anyhow::Result<()> {
    let (_radio, gateway) = connected_gateway().await?;
    gateway.discover(SENSOR).await?;

    gateway.disconnect(SENSOR).await?;

    assert!(gateway.services(SENSOR).await.is_some());
    Ok(())
}

#[tokio::test]
async fn rediscovery_replaces_the_tree() -> anyhow::Result<()> {
    let (_radio, gateway) = connected_gateway().await?;
    let first = gateway.discover(SENSOR).await?;
    gateway
        .write_characteristic(SENSOR, "1234/bbbb", &[0x33], true)
        .await?;

    let second = gateway.discover(SENSOR).await?;

    assert_eq!(first.len(), second.len());
    assert_eq!(
        &[0x33],
        second[0]
            .characteristic("bbbb")
            .expect("reading should be cached")
            .value()
    );
    Ok(())
}
