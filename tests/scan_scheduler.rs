use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use blegate::{
    Address, BeaconKind, FakeDevice, FakeRadio, FakeRadioConfig, Gateway, GatewayConfig,
    GatewayError, GatewayEvent, RadioValue, ScanAdvertisement, ScanFilterKind, ScanRecord,
};

const LAMP: &str = "AA:BB:CC:DD:EE:01";
const TAG: &str = "AA:BB:CC:DD:EE:04";

fn ibeacon_advertisement() -> Vec<u8> {
    let mut raw = vec![0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];
    raw.extend_from_slice(&[
        0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, 0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10, 0x96,
        0xE0,
    ]);
    raw.extend_from_slice(&[0x00, 0x01, 0x00, 0x02, 0xC5]);
    raw
}

async fn open_gateway(devices: Vec<FakeDevice>) -> (Arc<FakeRadio>, Gateway) {
    let radio = Arc::new(FakeRadio::new(
        FakeRadioConfig::builder().devices(devices).build(),
    ));
    let gateway = Gateway::new(radio.clone(), GatewayConfig::default());
    gateway.open().await.expect("gateway should open");
    (radio, gateway)
}

fn lamp() -> FakeDevice {
    FakeDevice::with_default_gatt(LAMP, Some("Lamp".to_string()), Some(-55))
}

fn tag() -> FakeDevice {
    FakeDevice::builder()
        .address(TAG)
        .name("Tag".to_string())
        .rssi(-75)
        .advertisement(ibeacon_advertisement())
        .build()
}

fn sighting(address: &str, name: Option<&str>, rssi: i16) -> ScanRecord {
    ScanRecord {
        address: Address::from(address),
        name: name.map(str::to_string),
        rssi: Some(rssi),
        advertisement: ScanAdvertisement::Raw(RadioValue::Empty),
    }
}

fn drain(events: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn watch_burst_tracks_latest_sighting() {
    let (radio, gateway) = open_gateway(vec![lamp()]).await;
    let mut events = gateway.subscribe_events();

    assert_eq!(vec![LAMP.to_string()], gateway.watch([LAMP]).await);
    sleep(Duration::from_secs(1)).await;
    radio.emit_scan_result(sighting(LAMP, None, -70));
    sleep(Duration::from_secs(2)).await;

    let published = drain(&mut events);
    let discovered = published
        .iter()
        .filter(|event| matches!(event, GatewayEvent::DeviceDiscovered(_)))
        .count();
    let beacon_updates = published
        .iter()
        .filter(|event| matches!(event, GatewayEvent::BeaconUpdated(_)))
        .count();
    assert_eq!(1, discovered, "one discovery per address per burst");
    assert_eq!(2, beacon_updates);

    let beacons = gateway.beacons().await;
    assert_eq!(1, beacons.len());
    let last_seen = beacons[0].last_seen().expect("lamp should have been seen");
    assert_eq!(Some(-70), last_seen.rssi());
    assert!(!radio.is_scanning().await);
    assert!(!gateway.state().scanning);
}

#[tokio::test(start_paused = true)]
async fn unwatched_devices_are_ignored_during_bursts() {
    let (radio, gateway) = open_gateway(vec![lamp(), tag()]).await;
    let mut events = gateway.subscribe_events();

    gateway.watch([TAG]).await;
    sleep(Duration::from_secs(3)).await;

    let addresses: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            GatewayEvent::BeaconUpdated(entry) => Some(entry.address().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(vec![TAG.to_string()], addresses);
    assert_eq!(1, radio.call_count("stop_scan").await);
}

#[tokio::test(start_paused = true)]
async fn unwatch_empties_the_watch_list() {
    let (_radio, gateway) = open_gateway(vec![lamp()]).await;

    gateway.watch([LAMP, TAG]).await;
    let remaining = gateway.unwatch([LAMP, TAG]).await;

    assert!(remaining.is_empty());
    assert!(gateway.beacons().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn ad_hoc_scan_deduplicates_results() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway(vec![lamp(), tag()]).await;
    let mut events = gateway.subscribe_events();

    let (found, ()) = tokio::join!(
        gateway.start_scan(None, Some(Duration::from_secs(1))),
        async {
            sleep(Duration::from_millis(200)).await;
            radio.emit_scan_result(sighting(LAMP, Some("Lamp"), -80));
        }
    );

    let found = found?;
    let addresses: Vec<&str> = found.iter().map(|device| device.address().as_str()).collect();
    assert_eq!(vec![LAMP, TAG], addresses);
    assert_eq!(Some(-55), found[0].rssi(), "first sighting wins");
    let published = drain(&mut events);
    assert_eq!(Some(&GatewayEvent::ScanEnded), published.last());
    assert_eq!(1, radio.call_count("stop_scan").await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn beacon_filter_drops_plain_advertisers() -> anyhow::Result<()> {
    let (_radio, gateway) = open_gateway(vec![lamp(), tag()]).await;

    let found = gateway
        .start_scan(Some(ScanFilterKind::Beacon), Some(Duration::from_secs(1)))
        .await?;

    assert_eq!(1, found.len());
    assert_eq!(TAG, found[0].address().as_str());
    assert_eq!(Some(BeaconKind::IBeacon), found[0].advertisement().beacon_kind());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn only_one_ad_hoc_scan_runs_at_a_time() {
    let (_radio, gateway) = open_gateway(vec![lamp()]).await;

    let (first, second) = tokio::join!(
        gateway.start_scan(None, Some(Duration::from_secs(1))),
        async {
            sleep(Duration::from_millis(10)).await;
            gateway.start_scan(None, Some(Duration::from_secs(1))).await
        }
    );

    assert_matches!(first, Ok(found) if found.len() == 1);
    assert_matches!(second, Err(GatewayError::ScanInProgress));
}

#[tokio::test(start_paused = true)]
async fn stop_scan_ends_an_ad_hoc_scan_early() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway(vec![lamp()]).await;
    let started = Instant::now();

    let (found, ()) = tokio::join!(
        gateway.start_scan(None, Some(Duration::from_secs(60))),
        async {
            sleep(Duration::from_secs(1)).await;
            gateway.stop_scan().await;
        }
    );

    assert_eq!(1, found?.len());
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(!radio.is_scanning().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_scan_without_a_scan_is_a_no_op() {
    let (radio, gateway) = open_gateway(vec![lamp()]).await;

    gateway.stop_scan().await;

    assert_eq!(0, radio.call_count("stop_scan").await);
}

#[tokio::test(start_paused = true)]
async fn ad_hoc_scan_takes_over_a_watch_burst() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway(vec![lamp()]).await;

    gateway.watch([LAMP]).await;
    sleep(Duration::from_millis(500)).await;
    gateway
        .start_scan(None, Some(Duration::from_secs(1)))
        .await?;
    sleep(Duration::from_secs(2)).await;

    assert_eq!(1, radio.call_count("start_scan").await);
    assert_eq!(1, radio.call_count("stop_scan").await);
    assert!(!gateway.scheduler().is_scanning().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timer_tick_refreshes_rssi_of_connected_devices() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway(vec![lamp()]).await;
    gateway.connect(&Address::from(LAMP)).await?;
    radio.set_rssi(LAMP, -42).await;
    let mut events = gateway.subscribe_events();

    sleep(Duration::from_secs(61)).await;

    assert!(drain(&mut events).contains(&GatewayEvent::DeviceUpdated {
        address: LAMP.to_string(),
        rssi: -42,
    }));
    let record = gateway.connection(LAMP).await.expect("lamp stays connected");
    assert_eq!(Some(-42), record.rssi());
    Ok(())
}
