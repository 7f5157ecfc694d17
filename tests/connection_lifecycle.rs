use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use blegate::{
    Address, ConnectOutcome, FakeDevice, FakeRadio, FakeRadioConfig, Gateway, GatewayConfig,
    GatewayError, GatewayEvent, RadioError,
};

const LAMP: &str = "AA:BB:CC:DD:EE:01";

async fn open_gateway() -> (Arc<FakeRadio>, Gateway) {
    let radio = Arc::new(FakeRadio::new(
        FakeRadioConfig::builder()
            .devices(vec![FakeDevice::with_default_gatt(
                LAMP,
                Some("Lamp".to_string()),
                Some(-55),
            )])
            .build(),
    ));
    let gateway = Gateway::new(radio.clone(), GatewayConfig::default());
    gateway.open().await.expect("gateway should open");
    (radio, gateway)
}

async fn next_event<F>(events: &mut broadcast::Receiver<GatewayEvent>, matches: F) -> GatewayEvent
where
    F: Fn(&GatewayEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus should stay open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event should arrive")
}

fn drain(events: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn concurrent_connects_share_one_radio_attempt() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway().await;
    let address = Address::from(LAMP);

    let (first, second) = tokio::join!(gateway.connect(&address), gateway.connect(&address));

    assert_eq!(first?.address(), second?.address());
    assert_eq!(1, radio.call_count("connect").await);
    assert!(gateway.connection(LAMP).await.is_some());
    Ok(())
}

#[tokio::test]
async fn connect_samples_rssi_and_announces_the_link() -> anyhow::Result<()> {
    let (_radio, gateway) = open_gateway().await;
    let mut events = gateway.subscribe_events();

    let record = gateway.connect(&Address::from(LAMP)).await?;

    assert_eq!(Some(-55), record.rssi());
    assert_eq!(Duration::from_secs(20), record.retry_wait());
    let published = drain(&mut events);
    assert!(published.contains(&GatewayEvent::ConnectionUp {
        address: LAMP.to_string()
    }));
    assert!(published.contains(&GatewayEvent::DeviceUpdated {
        address: LAMP.to_string(),
        rssi: -55,
    }));
    Ok(())
}

#[tokio::test]
async fn disconnecting_twice_is_harmless() -> anyhow::Result<()> {
    let (_radio, gateway) = open_gateway().await;
    gateway.connect(&Address::from(LAMP)).await?;
    let mut events = gateway.subscribe_events();

    gateway.disconnect(LAMP).await?;
    gateway.disconnect(LAMP).await?;

    assert!(gateway.connections().await.is_empty());
    assert_eq!(
        GatewayEvent::ConnectionDown {
            address: LAMP.to_string()
        },
        next_event(&mut events, |event| matches!(
            event,
            GatewayEvent::ConnectionDown { .. }
        ))
        .await
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn each_timeout_lengthens_the_next_wait() {
    let (radio, gateway) = open_gateway().await;
    radio
        .script_connect(
            LAMP,
            [ConnectOutcome::Hang, ConnectOutcome::Hang, ConnectOutcome::Hang],
        )
        .await;
    let address = Address::from(LAMP);

    for attempt in 0..3_u64 {
        let error = gateway
            .connect(&address)
            .await
            .expect_err("a hanging connect should time out");
        let expected = Duration::from_secs(20 + 2 * attempt);
        assert_matches!(error, GatewayError::ConnectTimeout { wait, .. } if wait == expected);
        assert!(error.is_device_unreachable());
    }

    assert_eq!(Duration::from_secs(26), gateway.retry_wait(LAMP).await);
    assert!(gateway.connection(LAMP).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_the_wait() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway().await;
    radio.script_connect(LAMP, [ConnectOutcome::Hang]).await;
    let address = Address::from(LAMP);
    let mut events = gateway.subscribe_events();

    let timed_out = gateway.connect(&address).await;
    assert_matches!(timed_out, Err(GatewayError::ConnectTimeout { .. }));
    assert_eq!(
        GatewayEvent::ConnectTimedOut {
            address: LAMP.to_string(),
            wait: Duration::from_secs(20),
        },
        next_event(&mut events, |event| matches!(
            event,
            GatewayEvent::ConnectTimedOut { .. }
        ))
        .await
    );
    assert_eq!(Duration::from_secs(22), gateway.retry_wait(LAMP).await);

    gateway.connect(&address).await?;

    assert_eq!(Duration::from_secs(20), gateway.retry_wait(LAMP).await);
    Ok(())
}

#[tokio::test]
async fn previously_connected_device_is_cleared_and_retried_once() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway().await;
    radio
        .script_connect(
            LAMP,
            [ConnectOutcome::Fail(RadioError::PreviouslyConnected {
                address: LAMP.to_string(),
            })],
        )
        .await;
    let mut events = gateway.subscribe_events();

    gateway.connect(&Address::from(LAMP)).await?;

    assert_eq!(2, radio.call_count("connect").await);
    let published: Vec<GatewayEvent> = drain(&mut events)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                GatewayEvent::ConnectionUp { .. } | GatewayEvent::ConnectionDown { .. }
            )
        })
        .collect();
    assert_eq!(
        vec![
            GatewayEvent::ConnectionDown {
                address: LAMP.to_string()
            },
            GatewayEvent::ConnectionUp {
                address: LAMP.to_string()
            },
        ],
        published
    );
    Ok(())
}

#[tokio::test]
async fn failed_retry_reports_a_zombie_with_the_original_cause() {
    let (radio, gateway) = open_gateway().await;
    radio
        .script_connect(
            LAMP,
            [
                ConnectOutcome::Fail(RadioError::PreviouslyConnected {
                    address: LAMP.to_string(),
                }),
                ConnectOutcome::Fail(RadioError::Failed {
                    message: "gatt 133".to_string(),
                }),
            ],
        )
        .await;

    let error = gateway
        .connect(&Address::from(LAMP))
        .await
        .expect_err("the retry should fail");

    assert_matches!(
        error,
        GatewayError::ZombieConnection {
            source: RadioError::PreviouslyConnected { .. },
            ..
        }
    );
    assert!(gateway.connection(LAMP).await.is_none());
}

#[tokio::test]
async fn stale_link_the_stack_no_longer_reports_is_a_zombie() {
    let (radio, gateway) = open_gateway().await;
    radio
        .script_connect(
            LAMP,
            [ConnectOutcome::Fail(RadioError::NotDisconnected {
                address: LAMP.to_string(),
            })],
        )
        .await;

    let error = gateway
        .connect(&Address::from(LAMP))
        .await
        .expect_err("the stack no longer reports a link");

    assert_matches!(
        error,
        GatewayError::ZombieConnection {
            source: RadioError::NotDisconnected { .. },
            ..
        }
    );
}

#[tokio::test]
async fn unknown_device_surfaces_the_radio_error() {
    let (_radio, gateway) = open_gateway().await;

    let error = gateway
        .connect(&Address::from("00:00:00:00:00:00"))
        .await
        .expect_err("unknown devices cannot connect");

    assert_matches!(
        error,
        GatewayError::Radio(RadioError::UnknownDevice { .. })
    );
    assert!(!error.is_adapter_unavailable());
}

#[tokio::test]
async fn link_loss_forgets_the_connection() -> anyhow::Result<()> {
    let (radio, gateway) = open_gateway().await;
    gateway.connect(&Address::from(LAMP)).await?;
    let mut events = gateway.subscribe_events();

    radio.drop_link(LAMP).await;

    next_event(&mut events, |event| {
        matches!(event, GatewayEvent::ConnectionDown { .. })
    })
    .await;
    assert!(gateway.connection(LAMP).await.is_none());
    Ok(())
}

#[tokio::test]
async fn connecting_flag_is_cleared_after_the_attempt() -> anyhow::Result<()> {
    let (_radio, gateway) = open_gateway().await;

    gateway.connect(&Address::from(LAMP)).await?;

    assert!(!gateway.state().connecting);
    Ok(())
}
