mod common;
use common::*;

use isolar_bridge::channels::Channels;
use isolar_bridge::coordinator::Coordinator;
use isolar_bridge::error::PollError;
use isolar_bridge::register::{OperatingMode, SensorValue};
use isolar_bridge::sensor::{BatteryData, SensorGroup, SystemStatus};

use std::sync::Arc;
use std::time::Duration;

/// Register image used across the poll tests.
fn plausible_inverter(register: u16) -> u16 {
    match register {
        277 => 485, // battery voltage, 48.5 V
        278 => 25,  // battery current, 2.5 A
        279 => 120, // battery power, W
        280 => 78,  // soc %
        281 => 31,  // temperature C
        338 => 2304,
        340 => 410,
        600 => 1,
        607 => 5002,
        r => r,
    }
}

#[tokio::test]
async fn poll_battery_decodes_a_full_group() {
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new().with_values(plausible_inverter),
    )
    .await;

    let values = coordinator.poll(SensorGroup::Battery).await.unwrap();

    assert_eq!(values["battery_voltage"], SensorValue::Float(48.5));
    assert_eq!(values["battery_current"], SensorValue::Float(2.5));
    assert_eq!(values["battery_power"], SensorValue::Integer(120));
    assert_eq!(values["battery_soc"], SensorValue::Integer(78));
    assert_eq!(values["battery_temperature"], SensorValue::Integer(31));

    let battery = BatteryData::from_values(&values).unwrap();
    assert_eq!(battery.voltage, 48.5);
    assert_eq!(battery.soc, 78);
}

#[tokio::test]
async fn poll_without_session_fails_fast() {
    let channels = Channels::new();
    let coordinator = Arc::new(Coordinator::new(test_config(), channels).unwrap());

    let started = std::time::Instant::now();
    let result = coordinator.poll(SensorGroup::Battery).await;

    assert!(matches!(result, Err(PollError::NotConnected)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn poll_returns_partial_results_when_a_block_fails() {
    // grid group reads two blocks: 338..340 answers, 607 stays silent
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new()
            .with_values(plausible_inverter)
            .silent_range(600, 65535),
    )
    .await;

    match coordinator.poll(SensorGroup::Grid).await {
        Err(PollError::Partial { partial, failed }) => {
            assert_eq!(partial["grid_voltage"], SensorValue::Float(230.4));
            assert_eq!(partial["grid_power"], SensorValue::Integer(410));
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].name, "grid_frequency");
        }
        other => panic!("expected partial poll, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_operating_mode_degrades_gracefully() {
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new().with_values(|r| match r {
            600 => 42, // firmware newer than our table
            r => r,
        }),
    )
    .await;

    let values = coordinator.poll(SensorGroup::System).await.unwrap();
    assert_eq!(
        values["operating_mode"],
        SensorValue::Mode(OperatingMode::Unknown(42))
    );

    let system = SystemStatus::from_values(&values).unwrap();
    assert_eq!(system.mode_name, "Unknown (42)");
}

#[tokio::test]
async fn single_string_model_polls_without_pv2() {
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config_for_model("smg-ii-6k"),
        MockInverter::new().with_values(plausible_inverter),
    )
    .await;

    let values = coordinator.poll(SensorGroup::Pv).await.unwrap();

    assert!(values.contains_key("pv1_voltage"));
    assert!(!values.contains_key("pv2_voltage"));
    assert!(!values.contains_key("pv2_power"));
}

#[tokio::test]
async fn mismatched_device_id_is_adopted_for_the_next_cycle() {
    let config = test_config();
    let (coordinator, _channels, _mock) = connected_coordinator(
        config.clone(),
        MockInverter::new().reply_device_id(7),
    )
    .await;

    let result = coordinator.poll(SensorGroup::Battery).await;
    assert!(result.is_err());

    // the device said who it is; the next cycle will address it directly
    assert_eq!(config.device_id(), 7);
}

#[tokio::test]
async fn strict_check_never_adopts_a_device_id() {
    let config: isolar_bridge::config::Config = serde_yaml::from_str(
        r#"
inverter:
  device_id: 1
  strict_device_check: true
  read_timeout: 1
"#,
    )
    .unwrap();
    let config = isolar_bridge::config::ConfigWrapper::from_config(config);

    let (coordinator, _channels, _mock) =
        connected_coordinator(config.clone(), MockInverter::new().reply_device_id(7)).await;

    let result = coordinator.poll(SensorGroup::Battery).await;
    assert!(result.is_err());
    assert_eq!(config.device_id(), 1);
}

#[tokio::test]
async fn poll_all_publishes_a_snapshot() {
    let (coordinator, channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new().with_values(plausible_inverter),
    )
    .await;

    let mut reporting_rx = channels.to_reporting.subscribe();

    let snapshot = coordinator.poll_all().await.unwrap();
    assert!(snapshot.battery.is_some());
    assert!(snapshot.grid.is_some());
    assert_eq!(
        snapshot.system.as_ref().unwrap().operating_mode,
        OperatingMode::Grid
    );

    // the reporting boundary saw the same snapshot
    match reporting_rx.recv().await.unwrap() {
        isolar_bridge::channels::ChannelData::Snapshot(published) => {
            assert_eq!(published.values.len(), snapshot.values.len());
        }
        other => panic!("expected snapshot on reporting channel, got {:?}", other),
    }
}
