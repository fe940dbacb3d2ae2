mod common;
use common::*;

#[tokio::test]
async fn only_the_responding_id_reports_true() {
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new().respond_to_ids(vec![3]),
    )
    .await;

    let mut scan = coordinator.device_scan(0, 5).unwrap();

    let mut probes = Vec::new();
    while let Some(probe) = scan.next().await {
        probes.push(probe);
    }

    assert_eq!(probes.len(), 6);
    for probe in &probes {
        assert_eq!(probe.responded, probe.id == 3, "id {}", probe.id);
    }
}

#[tokio::test]
async fn scanning_does_not_mutate_the_configured_id() {
    let config = test_config();
    let (coordinator, _channels, _mock) = connected_coordinator(
        config.clone(),
        MockInverter::new().respond_to_ids(vec![3]),
    )
    .await;

    let mut scan = coordinator.device_scan(2, 4).unwrap();
    while scan.next().await.is_some() {}

    // adopting a confirmed id is the caller's decision, not the sweep's
    assert_eq!(config.device_id(), 1);
}

#[tokio::test]
async fn id_bounds_are_enforced() {
    let (coordinator, _channels, _mock) =
        connected_coordinator(test_config(), MockInverter::new()).await;

    assert!(coordinator.device_scan(5, 4).is_err());
    assert!(coordinator.device_scan(0, 255).is_ok());
    assert!(coordinator.device_scan(7, 7).is_ok());
}

#[tokio::test]
async fn full_range_endpoints_are_probed() {
    let (coordinator, _channels, _mock) = connected_coordinator(
        test_config(),
        MockInverter::new().respond_to_ids(vec![0, 255]),
    )
    .await;

    let mut scan = coordinator.device_scan(254, 255).unwrap();

    let first = scan.next().await.unwrap();
    assert_eq!((first.id, first.responded), (254, false));

    let second = scan.next().await.unwrap();
    assert_eq!((second.id, second.responded), (255, true));

    assert!(scan.next().await.is_none());
}
