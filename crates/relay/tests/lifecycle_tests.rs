//! Relay lifecycle integration tests
//!
//! Control bring-up against mock proxies, data bring-up via
//! SET_CONFIGURATION, EP0 control round-trips, graceful stop mid-setup,
//! and the post-teardown invariant.

use common::test_utils::{
    mock_config_descriptor, mock_device_descriptor, mock_setup_packet, set_configuration_packet,
    wait_until, DEFAULT_TEST_TIMEOUT,
};
use relay::mock::{MockDeviceProxy, MockHostProxy};
use relay::{PluginSet, RelayConfig, RelayManager, RelayState};
use std::sync::Arc;
use std::time::Duration;
use usb::Packet;

fn test_config() -> RelayConfig {
    RelayConfig {
        queue_capacity: 32,
        poll_interval_ms: 10,
        spinner: false,
        log_level: "debug".to_string(),
    }
}

fn default_mocks() -> (Arc<MockDeviceProxy>, Arc<MockHostProxy>) {
    (
        Arc::new(MockDeviceProxy::new(
            mock_device_descriptor(),
            vec![mock_config_descriptor()],
        )),
        Arc::new(MockHostProxy::new()),
    )
}

fn manager_with(device: &Arc<MockDeviceProxy>, host: &Arc<MockHostProxy>) -> RelayManager {
    let manager = RelayManager::new(test_config());
    manager.load_plugins(PluginSet::new(device.clone(), host.clone()));
    manager
}

#[test]
fn test_control_passthrough() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);
    assert_eq!(manager.state(), RelayState::Idle);

    manager.start_control_relaying().unwrap();
    assert_eq!(manager.state(), RelayState::Relaying);

    // only EP0 is up until the host selects a configuration
    assert!(manager.endpoint_active(0x00));
    for number in 1..16u8 {
        assert!(!manager.endpoint_active(number));
        assert!(!manager.endpoint_active(0x80 | number));
    }
    assert_eq!(device.connect_count(), 1);
    assert_eq!(host.connect_count(), 1);
    assert_eq!(device.claim_count(0), 1);
    assert_eq!(manager.live_relayer_threads(), 2);

    manager.stop_relaying();
    assert_eq!(manager.state(), RelayState::Idle);
}

#[test]
fn test_connect_retries_until_device_appears() {
    let host = Arc::new(MockHostProxy::new());
    let device = Arc::new(
        MockDeviceProxy::new(mock_device_descriptor(), vec![mock_config_descriptor()])
            .with_connect_timeouts(3),
    );
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    assert_eq!(manager.state(), RelayState::Relaying);
    assert_eq!(device.connect_count(), 4);

    manager.stop_relaying();
}

#[test]
fn test_data_bring_up_on_set_configuration() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);
    manager.start_control_relaying().unwrap();

    host.submit_packet(set_configuration_packet(1));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager
        .endpoint_active(0x81)));
    assert_eq!(manager.state(), RelayState::Relaying);

    // the request itself reached the device side
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !device
        .written(0x00)
        .is_empty()));
    let relayed = device.written(0x00);
    assert!(relayed[0].setup().unwrap().is_set_configuration());

    // EP0 pair plus one reader/writer pair for the bulk-IN endpoint
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager
        .live_relayer_threads()
        == 4));

    // claimed once during control bring-up, re-claimed during data bring-up
    assert!(device.claim_count(0) >= 2);
    assert!(device.endpoint_interfaces().contains(&(0x81, 0)));

    // both proxies were told about the new configuration
    assert_eq!(device.set_configuration_calls(), vec![(1, false, true)]);
    assert_eq!(host.set_configuration_calls(), vec![(1, false, true)]);

    manager.stop_relaying();
    assert_eq!(manager.state(), RelayState::Idle);
}

#[test]
fn test_dual_speed_configuration_pairing() {
    // other-speed configurations share the layout but carry type 0x07
    let mut other_speed = mock_config_descriptor();
    other_speed[1] = 0x07;
    let device = Arc::new(
        MockDeviceProxy::new(mock_device_descriptor(), vec![mock_config_descriptor()])
            .with_qualifier(common::test_utils::mock_device_qualifier(), vec![other_speed]),
    );
    let host = Arc::new(MockHostProxy::new());
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    host.submit_packet(set_configuration_packet(1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager
        .endpoint_active(0x81)));

    // both proxies got the active and the other-speed configuration
    assert_eq!(device.set_configuration_calls(), vec![(1, true, true)]);
    assert_eq!(host.set_configuration_calls(), vec![(1, true, true)]);

    manager.stop_relaying();
}

#[test]
fn test_ep0_control_in_round_trip() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);
    manager.start_control_relaying().unwrap();

    // device answer is ready before the host asks
    device.push_packet(Packet::control(mock_device_descriptor()));
    host.submit_packet(Packet::control(
        mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 18).to_vec(),
    ));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !host
        .written(0x00)
        .is_empty()));
    let responses = host.written(0x00);
    assert_eq!(responses[0].payload, mock_device_descriptor());

    // and the request reached the device unchanged
    let requests = device.written(0x00);
    assert_eq!(
        requests[0].payload,
        mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 18).to_vec()
    );

    manager.stop_relaying();
}

#[test]
fn test_stop_mid_setup_aborts_cleanly() {
    let device = Arc::new(MockDeviceProxy::new(
        mock_device_descriptor(),
        vec![mock_config_descriptor()],
    ));
    let host = Arc::new(MockHostProxy::new().never_connect());
    let manager = manager_with(&device, &host);

    let runner = {
        let manager = manager.clone();
        std::thread::spawn(move || manager.start_control_relaying())
    };

    // setup is stuck in the host connect retry loop
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || host.connect_count() > 0));
    manager.stop_relaying();

    runner.join().unwrap().unwrap();
    assert_eq!(manager.state(), RelayState::Idle);
    assert!(manager.active_endpoints().is_empty());
    assert_eq!(manager.live_relayer_threads(), 0);
    assert_eq!(manager.live_injector_threads(), 0);

    // both proxies disconnected exactly once
    assert_eq!(host.disconnect_count(), 1);
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(device.release_count(0), 1);
}

#[test]
fn test_full_cycle_restores_idle() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    host.submit_packet(set_configuration_packet(1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager
        .endpoint_active(0x81)));

    manager.stop_relaying();
    assert_eq!(manager.state(), RelayState::Idle);
    assert!(manager.active_endpoints().is_empty());
    assert_eq!(manager.live_relayer_threads(), 0);
    assert_eq!(manager.live_injector_threads(), 0);
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(host.disconnect_count(), 1);

    // the same manager can bring everything up again
    manager.start_control_relaying().unwrap();
    assert_eq!(manager.state(), RelayState::Relaying);
    assert!(manager.endpoint_active(0x00));
    manager.stop_relaying();
    assert_eq!(manager.state(), RelayState::Idle);
}

#[test]
fn test_reset_lands_in_reset_and_restarts() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    manager.reset();
    assert_eq!(manager.state(), RelayState::Reset);
    assert!(manager.active_endpoints().is_empty());
    assert_eq!(manager.live_relayer_threads(), 0);
    assert_eq!(device.disconnect_count(), 1);

    // relaying restarts straight from RESET
    manager.start_control_relaying().unwrap();
    assert_eq!(manager.state(), RelayState::Relaying);
    manager.stop_relaying();
}

#[test]
fn test_stop_is_idempotent() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    manager.stop_relaying();
    manager.stop_relaying();
    assert_eq!(manager.state(), RelayState::Idle);
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(host.disconnect_count(), 1);
}

#[test]
fn test_start_twice_is_rejected() {
    let (device, host) = default_mocks();
    let manager = manager_with(&device, &host);

    manager.start_control_relaying().unwrap();
    assert!(manager.start_control_relaying().is_err());
    assert_eq!(manager.state(), RelayState::Relaying);

    manager.stop_relaying();
    // give any stragglers a moment, then confirm nothing is left
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(manager.live_relayer_threads(), 0);
}
