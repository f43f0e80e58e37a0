//! ServoClient against the simulated board

mod common;

use common::*;
use rustpill_lib::calibration::PwmTiming;

fn servo() -> (ServoClient<SimulatedBoard>, SimulatedBoard) {
    let (link, board) = board_link();
    (ServoClient::new(link).expect("Failed to create servo client"), board)
}

#[test]
fn test_configure_then_move_to_endpoints() {
    let (mut servo, board) = servo();
    let min = servo.us_to_duty_cycle(500);
    let max = servo.us_to_duty_cycle(2500);
    servo.configure_channel(2, min, max).unwrap();

    assert_eq!(servo.set_angle(2, 0).unwrap(), 1638);
    assert_eq!(servo.get_angle(2).unwrap(), 0);

    assert_eq!(servo.set_angle(2, 180).unwrap(), 8192);
    assert_eq!(servo.get_angle(2).unwrap(), 180);

    let channel = board.state().channels[1];
    assert_eq!(channel.current_duty_cycle, 8192);
    assert!(channel.enabled);
}

#[test]
fn test_every_angle_reads_back() {
    let (mut servo, _board) = servo();
    servo.configure_channel(1, 1000, 5000).unwrap();

    for angle in (0..=180u8).step_by(15) {
        servo.set_angle(1, angle).unwrap();
        let read = servo.get_angle(1).unwrap();
        assert!(read.abs_diff(angle) <= 1, "set {}°, read {}°", angle, read);
    }
}

#[test]
fn test_unconfigured_channel_fails_before_io() {
    let (mut servo, board) = servo();

    assert!(matches!(servo.set_angle(3, 90), Err(ClientError::UnconfiguredChannel(3))));
    assert!(matches!(servo.get_angle(3), Err(ClientError::UnconfiguredChannel(3))));
    assert!(board.requests().is_empty());
}

#[test]
fn test_out_of_range_arguments() {
    let (mut servo, board) = servo();
    servo.configure_channel(1, 1638, 8192).unwrap();

    assert!(matches!(servo.set_angle(1, 181), Err(ClientError::InvalidArgument(_))));
    assert!(matches!(servo.set_angle(0, 10), Err(ClientError::InvalidArgument(_))));
    assert!(matches!(servo.set_angle(5, 10), Err(ClientError::InvalidArgument(_))));
    assert!(matches!(
        servo.configure_channel(1, 8192, 1638),
        Err(ClientError::InvalidArgument(_))
    ));
    assert_eq!(board.requests().len(), 1, "Only the first configure reached the board");
}

#[test]
fn test_get_config_replaces_cache() {
    let (link, board) = board_link();
    {
        let mut state = board.state();
        state.channels[2].min_duty_cycle = 2000;
        state.channels[2].max_duty_cycle = 7000;
        state.channels[2].current_duty_cycle = 4500;
        state.channels[2].enabled = true;
    }

    let mut servo = ServoClient::connect(link).unwrap();
    let config = servo.config().expect("connect fetches the config").clone();
    assert_eq!(config.frequency_hz, 50);
    assert_eq!(config.channels.len(), 4);
    assert_eq!(config.channel(3).unwrap().current_duty_cycle, 4500);

    assert!(servo.calibration().get(3).is_ok());
    assert_eq!(servo.default_channel(), Some(3));
    assert_eq!(servo.get_angle(3).unwrap(), 90);
}

#[test]
fn test_config_serialises_to_json() {
    let (mut servo, _board) = servo();
    servo.configure_channel(1, 1638, 8192).unwrap();
    let config = servo.get_config().unwrap();

    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["frequency_hz"], 50);
    assert_eq!(json["channels"][0]["min_duty_cycle"], 1638);
    assert_eq!(json["channels"][0]["enabled"], false);
}

#[test]
fn test_rejected_configure_leaves_cache_untouched() {
    // The client believes in five channels, the board only has four
    let (link, _board) = board_link_with(test_config().with_channel_count(5));
    let mut servo = ServoClient::new(link).unwrap();

    match servo.configure_channel(5, 1000, 2000) {
        Err(ClientError::DeviceRejected {
            reason: RejectReason::InvalidChannel,
            ..
        }) => {}
        other => panic!("Expected DeviceRejected, got {:?}", other),
    }
    assert!(matches!(servo.calibration().get(5), Err(ClientError::UnconfiguredChannel(5))));
}

#[test]
fn test_reconnect_invalidates_calibration() {
    let (mut servo, _board) = servo();
    servo.configure_channel(2, 1638, 8192).unwrap();
    servo.set_angle(2, 45).unwrap();

    servo.link().reconnect().unwrap();
    assert!(matches!(servo.set_angle(2, 90), Err(ClientError::UnconfiguredChannel(2))));
    assert!(servo.config().is_none());

    // the board kept its calibration, so a fresh fetch restores the cache
    servo.get_config().unwrap();
    assert_eq!(servo.get_angle(2).unwrap(), 45);
    servo.set_angle(2, 90).unwrap();
}

#[test]
fn test_read_fault_invalidates_calibration() {
    let (mut servo, board) = servo();
    servo.configure_channel(1, 1638, 8192).unwrap();

    // the first attempt is lost with the connection, the retry lands in the new epoch
    board.fail_reads(1);
    assert!(matches!(servo.get_angle(1), Err(ClientError::UnconfiguredChannel(1))));
    assert_eq!(board.reconnects(), 1);
    assert_eq!(board.count_requests(Opcode::GetAngle), 2);
    assert!(servo.calibration().is_empty());

    servo.get_config().unwrap();
    assert_eq!(servo.get_angle(1).unwrap(), 0);
}

#[test]
fn test_set_frequency_refetches_config() {
    let (mut servo, board) = servo();
    servo.configure_channel(1, 1638, 8192).unwrap();
    servo.set_angle(1, 90).unwrap();

    let config = servo.set_frequency(100).unwrap();
    assert_eq!(config.frequency_hz, 100);
    assert!(config.channels.iter().all(|c| !c.enabled));
    assert_eq!(board.state().frequency_hz, 100);

    // conversions now use the new period
    assert_eq!(servo.us_to_duty_cycle(500), 3277);
    assert_eq!(board.count_requests(Opcode::GetConfig), 1);
}

#[test]
fn test_default_channel_requires_exactly_one() {
    let (mut servo, _board) = servo();
    assert_eq!(servo.default_channel(), None);
    assert!(matches!(servo.set_angle_default(10), Err(ClientError::InvalidArgument(_))));

    servo.configure_channel(4, 1638, 8192).unwrap();
    assert_eq!(servo.default_channel(), Some(4));
    servo.set_angle_default(120).unwrap();
    assert_eq!(servo.get_angle_default().unwrap(), 120);

    servo.configure_channel(1, 1638, 8192).unwrap();
    assert_eq!(servo.default_channel(), None);
    assert!(matches!(servo.get_angle_default(), Err(ClientError::InvalidArgument(_))));
}

#[test]
fn test_identity_and_liveness() {
    let (servo, _board) = servo();
    assert_eq!(servo.ping(2137).unwrap(), 2137);
    assert_eq!(servo.get_serial_number().unwrap(), hex::encode_upper(BOARD_ID));
    assert_eq!(servo.get_id().unwrap().as_bytes(), &BOARD_ID);
}

#[test]
fn test_opt_in_retry_for_set_angle() {
    let (mut servo, board) = servo();
    servo.configure_channel(1, 1638, 8192).unwrap();

    board.inject(Fault::Swallow);
    assert!(matches!(servo.set_angle(1, 30), Err(ClientError::Timeout { .. })));

    servo.set_retry_policy(RetryPolicy::IdempotentOptIn);
    board.inject(Fault::Swallow);
    servo.set_angle(1, 30).unwrap();
    assert_eq!(board.count_requests(Opcode::SetAngle), 3);
}

#[test]
fn test_frequency_change_keeps_configured_resolution() {
    let pwm = PwmTiming {
        frequency_hz: 50,
        resolution_bits: 12,
    };
    let (link, _board) = board_link_with(test_config().with_pwm(pwm));
    let mut servo = ServoClient::connect(link).expect("Failed to connect servo client");
    assert_eq!(servo.us_to_duty_cycle(1000), 205);

    servo.set_frequency(100).expect("Failed to set frequency");
    assert_eq!(servo.calibration().timing().resolution_bits, 12);
    assert_eq!(servo.us_to_duty_cycle(500), 205);
}
