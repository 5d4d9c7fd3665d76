//! End-to-end tests: host requests against a booted device over the
//! in-memory serial line, encryption on.

mod common;

use common::Rig;
use tactum::types::{ErrorCode, RunState};

#[test]
fn test_sync_reports_device_state() {
    let mut rig = Rig::new(true);
    let (status, state, temp, repeat_idx, step_idx, step_count) = rig.sync();

    // boot as power-on: reported once, then cleared
    assert_eq!(status, 0x100C);
    assert_eq!(state, RunState::Stopped as u8);
    assert_eq!(temp, 250);
    assert_eq!(repeat_idx, 0);
    assert_eq!(step_idx, 0);
    assert_eq!(step_count, 0);

    let (status, ..) = rig.sync();
    assert_eq!(status, 0xFFFF);
}

#[test]
fn test_firmware_version_string() {
    let mut rig = Rig::new(true);
    let (code, body) = rig.exchange(0x12, &[]);
    assert_eq!(code, ErrorCode::None);
    let text = String::from_utf8(body).unwrap();
    let (triplet, build) = text.split_once('-').expect("major.minor.patch-build");
    assert_eq!(triplet.split('.').count(), 3);
    assert_eq!(build.len(), 3);
}

#[test]
fn test_identity_set_get_roundtrip() {
    let mut rig = Rig::new(true);

    assert_eq!(rig.exchange(0x11, b"SWC1-REV-C").0, ErrorCode::None);
    assert_eq!(rig.exchange(0x14, b"SN-20260807-001").0, ErrorCode::None);

    let (code, body) = rig.exchange(0x10, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, b"SWC1-REV-C");

    let (code, body) = rig.exchange(0x13, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, b"SN-20260807-001");
}

#[test]
fn test_identity_persists_across_reboot() {
    let memory = {
        let mut rig = Rig::new(true);
        assert_eq!(rig.exchange(0x14, b"SN-PERSIST").0, ErrorCode::None);
        rig.memory.clone()
    };

    let mut rig = Rig::with_memory(true, memory);
    let (code, body) = rig.exchange(0x13, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, b"SN-PERSIST");
}

#[test]
fn test_temp_threshold_persists_and_applies() {
    let mut rig = Rig::new(true);
    assert_eq!(rig.exchange(0x22, &600i16.to_be_bytes()).0, ErrorCode::None);

    // applied live
    let (code, body) = rig.exchange(0x21, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(i16::from_be_bytes([body[0], body[1]]), 600);

    // and persisted
    let mut rig = Rig::with_memory(true, rig.memory.clone());
    let (_, body) = rig.exchange(0x21, &[]);
    assert_eq!(i16::from_be_bytes([body[0], body[1]]), 600);
}

#[test]
fn test_get_temperature() {
    let mut rig = Rig::new(true);
    rig.temp.set_temp(312);
    let (code, body) = rig.exchange(0x20, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(i16::from_be_bytes([body[0], body[1]]), 312);
}

#[test]
fn test_sequence_upload_and_playback() {
    let mut rig = Rig::new(true);
    rig.start_sequence(&[(0b0000_0001, 50), (0b0000_0010, 30)], 2);

    // channel 0 drives for the first 50 ms window
    rig.clock.advance(10);
    rig.polls(1);
    assert!(rig.pins.channel(0));
    assert!(!rig.pins.channel(1));

    // channel 1 for the next 30 ms
    rig.clock.advance(50);
    rig.polls(1);
    assert!(!rig.pins.channel(0));
    assert!(rig.pins.channel(1));

    // second repeat
    rig.clock.advance(30);
    rig.polls(1);
    assert!(rig.pins.channel(0));

    rig.clock.advance(50);
    rig.polls(1);
    assert!(rig.pins.channel(1));

    // repeats exhausted: back to stop, outputs idle
    rig.clock.advance(30);
    rig.polls(2);
    let (_, state, _, _, _, step_count) = rig.sync();
    assert_eq!(state, RunState::Stopped as u8);
    assert_eq!(rig.pins.channel_bits(), 0);
    // the table survives the stop
    assert_eq!(step_count, 2);
}

#[test]
fn test_steps_read_back() {
    let mut rig = Rig::new(true);
    let payload = [0x03, 0x00, 0x32, 0x01, 0x00, 0x1E];
    assert_eq!(rig.exchange(0x68, &payload).0, ErrorCode::None);

    let mut query = Vec::new();
    query.extend_from_slice(&0u16.to_be_bytes());
    query.extend_from_slice(&2u16.to_be_bytes());
    let (code, body) = rig.exchange(0x67, &query);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, payload);
}

#[test]
fn test_pause_and_resume_over_the_wire() {
    let mut rig = Rig::new(true);
    rig.start_sequence(&[(0b0000_0001, 0xFFFF)], 1);
    assert!(rig.pins.channel(0));

    assert_eq!(rig.exchange(0x60, &[2]).0, ErrorCode::None);
    assert_eq!(rig.pins.channel_bits(), 0);

    assert_eq!(rig.exchange(0x60, &[1]).0, ErrorCode::None);
    assert!(rig.pins.channel(0));
}

#[test]
fn test_trigger_and_led_configuration() {
    let mut rig = Rig::new(true);

    assert_eq!(rig.exchange(0x62, &[0x00, 0x00, 0x64]).0, ErrorCode::None);
    let (code, body) = rig.exchange(0x61, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, vec![0x00, 0x00, 0x64]);

    assert_eq!(
        rig.exchange(0x6E, &[0x00, 0xC8, 0x00, 0x32]).0,
        ErrorCode::None
    );
    let (_, body) = rig.exchange(0x6D, &[]);
    assert_eq!(body, vec![0x00, 0xC8, 0x00, 0x32]);
}

#[test]
fn test_max_channels_configuration() {
    let mut rig = Rig::new(true);
    assert_eq!(rig.exchange(0x64, &[5]).0, ErrorCode::None);
    let (_, body) = rig.exchange(0x63, &[]);
    assert_eq!(body, vec![5]);

    // out of range: persisted rejection comes back as the sequencer code
    assert_eq!(rig.exchange(0x64, &[8]).0, ErrorCode::Sequencer);
    assert_eq!(rig.exchange(0x64, &[0]).0, ErrorCode::Sequencer);
}

#[test]
fn test_dc_supply_configuration() {
    let mut rig = Rig::new(true);
    let mut payload = Vec::new();
    payload.extend_from_slice(&4200u16.to_be_bytes());
    payload.extend_from_slice(&750u16.to_be_bytes());
    assert_eq!(rig.exchange(0x6A, &payload).0, ErrorCode::None);
    assert_eq!(rig.regulator.programmed(), (4200, 750));

    let (code, body) = rig.exchange(0x69, &[]);
    assert_eq!(code, ErrorCode::None);
    assert_eq!(body, payload);
}

#[test]
fn test_over_current_query() {
    let mut rig = Rig::new(true);
    let (_, body) = rig.exchange(0x6F, &[]);
    assert_eq!(body, vec![0]);

    rig.regulator.trip_over_current();
    rig.polls(1);
    let (_, body) = rig.exchange(0x6F, &[]);
    assert_eq!(body, vec![1]);
}

#[test]
fn test_restart_acknowledges_then_resets() {
    let mut rig = Rig::new(true);
    let (code, _) = rig.exchange(0x02, &[]);
    assert_eq!(code, ErrorCode::None);
    assert!(!rig.board.reset_requested());

    // the reset fires from idle, after the acknowledgment went out
    let outcome = rig.polls(2);
    assert_eq!(outcome, tactum::device::PollOutcome::RestartRequested);
    assert!(rig.board.reset_requested());
}

#[test]
fn test_open_close_port() {
    let mut rig = Rig::new(true);
    assert!(!rig.device.engine().is_open());

    assert_eq!(rig.exchange(0x2E, &[0u8; 16]).0, ErrorCode::None);
    assert!(rig.device.engine().is_open());

    assert_eq!(rig.exchange(0x2F, &[]).0, ErrorCode::None);
    assert!(!rig.device.engine().is_open());
}
