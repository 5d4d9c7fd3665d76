//! Replay protection and session-control edge cases.

mod common;

use common::{Rig, DEVICE_ADDR};
use tactum::crypto::{self, Iv};
use tactum::protocol;
use tactum::types::ErrorCode;

#[test]
fn test_replayed_frame_yields_frame_missed() {
    let mut rig = Rig::new(true);
    let frame =
        protocol::build_request(DEVICE_ADDR, 0x00, &[], Some((&rig.key, &rig.session_iv, 1)))
            .unwrap();

    rig.send_raw(&frame);
    rig.polls(6);
    let (code, _) = rig.take_response().unwrap();
    assert_eq!(code, ErrorCode::None);

    // same bytes again: the counter did not advance
    rig.send_raw(&frame);
    rig.polls(6);
    let (code, _) = rig.take_response().unwrap();
    assert_eq!(code, ErrorCode::FrameMissed);
}

#[test]
fn test_out_of_order_counter_rejected() {
    let mut rig = Rig::new(true);
    let (status, ..) = rig.sync(); // counter 1 accepted
    assert_eq!(status, 0x100C);

    // skipping ahead is a missed frame
    let frame =
        protocol::build_request(DEVICE_ADDR, 0x00, &[], Some((&rig.key, &rig.session_iv, 5)))
            .unwrap();
    rig.send_raw(&frame);
    rig.polls(6);
    let (code, _) = rig.take_response().unwrap();
    assert_eq!(code, ErrorCode::FrameMissed);

    // and the counter state is unchanged: 2 is still next
    rig.sync();
}

#[test]
fn test_open_port_resets_the_counter() {
    let mut rig = Rig::new(true);
    rig.sync();
    rig.sync();
    rig.sync(); // counter now 3

    // session control restarts the discipline at 1
    assert_eq!(rig.exchange(0x2E, &[0u8; 16]).0, ErrorCode::None);
    assert_eq!(rig.device.engine().session().counter(), 1);

    // next regular frame must carry 2; the rig tracks this automatically
    rig.sync();
    assert_eq!(rig.counter, 2);

    // a frame with the stale pre-reset counter is rejected
    let frame =
        protocol::build_request(DEVICE_ADDR, 0x00, &[], Some((&rig.key, &rig.session_iv, 4)))
            .unwrap();
    rig.send_raw(&frame);
    rig.polls(6);
    let (code, _) = rig.take_response().unwrap();
    assert_eq!(code, ErrorCode::FrameMissed);
}

#[test]
fn test_session_commands_use_the_factory_iv() {
    let mut rig = Rig::new(true);

    // encrypting open-port with the session IV would garble the plaintext;
    // the factory IV is required even though they are equal on first boot
    assert_eq!(rig.session_iv, Iv::FACTORY);
    assert_eq!(rig.exchange(0x2E, &[0u8; 16]).0, ErrorCode::None);
}

#[test]
fn test_set_iv_takes_effect_next_session() {
    let new_iv = Iv::new([7u8; 16]);
    let memory = {
        let mut rig = Rig::new(true);
        assert_eq!(rig.exchange(0x2D, new_iv.as_bytes()).0, ErrorCode::None);

        // the running session still decrypts with the boot IV
        rig.sync();
        rig.memory.clone()
    };

    // after a reboot the stored IV is live
    let mut rig = Rig::with_memory(true, memory);
    assert_eq!(rig.session_iv, new_iv);
    rig.sync();
}

#[test]
fn test_encrypted_payload_without_counter_is_frame_missed() {
    let mut rig = Rig::new(true);

    // a one-byte ciphertext cannot carry the 16-bit counter
    let body = crypto::encrypt(&rig.key, &rig.session_iv, &[0x01]).unwrap();
    let mut frame = Vec::new();
    frame.push(DEVICE_ADDR);
    frame.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    frame.push(0x00);
    frame.extend_from_slice(&body);
    let crc = protocol::checksum(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.push(0xF1);

    rig.send_raw(&frame);
    rig.polls(6);
    let (code, _) = rig.take_response().unwrap();
    assert_eq!(code, ErrorCode::FrameMissed);
}

#[test]
fn test_plaintext_mode_skips_counter_discipline() {
    let mut rig = Rig::new(false);
    let frame = protocol::build_request(DEVICE_ADDR, 0x00, &[], None).unwrap();

    // the identical frame is accepted twice without encryption
    for _ in 0..2 {
        rig.send_raw(&frame);
        rig.polls(6);
        let (code, _) = rig.take_response().unwrap();
        assert_eq!(code, ErrorCode::None);
    }
}

#[test]
fn test_open_port_length_depends_on_encryption() {
    let mut rig = Rig::new(true);
    // 0 bytes is wrong while encrypted
    assert_eq!(rig.exchange(0x2E, &[]).0, ErrorCode::Semantic);

    let mut rig = Rig::new(false);
    // 16 bytes is wrong in plaintext mode
    assert_eq!(rig.exchange(0x2E, &[0u8; 16]).0, ErrorCode::Semantic);
    assert_eq!(rig.exchange(0x2E, &[]).0, ErrorCode::None);
}
