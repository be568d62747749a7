// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the encoder lifecycle and the encode thread

mod common;

use common::{EngineOptions, PacketLog, fake_encoder, i420_frame, wait_until};
use rawenc::backends::camera::{FrameGeometry, PixelLayout};
use rawenc::config::EncoderConfig;
use rawenc::errors::EncodeError;
use rawenc::media::encoders::EncoderState;
use std::time::{Duration, Instant};

fn small_config() -> EncoderConfig {
    EncoderConfig::default().with_geometry(64, 48)
}

#[test]
fn test_state_machine() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    assert_eq!(encoder.state(), EncoderState::Closed);

    encoder.configure(&small_config()).unwrap();
    assert_eq!(encoder.state(), EncoderState::Configured);

    encoder.start().unwrap();
    assert_eq!(encoder.state(), EncoderState::Running);

    encoder.stop();
    assert_eq!(encoder.state(), EncoderState::Stopped);

    encoder.close();
    assert_eq!(encoder.state(), EncoderState::Closed);
}

#[test]
fn test_frames_submitted_in_fifo_order() {
    let (mut encoder, probe) = fake_encoder(EngineOptions::default());
    let packets = PacketLog::default();
    encoder.set_packet_handler(packets.handler()).unwrap();
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    let frame = i420_frame(64, 48);
    for sequence in 0..50 {
        encoder.encode(sequence, &frame).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || packets.len() == 50));
    assert_eq!(probe.submitted(), (0..50).collect::<Vec<i64>>());
    assert_eq!(packets.timestamps(), (0..50).collect::<Vec<i64>>());
    encoder.close();
}

#[test]
fn test_drain_absorbs_encoder_delay() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions {
        delay: 3,
        ..EngineOptions::default()
    });
    let packets = PacketLog::default();
    encoder.set_packet_handler(packets.handler()).unwrap();
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    let frame = i420_frame(64, 48);
    for sequence in 0..10 {
        encoder.encode(sequence, &frame).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || packets.len() == 7));
    assert_eq!(encoder.stats().frames_encoded, 10);

    // The three held frames only come out on finalize
    assert_eq!(encoder.finalize(), 3);
    assert_eq!(packets.timestamps(), (0..10).collect::<Vec<i64>>());
}

#[test]
fn test_second_finalize_yields_nothing() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions {
        delay: 2,
        ..EngineOptions::default()
    });
    let packets = PacketLog::default();
    encoder.set_packet_handler(packets.handler()).unwrap();
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    let frame = i420_frame(64, 48);
    for sequence in 0..4 {
        encoder.encode(sequence, &frame).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || encoder.stats().frames_encoded == 4));

    encoder.stop();
    assert_eq!(encoder.finalize(), 2);
    assert_eq!(encoder.finalize(), 0);
    assert_eq!(packets.len(), 4);
    assert_eq!(encoder.stats().submit_errors, 0);
}

#[test]
fn test_finalize_without_frames() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    let packets = PacketLog::default();
    encoder.set_packet_handler(packets.handler()).unwrap();
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();
    encoder.stop();

    assert_eq!(encoder.finalize(), 0);
    assert_eq!(packets.len(), 0);
}

#[test]
fn test_finalize_joins_running_worker() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions {
        delay: 1,
        ..EngineOptions::default()
    });
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    let frame = i420_frame(64, 48);
    encoder.encode(0, &frame).unwrap();
    assert!(wait_until(Duration::from_secs(2), || encoder.stats().frames_encoded == 1));

    assert_eq!(encoder.finalize(), 1);
    assert_eq!(encoder.state(), EncoderState::Stopped);
}

#[test]
fn test_stop_with_backlog_discards_queued_frames() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions {
        work: Duration::from_millis(5),
        ..EngineOptions::default()
    });
    let packets = PacketLog::default();
    encoder.set_packet_handler(packets.handler()).unwrap();
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    let frame = i420_frame(64, 48);
    for sequence in 0..100 {
        encoder.encode(sequence, &frame).unwrap();
    }

    let started = Instant::now();
    encoder.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    let stats = encoder.stats();
    assert_eq!(stats.frames_queued, 100);
    assert_eq!(stats.frames_encoded + stats.frames_discarded, 100);
    assert!(stats.frames_discarded > 0);
    // Every frame taken off the queue before the stop produced its packet
    assert_eq!(packets.len() as u64, stats.frames_encoded);
    assert_eq!(encoder.queued(), 0);
}

#[test]
fn test_unknown_codec_leaves_nothing_allocated() {
    let (mut encoder, probe) = fake_encoder(EngineOptions::default());
    let bad = EncoderConfig {
        codec: "does-not-exist".into(),
        ..small_config()
    };

    for _ in 0..100 {
        assert!(matches!(
            encoder.configure(&bad),
            Err(EncodeError::CodecNotFound(_))
        ));
        assert_eq!(encoder.state(), EncoderState::Closed);
        encoder.stop();
    }
    assert_eq!(probe.opened(), 0);
    assert_eq!(probe.live(), 0);

    // Repeated good cycles release each engine
    for _ in 0..20 {
        encoder.configure(&small_config()).unwrap();
        encoder.start().unwrap();
        encoder.stop();
        encoder.finalize();
        encoder.close();
        assert_eq!(probe.live(), 0);
    }
    assert_eq!(probe.opened(), 20);
}

#[test]
fn test_stop_without_start_is_safe() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    encoder.stop();
    encoder.stop();
    assert_eq!(encoder.state(), EncoderState::Closed);
    assert_eq!(encoder.finalize(), 0);

    encoder.configure(&small_config()).unwrap();
    encoder.stop();
    encoder.stop();
    assert_eq!(encoder.state(), EncoderState::Stopped);
}

#[test]
fn test_invalid_config_rejected() {
    let (mut encoder, probe) = fake_encoder(EngineOptions::default());
    let odd = EncoderConfig::default().with_geometry(63, 48);

    assert!(matches!(encoder.configure(&odd), Err(EncodeError::Config(_))));
    assert_eq!(probe.opened(), 0);
}

#[test]
fn test_configure_twice_rejected() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    encoder.configure(&small_config()).unwrap();
    assert!(matches!(
        encoder.configure(&small_config()),
        Err(EncodeError::AlreadyConfigured)
    ));
}

#[test]
fn test_short_frame_is_dropped() {
    let (mut encoder, probe) = fake_encoder(EngineOptions::default());
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();

    assert!(matches!(
        encoder.encode(0, &[0u8; 16]),
        Err(EncodeError::FrameTooShort { .. })
    ));
    encoder.encode(1, &i420_frame(64, 48)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || probe.submitted() == vec![1]));

    let stats = encoder.stats();
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_queued, 1);
    encoder.close();
}

#[test]
fn test_submitter_converts_packed_source() {
    let (mut encoder, probe) = fake_encoder(EngineOptions::default());
    encoder.configure(&small_config()).unwrap();
    let submitter = encoder
        .submitter(FrameGeometry::packed(64, 48, PixelLayout::Yuyv))
        .unwrap();
    encoder.start().unwrap();

    assert!(submitter.submit(5, &vec![0x80; 64 * 2 * 48]));
    assert!(wait_until(Duration::from_secs(2), || probe.submitted() == vec![5]));
    encoder.close();

    // Stopped encoders refuse new frames
    assert!(!submitter.submit(6, &vec![0x80; 64 * 2 * 48]));
}

#[test]
fn test_submitter_requires_matching_size() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    assert!(matches!(
        encoder.submitter(FrameGeometry::packed(64, 48, PixelLayout::Yuv420)),
        Err(EncodeError::NotConfigured)
    ));

    encoder.configure(&small_config()).unwrap();
    assert!(matches!(
        encoder.submitter(FrameGeometry::packed(640, 480, PixelLayout::Yuv420)),
        Err(EncodeError::InvalidGeometry(_))
    ));
}

#[test]
fn test_handler_cannot_change_while_running() {
    let (mut encoder, _probe) = fake_encoder(EngineOptions::default());
    encoder.configure(&small_config()).unwrap();
    encoder.start().unwrap();
    assert!(matches!(
        encoder.set_packet_handler(|_| {}),
        Err(EncodeError::InvalidState(_))
    ));
    encoder.stop();
    assert!(encoder.set_packet_handler(|_| {}).is_ok());
}
