//! Stream start/stop, chunk assembly and annotations

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Harness};
use headconf::HeadsetConfig;
use headproto::sim::{SimOptions, SimulatedHeadset};
use headproto::{
    AckStatus, Axis, ChannelId, DataFrame, DeviceMessage, GainMode, HostCommand, Opcode, Polarity,
};
use headset::{Chunk, Session, SessionError, SessionState};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

const E0: ChannelId = ChannelId::Electrode(0);
const E3: ChannelId = ChannelId::Electrode(3);
const E7: ChannelId = ChannelId::Electrode(7);

fn data(sequence: u16, channels: u8, timesteps: u8, start: f32) -> DeviceMessage {
    let count = channels as usize * timesteps as usize;
    DeviceMessage::Data(DataFrame {
        sequence,
        channels,
        timesteps,
        values: (0..count).map(|i| start + i as f32).collect(),
    })
}

fn small_chunks() -> HeadsetConfig {
    let mut config = HeadsetConfig::default();
    config.stream.chunk_size = 4;
    config
}

#[tokio::test]
async fn test_start_commits_staged_channels_in_enable_order() {
    let mut harness = Harness::connected().await;
    harness.session.set_channel_enabled(E7, true).unwrap();
    harness.session.set_channel_enabled(E0, true).unwrap();
    harness.session.set_channel_gain(E0, GainMode::X12).unwrap();
    harness.session.set_channel_bias(E7, Polarity::Positive).unwrap();

    let completion = harness.session.start_stream().unwrap();
    let HostCommand::StartStream(setup) = harness.expect_command().await else {
        panic!("expected StartStream");
    };
    assert_eq!(setup.enabled().collect::<Vec<_>>(), vec![E7, E0]);
    harness.ack(Opcode::StartStream, AckStatus::Ok);
    completion.await.unwrap();

    assert!(harness.session.is_streaming());
    assert_eq!(harness.session.channel_index(E7).unwrap(), Some(0));
    assert_eq!(harness.session.channel_index(E0).unwrap(), Some(1));
    assert_eq!(harness.session.channel_index(E3).unwrap(), None);
    assert_eq!(harness.session.streamed_channels().unwrap(), vec![E7, E0]);

    // Staged config was consumed by the start
    assert!(harness.session.staged_config().is_empty());
}

#[tokio::test]
async fn test_channel_index_requires_streaming() {
    let harness = Harness::connected().await;
    assert!(matches!(
        harness.session.channel_index(E0),
        Err(SessionError::InvalidState {
            operation: "channel_index",
            state: SessionState::Connected,
        })
    ));
}

#[tokio::test]
async fn test_unrepresentable_channel_rejected() {
    let mut harness = Harness::connected().await;
    let bogus = ChannelId::Electrode(200);
    assert!(matches!(
        harness.session.set_channel_enabled(bogus, true),
        Err(SessionError::InvalidChannel(_))
    ));
}

#[tokio::test]
async fn test_gain_on_digital_channel_is_ignored() {
    let mut harness = Harness::connected().await;
    harness
        .session
        .set_channel_gain(ChannelId::DigitalInput, GainMode::X24)
        .unwrap();
    assert!(harness.session.staged_config().is_empty());
}

#[tokio::test]
async fn test_rejected_start_restores_staged() {
    let mut harness = Harness::connected().await;
    harness.session.set_channel_enabled(E3, true).unwrap();
    let staged = harness.session.staged_config();

    let completion = harness.session.start_stream().unwrap();
    harness.expect_command().await;
    harness.ack(Opcode::StartStream, AckStatus::Rejected);

    let error = completion.await.unwrap_err();
    assert!(matches!(error, SessionError::Rejected { .. }));
    assert_eq!(harness.session.state(), SessionState::Connected);
    assert_eq!(harness.session.staged_config(), staged);
}

#[tokio::test]
async fn test_start_while_streaming_is_invalid() {
    let mut harness = Harness::connected().await;
    harness.start_streaming().await;
    assert!(matches!(
        harness.session.start_stream(),
        Err(SessionError::InvalidState {
            state: SessionState::Streaming,
            ..
        })
    ));
}

#[tokio::test]
async fn test_chunks_delivered_in_channel_index_order() {
    let mut harness = Harness::connected_with(&small_chunks()).await;
    harness.session.set_channel_enabled(E3, true).unwrap();
    harness.session.set_channel_enabled(E0, true).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Chunk>();
    harness.session.set_chunk_callback(move |chunk| {
        let _ = tx.send(chunk.clone());
    });
    harness.start_streaming().await;

    // Two frames of three timesteps: one full chunk of four, two left over
    harness.device.send(&data(0, 2, 3, 0.0)).unwrap();
    harness.device.send(&data(1, 2, 3, 6.0)).unwrap();

    let chunk = rx.recv().await.unwrap();
    assert_eq!(chunk.channel_count(), 2);
    assert_eq!(chunk.sample_count(), 4);
    assert_eq!(chunk.channel(0), Some(&[0.0, 2.0, 4.0, 6.0][..]));
    assert_eq!(chunk.channel(1), Some(&[1.0, 3.0, 5.0, 7.0][..]));

    let stats = harness.session.stream_stats();
    assert_eq!(stats.frames_accepted, 2);
    assert_eq!(stats.chunks_delivered, 1);
}

#[tokio::test]
async fn test_malformed_and_late_frames_counted() {
    let mut harness = Harness::connected_with(&small_chunks()).await;
    harness.session.set_channel_enabled(E0, true).unwrap();
    harness.start_streaming().await;

    harness.device.send(&data(5, 1, 1, 0.0)).unwrap();
    harness.device.send(&data(6, 3, 1, 0.0)).unwrap();
    harness.device.send(&data(4, 1, 1, 0.0)).unwrap();
    harness.device.send(&data(9, 1, 1, 0.0)).unwrap();

    eventually(|| harness.session.stream_stats().frames_accepted == 2).await;
    let stats = harness.session.stream_stats();
    assert_eq!(stats.frames_malformed, 1);
    assert_eq!(stats.frames_late, 1);
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.frames_missing, 3);
}

#[tokio::test]
async fn test_stop_returns_to_connected() {
    let mut harness = Harness::connected().await;
    harness.session.set_channel_enabled(E0, true).unwrap();
    harness.start_streaming().await;

    let completion = harness.session.stop_stream().unwrap();
    assert_eq!(harness.expect_command().await, HostCommand::StopStream);
    harness.ack(Opcode::StopStream, AckStatus::Ok);
    completion.await.unwrap();

    assert_eq!(harness.session.state(), SessionState::Connected);
    assert!(matches!(
        harness.session.stop_stream(),
        Err(SessionError::InvalidState { .. })
    ));
    assert!(harness.session.channel_index(E0).is_err());
}

#[tokio::test]
async fn test_annotations_while_streaming() {
    let mut harness = Harness::connected().await;
    assert!(matches!(
        harness.session.annotate("before stream"),
        Err(SessionError::InvalidState { .. })
    ));

    harness.start_streaming().await;
    harness.session.annotate("eyes closed").unwrap();
    harness.session.annotate("eyes open").unwrap();

    let annotations = harness.session.annotations();
    assert_eq!(
        annotations.iter().map(|a| a.text.as_str()).collect::<Vec<_>>(),
        vec!["eyes closed", "eyes open"]
    );
    assert!(annotations[0].timestamp <= annotations[1].timestamp);

    harness.session.clear_annotations();
    assert!(harness.session.annotations().is_empty());
}

#[tokio::test]
async fn test_annotation_refused_while_calibrating() {
    let mut harness = Harness::connected().await;
    harness.start_streaming().await;

    harness
        .device
        .send(&DeviceMessage::Calibration { active: true })
        .unwrap();
    eventually(|| harness.session.annotate("x").is_err()).await;
    let error = harness.session.annotate("during calibration").unwrap_err();
    assert!(matches!(error, SessionError::AnnotationUnavailableCalibrating));
    assert!(error.is_transient());

    harness
        .device
        .send(&DeviceMessage::Calibration { active: false })
        .unwrap();
    eventually(|| harness.session.annotate("after calibration").is_ok()).await;
}

#[tokio::test]
async fn test_link_loss_clears_annotations_and_restores_pending_start() {
    let mut harness = Harness::connected().await;
    harness.start_streaming().await;
    harness.session.annotate("marker").unwrap();

    harness.drop_link();
    eventually(|| harness.session.state() == SessionState::Disconnected).await;
    assert!(harness.session.annotations().is_empty());

    harness.reconnect().await;
    harness.session.set_channel_enabled(E0, true).unwrap();
    let staged = harness.session.staged_config();
    let completion = harness.session.start_stream().unwrap();
    harness.expect_command().await;
    harness.drop_link();

    assert!(matches!(completion.await, Err(SessionError::Disconnected)));
    assert_eq!(harness.session.staged_config(), staged);
}

#[tokio::test]
async fn test_simulated_headset_streams_end_to_end() {
    let sim = SimulatedHeadset::new(SimOptions {
        battery_interval: Duration::from_millis(20),
        ..Default::default()
    });
    let mut config = HeadsetConfig::default();
    config.stream.chunk_size = 10;
    let mut session = Session::new(Arc::new(sim.clone()), &config).unwrap();

    session.connect("HALO-SIM").unwrap().await.unwrap();
    session.set_channel_enabled(ChannelId::SampleNumber, true).unwrap();
    session.set_channel_enabled(E0, true).unwrap();
    session
        .set_channel_enabled(ChannelId::Accelerometer(Axis::Z), true)
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Chunk>();
    session.set_chunk_callback(move |chunk| {
        let _ = tx.send(chunk.clone());
    });
    session.start_stream().unwrap().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    // The sample counter runs continuously across chunk boundaries
    let index = session.channel_index(ChannelId::SampleNumber).unwrap().unwrap();
    let counter: Vec<f32> = first
        .channel(index)
        .unwrap()
        .iter()
        .chain(second.channel(index).unwrap())
        .copied()
        .collect();
    assert_eq!(counter, (0..20).map(|n| n as f32).collect::<Vec<_>>());

    let z = session
        .channel_index(ChannelId::Accelerometer(Axis::Z))
        .unwrap()
        .unwrap();
    assert!(first.channel(z).unwrap().iter().all(|v| *v == 1.0));

    eventually(|| session.battery_info().level > 0).await;

    session.stop_stream().unwrap().await.unwrap();
    assert_eq!(sim.persisted_setup().enabled().count(), 3);
    session.close();
}

#[tokio::test]
async fn test_simulated_calibration_window() {
    let sim = SimulatedHeadset::new(SimOptions {
        calibration: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let mut session = Session::new(Arc::new(sim), &HeadsetConfig::default()).unwrap();
    session.connect("HALO-SIM").unwrap().await.unwrap();
    session.start_stream().unwrap().await.unwrap();

    eventually(|| {
        matches!(
            session.annotate("marker"),
            Err(SessionError::AnnotationUnavailableCalibrating)
        )
    })
    .await;
    eventually(|| session.annotate("after window").is_ok()).await;
}

#[tokio::test]
async fn test_load_config_after_reconnect_restores_persisted_setup() {
    let sim = SimulatedHeadset::default();
    let mut session = Session::new(Arc::new(sim.clone()), &HeadsetConfig::default()).unwrap();
    session.connect("HALO-SIM").unwrap().await.unwrap();
    session.set_channel_enabled(E3, true).unwrap();
    session.set_channel_gain(E3, GainMode::X2).unwrap();
    let committed = session.staged_config();
    session.start_stream().unwrap().await.unwrap();
    session.stop_stream().unwrap().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    // Staged but never started, so the device never persists it
    session.set_channel_enabled(E7, true).unwrap();
    session.set_channel_gain(E7, GainMode::X8).unwrap();
    let unstarted = session.staged_config();
    session.disconnect();

    session.connect("HALO-SIM").unwrap().await.unwrap();
    assert_eq!(sim.connections(), 2);
    assert_eq!(session.staged_config(), unstarted);
    session.load_config().unwrap().await.unwrap();
    assert_eq!(session.staged_config(), committed);
    assert_ne!(session.staged_config(), unstarted);
}

#[tokio::test]
async fn test_second_start_while_pending_leaves_first_intact() {
    let mut harness = Harness::connected().await;
    let first = harness.session.start_stream().unwrap();
    assert!(matches!(
        harness.session.start_stream(),
        Err(SessionError::AlreadyPending(_))
    ));

    harness.expect_command().await;
    harness.ack(Opcode::StartStream, AckStatus::Ok);
    first.await.unwrap();
    assert!(harness.session.is_streaming());
}

#[tokio::test]
async fn test_all_disabled_streams_zero_channels() {
    let mut harness = Harness::connected().await;
    harness.session.set_channel_enabled(E0, true).unwrap();
    harness.session.set_channel_enabled(E0, false).unwrap();
    harness.start_streaming().await;

    assert!(harness.session.streamed_channels().unwrap().is_empty());
    for n in 0..8 {
        assert_eq!(
            harness.session.channel_index(ChannelId::Electrode(n)).unwrap(),
            None
        );
    }
}

#[tokio::test]
async fn test_restaging_without_a_channel_compacts_indices() {
    let (a, b, c) = (E0, ChannelId::Electrode(1), ChannelId::Electrode(2));
    let mut harness = Harness::connected().await;
    for channel in [a, b, c] {
        harness.session.set_channel_enabled(channel, true).unwrap();
    }
    harness.start_streaming().await;
    assert_eq!(harness.session.streamed_channels().unwrap(), vec![a, b, c]);

    let stop = harness.session.stop_stream().unwrap();
    harness.expect_command().await;
    harness.ack(Opcode::StopStream, AckStatus::Ok);
    stop.await.unwrap();

    harness.session.set_channel_enabled(a, true).unwrap();
    harness.session.set_channel_enabled(c, true).unwrap();
    harness.start_streaming().await;
    assert_eq!(harness.session.channel_index(a).unwrap(), Some(0));
    assert_eq!(harness.session.channel_index(b).unwrap(), None);
    assert_eq!(harness.session.channel_index(c).unwrap(), Some(1));
}
