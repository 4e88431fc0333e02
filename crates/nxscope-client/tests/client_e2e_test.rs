//! End-to-end tests: client against the simulated device.

use std::{sync::Arc, time::Duration};

use nxscope_client::{ClientConfig, ClientError, Nxscope};
use nxscope_harness::{SimDevice, SimEvent};
use nxscope_proto::{Frame, FrameId, SampleData, payloads::SetFlags};

fn fast_cfg() -> ClientConfig {
    ClientConfig {
        ack_timeout: Duration::from_millis(500),
        handshake_retries: 3,
        stream_dequeue: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

fn connected() -> (Arc<SimDevice>, Nxscope) {
    let sim = Arc::new(SimDevice::with_default_device());
    let scope = Nxscope::new(sim.clone(), fast_cfg());
    scope.connect().expect("connect should succeed");
    (sim, scope)
}

#[test]
fn connect_discovers_the_device() {
    let (sim, scope) = connected();

    let dev = scope.device().expect("device populated");
    assert_eq!(dev.chmax, 10);
    assert!(dev.flags.div_supported());
    assert!(dev.flags.ack_supported());
    assert_eq!(dev.rxpadding, 16);

    let ch0 = scope.dev_channel_get(0).expect("channel 0 exists");
    assert_eq!(ch0.name, "chan0");
    assert!(!ch0.en);

    let ch9 = scope.dev_channel_get(9).expect("channel 9 exists");
    assert!(!ch9.is_valid());

    // the handshake asked for every channel at least once
    let chinfos = sim
        .stats()
        .events()
        .iter()
        .filter(|event| matches!(event, SimEvent::Chinfo(_)))
        .count();
    assert!(chinfos >= 10);

    scope.disconnect();
}

#[test]
fn single_channel_diff_commits_as_single() {
    let (sim, scope) = connected();
    sim.stats().clear();

    scope.ch_enable(&[1], false).unwrap();
    scope.channels_write().unwrap();

    assert_eq!(sim.stats().set_frames(), vec![SimEvent::Enable(SetFlags::Single)]);
    assert!(scope.ch_is_enabled(1).unwrap());
    assert!(!scope.ch_is_enabled(0).unwrap());
    assert!(sim.device().channel(1).unwrap().en);

    scope.disconnect();
}

#[test]
fn no_diff_commits_nothing() {
    let (sim, scope) = connected();
    sim.stats().clear();

    scope.channels_write().unwrap();

    assert!(sim.stats().set_frames().is_empty());
    scope.disconnect();
}

#[test]
fn uniform_diff_commits_as_all() {
    let (sim, scope) = connected();
    sim.stats().clear();

    scope.ch_enable_all(true).unwrap();

    assert_eq!(sim.stats().set_frames(), vec![SimEvent::Enable(SetFlags::All)]);
    assert!(sim.device().channels_en().iter().all(|&en| en));

    scope.disconnect();
}

#[test]
fn mixed_diff_commits_as_bulk() {
    let (sim, scope) = connected();

    scope.ch_enable_all(true).unwrap();
    sim.stats().clear();

    // disable two of ten channels: more than one diff, not uniform
    scope.ch_disable(&[0, 2], true).unwrap();

    assert_eq!(sim.stats().set_frames(), vec![SimEvent::Enable(SetFlags::Bulk)]);
    let en = sim.device().channels_en();
    assert!(!en[0]);
    assert!(en[1]);
    assert!(!en[2]);

    scope.disconnect();
}

#[test]
fn divider_frame_precedes_enable_frame() {
    let (sim, scope) = connected();
    sim.stats().clear();

    scope.ch_divider(&[0], 2, false).unwrap();
    scope.ch_enable(&[0], false).unwrap();
    scope.channels_write().unwrap();

    assert_eq!(
        sim.stats().set_frames(),
        vec![SimEvent::Div(SetFlags::Single), SimEvent::Enable(SetFlags::Single)]
    );
    assert_eq!(scope.ch_div_get(0).unwrap(), 2);
    assert_eq!(sim.device().channel(0).unwrap().div, 2);

    scope.disconnect();
}

#[test]
fn divider_accepts_full_range() {
    let (_sim, scope) = connected();

    scope.ch_divider(&[0], 255, false).unwrap();
    scope.ch_divider(&[0], 0, false).unwrap();

    scope.disconnect();
}

#[test]
fn invalid_channel_ids_are_rejected() {
    let (_sim, scope) = connected();

    assert_eq!(
        scope.ch_enable(&[99], false),
        Err(ClientError::InvalidChannel { chan: 99, chmax: 10 })
    );
    assert_eq!(
        scope.ch_divider(&[200], 1, false),
        Err(ClientError::InvalidChannel { chan: 200, chmax: 10 })
    );
    assert!(matches!(
        scope.stream_sub(10),
        Err(ClientError::InvalidChannel { chan: 10, chmax: 10 })
    ));

    scope.disconnect();
}

#[test]
fn stream_delivers_batches_in_order() {
    let (_sim, scope) = connected();

    // constant-vector channel gives deterministic sample values
    scope.ch_enable(&[5], false).unwrap();
    let sub = scope.stream_sub(5).unwrap();
    scope.stream_start().unwrap();

    let batch = sub
        .receiver()
        .recv_timeout(Duration::from_secs(5))
        .expect("stream batch should arrive");
    assert!(!batch.is_empty());
    for sample in &batch {
        assert_eq!(sample.chan, 5);
        assert_eq!(sample.data, SampleData::Num(vec![1.0, 0.0, -1.0]));
    }

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn metadata_channel_round_trips() {
    let (_sim, scope) = connected();

    scope.ch_enable(&[7], false).unwrap();
    let sub = scope.stream_sub(7).unwrap();
    scope.stream_start().unwrap();

    let batch = sub
        .receiver()
        .recv_timeout(Duration::from_secs(5))
        .expect("stream batch should arrive");
    let sample = &batch[0];
    assert_eq!(sample.data, SampleData::Num(vec![1.0, 0.0, -1.0]));
    assert_eq!(sample.meta.len(), 1);
    assert!(sample.meta[0] < 255);

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn disabled_channel_samples_are_suppressed() {
    let (sim, scope) = connected();

    scope.ch_enable(&[5], false).unwrap();
    let silent = scope.stream_sub(0).unwrap();
    scope.stream_start().unwrap();

    // a stream frame carrying a sample for disabled channel 0
    let mut payload = vec![0x00, 0x00];
    payload.extend_from_slice(&1.0f32.to_le_bytes());
    sim.inject(&Frame::create(FrameId::Stream, &payload).unwrap());

    std::thread::sleep(Duration::from_millis(300));
    assert!(silent.receiver().try_recv().is_err());

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn overflow_flag_increments_the_counter() {
    let (sim, scope) = connected();

    scope.ch_enable(&[5], false).unwrap();
    scope.stream_start().unwrap();
    assert_eq!(scope.ovf_count(), 0);

    // overflow frame carrying zero samples still counts exactly once
    sim.inject(&Frame::create(FrameId::Stream, &[0x01]).unwrap());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scope.ovf_count() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(scope.ovf_count(), 1);

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn stream_survives_injected_garbage() {
    let (sim, scope) = connected();

    scope.ch_enable(&[5], false).unwrap();
    let sub = scope.stream_sub(5).unwrap();
    scope.stream_start().unwrap();

    sub.receiver().recv_timeout(Duration::from_secs(5)).expect("stream running");

    // garbage and a corrupted frame in the middle of the byte stream
    sim.inject(&[0xDE, 0xAD, 0xBE, 0xEF, 0x55, 0x03]);
    let mut corrupt = Frame::create(FrameId::Stream, &[0x00]).unwrap().to_vec();
    corrupt[4] ^= 0xFF;
    sim.inject(&corrupt);

    // the pipeline resyncs and keeps delivering
    sub.receiver()
        .recv_timeout(Duration::from_secs(5))
        .expect("stream should survive garbage");

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn unsubscribe_is_idempotent() {
    let (_sim, scope) = connected();

    let sub = scope.stream_sub(3).unwrap();
    scope.stream_unsub(&sub);
    scope.stream_unsub(&sub);

    // a fresh subscription still works afterwards
    let again = scope.stream_sub(3).unwrap();
    scope.stream_unsub(&again);

    scope.disconnect();
}

#[test]
fn unsubscribed_queue_stops_receiving() {
    let (_sim, scope) = connected();

    scope.ch_enable(&[5], false).unwrap();
    let sub = scope.stream_sub(5).unwrap();
    scope.stream_start().unwrap();

    sub.receiver().recv_timeout(Duration::from_secs(5)).expect("stream running");
    scope.stream_unsub(&sub);

    // drain what was in flight; nothing new should show up after that
    std::thread::sleep(Duration::from_millis(200));
    while sub.receiver().try_recv().is_ok() {}
    std::thread::sleep(Duration::from_millis(300));
    assert!(sub.receiver().try_recv().is_err());

    scope.stream_stop().unwrap();
    scope.disconnect();
}

#[test]
fn channels_configure_selection() {
    let (sim, scope) = connected();

    scope
        .channels_configure(
            &nxscope_client::ChannelSelection::Channels(vec![0, 5, 9]),
            &nxscope_client::DividerConfig::Uniform(4),
        )
        .unwrap();
    scope.channels_write().unwrap();

    let dev = sim.device();
    assert!(dev.channel(0).unwrap().en);
    assert!(dev.channel(5).unwrap().en);
    // channel 9 has an undefined dtype and stays disabled
    assert!(!dev.channel(9).unwrap().en);
    assert_eq!(dev.channel(0).unwrap().div, 4);

    let mismatch = scope.channels_configure(
        &nxscope_client::ChannelSelection::Channels(vec![0, 1]),
        &nxscope_client::DividerConfig::PerChannel(vec![1]),
    );
    assert_eq!(
        mismatch,
        Err(ClientError::DividerLengthMismatch { expected: 2, got: 1 })
    );

    scope.disconnect();
}
