use web_audio_graph::context::{AudioContextState, BaseAudioContext, OfflineAudioContext};
use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
use web_audio_graph::RENDER_QUANTUM_SIZE;

use std::time::Duration;

use float_eq::assert_float_eq;

// every frame position is an exact binary fraction of a second
const SAMPLE_RATE: f32 = 32768.;

#[test]
fn test_start_stop() {
    let len = RENDER_QUANTUM_SIZE * 4;
    let context = OfflineAudioContext::new(1, len, SAMPLE_RATE).unwrap();
    assert_eq!(context.length(), len);

    let src = context.create_constant_source().unwrap();
    src.connect(&context.destination()).unwrap();

    let quantum = RENDER_QUANTUM_SIZE as f64 / f64::from(SAMPLE_RATE);
    src.start_at(quantum).unwrap();
    src.stop_at(3. * quantum).unwrap();

    let output = context.start_rendering_sync().unwrap();

    // one chunk of silence, two chunks of signal, one chunk of silence
    let mut expected = vec![0.; RENDER_QUANTUM_SIZE];
    expected.append(&mut vec![1.; 2 * RENDER_QUANTUM_SIZE]);
    expected.append(&mut vec![0.; RENDER_QUANTUM_SIZE]);

    assert_float_eq!(output.get_channel_data(0)[..], expected[..], abs_all <= 0.);
}

#[test]
fn test_start_stop_inside_quanta() {
    let len = RENDER_QUANTUM_SIZE * 4;
    let context = OfflineAudioContext::new(1, len, SAMPLE_RATE).unwrap();

    let src = context.create_constant_source().unwrap();
    src.connect(&context.destination()).unwrap();
    src.start_at(100. / f64::from(SAMPLE_RATE)).unwrap();
    src.stop_at(300. / f64::from(SAMPLE_RATE)).unwrap();

    let output = context.start_rendering_sync().unwrap();
    let channel = output.get_channel_data(0);

    assert_float_eq!(channel[..100], [0.; 100][..], abs_all <= 0.);
    assert_float_eq!(channel[100..300], [1.; 200][..], abs_all <= 0.);
    assert_float_eq!(channel[300..], [0.; 212][..], abs_all <= 0.);
}

#[test]
fn test_delayed_constant_source() {
    let len = RENDER_QUANTUM_SIZE * 4;
    let context = OfflineAudioContext::new(1, len, SAMPLE_RATE).unwrap();

    let delay = context.create_delay(1.).unwrap();
    delay
        .delay_time()
        .set_value(2. * RENDER_QUANTUM_SIZE as f32 / SAMPLE_RATE);
    delay.connect(&context.destination()).unwrap();

    let src = context.create_constant_source().unwrap();
    src.connect(&delay).unwrap();
    src.start().unwrap();

    let output = context.start_rendering_sync().unwrap();

    // two chunks of silence, two chunks of signal
    let mut expected = vec![0.; 2 * RENDER_QUANTUM_SIZE];
    expected.append(&mut vec![1.; 2 * RENDER_QUANTUM_SIZE]);

    assert_float_eq!(output.get_channel_data(0)[..], expected[..], abs_all <= 1e-6);
}

#[test]
fn test_finished_sources_are_released() {
    let sample_rate = 48000.;
    let context = OfflineAudioContext::new(1, sample_rate as usize, sample_rate).unwrap();

    let src = context.create_constant_source().unwrap();
    src.connect(&context.destination()).unwrap();
    src.start_at(0.).unwrap();
    src.stop_at(0.5).unwrap();
    drop(src);

    assert_eq!(context.node_count(), 2);

    let output = context.start_rendering_sync().unwrap();
    let audible = output
        .get_channel_data(0)
        .iter()
        .filter(|s| **s != 0.)
        .count();
    assert_eq!(audible, 24000);

    assert_eq!(context.active_source_count(), 0);
    assert_eq!(context.node_count(), 1);
}

#[test]
fn test_sources_stay_alive_while_referenced() {
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE * 8, SAMPLE_RATE).unwrap();

    let src = context.create_constant_source().unwrap();
    let gain = context.create_gain().unwrap();
    src.connect(&gain).unwrap();
    gain.connect(&context.destination()).unwrap();
    src.start().unwrap();
    src.stop_at(RENDER_QUANTUM_SIZE as f64 / f64::from(SAMPLE_RATE)).unwrap();

    let _ = context.start_rendering_sync().unwrap();

    // the control handles keep both nodes in the graph
    assert_eq!(context.active_source_count(), 0);
    assert_eq!(context.node_count(), 3);
}

#[test]
fn test_onended() {
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE * 4, SAMPLE_RATE).unwrap();

    let src = context.create_constant_source().unwrap();
    src.connect(&context.destination()).unwrap();
    src.start().unwrap();
    src.stop_at(200. / f64::from(SAMPLE_RATE)).unwrap();

    let (send, recv) = crossbeam_channel::bounded(1);
    src.set_onended(move |e| {
        let _ = send.send(e.type_);
    });

    let _ = context.start_rendering_sync().unwrap();
    assert_eq!(
        recv.recv_timeout(Duration::from_secs(1)).unwrap(),
        "ended"
    );
}

#[test]
fn test_onended_without_connection() {
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE * 4, SAMPLE_RATE).unwrap();

    // started sources render even when nothing pulls them
    let src = context.create_constant_source().unwrap();
    src.start().unwrap();
    src.stop_at(200. / f64::from(SAMPLE_RATE)).unwrap();

    let (send, recv) = crossbeam_channel::bounded(1);
    src.set_onended(move |_| {
        let _ = send.send(());
    });

    let output = context.start_rendering_sync().unwrap();
    assert_float_eq!(
        output.get_channel_data(0)[..],
        [0.; RENDER_QUANTUM_SIZE * 4][..],
        abs_all <= 0.
    );
    assert!(recv.recv_timeout(Duration::from_secs(1)).is_ok());
}

#[test]
fn test_onstatechange() {
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE, SAMPLE_RATE).unwrap();

    let (send, recv) = crossbeam_channel::unbounded();
    context.set_onstatechange(move |e| {
        let _ = send.send(e.type_);
    });

    let _ = context.start_rendering_sync().unwrap();
    assert_eq!(context.state(), AudioContextState::Closed);

    // running, then closed
    for _ in 0..2 {
        assert_eq!(
            recv.recv_timeout(Duration::from_secs(1)).unwrap(),
            "statechange"
        );
    }
}

#[test]
fn test_buffer_source_playback() {
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE * 2, SAMPLE_RATE).unwrap();

    let mut buffer = context.create_buffer(1, 100, SAMPLE_RATE).unwrap();
    let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
    buffer.copy_to_channel(&ramp, 0).unwrap();

    let src = context.create_buffer_source().unwrap();
    src.set_buffer(buffer).unwrap();
    src.connect(&context.destination()).unwrap();
    src.start_at(10. / f64::from(SAMPLE_RATE)).unwrap();

    let output = context.start_rendering_sync().unwrap();
    let channel = output.get_channel_data(0);

    assert_float_eq!(channel[..10], [0.; 10][..], abs_all <= 0.);
    assert_float_eq!(channel[10..110], ramp[..], abs_all <= 0.);
    assert_float_eq!(channel[110..], [0.; 146][..], abs_all <= 0.);
}
