//! Random graph edits from several control threads while the render thread runs

use web_audio_graph::context::{
    AudioContext, AudioContextOptions, BaseAudioContext, OfflineAudioContext,
};
use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
use web_audio_graph::RENDER_QUANTUM_SIZE;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

#[test]
fn test_random_edits_while_rendering() {
    let _ = env_logger::builder().is_test(true).try_init();

    let options = AudioContextOptions {
        sink_id: "none".into(),
        ..AudioContextOptions::default()
    };
    let context = Arc::new(AudioContext::new(options).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let context = Arc::clone(&context);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut nodes: Vec<Box<dyn AudioNode + Send>> = vec![];

                for _ in 0..200 {
                    match rng.gen_range(0..5) {
                        0 => {
                            let src = context.create_constant_source().unwrap();
                            src.start().unwrap();
                            src.stop_at(context.current_time() + rng.gen_range(0. ..0.05))
                                .unwrap();
                            nodes.push(Box::new(src));
                        }
                        1 => nodes.push(Box::new(context.create_gain().unwrap())),
                        2 => nodes.push(Box::new(context.create_delay(0.1).unwrap())),
                        3 if !nodes.is_empty() => {
                            let from = nodes.choose(&mut rng).unwrap();
                            // sources have no inputs, those connections are refused
                            if rng.gen_bool(0.5) {
                                let to = nodes.choose(&mut rng).unwrap();
                                let _ = from.connect(&**to);
                            } else {
                                from.connect(&context.destination()).unwrap();
                            }
                        }
                        _ if !nodes.is_empty() => {
                            let index = rng.gen_range(0..nodes.len());
                            if rng.gen_bool(0.5) {
                                let _ = nodes[index].disconnect();
                            } else {
                                drop(nodes.swap_remove(index));
                            }
                        }
                        _ => (),
                    }
                    if rng.gen_bool(0.1) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // the render thread survived all edits
    let time = context.current_time();
    std::thread::sleep(Duration::from_millis(200));
    assert!(context.current_time() >= time + 0.15);

    context.close_sync().unwrap();
}

#[test]
fn test_connection_edits_apply_between_quanta() {
    let _ = env_logger::builder().is_test(true).try_init();

    let quanta = 4000;
    let context = OfflineAudioContext::new(1, RENDER_QUANTUM_SIZE * quanta, 48000.).unwrap();

    let src = context.create_constant_source().unwrap();
    let gain = context.create_gain().unwrap();
    src.connect(&gain).unwrap();
    src.start().unwrap();

    let done = AtomicBool::new(false);
    let output = std::thread::scope(|s| {
        s.spawn(|| {
            let mut rng = rand::thread_rng();
            let dest = context.destination();
            while !done.load(Ordering::SeqCst) {
                // fails once the context is closed
                let _ = gain.connect(&dest);
                std::thread::yield_now();
                let _ = gain.disconnect_dest(&dest);
                if rng.gen_bool(0.1) {
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        });

        let output = context.start_rendering();
        done.store(true, Ordering::SeqCst);
        output
    })
    .unwrap();

    // every quantum sees the edge either fully present or fully absent
    for (i, chunk) in output
        .get_channel_data(0)
        .chunks(RENDER_QUANTUM_SIZE)
        .enumerate()
    {
        let first = chunk[0];
        assert!(first == 0. || first == 1., "quantum {i} starts at {first}");
        assert!(chunk.iter().all(|v| *v == first), "quantum {i} is mixed");
    }
}
