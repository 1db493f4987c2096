use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{AudioBackendManager, RenderThreadInit};
use crate::context::AudioContextOptions;
use crate::render::RenderThread;
use crate::Error;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

const NUMBER_OF_CHANNELS: usize = 2;

const DEFAULT_SAMPLE_RATE: f32 = 48000.;

enum NoneBackendMessage {
    Close,
}

/// Output backend without a device: an isochronous thread pulling the render thread at the
/// pace of the audio clock
pub struct NoneBackend {
    sender: Sender<NoneBackendMessage>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    sample_rate: f32,
}

struct Callback {
    receiver: Receiver<NoneBackendMessage>,
    render_thread: RenderThread,
    buffer_size: usize,
    sample_rate: f32,
}

impl Callback {
    fn run(mut self) {
        let mut buffer = vec![0.; self.buffer_size * NUMBER_OF_CHANNELS];
        let interval = Duration::from_secs_f64(self.buffer_size as f64 / f64::from(self.sample_rate));

        // For an isochronous callback we must calculate the deadline every render quantum
        let mut deadline = Instant::now() + interval;

        loop {
            // poll the receiver as long as the deadline is in the future
            if let Ok(NoneBackendMessage::Close) = self.receiver.recv_deadline(deadline) {
                return;
            }

            self.render_thread.render(&mut buffer[..]);

            deadline += interval;
        }
    }
}

impl AudioBackendManager for NoneBackend {
    fn build_output(
        options: &AudioContextOptions,
        render_thread_init: RenderThreadInit,
    ) -> Result<Self, Error>
    where
        Self: Sized,
    {
        let sample_rate = options.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let buffer_size = super::buffer_size_for_latency_category(options.latency_hint, sample_rate);

        let render_thread = RenderThread::new(sample_rate, NUMBER_OF_CHANNELS, render_thread_init);

        let (sender, receiver) = crossbeam_channel::unbounded();
        let callback = Callback {
            render_thread,
            receiver,
            buffer_size,
            sample_rate,
        };

        let join_handle = thread::Builder::new()
            .name("audio-render".into())
            .spawn(move || callback.run())?;
        log::info!("Render thread started on the none backend");

        Ok(Self {
            sender,
            join_handle: Mutex::new(Some(join_handle)),
            sample_rate,
        })
    }

    fn close(&self) {
        // the thread may have stopped already
        let _ = self.sender.send(NoneBackendMessage::Close);
        if let Some(handle) = self.join_handle.lock().take() {
            if handle.join().is_err() {
                log::warn!("Render thread of the none backend panicked");
            }
        }
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn number_of_channels(&self) -> usize {
        NUMBER_OF_CHANNELS
    }

    fn sink_id(&self) -> &str {
        "none"
    }
}
