//! Output to an audio device through `cpal`
use std::sync::Arc;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BuildStreamError, Device, FromSample, OutputCallbackInfo, SampleFormat, SizedSample, Stream,
    StreamConfig, SupportedBufferSize,
};
use parking_lot::Mutex;

use super::{AudioBackendManager, RenderThreadInit};

use crate::context::AudioContextOptions;
use crate::render::RenderThread;
use crate::Error;

mod private {
    use super::*;

    pub struct ThreadSafeClosableStream(Arc<Mutex<Option<Stream>>>);

    impl ThreadSafeClosableStream {
        pub fn new(stream: Stream) -> Self {
            Self(Arc::new(Mutex::new(Some(stream))))
        }

        /// Drops the stream, which joins the device callback
        pub fn close(&self) {
            self.0.lock().take();
        }
    }

    // SAFETY:
    // The cpal `Stream` is marked !Sync and !Send because some platforms are not thread-safe
    // https://github.com/RustAudio/cpal/commit/33ddf749548d87bf54ce18eb342f954cec1465b2
    // Since we wrap the Stream in a Mutex, we should be fine
    unsafe impl Sync for ThreadSafeClosableStream {}
    unsafe impl Send for ThreadSafeClosableStream {}
}
use private::ThreadSafeClosableStream;

/// Audio backend using the `cpal` library
pub struct CpalBackend {
    stream: ThreadSafeClosableStream,
    sample_rate: f32,
    number_of_channels: usize,
    sink_id: String,
}

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::NotSupported(format!("audio device error: {}", e))
}

impl AudioBackendManager for CpalBackend {
    fn build_output(
        options: &AudioContextOptions,
        render_thread_init: RenderThreadInit,
    ) -> Result<Self, Error>
    where
        Self: Sized,
    {
        let host = cpal::default_host();
        log::info!("Host: {:?}", host.id());

        let device = if options.sink_id.is_empty() {
            host.default_output_device()
        } else {
            host.output_devices()
                .map_err(device_error)?
                .find(|d| d.name().map_or(false, |name| name == options.sink_id))
        }
        .ok_or_else(|| Error::NotSupported(format!("no output device {:?}", options.sink_id)))?;

        log::info!("Output device: {:?}", device.name());

        let supported = device.default_output_config().map_err(device_error)?;
        let mut prefered: StreamConfig = supported.clone().into();

        // set specific sample rate if requested
        if let Some(sample_rate) = options.sample_rate {
            prefered.sample_rate.0 = sample_rate as u32;
        }

        // always try to set a decent buffer size
        let buffer_size = super::buffer_size_for_latency_category(
            options.latency_hint,
            prefered.sample_rate.0 as f32,
        ) as u32;

        let clamped_buffer_size: u32 = match supported.buffer_size() {
            SupportedBufferSize::Unknown => buffer_size,
            SupportedBufferSize::Range { min, max } => buffer_size.clamp(*min, *max),
        };
        prefered.buffer_size = cpal::BufferSize::Fixed(clamped_buffer_size);

        log::debug!("Attempt output stream with prefered config: {:?}", &prefered);
        let renderer = RenderThread::new(
            prefered.sample_rate.0 as f32,
            usize::from(prefered.channels),
            render_thread_init.clone(),
        );

        let (stream, config) =
            match spawn_output_stream(&device, supported.sample_format(), &prefered, renderer) {
                Ok(stream) => (stream, prefered),
                Err(e) => {
                    log::warn!("Output stream build failed with prefered config: {}", e);

                    let fallback: StreamConfig = supported.clone().into();
                    log::debug!("Attempt output stream with fallback config: {:?}", &fallback);
                    let renderer = RenderThread::new(
                        fallback.sample_rate.0 as f32,
                        usize::from(fallback.channels),
                        render_thread_init,
                    );
                    let stream =
                        spawn_output_stream(&device, supported.sample_format(), &fallback, renderer)
                            .map_err(device_error)?;
                    (stream, fallback)
                }
            };

        stream.play().map_err(device_error)?;
        log::info!("Render thread started on the cpal backend");

        Ok(CpalBackend {
            stream: ThreadSafeClosableStream::new(stream),
            sample_rate: config.sample_rate.0 as f32,
            number_of_channels: usize::from(config.channels),
            sink_id: options.sink_id.clone(),
        })
    }

    fn close(&self) {
        self.stream.close()
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    fn sink_id(&self) -> &str {
        self.sink_id.as_str()
    }
}

/// Creates an output stream
///
/// # Arguments:
///
/// * `device` - the output audio device on which the stream is created
/// * `sample_format` - audio sample format of the stream
/// * `config` - stream configuration
/// * `render` - the render thread which process the audio data
fn spawn_output_stream(
    device: &Device,
    sample_format: SampleFormat,
    config: &StreamConfig,
    render: RenderThread,
) -> Result<Stream, BuildStreamError> {
    match sample_format {
        SampleFormat::F32 => build_stream::<f32>(device, config, render),
        SampleFormat::F64 => build_stream::<f64>(device, config, render),
        SampleFormat::I16 => build_stream::<i16>(device, config, render),
        SampleFormat::I32 => build_stream::<i32>(device, config, render),
        SampleFormat::U16 => build_stream::<u16>(device, config, render),
        SampleFormat::U8 => build_stream::<u8>(device, config, render),
        _ => Err(BuildStreamError::StreamConfigNotSupported),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut render: RenderThread,
) -> Result<Stream, BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let err_fn = |err| log::error!("an error occurred on the output audio stream: {}", err);
    // the render thread produces f32, other formats are converted from this scratch buffer
    let mut scratch: Vec<f32> = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _info: &OutputCallbackInfo| {
            if scratch.len() != data.len() {
                scratch.resize(data.len(), 0.);
            }
            render.render(&mut scratch);
            data.iter_mut()
                .zip(scratch.iter())
                .for_each(|(o, i)| *o = T::from_sample(*i));
        },
        err_fn,
        None,
    )
}
