//! General purpose audio signal data structures
use std::sync::Arc;

use crate::{validate_number_of_channels, validate_sample_rate, Error};

/// Options for constructing an [`AudioBuffer`]
#[derive(Clone, Debug)]
pub struct AudioBufferOptions {
    /// The number of channels for the buffer
    pub number_of_channels: usize,
    /// The length in sample frames of the buffer
    pub length: usize,
    /// The sample rate in Hz for the buffer
    pub sample_rate: f32,
}

/// Memory-resident audio asset, basically a matrix of channels * samples
///
/// An AudioBuffer has copy-on-write semantics, so it is cheap to clone. The channels are shared
/// with the render thread once the buffer is assigned to an
/// [`AudioBufferSourceNode`](crate::node::AudioBufferSourceNode), writes through
/// [`copy_to_channel`](Self::copy_to_channel) never alter what is already playing.
///
/// # Example
///
/// ```
/// use web_audio_graph::buffer::{AudioBuffer, AudioBufferOptions};
///
/// let options = AudioBufferOptions {
///     number_of_channels: 2,
///     length: 100,
///     sample_rate: 48000.,
/// };
/// let mut buffer = AudioBuffer::new(options).unwrap();
/// buffer.copy_to_channel(&[1.; 100], 1).unwrap();
///
/// assert_eq!(buffer.get_channel_data(0)[0], 0.);
/// assert_eq!(buffer.get_channel_data(1)[0], 1.);
/// ```
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    channels: Vec<Arc<[f32]>>,
    length: usize,
    sample_rate: f32,
}

fn try_zeroed(length: usize) -> Result<Vec<f32>, Error> {
    let mut channel = Vec::new();
    channel.try_reserve_exact(length).map_err(|e| {
        Error::ResourceExhausted(format!("cannot allocate {} samples: {}", length, e))
    })?;
    channel.resize(length, 0.);
    Ok(channel)
}

impl AudioBuffer {
    /// Allocate a silent AudioBuffer
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a channel count outside `1..=MAX_CHANNELS` or an invalid sample
    ///   rate
    /// - `NotSupported` for a zero length
    /// - `ResourceExhausted` when the samples cannot be allocated
    pub fn new(options: AudioBufferOptions) -> Result<Self, Error> {
        validate_number_of_channels(options.number_of_channels)?;
        validate_sample_rate(options.sample_rate)?;
        if options.length == 0 {
            return Err(Error::NotSupported(
                "AudioBuffer length should be at least 1".into(),
            ));
        }

        let channels = (0..options.number_of_channels)
            .map(|_| try_zeroed(options.length).map(Arc::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            channels,
            length: options.length,
            sample_rate: options.sample_rate,
        })
    }

    /// Convert raw samples to an AudioBuffer
    ///
    /// The outer Vec determines the channels. The inner Vecs should have the same length.
    ///
    /// # Panics
    ///
    /// This function will panic if the channels have different lengths.
    pub fn from(samples: Vec<Vec<f32>>, sample_rate: f32) -> Self {
        let length = samples.first().map_or(0, Vec::len);
        assert!(
            samples.iter().all(|c| c.len() == length),
            "channels of an AudioBuffer must have equal lengths"
        );

        Self {
            channels: samples.into_iter().map(Arc::from).collect(),
            length,
            sample_rate,
        }
    }

    /// Number of channels in this `AudioBuffer`
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel in this `AudioBuffer`
    pub fn length(&self) -> usize {
        self.length
    }

    /// Sample rate of this `AudioBuffer` in Hertz
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Duration in seconds of the `AudioBuffer`
    pub fn duration(&self) -> f64 {
        self.length as f64 / f64::from(self.sample_rate)
    }

    fn check_channel(&self, channel_number: usize) -> Result<(), Error> {
        if channel_number < self.number_of_channels() {
            Ok(())
        } else {
            Err(Error::index_size(
                "channel",
                channel_number,
                self.number_of_channels(),
            ))
        }
    }

    /// Copy data from a given channel to the given `destination`.
    pub fn copy_from_channel(&self, destination: &mut [f32], channel_number: usize) -> Result<(), Error> {
        self.copy_from_channel_with_offset(destination, channel_number, 0)
    }

    /// Copy data from a given channel to the given `destination`, starting at `offset`.
    ///
    /// Copies `min(length - offset, destination.len())` frames, the rest of `destination` is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// `IndexSize` when the channel does not exist or `offset` is past the end of the buffer
    pub fn copy_from_channel_with_offset(
        &self,
        destination: &mut [f32],
        channel_number: usize,
        offset: usize,
    ) -> Result<(), Error> {
        self.check_channel(channel_number)?;
        if offset > self.length {
            return Err(Error::index_size("offset", offset, self.length));
        }

        let source = &self.channels[channel_number][offset..];
        let count = source.len().min(destination.len());
        destination[..count].copy_from_slice(&source[..count]);

        Ok(())
    }

    /// Copy data from a given source to the given channel.
    pub fn copy_to_channel(&mut self, source: &[f32], channel_number: usize) -> Result<(), Error> {
        self.copy_to_channel_with_offset(source, channel_number, 0)
    }

    /// Copy data from a given source to the given channel, starting at `offset`.
    ///
    /// # Errors
    ///
    /// `IndexSize` when the channel does not exist or `offset` is past the end of the buffer
    pub fn copy_to_channel_with_offset(
        &mut self,
        source: &[f32],
        channel_number: usize,
        offset: usize,
    ) -> Result<(), Error> {
        self.check_channel(channel_number)?;
        if offset > self.length {
            return Err(Error::index_size("offset", offset, self.length));
        }

        // the channel may be in use on the render thread, write to a fresh copy
        let mut copy = self.channels[channel_number].to_vec();
        let count = source.len().min(self.length - offset);
        copy[offset..offset + count].copy_from_slice(&source[..count]);
        self.channels[channel_number] = Arc::from(copy);

        Ok(())
    }

    /// Return a read-only copy of the underlying data of the channel
    ///
    /// # Panics
    ///
    /// This function will panic if the given channel number is greater than or equal to the
    /// number of channels of this buffer
    pub fn get_channel_data(&self, channel_number: usize) -> &[f32] {
        &self.channels[channel_number]
    }

    /// Shared handles to the channel data, acquired by the render thread
    pub(crate) fn channels(&self) -> &[Arc<[f32]>] {
        &self.channels
    }
}
