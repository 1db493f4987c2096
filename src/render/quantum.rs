//! Signal buffers passed between nodes during a render quantum
use arrayvec::ArrayVec;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use crate::node::ChannelInterpretation;
use crate::{MAX_CHANNELS, RENDER_QUANTUM_SIZE};

type ChannelStorage = Arc<[f32; RENDER_QUANTUM_SIZE]>;

/// Shared all-zero block, every silent channel points here
fn silence_storage() -> &'static ChannelStorage {
    static SILENCE: OnceLock<ChannelStorage> = OnceLock::new();
    SILENCE.get_or_init(|| Arc::new([0.; RENDER_QUANTUM_SIZE]))
}

/// Single channel of a render quantum
///
/// Derefs to a (mutable) slice of `RENDER_QUANTUM_SIZE` samples. Clones share storage and the
/// first write through a shared clone copies it, so handing a block downstream is `O(1)`.
#[derive(Clone, Debug)]
pub struct AudioRenderQuantumChannel {
    data: ChannelStorage,
}

impl AudioRenderQuantumChannel {
    pub(crate) fn silence() -> Self {
        Self {
            data: Arc::clone(silence_storage()),
        }
    }

    /// `O(1)` check if this channel points at the shared silence block
    ///
    /// If this function returns false, it is still possible for all samples to be zero.
    pub fn is_silent(&self) -> bool {
        Arc::ptr_eq(&self.data, silence_storage())
    }

    /// True when both channels share the same storage
    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub(crate) fn add(&mut self, other: &Self) {
        if other.is_silent() {
            return;
        }
        if self.is_silent() {
            *self = other.clone();
        } else {
            self.iter_mut().zip(other.iter()).for_each(|(a, b)| *a += b);
        }
    }
}

impl Deref for AudioRenderQuantumChannel {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.data[..]
    }
}

impl DerefMut for AudioRenderQuantumChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut Arc::make_mut(&mut self.data)[..]
    }
}

impl AsRef<[f32]> for AudioRenderQuantumChannel {
    fn as_ref(&self) -> &[f32] {
        &self.data[..]
    }
}

/// Block of `RENDER_QUANTUM_SIZE` sample frames with one to `MAX_CHANNELS` channels
///
/// Cheap to clone, see [`AudioRenderQuantumChannel`].
#[derive(Clone, Debug)]
pub struct AudioRenderQuantum {
    channels: ArrayVec<AudioRenderQuantumChannel, MAX_CHANNELS>,
}

impl AudioRenderQuantum {
    /// Silent block with the given number of channels
    pub(crate) fn silence(number_of_channels: usize) -> Self {
        let mut channels = ArrayVec::new();
        let n = number_of_channels.clamp(1, MAX_CHANNELS);
        (0..n).for_each(|_| channels.push(AudioRenderQuantumChannel::silence()));
        Self { channels }
    }

    /// Number of channels in this block
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Resize to `n` channels, new channels are silent
    ///
    /// `n` is clamped to the [1, `MAX_CHANNELS`] range.
    pub fn set_number_of_channels(&mut self, n: usize) {
        let n = n.clamp(1, MAX_CHANNELS);
        while self.channels.len() < n {
            self.channels.push(AudioRenderQuantumChannel::silence());
        }
        self.channels.truncate(n);
    }

    /// Get the samples from this specific channel.
    ///
    /// # Panics
    /// Panics if the index is greater than the available number of channels
    pub fn channel_data(&self, index: usize) -> &AudioRenderQuantumChannel {
        &self.channels[index]
    }

    /// Get the samples (mutable) from this specific channel.
    ///
    /// # Panics
    /// Panics if the index is greater than the available number of channels
    pub fn channel_data_mut(&mut self, index: usize) -> &mut AudioRenderQuantumChannel {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> &[AudioRenderQuantumChannel] {
        &self.channels[..]
    }

    pub fn channels_mut(&mut self) -> &mut [AudioRenderQuantumChannel] {
        &mut self.channels[..]
    }

    /// `O(1)` check if every channel is the shared silence block
    pub fn is_silent(&self) -> bool {
        self.channels.iter().all(AudioRenderQuantumChannel::is_silent)
    }

    /// Turn every channel into silence, keeping the channel count
    pub fn make_silent(&mut self) {
        self.channels
            .iter_mut()
            .for_each(|c| *c = AudioRenderQuantumChannel::silence());
    }

    /// Sum `other` into this block
    ///
    /// `other` is first up/down-mixed to this block's channel count.
    pub(crate) fn add(&mut self, other: &Self, interpretation: ChannelInterpretation) {
        if other.is_silent() {
            return;
        }
        let target = self.number_of_channels();
        if other.number_of_channels() == target {
            self.channels
                .iter_mut()
                .zip(other.channels.iter())
                .for_each(|(s, o)| s.add(o));
        } else {
            let mut mixed = other.clone();
            mixed.mix(target, interpretation);
            self.channels
                .iter_mut()
                .zip(mixed.channels.iter())
                .for_each(|(s, o)| s.add(o));
        }
    }

    /// Up/down-mix to the desired number of channels
    pub(crate) fn mix(&mut self, number_of_channels: usize, interpretation: ChannelInterpretation) {
        let from = self.number_of_channels();
        let to = number_of_channels.clamp(1, MAX_CHANNELS);
        if from == to {
            return;
        }

        // only mono, stereo, quad and 5.1 have a speaker layout, everything else mixes discretely
        let layout = |n: usize| matches!(n, 1 | 2 | 4 | 6);
        if interpretation == ChannelInterpretation::Discrete || !layout(from) || !layout(to) {
            self.set_number_of_channels(to);
            return;
        }

        if to > from {
            self.speaker_up_mix(from, to);
        } else {
            self.speaker_down_mix(from, to);
        }
        debug_assert_eq!(self.number_of_channels(), to);
    }

    fn speaker_up_mix(&mut self, from: usize, to: usize) {
        // for every output channel, the input channel it copies (None = silence)
        let routing: &[Option<usize>] = match (from, to) {
            (1, 2) => &[Some(0), Some(0)],
            (1, 4) => &[Some(0), Some(0), None, None],
            (1, 6) => &[None, None, Some(0), None, None, None],
            (2, 4) => &[Some(0), Some(1), None, None],
            (2, 6) => &[Some(0), Some(1), None, None, None, None],
            (4, 6) => &[Some(0), Some(1), None, None, Some(2), Some(3)],
            _ => unreachable!("no speaker up-mix from {} to {} channels", from, to),
        };

        let input = std::mem::take(&mut self.channels);
        self.channels = routing
            .iter()
            .map(|source| match source {
                Some(i) => input[*i].clone(),
                None => AudioRenderQuantumChannel::silence(),
            })
            .collect();
    }

    fn speaker_down_mix(&mut self, from: usize, to: usize) {
        const SQRT_HALF: f32 = std::f32::consts::FRAC_1_SQRT_2;

        // gains per output channel, indexed by input channel
        let matrix: &[&[f32]] = match (from, to) {
            (2, 1) => &[&[0.5, 0.5]],
            (4, 1) => &[&[0.25, 0.25, 0.25, 0.25]],
            (6, 1) => &[&[SQRT_HALF, SQRT_HALF, 1., 0., 0.5, 0.5]],
            (4, 2) => &[&[0.5, 0., 0.5, 0.], &[0., 0.5, 0., 0.5]],
            (6, 2) => &[
                &[1., 0., SQRT_HALF, 0., SQRT_HALF, 0.],
                &[0., 1., SQRT_HALF, 0., 0., SQRT_HALF],
            ],
            (6, 4) => &[
                &[1., 0., SQRT_HALF, 0., 0., 0.],
                &[0., 1., SQRT_HALF, 0., 0., 0.],
                &[0., 0., 0., 0., 1., 0.],
                &[0., 0., 0., 0., 0., 1.],
            ],
            _ => unreachable!("no speaker down-mix from {} to {} channels", from, to),
        };

        let input = std::mem::take(&mut self.channels);
        self.channels = matrix
            .iter()
            .map(|gains| {
                let mut out = AudioRenderQuantumChannel::silence();
                for (channel, &gain) in input.iter().zip(gains.iter()) {
                    if gain == 0. || channel.is_silent() {
                        continue;
                    }
                    if gain == 1. && out.is_silent() {
                        out = channel.clone();
                        continue;
                    }
                    out.iter_mut()
                        .zip(channel.iter())
                        .for_each(|(o, i)| *o += gain * i);
                }
                out
            })
            .collect();
    }
}
