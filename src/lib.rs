//! A real-time audio processing graph engine.
//!
//! A control thread builds and edits a graph of processing nodes while a separate render thread
//! pulls fixed-size blocks of samples through that graph. The render thread never blocks: when the
//! graph lock is contended it renders silence and picks up the pending edits at the next render
//! quantum.
//!
//! # Example
//! ```no_run
//! use web_audio_graph::context::{AudioContext, BaseAudioContext};
//! use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
//!
//! fn main() -> Result<(), web_audio_graph::Error> {
//!     let context = AudioContext::new(Default::default())?;
//!
//!     // play a constant offset through a gain node for one second
//!     let src = context.create_constant_source()?;
//!     src.offset().set_value(0.1);
//!     let gain = context.create_gain()?;
//!     gain.gain().linear_ramp_to_value_at_time(0., 1.)?;
//!
//!     src.connect(&gain)?;
//!     gain.connect(&context.destination())?;
//!     src.start()?;
//!     src.stop_at(1.)?;
//!
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     context.close_sync()
//! }
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Render quantum size, the audio graph is rendered in blocks of this size
pub const RENDER_QUANTUM_SIZE: usize = 128;

/// Maximum number of channels for audio processing
pub const MAX_CHANNELS: usize = 32;

/// Lowest sample rate a context or buffer accepts
pub(crate) const MIN_SAMPLE_RATE: f32 = 3000.;

/// Highest sample rate a context or buffer accepts
pub(crate) const MAX_SAMPLE_RATE: f32 = 384_000.;

pub mod buffer;
pub mod context;
pub mod media;
pub mod node;
pub mod param;
pub mod render;
pub mod spatial;

mod error;
pub use error::Error;

pub(crate) mod events;
pub use events::{ErrorEvent, Event};
pub(crate) mod io;

#[derive(Debug)]
#[doc(hidden)] // shared with the render thread, not part of the public API
pub struct AtomicF32 {
    inner: AtomicU32,
}

impl AtomicF32 {
    #[must_use]
    pub fn new(v: f32) -> Self {
        Self {
            inner: AtomicU32::new(u32::from_ne_bytes(v.to_ne_bytes())),
        }
    }

    #[must_use]
    pub fn load(&self) -> f32 {
        f32::from_ne_bytes(self.inner.load(Ordering::SeqCst).to_ne_bytes())
    }

    pub fn store(&self, v: f32) {
        self.inner
            .store(u32::from_ne_bytes(v.to_ne_bytes()), Ordering::SeqCst);
    }
}

#[derive(Debug)]
#[doc(hidden)]
pub struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    #[must_use]
    pub fn new(v: f64) -> Self {
        Self {
            inner: AtomicU64::new(u64::from_ne_bytes(v.to_ne_bytes())),
        }
    }

    #[must_use]
    pub fn load(&self) -> f64 {
        f64::from_ne_bytes(self.inner.load(Ordering::SeqCst).to_ne_bytes())
    }

    pub fn store(&self, v: f64) {
        self.inner
            .store(u64::from_ne_bytes(v.to_ne_bytes()), Ordering::SeqCst);
    }
}

/// Check the given number of channels is in the [1, 32] range
#[inline(always)]
pub(crate) fn validate_number_of_channels(number_of_channels: usize) -> Result<(), Error> {
    if number_of_channels > 0 && number_of_channels <= MAX_CHANNELS {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "number of channels ({}) should be in the range [1, {}]",
            number_of_channels, MAX_CHANNELS
        )))
    }
}

/// Check the sample rate is finite and inside the supported range
pub(crate) fn validate_sample_rate(sample_rate: f32) -> Result<(), Error> {
    if sample_rate.is_finite() && (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "sample rate ({}) should be in the range [{}, {}]",
            sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
        )))
    }
}

/// Check a time (or duration) value is finite and non-negative
pub(crate) fn validate_time_value(value: f64, name: &str) -> Result<(), Error> {
    if value.is_finite() && value >= 0. {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{} ({}) should be a finite non-negative number",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    #[test]
    fn test_atomic_f64() {
        let f = AtomicF64::new(2.0);
        assert_float_eq!(f.load(), 2.0, abs <= 0.);

        f.store(3.0);
        assert_float_eq!(f.load(), 3.0, abs <= 0.);
    }

    #[test]
    fn test_valid_number_of_channels() {
        assert!(validate_number_of_channels(1).is_ok());
        assert!(validate_number_of_channels(MAX_CHANNELS).is_ok());
        assert!(matches!(
            validate_number_of_channels(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(validate_number_of_channels(MAX_CHANNELS + 1).is_err());
    }

    #[test]
    fn test_valid_time_value() {
        assert!(validate_time_value(0., "when").is_ok());
        assert!(validate_time_value(-1., "when").is_err());
        assert!(validate_time_value(f64::NAN, "when").is_err());
        assert!(validate_time_value(f64::INFINITY, "when").is_err());
    }

    #[test]
    fn test_valid_sample_rate() {
        assert!(validate_sample_rate(48000.).is_ok());
        assert!(validate_sample_rate(2999.).is_err());
        assert!(validate_sample_rate(f32::NAN).is_err());
    }
}
