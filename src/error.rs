/// Errors surfaced to the control thread
///
/// Lock contention on the render thread is never reported here, it is resolved by rendering
/// silence for the quantum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An output, input or parameter index is out of bounds
    #[error("IndexSizeError - {kind} index {index} is out of bounds (len {len})")]
    IndexSize {
        /// Which port list was indexed
        kind: &'static str,
        /// The requested index
        index: usize,
        /// Number of ports available
        len: usize,
    },

    /// Malformed argument: negative or non-finite times, bad channel counts, invalid ramp targets
    #[error("InvalidArgument - {0}")]
    InvalidArgument(String),

    /// The node kind does not support the requested configuration
    #[error("NotSupportedError - {0}")]
    NotSupported(String),

    /// The referenced connection or object is not accessible from here
    #[error("InvalidAccessError - {0}")]
    InvalidAccess(String),

    /// The object is not in a state that allows the operation
    #[error("InvalidStateError - {0}")]
    InvalidState(String),

    /// A signal buffer could not be allocated, no object was constructed
    #[error("ResourceExhausted - {0}")]
    ResourceExhausted(String),

    /// WAV decoding failed
    #[error("WAV decoding error: {0}")]
    Wav(#[from] hound::Error),

    /// Ogg/Vorbis decoding failed
    #[error("Vorbis decoding error: {0}")]
    Vorbis(#[from] lewton::VorbisError),

    /// The encoded media format was not recognized
    #[error("EncodingError - {0}")]
    UnsupportedFormat(String),

    /// I/O failure while reading encoded media
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn index_size(kind: &'static str, index: usize, len: usize) -> Self {
        Self::IndexSize { kind, index, len }
    }

    pub(crate) fn closed() -> Self {
        Self::InvalidState("the audio context is closed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::index_size("output", 3, 1);
        assert_eq!(
            err.to_string(),
            "IndexSizeError - output index 3 is out of bounds (len 1)"
        );

        let err = Error::closed();
        assert!(err.to_string().starts_with("InvalidStateError"));
    }
}
