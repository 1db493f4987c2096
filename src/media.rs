//! Decoding of encoded audio files into an [`AudioBuffer`]
//!
//! Supports WAV (PCM integer and float) and Ogg/Vorbis. The container is sniffed from the magic
//! bytes, the file extension plays no role.

use std::io::{Cursor, Read};

use lewton::inside_ogg::OggStreamReader;

use crate::buffer::AudioBuffer;
use crate::Error;

const RIFF_MAGIC: &[u8] = b"RIFF";
const OGG_MAGIC: &[u8] = b"OggS";

/// Decode a complete WAV or Ogg/Vorbis stream
///
/// The returned buffer keeps the sample rate of the encoded media, playback through an
/// [`AudioBufferSourceNode`](crate::node::AudioBufferSourceNode) adjusts to the context rate.
///
/// # Errors
///
/// - `UnsupportedFormat` when the magic bytes are not recognized
/// - `Wav` / `Vorbis` on decoder failures
/// - `Io` when reading the input fails
///
/// # Example
///
/// ```no_run
/// let file = std::fs::File::open("samples/sample.wav").unwrap();
/// let buffer = web_audio_graph::media::decode_audio_data(file).unwrap();
/// println!("decoded {} seconds", buffer.duration());
/// ```
pub fn decode_audio_data<R: Read>(mut input: R) -> Result<AudioBuffer, Error> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;

    if bytes.starts_with(RIFF_MAGIC) {
        decode_wav(Cursor::new(bytes))
    } else if bytes.starts_with(OGG_MAGIC) {
        decode_ogg_vorbis(Cursor::new(bytes))
    } else {
        Err(Error::UnsupportedFormat(
            "expected a WAV or Ogg/Vorbis stream".into(),
        ))
    }
}

fn decode_wav(input: Cursor<Vec<u8>>) -> Result<AudioBuffer, Error> {
    let mut reader = hound::WavReader::new(input)?;
    let hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample,
        sample_format,
    } = reader.spec();
    let number_of_channels = usize::from(channels);
    let length = reader.duration() as usize;

    let interleaved: Vec<f32> = match sample_format {
        hound::SampleFormat::Int => {
            let scale = 1. / (1_u64 << (bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };

    // de-interleave
    let mut decoded = vec![Vec::with_capacity(length); number_of_channels];
    interleaved
        .chunks_exact(number_of_channels)
        .for_each(|frame| {
            decoded
                .iter_mut()
                .zip(frame)
                .for_each(|(channel, &s)| channel.push(s))
        });

    log::debug!(
        "Decoded WAV: {} channels, {} frames at {} Hz",
        number_of_channels,
        length,
        sample_rate
    );

    Ok(AudioBuffer::from(decoded, sample_rate as f32))
}

fn decode_ogg_vorbis(input: Cursor<Vec<u8>>) -> Result<AudioBuffer, Error> {
    let mut stream = OggStreamReader::new(input)?;
    let number_of_channels = usize::from(stream.ident_hdr.audio_channels);
    let sample_rate = stream.ident_hdr.audio_sample_rate as f32;

    let mut decoded: Vec<Vec<f32>> = vec![Vec::new(); number_of_channels];
    while let Some(packet) = stream.read_dec_packet_generic::<Vec<Vec<f32>>>()? {
        decoded
            .iter_mut()
            .zip(packet)
            .for_each(|(channel, samples)| channel.extend(samples));
    }

    log::debug!(
        "Decoded Ogg/Vorbis: {} channels, {} frames at {} Hz",
        number_of_channels,
        decoded.first().map_or(0, Vec::len),
        sample_rate
    );

    Ok(AudioBuffer::from(decoded, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    use float_eq::assert_float_eq;

    fn encode_wav(spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<Cursor<&mut Vec<u8>>>)) -> Vec<u8> {
        let mut bytes = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
            write(&mut writer);
            writer.finalize().unwrap();
        }
        bytes
    }

    #[test]
    fn test_decode_wav_int16() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = encode_wav(spec, |writer| {
            for i in 0..100_i16 {
                writer.write_sample(i * 100).unwrap();
                writer.write_sample(-i * 100).unwrap();
            }
        });

        let buffer = decode_audio_data(Cursor::new(bytes)).unwrap();
        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.length(), 100);
        assert_float_eq!(buffer.sample_rate(), 44100., abs <= 0.);

        assert_float_eq!(buffer.get_channel_data(0)[1], 100. / 32768., abs <= 1e-7);
        assert_float_eq!(buffer.get_channel_data(1)[1], -100. / 32768., abs <= 1e-7);
    }

    #[test]
    fn test_decode_wav_float() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let bytes = encode_wav(spec, |writer| {
            writer.write_sample(0.5_f32).unwrap();
            writer.write_sample(-0.25_f32).unwrap();
        });

        let buffer = decode_audio_data(bytes.as_slice()).unwrap();
        assert_float_eq!(
            buffer.get_channel_data(0)[..],
            [0.5, -0.25][..],
            abs_all <= 0.
        );
    }

    #[test]
    fn test_unsupported_format() {
        let result = decode_audio_data(&b"ID3 this is not a wav file"[..]);
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_corrupt_streams() {
        let result = decode_audio_data(&b"RIFF\0\0\0\0WAVE"[..]);
        assert!(matches!(result, Err(Error::Wav(_))));

        let result = decode_audio_data(&b"OggS garbage"[..]);
        assert!(result.is_err());
    }
}
