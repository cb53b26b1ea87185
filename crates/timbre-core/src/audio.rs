//! Audio clips moved between the cache and the engine.
//!
//! Decoding goes through symphonia, so engine output in any enabled container
//! (FLAC, WAV) is accepted. Encoding always writes 16-bit PCM WAV via hound.

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Audio samples normalized to -1.0..=1.0, interleaved by channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("unrecognized audio format")]
    UnknownFormat(#[source] SymphoniaError),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("stream does not declare a sample rate")]
    NoSampleRate,

    #[error("audio decoding failed")]
    Decode(#[source] SymphoniaError),

    #[error("WAV encoding failed")]
    Encode(#[from] hound::Error),
}

/// Encode a clip as a 16-bit PCM WAV file.
pub fn encode_wav(clip: &AudioClip) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: clip.channels.max(1),
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Vec::with_capacity(44 + clip.samples.len() * 2);
    {
        let mut cursor = Cursor::new(&mut buffer);
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in &clip.samples {
            let s = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
            writer.write_sample((s * i16::MAX as f32).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(buffer)
}

/// Decode a whole audio file held in memory.
///
/// `extension` is only a format hint; the container is detected from its
/// contents.
pub fn decode_audio(bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioClip, AudioError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let detected = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(AudioError::UnknownFormat)?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoTrack)?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(AudioError::Decode)?;

    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map(|c| c.count() as u16);
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(AudioError::Decode(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).map_err(AudioError::Decode)?;
        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        channels.get_or_insert(spec.channels.count() as u16);

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    Ok(AudioClip {
        samples,
        channels: channels.unwrap_or(1),
        sample_rate: sample_rate.ok_or(AudioError::NoSampleRate)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One 32-sample mono frame at 32 kHz: a ramp from -16000 to 15000.
    const FLAC_RAMP: &[u8] = include_bytes!("../../../testdata/tone_32k_mono.flac");

    #[test]
    fn encode_wav_produces_riff_header() {
        let wav = encode_wav(&AudioClip::mono(vec![0.0; 100], 16000)).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 200);
    }

    #[test]
    fn wav_keeps_rate_and_shape() {
        let clip = AudioClip {
            samples: vec![0.0, 0.5, -0.5, 0.25, 1.0, -1.0],
            channels: 2,
            sample_rate: 32000,
        };
        let decoded = decode_audio(encode_wav(&clip).unwrap(), Some("wav")).unwrap();
        assert_eq!(decoded.sample_rate, 32000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.frames(), 3);
        for (a, b) in clip.samples.iter().zip(&decoded.samples) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let wav = encode_wav(&AudioClip::mono(vec![2.0, f32::NAN], 8000)).unwrap();
        let decoded = decode_audio(wav, None).unwrap();
        assert!((decoded.samples[0] - 1.0).abs() < 1e-3);
        assert_eq!(decoded.samples[1], 0.0);
    }

    #[test]
    fn decodes_flac() {
        let clip = decode_audio(FLAC_RAMP.to_vec(), Some("flac")).unwrap();
        assert_eq!(clip.sample_rate, 32000);
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.frames(), 32);
        assert!(clip.samples[0] < 0.0);
        assert!(clip.samples[31] > 0.0);
        assert!(clip.samples.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn container_is_detected_from_contents() {
        let clip = decode_audio(FLAC_RAMP.to_vec(), Some("wav")).unwrap();
        assert_eq!(clip.frames(), 32);
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_audio(b"not audio at all".to_vec(), None).unwrap_err();
        assert!(matches!(err, AudioError::UnknownFormat(_)), "{err:?}");
    }
}
