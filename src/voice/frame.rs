//! PCM audio frames and wire encoding
//!
//! Frames are mono 16-bit PCM. On the wire they travel either as raw
//! little-endian bytes or base64-encoded inside JSON control events.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Capture/output sample rate for the realtime service (24kHz)
pub const SAMPLE_RATE: u32 = 24_000;

/// Capture sample rate for VAD-bearing paths (16kHz)
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Samples per capture callback slice
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

/// Immutable block of captured mono PCM, tagged with production order
#[derive(Debug, Clone)]
pub struct AudioFrame {
    seq: u64,
    sample_rate: u32,
    samples: Arc<[i16]>,
}

impl AudioFrame {
    /// Create a frame from 16-bit samples
    #[must_use]
    pub fn new(seq: u64, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            seq,
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Production order of this frame within its capture run
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Playback duration of this frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let micros = self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate);
        Duration::from_micros(micros)
    }

    /// RMS energy normalized to `[0.0, 1.0]`
    #[must_use]
    pub fn energy(&self) -> f32 {
        rms_i16(&self.samples)
    }

    /// Encode as 16-bit little-endian PCM bytes
    #[must_use]
    pub fn to_pcm16_bytes(&self) -> Vec<u8> {
        encode_pcm16(&self.samples)
    }

    /// Encode as base64 PCM for JSON control messages
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_pcm16_bytes())
    }
}

/// Encode samples as 16-bit little-endian PCM
#[must_use]
pub fn encode_pcm16(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode 16-bit little-endian PCM bytes
///
/// # Errors
///
/// Returns error if the buffer is empty or has an odd byte length
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.is_empty() {
        return Err(Error::Audio("empty audio buffer".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(Error::Audio(format!(
            "truncated pcm16 buffer ({} bytes)",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a base64 audio payload into raw PCM bytes
///
/// # Errors
///
/// Returns error if the payload is not valid base64
pub fn decode_base64_audio(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload)
        .map_err(|e| Error::Audio(format!("invalid base64 audio: {e}")))
}

/// Convert an f32 sample in `[-1.0, 1.0]` to i16
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert an i16 sample to f32 in `[-1.0, 1.0]`
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Calculate RMS energy of 16-bit samples, normalized
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = i16_to_f32(s);
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Accumulates interleaved device samples into fixed-size mono frames
#[derive(Debug)]
pub struct FrameSlicer {
    sample_rate: u32,
    channels: usize,
    frame_samples: usize,
    pending: Vec<i16>,
    next_seq: u64,
}

impl FrameSlicer {
    /// Create a slicer emitting frames of `frame_samples` mono samples
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            sample_rate,
            channels: usize::from(channels.max(1)),
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            next_seq: 0,
        }
    }

    /// Push interleaved f32 device samples, returning any completed frames
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, data: &[f32]) -> Vec<AudioFrame> {
        if self.channels == 1 {
            self.pending.extend(data.iter().map(|&s| f32_to_i16(s)));
        } else {
            // Downmix by averaging channels
            let channels = self.channels as f32;
            self.pending.extend(
                data.chunks(self.channels)
                    .map(|frame| f32_to_i16(frame.iter().sum::<f32>() / channels)),
            );
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame::new(self.next_seq, self.sample_rate, samples));
            self.next_seq += 1;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_is_little_endian() {
        let bytes = encode_pcm16(&[1, -2, 0x1234]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xfe, 0xff, 0x34, 0x12]);
        assert_eq!(decode_pcm16(&bytes).unwrap(), vec![1, -2, 0x1234]);
    }

    #[test]
    fn odd_length_buffer_is_rejected() {
        assert!(decode_pcm16(&[0x01, 0x02, 0x03]).is_err());
        assert!(decode_pcm16(&[]).is_err());
    }

    #[test]
    fn base64_payload_decodes_to_pcm() {
        let frame = AudioFrame::new(0, SAMPLE_RATE, vec![100, -100, 7]);
        let bytes = decode_base64_audio(&frame.to_base64()).unwrap();
        assert_eq!(bytes, frame.to_pcm16_bytes());
        assert!(decode_base64_audio("not base64!!").is_err());
    }

    #[test]
    fn frame_duration_follows_sample_rate() {
        let frame = AudioFrame::new(0, SAMPLE_RATE, vec![0; 2400]);
        assert_eq!(frame.duration(), Duration::from_millis(100));

        let frame = AudioFrame::new(0, VAD_SAMPLE_RATE, vec![0; 1600]);
        assert_eq!(frame.duration(), Duration::from_millis(100));
    }

    #[test]
    fn energy_of_silence_and_tone() {
        assert!(AudioFrame::new(0, SAMPLE_RATE, vec![0; 256]).energy() < 0.001);
        assert!(AudioFrame::new(0, SAMPLE_RATE, vec![16_000; 256]).energy() > 0.4);
    }

    #[test]
    fn slicer_emits_fixed_frames_in_order() {
        let mut slicer = FrameSlicer::new(SAMPLE_RATE, 1, 4);
        assert!(slicer.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = slicer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq(), 0);
        assert_eq!(frames[1].seq(), 1);
        assert_eq!(frames[0].samples().len(), 4);

        // One sample left over for the next push
        let frames = slicer.push(&[0.0, 0.0, 0.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq(), 2);
    }

    #[test]
    fn slicer_downmixes_stereo() {
        let mut slicer = FrameSlicer::new(SAMPLE_RATE, 2, 2);
        let frames = slicer.push(&[0.5, -0.5, 1.0, 0.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples()[0], 0);
        assert_eq!(frames[0].samples()[1], f32_to_i16(0.5));
    }
}
