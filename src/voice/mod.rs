//! Audio pipeline
//!
//! Microphone capture into fixed-size PCM frames with echo, noise and gain
//! processing, silence detection for input-buffer commits, and a strictly
//! sequential playback queue for incoming audio.

mod capture;
mod frame;
mod playback;
mod processing;
mod silence;

pub use capture::{AudioCapture, AudioSource, CaptureOptions};
pub use frame::{
    AudioFrame, DEFAULT_FRAME_SAMPLES, FrameSlicer, SAMPLE_RATE, VAD_SAMPLE_RATE,
    decode_base64_audio, decode_pcm16, encode_pcm16, f32_to_i16, i16_to_f32, rms_i16,
};
pub use playback::{AudioSink, CpalSink, PlaybackActivity, PlaybackQueue};
pub use processing::{FrameProcessor, ProcessingOptions};
pub use silence::{SilenceConfig, SilenceDetector};
