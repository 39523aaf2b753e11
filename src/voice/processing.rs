//! Microphone signal processing
//!
//! Runs on every captured frame before it leaves the capture callback:
//! - echo suppression: attenuates the microphone while the speaker plays
//!   (half duplex, with a short tail for room reverb)
//! - noise suppression: a gate below a tracked noise floor
//! - auto gain: pulls speech toward a target level
//!
//! All stages are cheap per-frame gain decisions; nothing here allocates
//! beyond the processed frame itself.

use super::{AudioFrame, PlaybackActivity, f32_to_i16, i16_to_f32};

/// Microphone attenuation while the far end is audible
const ECHO_SUPPRESSION_GAIN: f32 = 0.05;

/// Suppression continues this long after playback stops, in milliseconds
const ECHO_TAIL_MS: u64 = 200;

/// Attenuation applied to frames under the noise gate
const NOISE_GATE_GAIN: f32 = 0.1;

/// Frames quieter than `floor * ratio` are treated as noise
const NOISE_GATE_RATIO: f32 = 2.0;

const MIN_NOISE_FLOOR: f32 = 0.000_5;
const MAX_NOISE_FLOOR: f32 = 0.02;

/// Per-frame upward drift of the noise floor estimate
const NOISE_FLOOR_RISE: f32 = 1.05;

/// RMS level auto gain steers speech toward
const TARGET_LEVEL: f32 = 0.1;

const MIN_GAIN: f32 = 0.5;
const MAX_GAIN: f32 = 8.0;

/// Fraction of the gain error corrected per frame
const GAIN_SMOOTHING: f32 = 0.3;

/// Which processing stages run on captured audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

impl ProcessingOptions {
    /// Raw capture with no processing
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain: false,
        }
    }

    /// Whether any stage is enabled
    #[must_use]
    pub const fn any(&self) -> bool {
        self.echo_cancellation || self.noise_suppression || self.auto_gain
    }
}

/// Per-capture-run processing state
#[derive(Debug)]
pub struct FrameProcessor {
    options: ProcessingOptions,
    far_end: Option<PlaybackActivity>,
    tail_samples: usize,
    tail_remaining: usize,
    noise_floor: f32,
    gain: f32,
}

impl FrameProcessor {
    /// Processor for frames at `sample_rate`
    ///
    /// Echo suppression needs a far-end reference; without one it stays off.
    #[must_use]
    pub fn new(options: ProcessingOptions, sample_rate: u32) -> Self {
        let tail_samples =
            usize::try_from(u64::from(sample_rate) * ECHO_TAIL_MS / 1000).unwrap_or(usize::MAX);
        Self {
            options,
            far_end: None,
            tail_samples,
            tail_remaining: 0,
            noise_floor: MIN_NOISE_FLOOR,
            gain: 1.0,
        }
    }

    /// Use playback activity as the echo reference
    #[must_use]
    pub fn with_far_end(mut self, activity: PlaybackActivity) -> Self {
        self.far_end = Some(activity);
        self
    }

    /// Stages that actually run
    #[must_use]
    pub const fn active(&self) -> ProcessingOptions {
        ProcessingOptions {
            echo_cancellation: self.options.echo_cancellation && self.far_end.is_some(),
            ..self.options
        }
    }

    /// Current auto gain multiplier
    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }

    /// Apply the enabled stages to one frame
    pub fn process(&mut self, frame: AudioFrame) -> AudioFrame {
        if !self.options.any() {
            return frame;
        }

        let energy = frame.energy();
        let echo = self.options.echo_cancellation && self.far_end_audible(frame.samples().len());

        let gain = if echo {
            ECHO_SUPPRESSION_GAIN
        } else if self.options.noise_suppression && self.is_noise(energy) {
            NOISE_GATE_GAIN
        } else if self.options.auto_gain {
            self.update_gain(energy)
        } else {
            1.0
        };

        if (gain - 1.0).abs() < f32::EPSILON {
            return frame;
        }
        let samples = frame
            .samples()
            .iter()
            .map(|&s| f32_to_i16(i16_to_f32(s) * gain))
            .collect();
        AudioFrame::new(frame.seq(), frame.sample_rate(), samples)
    }

    fn far_end_audible(&mut self, frame_samples: usize) -> bool {
        if self.far_end.as_ref().is_some_and(PlaybackActivity::is_active) {
            self.tail_remaining = self.tail_samples;
            return true;
        }
        if self.tail_remaining > 0 {
            self.tail_remaining = self.tail_remaining.saturating_sub(frame_samples);
            return true;
        }
        false
    }

    /// Gate decision against the floor, then track the floor
    fn is_noise(&mut self, energy: f32) -> bool {
        let noise = energy < self.noise_floor * NOISE_GATE_RATIO;
        self.noise_floor = if energy < self.noise_floor {
            energy.max(MIN_NOISE_FLOOR)
        } else {
            (self.noise_floor * NOISE_FLOOR_RISE).min(MAX_NOISE_FLOOR)
        };
        noise
    }

    fn update_gain(&mut self, energy: f32) -> f32 {
        if energy > MIN_NOISE_FLOOR {
            let desired = (TARGET_LEVEL / energy).clamp(MIN_GAIN, MAX_GAIN);
            self.gain += (desired - self.gain) * GAIN_SMOOTHING;
        }
        self.gain
    }
}
