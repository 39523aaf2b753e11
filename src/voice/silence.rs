//! Energy-based end-of-utterance detection
//!
//! Counts consecutive low-energy audio after a settle delay and signals once
//! the configured silence duration is reached. The signal tells the session
//! to commit the current input buffer upstream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AudioFrame;

/// Silence detector tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceConfig {
    /// RMS energy below which a frame counts as silent
    pub threshold: f32,
    /// Consecutive silence required before signalling
    pub silence_duration: Duration,
    /// Audio ignored right after capture starts
    pub settle_delay: Duration,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_duration: Duration::from_millis(1500),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// Tracks consecutive silent audio per capture run
#[derive(Debug)]
pub struct SilenceDetector {
    config: SilenceConfig,
    elapsed_samples: u64,
    silent_samples: u64,
    armed: bool,
}

impl SilenceDetector {
    /// Create a detector with the given tuning
    #[must_use]
    pub const fn new(config: SilenceConfig) -> Self {
        Self {
            config,
            elapsed_samples: 0,
            silent_samples: 0,
            armed: false,
        }
    }

    /// Feed one frame; returns true exactly once per detected silence
    pub fn process(&mut self, frame: &AudioFrame) -> bool {
        let rate = frame.sample_rate();
        let len = frame.samples().len() as u64;

        // Frames starting inside the settle window are ignored entirely
        let settled = self.elapsed_samples >= samples_for(self.config.settle_delay, rate);
        self.elapsed_samples += len;
        if !settled {
            return false;
        }

        let energy = frame.energy();
        if energy > self.config.threshold {
            self.armed = true;
            self.silent_samples = 0;
            return false;
        }

        // Silence only counts after speech since the last signal
        if !self.armed {
            return false;
        }

        self.silent_samples += len;
        if self.silent_samples >= samples_for(self.config.silence_duration, rate) {
            tracing::debug!(
                silent_ms = self.config.silence_duration.as_millis(),
                "silence detected"
            );
            self.silent_samples = 0;
            self.armed = false;
            return true;
        }

        false
    }

    /// Restart settle timing and counters (new capture run)
    pub const fn reset(&mut self) {
        self.elapsed_samples = 0;
        self.silent_samples = 0;
        self.armed = false;
    }

    /// Whether speech has been heard since the last signal
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Current tuning
    #[must_use]
    pub const fn config(&self) -> &SilenceConfig {
        &self.config
    }
}

#[allow(clippy::cast_possible_truncation)]
fn samples_for(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_millis() as u64) * u64::from(sample_rate) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::VAD_SAMPLE_RATE;

    // 100ms frames at 16kHz
    fn silent(seq: u64) -> AudioFrame {
        AudioFrame::new(seq, VAD_SAMPLE_RATE, vec![0; 1600])
    }

    fn loud(seq: u64) -> AudioFrame {
        AudioFrame::new(seq, VAD_SAMPLE_RATE, vec![8000; 1600])
    }

    #[test]
    fn settle_window_is_ignored() {
        let mut detector = SilenceDetector::new(SilenceConfig::default());
        for seq in 0..5 {
            assert!(!detector.process(&loud(seq)));
        }
        assert!(!detector.is_armed());

        detector.process(&loud(5));
        assert!(detector.is_armed());
    }

    #[test]
    fn never_fires_without_speech() {
        let mut detector = SilenceDetector::new(SilenceConfig::default());
        for seq in 0..100 {
            assert!(!detector.process(&silent(seq)));
        }
    }

    #[test]
    fn fires_at_exact_duration() {
        let mut detector = SilenceDetector::new(SilenceConfig::default());
        let mut seq = 0;
        for _ in 0..6 {
            detector.process(&loud(seq));
            seq += 1;
        }

        for _ in 0..14 {
            assert!(!detector.process(&silent(seq)));
            seq += 1;
        }
        assert!(detector.process(&silent(seq)));
    }

    #[test]
    fn speech_resets_silence_count() {
        let mut detector = SilenceDetector::new(SilenceConfig::default());
        let mut seq = 0;
        for _ in 0..6 {
            detector.process(&loud(seq));
            seq += 1;
        }
        for _ in 0..10 {
            assert!(!detector.process(&silent(seq)));
            seq += 1;
        }
        detector.process(&loud(seq));
        seq += 1;
        for _ in 0..14 {
            assert!(!detector.process(&silent(seq)));
            seq += 1;
        }
        assert!(detector.process(&silent(seq)));
    }

    #[test]
    fn reset_restarts_settle() {
        let mut detector = SilenceDetector::new(SilenceConfig::default());
        for seq in 0..8 {
            detector.process(&loud(seq));
        }
        assert!(detector.is_armed());

        detector.reset();
        assert!(!detector.is_armed());
        detector.process(&loud(0));
        assert!(!detector.is_armed());
    }
}
