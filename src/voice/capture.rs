//! Audio capture from microphone
//!
//! cpal streams are not `Send`, so each capture run owns its stream on a
//! dedicated thread. The data callback slices device samples into
//! [`AudioFrame`]s, runs them through a [`FrameProcessor`] and hands them
//! off with `try_send`; it never blocks.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::{
    AudioFrame, DEFAULT_FRAME_SAMPLES, FrameProcessor, FrameSlicer, PlaybackActivity,
    ProcessingOptions, SAMPLE_RATE,
};
use crate::{Error, Result};

/// Source of captured audio frames
///
/// Exactly one capture run is live at a time. Pausing keeps the device
/// handle for a fast resume; `stop` releases it.
#[async_trait]
pub trait AudioSource: Send {
    /// Acquire the device and start emitting frames into `frames`
    async fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()>;

    /// Pause or resume a running capture without releasing the device
    fn set_paused(&mut self, paused: bool) -> Result<()>;

    /// Stop capturing and release the device
    fn stop(&mut self) -> Result<()>;

    /// Whether a capture run currently holds the device
    fn is_capturing(&self) -> bool;

    /// Capture sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Processing stages applied to emitted frames
    fn processing(&self) -> ProcessingOptions {
        ProcessingOptions::disabled()
    }
}

/// Capture stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Negotiated sample rate
    pub sample_rate: u32,
    /// Mono samples per emitted frame
    pub frame_samples: usize,
    /// Echo, noise and gain stages; all on by default
    pub processing: ProcessingOptions,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            processing: ProcessingOptions::default(),
        }
    }
}

enum Control {
    Pause,
    Resume,
    Stop,
}

struct Running {
    control: std_mpsc::Sender<Control>,
    thread: JoinHandle<()>,
}

/// Joins finished capture threads without blocking the async runtime
///
/// The next capture run waits for the previous device release first, so a
/// device is never held twice.
#[derive(Default)]
struct Release {
    pending: Option<tokio::task::JoinHandle<()>>,
}

impl Release {
    /// Hand a signalled thread off to be joined
    fn begin(&mut self, thread: JoinHandle<()>) -> Result<()> {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.pending = Some(runtime.spawn_blocking(move || {
                    if thread.join().is_err() {
                        tracing::warn!("capture thread panicked");
                    }
                }));
                Ok(())
            }
            Err(_) => thread
                .join()
                .map_err(|_| Error::Device("capture thread panicked".to_string())),
        }
    }

    /// Wait until the last released device is closed
    async fn wait(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.await;
        }
    }
}

/// Captures audio from the default input device
pub struct AudioCapture {
    options: CaptureOptions,
    far_end: Option<PlaybackActivity>,
    running: Option<Running>,
    release: Release,
}

impl AudioCapture {
    /// Create a capture source; the device is opened on `start`
    #[must_use]
    pub fn new(options: CaptureOptions) -> Self {
        Self {
            options,
            far_end: None,
            running: None,
            release: Release::default(),
        }
    }

    /// Suppress the microphone while this playback is audible
    #[must_use]
    pub fn with_echo_reference(mut self, activity: PlaybackActivity) -> Self {
        self.far_end = Some(activity);
        self
    }

    fn processor(&self) -> FrameProcessor {
        let processor = FrameProcessor::new(self.options.processing, self.options.sample_rate);
        match &self.far_end {
            Some(activity) => processor.with_far_end(activity.clone()),
            None => processor,
        }
    }
}

#[async_trait]
impl AudioSource for AudioCapture {
    async fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.release.wait().await;

        let options = self.options;
        let processor = self.processor();
        let (control_tx, control_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("voicewire-capture".to_string())
            .spawn(move || run_capture(options, processor, frames, control_rx, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                self.running = Some(Running {
                    control: control_tx,
                    thread,
                });
                tracing::debug!(
                    sample_rate = options.sample_rate,
                    processing = ?self.processing(),
                    "audio capture started"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Device("capture thread exited during startup".to_string()))
            }
        }
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        let Some(running) = &self.running else {
            return Ok(());
        };
        let control = if paused { Control::Pause } else { Control::Resume };
        running
            .control
            .send(control)
            .map_err(|_| Error::Device("capture thread is gone".to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.control.send(Control::Stop);
        self.release.begin(running.thread)?;

        tracing::debug!("audio capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.is_some()
    }

    fn sample_rate(&self) -> u32 {
        self.options.sample_rate
    }

    fn processing(&self) -> ProcessingOptions {
        self.processor().active()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to release capture device");
        }
    }
}

/// Owns the cpal stream for one capture run
fn run_capture(
    options: CaptureOptions,
    processor: FrameProcessor,
    frames: mpsc::Sender<AudioFrame>,
    control: std_mpsc::Receiver<Control>,
    ready: oneshot::Sender<Result<()>>,
) {
    let stream = match open_stream(options, processor, frames) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(classify(&e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    // A dropped sender also ends the run
    while let Ok(cmd) = control.recv() {
        let result = match cmd {
            Control::Pause => stream.pause().map_err(|e| e.to_string()),
            Control::Resume => stream.play().map_err(|e| e.to_string()),
            Control::Stop => break,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "capture stream control failed");
        }
    }

    drop(stream);
}

fn open_stream(
    options: CaptureOptions,
    mut processor: FrameProcessor,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let rate = SampleRate(options.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| classify(&e.to_string()))?
        .collect::<Vec<_>>();

    let supported_config = supported
        .iter()
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            // Fallback: any channel count, downmixed by the slicer
            supported
                .iter()
                .find(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        })
        .ok_or_else(|| {
            Error::Device(format!(
                "no input config supports {} Hz",
                options.sample_rate
            ))
        })?
        .clone();

    let config: StreamConfig = supported_config.with_sample_rate(rate).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = options.sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    let mut slicer = FrameSlicer::new(options.sample_rate, config.channels, options.frame_samples);
    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in slicer.push(data) {
                    if frames.try_send(processor.process(frame)).is_err() {
                        tracing::trace!("capture queue full, dropping frame");
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| classify(&e.to_string()))
}

/// Separate access denial from hardware failure
///
/// cpal reports both through backend-specific strings.
fn classify(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not permitted")
        || lower.contains("not authorized")
    {
        Error::Permission(message.to_string())
    } else {
        Error::Device(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permission_errors() {
        assert!(matches!(
            classify("Permission denied (os error 13)"),
            Error::Permission(_)
        ));
        assert!(matches!(
            classify("Operation not permitted"),
            Error::Permission(_)
        ));
    }

    #[test]
    fn classifies_device_errors() {
        assert!(matches!(
            classify("The requested device is no longer available"),
            Error::Device(_)
        ));
    }

    #[test]
    fn default_options_match_realtime_format() {
        let options = CaptureOptions::default();
        assert_eq!(options.sample_rate, 24_000);
        assert_eq!(options.frame_samples, 4096);
        assert_eq!(options.processing, ProcessingOptions::default());
    }

    #[test]
    fn reports_active_processing() {
        let capture = AudioCapture::new(CaptureOptions::default());
        let processing = capture.processing();
        assert!(!processing.echo_cancellation);
        assert!(processing.noise_suppression);
        assert!(processing.auto_gain);

        let capture = AudioCapture::new(CaptureOptions::default())
            .with_echo_reference(PlaybackActivity::default());
        assert_eq!(capture.processing(), ProcessingOptions::default());

        let raw = CaptureOptions {
            processing: ProcessingOptions::disabled(),
            ..CaptureOptions::default()
        };
        assert!(!AudioCapture::new(raw).processing().any());
    }

    #[tokio::test]
    async fn release_does_not_block_the_caller() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let closed = Arc::new(AtomicBool::new(false));
        let thread = {
            let closed = Arc::clone(&closed);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                closed.store(true, Ordering::SeqCst);
            })
        };

        let mut release = Release::default();
        release.begin(thread).unwrap();
        assert!(!closed.load(Ordering::SeqCst));

        release.wait().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn release_outside_runtime_joins_inline() {
        let mut release = Release::default();
        release.begin(std::thread::spawn(|| {})).unwrap();
        assert!(release.pending.is_none());
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut capture = AudioCapture::new(CaptureOptions::default());
        assert!(!capture.is_capturing());
        assert!(capture.stop().is_ok());
        assert!(capture.set_paused(true).is_ok());
    }
}
