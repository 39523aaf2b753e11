//! Sequential audio playback
//!
//! Incoming audio is queued as raw PCM16 byte buffers and played strictly in
//! order: the next buffer is not dequeued until the sink reports the previous
//! one has ended.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{Notify, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{SAMPLE_RATE, decode_pcm16, i16_to_f32};
use crate::{Error, Result};

/// Extra wait past a buffer's length before giving up on the device
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Output device abstraction
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play samples; resolves once playback of this buffer has ended
    async fn play(&self, samples: Vec<i16>) -> Result<()>;

    /// Cut the current buffer short
    fn stop(&self);
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Vec<u8>>,
    playing: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Notify,
    /// Bumped by every reset while the state lock is held
    epoch: watch::Sender<u64>,
    /// Mirror of `playing` readable without the lock
    active: Arc<AtomicBool>,
    sink: Arc<dyn AudioSink>,
    played: AtomicU64,
    skipped: AtomicU64,
}

impl Inner {
    /// Pop the next buffer with the reset epoch it was queued under
    fn next_item(&self) -> Option<(Vec<u8>, u64)> {
        let mut state = self.state.lock().ok()?;
        let item = state.items.pop_front();
        state.playing = item.is_some();
        self.active.store(state.playing, Ordering::Release);
        item.map(|item| (item, *self.epoch.borrow()))
    }

    fn set_idle(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.playing = false;
        }
        self.active.store(false, Ordering::Release);
    }
}

/// Lock-free view of whether the queue is playing
///
/// Read from the capture callback for echo suppression.
#[derive(Debug, Clone, Default)]
pub struct PlaybackActivity(Arc<AtomicBool>);

impl PlaybackActivity {
    /// Wrap a flag maintained elsewhere
    #[must_use]
    pub const fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    /// Whether a buffer is playing right now
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// FIFO playback queue driving an [`AudioSink`]
///
/// Owned by the session controller; `init` starts the worker and `dispose`
/// stops it.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
    worker: Arc<Mutex<Option<CancellationToken>>>,
}

impl PlaybackQueue {
    /// Create an idle queue over the given sink
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                epoch,
                active: Arc::new(AtomicBool::new(false)),
                sink,
                played: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the playback worker (idempotent)
    pub fn init(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if worker.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run_worker(Arc::clone(&self.inner), cancel.clone()));
        *worker = Some(cancel);
        tracing::debug!("playback queue started");
    }

    /// Stop the worker and drop any queued audio
    pub fn dispose(&self) {
        let token = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(token) = token {
            token.cancel();
        }
        self.reset();
        tracing::debug!("playback queue disposed");
    }

    /// Queue a raw PCM16 buffer for playback
    pub fn enqueue(&self, audio: Vec<u8>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.items.push_back(audio);
        }
        self.inner.wake.notify_one();
    }

    /// Clear pending audio and the playing flag, cutting the current buffer
    ///
    /// A buffer already dequeued but not yet handed to the sink is dropped too.
    pub fn reset(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.items.clear();
            state.playing = false;
            self.inner.epoch.send_modify(|epoch| *epoch += 1);
        }
        self.inner.active.store(false, Ordering::Release);
        self.inner.sink.stop();
    }

    /// Whether a buffer is currently playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().is_ok_and(|s| s.playing)
    }

    /// Shared playing flag for consumers that cannot take a lock
    #[must_use]
    pub fn activity(&self) -> PlaybackActivity {
        PlaybackActivity::from_flag(Arc::clone(&self.inner.active))
    }

    /// Number of buffers waiting to play
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().map_or(0, |s| s.items.len())
    }

    /// Number of buffers played to completion
    #[must_use]
    pub fn played(&self) -> u64 {
        self.inner.played.load(Ordering::Relaxed)
    }

    /// Number of buffers skipped because they failed to decode
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }
}

async fn run_worker(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        let Some((item, epoch)) = inner.next_item() else {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = inner.wake.notified() => {}
            }
            continue;
        };

        let samples = match decode_pcm16(&item) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, bytes = item.len(), "skipping undecodable audio");
                inner.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if !play_item(&inner, samples, epoch, &cancel).await {
            break;
        }
    }

    inner.set_idle();
}

/// Play one dequeued buffer unless a reset has happened since it was popped
///
/// Returns false once the worker has been cancelled.
async fn play_item(
    inner: &Inner,
    samples: Vec<i16>,
    epoch: u64,
    cancel: &CancellationToken,
) -> bool {
    let mut epochs = inner.epoch.subscribe();
    if *epochs.borrow_and_update() != epoch {
        tracing::trace!("dropping buffer queued before reset");
        return true;
    }

    tokio::select! {
        () = cancel.cancelled() => {
            inner.sink.stop();
            false
        }
        _ = epochs.changed() => {
            inner.sink.stop();
            tracing::trace!("playback interrupted by reset");
            true
        }
        result = inner.sink.play(samples) => {
            match result {
                Ok(()) => {
                    inner.played.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(error = %e, "audio playback failed"),
            }
            true
        }
    }
}

#[derive(Default)]
struct SinkState {
    samples: VecDeque<f32>,
    done: Option<oneshot::Sender<()>>,
    /// Bumped by `stop`; a play only completes under its own generation
    generation: u64,
}

/// Plays PCM16 audio on the default output device
///
/// One output stream lives for the sink's lifetime on its own thread; each
/// `play` feeds it a buffer and resolves when that buffer has drained.
pub struct CpalSink {
    state: Arc<Mutex<SinkState>>,
    _shutdown: std_mpsc::Sender<()>,
}

impl CpalSink {
    /// Open the default output device at the realtime sample rate
    ///
    /// # Errors
    ///
    /// Returns error if no suitable output device is available
    pub fn new() -> Result<Self> {
        let state = Arc::new(Mutex::new(SinkState::default()));
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let stream_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("voicewire-playback".to_string())
            .spawn(move || run_output(&stream_state, &shutdown_rx, &ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("playback thread exited during startup".to_string()))??;

        Ok(Self {
            state,
            _shutdown: shutdown_tx,
        })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, samples: Vec<i16>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let length = Duration::from_millis(
            u64::try_from(samples.len())
                .unwrap_or(u64::MAX)
                .saturating_mul(1000)
                / u64::from(SAMPLE_RATE),
        );
        let (done_tx, done_rx) = oneshot::channel();
        let generation = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Audio("playback state poisoned".to_string()))?;
            state.samples.clear();
            state.samples.extend(samples.iter().map(|&s| i16_to_f32(s)));
            state.done = Some(done_tx);
            state.generation
        };

        // A stop drops the completion sender, which also ends the wait
        if tokio::time::timeout(length + DRAIN_GRACE, done_rx).await.is_err() {
            tracing::warn!(generation, "output device did not drain buffer in time");
            self.stop();
        }
        tracing::trace!(samples = samples.len(), "playback complete");
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
            state.samples.clear();
            state.done = None;
        }
    }
}

/// Owns the output stream until the sink is dropped
fn run_output(
    state: &Arc<Mutex<SinkState>>,
    shutdown: &std_mpsc::Receiver<()>,
    ready: &std_mpsc::Sender<Result<()>>,
) {
    let stream = match open_output(Arc::clone(state)) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(Error::Device(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    // Returns once the sink's sender is dropped
    let _ = shutdown.recv();
    drop(stream);
    tracing::debug!("audio playback closed");
}

fn open_output(state: Arc<Mutex<SinkState>>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let rate = SampleRate(SAMPLE_RATE);
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );

    device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Never wait on the lock from the device thread
                let Ok(mut state) = state.try_lock() else {
                    out.fill(0.0);
                    return;
                };
                fill_output(&mut state, out, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

/// Copy pending mono samples into interleaved output, signalling a drained buffer
fn fill_output(state: &mut SinkState, out: &mut [f32], channels: usize) {
    for frame in out.chunks_mut(channels.max(1)) {
        frame.fill(state.samples.pop_front().unwrap_or(0.0));
    }
    if state.samples.is_empty() {
        if let Some(done) = state.done.take() {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn play(&self, _samples: Vec<i16>) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}
    }

    #[derive(Default)]
    struct CountingSink {
        plays: AtomicU64,
    }

    #[async_trait]
    impl AudioSink for CountingSink {
        async fn play(&self, _samples: Vec<i16>) -> Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {}
    }

    #[test]
    fn reset_clears_queue_and_flag() {
        let queue = PlaybackQueue::new(Arc::new(NullSink));
        queue.enqueue(vec![0, 0]);
        queue.enqueue(vec![0, 0]);
        assert_eq!(queue.pending(), 2);

        queue.reset();
        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_playing());
        assert!(!queue.activity().is_active());
    }

    #[tokio::test]
    async fn reset_between_dequeue_and_play_drops_buffer() {
        let sink = Arc::new(CountingSink::default());
        let queue = PlaybackQueue::new(sink.clone());
        queue.enqueue(vec![1, 0, 2, 0]);

        let (item, epoch) = queue.inner.next_item().unwrap();
        assert!(queue.activity().is_active());
        queue.reset();

        let cancel = CancellationToken::new();
        let samples = decode_pcm16(&item).unwrap();
        assert!(play_item(&queue.inner, samples, epoch, &cancel).await);
        assert_eq!(sink.plays.load(Ordering::SeqCst), 0);
        assert_eq!(queue.played(), 0);

        // Buffers queued after the reset still play
        queue.enqueue(vec![3, 0]);
        let (item, epoch) = queue.inner.next_item().unwrap();
        let samples = decode_pcm16(&item).unwrap();
        assert!(play_item(&queue.inner, samples, epoch, &cancel).await);
        assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_undecodable_items() {
        let queue = PlaybackQueue::new(Arc::new(NullSink));
        queue.init();
        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![1, 0, 2, 0]);

        for _ in 0..100 {
            if queue.played() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.skipped(), 1);
        assert_eq!(queue.played(), 1);
        queue.dispose();
    }

    #[test]
    fn output_fill_signals_drained_buffer() {
        let (done_tx, mut done_rx) = oneshot::channel();
        let mut state = SinkState {
            samples: VecDeque::from(vec![0.5, -0.5, 0.25]),
            done: Some(done_tx),
            generation: 0,
        };

        // Stereo device: each mono sample fills both channels
        let mut out = [1.0f32; 4];
        fill_output(&mut state, &mut out, 2);
        assert_eq!(out, [0.5, 0.5, -0.5, -0.5]);
        assert!(done_rx.try_recv().is_err());

        let mut out = [1.0f32; 4];
        fill_output(&mut state, &mut out, 2);
        assert_eq!(out, [0.25, 0.25, 0.0, 0.0]);
        assert!(done_rx.try_recv().is_ok());
        assert!(state.done.is_none());
    }
}
