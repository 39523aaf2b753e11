//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use voicewire::context::{ContextRequest, ContextSource};
use voicewire::credential::{Credential, CredentialProvider, CredentialRequest};
use voicewire::transport::{Dialer, Link, WireMessage};
use voicewire::voice::{AudioFrame, AudioSink, AudioSource};
use voicewire::{Error, Result};

/// Issues credentials with a fixed lifetime and records every request
pub struct FakeBroker {
    lifetime: chrono::Duration,
    requests: Mutex<Vec<CredentialRequest>>,
}

impl FakeBroker {
    pub fn new(lifetime_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            lifetime: chrono::Duration::seconds(lifetime_secs),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CredentialRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeBroker {
    async fn acquire(&self, request: &CredentialRequest) -> Result<Credential> {
        self.requests.lock().unwrap().push(request.clone());
        let now = Utc::now();
        Credential::new("test-secret", now + self.lifetime, now)
    }
}

/// What the in-memory relay does with one dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPlan {
    /// Send `connection.established` and hand the remote end to the test
    Accept,
    /// Fail the dial as a remote close
    Refuse,
}

/// In-memory relay: scripted per dial, falls back to `fallback`
pub struct MemoryDialer {
    plan: Mutex<VecDeque<DialPlan>>,
    fallback: DialPlan,
    dials: Mutex<Vec<Instant>>,
    remotes: mpsc::UnboundedSender<Link>,
}

impl MemoryDialer {
    pub fn new(
        plan: Vec<DialPlan>,
        fallback: DialPlan,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            plan: Mutex::new(plan.into()),
            fallback,
            dials: Mutex::new(Vec::new()),
            remotes,
        });
        (dialer, remotes_rx)
    }

    /// Instants at which dials happened (tokio clock)
    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, credential: &Credential) -> Result<Link> {
        assert!(!credential.expose().is_empty());
        self.dials.lock().unwrap().push(Instant::now());
        let plan = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        match plan {
            DialPlan::Refuse => Err(Error::RemoteClosed("relay refused".to_string())),
            DialPlan::Accept => {
                let (local, remote) = Link::pair(64);
                let established = json!({ "type": "connection.established", "time": 1 });
                remote
                    .tx
                    .send(WireMessage::Text(established.to_string()))
                    .await
                    .unwrap();
                self.remotes.send(remote).unwrap();
                Ok(local)
            }
        }
    }
}

/// Receive the next text message from the client as JSON
pub async fn next_json(remote: &mut Link) -> Value {
    loop {
        match remote.rx.recv().await {
            Some(WireMessage::Text(text)) => return serde_json::from_str(&text).unwrap(),
            Some(WireMessage::Binary(_)) => {}
            other => panic!("expected text, got {other:?}"),
        }
    }
}

/// Drain whatever the client has queued right now
pub fn drain_json(remote: &mut Link) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(message) = remote.rx.try_recv() {
        if let WireMessage::Text(text) = message {
            out.push(serde_json::from_str(&text).unwrap());
        }
    }
    out
}

/// Send a server event to the client
pub async fn send_json(remote: &Link, value: Value) {
    remote
        .tx
        .send(WireMessage::Text(value.to_string()))
        .await
        .unwrap();
}

/// Records played buffers; each play takes `duration_per_sample * len`
pub struct RecordingSink {
    per_sample: Duration,
    log: Mutex<Vec<(Instant, Instant, Vec<i16>)>>,
    active: AtomicBool,
    overlapped: AtomicBool,
}

impl RecordingSink {
    pub fn new(per_sample: Duration) -> Arc<Self> {
        Arc::new(Self {
            per_sample,
            log: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        })
    }

    /// (start, end, samples) per completed play
    pub fn played(&self) -> Vec<(Instant, Instant, Vec<i16>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, samples: Vec<i16>) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let start = Instant::now();
        let len = u32::try_from(samples.len()).unwrap();
        tokio::time::sleep(self.per_sample * len).await;
        self.active.store(false, Ordering::SeqCst);
        self.log.lock().unwrap().push((start, Instant::now(), samples));
        Ok(())
    }

    fn stop(&self) {}
}

/// Context source that takes `delay` before answering
pub struct SlowContext {
    pub delay: Duration,
    pub body: String,
}

#[async_trait]
impl ContextSource for SlowContext {
    async fn assemble(&self, _request: &ContextRequest) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(self.body.clone())
    }
}

/// Shared view of a [`FakeSource`]
#[derive(Clone, Default)]
pub struct FakeMic {
    frames: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    paused: Arc<AtomicBool>,
    fail_start: Arc<AtomicBool>,
}

impl FakeMic {
    pub fn source(&self) -> Box<dyn AudioSource> {
        Box::new(FakeSource { mic: self.clone() })
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.frames.lock().unwrap().is_some()
    }

    /// Push a frame into the capture queue, paused or not; false if not capturing
    pub async fn emit(&self, frame: AudioFrame) -> bool {
        let sender = self.frames.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(frame).await.is_ok(),
            None => false,
        }
    }
}

/// Scriptable microphone
pub struct FakeSource {
    mic: FakeMic,
}

#[async_trait]
impl AudioSource for FakeSource {
    async fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.mic.fail_start.swap(false, Ordering::SeqCst) {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        *self.mic.frames.lock().unwrap() = Some(frames);
        self.mic.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.mic.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        *self.mic.frames.lock().unwrap() = None;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.mic.is_capturing()
    }

    fn sample_rate(&self) -> u32 {
        voicewire::voice::SAMPLE_RATE
    }
}

/// Constant-amplitude frame of `samples` length at 24 kHz
pub fn frame(seq: u64, amplitude: i16, samples: usize) -> AudioFrame {
    AudioFrame::new(seq, voicewire::voice::SAMPLE_RATE, vec![amplitude; samples])
}
