//! Session controller
//!
//! A single task owns all session state. Caller commands, connection
//! attempt results, retry timers, transport inbound and captured audio all
//! arrive as messages on queues it selects over; nothing else mutates the
//! session.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectPolicy, ReconnectState};
use super::{ReconnectAttempt, Session, SessionPhase, SessionStatus, SessionUpdate};
use crate::context::{ContextProtocol, ContextRequest, DeliveryOutcome};
use crate::credential::{CredentialProvider, CredentialRequest};
use crate::transport::{
    ClientEvent, ConnectOutcome, Inbound, ServerEvent, TransportChannel, TransportConnector,
    events::ConversationItem,
};
use crate::voice::{
    AudioFrame, AudioSource, PlaybackQueue, SilenceConfig, SilenceDetector, decode_base64_audio,
};
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 32;
const INTERNAL_QUEUE: usize = 32;
const UPDATE_QUEUE: usize = 256;
const FRAME_QUEUE: usize = 64;

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Model requested with each credential
    pub model: String,
    /// Output voice requested with each credential
    pub voice: String,
    pub reconnect: ReconnectPolicy,
    pub silence: SilenceConfig,
    /// Commit the input buffer when the silence detector fires
    pub commit_on_silence: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            reconnect: ReconnectPolicy::default(),
            silence: SilenceConfig::default(),
            commit_on_silence: true,
        }
    }
}

/// Collaborators owned by the controller for its lifetime
pub struct SessionParts {
    pub broker: Arc<dyn CredentialProvider>,
    pub connector: Arc<TransportConnector>,
    pub context: ContextProtocol,
    /// Started on spawn, disposed when the controller stops
    pub playback: PlaybackQueue,
    /// Microphone; `None` for text-only sessions
    pub capture: Option<Box<dyn AudioSource>>,
}

/// Parameters of a caller-initiated connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Opaque caller identifier carried in the minimal context
    pub caller_id: Option<String>,
    pub phase: SessionPhase,
}

enum Command {
    Connect(ConnectRequest),
    Disconnect(oneshot::Sender<()>),
    SetMuted(bool),
    SetPhase(SessionPhase),
    SendText(String, oneshot::Sender<Result<()>>),
    Commit(oneshot::Sender<Result<()>>),
    Shutdown,
}

enum Internal {
    Attempt {
        generation: u64,
        result: Result<ConnectOutcome>,
    },
    RetryDue {
        generation: u64,
    },
    Context {
        channel_id: u64,
        outcome: DeliveryOutcome,
    },
}

/// Handle to a running session controller
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    updates: Option<mpsc::Receiver<SessionUpdate>>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Start the controller task; must be called inside a tokio runtime
    #[must_use]
    pub fn spawn(parts: SessionParts, options: SessionOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE);
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);

        parts.playback.init();

        let actor = Actor {
            silence: SilenceDetector::new(options.silence),
            broker: parts.broker,
            connector: parts.connector,
            context: parts.context,
            playback: parts.playback,
            capture: parts.capture,
            options,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            status: status_tx,
            updates: updates_tx,
            session: None,
            request: None,
            reconnect: ReconnectState::default(),
            generation: 0,
            attempt_cancel: None,
            retry_cancel: None,
            context_cancel: None,
            channel: None,
            frames: None,
            muted: false,
        };

        Self {
            commands: commands_tx,
            status: status_rx,
            updates: Some(updates_rx),
            task: tokio::spawn(actor.run()),
        }
    }

    /// Start a new session; no-op while connecting or connected
    ///
    /// Clears a `Failed` state and resets the reconnect budget.
    ///
    /// # Errors
    ///
    /// Returns error if the controller has stopped
    pub async fn connect(&self, request: ConnectRequest) -> Result<()> {
        self.send(Command::Connect(request)).await
    }

    /// Tear down the session; resolves once teardown has finished
    ///
    /// # Errors
    ///
    /// Returns error if the controller has stopped
    pub async fn disconnect(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Disconnect(done_tx)).await?;
        done_rx.await.map_err(|_| stopped())
    }

    /// Pause capture without releasing the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the controller has stopped
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMuted(muted)).await
    }

    /// Update the phase used by the next enhanced-context assembly
    ///
    /// # Errors
    ///
    /// Returns error if the controller has stopped
    pub async fn set_phase(&self, phase: SessionPhase) -> Result<()> {
        self.send(Command::SetPhase(phase)).await
    }

    /// Send a user text message and request a response
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the controller has stopped
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::SendText(text.into(), reply_tx)).await?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Commit the current input audio buffer
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the controller has stopped
    pub async fn commit(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Commit(reply_tx)).await?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Watch the public status
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Current public status
    #[must_use]
    pub fn current_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Take the notification stream; only the first call returns it
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<SessionUpdate>> {
        self.updates.take()
    }

    /// Tear down, stop the controller and dispose of playback
    pub async fn dispose(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "session controller task failed");
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::Protocol("session controller has stopped".to_string())
}

struct Actor {
    broker: Arc<dyn CredentialProvider>,
    connector: Arc<TransportConnector>,
    context: ContextProtocol,
    playback: PlaybackQueue,
    capture: Option<Box<dyn AudioSource>>,
    options: SessionOptions,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    status: watch::Sender<SessionStatus>,
    updates: mpsc::Sender<SessionUpdate>,

    session: Option<Session>,
    request: Option<ConnectRequest>,
    reconnect: ReconnectState,
    /// Bumped per attempt and per teardown; stale results are ignored
    generation: u64,
    attempt_cancel: Option<CancellationToken>,
    retry_cancel: Option<CancellationToken>,
    context_cancel: Option<CancellationToken>,
    channel: Option<TransportChannel>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    silence: SilenceDetector,
    muted: bool,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
                inbound = next_inbound(&mut self.channel) => self.handle_inbound(inbound).await,
                frame = next_frame(&mut self.frames) => self.handle_frame(frame).await,
            }
        }

        self.teardown();
        self.session = None;
        self.set_status(SessionStatus::Disconnected);
        self.playback.dispose();
        tracing::debug!("session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(request) => self.connect(request),
            Command::Disconnect(done) => {
                self.disconnect();
                let _ = done.send(());
            }
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::SetPhase(phase) => {
                if let Some(request) = &mut self.request {
                    request.phase = phase;
                }
                if let Some(session) = &mut self.session {
                    session.phase = phase;
                }
            }
            Command::SendText(text, reply) => {
                let item = ClientEvent::ConversationItemCreate {
                    item: ConversationItem::user_text(text),
                };
                let result = match send_on(self.channel.as_ref(), item).await {
                    Ok(()) => send_on(self.channel.as_ref(), ClientEvent::ResponseCreate).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Commit(reply) => {
                let result = send_on(self.channel.as_ref(), ClientEvent::InputAudioCommit).await;
                let _ = reply.send(result);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn connect(&mut self, request: ConnectRequest) {
        if matches!(
            *self.status.borrow(),
            SessionStatus::Connecting { .. } | SessionStatus::Connected
        ) {
            tracing::debug!("connect ignored, session already active");
            return;
        }

        // A prior channel must be fully gone before a new one opens
        self.teardown();

        let session = Session::new(request.phase);
        tracing::info!(session_id = %session.id, phase = %session.phase, "starting session");
        self.session = Some(session);
        self.request = Some(request);
        self.reconnect.reset();
        self.start_attempt(None);
    }

    fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            tracing::info!(session_id = %session.id, "disconnecting session");
        }
        self.teardown();
        self.session = None;
        self.request = None;
        self.set_status(SessionStatus::Disconnected);
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if !capture.is_capturing() {
            return;
        }
        if let Err(e) = capture.set_paused(muted) {
            tracing::warn!(error = %e, "failed to change mute state");
            self.notify(SessionUpdate::AudioDeviceError(e.to_string()));
        }
    }

    fn start_attempt(&mut self, retry: Option<ReconnectAttempt>) {
        let Some(request) = &self.request else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        self.set_status(SessionStatus::Connecting { attempt: retry });

        // Phase 1: minimal context rides on the credential, no I/O
        let minimal = self.context.minimal(&ContextRequest {
            caller_id: request.caller_id.clone(),
            phase: request.phase,
        });
        let credential_request = CredentialRequest {
            model: self.options.model.clone(),
            voice: self.options.voice.clone(),
            instructions: minimal.instructions,
        };

        let cancel = CancellationToken::new();
        self.attempt_cancel = Some(cancel.clone());
        let broker = Arc::clone(&self.broker);
        let connector = Arc::clone(&self.connector);
        let internal = self.internal_tx.clone();

        tracing::debug!(generation, retry = ?retry, "connection attempt started");
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = connector.connect(broker.as_ref(), &credential_request) => result,
            };
            let _ = internal.send(Internal::Attempt { generation, result }).await;
        });
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Attempt { generation, result } => {
                if generation != self.generation {
                    // A cancelled attempt may still have opened a channel
                    if let Ok(ConnectOutcome::Opened(channel)) = result {
                        channel.close();
                        if self.channel.is_none() && self.attempt_cancel.is_none() {
                            self.connector.mark_disconnected();
                        }
                    }
                    return;
                }
                self.attempt_cancel = None;

                match result {
                    Ok(ConnectOutcome::Opened(channel)) => self.on_open(channel).await,
                    Ok(ConnectOutcome::InProgress(state)) => {
                        tracing::warn!(?state, "connector busy with a foreign attempt");
                        self.on_failure(&Error::Protocol(format!(
                            "connector busy ({state:?})"
                        )));
                    }
                    Err(e) => self.on_failure(&e),
                }
            }
            Internal::RetryDue { generation } => {
                if generation != self.generation || self.retry_cancel.take().is_none() {
                    return;
                }
                let retry = ReconnectAttempt {
                    attempt: self.reconnect.attempt(),
                    max_attempts: self.options.reconnect.max_attempts,
                };
                self.start_attempt(Some(retry));
            }
            Internal::Context {
                channel_id,
                outcome,
            } => {
                if self.channel.as_ref().map(TransportChannel::id) == Some(channel_id) {
                    self.context_cancel = None;
                    self.notify(SessionUpdate::ContextDelivered(outcome));
                }
            }
        }
    }

    async fn on_open(&mut self, channel: TransportChannel) {
        self.reconnect.reset();
        if let Some(session) = &self.session {
            tracing::info!(session_id = %session.id, channel_id = channel.id(), "session connected");
        }

        let handle = channel.handle();
        self.channel = Some(channel);
        self.set_status(SessionStatus::Connected);

        self.start_capture().await;

        // Phase 2: enhanced context, bounded by the protocol's own deadlines
        let Some(request) = &self.request else {
            return;
        };
        let context_request = ContextRequest {
            caller_id: request.caller_id.clone(),
            phase: request.phase,
        };
        let protocol = self.context.clone();
        let internal = self.internal_tx.clone();
        let cancel = CancellationToken::new();
        self.context_cancel = Some(cancel.clone());

        tokio::spawn(async move {
            let channel_id = handle.id();
            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                outcome = protocol.deliver(&handle, &context_request) => outcome,
            };
            let _ = internal
                .send(Internal::Context {
                    channel_id,
                    outcome,
                })
                .await;
        });
    }

    async fn start_capture(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        match capture.start(frames_tx).await {
            Ok(()) => {
                self.frames = Some(frames_rx);
                self.silence.reset();
                if self.muted {
                    if let Err(e) = capture.set_paused(true) {
                        tracing::warn!(error = %e, "failed to pause capture");
                    }
                }
            }
            Err(e) => {
                // Microphone failures never touch the transport
                tracing::warn!(error = %e, "audio capture unavailable");
                self.notify(SessionUpdate::AudioDeviceError(e.to_string()));
            }
        }
    }

    fn on_failure(&mut self, error: &Error) {
        tracing::warn!(error = %error, attempt = self.reconnect.attempt(), "connection failed");
        self.teardown();

        if !error.is_retryable() {
            self.fail(error.to_string());
            return;
        }

        let policy = self.options.reconnect;
        let Some((index, delay)) = self.reconnect.next_retry(&policy) else {
            let attempts = self.reconnect.attempt();
            self.notify(SessionUpdate::Exhausted { attempts });
            self.fail(Error::ConnectionExhausted { attempts }.to_string());
            return;
        };

        let attempt = index + 1;
        tracing::info!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis(),
            "scheduling reconnect"
        );
        self.notify(SessionUpdate::Reconnecting {
            attempt,
            max_attempts: policy.max_attempts,
            delay,
        });
        self.set_status(SessionStatus::Connecting {
            attempt: Some(ReconnectAttempt {
                attempt,
                max_attempts: policy.max_attempts,
            }),
        });

        let cancel = CancellationToken::new();
        self.retry_cancel = Some(cancel.clone());
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = internal.send(Internal::RetryDue { generation }).await;
                }
            }
        });
    }

    fn fail(&mut self, reason: String) {
        if let Some(session) = &self.session {
            tracing::error!(session_id = %session.id, reason = %reason, "session failed");
        }
        self.session = None;
        self.set_status(SessionStatus::Failed { reason });
    }

    async fn handle_inbound(&mut self, inbound: Option<Inbound>) {
        match inbound {
            Some(Inbound::Event(event)) => self.handle_event(event),
            Some(Inbound::Audio(bytes)) => self.playback.enqueue(bytes),
            Some(Inbound::Closed(kind)) => {
                self.on_failure(&Error::RemoteClosed(format!("channel lost ({kind})")));
            }
            None => {
                self.on_failure(&Error::RemoteClosed("channel drained".to_string()));
            }
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::AudioDelta { delta } => match decode_base64_audio(&delta) {
                Ok(bytes) => self.playback.enqueue(bytes),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable audio delta"),
            },
            ServerEvent::TranscriptDelta { delta } => {
                self.notify(SessionUpdate::TranscriptDelta(delta));
            }
            ServerEvent::TranscriptDone { transcript } => {
                self.notify(SessionUpdate::TranscriptDone(transcript.unwrap_or_default()));
            }
            ServerEvent::InputTranscript { transcript } => {
                self.notify(SessionUpdate::InputTranscript(transcript));
            }
            ref error @ ServerEvent::Error { .. } => {
                let message = error.error_message().unwrap_or_default();
                tracing::warn!(message = %message, "remote error event");
                self.notify(SessionUpdate::RemoteError(message));
            }
            other => tracing::trace!(event = ?other, "unhandled event"),
        }
    }

    async fn handle_frame(&mut self, frame: Option<AudioFrame>) {
        let Some(frame) = frame else {
            self.frames = None;
            if self.capture.as_ref().is_some_and(|c| c.is_capturing()) {
                self.notify(SessionUpdate::AudioDeviceError(
                    "audio capture stopped unexpectedly".to_string(),
                ));
            }
            return;
        };

        if self.muted {
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };

        if !channel.send_audio(frame.clone()) {
            tracing::trace!(seq = frame.seq(), "audio frame dropped");
        }

        if self.options.commit_on_silence && self.silence.process(&frame) {
            if let Err(e) = channel.send_event(ClientEvent::InputAudioCommit).await {
                tracing::debug!(error = %e, "failed to commit input buffer");
                return;
            }
            self.notify(SessionUpdate::SilenceDetected);
        }
    }

    /// Release everything tied to the current attempt or channel
    ///
    /// Order: pending retry and attempt, capture, playback, transport. Each
    /// step runs regardless of earlier failures.
    fn teardown(&mut self) {
        self.generation += 1;

        if let Some(cancel) = self.retry_cancel.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.attempt_cancel.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.context_cancel.take() {
            cancel.cancel();
        }

        self.frames = None;
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.stop() {
                tracing::warn!(error = %e, "failed to stop audio capture");
            }
        }

        self.playback.reset();

        if let Some(channel) = self.channel.take() {
            self.connector.mark_closing();
            channel.close();
        }
        self.connector.mark_disconnected();
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!(from = %current, to = %status, "session status");
                *current = status;
                true
            }
        });
    }

    fn notify(&self, update: SessionUpdate) {
        if self.updates.try_send(update).is_err() {
            tracing::debug!("update queue full or closed, notification dropped");
        }
    }
}

async fn send_on(channel: Option<&TransportChannel>, event: ClientEvent) -> Result<()> {
    match channel {
        Some(channel) if channel.is_open() => channel.send_event(event).await,
        _ => Err(Error::RemoteClosed("session is not connected".to_string())),
    }
}

async fn next_inbound(channel: &mut Option<TransportChannel>) -> Option<Inbound> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}
