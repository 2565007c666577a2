//! Turn-taking engine: the single owner of session, microphone and speaker.
//!
//! Every asynchronous outcome (transcripts, dialogue replies, synthesized audio, playback
//! completion, barge-in) is posted to one unbounded inbox and applied in arrival order. A
//! handler runs to completion before the next event is read, so transitions are atomic with
//! respect to the inbox.
//!
//! Results of remote calls carry the ticket that was current when the call was issued.
//! Entering `Idle` or `Listening` bumps the ticket, which turns any older result into a
//! stale one that is logged and dropped.

use crate::config::{CoachConfig, DialogueFailurePolicy};
use crate::dialogue::{record_exchange, DialogueReply, DialogueService};
use crate::error::{within, ErrorKind, VoiceError, VoiceResult};
use crate::monitor::{CaptureControl, SpeakingGate};
use crate::playback::{AudioSink, PlaybackController, PlaybackOutcome, Synthesizer};
use crate::recognizer::Recognizer;
use crate::session::{Session, Turn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sender side of the engine inbox. Handed to every collaborator that reports back.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl EngineState {
    /// Legal edges of the state machine. `Speaking` is only reachable from `Processing`.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Listening | Processing | Speaking, Idle)
                | (Idle, Listening)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Processing, Listening)
                | (Speaking, Listening)
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Listening => "listening",
            EngineState::Processing => "processing",
            EngineState::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Start,
    Stop,
    Shutdown,
    Transcript {
        ticket: u64,
        result: VoiceResult<String>,
    },
    Reply {
        ticket: u64,
        transcript: String,
        result: VoiceResult<DialogueReply>,
    },
    Synthesized {
        ticket: u64,
        result: VoiceResult<Vec<u8>>,
    },
    PlaybackEnded {
        ticket: u64,
        outcome: PlaybackOutcome,
    },
    BargeIn,
    InterruptionExpired {
        seq: u64,
    },
}

/// User-visible failure notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    DeviceUnavailable(String),
    TranscriptionFailed(String),
    DialogueUnavailable(String),
    SynthesisUnavailable(String),
}

impl Notice {
    /// `None` for failures that stay silent (empty transcript) or are internal.
    pub fn from_error(err: &VoiceError) -> Option<Self> {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::DeviceUnavailable => Some(Notice::DeviceUnavailable(msg)),
            ErrorKind::TranscriptionFailed => Some(Notice::TranscriptionFailed(msg)),
            ErrorKind::DialogueUnavailable => Some(Notice::DialogueUnavailable(msg)),
            ErrorKind::SynthesisUnavailable => Some(Notice::SynthesisUnavailable(msg)),
            ErrorKind::EmptyTranscript | ErrorKind::Internal => None,
        }
    }
}

/// What observers see, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    StateChanged { from: EngineState, to: EngineState },
    TurnAppended(Turn),
    Notice(Notice),
    /// Raised on barge-in, cleared once the cool-down window has passed.
    Interrupted { active: bool },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub interruption_window: Duration,
    pub on_dialogue_failure: DialogueFailurePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            interruption_window: Duration::from_secs(2),
            on_dialogue_failure: DialogueFailurePolicy::Idle,
        }
    }
}

impl From<&CoachConfig> for EngineSettings {
    fn from(config: &CoachConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            interruption_window: config.barge_in_cooldown(),
            on_dialogue_failure: config.on_dialogue_failure,
        }
    }
}

/// The engine's external collaborators. Each is owned exclusively by the engine.
pub struct Collaborators {
    pub capture: Box<dyn CaptureControl>,
    pub recognizer: Box<dyn Recognizer>,
    pub dialogue: Arc<dyn DialogueService>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Box<dyn AudioSink>,
}

/// Cloneable control surface for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    inbox: EventSender,
    state: watch::Receiver<EngineState>,
}

impl EngineHandle {
    fn send(&self, event: EngineEvent) -> VoiceResult<()> {
        self.inbox
            .send(event)
            .map_err(|_| VoiceError::ChannelClosed("engine is not running".to_string()))
    }

    /// Open the microphone and begin listening.
    pub fn start(&self) -> VoiceResult<()> {
        self.send(EngineEvent::Start)
    }

    /// Return to `Idle` from any state, cancelling whatever is in flight.
    pub fn stop(&self) -> VoiceResult<()> {
        self.send(EngineEvent::Stop)
    }

    /// Stop and end `Engine::run`.
    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(EngineEvent::Shutdown)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, target: EngineState) -> VoiceResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| VoiceError::ChannelClosed("engine exited".to_string()))
    }
}

pub struct Engine {
    settings: EngineSettings,
    session: Session,
    state: EngineState,
    ticket: u64,

    /// `None` only while a blocking capture call holds it.
    capture: Option<Box<dyn CaptureControl>>,
    recognizer: Box<dyn Recognizer>,
    dialogue: Arc<dyn DialogueService>,
    playback: PlaybackController,
    pending_dialogue: Option<JoinHandle<()>>,
    gate: SpeakingGate,

    interruption_seq: u64,
    interrupted: bool,

    inbox_tx: EventSender,
    inbox_rx: mpsc::UnboundedReceiver<EngineEvent>,
    state_tx: watch::Sender<EngineState>,
    updates: mpsc::UnboundedSender<EngineUpdate>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        session: Session,
        collaborators: Collaborators,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<EngineUpdate>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let engine = Self {
            settings,
            session,
            state: EngineState::Idle,
            ticket: 0,
            capture: Some(collaborators.capture),
            recognizer: collaborators.recognizer,
            dialogue: collaborators.dialogue,
            playback: PlaybackController::new(collaborators.synthesizer, collaborators.sink),
            pending_dialogue: None,
            gate: SpeakingGate::new(),
            interruption_seq: 0,
            interrupted: false,
            inbox_tx: inbox_tx.clone(),
            inbox_rx,
            state_tx,
            updates,
        };
        let handle = EngineHandle {
            inbox: inbox_tx,
            state: state_rx,
        };
        (engine, handle, updates_rx)
    }

    /// Apply events until shutdown, then release every device and return the session.
    pub async fn run(mut self) -> Session {
        info!(session_id = %self.session.id(), "🧭 Turn-taking engine running");
        while let Some(event) = self.inbox_rx.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }
        self.enter_idle().await;
        info!(turns = self.session.len(), "Turn-taking engine stopped");
        self.session
    }

    async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Start => self.on_start().await,
            EngineEvent::Stop => self.on_stop().await,
            EngineEvent::Shutdown => {}
            EngineEvent::Transcript { ticket, result } => {
                if self.is_current(ticket, EngineState::Listening) {
                    self.on_transcript(result).await;
                } else {
                    debug!(ticket, "Dropping stale transcript");
                }
            }
            EngineEvent::Reply {
                ticket,
                transcript,
                result,
            } => {
                if self.is_current(ticket, EngineState::Processing) {
                    self.on_reply(transcript, result).await;
                } else {
                    debug!(ticket, "Dropping stale dialogue reply");
                }
            }
            EngineEvent::Synthesized { ticket, result } => {
                if self.is_current(ticket, EngineState::Processing) {
                    self.on_synthesized(result).await;
                } else {
                    debug!(ticket, "Dropping stale synthesized audio");
                }
            }
            EngineEvent::PlaybackEnded { ticket, outcome } => {
                if self.is_current(ticket, EngineState::Speaking) && self.playback.finish(ticket) {
                    self.on_playback_ended(outcome).await;
                } else {
                    debug!(ticket, ?outcome, "Ignoring end of stale playback");
                }
            }
            EngineEvent::BargeIn => self.on_barge_in().await,
            EngineEvent::InterruptionExpired { seq } => {
                if self.interrupted && seq == self.interruption_seq {
                    self.interrupted = false;
                    self.emit(EngineUpdate::Interrupted { active: false });
                }
            }
        }
    }

    fn is_current(&self, ticket: u64, state: EngineState) -> bool {
        ticket == self.ticket && self.state == state
    }

    async fn on_start(&mut self) {
        match self.state {
            EngineState::Idle => {
                let inbox = self.inbox_tx.clone();
                let gate = self.gate.clone();
                let opened = self
                    .with_capture(move |capture| capture.open(inbox, gate))
                    .await
                    .and_then(|result| result);
                if let Err(e) = opened {
                    warn!("🎙️ Capture could not start: {}", e);
                    self.emit(EngineUpdate::Notice(Notice::DeviceUnavailable(e.to_string())));
                    return;
                }
                self.enter_listening().await;
            }
            EngineState::Speaking => {
                // Turning the mic on mid-reply silences the reply.
                self.playback.cancel();
                self.enter_listening().await;
            }
            EngineState::Listening | EngineState::Processing => {
                debug!(state = %self.state, "Start ignored");
            }
        }
    }

    async fn on_stop(&mut self) {
        if self.state == EngineState::Idle {
            debug!("Stop ignored: already idle");
            return;
        }
        info!("⏹️ Stop requested");
        self.enter_idle().await;
    }

    async fn on_transcript(&mut self, result: VoiceResult<String>) {
        match result {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                info!("📝 Transcript: {}", text);
                self.transition(EngineState::Processing);
                self.request_dialogue(text);
            }
            Ok(_) => {
                debug!("Empty transcript, going idle");
                self.enter_idle().await;
            }
            Err(e) => {
                if e.is_user_visible() {
                    warn!("Transcription failed: {}", e);
                    self.notify(&e);
                }
                self.enter_idle().await;
            }
        }
    }

    fn request_dialogue(&mut self, transcript: String) {
        let dialogue = self.dialogue.clone();
        let session_id = self.session.id().clone();
        let inbox = self.inbox_tx.clone();
        let ticket = self.ticket;
        let timeout = self.settings.request_timeout;

        if let Some(prev) = self.pending_dialogue.take() {
            prev.abort();
        }
        self.pending_dialogue = Some(tokio::spawn(async move {
            let result = within(
                timeout,
                dialogue.converse(&session_id, &transcript),
                VoiceError::DialogueUnavailable,
            )
            .await;
            let _ = inbox.send(EngineEvent::Reply {
                ticket,
                transcript,
                result,
            });
        }));
    }

    async fn on_reply(&mut self, transcript: String, result: VoiceResult<DialogueReply>) {
        self.pending_dialogue = None;
        match result {
            Ok(reply) => {
                info!(
                    emotion = reply.detected_emotion.as_deref().unwrap_or("-"),
                    intent = reply.intent.as_deref().unwrap_or("-"),
                    "💬 Reply: {}",
                    reply.response
                );
                for turn in record_exchange(&mut self.session, &transcript, &reply) {
                    self.emit(EngineUpdate::TurnAppended(turn));
                }
                self.playback.request(
                    self.ticket,
                    reply.response,
                    reply.detected_emotion,
                    self.settings.request_timeout,
                    self.inbox_tx.clone(),
                );
            }
            Err(e) => {
                warn!("Dialogue request failed: {}", e);
                self.notify(&e);
                match self.settings.on_dialogue_failure {
                    DialogueFailurePolicy::Idle => self.enter_idle().await,
                    DialogueFailurePolicy::Listen => self.enter_listening().await,
                }
            }
        }
    }

    async fn on_synthesized(&mut self, result: VoiceResult<Vec<u8>>) {
        match result {
            Ok(audio) if !audio.is_empty() => {
                // Gate opens before audio starts so an immediate barge-in is not missed.
                self.gate.set(true);
                match self.playback.start(self.ticket, audio, self.inbox_tx.clone()) {
                    Ok(()) => self.transition(EngineState::Speaking),
                    Err(e) => {
                        warn!("Playback could not start: {}", e);
                        self.notify(&e);
                        self.enter_listening().await;
                    }
                }
            }
            Ok(_) => {
                debug!("No audio for reply, listening again");
                self.enter_listening().await;
            }
            Err(e) => {
                warn!("Synthesis failed: {}", e);
                self.notify(&e);
                self.enter_listening().await;
            }
        }
    }

    async fn on_playback_ended(&mut self, outcome: PlaybackOutcome) {
        match outcome {
            PlaybackOutcome::Completed => info!("✅ Reply finished, listening"),
            PlaybackOutcome::Cancelled => debug!("Playback cancelled by the device"),
            PlaybackOutcome::Failed(msg) => {
                warn!("Playback failed: {}", msg);
                self.notify(&VoiceError::Playback(msg));
            }
        }
        self.enter_listening().await;
    }

    async fn on_barge_in(&mut self) {
        if self.state != EngineState::Speaking {
            debug!(state = %self.state, "Barge-in ignored: nothing to interrupt");
            return;
        }
        info!("⚡ Barge-in: silencing reply");
        self.playback.cancel();
        self.raise_interruption();
        self.enter_listening().await;
    }

    fn raise_interruption(&mut self) {
        self.interruption_seq += 1;
        self.interrupted = true;
        self.emit(EngineUpdate::Interrupted { active: true });

        let seq = self.interruption_seq;
        let window = self.settings.interruption_window;
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = inbox.send(EngineEvent::InterruptionExpired { seq });
        });
    }

    async fn enter_listening(&mut self) {
        self.ticket += 1;
        self.gate.set(false);
        if let Err(e) = self.recognizer.begin(self.ticket, self.inbox_tx.clone()) {
            error!("Listening session could not start: {}", e);
            self.notify(&VoiceError::Transcription(e.to_string()));
            self.enter_idle().await;
            return;
        }
        self.transition(EngineState::Listening);
    }

    /// Release everything in flight. Safe to call repeatedly; only live resources get a
    /// cancellation signal.
    async fn enter_idle(&mut self) {
        self.ticket += 1;
        if self.state == EngineState::Listening {
            self.recognizer.cancel();
        }
        if let Some(pending) = self.pending_dialogue.take() {
            pending.abort();
        }
        self.gate.set(false);
        self.playback.cancel();
        if self.capture.as_ref().is_some_and(|c| c.is_open()) {
            if let Err(e) = self.with_capture(|capture| capture.close()).await {
                error!("Capture did not close cleanly: {}", e);
            }
        }
        self.transition(EngineState::Idle);
    }

    /// Run a capture call on the blocking pool; opening and closing join device threads.
    /// Other events wait in the inbox until it returns.
    async fn with_capture<R, F>(&mut self, call: F) -> VoiceResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Box<dyn CaptureControl>) -> R + Send + 'static,
    {
        let mut capture = self.capture.take().ok_or_else(|| {
            VoiceError::DeviceUnavailable("capture was lost by an earlier call".to_string())
        })?;
        let (capture, out) = tokio::task::spawn_blocking(move || {
            let out = call(&mut capture);
            (capture, out)
        })
        .await
        .map_err(|e| VoiceError::DeviceUnavailable(format!("capture call failed: {}", e)))?;
        self.capture = Some(capture);
        Ok(out)
    }

    fn transition(&mut self, to: EngineState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            error!(%from, %to, "Refusing illegal transition");
            return;
        }
        self.state = to;
        info!("🔁 {} → {}", from, to);
        self.state_tx.send_replace(to);
        self.emit(EngineUpdate::StateChanged { from, to });
    }

    fn notify(&self, err: &VoiceError) {
        if let Some(notice) = Notice::from_error(err) {
            self.emit(EngineUpdate::Notice(notice));
        }
    }

    fn emit(&self, update: EngineUpdate) {
        let _ = self.updates.send(update);
    }
}
