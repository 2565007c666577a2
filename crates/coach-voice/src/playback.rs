//! Playback controller: synthesized speech and the interruption kill-switch.
//!
//! Audio is fetched from the synthesis endpoint, then handed to an `AudioSink` that plays
//! it on the default output device. Each playback is owned by a `PlaybackHandle`; at most
//! one is live at a time, and a handle that is dropped or cancelled silences its sink.

use crate::engine::{EngineEvent, EventSender};
use crate::error::{within, VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Turns reply text into encoded audio (MP3 from the coaching backend).
#[async_trait::async_trait]
pub trait Synthesizer: Send + Sync {
    /// Empty audio means there is nothing to play.
    async fn synthesize(&self, text: &str, emotion: Option<&str>) -> VoiceResult<Vec<u8>>;
}

/// Returns no audio. For running without a synthesis endpoint.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

#[async_trait::async_trait]
impl Synthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, _text: &str, _emotion: Option<&str>) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// `GET /api/tts?text=...&emotion=...` on the coaching backend. The server shapes pitch and
/// rate from the emotion label.
pub struct HttpSynthesizer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, text: &str, emotion: Option<&str>) -> VoiceResult<reqwest::Url> {
        reqwest::Url::parse_with_params(
            &format!("{}/api/tts", self.base_url),
            &[("text", text), ("emotion", emotion.unwrap_or("neutral"))],
        )
        .map_err(|e| VoiceError::SynthesisUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, emotion: Option<&str>) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let res = self
            .client
            .get(self.url(text, emotion)?)
            .send()
            .await
            .map_err(|e| VoiceError::SynthesisUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::SynthesisUnavailable(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::SynthesisUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// How a playback ended. Reported exactly once per playback via `EngineEvent::PlaybackEnded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Ownership of one in-flight playback. Cancelling, or dropping without `release`, stops it.
pub struct PlaybackHandle {
    ticket: u64,
    stopper: Option<Box<dyn FnOnce() + Send>>,
}

impl PlaybackHandle {
    pub fn new(ticket: u64, stopper: impl FnOnce() + Send + 'static) -> Self {
        Self {
            ticket,
            stopper: Some(Box::new(stopper)),
        }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Stop output now.
    pub fn cancel(mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
    }

    /// Playback already ended on its own; nothing to stop.
    pub fn release(mut self) {
        self.stopper = None;
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("ticket", &self.ticket)
            .field("live", &self.stopper.is_some())
            .finish()
    }
}

/// Platform playback boundary.
pub trait AudioSink: Send {
    /// Begin playing `audio`. The outcome is sent to `done` exactly once.
    fn play(&mut self, ticket: u64, audio: Vec<u8>, done: EventSender) -> VoiceResult<PlaybackHandle>;
}

enum SinkCommand {
    Play {
        ticket: u64,
        audio: Vec<u8>,
        done: EventSender,
    },
    Stop {
        ticket: u64,
    },
    Shutdown,
}

struct Current {
    ticket: u64,
    sink: Sink,
    done: EventSender,
}

impl Current {
    fn end(self, outcome: PlaybackOutcome) {
        self.sink.stop();
        debug!(ticket = self.ticket, ?outcome, "Playback ended");
        let _ = self.done.send(EngineEvent::PlaybackEnded {
            ticket: self.ticket,
            outcome,
        });
    }
}

/// Default output device through rodio.
///
/// `OutputStream` is `!Send`, so it lives on a `coach-playback` thread. Every playback gets a
/// fresh `Sink`; the previous one is stopped and dropped along with its decoded audio.
pub struct RodioSink {
    commands: std_mpsc::Sender<SinkCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

const POLL: Duration = Duration::from_millis(20);

impl RodioSink {
    pub fn new() -> VoiceResult<Self> {
        let (commands, rx) = std_mpsc::channel::<SinkCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

        let thread = thread::Builder::new()
            .name("coach-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("🔈 Output device ready for playback");
                playback_loop(&handle, rx);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Playback(
                    "playback thread exited during startup".to_string(),
                ))
            }
        }
    }
}

fn start_sink(handle: &OutputStreamHandle, audio: Vec<u8>) -> VoiceResult<Sink> {
    let source = rodio::Decoder::new(Cursor::new(audio))
        .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
    let sink = Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
    sink.append(source.convert_samples::<f32>());
    Ok(sink)
}

fn playback_loop(handle: &OutputStreamHandle, rx: std_mpsc::Receiver<SinkCommand>) {
    let mut current: Option<Current> = None;
    loop {
        match rx.recv_timeout(POLL) {
            Ok(SinkCommand::Play { ticket, audio, done }) => {
                if let Some(prev) = current.take() {
                    prev.end(PlaybackOutcome::Cancelled);
                }
                match start_sink(handle, audio) {
                    Ok(sink) => current = Some(Current { ticket, sink, done }),
                    Err(e) => {
                        warn!(ticket, "Playback could not start: {}", e);
                        let _ = done.send(EngineEvent::PlaybackEnded {
                            ticket,
                            outcome: PlaybackOutcome::Failed(e.to_string()),
                        });
                    }
                }
            }
            Ok(SinkCommand::Stop { ticket }) => {
                if current.as_ref().is_some_and(|c| c.ticket == ticket) {
                    if let Some(c) = current.take() {
                        info!("🔇 Playback stopped");
                        c.end(PlaybackOutcome::Cancelled);
                    }
                }
            }
            Ok(SinkCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        if current.as_ref().is_some_and(|c| c.sink.empty()) {
            if let Some(c) = current.take() {
                c.end(PlaybackOutcome::Completed);
            }
        }
    }
    if let Some(c) = current.take() {
        c.end(PlaybackOutcome::Cancelled);
    }
    debug!("Playback thread finished");
}

impl AudioSink for RodioSink {
    fn play(&mut self, ticket: u64, audio: Vec<u8>, done: EventSender) -> VoiceResult<PlaybackHandle> {
        self.commands
            .send(SinkCommand::Play { ticket, audio, done })
            .map_err(|_| VoiceError::Playback("playback thread stopped".to_string()))?;
        let commands = self.commands.clone();
        Ok(PlaybackHandle::new(ticket, move || {
            let _ = commands.send(SinkCommand::Stop { ticket });
        }))
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        let _ = self.commands.send(SinkCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Synthesis requests plus the single live playback handle.
pub struct PlaybackController {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Box<dyn AudioSink>,
    pending: Option<JoinHandle<()>>,
    active: Option<PlaybackHandle>,
}

impl PlaybackController {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sink: Box<dyn AudioSink>) -> Self {
        Self {
            synthesizer,
            sink,
            pending: None,
            active: None,
        }
    }

    /// Fetch audio for `text` in the background. The result arrives as
    /// `EngineEvent::Synthesized` stamped with `ticket`.
    pub fn request(
        &mut self,
        ticket: u64,
        text: String,
        emotion: Option<String>,
        timeout: Duration,
        inbox: EventSender,
    ) {
        if let Some(prev) = self.pending.take() {
            prev.abort();
        }
        let synthesizer = self.synthesizer.clone();
        self.pending = Some(tokio::spawn(async move {
            let result = within(
                timeout,
                synthesizer.synthesize(&text, emotion.as_deref()),
                VoiceError::SynthesisUnavailable,
            )
            .await;
            let _ = inbox.send(EngineEvent::Synthesized { ticket, result });
        }));
    }

    /// Start playback, tearing down any predecessor.
    pub fn start(&mut self, ticket: u64, audio: Vec<u8>, done: EventSender) -> VoiceResult<()> {
        self.pending = None;
        self.cancel();
        let handle = self.sink.play(ticket, audio, done)?;
        self.active = Some(handle);
        Ok(())
    }

    /// Abort any synthesis request and stop live output. Returns whether anything was live.
    pub fn cancel(&mut self) -> bool {
        let mut cancelled = false;
        if let Some(pending) = self.pending.take() {
            pending.abort();
            cancelled = true;
        }
        if let Some(handle) = self.active.take() {
            handle.cancel();
            cancelled = true;
        }
        cancelled
    }

    /// Playback `ticket` ended by itself. Returns false for a stale ticket.
    pub fn finish(&mut self, ticket: u64) -> bool {
        if self.active.as_ref().is_some_and(|h| h.ticket() == ticket) {
            if let Some(handle) = self.active.take() {
                handle.release();
            }
            return true;
        }
        false
    }
}
