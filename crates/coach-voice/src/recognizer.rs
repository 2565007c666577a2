//! Listening sessions: gap-based end-of-utterance detection followed by transcription.
//!
//! The segmenter implements the 800ms "gap logic" on classified blocks. Elapsed time is
//! measured in captured samples rather than wall-clock time, so segmentation is the same
//! whether blocks arrive live or from a buffer. A completed utterance is handed to an
//! `SttBackend`; the result comes back to the engine as `EngineEvent::Transcript`.

use crate::engine::{EngineEvent, EventSender};
use crate::error::{within, VoiceError, VoiceResult};
use crate::monitor::ClassifiedBlock;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Segmentation timings.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterSettings {
    /// Silence after speech that ends the utterance (default: 800ms)
    pub silence_gap: Duration,

    /// Utterances shorter than this are dropped (default: 200ms)
    pub min_speech: Duration,

    /// Utterances are cut at this length (default: 30s)
    pub max_utterance: Duration,

    /// A session with no speech at all ends empty after this long (default: 8s)
    pub listen_timeout: Duration,

    /// Audio kept from before a session opens, so a barge-in keeps its first words
    /// (default: 300ms)
    pub pre_roll: Duration,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            silence_gap: Duration::from_millis(800),
            min_speech: Duration::from_millis(200),
            max_utterance: Duration::from_secs(30),
            listen_timeout: Duration::from_secs(8),
            pre_roll: Duration::from_millis(300),
        }
    }
}

/// Captured speech ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Span from the first to the last speech block.
    pub duration: Duration,
}

/// Result of pushing one block.
#[derive(Debug)]
pub enum Segment {
    Pending,
    Utterance(Utterance),
    /// Listen timeout elapsed without any speech.
    NoSpeech,
    /// Speech ended but was shorter than the minimum; listening continues.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GapState {
    Waiting,
    Speaking,
    Silence,
}

pub struct Segmenter {
    settings: SegmenterSettings,
    state: GapState,
    buffer: Vec<f32>,
    sample_rate: u32,
    speech: Duration,
    silence: Duration,
    waited: Duration,
}

impl Segmenter {
    pub fn new(settings: SegmenterSettings) -> Self {
        Self {
            settings,
            state: GapState::Waiting,
            buffer: Vec::new(),
            sample_rate: 0,
            speech: Duration::ZERO,
            silence: Duration::ZERO,
            waited: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.state = GapState::Waiting;
        self.buffer.clear();
        self.speech = Duration::ZERO;
        self.silence = Duration::ZERO;
        self.waited = Duration::ZERO;
    }

    pub fn push(&mut self, classified: &ClassifiedBlock) -> Segment {
        let block = &classified.block;
        let span = block.duration();

        match (self.state, classified.speech) {
            (GapState::Waiting, false) => {
                self.waited += span;
                if self.waited >= self.settings.listen_timeout {
                    info!("⌛ No speech within {:?}", self.settings.listen_timeout);
                    self.reset();
                    return Segment::NoSpeech;
                }
                Segment::Pending
            }
            (GapState::Waiting, true) => {
                debug!("🎤 Speech started");
                self.state = GapState::Speaking;
                self.sample_rate = block.sample_rate;
                self.buffer.extend_from_slice(&block.samples);
                self.speech = span;
                self.check_max()
            }
            (GapState::Speaking, true) => {
                self.buffer.extend_from_slice(&block.samples);
                self.speech += span;
                self.check_max()
            }
            (GapState::Speaking, false) => {
                debug!("🤫 Silence detected");
                self.state = GapState::Silence;
                self.buffer.extend_from_slice(&block.samples);
                self.silence = span;
                self.check_gap()
            }
            (GapState::Silence, true) => {
                // false alarm, the pause counts toward the utterance
                self.state = GapState::Speaking;
                self.buffer.extend_from_slice(&block.samples);
                self.speech += self.silence + span;
                self.silence = Duration::ZERO;
                self.check_max()
            }
            (GapState::Silence, false) => {
                self.buffer.extend_from_slice(&block.samples);
                self.silence += span;
                self.check_gap()
            }
        }
    }

    fn check_max(&mut self) -> Segment {
        if self.speech >= self.settings.max_utterance {
            warn!("⏱️ Max utterance length reached, committing");
            return self.commit();
        }
        Segment::Pending
    }

    fn check_gap(&mut self) -> Segment {
        if self.silence >= self.settings.silence_gap {
            return self.commit();
        }
        Segment::Pending
    }

    fn commit(&mut self) -> Segment {
        let duration = self.speech;
        if duration < self.settings.min_speech {
            debug!("⏭️ Speech too short ({:?}), ignoring", duration);
            self.reset();
            return Segment::Discarded;
        }
        info!(
            "🎯 Utterance committed: {:?} speech, {} samples",
            duration,
            self.buffer.len()
        );
        let utterance = Utterance {
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.sample_rate,
            duration,
        };
        self.reset();
        Segment::Utterance(utterance)
    }
}

/// Speech-to-text capability. An empty string means nothing intelligible was heard.
#[async_trait::async_trait]
pub trait SttBackend: Send + Sync {
    async fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String>;
}

/// Encode mono f32 PCM as 16-bit WAV for upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Returns a fixed transcript. For exercising the loop without a transcription service.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait::async_trait]
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[placeholder transcript: {} samples, {:.1}s]",
            utterance.samples.len(),
            utterance.duration.as_secs_f32()
        ))
    }
}

/// OpenAI-compatible `/audio/transcriptions` endpoint.
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY`, and `STT_MODEL`
/// (default whisper-1).
#[derive(Debug, Clone)]
pub struct HttpStt {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl HttpStt {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .map_err(|_| VoiceError::Config("STT requires STT_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl SttBackend for HttpStt {
    async fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&utterance.samples, utterance.sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

/// `HttpStt` when `STT_API_KEY` is set, otherwise the placeholder.
pub fn create_best_stt() -> Arc<dyn SttBackend> {
    match HttpStt::from_env() {
        Ok(stt) => {
            info!("🗣️ Using remote STT at {} ({})", stt.base_url, stt.model);
            Arc::new(stt)
        }
        Err(_) => {
            warn!("STT_API_KEY not set; using placeholder transcripts");
            Arc::new(PlaceholderStt::new())
        }
    }
}

/// Listening sessions as the engine sees them.
pub trait Recognizer: Send {
    /// Start a session. Exactly one `EngineEvent::Transcript` stamped with `ticket` will be
    /// sent to `sink`, unless the session is cancelled first.
    fn begin(&mut self, ticket: u64, sink: EventSender) -> VoiceResult<()>;

    /// Abandon the current session, if any.
    fn cancel(&mut self);
}

enum Control {
    Begin { ticket: u64, sink: EventSender },
    Cancel,
}

/// Segmenter plus STT backend driven by a background task fed from the monitor tap.
pub struct GapRecognizer {
    control: mpsc::UnboundedSender<Control>,
}

impl GapRecognizer {
    /// Must be called inside a Tokio runtime.
    pub fn spawn(
        blocks: mpsc::UnboundedReceiver<ClassifiedBlock>,
        stt: Arc<dyn SttBackend>,
        settings: SegmenterSettings,
        timeout: Duration,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_sessions(control_rx, blocks, stt, settings, timeout));
        Self { control }
    }
}

impl Recognizer for GapRecognizer {
    fn begin(&mut self, ticket: u64, sink: EventSender) -> VoiceResult<()> {
        self.control
            .send(Control::Begin { ticket, sink })
            .map_err(|_| VoiceError::ChannelClosed("recognizer task stopped".to_string()))
    }

    fn cancel(&mut self) {
        let _ = self.control.send(Control::Cancel);
    }
}

/// Recent blocks heard outside a session, bounded by total duration.
struct PreRoll {
    limit: Duration,
    held: Duration,
    blocks: VecDeque<ClassifiedBlock>,
}

impl PreRoll {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            held: Duration::ZERO,
            blocks: VecDeque::new(),
        }
    }

    fn push(&mut self, block: ClassifiedBlock) {
        self.held += block.block.duration();
        self.blocks.push_back(block);
        while self.held > self.limit {
            match self.blocks.pop_front() {
                Some(old) => self.held = self.held.saturating_sub(old.block.duration()),
                None => break,
            }
        }
    }

    /// The speech run the buffer ends on, oldest first. Empty if the last block is silent.
    fn take_trailing_speech(&mut self) -> Vec<ClassifiedBlock> {
        let run = self.blocks.iter().rev().take_while(|b| b.speech).count();
        let start = self.blocks.len() - run;
        let speech = self.blocks.drain(start..).collect();
        self.clear();
        speech
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.held = Duration::ZERO;
    }
}

struct Sessions {
    segmenter: Segmenter,
    active: Option<(u64, EventSender)>,
    stt: Arc<dyn SttBackend>,
    timeout: Duration,
}

impl Sessions {
    fn push(&mut self, block: &ClassifiedBlock) {
        match self.segmenter.push(block) {
            Segment::Pending | Segment::Discarded => {}
            Segment::NoSpeech => {
                if let Some((ticket, sink)) = self.active.take() {
                    let _ = sink.send(EngineEvent::Transcript {
                        ticket,
                        result: Ok(String::new()),
                    });
                }
            }
            Segment::Utterance(utterance) => {
                if let Some((ticket, sink)) = self.active.take() {
                    let stt = self.stt.clone();
                    let timeout = self.timeout;
                    tokio::spawn(async move {
                        let result =
                            within(timeout, stt.transcribe(&utterance), VoiceError::Transcription)
                                .await;
                        let _ = sink.send(EngineEvent::Transcript { ticket, result });
                    });
                }
            }
        }
    }
}

async fn run_sessions(
    mut control: mpsc::UnboundedReceiver<Control>,
    mut blocks: mpsc::UnboundedReceiver<ClassifiedBlock>,
    stt: Arc<dyn SttBackend>,
    settings: SegmenterSettings,
    timeout: Duration,
) {
    let mut sessions = Sessions {
        segmenter: Segmenter::new(settings),
        active: None,
        stt,
        timeout,
    };
    let mut pre_roll = PreRoll::new(settings.pre_roll);

    loop {
        tokio::select! {
            biased;
            ctl = control.recv() => match ctl {
                Some(Control::Begin { ticket, sink }) => {
                    sessions.segmenter.reset();
                    sessions.active = Some((ticket, sink));
                    let seed = pre_roll.take_trailing_speech();
                    debug!(ticket, pre_roll_blocks = seed.len(), "Listening session opened");
                    for block in &seed {
                        if sessions.active.is_none() {
                            break;
                        }
                        sessions.push(block);
                    }
                }
                Some(Control::Cancel) => {
                    sessions.segmenter.reset();
                    sessions.active = None;
                    pre_roll.clear();
                }
                None => break,
            },
            block = blocks.recv() => {
                let Some(block) = block else { break };
                if sessions.active.is_none() {
                    pre_roll.push(block);
                    continue;
                }
                sessions.push(&block);
            }
        }
    }
    debug!("Recognizer task finished");
}
