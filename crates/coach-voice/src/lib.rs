//! # Coach Voice - Full-Duplex Voice Front End
//!
//! Listens continuously, lets the user interrupt ("barge in on") the coach's spoken
//! replies, and sequences capture, transcription, dialogue and playback through one
//! serialized turn-taking engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Turn-Taking Engine                          │
//! │          Idle → Listening → Processing → Speaking ─┐             │
//! │                    ↑                               │             │
//! │                    └──── completion / barge-in ────┘             │
//! │                                                                  │
//! │  ┌────────────┐  ┌───────────────┐  ┌──────────────┐             │
//! │  │  Audio In  │→ │ Barge-In      │→ │  Recognizer  │→ Dialogue   │
//! │  │   (cpal)   │  │ Monitor (VAD) │  │ (800ms gap)  │   (HTTP)    │
//! │  └────────────┘  └───────────────┘  └──────────────┘      ↓      │
//! │                         │ interrupt                       TTS    │
//! │                         ↓                                  ↓     │
//! │                  ┌──────────────┐                  ┌───────────┐ │
//! │                  │  Kill Signal │ ───────────────→ │ Audio Out │ │
//! │                  └──────────────┘                  │  (rodio)  │ │
//! │                                                    └───────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod classifier;
pub mod config;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod playback;
pub mod recognizer;
pub mod session;

pub use audio::{AudioBlock, AudioConfig, BlockAssembler, BlockSender, CpalFrameSource, FrameSource};
pub use classifier::{
    classifier_factory, ClassifierFactory, EnergyClassifier, ScriptedClassifier, SpeechClassifier,
    WebRtcClassifier,
};
pub use config::{ClassifierKind, CoachConfig, DialogueFailurePolicy};
pub use dialogue::{hydrate_session, record_exchange, DialogueReply, DialogueService, HttpDialogueClient};
pub use engine::{
    Collaborators, Engine, EngineEvent, EngineHandle, EngineSettings, EngineState, EngineUpdate,
    EventSender, Notice,
};
pub use error::{within, ErrorKind, VoiceError, VoiceResult};
pub use monitor::{
    BargeInMonitor, CaptureControl, ClassifiedBlock, MonitorSettings, MonitoredCapture,
    SpeakingGate, Verdict,
};
pub use playback::{
    AudioSink, HttpSynthesizer, PlaceholderSynthesizer, PlaybackController, PlaybackHandle,
    PlaybackOutcome, RodioSink, Synthesizer,
};
pub use recognizer::{
    create_best_stt, GapRecognizer, HttpStt, PlaceholderStt, Recognizer, SegmenterSettings,
    SttBackend, Utterance,
};
pub use session::{HistoryEntry, Role, Session, SessionId, Turn};
