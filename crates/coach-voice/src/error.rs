//! Error types for the coach voice front end.
//!
//! Every collaborator converts its failures into one of these variants at the
//! point of origin, so the engine only ever sees the taxonomy below.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the voice front end
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Transcript was empty")]
    EmptyTranscript,

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Dialogue service unavailable: {0}")]
    DialogueUnavailable(String),

    #[error("Speech synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Speech classifier error: {0}")]
    Classifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceUnavailable,
    EmptyTranscript,
    TranscriptionFailed,
    DialogueUnavailable,
    SynthesisUnavailable,
    Internal,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            VoiceError::EmptyTranscript => ErrorKind::EmptyTranscript,
            VoiceError::Transcription(_) => ErrorKind::TranscriptionFailed,
            VoiceError::DialogueUnavailable(_) => ErrorKind::DialogueUnavailable,
            VoiceError::SynthesisUnavailable(_) | VoiceError::Playback(_) => {
                ErrorKind::SynthesisUnavailable
            }
            VoiceError::Classifier(_)
            | VoiceError::Config(_)
            | VoiceError::ChannelClosed(_)
            | VoiceError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure should be surfaced to the user. An empty transcript is not.
    pub fn is_user_visible(&self) -> bool {
        self.kind() != ErrorKind::EmptyTranscript
    }
}

/// Bound a remote call. Expiry is reported through `on_timeout` so the caller keeps its own
/// failure kind (a stalled dialogue request is still `DialogueUnavailable`).
pub async fn within<T, F>(
    limit: Duration,
    fut: F,
    on_timeout: impl FnOnce(String) -> VoiceError,
) -> VoiceResult<T>
where
    F: Future<Output = VoiceResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!("no response within {:?}", limit))),
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}
