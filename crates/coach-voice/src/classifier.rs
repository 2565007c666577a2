//! Speech classifiers: one boolean verdict per audio block.
//!
//! The classifier is an opaque capability behind `initialize` / `classify`. Two real
//! implementations ship here (RMS energy and WebRTC VAD) plus a scripted double.
//! WebRTC VAD is not `Send`, so classifiers are built through a factory on the thread
//! that runs them.

use crate::audio::AudioBlock;
use crate::config::ClassifierKind;
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Per-block speech detector. `classify` runs on the real-time path and must finish
/// within one block duration.
pub trait SpeechClassifier {
    /// Fix the sensitivity. Called once, before the first block.
    fn initialize(&mut self, threshold: f32) -> VoiceResult<()>;

    /// `true` when the block contains speech. The block carries its own sample rate.
    fn classify(&mut self, block: &AudioBlock) -> bool;
}

/// Builds a ready-to-use classifier on the thread that will own it.
pub type ClassifierFactory =
    Arc<dyn Fn() -> VoiceResult<Box<dyn SpeechClassifier>> + Send + Sync>;

/// Factory for the configured classifier kind with a fixed threshold.
pub fn classifier_factory(kind: ClassifierKind, threshold: f32) -> ClassifierFactory {
    Arc::new(move || {
        let mut classifier: Box<dyn SpeechClassifier> = match kind {
            ClassifierKind::Energy => Box::new(EnergyClassifier::default()),
            ClassifierKind::Webrtc => Box::new(WebRtcClassifier::new()),
        };
        classifier.initialize(threshold)?;
        Ok(classifier)
    })
}

fn validate_threshold(threshold: f32) -> VoiceResult<()> {
    if threshold.is_finite() && threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(VoiceError::Classifier(format!(
            "threshold must be in (0, 1], got {}",
            threshold
        )))
    }
}

fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|s| s * s).sum();
    (sum / block.len() as f32).sqrt()
}

/// Speech when block RMS reaches the threshold (0.02 in the web client).
#[derive(Debug, Default)]
pub struct EnergyClassifier {
    threshold: Option<f32>,
}

impl SpeechClassifier for EnergyClassifier {
    fn initialize(&mut self, threshold: f32) -> VoiceResult<()> {
        validate_threshold(threshold)?;
        if self.threshold.is_some() {
            return Err(VoiceError::Classifier("already initialized".to_string()));
        }
        info!("🎙️ Energy classifier ready (rms threshold {})", threshold);
        self.threshold = Some(threshold);
        Ok(())
    }

    fn classify(&mut self, block: &AudioBlock) -> bool {
        match self.threshold {
            Some(t) => rms(&block.samples) >= t,
            None => false,
        }
    }
}

/// WebRTC rate the block is resampled to before voicing is checked.
const WEBRTC_RATE: u32 = 16_000;
/// 30ms frames at 16kHz.
const WEBRTC_FRAME: usize = 480;

/// WebRTC VAD over 30ms sub-frames, gated by the energy threshold.
///
/// Speech requires both block RMS at or above the threshold and a majority of voiced
/// sub-frames. Each block is decimated from its own sample rate to 16kHz.
pub struct WebRtcClassifier {
    vad: Vad,
    threshold: Option<f32>,
}

impl WebRtcClassifier {
    pub fn new() -> Self {
        let mut vad = Vad::new();
        vad.set_mode(VadMode::Aggressive);
        vad.set_sample_rate(SampleRate::Rate16kHz);
        Self {
            vad,
            threshold: None,
        }
    }
}

/// Nearest-sample decimation to 16kHz PCM.
fn to_16k_i16(samples: &[f32], source_rate: u32) -> Vec<i16> {
    if source_rate == 0 {
        return Vec::new();
    }
    let out_len = (samples.len() as u64 * WEBRTC_RATE as u64 / source_rate as u64) as usize;
    (0..out_len)
        .filter_map(|i| {
            let src = (i as f64 * source_rate as f64 / WEBRTC_RATE as f64) as usize;
            samples.get(src)
        })
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

impl Default for WebRtcClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn initialize(&mut self, threshold: f32) -> VoiceResult<()> {
        validate_threshold(threshold)?;
        if self.threshold.is_some() {
            return Err(VoiceError::Classifier("already initialized".to_string()));
        }
        info!("🎙️ WebRTC classifier ready (rms gate {})", threshold);
        self.threshold = Some(threshold);
        Ok(())
    }

    fn classify(&mut self, block: &AudioBlock) -> bool {
        let Some(threshold) = self.threshold else {
            return false;
        };
        if rms(&block.samples) < threshold {
            return false;
        }
        let pcm = to_16k_i16(&block.samples, block.sample_rate);
        let mut frames = 0usize;
        let mut voiced = 0usize;
        for frame in pcm.chunks_exact(WEBRTC_FRAME) {
            frames += 1;
            match self.vad.is_voice_segment(frame) {
                Ok(true) => voiced += 1,
                Ok(false) => {}
                Err(e) => debug!("WebRTC VAD rejected frame: {:?}", e),
            }
        }
        frames > 0 && voiced * 2 >= frames
    }
}

/// Returns pre-recorded verdicts in order, then `false` forever. For deterministic tests
/// and dry runs.
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    verdicts: VecDeque<bool>,
}

impl ScriptedClassifier {
    pub fn new(verdicts: impl IntoIterator<Item = bool>) -> Self {
        Self {
            verdicts: verdicts.into_iter().collect(),
        }
    }
}

impl SpeechClassifier for ScriptedClassifier {
    fn initialize(&mut self, threshold: f32) -> VoiceResult<()> {
        validate_threshold(threshold)
    }

    fn classify(&mut self, _block: &AudioBlock) -> bool {
        self.verdicts.pop_front().unwrap_or(false)
    }
}
