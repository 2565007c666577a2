//! Coach configuration: built-in defaults, an optional TOML file, then environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | COACH_CONFIG_PATH | unset | Optional TOML file layered under the environment. |
//! | COACH_BACKEND_URL | http://localhost:8001 | Base URL for conversation, history and tts. |
//! | COACH_SESSION_ID | unset | Fixed session identity; otherwise `session_<unix millis>`. |
//! | COACH_CLASSIFIER | energy | `energy` (RMS threshold) or `webrtc`. |
//! | COACH_VAD_THRESHOLD | 0.02 | Classifier sensitivity, fixed for the process lifetime. |
//! | COACH_SAMPLE_RATE | 44100 | Capture sample rate in Hz. |
//! | COACH_BLOCK_SIZE | 2048 | Samples per audio block. |
//! | COACH_BARGE_IN_COOLDOWN_MS | 2000 | Suppression window after an interruption. |
//! | COACH_BARGE_IN_MIN_BLOCKS | 1 | Contiguous speech blocks needed to raise an interruption. |
//! | COACH_REQUEST_TIMEOUT_MS | 15000 | Upper bound on every remote call. |
//! | COACH_ON_DIALOGUE_FAILURE | idle | `idle` or `listen`. |
//! | COACH_SILENCE_GAP_MS | 800 | Silence after speech that ends an utterance. |
//! | COACH_MIN_SPEECH_MS | 200 | Shorter utterances are dropped. |
//! | COACH_MAX_UTTERANCE_MS | 30000 | Utterances are cut at this length. |
//! | COACH_LISTEN_TIMEOUT_MS | 8000 | Listening session ends empty when nobody speaks. |
//! | COACH_PRE_ROLL_MS | 300 | Speech heard just before a session opens is kept. |
//! | COACH_HYDRATE_HISTORY | true | Fetch remote history once at startup. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where the engine goes when the dialogue request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogueFailurePolicy {
    #[default]
    Idle,
    Listen,
}

/// Which speech classifier the frame source runs per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[default]
    Energy,
    Webrtc,
}

fn default_backend_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_vad_threshold() -> f32 {
    0.02
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_block_size() -> usize {
    2048
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_min_blocks() -> u32 {
    1
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_silence_gap_ms() -> u64 {
    800
}

fn default_min_speech_ms() -> u64 {
    200
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_listen_timeout_ms() -> u64 {
    8000
}

fn default_pre_roll_ms() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Full runtime configuration. Every field has a default so a partial TOML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub classifier: ClassifierKind,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_cooldown_ms")]
    pub barge_in_cooldown_ms: u64,
    #[serde(default = "default_min_blocks")]
    pub barge_in_min_blocks: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub on_dialogue_failure: DialogueFailurePolicy,
    #[serde(default = "default_silence_gap_ms")]
    pub silence_gap_ms: u64,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u64,
    #[serde(default = "default_true")]
    pub hydrate_history: bool,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            session_id: None,
            classifier: ClassifierKind::default(),
            vad_threshold: default_vad_threshold(),
            sample_rate: default_sample_rate(),
            block_size: default_block_size(),
            barge_in_cooldown_ms: default_cooldown_ms(),
            barge_in_min_blocks: default_min_blocks(),
            request_timeout_ms: default_request_timeout_ms(),
            on_dialogue_failure: DialogueFailurePolicy::default(),
            silence_gap_ms: default_silence_gap_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            listen_timeout_ms: default_listen_timeout_ms(),
            pre_roll_ms: default_pre_roll_ms(),
            hydrate_history: true,
        }
    }
}

impl CoachConfig {
    /// Defaults, then the TOML file at `COACH_CONFIG_PATH` (if set), then `COACH_*` variables.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("COACH_CONFIG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Self::load_layered(
            path.as_deref().map(Path::new),
            config::Environment::with_prefix("COACH"),
        )
    }

    /// Layer `file` (when given) and then `env` over the built-in defaults, and validate.
    /// Values that do not parse as their field's type are errors, not silently skipped.
    pub fn load_layered(file: Option<&Path>, env: config::Environment) -> VoiceResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> VoiceResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::Config("sample_rate must be non-zero".to_string()));
        }
        if self.block_size == 0 {
            return Err(VoiceError::Config("block_size must be non-zero".to_string()));
        }
        if !(self.vad_threshold > 0.0 && self.vad_threshold <= 1.0) {
            return Err(VoiceError::Config(format!(
                "vad_threshold must be in (0, 1], got {}",
                self.vad_threshold
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(VoiceError::Config("request_timeout_ms must be non-zero".to_string()));
        }
        if self.barge_in_min_blocks == 0 {
            return Err(VoiceError::Config("barge_in_min_blocks must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Real-time budget of one block; classification must finish inside it.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    pub fn barge_in_cooldown(&self) -> Duration {
        Duration::from_millis(self.barge_in_cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn silence_gap(&self) -> Duration {
        Duration::from_millis(self.silence_gap_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn pre_roll(&self) -> Duration {
        Duration::from_millis(self.pre_roll_ms)
    }
}
