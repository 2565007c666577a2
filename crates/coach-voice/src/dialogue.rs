//! Dialogue client: transcript plus session identity in, reply text with emotion and intent
//! labels out.

use crate::error::{VoiceError, VoiceResult};
use crate::session::{HistoryEntry, Session, SessionId, Turn};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Reply from `POST /api/conversation`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DialogueReply {
    pub response: String,
    #[serde(default)]
    pub detected_emotion: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Serialize)]
struct ConversationRequest<'a> {
    session_id: &'a str,
    text: &'a str,
}

/// Remote conversation backend.
#[async_trait::async_trait]
pub trait DialogueService: Send + Sync {
    async fn converse(&self, session: &SessionId, transcript: &str) -> VoiceResult<DialogueReply>;

    /// Most recent exchanges for `session`, oldest first.
    async fn history(&self, session: &SessionId) -> VoiceResult<Vec<HistoryEntry>>;
}

/// HTTP client for the coaching backend.
pub struct HttpDialogueClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDialogueClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> VoiceError {
    VoiceError::DialogueUnavailable(format!("{}: {}", context, err))
}

#[async_trait::async_trait]
impl DialogueService for HttpDialogueClient {
    async fn converse(&self, session: &SessionId, transcript: &str) -> VoiceResult<DialogueReply> {
        let url = format!("{}/api/conversation", self.base_url);
        let body = ConversationRequest {
            session_id: session.as_str(),
            text: transcript,
        };

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable("conversation request failed", e))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::DialogueUnavailable(format!(
                "conversation API error {}: {}",
                status, body
            )));
        }

        let reply: DialogueReply = res
            .json()
            .await
            .map_err(|e| unavailable("conversation response parse failed", e))?;
        Ok(reply)
    }

    async fn history(&self, session: &SessionId) -> VoiceResult<Vec<HistoryEntry>> {
        let url = format!("{}/api/history/{}", self.base_url, session);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable("history request failed", e))?;

        if !res.status().is_success() {
            return Err(VoiceError::DialogueUnavailable(format!(
                "history API error {}",
                res.status()
            )));
        }

        res.json()
            .await
            .map_err(|e| unavailable("history response parse failed", e))
    }
}

/// Append the user turn and then the system turn for one completed exchange.
pub fn record_exchange(session: &mut Session, transcript: &str, reply: &DialogueReply) -> [Turn; 2] {
    let user = Turn::user(transcript);
    let system = Turn::system(
        reply.response.clone(),
        reply.detected_emotion.clone(),
        reply.intent.clone(),
    )
    .with_confidence(reply.confidence);
    session.append(user.clone());
    session.append(system.clone());
    [user, system]
}

/// Load remote history into an empty session. Failures are logged and leave it empty.
pub async fn hydrate_session(service: &dyn DialogueService, session: &mut Session) -> usize {
    match service.history(session.id()).await {
        Ok(entries) => {
            let added = session.hydrate(entries);
            info!(session_id = %session.id(), turns = added, "📜 Restored conversation history");
            added
        }
        Err(e) => {
            warn!(session_id = %session.id(), "History unavailable, starting fresh: {}", e);
            0
        }
    }
}
