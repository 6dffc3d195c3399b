pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::audio::buffer::AudioBlob;
use crate::conversation::ChatMessage;
use crate::error::{Result, VoxError};

/// What the user sent: typed text, or a reference to uploaded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Message,
    Audio,
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub user_message: String,
    pub dtype: Dtype,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

impl ChatRequest {
    fn new(user_message: String, dtype: Dtype, history: Vec<ChatMessage>) -> Self {
        Self {
            user_message,
            dtype,
            messages: (!history.is_empty()).then_some(history),
        }
    }
}

/// The remote agent. Implementations only move bytes; shaping replies is done
/// by [`normalize`].
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Upload a recording and return the server-side reference to it.
    async fn upload_audio(&self, blob: &AudioBlob) -> Result<String>;

    /// Send one conversational request and return the raw reply body.
    async fn chat(&self, request: &ChatRequest) -> Result<Value>;

    /// `true` when the service answers its liveness check with a 2xx.
    async fn health(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Text,
    Audio,
}

/// A service reply, whatever shape it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub content: String,
    /// What the service heard, for voice turns.
    pub transcript: Option<String>,
    pub audio_ref: Option<String>,
}

/// Placeholder shown for an audio reply that carried no text.
pub const AUDIO_REPLY_PLACEHOLDER: &str = "Audio response";

fn non_empty<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse a `/chat` reply into a [`Reply`].
///
/// Accepts the current `{type: "message" | "audio"}` shape as well as the older
/// `{type: "text" | "voice"}` one, where a `voice` reply carried the audio path in
/// `content`. A reply without a `type` is classified by whether it names audio.
pub fn normalize(body: &Value) -> Result<Reply> {
    if !body.is_object() {
        return Err(VoxError::MalformedResponse(format!(
            "expected a JSON object, got {body}"
        )));
    }

    let kind = body.get("type").and_then(Value::as_str);
    let content = non_empty(body, "content");
    let audio_path = non_empty(body, "audio_filepath");
    let transcript = non_empty(body, "transcribed_text").map(str::to_string);

    match kind {
        Some("audio") | None if audio_path.is_some() => Ok(Reply {
            kind: ReplyKind::Audio,
            content: content.unwrap_or(AUDIO_REPLY_PLACEHOLDER).to_string(),
            transcript,
            audio_ref: audio_path.map(str::to_string),
        }),
        Some("voice") => {
            let (audio_ref, content) = match (audio_path, content) {
                (Some(path), content) => (path, content.unwrap_or(AUDIO_REPLY_PLACEHOLDER)),
                (None, Some(path)) => (path, AUDIO_REPLY_PLACEHOLDER),
                (None, None) => {
                    return Err(VoxError::MalformedResponse(
                        "voice reply names no audio".to_string(),
                    ));
                }
            };
            Ok(Reply {
                kind: ReplyKind::Audio,
                content: content.to_string(),
                transcript,
                audio_ref: Some(audio_ref.to_string()),
            })
        }
        Some("audio") => Err(VoxError::MalformedResponse(
            "audio reply is missing audio_filepath".to_string(),
        )),
        Some("message" | "text") | None => {
            let content = content.ok_or_else(|| {
                VoxError::MalformedResponse("reply is missing content".to_string())
            })?;
            Ok(Reply {
                kind: ReplyKind::Text,
                content: content.to_string(),
                transcript,
                audio_ref: None,
            })
        }
        Some(other) => Err(VoxError::MalformedResponse(format!(
            "unknown reply type: {other}"
        ))),
    }
}

/// One completed voice round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceExchange {
    /// Server-side reference to the uploaded recording.
    pub upload_ref: String,
    pub reply: Reply,
}

/// Turns captured audio or typed text into a service request and its reply.
pub struct ConversationRoundTrip {
    service: Arc<dyn ConversationService>,
}

impl ConversationRoundTrip {
    #[must_use]
    pub fn new(service: Arc<dyn ConversationService>) -> Self {
        Self { service }
    }

    /// Upload the recording, then ask the service to answer it.
    pub async fn voice_turn(
        &self,
        blob: &AudioBlob,
        history: Vec<ChatMessage>,
    ) -> Result<VoiceExchange> {
        let upload_ref = self.service.upload_audio(blob).await?;
        tracing::debug!("round trip: uploaded {} bytes as {upload_ref}", blob.len());

        let request = ChatRequest::new(upload_ref.clone(), Dtype::Audio, history);
        let reply = normalize(&self.service.chat(&request).await?)?;
        tracing::debug!("round trip: {:?} reply", reply.kind);

        Ok(VoiceExchange { upload_ref, reply })
    }

    pub async fn text_turn(&self, text: &str, history: Vec<ChatMessage>) -> Result<Reply> {
        let request = ChatRequest::new(text.to_string(), Dtype::Message, history);
        normalize(&self.service.chat(&request).await?)
    }

    pub async fn health(&self) -> Result<bool> {
        self.service.health().await
    }

    #[must_use]
    pub fn service(&self) -> Arc<dyn ConversationService> {
        Arc::clone(&self.service)
    }
}

/// Poll the service's liveness endpoint every `interval` and publish the result.
/// The first check runs immediately. The task ends once every receiver is gone.
pub fn spawn_health_monitor(
    service: Arc<dyn ConversationService>,
    interval: Duration,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = tx.closed() => break,
                _ = ticker.tick() => {}
            }

            let online = match service.health().await {
                Ok(online) => online,
                Err(e) => {
                    tracing::debug!("health check failed: {e}");
                    false
                }
            };

            let changed = tx.send_if_modified(|current| {
                let changed = *current != online;
                *current = online;
                changed
            });
            if changed {
                if online {
                    tracing::info!("conversation service is reachable");
                } else {
                    tracing::warn!("conversation service is unreachable");
                }
            }
        }
    });

    rx
}
