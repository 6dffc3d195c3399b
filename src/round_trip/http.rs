use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::audio::buffer::AudioBlob;
use crate::config::ServiceConfig;
use crate::error::{Result, VoxError};
use crate::playback::AudioFetcher;

use super::{ChatRequest, ConversationService};

/// The Conversation Service over JSON/HTTP.
pub struct HttpConversationService {
    client: Client,
    base_url: String,
    chat_path: String,
    upload_path: String,
    health_path: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    audio_filepath: String,
}

impl HttpConversationService {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoxError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_path: config.chat_path.clone(),
            upload_path: config.upload_path.clone(),
            health_path: config.health_path.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Absolute references are used as-is; anything else is relative to the service.
    #[must_use]
    pub fn resolve(&self, reference: &str) -> String {
        if reference.starts_with("http") {
            reference.to_string()
        } else {
            self.endpoint(reference)
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(VoxError::Transport(format!("{what} returned {status}: {body}")))
    }
}

#[async_trait]
impl ConversationService for HttpConversationService {
    async fn upload_audio(&self, blob: &AudioBlob) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(blob.bytes.clone())
            .file_name(AudioBlob::FILE_NAME)
            .mime_str(blob.mime)
            .map_err(|e| VoxError::Audio(format!("failed to set MIME type: {e}")))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let response = self
            .client
            .post(self.endpoint(&self.upload_path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("upload failed: {e}")))?;

        let uploaded: UploadResponse = Self::check(response, "upload")
            .await?
            .json()
            .await
            .map_err(|e| VoxError::MalformedResponse(format!("bad upload response: {e}")))?;

        if uploaded.audio_filepath.trim().is_empty() {
            return Err(VoxError::MalformedResponse(
                "upload response has an empty audio_filepath".to_string(),
            ));
        }
        Ok(uploaded.audio_filepath)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint(&self.chat_path))
            .json(request)
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("chat request failed: {e}")))?;

        Self::check(response, "chat")
            .await?
            .json()
            .await
            .map_err(|e| VoxError::MalformedResponse(format!("chat reply is not JSON: {e}")))
    }

    async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint(&self.health_path))
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("health check failed: {e}")))?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl AudioFetcher for HttpConversationService {
    async fn fetch_audio(&self, audio_ref: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.resolve(audio_ref))
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("audio download failed: {e}")))?;

        let bytes = Self::check(response, "audio download")
            .await?
            .bytes()
            .await
            .map_err(|e| VoxError::Transport(format!("audio download interrupted: {e}")))?;
        Ok(bytes.to_vec())
    }
}
