//! ============================================================================
//! Guide API Client - HTTP access to the tour server
//! ============================================================================
//! Talks to the guide server for everything that needs a network:
//! - Remote TTS generation (Clova) for on-demand narration
//! - Pre-generated narration audio for offline download
//! - City and landmark packages
//! - Visit reporting for the offline outbox
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{City, Landmark};

/// Request body for remote TTS synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClovaRequest {
    pub text: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// -5 (fast) ..= 5 (slow)
    pub speed: i32,
    pub pitch: i32,
    pub volume: i32,
}

impl ClovaRequest {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            voice: None,
            speed: 0,
            pitch: 0,
            volume: 0,
        }
    }
}

/// Request body for narration audio generation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioGenerateRequest {
    pub landmark_id: String,
    pub language: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

/// Server reply describing a generated narration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedAudio {
    pub audio_url: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitedRequest<'a> {
    landmark_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Everything the guide needs from the server
#[async_trait]
pub trait NarrationApi: Send + Sync {
    /// Synthesize speech remotely; returns encoded audio bytes
    async fn synthesize_clova(&self, request: &ClovaRequest) -> Result<Vec<u8>>;

    async fn generate_audio(&self, request: &AudioGenerateRequest) -> Result<GeneratedAudio>;

    /// Download audio bytes from an absolute or server-relative URL
    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>>;

    async fn fetch_city(&self, city_id: &str) -> Result<City>;

    async fn fetch_landmarks(&self, city_id: &str) -> Result<Vec<Landmark>>;

    /// Report a visit. `Ok(false)` means the server answered with a non-2xx
    /// status; `Err` means the request never completed.
    async fn post_visited(&self, landmark_id: &str, session_id: Option<&str>) -> Result<bool>;
}

/// reqwest-backed client for the guide server
pub struct GuideApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl GuideApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("Guide API client targeting {}", base_url);
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a server-relative path against the base URL
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    /// Base URL plus path segments, each percent-encoded
    pub fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| anyhow!("Invalid base URL {}: {}", self.base_url, e))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Base URL {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn city_request(&self, city_id: &str) -> Result<reqwest::RequestBuilder> {
        Ok(self.client.get(self.endpoint(&["api", "cities", city_id])?))
    }

    fn landmarks_request(&self, city_id: &str) -> Result<reqwest::RequestBuilder> {
        Ok(self
            .client
            .get(self.endpoint(&["api", "landmarks"])?)
            .query(&[("cityId", city_id)]))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch {}: {}", what, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Fetching {} failed {}: {}", what, status, body));
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse {}: {}", what, e))
    }
}

#[async_trait]
impl NarrationApi for GuideApiClient {
    async fn synthesize_clova(&self, request: &ClovaRequest) -> Result<Vec<u8>> {
        debug!("Requesting remote TTS ({} chars, {})", request.text.len(), request.language);

        let response = self
            .client
            .post(self.resolve_url("/api/tts/clova/generate"))
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call TTS endpoint: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("TTS generation error {}: {}", status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read TTS audio: {}", e))?;
        Ok(bytes.to_vec())
    }

    async fn generate_audio(&self, request: &AudioGenerateRequest) -> Result<GeneratedAudio> {
        let response = self
            .client
            .post(self.resolve_url("/api/audio/generate"))
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call audio generation: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Server error {}: {}", status, body));
        }

        let generated: GeneratedAudio = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse audio generation response: {}", e))?;

        debug!("Generated audio for {} at {}", request.landmark_id, generated.audio_url);
        Ok(generated)
    }

    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        let url = self.resolve_url(url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to download audio: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Audio download failed with status {}",
                response.status()
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read audio bytes: {}", e))?;
        Ok(bytes.to_vec())
    }

    async fn fetch_city(&self, city_id: &str) -> Result<City> {
        self.get_json(self.city_request(city_id)?, "city").await
    }

    async fn fetch_landmarks(&self, city_id: &str) -> Result<Vec<Landmark>> {
        let landmarks: Vec<Landmark> = self
            .get_json(self.landmarks_request(city_id)?, "landmarks")
            .await?;
        info!("Fetched {} landmarks for {}", landmarks.len(), city_id);
        Ok(landmarks)
    }

    async fn post_visited(&self, landmark_id: &str, session_id: Option<&str>) -> Result<bool> {
        let response = self
            .client
            .post(self.resolve_url("/api/visited"))
            .json(&VisitedRequest {
                landmark_id,
                session_id,
            })
            .send()
            .await
            .map_err(|e| anyhow!("Failed to post visit: {}", e))?;

        Ok(response.status().is_success())
    }
}
