//! ============================================================================
//! Audio Downloader - Pre-generated narration for offline playback
//! ============================================================================
//! Asks the server to generate narration for each landmark, downloads the
//! MP3 and stores it in the offline cache. Progress per (landmark, language)
//! moves pending(0) -> downloading(10) -> generated(50) -> fetched(90) ->
//! complete(100), or ends in error.
//! ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::client::{AudioGenerateRequest, NarrationApi};
use crate::db::{CachedAudio, OfflineStore};
use crate::types::{DownloadProgress, DownloadStatus, Landmark};

const DEFAULT_PACING: Duration = Duration::from_millis(300);

/// Result of a bulk download
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    /// (landmark id, error message)
    pub failed: Vec<(String, String)>,
}

pub struct AudioDownloader {
    store: Arc<OfflineStore>,
    api: Arc<dyn NarrationApi>,
    pacing: Duration,
    progress: Mutex<HashMap<String, DownloadProgress>>,
}

fn progress_key(landmark_id: &str, language: &str) -> String {
    format!("{}:{}", landmark_id, language)
}

/// Lowercase hex SHA-256 of the audio bytes
pub fn audio_checksum(audio: &[u8]) -> String {
    hex::encode(Sha256::digest(audio))
}

impl AudioDownloader {
    pub fn new(store: Arc<OfflineStore>, api: Arc<dyn NarrationApi>) -> Self {
        Self {
            store,
            api,
            pacing: DEFAULT_PACING,
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Delay between consecutive downloads in `download_all`
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    fn update(
        &self,
        landmark_id: &str,
        language: &str,
        progress: u8,
        status: DownloadStatus,
        error: Option<String>,
    ) {
        let entry = DownloadProgress {
            landmark_id: landmark_id.to_string(),
            language: language.to_string(),
            progress,
            status,
            error,
        };
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(progress_key(landmark_id, language), entry);
    }

    pub fn progress(&self, landmark_id: &str, language: &str) -> Option<DownloadProgress> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&progress_key(landmark_id, language))
            .cloned()
    }

    pub fn all_progress(&self) -> Vec<DownloadProgress> {
        let mut all: Vec<_> = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| (&a.landmark_id, &a.language).cmp(&(&b.landmark_id, &b.language)));
        all
    }

    pub fn clear_progress(&self) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Generate, fetch and cache narration audio for one landmark
    pub async fn download(
        &self,
        landmark: &Landmark,
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<CachedAudio> {
        self.update(&landmark.id, language, 0, DownloadStatus::Pending, None);

        match self.fetch_and_store(landmark, language, voice_id).await {
            Ok(cached) => {
                self.update(&landmark.id, language, 100, DownloadStatus::Complete, None);
                info!("Downloaded audio for {} ({}, {} bytes)", landmark.id, language, cached.size_bytes);
                Ok(cached)
            }
            Err(e) => {
                self.update(&landmark.id, language, 0, DownloadStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn fetch_and_store(
        &self,
        landmark: &Landmark,
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<CachedAudio> {
        self.update(&landmark.id, language, 10, DownloadStatus::Downloading, None);

        let text = Some(landmark.narration_for(language))
            .filter(|t| !t.trim().is_empty())
            .or_else(|| landmark.description_for(language))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("No text available for this language"))?;

        let generated = self
            .api
            .generate_audio(&AudioGenerateRequest {
                landmark_id: landmark.id.clone(),
                language: language.to_string(),
                text: text.to_string(),
                voice_id: voice_id.map(str::to_string),
            })
            .await?;
        self.update(&landmark.id, language, 50, DownloadStatus::Downloading, None);

        let audio = self.api.fetch_audio(&generated.audio_url).await?;
        if audio.is_empty() {
            return Err(anyhow!("Server returned an empty audio file"));
        }
        self.update(&landmark.id, language, 90, DownloadStatus::Downloading, None);

        let checksum = generated
            .checksum
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| audio_checksum(&audio));
        let cached = CachedAudio {
            landmark_id: landmark.id.clone(),
            language: language.to_string(),
            size_bytes: audio.len() as u64,
            audio,
            duration: generated.duration,
            checksum,
            voice_id: generated.voice_id.or_else(|| voice_id.map(str::to_string)),
            cached_at: chrono::Utc::now().timestamp_millis(),
        };
        self.store.save_audio(&cached)?;
        Ok(cached)
    }

    /// Download every landmark in order, skipping cached ones and carrying on
    /// after failures
    pub async fn download_all(
        &self,
        landmarks: &[Landmark],
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<DownloadSummary> {
        let mut summary = DownloadSummary::default();

        for (i, landmark) in landmarks.iter().enumerate() {
            if self.store.has_audio(&landmark.id, language)? {
                self.update(&landmark.id, language, 100, DownloadStatus::Complete, None);
                summary.skipped += 1;
                continue;
            }

            match self.download(landmark, language, voice_id).await {
                Ok(_) => summary.downloaded += 1,
                Err(e) => {
                    warn!("Failed to download audio for {}: {}", landmark.id, e);
                    summary.failed.push((landmark.id.clone(), e.to_string()));
                }
            }

            if i + 1 < landmarks.len() && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }

        info!(
            "Audio download finished: {} downloaded, {} skipped, {} failed",
            summary.downloaded,
            summary.skipped,
            summary.failed.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClovaRequest, GeneratedAudio};
    use crate::types::City;
    use async_trait::async_trait;

    struct FakeServer;

    #[async_trait]
    impl NarrationApi for FakeServer {
        async fn synthesize_clova(&self, _request: &ClovaRequest) -> Result<Vec<u8>> {
            Err(anyhow!("unused"))
        }

        async fn generate_audio(&self, request: &AudioGenerateRequest) -> Result<GeneratedAudio> {
            if request.landmark_id == "broken" {
                return Err(anyhow!("Server error 500"));
            }
            Ok(GeneratedAudio {
                audio_url: format!("/audio/{}_{}.mp3", request.landmark_id, request.language),
                duration: 4.0,
                size_bytes: None,
                checksum: None,
                voice_id: Some("clara".to_string()),
            })
        }

        async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
            Ok(url.as_bytes().to_vec())
        }

        async fn fetch_city(&self, _city_id: &str) -> Result<City> {
            Err(anyhow!("unused"))
        }

        async fn fetch_landmarks(&self, _city_id: &str) -> Result<Vec<Landmark>> {
            Err(anyhow!("unused"))
        }

        async fn post_visited(&self, _landmark_id: &str, _session_id: Option<&str>) -> Result<bool> {
            Ok(true)
        }
    }

    fn landmark(id: &str, narration: &str) -> Landmark {
        serde_json::from_value(serde_json::json!({
            "id": id, "cityId": "rome", "name": id,
            "lat": 41.9, "lng": 12.48, "radius": 40.0, "narration": narration
        }))
        .unwrap()
    }

    fn downloader() -> (tempfile::TempDir, Arc<OfflineStore>, AudioDownloader) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(Some(&dir.path().join("dl.redb"))).unwrap());
        let dl = AudioDownloader::new(store.clone(), Arc::new(FakeServer)).with_pacing(Duration::ZERO);
        (dir, store, dl)
    }

    #[tokio::test]
    async fn test_download_stores_audio_with_checksum() {
        let (_dir, store, dl) = downloader();
        let cached = dl.download(&landmark("colosseum", "Hello."), "en", None).await.unwrap();

        let expected = b"/audio/colosseum_en.mp3".to_vec();
        assert_eq!(cached.audio, expected);
        assert_eq!(cached.checksum, audio_checksum(&expected));
        assert_eq!(cached.voice_id.as_deref(), Some("clara"));
        assert!(store.has_audio("colosseum", "en").unwrap());

        let progress = dl.progress("colosseum", "en").unwrap();
        assert_eq!(progress.status, DownloadStatus::Complete);
        assert_eq!(progress.progress, 100);
    }

    #[tokio::test]
    async fn test_download_all_skips_and_continues() {
        let (_dir, _store, dl) = downloader();
        let landmarks = vec![
            landmark("a", "A."),
            landmark("broken", "B."),
            landmark("silent", ""),
            landmark("c", "C."),
        ];
        dl.download(&landmarks[0], "en", None).await.unwrap();

        let summary = dl.download_all(&landmarks, "en", None).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.failed.iter().any(|(id, e)| id == "silent" && e.contains("No text")));

        let broken = dl.progress("broken", "en").unwrap();
        assert_eq!(broken.status, DownloadStatus::Error);
        assert!(broken.error.is_some());
        assert_eq!(dl.all_progress().len(), 4);

        dl.clear_progress();
        assert!(dl.all_progress().is_empty());
    }
}
