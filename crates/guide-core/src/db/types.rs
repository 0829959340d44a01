//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Download bookkeeping for one offline city package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityMetadata {
    pub city_id: String,
    pub name: String,
    pub country: String,
    pub landmark_count: usize,
    /// RFC3339 timestamp of the download
    pub downloaded_at: String,
    pub version: u32,
    pub etag: Option<String>,
}

/// Narration audio stored for offline playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAudio {
    pub landmark_id: String,
    pub language: String,
    /// Encoded MP3 bytes
    pub audio: Vec<u8>,
    /// Duration in seconds as reported by the generator
    pub duration: f64,
    pub size_bytes: u64,
    pub checksum: String,
    pub voice_id: Option<String>,
    pub cached_at: i64,
}

/// One "visited" event waiting to be acknowledged by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitedQueueEntry {
    pub id: u64,
    pub landmark_id: String,
    pub session_id: Option<String>,
    /// RFC3339 timestamp
    pub visited_at: String,
    pub synced: bool,
}

/// Record counts across the offline store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub cities: usize,
    pub landmarks: usize,
    pub audio_files: usize,
    pub audio_bytes: u64,
    pub unsynced_visits: usize,
    pub synced_visits: usize,
}

impl StorageStats {
    pub fn total_records(&self) -> usize {
        self.cities + self.landmarks
    }
}

/// Cached audio summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioCacheStats {
    pub count: usize,
    pub total_bytes: u64,
}
