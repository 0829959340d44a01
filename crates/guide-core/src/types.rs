//! ============================================================================
//! Core Types - Shared data structures for the audio guide
//! ============================================================================
//! All types here are serializable for the guide server's JSON API and for
//! redb storage (bincode), so stored fields avoid serde attributes that
//! bincode cannot round-trip.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Language used when a landmark has no translation for the requested one
pub const DEFAULT_LANGUAGE: &str = "en";

// ============================================================================
// Reference Data
// ============================================================================

/// Cruise port details shown for port cities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CruisePort {
    pub port_name: String,
    #[serde(default)]
    pub distance_from_city: Option<String>,
    #[serde(default)]
    pub recommended_duration: Option<String>,
    #[serde(default)]
    pub tips: Option<String>,
}

/// A city that owns a set of landmarks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct City {
    pub id: String,
    pub name: String,
    pub country: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default = "default_zoom")]
    pub zoom: u8,
    #[serde(default)]
    pub cruise_port: Option<CruisePort>,
}

fn default_zoom() -> u8 {
    14
}

impl City {
    pub fn center(&self) -> GpsPosition {
        GpsPosition::new(self.lat, self.lng)
    }
}

/// Kind of point of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkCategory {
    Landmark,
    Activity,
    Restaurant,
    #[serde(alias = "giftshop", alias = "gift-shop")]
    GiftShop,
}

impl Default for LandmarkCategory {
    fn default() -> Self {
        Self::Landmark
    }
}

impl LandmarkCategory {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "landmark" => Some(Self::Landmark),
            "activity" => Some(Self::Activity),
            "restaurant" => Some(Self::Restaurant),
            "gift_shop" | "giftshop" => Some(Self::GiftShop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landmark => "landmark",
            Self::Activity => "activity",
            Self::Restaurant => "restaurant",
            Self::GiftShop => "gift_shop",
        }
    }
}

/// Per-language text for a landmark
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub detailed_description: Option<String>,
}

/// A point of interest with a trigger radius and narration text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Landmark {
    pub id: String,
    pub city_id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    /// Trigger radius in meters
    pub radius: f64,
    /// Narration in the default language
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub detailed_description: Option<String>,
    #[serde(default)]
    pub category: LandmarkCategory,
    #[serde(default)]
    pub translations: HashMap<String, Translation>,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub historical_info: Option<String>,
    #[serde(default)]
    pub year_built: Option<String>,
    #[serde(default)]
    pub architect: Option<String>,
    #[serde(default)]
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    /// Pre-generated narration MP3, if the server has one
    #[serde(default)]
    pub audio_url: Option<String>,
}

/// Reasons a landmark record is unusable for narration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LandmarkError {
    #[error("Landmark {id}: radius must be positive (got {radius})")]
    InvalidRadius { id: String, radius: f64 },

    #[error("Landmark {0}: no narration text in any language")]
    MissingNarration(String),
}

impl Landmark {
    pub fn position(&self) -> GpsPosition {
        GpsPosition::new(self.lat, self.lng)
    }

    /// Check the invariants the narration engine relies on
    pub fn validate(&self) -> Result<(), LandmarkError> {
        if !(self.radius > 0.0) {
            return Err(LandmarkError::InvalidRadius {
                id: self.id.clone(),
                radius: self.radius,
            });
        }

        let has_default = !self.narration.trim().is_empty();
        let has_translation = self.translations.values().any(|t| {
            t.narration
                .as_deref()
                .map(|n| !n.trim().is_empty())
                .unwrap_or(false)
        });
        if !has_default && !has_translation {
            return Err(LandmarkError::MissingNarration(self.id.clone()));
        }

        Ok(())
    }

    fn translation(&self, language: &str) -> Option<&Translation> {
        self.translations.get(language)
    }

    /// Narration text for a language, falling back to the default narration
    /// and then to any translation that has one.
    pub fn narration_for(&self, language: &str) -> &str {
        if let Some(text) = self
            .translation(language)
            .and_then(|t| t.narration.as_deref())
            .filter(|s| !s.trim().is_empty())
        {
            return text;
        }
        if !self.narration.trim().is_empty() {
            return &self.narration;
        }
        self.translation(DEFAULT_LANGUAGE)
            .and_then(|t| t.narration.as_deref())
            .or_else(|| {
                self.translations
                    .values()
                    .filter_map(|t| t.narration.as_deref())
                    .find(|s| !s.trim().is_empty())
            })
            .unwrap_or("")
    }

    pub fn name_for(&self, language: &str) -> &str {
        self.translation(language)
            .and_then(|t| t.name.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn description_for(&self, language: &str) -> Option<&str> {
        self.translation(language)
            .and_then(|t| t.description.as_deref())
            .filter(|s| !s.is_empty())
            .or(self.description.as_deref())
    }

    pub fn detailed_description_for(&self, language: &str) -> Option<&str> {
        self.translation(language)
            .and_then(|t| t.detailed_description.as_deref())
            .filter(|s| !s.is_empty())
            .or(self.detailed_description.as_deref())
    }
}

// ============================================================================
// Position
// ============================================================================

/// A single fix from the geolocation provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Unix millis
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl GpsPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            timestamp: None,
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Which playback strategy the resolution chain uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    /// Cached MP3, then URL MP3, then local speech
    Auto,
    /// Local speech synthesis only
    Tts,
    /// Remote TTS generation only
    Clova,
    /// Cached or URL MP3 only
    Mp3,
}

impl Default for AudioMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl AudioMode {
    pub const ALL: [AudioMode; 4] = [Self::Auto, Self::Tts, Self::Clova, Self::Mp3];

    /// Allow-list parse; anything else is rejected
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "tts" => Some(Self::Tts),
            "clova" => Some(Self::Clova),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Tts => "tts",
            Self::Clova => "clova",
            Self::Mp3 => "mp3",
        }
    }
}

/// Observable state of the audio chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Resolving,
    PlayingMp3,
    PlayingTts,
    Ended,
    Error,
}

/// Where the audible narration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    CachedMp3,
    UrlMp3,
    RemoteTts,
    Speech,
}

/// How a playback stream finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackOutcome {
    Ended,
    Stopped,
    Failed(String),
}

// ============================================================================
// Downloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Complete,
    Error,
}

/// Progress of one (landmark, language) audio download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub landmark_id: String,
    pub language: String,
    /// 0..=100
    pub progress: u8,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landmark() -> Landmark {
        serde_json::from_value(serde_json::json!({
            "id": "trevi",
            "cityId": "rome",
            "name": "Trevi Fountain",
            "lat": 41.9009,
            "lng": 12.4833,
            "radius": 50.0,
            "narration": "Welcome to the Trevi Fountain.",
            "category": "landmark",
            "translations": {
                "it": { "name": "Fontana di Trevi", "narration": "Benvenuti alla Fontana di Trevi." },
                "ko": { "name": "트레비 분수", "narration": "" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_narration_language_fallback() {
        let lm = landmark();
        assert_eq!(lm.narration_for("it"), "Benvenuti alla Fontana di Trevi.");
        // Empty translation falls back to the default narration
        assert_eq!(lm.narration_for("ko"), "Welcome to the Trevi Fountain.");
        assert_eq!(lm.narration_for("fr"), "Welcome to the Trevi Fountain.");
        assert_eq!(lm.name_for("ko"), "트레비 분수");
        assert_eq!(lm.name_for("fr"), "Trevi Fountain");
    }

    #[test]
    fn test_validate() {
        let mut lm = landmark();
        assert!(lm.validate().is_ok());

        lm.radius = 0.0;
        assert!(matches!(lm.validate(), Err(LandmarkError::InvalidRadius { .. })));

        lm.radius = 30.0;
        lm.narration.clear();
        // Italian translation still carries narration
        assert!(lm.validate().is_ok());

        lm.translations.clear();
        assert_eq!(
            lm.validate(),
            Err(LandmarkError::MissingNarration("trevi".into()))
        );
    }

    #[test]
    fn test_audio_mode_allow_list() {
        assert_eq!(AudioMode::from_str("MP3"), Some(AudioMode::Mp3));
        assert_eq!(AudioMode::from_str(" clova "), Some(AudioMode::Clova));
        assert_eq!(AudioMode::from_str("loud"), None);
        assert_eq!(AudioMode::default(), AudioMode::Auto);
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!(LandmarkCategory::from_str("gift-shop"), Some(LandmarkCategory::GiftShop));
        assert_eq!(LandmarkCategory::from_str("Restaurant"), Some(LandmarkCategory::Restaurant));
        assert_eq!(LandmarkCategory::from_str("museum"), None);
    }
}
