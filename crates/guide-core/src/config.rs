//! Runtime configuration read from the environment (and `.env` via dotenvy
//! in the binary).

use std::path::PathBuf;

use serde::Serialize;

use crate::audio::{MAX_RATE, MIN_RATE};
use crate::error::ConfigError;
use crate::types::{AudioMode, DEFAULT_LANGUAGE};

pub const DEFAULT_API_URL: &str = "http://localhost:5000";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuideConfig {
    /// Guide server base URL (GUIDE_API_URL)
    pub api_url: String,
    /// Database file (GUIDE_DB_PATH); `None` means ~/.audioguide/offline.redb
    pub db_path: Option<PathBuf>,
    /// Initial audio mode (GUIDE_AUDIO_MODE)
    pub audio_mode: AudioMode,
    /// Narration language (GUIDE_LANGUAGE)
    pub language: String,
    /// Speech rate (GUIDE_SPEECH_RATE)
    pub speech_rate: f32,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            db_path: None,
            audio_mode: AudioMode::Auto,
            language: DEFAULT_LANGUAGE.to_string(),
            speech_rate: 1.0,
        }
    }
}

impl GuideConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get("GUIDE_API_URL") {
            config.api_url = url;
        }
        config.db_path = get("GUIDE_DB_PATH").map(PathBuf::from);
        if let Some(mode) = get("GUIDE_AUDIO_MODE") {
            config.audio_mode =
                AudioMode::from_str(&mode).ok_or(ConfigError::InvalidAudioMode(mode))?;
        }
        if let Some(language) = get("GUIDE_LANGUAGE") {
            config.language = language;
        }
        if let Some(rate) = get("GUIDE_SPEECH_RATE") {
            config.speech_rate = parse_rate(&rate)?;
        }

        Ok(config)
    }

    /// Database path with the home-directory default applied
    pub fn resolved_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".audioguide").join("offline.redb"))
                .ok_or(ConfigError::NoHomeDirectory),
        }
    }
}

/// Parse a speech rate, rejecting values outside 0.5..=2.0
pub fn parse_rate(raw: &str) -> Result<f32, ConfigError> {
    match raw.trim().parse::<f32>() {
        Ok(rate) if (MIN_RATE..=MAX_RATE).contains(&rate) => Ok(rate),
        _ => Err(ConfigError::InvalidRate(raw.to_string())),
    }
}
