//! User preferences persisted in the store's settings table.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::audio::AudioService;
use crate::db::OfflineStore;
use crate::types::AudioMode;
use crate::voice::VoiceOverrides;

const KEY_SPEECH_RATE: &str = "speech_rate";
const KEY_VOICE_OVERRIDES: &str = "voice_overrides";
const KEY_AUDIO_MODE: &str = "audio_mode";
const KEY_SESSION_ID: &str = "session_id";

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `session_<unix millis>_<7 random base36 chars>`
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("session_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

pub struct Preferences {
    store: Arc<OfflineStore>,
}

impl Preferences {
    pub fn new(store: Arc<OfflineStore>) -> Self {
        Self { store }
    }

    pub fn speech_rate(&self) -> Result<Option<f32>> {
        let Some(raw) = self.store.get_setting(KEY_SPEECH_RATE)? else {
            return Ok(None);
        };
        match raw.parse::<f32>() {
            Ok(rate) if rate.is_finite() => Ok(Some(rate)),
            _ => {
                warn!("Ignoring stored speech rate '{}'", raw);
                Ok(None)
            }
        }
    }

    pub fn set_speech_rate(&self, rate: f32) -> Result<()> {
        self.store.set_setting(KEY_SPEECH_RATE, &rate.to_string())
    }

    pub fn voice_overrides(&self) -> Result<VoiceOverrides> {
        let Some(raw) = self.store.get_setting(KEY_VOICE_OVERRIDES)? else {
            return Ok(VoiceOverrides::default());
        };
        match serde_json::from_str(&raw) {
            Ok(overrides) => Ok(overrides),
            Err(e) => {
                warn!("Ignoring unreadable voice overrides: {}", e);
                Ok(VoiceOverrides::default())
            }
        }
    }

    pub fn set_voice_overrides(&self, overrides: &VoiceOverrides) -> Result<()> {
        let json = serde_json::to_string(overrides)
            .map_err(|e| anyhow!("Failed to serialize voice overrides: {}", e))?;
        self.store.set_setting(KEY_VOICE_OVERRIDES, &json)
    }

    /// Stored mode, or `auto` when unset or not on the allow-list
    pub fn audio_mode(&self) -> Result<AudioMode> {
        let Some(raw) = self.store.get_setting(KEY_AUDIO_MODE)? else {
            return Ok(AudioMode::default());
        };
        Ok(AudioMode::from_str(&raw).unwrap_or_else(|| {
            warn!("Stored audio mode '{}' is not recognized, using auto", raw);
            AudioMode::default()
        }))
    }

    pub fn set_audio_mode(&self, mode: AudioMode) -> Result<()> {
        self.store.set_setting(KEY_AUDIO_MODE, mode.as_str())
    }

    /// Session id for visit reporting, created on first use
    pub fn session_id(&self) -> Result<String> {
        if let Some(id) = self.store.get_setting(KEY_SESSION_ID)? {
            return Ok(id);
        }
        let id = generate_session_id();
        self.store.set_setting(KEY_SESSION_ID, &id)?;
        debug!("Created session {}", id);
        Ok(id)
    }

    /// Push stored rate, voices and mode into an audio service
    pub fn apply_to(&self, audio: &AudioService) -> Result<()> {
        if let Some(rate) = self.speech_rate()? {
            audio.set_rate(rate);
        }
        audio.set_voice_overrides(self.voice_overrides()?);
        audio.set_audio_mode(self.audio_mode()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs() -> (tempfile::TempDir, Preferences) {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(Some(&dir.path().join("prefs.redb"))).unwrap();
        (dir, Preferences::new(Arc::new(store)))
    }

    #[test]
    fn test_session_id_format_and_persistence() {
        let id = generate_session_id();
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 7);
        assert!(parts[2].bytes().all(|b| BASE36.contains(&b)));

        let (_dir, prefs) = prefs();
        let first = prefs.session_id().unwrap();
        assert_eq!(prefs.session_id().unwrap(), first);
    }

    #[test]
    fn test_audio_mode_allow_list() {
        let (_dir, prefs) = prefs();
        assert_eq!(prefs.audio_mode().unwrap(), AudioMode::Auto);

        prefs.set_audio_mode(AudioMode::Clova).unwrap();
        assert_eq!(prefs.audio_mode().unwrap(), AudioMode::Clova);

        prefs.store.set_setting(KEY_AUDIO_MODE, "<script>").unwrap();
        assert_eq!(prefs.audio_mode().unwrap(), AudioMode::Auto);
    }

    #[test]
    fn test_rate_and_overrides() {
        let (_dir, prefs) = prefs();
        assert_eq!(prefs.speech_rate().unwrap(), None);
        prefs.set_speech_rate(1.25).unwrap();
        assert_eq!(prefs.speech_rate().unwrap(), Some(1.25));

        let mut overrides = VoiceOverrides::default();
        overrides.set("es-MX", "Paulina");
        prefs.set_voice_overrides(&overrides).unwrap();
        assert_eq!(prefs.voice_overrides().unwrap().get("es"), Some("Paulina"));

        prefs.store.set_setting(KEY_VOICE_OVERRIDES, "{broken").unwrap();
        assert_eq!(prefs.voice_overrides().unwrap(), VoiceOverrides::default());
    }
}
