//! ============================================================================
//! GUIDE-CORE: GPS Audio Tour Engine
//! ============================================================================
//! Everything behind the tour guide except the UI:
//! - Proximity narration driven by position fixes
//! - Audio resolution chain (cached MP3, URL MP3, remote TTS, local speech)
//! - Voice selection heuristic for speech synthesis
//! - Offline cache of city packages, narration audio and visited outbox (redb)
//! - Trip export/import with password-based encryption
//! ============================================================================

pub mod audio;
pub mod client;
pub mod config;
pub mod db;
pub mod downloads;
pub mod error;
pub mod export;
pub mod geo;
pub mod narration;
pub mod prefs;
pub mod sync;
pub mod types;
pub mod voice;

// Re-export main types for convenience
pub use types::*;
pub use audio::{AudioService, PlaybackHandle};
pub use client::{GuideApiClient, NarrationApi};
pub use config::GuideConfig;
pub use db::{OfflineStore, StoreHandle};
pub use downloads::AudioDownloader;
pub use error::{AudioError, ConfigError, DecryptionError};
pub use narration::NarrationEngine;
pub use prefs::Preferences;
pub use voice::{select_voice, Voice};
