//! Error types returned across the audio and configuration seams.

/// Failures reported by the audio resolution chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("Audio is disabled")]
    Disabled,

    #[error("No audio source available for {0}")]
    NoAudioSource(String),

    #[error("Remote TTS failed: {0}")]
    RemoteTts(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Playback superseded by a newer request")]
    Superseded,

    #[error("Remote TTS is not configured")]
    RemoteUnavailable,
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown audio mode '{0}'. Valid values: auto, tts, clova, mp3")]
    InvalidAudioMode(String),

    #[error("Invalid speech rate '{0}'")]
    InvalidRate(String),

    #[error("Cannot determine home directory")]
    NoHomeDirectory,
}

/// Trip archive decryption failure. Wrong passwords and damaged data are
/// indistinguishable under AES-GCM, so both map here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Decryption failed. Wrong password or corrupted data.")]
pub struct DecryptionError;
