//! ============================================================================
//! Audio - Narration playback
//! ============================================================================
//! - `service`: the resolution chain and single-stream playback control
//! - `backend`: output traits (MP3 output, speech engine, audio cache)
//! - `console`: log-based speech engine
//! - `rodio_sink`: MP3 output on the default device (feature "native-audio")
//! ============================================================================

pub mod backend;
pub mod console;
pub mod sentences;
pub mod service;

#[cfg(feature = "native-audio")]
pub mod rodio_sink;

pub use backend::{AudioCache, Mp3Output, PlaybackDone, SpeechEngine, Utterance};
pub use console::ConsoleSpeech;
pub use sentences::split_into_sentences;
pub use service::{AudioService, PlaybackHandle, DEFAULT_RATE, MAX_RATE, MIN_RATE, NO_SENTENCE};

#[cfg(feature = "native-audio")]
pub use rodio_sink::RodioOutput;

use anyhow::Result;

use crate::types::PlaybackOutcome;

/// MP3 output that discards audio and reports it finished immediately.
/// Stands in when no output device is available.
#[derive(Debug, Default)]
pub struct NullOutput;

impl Mp3Output for NullOutput {
    fn play(&self, audio: Vec<u8>, _rate: f32, done: PlaybackDone) -> Result<()> {
        tracing::debug!("Discarding {} bytes of MP3 audio", audio.len());
        done.complete(PlaybackOutcome::Ended);
        Ok(())
    }

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }
}
