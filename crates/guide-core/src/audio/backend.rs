//! Output seams used by the audio chain: MP3 playback, speech synthesis and
//! the offline audio cache.

use anyhow::Result;
use tokio::sync::oneshot;

use crate::db::CachedAudio;
use crate::types::PlaybackOutcome;
use crate::voice::Voice;

/// One-shot completion signal handed to a backend when playback starts.
/// Dropping it without calling `complete` reads as `Stopped`.
#[derive(Debug)]
pub struct PlaybackDone(oneshot::Sender<PlaybackOutcome>);

impl PlaybackDone {
    pub fn channel() -> (Self, oneshot::Receiver<PlaybackOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn complete(self, outcome: PlaybackOutcome) {
        // Receiver gone means nobody is waiting anymore
        let _ = self.0.send(outcome);
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Plays encoded MP3 bytes. At most one stream is active per output.
pub trait Mp3Output: Send + Sync {
    /// Start playing and return immediately. `done` fires when the stream
    /// ends, is stopped or fails.
    fn play(&self, audio: Vec<u8>, rate: f32, done: PlaybackDone) -> Result<()>;

    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// A single request to the speech synthesizer
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub locale: String,
    /// `None` lets the engine use its default voice
    pub voice: Option<Voice>,
    pub rate: f32,
}

/// Local text-to-speech engine
pub trait SpeechEngine: Send + Sync {
    fn voices(&self) -> Vec<Voice>;

    fn speak(&self, utterance: Utterance, done: PlaybackDone) -> Result<()>;

    fn cancel(&self);

    fn is_speaking(&self) -> bool;
}

/// Read side of the offline audio cache
pub trait AudioCache: Send + Sync {
    fn cached_audio(&self, landmark_id: &str, language: &str) -> Result<Option<CachedAudio>>;
}
