//! Speech engine that narrates to the log. Used when no system synthesizer
//! is available; completion is timed from a words-per-minute estimate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::backend::{PlaybackDone, SpeechEngine, Utterance};
use crate::types::PlaybackOutcome;
use crate::voice::Voice;

const DEFAULT_WORDS_PER_MINUTE: f32 = 160.0;

struct Speaking {
    id: u64,
    token: CancellationToken,
}

pub struct ConsoleSpeech {
    voices: Vec<Voice>,
    words_per_minute: f32,
    next_id: AtomicU64,
    current: Arc<Mutex<Option<Speaking>>>,
}

impl ConsoleSpeech {
    pub fn new(voices: Vec<Voice>) -> Self {
        Self {
            voices,
            words_per_minute: DEFAULT_WORDS_PER_MINUTE,
            next_id: AtomicU64::new(1),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_words_per_minute(mut self, words_per_minute: f32) -> Self {
        self.words_per_minute = words_per_minute.max(1.0);
        self
    }

    /// Time an utterance is expected to take at the given rate
    pub fn estimate(&self, text: &str, rate: f32) -> Duration {
        let words = text.split_whitespace().count().max(1) as f32;
        Duration::from_secs_f32(words * 60.0 / (self.words_per_minute * rate.max(0.1)))
    }
}

impl Default for ConsoleSpeech {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl SpeechEngine for ConsoleSpeech {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance, done: PlaybackDone) -> Result<()> {
        self.cancel();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Speaking {
            id,
            token: token.clone(),
        });

        let voice = utterance
            .voice
            .as_ref()
            .map(|v| v.name.as_str())
            .unwrap_or("default");
        info!("🔊 [{} | {} | x{:.2}] {}", utterance.locale, voice, utterance.rate, utterance.text);

        let duration = self.estimate(&utterance.text, utterance.rate);
        let current = Arc::clone(&self.current);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => done.complete(PlaybackOutcome::Stopped),
                _ = tokio::time::sleep(duration) => {
                    let mut slot = current.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.as_ref().map(|s| s.id) == Some(id) {
                        *slot = None;
                    }
                    drop(slot);
                    done.complete(PlaybackOutcome::Ended);
                }
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        if let Some(speaking) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            speaking.token.cancel();
        }
    }

    fn is_speaking(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str) -> Utterance {
        Utterance {
            text: text.to_string(),
            locale: "en-US".to_string(),
            voice: None,
            rate: 1.0,
        }
    }

    #[test]
    fn test_estimate_scales_with_rate() {
        let speech = ConsoleSpeech::default().with_words_per_minute(60.0);
        assert_eq!(speech.estimate("one two", 1.0), Duration::from_secs(2));
        assert_eq!(speech.estimate("one two", 2.0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_speak_completes_and_cancel_stops() {
        let speech = ConsoleSpeech::default().with_words_per_minute(6000.0);

        let (done, rx) = PlaybackDone::channel();
        speech.speak(utterance("hello there"), done).unwrap();
        assert!(speech.is_speaking());
        assert_eq!(rx.await.unwrap(), PlaybackOutcome::Ended);
        assert!(!speech.is_speaking());

        let slow = ConsoleSpeech::default().with_words_per_minute(1.0);
        let (done, rx) = PlaybackDone::channel();
        slow.speak(utterance("a long narration"), done).unwrap();
        slow.cancel();
        assert_eq!(rx.await.unwrap(), PlaybackOutcome::Stopped);
        assert!(!slow.is_speaking());
    }
}
