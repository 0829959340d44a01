//! ============================================================================
//! AudioService - Narration playback with a source fallback chain
//! ============================================================================
//! Resolves narration audio for a landmark and plays it on exactly one
//! stream at a time:
//! - auto:  cached MP3 -> URL MP3 -> local speech
//! - mp3:   cached MP3 -> URL MP3, nothing else
//! - tts:   local speech only
//! - clova: remote TTS only
//!
//! Every start tears down whatever was playing first. Each playback carries a
//! generation number and a cancellation token so that a slow remote request
//! can never start audio after it has been superseded.
//! ============================================================================

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{AudioCache, Mp3Output, PlaybackDone, SpeechEngine, Utterance};
use super::sentences::split_into_sentences;
use crate::client::{ClovaRequest, NarrationApi};
use crate::error::AudioError;
use crate::types::{AudioMode, AudioSource, Landmark, PlaybackOutcome, PlaybackState};
use crate::voice::{select_voice, speech_locale, QualityTable, Voice, VoiceOverrides};

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 2.0;
pub const DEFAULT_RATE: f32 = 1.0;

/// Sentence index published when no sentence is being spoken
pub const NO_SENTENCE: i64 = -1;

/// Handle to a started playback
#[derive(Debug)]
pub struct PlaybackHandle {
    generation: u64,
    landmark_id: Option<String>,
    source: AudioSource,
    rx: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn landmark_id(&self) -> Option<&str> {
        self.landmark_id.as_deref()
    }

    pub fn source(&self) -> AudioSource {
        self.source
    }

    /// Wait until the stream ends, is stopped or fails
    pub async fn finished(self) -> PlaybackOutcome {
        self.rx.await.unwrap_or(PlaybackOutcome::Stopped)
    }
}

struct ActivePlayback {
    generation: u64,
    token: CancellationToken,
}

struct ServiceState {
    mode: AudioMode,
    enabled: bool,
    rate: f32,
    spoken: HashSet<String>,
    overrides: VoiceOverrides,
    generation: u64,
    current: Option<ActivePlayback>,
    playback: PlaybackState,
    /// Generation of the sentence run that last published an index
    sentence_run: Option<u64>,
}

/// Narration playback service. Construct one per process and share it.
pub struct AudioService {
    mp3: Arc<dyn Mp3Output>,
    speech: Arc<dyn SpeechEngine>,
    api: Option<Arc<dyn NarrationApi>>,
    cache: Option<Arc<dyn AudioCache>>,
    quality: QualityTable,
    state: Arc<Mutex<ServiceState>>,
    sentence_tx: watch::Sender<i64>,
}

fn lock(state: &Mutex<ServiceState>) -> MutexGuard<'_, ServiceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AudioService {
    pub fn new(mp3: Arc<dyn Mp3Output>, speech: Arc<dyn SpeechEngine>) -> Self {
        let (sentence_tx, _) = watch::channel(NO_SENTENCE);
        Self {
            mp3,
            speech,
            api: None,
            cache: None,
            quality: QualityTable::default(),
            state: Arc::new(Mutex::new(ServiceState {
                mode: AudioMode::Auto,
                enabled: true,
                rate: DEFAULT_RATE,
                spoken: HashSet::new(),
                overrides: VoiceOverrides::default(),
                generation: 0,
                current: None,
                playback: PlaybackState::Idle,
                sentence_run: None,
            })),
            sentence_tx,
        }
    }

    pub fn with_api(mut self, api: Arc<dyn NarrationApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn AudioCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_quality_table(mut self, quality: QualityTable) -> Self {
        self.quality = quality;
        self
    }

    // ========================================================================
    // Settings & Spoken State
    // ========================================================================

    pub fn audio_mode(&self) -> AudioMode {
        lock(&self.state).mode
    }

    pub fn set_audio_mode(&self, mode: AudioMode) {
        lock(&self.state).mode = mode;
        info!("Audio mode set to {}", mode.as_str());
    }

    pub fn rate(&self) -> f32 {
        lock(&self.state).rate
    }

    /// Set the playback rate, clamped to 0.5..=2.0. Returns the applied rate.
    pub fn set_rate(&self, rate: f32) -> f32 {
        let mut st = lock(&self.state);
        if rate.is_finite() {
            st.rate = rate.clamp(MIN_RATE, MAX_RATE);
        }
        st.rate
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Toggling the flag stops current playback and forgets which landmarks
    /// were spoken, so re-enabling narrates nearby landmarks again.
    pub fn set_enabled(&self, enabled: bool) {
        let was = {
            let mut st = lock(&self.state);
            std::mem::replace(&mut st.enabled, enabled)
        };
        if was != enabled {
            self.reset();
        }
        debug!("Audio enabled: {}", enabled);
    }

    pub fn is_landmark_spoken(&self, landmark_id: &str) -> bool {
        lock(&self.state).spoken.contains(landmark_id)
    }

    /// Returns false if the landmark was already marked
    pub fn mark_spoken(&self, landmark_id: &str) -> bool {
        lock(&self.state).spoken.insert(landmark_id.to_string())
    }

    pub fn spoken_count(&self) -> usize {
        lock(&self.state).spoken.len()
    }

    pub fn voice_overrides(&self) -> VoiceOverrides {
        lock(&self.state).overrides.clone()
    }

    pub fn set_voice_overrides(&self, overrides: VoiceOverrides) {
        lock(&self.state).overrides = overrides;
    }

    pub fn set_voice_override(&self, language: &str, voice_name: &str) {
        lock(&self.state).overrides.set(language, voice_name);
    }

    pub fn clear_voice_override(&self, language: &str) -> bool {
        lock(&self.state).overrides.clear(language)
    }

    /// Voice the speech engine would use for a language
    pub fn voice_for(&self, language: &str) -> Option<Voice> {
        let overrides = self.voice_overrides();
        select_voice(&self.speech.voices(), language, &overrides, &self.quality)
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.state).playback
    }

    pub fn is_playing(&self) -> bool {
        self.mp3.is_playing() || self.speech.is_speaking()
    }

    /// Receiver for the sentence currently spoken by `play_sentences`
    pub fn sentence_index(&self) -> watch::Receiver<i64> {
        self.sentence_tx.subscribe()
    }

    // ========================================================================
    // Stream Lifecycle
    // ========================================================================

    fn teardown(&self, st: &mut ServiceState) {
        if let Some(active) = st.current.take() {
            active.token.cancel();
            debug!("Tearing down playback #{}", active.generation);
        }
        self.mp3.stop();
        self.speech.cancel();
    }

    /// Stop every stream and abandon in-flight remote requests
    pub fn stop_all(&self) {
        let mut st = lock(&self.state);
        self.teardown(&mut st);
        st.generation += 1;
        st.playback = PlaybackState::Idle;
        drop(st);
        self.sentence_tx.send_replace(NO_SENTENCE);
    }

    /// Stop playback and forget which landmarks were spoken
    pub fn reset(&self) {
        self.stop_all();
        lock(&self.state).spoken.clear();
        info!("Audio service reset");
    }

    fn begin(&self) -> Result<(u64, CancellationToken), AudioError> {
        let mut st = lock(&self.state);
        if !st.enabled {
            return Err(AudioError::Disabled);
        }
        self.teardown(&mut st);
        st.generation += 1;
        let token = CancellationToken::new();
        st.current = Some(ActivePlayback {
            generation: st.generation,
            token: token.clone(),
        });
        st.playback = PlaybackState::Resolving;
        Ok((st.generation, token))
    }

    fn fail(&self, generation: u64, err: AudioError) -> AudioError {
        let mut st = lock(&self.state);
        if st.generation == generation {
            st.current = None;
            st.playback = PlaybackState::Error;
        }
        err
    }

    fn settle_idle(&self, generation: u64) {
        let mut st = lock(&self.state);
        if st.generation == generation {
            st.current = None;
            st.playback = PlaybackState::Idle;
        }
    }

    /// Forward a backend completion to the caller and update the state machine
    fn watch_completion(
        &self,
        generation: u64,
        landmark_id: Option<&str>,
        source: AudioSource,
        rx: oneshot::Receiver<PlaybackOutcome>,
    ) -> PlaybackHandle {
        let (tx, handle_rx) = oneshot::channel();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = rx.await.unwrap_or(PlaybackOutcome::Stopped);
            {
                let mut st = lock(&state);
                if st.generation == generation {
                    st.current = None;
                    st.playback = match outcome {
                        PlaybackOutcome::Failed(_) => PlaybackState::Error,
                        _ => PlaybackState::Ended,
                    };
                }
            }
            if let PlaybackOutcome::Failed(reason) = &outcome {
                warn!("Playback #{} failed: {}", generation, reason);
            }
            let _ = tx.send(outcome);
        });

        PlaybackHandle {
            generation,
            landmark_id: landmark_id.map(str::to_string),
            source,
            rx: handle_rx,
        }
    }

    fn start_mp3(
        &self,
        generation: u64,
        landmark_id: Option<&str>,
        audio: Vec<u8>,
        source: AudioSource,
    ) -> Result<PlaybackHandle, AudioError> {
        let mut st = lock(&self.state);
        if st.generation != generation {
            return Err(AudioError::Superseded);
        }

        let (done, rx) = PlaybackDone::channel();
        let size = audio.len();
        if let Err(e) = self.mp3.play(audio, st.rate, done) {
            st.current = None;
            st.playback = PlaybackState::Error;
            return Err(AudioError::Playback(e.to_string()));
        }

        st.playback = PlaybackState::PlayingMp3;
        if let Some(id) = landmark_id {
            st.spoken.insert(id.to_string());
        }
        drop(st);

        debug!("Playing {:?} audio ({} bytes) as #{}", source, size, generation);
        Ok(self.watch_completion(generation, landmark_id, source, rx))
    }

    fn start_speech(
        &self,
        generation: u64,
        landmark_id: Option<&str>,
        text: &str,
        language: &str,
    ) -> Result<PlaybackHandle, AudioError> {
        if text.trim().is_empty() {
            let what = landmark_id.unwrap_or("text");
            return Err(self.fail(generation, AudioError::NoAudioSource(what.to_string())));
        }

        let voice = self.voice_for(language);
        let mut st = lock(&self.state);
        if st.generation != generation {
            return Err(AudioError::Superseded);
        }

        let utterance = Utterance {
            text: text.to_string(),
            locale: voice
                .as_ref()
                .map(|v| v.locale.clone())
                .unwrap_or_else(|| speech_locale(language)),
            voice,
            rate: st.rate,
        };

        let (done, rx) = PlaybackDone::channel();
        if let Err(e) = self.speech.speak(utterance, done) {
            st.current = None;
            st.playback = PlaybackState::Error;
            return Err(AudioError::Playback(e.to_string()));
        }

        st.playback = PlaybackState::PlayingTts;
        if let Some(id) = landmark_id {
            st.spoken.insert(id.to_string());
        }
        drop(st);

        Ok(self.watch_completion(generation, landmark_id, AudioSource::Speech, rx))
    }

    /// Cached blob first, then the URL. Failures degrade to `None`.
    async fn resolve_mp3(
        &self,
        token: &CancellationToken,
        landmark_id: &str,
        language: &str,
        audio_url: Option<&str>,
    ) -> Result<Option<(Vec<u8>, AudioSource)>, AudioError> {
        if let Some(cache) = &self.cache {
            match cache.cached_audio(landmark_id, language) {
                Ok(Some(cached)) => return Ok(Some((cached.audio, AudioSource::CachedMp3))),
                Ok(None) => debug!("No cached audio for {}:{}", landmark_id, language),
                Err(e) => warn!("Audio cache read failed for {}: {}", landmark_id, e),
            }
        }

        let Some(url) = audio_url.filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(api) = &self.api else {
            warn!("No API client configured, cannot fetch {}", url);
            return Ok(None);
        };

        tokio::select! {
            _ = token.cancelled() => Err(AudioError::Superseded),
            fetched = api.fetch_audio(url) => match fetched {
                Ok(bytes) => Ok(Some((bytes, AudioSource::UrlMp3))),
                Err(e) => {
                    warn!("Audio URL fetch failed for {}: {}", landmark_id, e);
                    Ok(None)
                }
            },
        }
    }

    // ========================================================================
    // Playback Entry Points
    // ========================================================================

    /// Play narration using the configured audio mode. `Ok(None)` means no
    /// source was available and nothing is playing.
    pub async fn play_auto(
        &self,
        landmark_id: &str,
        text: &str,
        language: &str,
        audio_url: Option<&str>,
    ) -> Result<Option<PlaybackHandle>, AudioError> {
        match self.audio_mode() {
            AudioMode::Tts => self.play_tts(Some(landmark_id), text, language).map(Some),
            AudioMode::Clova => self.play_clova(Some(landmark_id), text, language).await.map(Some),
            AudioMode::Mp3 => self.play_mp3(landmark_id, language, audio_url).await,
            AudioMode::Auto => {
                let (generation, token) = self.begin()?;

                match self.resolve_mp3(&token, landmark_id, language, audio_url).await {
                    Ok(Some((audio, source))) => {
                        match self.start_mp3(generation, Some(landmark_id), audio, source) {
                            Ok(handle) => return Ok(Some(handle)),
                            Err(AudioError::Superseded) => return Err(AudioError::Superseded),
                            Err(e) => warn!("MP3 playback failed, using speech: {}", e),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Err(self.fail(generation, e)),
                }

                self.start_speech(generation, Some(landmark_id), text, language)
                    .map(Some)
            }
        }
    }

    /// Cached or URL MP3 only. `Ok(None)` when neither is available.
    pub async fn play_mp3(
        &self,
        landmark_id: &str,
        language: &str,
        audio_url: Option<&str>,
    ) -> Result<Option<PlaybackHandle>, AudioError> {
        let (generation, token) = self.begin()?;

        match self.resolve_mp3(&token, landmark_id, language, audio_url).await {
            Ok(Some((audio, source))) => self
                .start_mp3(generation, Some(landmark_id), audio, source)
                .map(Some),
            Ok(None) => {
                debug!("No MP3 source for {}, nothing played", landmark_id);
                self.settle_idle(generation);
                Ok(None)
            }
            Err(e) => Err(self.fail(generation, e)),
        }
    }

    /// Local speech synthesis only
    pub fn play_tts(
        &self,
        landmark_id: Option<&str>,
        text: &str,
        language: &str,
    ) -> Result<PlaybackHandle, AudioError> {
        let (generation, _token) = self.begin()?;
        self.start_speech(generation, landmark_id, text, language)
    }

    /// Remote TTS only. The request is abandoned if superseded.
    pub async fn play_clova(
        &self,
        landmark_id: Option<&str>,
        text: &str,
        language: &str,
    ) -> Result<PlaybackHandle, AudioError> {
        let (generation, token) = self.begin()?;

        let Some(api) = self.api.clone() else {
            return Err(self.fail(generation, AudioError::RemoteUnavailable));
        };
        if text.trim().is_empty() {
            let what = landmark_id.unwrap_or("text").to_string();
            return Err(self.fail(generation, AudioError::NoAudioSource(what)));
        }

        let request = ClovaRequest::new(text, language);
        let audio = tokio::select! {
            _ = token.cancelled() => {
                debug!("Remote TTS #{} abandoned", generation);
                return Err(AudioError::Superseded);
            }
            result = api.synthesize_clova(&request) => result,
        };

        match audio {
            Ok(bytes) => self.start_mp3(generation, landmark_id, bytes, AudioSource::RemoteTts),
            Err(e) => Err(self.fail(generation, AudioError::RemoteTts(e.to_string()))),
        }
    }

    /// Proximity entry point: silently skips a disabled service and
    /// landmarks that were already spoken.
    pub async fn narrate(
        &self,
        landmark: &Landmark,
        language: &str,
    ) -> Result<Option<PlaybackHandle>, AudioError> {
        if !self.is_enabled() || self.is_landmark_spoken(&landmark.id) {
            return Ok(None);
        }

        info!("Narrating {} ({})", landmark.name_for(language), language);
        self.play_auto(
            &landmark.id,
            landmark.narration_for(language),
            language,
            landmark.audio_url.as_deref(),
        )
        .await
    }

    /// Publish a sentence index unless the run was superseded. Checked and
    /// sent under the state lock.
    fn publish_sentence(&self, generation: u64, index: i64) -> bool {
        let mut st = lock(&self.state);
        if st.generation != generation {
            return false;
        }
        st.sentence_run = Some(generation);
        self.sentence_tx.send_replace(index);
        true
    }

    fn finish_sentences(&self, generation: u64) {
        let mut st = lock(&self.state);
        if st.generation == generation || st.sentence_run == Some(generation) {
            st.sentence_run = None;
            self.sentence_tx.send_replace(NO_SENTENCE);
        }
    }

    /// Speak text one sentence at a time, publishing the sentence index.
    /// Resolves once every sentence was spoken or playback was interrupted.
    pub async fn play_sentences(
        &self,
        text: &str,
        language: &str,
        rate: Option<f32>,
    ) -> Result<PlaybackOutcome, AudioError> {
        let sentences = split_into_sentences(text);
        if sentences.is_empty() {
            return Err(AudioError::NoAudioSource("text".to_string()));
        }
        if let Some(rate) = rate {
            self.set_rate(rate);
        }

        let (generation, token) = self.begin()?;
        let mut outcome = PlaybackOutcome::Ended;

        for (index, sentence) in sentences.iter().enumerate() {
            if token.is_cancelled() || !self.publish_sentence(generation, index as i64) {
                outcome = PlaybackOutcome::Stopped;
                break;
            }

            let handle = match self.start_speech(generation, None, sentence, language) {
                Ok(handle) => handle,
                Err(AudioError::Superseded) => {
                    outcome = PlaybackOutcome::Stopped;
                    break;
                }
                Err(e) => {
                    self.finish_sentences(generation);
                    return Err(e);
                }
            };

            let result = tokio::select! {
                _ = token.cancelled() => PlaybackOutcome::Stopped,
                result = handle.finished() => result,
            };
            if result != PlaybackOutcome::Ended {
                outcome = result;
                break;
            }
        }

        self.finish_sentences(generation);
        debug!("Sentence playback #{} finished: {:?}", generation, outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AudioGenerateRequest, GeneratedAudio};
    use crate::db::CachedAudio;
    use crate::types::City;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeMp3 {
        played: Mutex<Vec<Vec<u8>>>,
        active: Mutex<Option<PlaybackDone>>,
    }

    impl FakeMp3 {
        fn finish(&self) {
            if let Some(done) = self.active.lock().unwrap().take() {
                done.complete(PlaybackOutcome::Ended);
            }
        }
    }

    impl Mp3Output for FakeMp3 {
        fn play(&self, audio: Vec<u8>, _rate: f32, done: PlaybackDone) -> Result<()> {
            let mut active = self.active.lock().unwrap();
            assert!(active.is_none(), "second MP3 stream started while one is active");
            self.played.lock().unwrap().push(audio);
            *active = Some(done);
            Ok(())
        }

        fn stop(&self) {
            if let Some(done) = self.active.lock().unwrap().take() {
                done.complete(PlaybackOutcome::Stopped);
            }
        }

        fn is_playing(&self) -> bool {
            self.active.lock().unwrap().is_some()
        }
    }

    #[derive(Default)]
    struct FakeSpeech {
        voices: Vec<Voice>,
        auto_finish: bool,
        spoken: Mutex<Vec<Utterance>>,
        active: Mutex<Option<PlaybackDone>>,
    }

    impl SpeechEngine for FakeSpeech {
        fn voices(&self) -> Vec<Voice> {
            self.voices.clone()
        }

        fn speak(&self, utterance: Utterance, done: PlaybackDone) -> Result<()> {
            let mut active = self.active.lock().unwrap();
            assert!(active.is_none(), "second utterance started while one is active");
            self.spoken.lock().unwrap().push(utterance);
            if self.auto_finish {
                done.complete(PlaybackOutcome::Ended);
            } else {
                *active = Some(done);
            }
            Ok(())
        }

        fn cancel(&self) {
            if let Some(done) = self.active.lock().unwrap().take() {
                done.complete(PlaybackOutcome::Stopped);
            }
        }

        fn is_speaking(&self) -> bool {
            self.active.lock().unwrap().is_some()
        }
    }

    #[derive(Default)]
    struct FakeCache(HashMap<String, Vec<u8>>);

    impl AudioCache for FakeCache {
        fn cached_audio(&self, landmark_id: &str, language: &str) -> Result<Option<CachedAudio>> {
            Ok(self.0.get(&format!("{}:{}", landmark_id, language)).map(|audio| CachedAudio {
                landmark_id: landmark_id.to_string(),
                language: language.to_string(),
                audio: audio.clone(),
                duration: 1.0,
                size_bytes: audio.len() as u64,
                checksum: String::new(),
                voice_id: None,
                cached_at: 0,
            }))
        }
    }

    #[derive(Default)]
    struct FakeApi {
        urls: HashMap<String, Vec<u8>>,
        clova_delay: Option<Duration>,
        clova_fails: bool,
    }

    #[async_trait]
    impl NarrationApi for FakeApi {
        async fn synthesize_clova(&self, _request: &ClovaRequest) -> Result<Vec<u8>> {
            if let Some(delay) = self.clova_delay {
                tokio::time::sleep(delay).await;
            }
            if self.clova_fails {
                return Err(anyhow!("503"));
            }
            Ok(vec![9, 9, 9])
        }

        async fn generate_audio(&self, _request: &AudioGenerateRequest) -> Result<GeneratedAudio> {
            Err(anyhow!("unused"))
        }

        async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
            self.urls.get(url).cloned().ok_or_else(|| anyhow!("404 {}", url))
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

    fn service(speech: FakeSpeech) -> (Arc<FakeMp3>, Arc<FakeSpeech>, AudioService) {
        let mp3 = Arc::new(FakeMp3::default());
        let speech = Arc::new(speech);
        let svc = AudioService::new(mp3.clone(), speech.clone());
        (mp3, speech, svc)
    }

    #[tokio::test]
    async fn test_auto_prefers_cached_mp3() {
        let (mp3, speech, svc) = service(FakeSpeech::default());
        let mut cache = FakeCache::default();
        cache.0.insert("colosseum:en".into(), vec![1, 2, 3]);
        let svc = svc.with_cache(Arc::new(cache));

        let handle = svc
            .play_auto("colosseum", "Welcome.", "en", Some("/ignored.mp3"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.source(), AudioSource::CachedMp3);
        assert_eq!(mp3.played.lock().unwrap()[0], vec![1, 2, 3]);
        assert!(speech.spoken.lock().unwrap().is_empty());
        assert!(svc.is_landmark_spoken("colosseum"));
        assert_eq!(svc.state(), PlaybackState::PlayingMp3);

        mp3.finish();
        assert_eq!(handle.finished().await, PlaybackOutcome::Ended);
        assert_eq!(svc.state(), PlaybackState::Ended);
    }

    #[tokio::test]
    async fn test_mp3_mode_has_no_fallback() {
        let (mp3, speech, svc) = service(FakeSpeech::default());
        svc.set_audio_mode(AudioMode::Mp3);

        let result = svc.play_auto("pantheon", "Hello.", "en", None).await.unwrap();
        assert!(result.is_none());
        assert!(mp3.played.lock().unwrap().is_empty());
        assert!(speech.spoken.lock().unwrap().is_empty());
        assert!(!svc.is_landmark_spoken("pantheon"));
        assert_eq!(svc.state(), PlaybackState::Idle);

        // Auto mode falls back to speech for the same input
        svc.set_audio_mode(AudioMode::Auto);
        let handle = svc.play_auto("pantheon", "Hello.", "en", None).await.unwrap().unwrap();
        assert_eq!(handle.source(), AudioSource::Speech);
        assert_eq!(speech.spoken.lock().unwrap()[0].text, "Hello.");
        assert_eq!(svc.state(), PlaybackState::PlayingTts);
    }

    #[tokio::test]
    async fn test_auto_url_failure_falls_back_to_speech() {
        let (mp3, speech, svc) = service(FakeSpeech::default());
        let mut api = FakeApi::default();
        api.urls.insert("/good.mp3".into(), vec![7]);
        let svc = svc.with_api(Arc::new(api));

        let handle = svc.play_auto("a", "Text.", "en", Some("/missing.mp3")).await.unwrap().unwrap();
        assert_eq!(handle.source(), AudioSource::Speech);
        assert_eq!(speech.spoken.lock().unwrap().len(), 1);

        let handle = svc.play_auto("b", "Text.", "en", Some("/good.mp3")).await.unwrap().unwrap();
        assert_eq!(handle.source(), AudioSource::UrlMp3);
        assert_eq!(mp3.played.lock().unwrap().len(), 1);
    }

    struct CorruptMp3;

    impl Mp3Output for CorruptMp3 {
        fn play(&self, _audio: Vec<u8>, _rate: f32, _done: PlaybackDone) -> Result<()> {
            Err(anyhow!("MP3 decode failed: no supported format"))
        }

        fn stop(&self) {}

        fn is_playing(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_auto_undecodable_mp3_falls_back_to_speech() {
        let speech = Arc::new(FakeSpeech::default());
        let mut cache = FakeCache::default();
        cache.0.insert("forum:en".into(), b"garbage".to_vec());
        let svc = AudioService::new(Arc::new(CorruptMp3), speech.clone())
            .with_cache(Arc::new(cache));

        let handle = svc.play_auto("forum", "Ruins.", "en", None).await.unwrap().unwrap();
        assert_eq!(handle.source(), AudioSource::Speech);
        assert_eq!(speech.spoken.lock().unwrap()[0].text, "Ruins.");
        assert_eq!(svc.state(), PlaybackState::PlayingTts);
        assert!(svc.is_landmark_spoken("forum"));

        // Forced mp3 mode reports the failure instead
        svc.set_audio_mode(AudioMode::Mp3);
        assert!(matches!(
            svc.play_auto("forum", "Ruins.", "en", None).await,
            Err(AudioError::Playback(_))
        ));
    }

    #[tokio::test]
    async fn test_new_playback_stops_previous() {
        let (mp3, speech, svc) = service(FakeSpeech::default());
        let mut cache = FakeCache::default();
        cache.0.insert("a:en".into(), vec![1]);
        let svc = svc.with_cache(Arc::new(cache));

        let first = svc.play_auto("a", "A.", "en", None).await.unwrap().unwrap();
        let second = svc.play_tts(Some("b"), "B.", "en").unwrap();

        assert_eq!(first.finished().await, PlaybackOutcome::Stopped);
        assert!(!mp3.is_playing());
        assert!(speech.is_speaking());
        assert!(second.generation() > 0);
        assert_eq!(svc.state(), PlaybackState::PlayingTts);
    }

    #[tokio::test]
    async fn test_superseded_remote_tts_never_plays() {
        let (mp3, _speech, svc) = service(FakeSpeech::default());
        let api = FakeApi {
            clova_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let svc = Arc::new(svc.with_api(Arc::new(api)));

        let slow = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.play_clova(Some("a"), "Slow.", "ko").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.state(), PlaybackState::Resolving);

        svc.play_tts(Some("b"), "Fast.", "en").unwrap();

        let result = slow.await.unwrap();
        assert!(matches!(result, Err(AudioError::Superseded)));
        assert!(mp3.played.lock().unwrap().is_empty());
        assert!(!svc.is_landmark_spoken("a"));
        assert_eq!(svc.state(), PlaybackState::PlayingTts);
    }

    #[tokio::test]
    async fn test_forced_modes_report_errors() {
        let (_mp3, _speech, svc) = service(FakeSpeech::default());
        svc.set_audio_mode(AudioMode::Clova);
        let result = svc.play_auto("a", "Text.", "en", None).await;
        assert!(matches!(result, Err(AudioError::RemoteUnavailable)));
        assert_eq!(svc.state(), PlaybackState::Error);

        let (_mp3, _speech, svc) = service(FakeSpeech::default());
        let svc = svc.with_api(Arc::new(FakeApi {
            clova_fails: true,
            ..Default::default()
        }));
        let result = svc.play_clova(Some("a"), "Text.", "en").await;
        assert!(matches!(result, Err(AudioError::RemoteTts(_))));

        svc.set_audio_mode(AudioMode::Tts);
        let result = svc.play_auto("a", "  ", "en", None).await;
        assert!(matches!(result, Err(AudioError::NoAudioSource(_))));
    }

    #[tokio::test]
    async fn test_narrate_skips_spoken_and_disabled() {
        let (_mp3, speech, svc) = service(FakeSpeech::default());
        let landmark: Landmark = serde_json::from_value(serde_json::json!({
            "id": "trevi", "cityId": "rome", "name": "Trevi",
            "lat": 41.9, "lng": 12.48, "radius": 40.0, "narration": "Coins."
        }))
        .unwrap();

        assert!(svc.narrate(&landmark, "en").await.unwrap().is_some());
        assert!(svc.narrate(&landmark, "en").await.unwrap().is_none());
        assert_eq!(speech.spoken.lock().unwrap().len(), 1);

        svc.reset();
        svc.set_enabled(false);
        assert!(svc.narrate(&landmark, "en").await.unwrap().is_none());
        assert!(matches!(svc.play_tts(None, "x", "en"), Err(AudioError::Disabled)));
    }

    #[tokio::test]
    async fn test_speech_uses_selected_voice_and_rate() {
        let speech = FakeSpeech {
            voices: vec![
                Voice::new("Monica", "es-ES", true),
                Voice::new("Microsoft Elvira Online (Natural)", "es-ES", false),
            ],
            ..Default::default()
        };
        let (_mp3, speech, svc) = service(speech);
        assert_eq!(svc.set_rate(5.0), MAX_RATE);
        assert_eq!(svc.set_rate(0.8), 0.8);

        svc.play_tts(None, "Hola.", "es").unwrap();
        let utterance = speech.spoken.lock().unwrap()[0].clone();
        assert_eq!(utterance.voice.unwrap().name, "Microsoft Elvira Online (Natural)");
        assert_eq!(utterance.locale, "es-ES");
        assert_eq!(utterance.rate, 0.8);

        svc.set_voice_override("es", "Monica");
        svc.play_tts(None, "Hola.", "es").unwrap();
        assert_eq!(speech.spoken.lock().unwrap()[1].voice.as_ref().unwrap().name, "Monica");
    }

    #[tokio::test]
    async fn test_play_sentences_publishes_index() {
        let (_mp3, speech, svc) = service(FakeSpeech {
            auto_finish: true,
            ..Default::default()
        });
        let index = svc.sentence_index();

        let outcome = svc
            .play_sentences("One. Two! Three?", "en", Some(1.25))
            .await
            .unwrap();

        assert_eq!(outcome, PlaybackOutcome::Ended);
        let texts: Vec<_> = speech.spoken.lock().unwrap().iter().map(|u| u.text.clone()).collect();
        assert_eq!(texts, vec!["One.", "Two!", "Three?"]);
        assert_eq!(*index.borrow(), NO_SENTENCE);
        assert_eq!(svc.rate(), 1.25);
    }

    #[tokio::test]
    async fn test_toggling_audio_clears_spoken_set() {
        let (_mp3, speech, svc) = service(FakeSpeech::default());
        svc.play_tts(Some("pantheon"), "Columns.", "en").unwrap();
        assert!(svc.is_landmark_spoken("pantheon"));

        svc.set_enabled(false);
        assert!(!speech.is_speaking());
        svc.set_enabled(true);
        assert!(!svc.is_landmark_spoken("pantheon"));
        assert_eq!(svc.spoken_count(), 0);

        // Setting the same value again is not a toggle
        svc.mark_spoken("pantheon");
        svc.set_enabled(true);
        assert!(svc.is_landmark_spoken("pantheon"));
    }

    #[tokio::test]
    async fn test_stop_between_sentences_leaves_no_index() {
        let (_mp3, _speech, svc) = service(FakeSpeech::default());
        let index = svc.sentence_index();

        let (generation, _token) = svc.begin().unwrap();
        assert!(svc.publish_sentence(generation, 0));
        // First sentence finished, second not yet started
        lock(&svc.state).current = None;
        svc.stop_all();

        assert!(!svc.publish_sentence(generation, 1));
        svc.finish_sentences(generation);
        assert_eq!(*index.borrow(), NO_SENTENCE);

        // A run superseded by other playback still clears its index
        let (generation, _token) = svc.begin().unwrap();
        assert!(svc.publish_sentence(generation, 2));
        svc.play_tts(None, "Other.", "en").unwrap();
        svc.finish_sentences(generation);
        assert_eq!(*index.borrow(), NO_SENTENCE);
    }

    #[tokio::test]
    async fn test_stop_all_interrupts_sentences() {
        let (_mp3, speech, svc) = service(FakeSpeech::default());
        let svc = Arc::new(svc);

        let task = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.play_sentences("One. Two.", "en", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*svc.sentence_index().borrow(), 0);

        svc.stop_all();
        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(speech.spoken.lock().unwrap().len(), 1);
        assert_eq!(svc.state(), PlaybackState::Idle);
    }
}
