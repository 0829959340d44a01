//! ============================================================================
//! Narration Engine - Position updates to narration
//! ============================================================================
//! Evaluates every position fix against the active landmark list:
//! - A landmark qualifies when the fix is strictly inside its radius and it
//!   has not been spoken yet
//! - The first qualifying landmark (list order) is narrated; playback is
//!   exclusive, so any others in the same tick are only recorded
//! - Every qualifying landmark is marked spoken and queued as visited
//! ============================================================================

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioService, PlaybackHandle};
use crate::db::OfflineStore;
use crate::geo::is_within_radius;
use crate::types::{GpsPosition, Landmark, DEFAULT_LANGUAGE};

/// What one position fix triggered
#[derive(Debug, Default)]
pub struct TickReport {
    /// Landmark ids that qualified, in list order
    pub triggered: Vec<String>,
    /// The landmark whose narration started, if any
    pub narrated: Option<String>,
    pub handle: Option<PlaybackHandle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub positions: usize,
    pub triggered: usize,
    pub narrated: usize,
}

/// A stream of position fixes
#[async_trait]
pub trait PositionSource: Send {
    /// Next fix, or `None` when the source is exhausted
    async fn next_position(&mut self) -> Option<GpsPosition>;
}

/// Positions pushed by another task
pub struct ChannelSource {
    rx: mpsc::Receiver<GpsPosition>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<GpsPosition>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl PositionSource for ChannelSource {
    async fn next_position(&mut self) -> Option<GpsPosition> {
        self.rx.recv().await
    }
}

/// A recorded track replayed at a fixed interval
pub struct TrackReplay {
    points: VecDeque<GpsPosition>,
    interval: Duration,
    started: bool,
}

impl TrackReplay {
    pub fn new(points: Vec<GpsPosition>, interval: Duration) -> Self {
        Self {
            points: points.into(),
            interval,
            started: false,
        }
    }

    /// Parse `lat,lng` lines. Blank lines, `#` comments and a `lat,lng`
    /// header are skipped.
    pub fn from_csv(text: &str, interval: Duration) -> Result<Self> {
        let mut points = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let (Some(lat), Some(lng)) = (fields.next(), fields.next()) else {
                return Err(anyhow!("Line {}: expected 'lat,lng'", n + 1));
            };
            if n == 0 && lat.parse::<f64>().is_err() {
                continue;
            }
            let lat: f64 = lat
                .parse()
                .map_err(|e| anyhow!("Line {}: bad latitude '{}': {}", n + 1, lat, e))?;
            let lng: f64 = lng
                .parse()
                .map_err(|e| anyhow!("Line {}: bad longitude '{}': {}", n + 1, lng, e))?;
            points.push(GpsPosition::new(lat, lng));
        }
        Ok(Self::new(points, interval))
    }

    pub fn from_file(path: &Path, interval: Duration) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read track {}: {}", path.display(), e))?;
        Self::from_csv(&text, interval)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[async_trait]
impl PositionSource for TrackReplay {
    async fn next_position(&mut self) -> Option<GpsPosition> {
        if self.points.is_empty() {
            return None;
        }
        if self.started && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        self.started = true;
        self.points.pop_front()
    }
}

pub struct NarrationEngine {
    audio: Arc<AudioService>,
    store: Option<Arc<OfflineStore>>,
    landmarks: Vec<Landmark>,
    language: String,
    session_id: Option<String>,
    wait_for_playback: bool,
}

impl NarrationEngine {
    pub fn new(audio: Arc<AudioService>) -> Self {
        Self {
            audio,
            store: None,
            landmarks: Vec::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            session_id: None,
            wait_for_playback: false,
        }
    }

    /// Queue visits into this store's outbox
    pub fn with_store(mut self, store: Arc<OfflineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// In `run`, hold the next fix until the current narration finishes
    pub fn with_wait_for_playback(mut self, wait: bool) -> Self {
        self.wait_for_playback = wait;
        self
    }

    pub fn audio(&self) -> &Arc<AudioService> {
        &self.audio
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = language.into();
    }

    /// Switch to a new landmark list and forget what was spoken
    pub fn set_city(&mut self, landmarks: Vec<Landmark>) {
        let (valid, invalid): (Vec<_>, Vec<_>) =
            landmarks.into_iter().partition(|l| l.validate().is_ok());
        for landmark in &invalid {
            if let Err(e) = landmark.validate() {
                warn!("Skipping landmark: {}", e);
            }
        }
        info!("Tracking {} landmarks", valid.len());
        self.landmarks = valid;
        self.audio.reset();
    }

    fn queue_visit(&self, landmark_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.queue_visited_landmark(landmark_id, self.session_id.as_deref()) {
                warn!("Failed to queue visit for {}: {}", landmark_id, e);
            }
        }
    }

    /// Evaluate one position fix
    pub async fn on_position(&self, position: &GpsPosition) -> TickReport {
        let mut report = TickReport::default();
        if !self.audio.is_enabled() {
            return report;
        }

        let qualifying: Vec<&Landmark> = self
            .landmarks
            .iter()
            .filter(|l| !self.audio.is_landmark_spoken(&l.id) && is_within_radius(position, l))
            .collect();

        for (i, landmark) in qualifying.into_iter().enumerate() {
            report.triggered.push(landmark.id.clone());

            if i == 0 {
                match self.audio.narrate(landmark, &self.language).await {
                    Ok(Some(handle)) => {
                        report.narrated = Some(landmark.id.clone());
                        report.handle = Some(handle);
                    }
                    Ok(None) => debug!("No narration played for {}", landmark.id),
                    Err(e) => warn!("Narration failed for {}: {}", landmark.id, e),
                }
            } else {
                debug!("Suppressed overlapping narration for {}", landmark.id);
            }

            self.audio.mark_spoken(&landmark.id);
            self.queue_visit(&landmark.id);
        }

        report
    }

    /// Consume positions until the source ends or `shutdown` fires
    pub async fn run<S: PositionSource>(
        &mut self,
        mut source: S,
        shutdown: CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();

        loop {
            let position = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = source.next_position() => match next {
                    Some(position) => position,
                    None => break,
                },
            };

            summary.positions += 1;
            let report = self.on_position(&position).await;
            summary.triggered += report.triggered.len();
            if report.narrated.is_some() {
                summary.narrated += 1;
            }

            if let (true, Some(handle)) = (self.wait_for_playback, report.handle) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    outcome = handle.finished() => debug!("Narration finished: {:?}", outcome),
                }
            }
        }

        info!(
            "Position stream ended: {} fixes, {} landmarks triggered, {} narrated",
            summary.positions, summary.triggered, summary.narrated
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ConsoleSpeech, NullOutput};

    fn landmark(id: &str, lat: f64, lng: f64, radius: f64) -> Landmark {
        serde_json::from_value(serde_json::json!({
            "id": id, "cityId": "rome", "name": id,
            "lat": lat, "lng": lng, "radius": radius,
            "narration": format!("You are at {}.", id)
        }))
        .unwrap()
    }

    fn engine() -> NarrationEngine {
        let speech = ConsoleSpeech::default().with_words_per_minute(60_000.0);
        let audio = AudioService::new(Arc::new(NullOutput), Arc::new(speech));
        NarrationEngine::new(Arc::new(audio))
    }

    #[tokio::test]
    async fn test_fires_once_inside_radius() {
        let mut engine = engine();
        engine.set_city(vec![landmark("pantheon", 41.8986, 12.4769, 40.0)]);
        let here = GpsPosition::new(41.8986, 12.4769);

        let first = engine.on_position(&here).await;
        assert_eq!(first.narrated.as_deref(), Some("pantheon"));
        assert!(engine.audio().is_landmark_spoken("pantheon"));

        let second = engine.on_position(&here).await;
        assert!(second.triggered.is_empty());
        assert!(second.handle.is_none());
    }

    #[tokio::test]
    async fn test_outside_radius_does_not_fire() {
        let mut engine = engine();
        engine.set_city(vec![landmark("pantheon", 41.8986, 12.4769, 40.0)]);

        let report = engine.on_position(&GpsPosition::new(41.8996, 12.4769)).await;
        assert!(report.triggered.is_empty());
        assert!(!engine.audio().is_landmark_spoken("pantheon"));
    }

    #[tokio::test]
    async fn test_overlap_narrates_first_and_records_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(Some(&dir.path().join("n.redb"))).unwrap());
        let mut engine = engine().with_store(store.clone()).with_session("session_t");
        engine.set_city(vec![
            landmark("far", 41.95, 12.50, 30.0),
            landmark("a", 41.8986, 12.4769, 80.0),
            landmark("b", 41.8987, 12.4770, 80.0),
        ]);

        let report = engine.on_position(&GpsPosition::new(41.8986, 12.4769)).await;
        assert_eq!(report.triggered, vec!["a", "b"]);
        assert_eq!(report.narrated.as_deref(), Some("a"));
        assert!(engine.audio().is_landmark_spoken("b"));

        let visits = store.get_unsynced_visits().unwrap();
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[0].session_id.as_deref(), Some("session_t"));
    }

    #[tokio::test]
    async fn test_disabled_audio_dispatches_nothing() {
        let mut engine = engine();
        engine.set_city(vec![landmark("a", 41.8986, 12.4769, 40.0)]);
        engine.audio().set_enabled(false);

        let report = engine.on_position(&GpsPosition::new(41.8986, 12.4769)).await;
        assert!(report.triggered.is_empty());
        assert!(!engine.audio().is_landmark_spoken("a"));
    }

    #[tokio::test]
    async fn test_set_city_resets_and_skips_invalid() {
        let mut engine = engine();
        engine.set_city(vec![landmark("a", 41.8986, 12.4769, 40.0)]);
        engine.on_position(&GpsPosition::new(41.8986, 12.4769)).await;
        assert!(engine.audio().is_landmark_spoken("a"));

        engine.set_city(vec![
            landmark("a", 41.8986, 12.4769, 40.0),
            landmark("bad", 41.8986, 12.4769, 0.0),
        ]);
        assert_eq!(engine.landmarks().len(), 1);
        assert!(!engine.audio().is_landmark_spoken("a"));
    }

    #[tokio::test]
    async fn test_run_over_track_replay() {
        let csv = "lat,lng\n# walk to the Pantheon\n41.9000,12.4769\n41.8986,12.4769\n41.8986,12.4769\n";
        let track = TrackReplay::from_csv(csv, Duration::ZERO).unwrap();
        assert_eq!(track.len(), 3);

        let mut engine = engine().with_wait_for_playback(true);
        engine.set_city(vec![landmark("pantheon", 41.8986, 12.4769, 40.0)]);

        let summary = engine.run(track, CancellationToken::new()).await;
        assert_eq!(summary, RunSummary { positions: 3, triggered: 1, narrated: 1 });
    }

    #[tokio::test]
    async fn test_run_over_channel_until_closed() {
        let (tx, source) = ChannelSource::new(8);
        let mut engine = engine();
        engine.set_city(vec![landmark("pantheon", 41.8986, 12.4769, 40.0)]);

        tx.send(GpsPosition::new(41.8986, 12.4769)).await.unwrap();
        drop(tx);

        let summary = engine.run(source, CancellationToken::new()).await;
        assert_eq!(summary.positions, 1);
        assert_eq!(summary.narrated, 1);
    }

    #[test]
    fn test_track_parse_errors() {
        assert!(TrackReplay::from_csv("41.9,abc", Duration::ZERO).is_err());
        assert!(TrackReplay::from_csv("lat,lng\n41.9", Duration::ZERO).is_err());
    }
}
