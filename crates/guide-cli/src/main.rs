// ============================================================================
// tour-guide: command line front end for the GPS audio guide
// ============================================================================
// Usage:
//   tour-guide stats                              Show offline store statistics
//   tour-guide download --city rome               Save a city package offline
//   tour-guide download-audio --city rome -l ko   Cache narration audio
//   tour-guide walk --city rome --track walk.csv  Replay a GPS track
//   tour-guide sync-visits                        Flush the visited outbox
//   tour-guide export --password pw --out trip    Encrypted trip archive
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use guide_core::audio::{ConsoleSpeech, Mp3Output, NullOutput};
use guide_core::geo::{format_distance, sort_by_distance};
use guide_core::narration::TrackReplay;
use guide_core::{
    AudioDownloader, AudioMode, AudioService, GpsPosition, GuideApiClient, GuideConfig,
    LandmarkCategory, NarrationApi, NarrationEngine, OfflineStore, Preferences,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// GPS audio tour guide
#[derive(Parser)]
#[command(name = "tour-guide", version, about = "GPS-triggered landmark narration with an offline cache")]
struct Cli {
    /// Path to the database file (default: ~/.audioguide/offline.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Guide server base URL (default: GUIDE_API_URL or http://localhost:5000)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show offline store statistics
    Stats,

    /// List downloaded cities
    ListCities,

    /// List stored landmarks
    ListLandmarks {
        #[arg(long)]
        city: Option<String>,

        /// Filter by category: landmark, activity, restaurant, gift-shop
        #[arg(long)]
        category: Option<String>,

        /// Sort by distance from "lat,lng"
        #[arg(long)]
        near: Option<String>,
    },

    /// Download a city package from the server for offline use
    Download {
        #[arg(long)]
        city: String,
    },

    /// Generate and cache narration audio for a downloaded city
    DownloadAudio {
        #[arg(long)]
        city: String,

        #[arg(long, short)]
        language: Option<String>,

        #[arg(long)]
        voice: Option<String>,
    },

    /// Remove a city package
    DeleteCity {
        #[arg(long)]
        city: String,
    },

    /// Remove cached narration audio (all, or one language)
    DeleteAudio {
        #[arg(long, short)]
        language: Option<String>,
    },

    /// Replay a recorded GPS track (CSV of lat,lng) through the narrator
    Walk {
        #[arg(long)]
        city: String,

        #[arg(long)]
        track: PathBuf,

        #[arg(long, short)]
        language: Option<String>,

        /// Audio mode: auto, tts, clova, mp3
        #[arg(long)]
        mode: Option<String>,

        /// Delay between track points in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Move on to the next point without waiting for narration to end
        #[arg(long)]
        no_wait: bool,
    },

    /// Narrate one landmark now
    Say {
        #[arg(long)]
        landmark: String,

        #[arg(long, short)]
        language: Option<String>,

        #[arg(long)]
        mode: Option<String>,
    },

    /// Read a landmark's detailed description sentence by sentence
    Read {
        #[arg(long)]
        landmark: String,

        #[arg(long, short)]
        language: Option<String>,

        #[arg(long)]
        rate: Option<f32>,
    },

    /// Show queued visits
    Visits {
        /// Only show visits not yet sent to the server
        #[arg(long)]
        unsynced: bool,
    },

    /// Send queued visits to the server
    SyncVisits,

    /// Delete visits the server already acknowledged
    Prune,

    /// Write an encrypted archive of all offline data
    Export {
        #[arg(long)]
        password: String,

        #[arg(long)]
        out: PathBuf,
    },

    /// Restore an encrypted archive
    Import {
        #[arg(long)]
        password: String,

        #[arg(long)]
        file: PathBuf,
    },

    /// Set (or clear, without --voice) the preferred voice for a language
    SetVoice {
        #[arg(long, short)]
        language: String,

        #[arg(long)]
        voice: Option<String>,
    },

    /// Store the speech rate (0.5 - 2.0)
    SetRate { rate: f32 },

    /// Store the default audio mode
    SetMode { mode: String },

    /// Print the visit session id
    Session,

    /// Delete all cities, landmarks and visits
    ClearAll {
        #[arg(long)]
        yes: bool,
    },
}

fn parse_mode(s: &str) -> Result<AudioMode> {
    AudioMode::from_str(s).ok_or_else(|| {
        anyhow!("Unknown audio mode '{}'. Valid values: auto, tts, clova, mp3", s)
    })
}

fn parse_position(s: &str) -> Result<GpsPosition> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| anyhow!("Expected 'lat,lng', got '{}'", s))?;
    Ok(GpsPosition::new(lat.trim().parse()?, lng.trim().parse()?))
}

fn format_timestamp(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|_| rfc3339.to_string())
}

/// Shared services for commands that play or fetch audio
struct App {
    config: GuideConfig,
    store: Arc<OfflineStore>,
    api: Arc<GuideApiClient>,
}

impl App {
    fn audio_output() -> Arc<dyn Mp3Output> {
        #[cfg(feature = "native-audio")]
        {
            match guide_core::audio::RodioOutput::new() {
                Ok(output) => return Arc::new(output),
                Err(e) => warn!("MP3 playback unavailable, continuing silently: {}", e),
            }
        }
        Arc::new(NullOutput)
    }

    fn audio_service(&self, mode: Option<&str>) -> Result<Arc<AudioService>> {
        let audio = AudioService::new(Self::audio_output(), Arc::new(ConsoleSpeech::default()))
            .with_api(self.api.clone())
            .with_cache(self.store.clone());
        audio.set_rate(self.config.speech_rate);

        let prefs = Preferences::new(self.store.clone());
        prefs.apply_to(&audio)?;

        // Explicit flag, then environment, then stored preference
        if let Some(mode) = mode {
            audio.set_audio_mode(parse_mode(mode)?);
        } else if std::env::var("GUIDE_AUDIO_MODE").is_ok() {
            audio.set_audio_mode(self.config.audio_mode);
        }
        Ok(Arc::new(audio))
    }

    fn language(&self, language: Option<String>) -> String {
        language.unwrap_or_else(|| self.config.language.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Could not load .env file: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guide_core=info".parse()?)
                .add_directive("tour_guide=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = GuideConfig::from_env()?;
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }

    let db_path = config.resolved_db_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
    }
    let store = Arc::new(OfflineStore::open(Some(&db_path))?);
    let api = Arc::new(GuideApiClient::new(config.api_url.clone()));
    let app = App { config, store, api };

    match cli.command {
        Commands::Stats => cmd_stats(&app),
        Commands::ListCities => cmd_list_cities(&app),
        Commands::ListLandmarks {
            city,
            category,
            near,
        } => cmd_list_landmarks(&app, city, category, near),
        Commands::Download { city } => cmd_download(&app, &city).await,
        Commands::DownloadAudio {
            city,
            language,
            voice,
        } => cmd_download_audio(&app, &city, language, voice).await,
        Commands::DeleteCity { city } => {
            let removed = app.store.delete_city_data(&city)?;
            println!("Deleted {} ({} landmarks)", city, removed);
            Ok(())
        }
        Commands::DeleteAudio { language } => cmd_delete_audio(&app, language),
        Commands::Walk {
            city,
            track,
            language,
            mode,
            interval_ms,
            no_wait,
        } => cmd_walk(&app, &city, &track, language, mode, interval_ms, no_wait).await,
        Commands::Say {
            landmark,
            language,
            mode,
        } => cmd_say(&app, &landmark, language, mode).await,
        Commands::Read {
            landmark,
            language,
            rate,
        } => cmd_read(&app, &landmark, language, rate).await,
        Commands::Visits { unsynced } => cmd_visits(&app, unsynced),
        Commands::SyncVisits => {
            let report = guide_core::sync::sync_visits(&app.store, app.api.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Prune => {
            let cleared = app.store.clear_synced_visits()?;
            println!("Removed {} synced visits", cleared);
            Ok(())
        }
        Commands::Export { password, out } => {
            let encoded = guide_core::export::export_trip(&app.store, &password)?;
            std::fs::write(&out, encoded)
                .map_err(|e| anyhow!("Failed to write {}: {}", out.display(), e))?;
            println!("Wrote {}", out.display());
            Ok(())
        }
        Commands::Import { password, file } => {
            let encoded = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("Failed to read {}: {}", file.display(), e))?;
            let summary = guide_core::export::import_trip(&app.store, &encoded, &password)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::SetVoice { language, voice } => cmd_set_voice(&app, &language, voice),
        Commands::SetRate { rate } => {
            let rate = guide_core::config::parse_rate(&rate.to_string())?;
            Preferences::new(app.store.clone()).set_speech_rate(rate)?;
            println!("Speech rate set to {}", rate);
            Ok(())
        }
        Commands::SetMode { mode } => {
            let mode = parse_mode(&mode)?;
            Preferences::new(app.store.clone()).set_audio_mode(mode)?;
            println!("Audio mode set to {}", mode.as_str());
            Ok(())
        }
        Commands::Session => {
            println!("{}", Preferences::new(app.store.clone()).session_id()?);
            Ok(())
        }
        Commands::ClearAll { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear offline data without --yes");
            }
            app.store.clear_all()?;
            println!("All offline data cleared");
            Ok(())
        }
    }
}

fn cmd_stats(app: &App) -> Result<()> {
    let stats = app.store.storage_stats()?;

    println!("=== Audio Guide Offline Store ===");
    println!("Database: {}", app.store.path().display());
    println!();
    println!("Cities:    {}", stats.cities);
    println!("Landmarks: {}", stats.landmarks);
    println!(
        "Audio:     {} files ({:.1} MB)",
        stats.audio_files,
        stats.audio_bytes as f64 / 1_048_576.0
    );
    println!(
        "Visits:    {} queued, {} synced",
        stats.unsynced_visits, stats.synced_visits
    );

    Ok(())
}

fn cmd_list_cities(app: &App) -> Result<()> {
    let cities = app.store.get_all_cities_metadata()?;
    if cities.is_empty() {
        println!("No cities downloaded.");
        return Ok(());
    }

    println!(
        "{:<16}  {:<20}  {:<12}  {:>9}  {:>3}  {}",
        "CITY ID", "NAME", "COUNTRY", "LANDMARKS", "V", "DOWNLOADED"
    );
    println!("{}", "-".repeat(90));
    for meta in &cities {
        println!(
            "{:<16}  {:<20}  {:<12}  {:>9}  {:>3}  {}",
            meta.city_id,
            meta.name,
            meta.country,
            meta.landmark_count,
            meta.version,
            format_timestamp(&meta.downloaded_at)
        );
    }
    Ok(())
}

fn cmd_list_landmarks(
    app: &App,
    city: Option<String>,
    category: Option<String>,
    near: Option<String>,
) -> Result<()> {
    let mut landmarks = match category.as_deref() {
        Some(raw) => {
            let category = LandmarkCategory::from_str(raw)
                .ok_or_else(|| anyhow!("Unknown category '{}'", raw))?;
            app.store.get_landmarks_by_category(category)?
        }
        None => app.store.get_landmarks(city.as_deref())?,
    };
    if let (Some(city), Some(_)) = (city.as_deref(), category.as_deref()) {
        landmarks.retain(|l| l.city_id == city);
    }

    if landmarks.is_empty() {
        println!("No landmarks found.");
        return Ok(());
    }

    let position = near.as_deref().map(parse_position).transpose()?;
    let language = app.config.language.as_str();

    println!(
        "{:<24}  {:<30}  {:<11}  {:>7}  {}",
        "LANDMARK ID", "NAME", "CATEGORY", "RADIUS", "DISTANCE"
    );
    println!("{}", "-".repeat(90));
    for (landmark, distance) in sort_by_distance(position.as_ref(), &landmarks) {
        println!(
            "{:<24}  {:<30}  {:<11}  {:>6}m  {}",
            landmark.id,
            landmark.name_for(language).chars().take(30).collect::<String>(),
            landmark.category.as_str(),
            landmark.radius,
            distance.map(format_distance).unwrap_or_else(|| "-".into())
        );
    }

    println!("\nTotal: {} landmarks", landmarks.len());
    Ok(())
}

async fn cmd_download(app: &App, city_id: &str) -> Result<()> {
    let city = app.api.fetch_city(city_id).await?;
    let landmarks = app.api.fetch_landmarks(city_id).await?;

    let version = app
        .store
        .get_city_metadata(city_id)?
        .map(|m| m.version + 1)
        .unwrap_or(1);
    app.store
        .save_offline_package(&city, &landmarks, version, None)?;

    println!(
        "Saved {} ({} landmarks, version {})",
        city.name,
        landmarks.len(),
        version
    );
    Ok(())
}

async fn cmd_download_audio(
    app: &App,
    city_id: &str,
    language: Option<String>,
    voice: Option<String>,
) -> Result<()> {
    let language = app.language(language);
    let landmarks = app.store.get_landmarks(Some(city_id))?;
    if landmarks.is_empty() {
        anyhow::bail!("City '{}' is not downloaded. Run `tour-guide download --city {}` first.", city_id, city_id);
    }

    let downloader = AudioDownloader::new(app.store.clone(), app.api.clone());
    let summary = downloader
        .download_all(&landmarks, &language, voice.as_deref())
        .await?;

    for progress in downloader.all_progress() {
        println!(
            "  {:<24} {:>3}%  {:?}{}",
            progress.landmark_id,
            progress.progress,
            progress.status,
            progress
                .error
                .as_ref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    println!(
        "\n{} downloaded, {} already cached, {} failed",
        summary.downloaded,
        summary.skipped,
        summary.failed.len()
    );
    Ok(())
}

fn cmd_delete_audio(app: &App, language: Option<String>) -> Result<()> {
    match language {
        Some(language) => {
            let removed = app.store.delete_audio_for_language(&language)?;
            println!("Removed {} audio files for {}", removed, language);
        }
        None => {
            let stats = app.store.audio_stats()?;
            app.store.clear_audio()?;
            println!("Removed {} audio files", stats.count);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_walk(
    app: &App,
    city_id: &str,
    track: &std::path::Path,
    language: Option<String>,
    mode: Option<String>,
    interval_ms: u64,
    no_wait: bool,
) -> Result<()> {
    let landmarks = app.store.get_landmarks(Some(city_id))?;
    if landmarks.is_empty() {
        anyhow::bail!("City '{}' has no offline landmarks", city_id);
    }

    let replay = TrackReplay::from_file(track, Duration::from_millis(interval_ms))?;
    info!("Replaying {} track points", replay.len());

    let audio = app.audio_service(mode.as_deref())?;
    let session = Preferences::new(app.store.clone()).session_id()?;
    let mut engine = NarrationEngine::new(audio.clone())
        .with_store(app.store.clone())
        .with_session(session)
        .with_language(app.language(language))
        .with_wait_for_playback(!no_wait);
    engine.set_city(landmarks);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let summary = engine.run(replay, shutdown).await;
    audio.stop_all();

    println!(
        "Walked {} points: {} landmarks reached, {} narrated",
        summary.positions, summary.triggered, summary.narrated
    );
    Ok(())
}

async fn cmd_say(
    app: &App,
    landmark_id: &str,
    language: Option<String>,
    mode: Option<String>,
) -> Result<()> {
    let landmark = app
        .store
        .get_landmark(landmark_id)?
        .ok_or_else(|| anyhow!("Landmark '{}' not found offline", landmark_id))?;
    let language = app.language(language);
    let audio = app.audio_service(mode.as_deref())?;

    let handle = audio
        .play_auto(
            &landmark.id,
            landmark.narration_for(&language),
            &language,
            landmark.audio_url.as_deref(),
        )
        .await?;

    match handle {
        Some(handle) => {
            let source = handle.source();
            let outcome = handle.finished().await;
            println!("Played {:?}: {:?}", source, outcome);
        }
        None => println!("No audio available for {} in {} mode", landmark.id, audio.audio_mode().as_str()),
    }
    Ok(())
}

async fn cmd_read(
    app: &App,
    landmark_id: &str,
    language: Option<String>,
    rate: Option<f32>,
) -> Result<()> {
    let landmark = app
        .store
        .get_landmark(landmark_id)?
        .ok_or_else(|| anyhow!("Landmark '{}' not found offline", landmark_id))?;
    let language = app.language(language);
    let text = landmark
        .detailed_description_for(&language)
        .or_else(|| landmark.description_for(&language))
        .unwrap_or_else(|| landmark.narration_for(&language))
        .to_string();

    let audio = app.audio_service(None)?;
    let mut index = audio.sentence_index();
    let sentences = guide_core::audio::split_into_sentences(&text);
    let printer = tokio::spawn(async move {
        while index.changed().await.is_ok() {
            let current = *index.borrow();
            if let Some(sentence) = usize::try_from(current).ok().and_then(|i| sentences.get(i)) {
                println!("[{}] {}", current + 1, sentence);
            }
        }
    });

    let outcome = audio.play_sentences(&text, &language, rate).await?;
    if let Some(rate) = rate {
        Preferences::new(app.store.clone()).set_speech_rate(audio.rate())?;
        info!("Remembered speech rate {}", rate);
    }
    drop(audio);
    printer.abort();

    println!("Reading finished: {:?}", outcome);
    Ok(())
}

fn cmd_visits(app: &App, unsynced: bool) -> Result<()> {
    let visits = if unsynced {
        app.store.get_unsynced_visits()?
    } else {
        app.store.get_all_visits()?
    };

    if visits.is_empty() {
        println!("No visits queued.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<24}  {:<22}  {:<6}  {}",
        "ID", "LANDMARK", "VISITED AT", "SYNCED", "SESSION"
    );
    println!("{}", "-".repeat(90));
    for visit in &visits {
        println!(
            "{:>6}  {:<24}  {:<22}  {:<6}  {}",
            visit.id,
            visit.landmark_id,
            format_timestamp(&visit.visited_at),
            if visit.synced { "yes" } else { "no" },
            visit.session_id.as_deref().unwrap_or("-")
        );
    }

    println!("\nTotal: {} visits", visits.len());
    Ok(())
}

fn cmd_set_voice(app: &App, language: &str, voice: Option<String>) -> Result<()> {
    let prefs = Preferences::new(app.store.clone());
    let mut overrides = prefs.voice_overrides()?;
    match voice {
        Some(voice) => {
            overrides.set(language, voice.clone());
            println!("Voice for {} set to '{}'", language, voice);
        }
        None => {
            if overrides.clear(language) {
                println!("Voice override for {} cleared", language);
            } else {
                println!("No voice override set for {}", language);
            }
        }
    }
    prefs.set_voice_overrides(&overrides)
}
