// ============================================================================
// OfflineStore - Embedded Database (redb)
// ============================================================================
// Persistent offline cache for city packages, narration audio, the visited
// outbox and user preferences.
// Default path: ~/.audioguide/offline.redb (override via GUIDE_DB_PATH env var)
// ============================================================================

pub mod types;

pub use types::{AudioCacheStats, CachedAudio, CityMetadata, StorageStats, VisitedQueueEntry};

use anyhow::{anyhow, Result};
use redb::{
    Database, MultimapTable, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, Table, TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::audio::AudioCache;
use crate::types::{City, Landmark, LandmarkCategory};

// Table definitions
const CITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("cities");
const LANDMARKS: TableDefinition<&str, &[u8]> = TableDefinition::new("landmarks");
const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
const VISITED_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("visited_queue");
const AUDIO: TableDefinition<&str, &[u8]> = TableDefinition::new("audio");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
/// Last id handed out per counter. Survives flushes and `clear_all`.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const VISIT_SEQUENCE: &str = "visited_queue";

// Secondary indexes
const LANDMARKS_BY_CITY: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("landmarks_by_city");
const LANDMARKS_BY_CATEGORY: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("landmarks_by_category");
const VISITS_BY_SYNCED: MultimapTableDefinition<u8, u64> =
    MultimapTableDefinition::new("visits_by_synced");

const UNSYNCED: u8 = 0;
const SYNCED: u8 = 1;

type BlobTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type IndexTable<'txn> = MultimapTable<'txn, &'static str, &'static str>;

fn encode<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

fn audio_key(landmark_id: &str, language: &str) -> String {
    format!("{}:{}", landmark_id, language)
}

/// Embedded database holding everything needed to guide without a network
pub struct OfflineStore {
    db: Database,
    path: PathBuf,
}

impl OfflineStore {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses GUIDE_DB_PATH env var or ~/.audioguide/offline.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("GUIDE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let guide_dir = home.join(".audioguide");
            std::fs::create_dir_all(&guide_dir)
                .map_err(|e| anyhow!("Failed to create .audioguide directory: {}", e))?;
            guide_dir.join("offline.redb")
        };

        info!("Opening offline store at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist so read transactions never hit a missing table
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            write_txn.open_table(CITIES).map_err(|e| anyhow!("Failed to create cities table: {}", e))?;
            write_txn.open_table(LANDMARKS).map_err(|e| anyhow!("Failed to create landmarks table: {}", e))?;
            write_txn.open_table(METADATA).map_err(|e| anyhow!("Failed to create metadata table: {}", e))?;
            write_txn.open_table(VISITED_QUEUE).map_err(|e| anyhow!("Failed to create visited queue: {}", e))?;
            write_txn.open_table(AUDIO).map_err(|e| anyhow!("Failed to create audio table: {}", e))?;
            write_txn.open_table(SETTINGS).map_err(|e| anyhow!("Failed to create settings table: {}", e))?;
            write_txn.open_table(SEQUENCES).map_err(|e| anyhow!("Failed to create sequences table: {}", e))?;
            write_txn.open_multimap_table(LANDMARKS_BY_CITY).map_err(|e| anyhow!("Failed to create city index: {}", e))?;
            write_txn.open_multimap_table(LANDMARKS_BY_CATEGORY).map_err(|e| anyhow!("Failed to create category index: {}", e))?;
            write_txn.open_multimap_table(VISITS_BY_SYNCED).map_err(|e| anyhow!("Failed to create synced index: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Offline store ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        self.db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))
    }

    fn begin_read(&self) -> Result<redb::ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))
    }

    // ========================================================================
    // City Packages
    // ========================================================================

    /// Store a city, all of its landmarks and the city's metadata in one
    /// transaction. Either all three writes land or none do.
    pub fn save_offline_package(
        &self,
        city: &City,
        landmarks: &[Landmark],
        version: u32,
        etag: Option<&str>,
    ) -> Result<()> {
        let metadata = CityMetadata {
            city_id: city.id.clone(),
            name: city.name.clone(),
            country: city.country.clone(),
            landmark_count: landmarks.len(),
            downloaded_at: chrono::Utc::now().to_rfc3339(),
            version,
            etag: etag.map(str::to_string),
        };

        let write_txn = self.begin_write()?;
        {
            let mut cities = write_txn.open_table(CITIES)
                .map_err(|e| anyhow!("Failed to open cities table: {}", e))?;
            cities.insert(city.id.as_str(), encode("city", city)?.as_slice())
                .map_err(|e| anyhow!("Failed to insert city: {}", e))?;

            let mut table = write_txn.open_table(LANDMARKS)
                .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?;
            let mut by_city = write_txn.open_multimap_table(LANDMARKS_BY_CITY)
                .map_err(|e| anyhow!("Failed to open city index: {}", e))?;
            let mut by_category = write_txn.open_multimap_table(LANDMARKS_BY_CATEGORY)
                .map_err(|e| anyhow!("Failed to open category index: {}", e))?;
            for landmark in landmarks {
                put_landmark(&mut table, &mut by_city, &mut by_category, landmark)?;
            }

            let mut meta = write_txn.open_table(METADATA)
                .map_err(|e| anyhow!("Failed to open metadata table: {}", e))?;
            meta.insert(city.id.as_str(), encode("metadata", &metadata)?.as_slice())
                .map_err(|e| anyhow!("Failed to insert metadata: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit package: {}", e))?;

        info!(
            "Saved offline package for {}: {} landmarks (v{})",
            city.name,
            landmarks.len(),
            version
        );
        Ok(())
    }

    /// Remove a city, its metadata and every landmark indexed under it in one
    /// transaction.
    pub fn delete_city_data(&self, city_id: &str) -> Result<usize> {
        let write_txn = self.begin_write()?;
        let removed;
        {
            let mut cities = write_txn.open_table(CITIES)
                .map_err(|e| anyhow!("Failed to open cities table: {}", e))?;
            cities.remove(city_id)
                .map_err(|e| anyhow!("Failed to remove city: {}", e))?;

            let mut meta = write_txn.open_table(METADATA)
                .map_err(|e| anyhow!("Failed to open metadata table: {}", e))?;
            meta.remove(city_id)
                .map_err(|e| anyhow!("Failed to remove metadata: {}", e))?;

            let mut table = write_txn.open_table(LANDMARKS)
                .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?;
            let mut by_city = write_txn.open_multimap_table(LANDMARKS_BY_CITY)
                .map_err(|e| anyhow!("Failed to open city index: {}", e))?;
            let mut by_category = write_txn.open_multimap_table(LANDMARKS_BY_CATEGORY)
                .map_err(|e| anyhow!("Failed to open category index: {}", e))?;

            let mut ids = Vec::new();
            for entry in by_city.remove_all(city_id)
                .map_err(|e| anyhow!("Failed to scan city index: {}", e))?
            {
                let guard = entry.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
                ids.push(guard.value().to_string());
            }

            for id in &ids {
                let old = table.remove(id.as_str())
                    .map_err(|e| anyhow!("Failed to remove landmark: {}", e))?
                    .map(|g| g.value().to_vec());
                if let Some(bytes) = old {
                    let landmark: Landmark = decode("landmark", &bytes)?;
                    by_category.remove(landmark.category.as_str(), id.as_str())
                        .map_err(|e| anyhow!("Failed to update category index: {}", e))?;
                }
            }
            removed = ids.len();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        info!("Deleted offline data for city {} ({} landmarks)", city_id, removed);
        Ok(removed)
    }

    pub fn get_city(&self, city_id: &str) -> Result<Option<City>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(CITIES)
            .map_err(|e| anyhow!("Failed to open cities table: {}", e))?;

        match table.get(city_id).map_err(|e| anyhow!("Failed to get city: {}", e))? {
            Some(value) => Ok(Some(decode("city", value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_all_cities(&self) -> Result<Vec<City>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(CITIES)
            .map_err(|e| anyhow!("Failed to open cities table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate cities: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode("city", value.value())?);
        }
        Ok(results)
    }

    /// Landmarks of one city through the city index, or every stored landmark
    pub fn get_landmarks(&self, city_id: Option<&str>) -> Result<Vec<Landmark>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LANDMARKS)
            .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?;

        let mut results = Vec::new();
        match city_id {
            Some(city_id) => {
                let index = read_txn.open_multimap_table(LANDMARKS_BY_CITY)
                    .map_err(|e| anyhow!("Failed to open city index: {}", e))?;
                for entry in index.get(city_id)
                    .map_err(|e| anyhow!("Failed to read city index: {}", e))?
                {
                    let id = entry.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
                    if let Some(value) = table.get(id.value())
                        .map_err(|e| anyhow!("Failed to get landmark: {}", e))?
                    {
                        results.push(decode("landmark", value.value())?);
                    }
                }
            }
            None => {
                let iter = table.range::<&str>(..)
                    .map_err(|e| anyhow!("Failed to iterate landmarks: {}", e))?;
                for entry in iter {
                    let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
                    results.push(decode("landmark", value.value())?);
                }
            }
        }
        Ok(results)
    }

    pub fn get_landmarks_by_category(&self, category: LandmarkCategory) -> Result<Vec<Landmark>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LANDMARKS)
            .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?;
        let index = read_txn.open_multimap_table(LANDMARKS_BY_CATEGORY)
            .map_err(|e| anyhow!("Failed to open category index: {}", e))?;

        let mut results = Vec::new();
        for entry in index.get(category.as_str())
            .map_err(|e| anyhow!("Failed to read category index: {}", e))?
        {
            let id = entry.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
            if let Some(value) = table.get(id.value())
                .map_err(|e| anyhow!("Failed to get landmark: {}", e))?
            {
                results.push(decode("landmark", value.value())?);
            }
        }
        Ok(results)
    }

    pub fn get_landmark(&self, landmark_id: &str) -> Result<Option<Landmark>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LANDMARKS)
            .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?;

        match table.get(landmark_id).map_err(|e| anyhow!("Failed to get landmark: {}", e))? {
            Some(value) => Ok(Some(decode("landmark", value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_city_metadata(&self, city_id: &str) -> Result<Option<CityMetadata>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(METADATA)
            .map_err(|e| anyhow!("Failed to open metadata table: {}", e))?;

        match table.get(city_id).map_err(|e| anyhow!("Failed to get metadata: {}", e))? {
            Some(value) => Ok(Some(decode("metadata", value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_all_cities_metadata(&self) -> Result<Vec<CityMetadata>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(METADATA)
            .map_err(|e| anyhow!("Failed to open metadata table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate metadata: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode("metadata", value.value())?);
        }
        Ok(results)
    }

    pub fn is_city_downloaded(&self, city_id: &str) -> Result<bool> {
        Ok(self.get_city_metadata(city_id)?.is_some())
    }

    // ========================================================================
    // Visited Outbox
    // ========================================================================

    /// Append a visit to the outbox. Returns the new entry id.
    pub fn queue_visited_landmark(&self, landmark_id: &str, session_id: Option<&str>) -> Result<u64> {
        let write_txn = self.begin_write()?;
        let id;
        {
            let mut table = write_txn.open_table(VISITED_QUEUE)
                .map_err(|e| anyhow!("Failed to open visited queue: {}", e))?;
            let mut sequences = write_txn.open_table(SEQUENCES)
                .map_err(|e| anyhow!("Failed to open sequences table: {}", e))?;
            let stored = sequences.get(VISIT_SEQUENCE)
                .map_err(|e| anyhow!("Failed to read visit sequence: {}", e))?
                .map(|v| v.value())
                .unwrap_or(0);
            let highest = table.last()
                .map_err(|e| anyhow!("Failed to read visited queue: {}", e))?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            id = stored.max(highest) + 1;
            sequences.insert(VISIT_SEQUENCE, id)
                .map_err(|e| anyhow!("Failed to advance visit sequence: {}", e))?;

            let entry = VisitedQueueEntry {
                id,
                landmark_id: landmark_id.to_string(),
                session_id: session_id.map(str::to_string),
                visited_at: chrono::Utc::now().to_rfc3339(),
                synced: false,
            };
            table.insert(id, encode("visit", &entry)?.as_slice())
                .map_err(|e| anyhow!("Failed to insert visit: {}", e))?;

            let mut index = write_txn.open_multimap_table(VISITS_BY_SYNCED)
                .map_err(|e| anyhow!("Failed to open synced index: {}", e))?;
            index.insert(UNSYNCED, id)
                .map_err(|e| anyhow!("Failed to index visit: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Queued visit {} for landmark {}", id, landmark_id);
        Ok(id)
    }

    fn visits_with_flag(&self, flag: u8) -> Result<Vec<VisitedQueueEntry>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VISITED_QUEUE)
            .map_err(|e| anyhow!("Failed to open visited queue: {}", e))?;
        let index = read_txn.open_multimap_table(VISITS_BY_SYNCED)
            .map_err(|e| anyhow!("Failed to open synced index: {}", e))?;

        let mut results = Vec::new();
        for entry in index.get(flag).map_err(|e| anyhow!("Failed to read synced index: {}", e))? {
            let id = entry.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
            if let Some(value) = table.get(id.value())
                .map_err(|e| anyhow!("Failed to get visit: {}", e))?
            {
                results.push(decode("visit", value.value())?);
            }
        }
        Ok(results)
    }

    /// Visits not yet acknowledged by the server, oldest first
    pub fn get_unsynced_visits(&self) -> Result<Vec<VisitedQueueEntry>> {
        self.visits_with_flag(UNSYNCED)
    }

    pub fn get_all_visits(&self) -> Result<Vec<VisitedQueueEntry>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VISITED_QUEUE)
            .map_err(|e| anyhow!("Failed to open visited queue: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<u64>(..)
            .map_err(|e| anyhow!("Failed to iterate visits: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode("visit", value.value())?);
        }
        Ok(results)
    }

    /// Flag a visit as acknowledged. Returns false if the entry is gone.
    pub fn mark_visit_synced(&self, id: u64) -> Result<bool> {
        let write_txn = self.begin_write()?;
        let found;
        {
            let mut table = write_txn.open_table(VISITED_QUEUE)
                .map_err(|e| anyhow!("Failed to open visited queue: {}", e))?;
            let existing = table.get(id)
                .map_err(|e| anyhow!("Failed to get visit: {}", e))?
                .map(|g| g.value().to_vec());

            found = existing.is_some();
            if let Some(bytes) = existing {
                let mut entry: VisitedQueueEntry = decode("visit", &bytes)?;
                entry.synced = true;
                table.insert(id, encode("visit", &entry)?.as_slice())
                    .map_err(|e| anyhow!("Failed to update visit: {}", e))?;

                let mut index = write_txn.open_multimap_table(VISITS_BY_SYNCED)
                    .map_err(|e| anyhow!("Failed to open synced index: {}", e))?;
                index.remove(UNSYNCED, id)
                    .map_err(|e| anyhow!("Failed to update synced index: {}", e))?;
                index.insert(SYNCED, id)
                    .map_err(|e| anyhow!("Failed to update synced index: {}", e))?;
            }
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        if found {
            debug!("Marked visit {} synced", id);
        }
        Ok(found)
    }

    /// Drop every synced visit. Returns the number removed.
    pub fn clear_synced_visits(&self) -> Result<usize> {
        let write_txn = self.begin_write()?;
        let removed;
        {
            let mut index = write_txn.open_multimap_table(VISITS_BY_SYNCED)
                .map_err(|e| anyhow!("Failed to open synced index: {}", e))?;
            let mut ids = Vec::new();
            for entry in index.remove_all(SYNCED)
                .map_err(|e| anyhow!("Failed to scan synced index: {}", e))?
            {
                ids.push(entry.map_err(|e| anyhow!("Failed to read index entry: {}", e))?.value());
            }

            let mut table = write_txn.open_table(VISITED_QUEUE)
                .map_err(|e| anyhow!("Failed to open visited queue: {}", e))?;
            for id in &ids {
                table.remove(*id).map_err(|e| anyhow!("Failed to remove visit: {}", e))?;
            }
            removed = ids.len();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        if removed > 0 {
            info!("Cleared {} synced visits", removed);
        }
        Ok(removed)
    }

    // ========================================================================
    // Audio Cache
    // ========================================================================

    pub fn save_audio(&self, audio: &CachedAudio) -> Result<()> {
        let key = audio_key(&audio.landmark_id, &audio.language);
        let value = encode("audio", audio)?;

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIO)
                .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;
            table.insert(key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert audio: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Cached audio {} ({} bytes)", key, audio.size_bytes);
        Ok(())
    }

    pub fn get_audio(&self, landmark_id: &str, language: &str) -> Result<Option<CachedAudio>> {
        let key = audio_key(landmark_id, language);

        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(AUDIO)
            .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;

        match table.get(key.as_str()).map_err(|e| anyhow!("Failed to get audio: {}", e))? {
            Some(value) => Ok(Some(decode("audio", value.value())?)),
            None => Ok(None),
        }
    }

    pub fn has_audio(&self, landmark_id: &str, language: &str) -> Result<bool> {
        let key = audio_key(landmark_id, language);

        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(AUDIO)
            .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;
        let exists = table.get(key.as_str())
            .map_err(|e| anyhow!("Failed to get audio: {}", e))?
            .is_some();
        Ok(exists)
    }

    pub fn delete_audio(&self, landmark_id: &str, language: &str) -> Result<bool> {
        let key = audio_key(landmark_id, language);

        let write_txn = self.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(AUDIO)
                .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;
            removed = table.remove(key.as_str())
                .map_err(|e| anyhow!("Failed to remove audio: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted cached audio {}", key);
        }
        Ok(removed)
    }

    /// Remove all cached audio in one language. Returns the number removed.
    pub fn delete_audio_for_language(&self, language: &str) -> Result<usize> {
        let suffix = format!(":{}", language);

        let write_txn = self.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(AUDIO)
                .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;
            let mut keys = Vec::new();
            for entry in table.range::<&str>(..)
                .map_err(|e| anyhow!("Failed to iterate audio: {}", e))?
            {
                let (key, _) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
                if key.value().ends_with(&suffix) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                table.remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove audio: {}", e))?;
            }
            removed = keys.len();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        info!("Deleted {} cached audio files for language {}", removed, language);
        Ok(removed)
    }

    pub fn clear_audio(&self) -> Result<()> {
        let write_txn = self.begin_write()?;
        write_txn.delete_table(AUDIO)
            .map_err(|e| anyhow!("Failed to drop audio table: {}", e))?;
        write_txn.open_table(AUDIO)
            .map_err(|e| anyhow!("Failed to recreate audio table: {}", e))?;
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        info!("Cleared audio cache");
        Ok(())
    }

    pub fn audio_stats(&self) -> Result<AudioCacheStats> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(AUDIO)
            .map_err(|e| anyhow!("Failed to open audio table: {}", e))?;

        let mut stats = AudioCacheStats::default();
        for entry in table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate audio: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let audio: CachedAudio = decode("audio", value.value())?;
            stats.count += 1;
            stats.total_bytes += audio.size_bytes;
        }
        Ok(stats)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SETTINGS)
            .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
        let value = table.get(key)
            .map_err(|e| anyhow!("Failed to get setting: {}", e))?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)
                .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
            table.insert(key, value)
                .map_err(|e| anyhow!("Failed to insert setting: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored setting {}", key);
        Ok(())
    }

    // ========================================================================
    // Statistics & Housekeeping
    // ========================================================================

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let audio = self.audio_stats()?;

        let read_txn = self.begin_read()?;
        let cities = read_txn.open_table(CITIES)
            .map_err(|e| anyhow!("Failed to open cities table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count cities: {}", e))?;
        let landmarks = read_txn.open_table(LANDMARKS)
            .map_err(|e| anyhow!("Failed to open landmarks table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count landmarks: {}", e))?;

        let index = read_txn.open_multimap_table(VISITS_BY_SYNCED)
            .map_err(|e| anyhow!("Failed to open synced index: {}", e))?;
        let unsynced = index.get(UNSYNCED)
            .map_err(|e| anyhow!("Failed to read synced index: {}", e))?
            .count();
        let synced = index.get(SYNCED)
            .map_err(|e| anyhow!("Failed to read synced index: {}", e))?
            .count();

        Ok(StorageStats {
            cities: cities as usize,
            landmarks: landmarks as usize,
            audio_files: audio.count,
            audio_bytes: audio.total_bytes,
            unsynced_visits: unsynced,
            synced_visits: synced,
        })
    }

    /// Drop all cities, landmarks, metadata and visits in one transaction.
    /// Cached audio and settings are kept.
    pub fn clear_all(&self) -> Result<()> {
        let write_txn = self.begin_write()?;
        write_txn.delete_table(CITIES).map_err(|e| anyhow!("Failed to drop cities: {}", e))?;
        write_txn.delete_table(LANDMARKS).map_err(|e| anyhow!("Failed to drop landmarks: {}", e))?;
        write_txn.delete_table(METADATA).map_err(|e| anyhow!("Failed to drop metadata: {}", e))?;
        write_txn.delete_table(VISITED_QUEUE).map_err(|e| anyhow!("Failed to drop visits: {}", e))?;
        write_txn.delete_multimap_table(LANDMARKS_BY_CITY).map_err(|e| anyhow!("Failed to drop city index: {}", e))?;
        write_txn.delete_multimap_table(LANDMARKS_BY_CATEGORY).map_err(|e| anyhow!("Failed to drop category index: {}", e))?;
        write_txn.delete_multimap_table(VISITS_BY_SYNCED).map_err(|e| anyhow!("Failed to drop synced index: {}", e))?;

        write_txn.open_table(CITIES).map_err(|e| anyhow!("Failed to recreate cities: {}", e))?;
        write_txn.open_table(LANDMARKS).map_err(|e| anyhow!("Failed to recreate landmarks: {}", e))?;
        write_txn.open_table(METADATA).map_err(|e| anyhow!("Failed to recreate metadata: {}", e))?;
        write_txn.open_table(VISITED_QUEUE).map_err(|e| anyhow!("Failed to recreate visits: {}", e))?;
        write_txn.open_multimap_table(LANDMARKS_BY_CITY).map_err(|e| anyhow!("Failed to recreate city index: {}", e))?;
        write_txn.open_multimap_table(LANDMARKS_BY_CATEGORY).map_err(|e| anyhow!("Failed to recreate category index: {}", e))?;
        write_txn.open_multimap_table(VISITS_BY_SYNCED).map_err(|e| anyhow!("Failed to recreate synced index: {}", e))?;
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        info!("All offline data cleared");
        Ok(())
    }
}

/// Upsert a landmark and keep both secondary indexes consistent
fn put_landmark(
    table: &mut BlobTable<'_>,
    by_city: &mut IndexTable<'_>,
    by_category: &mut IndexTable<'_>,
    landmark: &Landmark,
) -> Result<()> {
    let previous = table.get(landmark.id.as_str())
        .map_err(|e| anyhow!("Failed to get landmark: {}", e))?
        .map(|g| g.value().to_vec());
    if let Some(bytes) = previous {
        let old: Landmark = decode("landmark", &bytes)?;
        by_city.remove(old.city_id.as_str(), old.id.as_str())
            .map_err(|e| anyhow!("Failed to update city index: {}", e))?;
        by_category.remove(old.category.as_str(), old.id.as_str())
            .map_err(|e| anyhow!("Failed to update category index: {}", e))?;
    }

    table.insert(landmark.id.as_str(), encode("landmark", landmark)?.as_slice())
        .map_err(|e| anyhow!("Failed to insert landmark: {}", e))?;
    by_city.insert(landmark.city_id.as_str(), landmark.id.as_str())
        .map_err(|e| anyhow!("Failed to update city index: {}", e))?;
    by_category.insert(landmark.category.as_str(), landmark.id.as_str())
        .map_err(|e| anyhow!("Failed to update category index: {}", e))?;
    Ok(())
}

impl AudioCache for OfflineStore {
    fn cached_audio(&self, landmark_id: &str, language: &str) -> Result<Option<CachedAudio>> {
        self.get_audio(landmark_id, language)
    }
}

// ============================================================================
// Lazily Opened Store
// ============================================================================

/// Shared store that opens its database on first use. Concurrent first
/// callers wait on the same open instead of racing to create it twice.
pub struct StoreHandle {
    path: Option<PathBuf>,
    cell: OnceCell<Arc<OfflineStore>>,
}

impl StoreHandle {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cell: OnceCell::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<OfflineStore>> {
        let store = self
            .cell
            .get_or_try_init(|| async {
                let path = self.path.clone();
                tokio::task::spawn_blocking(move || OfflineStore::open(path.as_deref()))
                    .await
                    .map_err(|e| anyhow!("Store open task failed: {}", e))?
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, OfflineStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(Some(&dir.path().join("test.redb"))).unwrap();
        (dir, store)
    }

    fn city(id: &str) -> City {
        City {
            id: id.to_string(),
            name: "Rome".to_string(),
            country: "Italy".to_string(),
            lat: 41.9028,
            lng: 12.4964,
            zoom: 14,
            cruise_port: None,
        }
    }

    fn landmark(id: &str, city_id: &str, category: LandmarkCategory) -> Landmark {
        let mut lm: Landmark = serde_json::from_value(serde_json::json!({
            "id": id, "cityId": city_id, "name": id,
            "lat": 41.9, "lng": 12.48, "radius": 40.0,
            "narration": format!("This is {}", id),
            "translations": { "it": { "narration": "Ciao" } }
        }))
        .unwrap();
        lm.category = category;
        lm
    }

    #[test]
    fn test_package_round_trip_and_delete() {
        let (_dir, store) = temp_store();
        let rome = city("rome");
        let landmarks = vec![
            landmark("colosseum", "rome", LandmarkCategory::Landmark),
            landmark("pantheon", "rome", LandmarkCategory::Landmark),
            landmark("gelato", "rome", LandmarkCategory::Restaurant),
        ];

        store.save_offline_package(&rome, &landmarks, 3, Some("etag-1")).unwrap();

        assert_eq!(store.get_city("rome").unwrap(), Some(rome.clone()));
        let mut stored = store.get_landmarks(Some("rome")).unwrap();
        stored.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expected = landmarks.clone();
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(stored, expected);

        let meta = store.get_city_metadata("rome").unwrap().unwrap();
        assert_eq!(meta.landmark_count, 3);
        assert_eq!(meta.version, 3);
        assert_eq!(meta.etag.as_deref(), Some("etag-1"));
        assert!(store.is_city_downloaded("rome").unwrap());

        assert_eq!(store.delete_city_data("rome").unwrap(), 3);
        assert!(store.get_landmarks(Some("rome")).unwrap().is_empty());
        assert!(store.get_city_metadata("rome").unwrap().is_none());
        assert!(store.get_city("rome").unwrap().is_none());
        assert!(store.get_landmarks_by_category(LandmarkCategory::Restaurant).unwrap().is_empty());
    }

    #[test]
    fn test_delete_leaves_other_cities() {
        let (_dir, store) = temp_store();
        store.save_offline_package(&city("rome"), &[landmark("a", "rome", LandmarkCategory::Landmark)], 1, None).unwrap();
        store.save_offline_package(&city("naples"), &[landmark("b", "naples", LandmarkCategory::Landmark)], 1, None).unwrap();

        store.delete_city_data("rome").unwrap();

        assert_eq!(store.get_landmarks(None).unwrap().len(), 1);
        assert_eq!(store.get_landmarks(Some("naples")).unwrap()[0].id, "b");
        assert_eq!(store.get_all_cities_metadata().unwrap().len(), 1);
    }

    #[test]
    fn test_reindex_on_category_change() {
        let (_dir, store) = temp_store();
        let rome = city("rome");
        store.save_offline_package(&rome, &[landmark("x", "rome", LandmarkCategory::Activity)], 1, None).unwrap();
        store.save_offline_package(&rome, &[landmark("x", "rome", LandmarkCategory::GiftShop)], 2, None).unwrap();

        assert!(store.get_landmarks_by_category(LandmarkCategory::Activity).unwrap().is_empty());
        assert_eq!(store.get_landmarks_by_category(LandmarkCategory::GiftShop).unwrap().len(), 1);
        assert_eq!(store.get_landmarks(Some("rome")).unwrap().len(), 1);
        assert_eq!(store.get_city_metadata("rome").unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_visit_outbox() {
        let (_dir, store) = temp_store();
        let first = store.queue_visited_landmark("colosseum", Some("session_1")).unwrap();
        let second = store.queue_visited_landmark("pantheon", None).unwrap();
        assert_eq!(second, first + 1);

        let pending = store.get_unsynced_visits().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|v| v.landmark_id == "colosseum" && !v.synced));

        assert!(store.mark_visit_synced(first).unwrap());
        let pending = store.get_unsynced_visits().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        assert!(!store.mark_visit_synced(999).unwrap());

        assert_eq!(store.clear_synced_visits().unwrap(), 1);
        assert_eq!(store.get_all_visits().unwrap().len(), 1);

        // Ids keep increasing after a flush
        let third = store.queue_visited_landmark("trevi", None).unwrap();
        assert_eq!(third, second + 1);
    }

    #[test]
    fn test_visit_ids_not_reused_after_full_flush() {
        let (dir, store) = temp_store();
        let a = store.queue_visited_landmark("colosseum", None).unwrap();
        let b = store.queue_visited_landmark("pantheon", None).unwrap();
        assert!(store.mark_visit_synced(a).unwrap());
        assert!(store.mark_visit_synced(b).unwrap());
        assert_eq!(store.clear_synced_visits().unwrap(), 2);
        assert!(store.get_all_visits().unwrap().is_empty());

        let c = store.queue_visited_landmark("trevi", None).unwrap();
        assert_eq!(c, b + 1);
        // A stale id from before the flush matches nothing
        assert!(!store.mark_visit_synced(a).unwrap());
        assert_eq!(store.get_unsynced_visits().unwrap()[0].id, c);

        store.clear_all().unwrap();
        let d = store.queue_visited_landmark("forum", None).unwrap();
        assert_eq!(d, c + 1);

        // The counter is persisted with the database
        let path = store.path().to_path_buf();
        drop(store);
        let reopened = OfflineStore::open(Some(&path)).unwrap();
        assert_eq!(reopened.queue_visited_landmark("circus", None).unwrap(), d + 1);
        drop(dir);
    }

    #[test]
    fn test_audio_cache() {
        let (_dir, store) = temp_store();
        let audio = CachedAudio {
            landmark_id: "colosseum".into(),
            language: "en".into(),
            audio: vec![0xFF, 0xFB, 0x90, 0x00],
            duration: 12.5,
            size_bytes: 4,
            checksum: "abc".into(),
            voice_id: Some("clara".into()),
            cached_at: 0,
        };
        store.save_audio(&audio).unwrap();
        store.save_audio(&CachedAudio { language: "ko".into(), ..audio.clone() }).unwrap();

        assert!(store.has_audio("colosseum", "en").unwrap());
        assert_eq!(store.get_audio("colosseum", "en").unwrap(), Some(audio));
        assert_eq!(store.audio_stats().unwrap().count, 2);

        assert_eq!(store.delete_audio_for_language("ko").unwrap(), 1);
        assert!(store.delete_audio("colosseum", "en").unwrap());
        assert!(!store.has_audio("colosseum", "en").unwrap());
    }

    #[test]
    fn test_clear_all_keeps_settings() {
        let (_dir, store) = temp_store();
        store.save_offline_package(&city("rome"), &[landmark("a", "rome", LandmarkCategory::Landmark)], 1, None).unwrap();
        store.queue_visited_landmark("a", None).unwrap();
        store.set_setting("speech_rate", "1.2").unwrap();

        store.clear_all().unwrap();

        let stats = store.storage_stats().unwrap();
        assert_eq!(stats.total_records(), 0);
        assert_eq!(stats.unsynced_visits, 0);
        assert_eq!(store.get_setting("speech_rate").unwrap().as_deref(), Some("1.2"));
    }

    #[tokio::test]
    async fn test_store_handle_opens_once() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Arc::new(StoreHandle::new(Some(dir.path().join("lazy.redb"))));
        assert!(!handle.is_open());

        let (a, b) = tokio::join!(handle.get(), handle.get());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(handle.is_open());
    }
}
