//! ============================================================================
//! Trip Export - Password-protected archives of offline data
//! ============================================================================
//! Archives are JSON, encrypted with AES-256-GCM under a key derived from the
//! password with PBKDF2-HMAC-SHA256, and base64 encoded as
//! `salt(16) || iv(12) || ciphertext`.
//! ============================================================================

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

use crate::db::{CityMetadata, OfflineStore, VisitedQueueEntry};
use crate::error::DecryptionError;
use crate::types::{City, Landmark};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Archive layout version
pub const ARCHIVE_VERSION: u32 = 1;

/// One city with everything needed to guide it offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPackage {
    pub city: City,
    pub landmarks: Vec<Landmark>,
    pub metadata: Option<CityMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripArchive {
    pub version: u32,
    pub exported_at: String,
    pub packages: Vec<TripPackage>,
    pub visits: Vec<VisitedQueueEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub cities: usize,
    pub landmarks: usize,
    pub visits: usize,
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Serialize `data` to JSON and encrypt it under `password`
pub fn encrypt_data<T: Serialize>(data: &T, password: &str) -> Result<String> {
    let plaintext =
        serde_json::to_vec(data).map_err(|e| anyhow!("Failed to serialize archive: {}", e))?;

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow!("Failed to initialize cipher: {}", e))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

/// Reverse of `encrypt_data`. Any failure reads as `DecryptionError`.
pub fn decrypt_data<T: DeserializeOwned>(encoded: &str, password: &str) -> Result<T, DecryptionError> {
    let raw = STANDARD.decode(encoded.trim()).map_err(|_| DecryptionError)?;
    if raw.len() < SALT_LEN + IV_LEN {
        return Err(DecryptionError);
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| DecryptionError)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| DecryptionError)?;

    serde_json::from_slice(&plaintext).map_err(|_| DecryptionError)
}

/// Snapshot every stored city package and visit
pub fn build_archive(store: &OfflineStore) -> Result<TripArchive> {
    let mut packages = Vec::new();
    for city in store.get_all_cities()? {
        let landmarks = store.get_landmarks(Some(&city.id))?;
        let metadata = store.get_city_metadata(&city.id)?;
        packages.push(TripPackage {
            city,
            landmarks,
            metadata,
        });
    }

    Ok(TripArchive {
        version: ARCHIVE_VERSION,
        exported_at: chrono::Utc::now().to_rfc3339(),
        packages,
        visits: store.get_all_visits()?,
    })
}

pub fn export_trip(store: &OfflineStore, password: &str) -> Result<String> {
    let archive = build_archive(store)?;
    let encoded = encrypt_data(&archive, password)?;
    info!(
        "Exported {} cities and {} visits",
        archive.packages.len(),
        archive.visits.len()
    );
    Ok(encoded)
}

/// Decrypt an archive and save each package. Unsynced visits are queued again.
pub fn import_trip(store: &OfflineStore, encoded: &str, password: &str) -> Result<ImportSummary> {
    let archive: TripArchive = decrypt_data(encoded, password)?;
    if archive.version > ARCHIVE_VERSION {
        return Err(anyhow!("Unsupported archive version {}", archive.version));
    }

    let mut summary = ImportSummary::default();
    for package in &archive.packages {
        let (version, etag) = package
            .metadata
            .as_ref()
            .map(|m| (m.version, m.etag.as_deref()))
            .unwrap_or((1, None));
        store.save_offline_package(&package.city, &package.landmarks, version, etag)?;
        summary.cities += 1;
        summary.landmarks += package.landmarks.len();
    }

    for visit in archive.visits.iter().filter(|v| !v.synced) {
        store.queue_visited_landmark(&visit.landmark_id, visit.session_id.as_deref())?;
        summary.visits += 1;
    }

    info!(
        "Imported {} cities, {} landmarks, {} visits",
        summary.cities, summary.landmarks, summary.visits
    );
    Ok(summary)
}
