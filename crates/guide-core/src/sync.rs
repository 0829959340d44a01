//! Flushes the visited outbox to the server.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::NarrationApi;
use crate::db::OfflineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    /// Entries the server answered with a non-2xx status; they stay queued
    pub rejected: usize,
    /// Entries not attempted because the network went away
    pub remaining: usize,
    pub cleared: usize,
}

/// POST every unsynced visit. Accepted entries are marked synced, rejected
/// ones stay queued, and the first network failure stops the run. Synced
/// entries are purged at the end.
pub async fn sync_visits(store: &OfflineStore, api: &dyn NarrationApi) -> Result<SyncReport> {
    let pending = store.get_unsynced_visits()?;
    let mut report = SyncReport::default();

    for (i, visit) in pending.iter().enumerate() {
        match api
            .post_visited(&visit.landmark_id, visit.session_id.as_deref())
            .await
        {
            Ok(true) => {
                store.mark_visit_synced(visit.id)?;
                report.synced += 1;
            }
            Ok(false) => {
                debug!("Server rejected visit {}", visit.id);
                report.rejected += 1;
            }
            Err(e) => {
                warn!("Visit sync interrupted at {}: {}", visit.id, e);
                report.remaining = pending.len() - i;
                break;
            }
        }
    }

    report.cleared = store.clear_synced_visits()?;
    info!(
        "Visit sync: {} synced, {} rejected, {} remaining",
        report.synced, report.rejected, report.remaining
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AudioGenerateRequest, ClovaRequest, GeneratedAudio};
    use crate::types::{City, Landmark};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts everything except "rejected"; goes offline at "offline"
    #[derive(Default)]
    struct Server {
        received: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NarrationApi for Server {
        async fn synthesize_clova(&self, _request: &ClovaRequest) -> Result<Vec<u8>> {
            Err(anyhow!("unused"))
        }

        async fn generate_audio(&self, _request: &AudioGenerateRequest) -> Result<GeneratedAudio> {
            Err(anyhow!("unused"))
        }

        async fn fetch_audio(&self, _url: &str) -> Result<Vec<u8>> {
            Err(anyhow!("unused"))
        }

        async fn fetch_city(&self, _city_id: &str) -> Result<City> {
            Err(anyhow!("unused"))
        }

        async fn fetch_landmarks(&self, _city_id: &str) -> Result<Vec<Landmark>> {
            Err(anyhow!("unused"))
        }

        async fn post_visited(&self, landmark_id: &str, _session_id: Option<&str>) -> Result<bool> {
            match landmark_id {
                "offline" => Err(anyhow!("connection refused")),
                "rejected" => Ok(false),
                _ => {
                    self.received.lock().unwrap().push(landmark_id.to_string());
                    Ok(true)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_sync_marks_and_stops_at_network_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(Some(&dir.path().join("sync.redb"))).unwrap();
        for id in ["a", "rejected", "b", "offline", "c"] {
            store.queue_visited_landmark(id, Some("session_x")).unwrap();
        }

        let server = Server::default();
        let report = sync_visits(&store, &server).await.unwrap();

        assert_eq!(report.synced, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.cleared, 2);
        assert_eq!(*server.received.lock().unwrap(), vec!["a", "b"]);

        let left: Vec<_> = store
            .get_unsynced_visits()
            .unwrap()
            .into_iter()
            .map(|v| v.landmark_id)
            .collect();
        assert_eq!(left, vec!["rejected", "offline", "c"]);
        assert_eq!(store.get_all_visits().unwrap().len(), 3);
    }
}
