//! Typed intake of file records from the external media-library services.
//!
//! The HTTP clients live outside the core; whatever fetches from Sonarr
//! or Radarr hands the core a stream of `FileRecord`s parsed at that
//! boundary. Ingestion seeds the store with `needs_analysis` rows.

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::pipeline::Dispatcher;
use crate::rules;
use crate::store::{ServiceType, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One file as reported by a media-library service. Field names follow
/// the services' JSON payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: i64,
    #[serde(default)]
    pub date_added: Option<String>,
    #[serde(default)]
    pub overall_bitrate: Option<i64>,
    #[serde(default)]
    pub run_time: Option<f64>,
    #[serde(default)]
    pub scene_name: Option<String>,
    #[serde(default)]
    pub content_year: Option<i64>,
}

impl FileRecord {
    /// Year hint for the grain rule: the service's own metadata first,
    /// then whatever the scene name or path reveals.
    pub fn year_hint(&self) -> Option<i64> {
        self.content_year
            .or_else(|| self.scene_name.as_deref().and_then(rules::extract_year))
            .or_else(|| rules::extract_year(&self.path))
    }
}

/// Insert or refresh a batch of synced records. Emits sync progress and
/// wakes the analyzer when new work landed.
pub async fn ingest(
    store: &Store,
    bus: &EventBus,
    analyzer: &Dispatcher,
    service_type: ServiceType,
    records: &[FileRecord],
) -> Result<usize> {
    bus.emit(Event::SyncStarted { service_type });
    info!("Syncing {} records from {}", records.len(), service_type);

    let index = store.library_index().await?;
    let total = records.len().max(1);
    let mut ingested = 0usize;

    for (i, record) in records.iter().enumerate() {
        let library_id = index.match_path(&record.path);
        let video = store
            .upsert_video(
                &record.path,
                record.size,
                service_type,
                &record.id.to_string(),
                library_id,
            )
            .await?;

        if video.content_year.is_none() {
            if let Some(year) = record.year_hint() {
                store.set_content_year(video.id, year).await?;
            }
        }

        debug!("Synced {} as video {}", record.path, video.id);
        bus.emit(Event::VideoUpserted { id: video.id });
        ingested += 1;

        let progress = (((i + 1) * 100) / total) as u8;
        bus.emit(Event::SyncProgress {
            service_type,
            progress,
        });
    }

    bus.emit(Event::SyncCompleted { service_type });
    if ingested > 0 {
        analyzer.dispatch_available();
    }
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VideoState;

    #[test]
    fn service_payloads_deserialize() {
        let json = r#"{
            "id": 318,
            "path": "/tv/Show/Season 02/e4.mkv",
            "size": 4812396544,
            "dateAdded": "2024-11-02T04:11:00Z",
            "overallBitrate": 12400000,
            "sceneName": "Show.S02E04.2160p.WEB-DL"
        }"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 318);
        assert_eq!(record.size, 4_812_396_544);
        assert_eq!(record.overall_bitrate, Some(12_400_000));
        assert_eq!(record.year_hint(), None);
    }

    #[test]
    fn year_hint_prefers_service_metadata() {
        let record = FileRecord {
            id: 1,
            path: "/movies/Old.1965.mkv".into(),
            size: 1,
            date_added: None,
            overall_bitrate: None,
            run_time: None,
            scene_name: None,
            content_year: Some(1972),
        };
        assert_eq!(record.year_hint(), Some(1972));
    }

    #[tokio::test]
    async fn ingest_seeds_needs_analysis_rows() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(32);
        let analyzer = Dispatcher::new();
        store.insert_library("/tv").await.unwrap();

        let records = vec![FileRecord {
            id: 9,
            path: "/tv/Show/Season 01/e1.mkv".into(),
            size: 1_000,
            date_added: None,
            overall_bitrate: None,
            run_time: None,
            scene_name: Some("Show.2007.S01E01".into()),
            content_year: None,
        }];

        let count = ingest(&store, &bus, &analyzer, ServiceType::Sonarr, &records)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let video = store
            .video_by_path("/tv/Show/Season 01/e1.mkv")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(video.state, VideoState::NeedsAnalysis);
        assert_eq!(video.bitrate, 0);
        assert!(video.library_id.is_some());
        assert_eq!(video.content_year, Some(2007));
    }
}
