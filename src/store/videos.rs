use super::Store;
use crate::error::{ReforgeError, Result};
use crate::state::VideoState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Which external media-library service owns a file.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServiceType {
    Sonarr,
    Radarr,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Sonarr => write!(f, "sonarr"),
            ServiceType::Radarr => write!(f, "radarr"),
        }
    }
}

/// The central aggregate: one media file tracked across its re-encode
/// lifecycle. Rows are created by sync with `bitrate = 0`; the analyzer
/// populates the media attributes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<f64>,
    pub bitrate: i64,
    #[sqlx(json)]
    pub video_codecs: Vec<String>,
    #[sqlx(json)]
    pub audio_codecs: Vec<String>,
    pub max_audio_channels: Option<i64>,
    pub atmos: bool,
    pub hdr: Option<String>,
    pub content_year: Option<i64>,
    pub state: VideoState,
    pub library_id: Option<i64>,
    pub service_type: ServiceType,
    pub service_id: String,
    pub chosen_vmaf_id: Option<i64>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn filename(&self) -> String {
        std::path::Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }

    /// All attributes the analyzer must have populated before the video
    /// may leave `needs_analysis`.
    pub fn has_complete_media_info(&self) -> bool {
        self.bitrate > 0
            && self.duration.is_some()
            && self.width.is_some()
            && self.height.is_some()
            && self.frame_rate.is_some()
    }

    /// Audio metadata good enough to build encode arguments from. Atmos
    /// tracks report no channel count, so Atmos alone passes.
    pub fn has_valid_audio_metadata(&self) -> bool {
        self.atmos
            || (self.max_audio_channels.unwrap_or(0) > 0 && !self.audio_codecs.is_empty())
    }
}

/// Attribute set written back after a mediainfo run.
#[derive(Debug, Clone, Default)]
pub struct MediaAttributes {
    pub size: i64,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<f64>,
    pub bitrate: i64,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub max_audio_channels: Option<i64>,
    pub atmos: bool,
    pub hdr: Option<String>,
    pub content_year: Option<i64>,
}

impl Store {
    /// Insert a freshly synced file, or refresh size/service fields when
    /// the path is already known. New rows start in `needs_analysis`.
    pub async fn upsert_video(
        &self,
        path: &str,
        size: i64,
        service_type: ServiceType,
        service_id: &str,
        library_id: Option<i64>,
    ) -> Result<Video> {
        sqlx::query(
            "INSERT INTO videos (path, size, service_type, service_id, library_id, state)
             VALUES (?, ?, ?, ?, ?, 'needs_analysis')
             ON CONFLICT(path) DO UPDATE SET
               size = excluded.size,
               service_type = excluded.service_type,
               service_id = excluded.service_id,
               library_id = COALESCE(excluded.library_id, videos.library_id),
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(path)
        .bind(size)
        .bind(service_type)
        .bind(service_id)
        .bind(library_id)
        .execute(&self.pool)
        .await?;

        self.video_by_path(path)
            .await?
            .ok_or_else(|| ReforgeError::Unknown(format!("upserted video vanished: {}", path)))
    }

    pub async fn video(&self, id: i64) -> Result<Option<Video>> {
        let video = sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(video)
    }

    pub async fn video_by_path(&self, path: &str) -> Result<Option<Video>> {
        let video = sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(video)
    }

    /// Write the analyzer's findings back onto the row.
    pub async fn update_media_attributes(
        &self,
        id: i64,
        attrs: &MediaAttributes,
    ) -> Result<Video> {
        let result = sqlx::query(
            "UPDATE videos SET
               size = ?, duration = ?, width = ?, height = ?, frame_rate = ?,
               bitrate = ?, video_codecs = ?, audio_codecs = ?,
               max_audio_channels = ?, atmos = ?, hdr = ?, content_year = ?,
               updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(attrs.size)
        .bind(attrs.duration)
        .bind(attrs.width)
        .bind(attrs.height)
        .bind(attrs.frame_rate)
        .bind(attrs.bitrate)
        .bind(Json(&attrs.video_codecs))
        .bind(Json(&attrs.audio_codecs))
        .bind(attrs.max_audio_channels)
        .bind(attrs.atmos)
        .bind(attrs.hdr.as_deref())
        .bind(attrs.content_year)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReforgeError::VideoNotFound(id));
        }
        self.video(id)
            .await?
            .ok_or(ReforgeError::VideoNotFound(id))
    }

    pub async fn update_video_state(&self, id: i64, state: VideoState) -> Result<Video> {
        let result =
            sqlx::query("UPDATE videos SET state = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
                .bind(state)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(ReforgeError::VideoNotFound(id));
        }
        self.video(id)
            .await?
            .ok_or(ReforgeError::VideoNotFound(id))
    }

    /// Analyzer feed: oldest unanalyzed videos first.
    pub async fn next_needs_analysis(&self, limit: i64) -> Result<Vec<Video>> {
        let videos = sqlx::query_as::<_, Video>(
            "SELECT * FROM videos WHERE state = 'needs_analysis'
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(videos)
    }

    /// CRF-searcher feed: oldest analyzed videos first.
    pub async fn next_analyzed(&self, limit: i64) -> Result<Vec<Video>> {
        let videos = sqlx::query_as::<_, Video>(
            "SELECT * FROM videos WHERE state = 'analyzed'
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(videos)
    }

    pub async fn set_content_year(&self, id: i64, year: i64) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET content_year = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(year)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_video_library(&self, id: i64, library_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET library_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(library_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_in_state(&self, state: VideoState) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM videos WHERE state = ?")
                .bind(state)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_refreshes() {
        let store = Store::in_memory().await.unwrap();
        let v = store
            .upsert_video("/tv/Show/S01/e1.mkv", 1_000, ServiceType::Sonarr, "77", None)
            .await
            .unwrap();
        assert_eq!(v.state, VideoState::NeedsAnalysis);
        assert_eq!(v.bitrate, 0);

        let again = store
            .upsert_video("/tv/Show/S01/e1.mkv", 2_000, ServiceType::Sonarr, "77", None)
            .await
            .unwrap();
        assert_eq!(again.id, v.id);
        assert_eq!(again.size, 2_000);
    }

    #[tokio::test]
    async fn media_attributes_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let v = store
            .upsert_video("/movies/a.mkv", 10, ServiceType::Radarr, "5", None)
            .await
            .unwrap();

        let attrs = MediaAttributes {
            size: 4_000_000_000,
            duration: Some(5400.0),
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(23.976),
            bitrate: 6_000_000,
            video_codecs: vec!["HEVC".into()],
            audio_codecs: vec!["AC-3".into()],
            max_audio_channels: Some(6),
            atmos: false,
            hdr: Some("HDR10".into()),
            content_year: Some(2004),
        };
        let updated = store.update_media_attributes(v.id, &attrs).await.unwrap();
        assert!(updated.has_complete_media_info());
        assert_eq!(updated.video_codecs, vec!["HEVC".to_string()]);
        assert_eq!(updated.hdr.as_deref(), Some("HDR10"));
    }

    #[tokio::test]
    async fn feed_queries_filter_by_state() {
        let store = Store::in_memory().await.unwrap();
        let a = store
            .upsert_video("/tv/a.mkv", 1, ServiceType::Sonarr, "1", None)
            .await
            .unwrap();
        store
            .upsert_video("/tv/b.mkv", 1, ServiceType::Sonarr, "2", None)
            .await
            .unwrap();
        store
            .update_video_state(a.id, VideoState::Analyzed)
            .await
            .unwrap();

        let pending = store.next_needs_analysis(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "/tv/b.mkv");

        let analyzed = store.next_analyzed(10).await.unwrap();
        assert_eq!(analyzed.len(), 1);
        assert_eq!(analyzed[0].id, a.id);
    }

    #[test]
    fn audio_metadata_validity() {
        let mut video = Video {
            id: 1,
            path: "/x.mkv".into(),
            size: 0,
            duration: None,
            width: None,
            height: None,
            frame_rate: None,
            bitrate: 0,
            video_codecs: vec![],
            audio_codecs: vec![],
            max_audio_channels: None,
            atmos: false,
            hdr: None,
            content_year: None,
            state: VideoState::NeedsAnalysis,
            library_id: None,
            service_type: ServiceType::Radarr,
            service_id: "1".into(),
            chosen_vmaf_id: None,
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!video.has_valid_audio_metadata());

        video.atmos = true;
        assert!(video.has_valid_audio_metadata());

        video.atmos = false;
        video.audio_codecs = vec!["E-AC-3".into()];
        video.max_audio_channels = Some(6);
        assert!(video.has_valid_audio_metadata());
    }
}
