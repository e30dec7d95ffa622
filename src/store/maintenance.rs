//! Operator-facing bulk operations. These act on the store directly,
//! outside the per-video state machine.

use super::videos::Video;
use super::Store;
use crate::error::Result;
use crate::rules::{self, ArgContext};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const MISSING_PAGE_SIZE: i64 = 500;
const MISSING_CHECK_CONCURRENCY: usize = 20;
const MISSING_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

impl Store {
    /// Revive every failed video: back to `needs_analysis`, samples and
    /// unresolved failure records dropped. Idempotent.
    pub async fn reset_all_failed(&self) -> Result<u64> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM vmafs WHERE video_id IN (SELECT id FROM videos WHERE state = 'failed')",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM video_failures WHERE resolved = 0
             AND video_id IN (SELECT id FROM videos WHERE state = 'failed')",
        )
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "UPDATE videos SET state = 'needs_analysis', chosen_vmaf_id = NULL,
                               updated_at = CURRENT_TIMESTAMP
             WHERE state = 'failed'",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Reset {} failed videos", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Drop samples and media attributes so the analyzer starts over.
    pub async fn reset_for_reanalysis(&self, video_id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM vmafs WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE videos SET
               duration = NULL, width = NULL, height = NULL, frame_rate = NULL,
               bitrate = 0, video_codecs = '[]', audio_codecs = '[]',
               max_audio_channels = NULL, atmos = 0, hdr = NULL,
               chosen_vmaf_id = NULL, state = 'needs_analysis',
               updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset videos whose stored parameters would produce broken audio
    /// arguments (`--enc b:a=0k` or `--enc ac=0`).
    pub async fn reset_invalid_audio(&self) -> Result<u64> {
        let videos = self.active_videos().await?;
        let mut reset = 0u64;

        for video in videos {
            let overrides = match video.chosen_vmaf_id {
                Some(vmaf_id) => self
                    .vmaf(vmaf_id)
                    .await?
                    .map(|v| v.params)
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let args = rules::build_args(&video, ArgContext::Encode, &overrides, &[]);
            if has_zeroed_audio_args(&args) {
                warn!("Video {} carries zeroed audio args, resetting", video.id);
                self.reset_for_reanalysis(video.id).await?;
                reset += 1;
            }
        }

        info!("Reset {} videos with invalid audio arguments", reset);
        Ok(reset)
    }

    /// Reset videos whose analysis produced unusable audio metadata:
    /// empty codec list or zero channels, without Atmos to excuse it.
    pub async fn reset_invalid_audio_metadata(&self) -> Result<u64> {
        let videos = self.active_videos().await?;
        let mut reset = 0u64;

        for video in videos {
            if !video.has_valid_audio_metadata() && video.bitrate > 0 {
                warn!("Video {} has invalid audio metadata, resetting", video.id);
                self.reset_for_reanalysis(video.id).await?;
                reset += 1;
            }
        }

        info!("Reset {} videos with invalid audio metadata", reset);
        Ok(reset)
    }

    /// Delete rows whose file no longer exists on disk. Existence checks
    /// run in id-ordered pages with bounded concurrency; a check that
    /// times out counts as present.
    pub async fn delete_missing_paths(&self) -> Result<u64> {
        let mut deleted = 0u64;
        let mut last_id = 0i64;

        loop {
            let page: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, path FROM videos WHERE id > ? ORDER BY id ASC LIMIT ?",
            )
            .bind(last_id)
            .bind(MISSING_PAGE_SIZE)
            .fetch_all(self.pool())
            .await?;

            if page.is_empty() {
                break;
            }
            last_id = page.last().map(|(id, _)| *id).unwrap_or(last_id);

            let missing: Vec<i64> = stream::iter(page)
                .map(|(id, path)| async move {
                    let exists = tokio::time::timeout(
                        MISSING_CHECK_TIMEOUT,
                        tokio::fs::try_exists(Path::new(&path)),
                    )
                    .await;
                    match exists {
                        Ok(Ok(false)) => Some(id),
                        // Errors and timeouts keep the row.
                        _ => None,
                    }
                })
                .buffer_unordered(MISSING_CHECK_CONCURRENCY)
                .filter_map(|id| async move { id })
                .collect()
                .await;

            for id in missing {
                self.delete_video(id).await?;
                deleted += 1;
            }
        }

        info!("Deleted {} videos with missing paths", deleted);
        Ok(deleted)
    }

    pub async fn delete_video(&self, id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM vmafs WHERE video_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM video_failures WHERE video_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM videos WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn active_videos(&self) -> Result<Vec<Video>> {
        let videos = sqlx::query_as::<_, Video>(
            "SELECT * FROM videos WHERE state NOT IN ('encoded', 'failed') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(videos)
    }
}

fn has_zeroed_audio_args(args: &[String]) -> bool {
    args.windows(2).any(|pair| {
        pair[0] == "--enc" && (pair[1] == "b:a=0k" || pair[1] == "ac=0")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VideoState;
    use crate::store::{NewFailure, NewVmaf, ServiceType};

    #[tokio::test]
    async fn reset_all_failed_revives_and_cleans() {
        let store = Store::in_memory().await.unwrap();
        let video = store
            .upsert_video("/tv/a.mkv", 1, ServiceType::Sonarr, "1", None)
            .await
            .unwrap();
        store
            .upsert_vmaf(
                video.id,
                &NewVmaf {
                    crf: 24.0,
                    score: 95.0,
                    percent: 50.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .record_failure(&NewFailure {
                video_id: video.id,
                stage: crate::store::FailureStage::Encoding,
                category: crate::store::FailureCategory::ProcessFailure,
                code: "EXIT_1".into(),
                message: "encode failed".into(),
                system_context: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let count = store.reset_all_failed().await.unwrap();
        assert_eq!(count, 1);

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::NeedsAnalysis);
        assert!(store.vmafs_for_video(video.id).await.unwrap().is_empty());
        assert!(store.failures_for_video(video.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_audio_metadata_resets_analysis() {
        let store = Store::in_memory().await.unwrap();
        let video = store
            .upsert_video("/tv/a.mkv", 1, ServiceType::Sonarr, "1", None)
            .await
            .unwrap();
        // Analyzed, but with no audio codecs and no channel count.
        let attrs = crate::store::MediaAttributes {
            size: 100,
            duration: Some(10.0),
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(24.0),
            bitrate: 5_000,
            ..Default::default()
        };
        store.update_media_attributes(video.id, &attrs).await.unwrap();
        store
            .update_video_state(video.id, VideoState::Analyzed)
            .await
            .unwrap();

        let count = store.reset_invalid_audio_metadata().await.unwrap();
        assert_eq!(count, 1);

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::NeedsAnalysis);
        assert_eq!(video.bitrate, 0);
    }

    #[tokio::test]
    async fn delete_missing_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept_path = dir.path().join("kept.mkv");
        std::fs::write(&kept_path, b"x").unwrap();

        let store = Store::in_memory().await.unwrap();
        store
            .upsert_video(
                kept_path.to_str().unwrap(),
                1,
                ServiceType::Radarr,
                "1",
                None,
            )
            .await
            .unwrap();
        store
            .upsert_video("/definitely/not/here.mkv", 1, ServiceType::Radarr, "2", None)
            .await
            .unwrap();

        let deleted = store.delete_missing_paths().await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.next_needs_analysis(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, kept_path.to_str().unwrap());
    }

    #[test]
    fn zeroed_audio_detection() {
        let broken = vec!["--enc".to_string(), "b:a=0k".to_string()];
        assert!(has_zeroed_audio_args(&broken));
        let ok = vec!["--enc".to_string(), "b:a=128k".to_string()];
        assert!(!has_zeroed_audio_args(&ok));
    }
}
