use super::videos::Video;
use super::Store;
use crate::error::{ReforgeError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::path::Path;
use std::sync::OnceLock;

/// One CRF/VMAF sample produced by a crf-search run.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vmaf {
    pub id: i64,
    pub video_id: i64,
    pub crf: f64,
    pub score: f64,
    /// Predicted output size as percent of the input.
    pub percent: f64,
    /// Predicted output size in bytes, when the search reported one.
    pub size: Option<i64>,
    /// Predicted encode time in seconds, when the search reported one.
    pub time: Option<i64>,
    /// Bytes saved relative to the input, derived from `percent`.
    pub savings: Option<i64>,
    pub chosen: bool,
    #[sqlx(json)]
    pub params: Vec<String>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a sample; one row per `(video_id, crf)`.
#[derive(Debug, Clone, Default)]
pub struct NewVmaf {
    pub crf: f64,
    pub score: f64,
    pub percent: f64,
    pub size: Option<i64>,
    pub time: Option<i64>,
    pub savings: Option<i64>,
    pub params: Vec<String>,
}

/// A chosen sample joined with its video, ready for the encoder queue.
#[derive(Debug, Clone)]
pub struct EncodeCandidate {
    pub video: Video,
    pub vmaf: Vmaf,
}

fn season_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[S](eason\s*)?0*\d+$").unwrap())
}

impl Store {
    /// Upsert a sample on `(video_id, crf)` and return the stored row.
    pub async fn upsert_vmaf(&self, video_id: i64, sample: &NewVmaf) -> Result<Vmaf> {
        sqlx::query(
            "INSERT INTO vmafs (video_id, crf, score, percent, size, time, savings, params)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(video_id, crf) DO UPDATE SET
               score = excluded.score,
               percent = excluded.percent,
               size = excluded.size,
               time = excluded.time,
               savings = excluded.savings,
               params = excluded.params,
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(video_id)
        .bind(sample.crf)
        .bind(sample.score)
        .bind(sample.percent)
        .bind(sample.size)
        .bind(sample.time)
        .bind(sample.savings)
        .bind(Json(&sample.params))
        .execute(&self.pool)
        .await?;

        let vmaf = sqlx::query_as::<_, Vmaf>(
            "SELECT * FROM vmafs WHERE video_id = ? AND crf = ?",
        )
        .bind(video_id)
        .bind(sample.crf)
        .fetch_one(&self.pool)
        .await?;
        Ok(vmaf)
    }

    /// Elect one sample for its video: clears any prior election, marks the
    /// sample and points `videos.chosen_vmaf_id` at it, all in one
    /// transaction.
    pub async fn choose_vmaf(&self, video_id: i64, vmaf_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE vmafs SET chosen = 0, updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ? AND chosen = 1",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

        let marked = sqlx::query(
            "UPDATE vmafs SET chosen = 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND video_id = ?",
        )
        .bind(vmaf_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() == 0 {
            return Err(ReforgeError::Unknown(format!(
                "vmaf {} does not belong to video {}",
                vmaf_id, video_id
            )));
        }

        sqlx::query(
            "UPDATE videos SET chosen_vmaf_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(vmaf_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn vmaf(&self, id: i64) -> Result<Option<Vmaf>> {
        let vmaf = sqlx::query_as::<_, Vmaf>("SELECT * FROM vmafs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(vmaf)
    }

    pub async fn vmafs_for_video(&self, video_id: i64) -> Result<Vec<Vmaf>> {
        let vmafs =
            sqlx::query_as::<_, Vmaf>("SELECT * FROM vmafs WHERE video_id = ? ORDER BY crf ASC")
                .bind(video_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(vmafs)
    }

    /// `(crf, score)` pairs from the video's own prior samples.
    pub async fn own_samples(&self, video_id: i64) -> Result<Vec<(f64, f64)>> {
        let rows: Vec<(f64, f64)> =
            sqlx::query_as("SELECT crf, score FROM vmafs WHERE video_id = ?")
                .bind(video_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Chosen `(crf, score)` pairs from episodes in the same season folder
    /// with matching resolution and HDR presence. The video itself is
    /// excluded. Returns empty when the file does not live in a season
    /// folder.
    pub async fn sibling_samples(&self, video: &Video) -> Result<Vec<(f64, f64)>> {
        let (Some(width), Some(height)) = (video.width, video.height) else {
            return Ok(Vec::new());
        };
        let path = Path::new(&video.path);
        let Some(parent) = path.parent() else {
            return Ok(Vec::new());
        };
        let Some(dir_name) = parent.file_name().map(|n| n.to_string_lossy()) else {
            return Ok(Vec::new());
        };
        if !season_dir_re().is_match(&dir_name) {
            return Ok(Vec::new());
        }

        let prefix = format!("{}/%", parent.to_string_lossy());
        let rows: Vec<(i64, String, f64, f64)> = sqlx::query_as(
            "SELECT vid.id, vid.path, v.crf, v.score
             FROM vmafs v
             JOIN videos vid ON vid.id = v.video_id
             WHERE v.chosen = 1
               AND vid.id != ?
               AND vid.path LIKE ?
               AND vid.width = ?
               AND vid.height = ?
               AND (vid.hdr IS NULL) = ?",
        )
        .bind(video.id)
        .bind(&prefix)
        .bind(width)
        .bind(height)
        .bind(video.hdr.is_none())
        .fetch_all(&self.pool)
        .await?;

        // LIKE matches nested paths too; keep only direct season siblings.
        let samples = rows
            .into_iter()
            .filter(|(_, sibling_path, _, _)| {
                Path::new(sibling_path).parent() == Some(parent)
            })
            .map(|(_, _, crf, score)| (crf, score))
            .collect();
        Ok(samples)
    }

    /// Encoder feed: chosen samples of `crf_searched` videos, biggest
    /// predicted savings first, quickest encodes breaking ties.
    pub async fn encode_candidates(&self, limit: i64) -> Result<Vec<EncodeCandidate>> {
        let vmafs = sqlx::query_as::<_, Vmaf>(
            "SELECT v.* FROM vmafs v
             JOIN videos vid ON vid.id = v.video_id
             WHERE v.chosen = 1 AND vid.state = 'crf_searched'
             ORDER BY v.savings DESC, v.time ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(vmafs.len());
        for vmaf in vmafs {
            if let Some(video) = self.video(vmaf.video_id).await? {
                candidates.push(EncodeCandidate { video, vmaf });
            }
        }
        Ok(candidates)
    }

    pub async fn delete_vmafs_for_video(&self, video_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM vmafs WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE videos SET chosen_vmaf_id = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VideoState;
    use crate::store::ServiceType;

    async fn seed_video(store: &Store, path: &str) -> Video {
        store
            .upsert_video(path, 1_000_000, ServiceType::Sonarr, "1", None)
            .await
            .unwrap()
    }

    fn sample(crf: f64, score: f64) -> NewVmaf {
        NewVmaf {
            crf,
            score,
            percent: 40.0,
            savings: Some(600_000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_is_unique_per_video_and_crf() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, "/tv/a.mkv").await;

        let first = store.upsert_vmaf(video.id, &sample(24.0, 95.2)).await.unwrap();
        let second = store.upsert_vmaf(video.id, &sample(24.0, 96.0)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.score, 96.0);
        assert_eq!(store.vmafs_for_video(video.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn choosing_clears_prior_election() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, "/tv/a.mkv").await;

        let a = store.upsert_vmaf(video.id, &sample(22.0, 96.0)).await.unwrap();
        let b = store.upsert_vmaf(video.id, &sample(26.0, 94.5)).await.unwrap();

        store.choose_vmaf(video.id, a.id).await.unwrap();
        store.choose_vmaf(video.id, b.id).await.unwrap();

        let all = store.vmafs_for_video(video.id).await.unwrap();
        let chosen: Vec<_> = all.iter().filter(|v| v.chosen).collect();
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].id, b.id);

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.chosen_vmaf_id, Some(b.id));
    }

    #[tokio::test]
    async fn sibling_samples_respect_season_folder_and_shape() {
        let store = Store::in_memory().await.unwrap();

        let attrs_1080 = crate::store::MediaAttributes {
            size: 1,
            duration: Some(1.0),
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(24.0),
            bitrate: 1,
            ..Default::default()
        };

        let target = seed_video(&store, "/tv/Show/Season 01/e1.mkv").await;
        store
            .update_media_attributes(target.id, &attrs_1080)
            .await
            .unwrap();
        let target = store.video(target.id).await.unwrap().unwrap();

        // Matching sibling with a chosen sample.
        let sib = seed_video(&store, "/tv/Show/Season 01/e2.mkv").await;
        store.update_media_attributes(sib.id, &attrs_1080).await.unwrap();
        let v = store.upsert_vmaf(sib.id, &sample(25.0, 95.5)).await.unwrap();
        store.choose_vmaf(sib.id, v.id).await.unwrap();

        // Different resolution: excluded.
        let other = seed_video(&store, "/tv/Show/Season 01/e3.mkv").await;
        let attrs_2160 = crate::store::MediaAttributes {
            width: Some(3840),
            height: Some(2160),
            ..attrs_1080.clone()
        };
        store.update_media_attributes(other.id, &attrs_2160).await.unwrap();
        let v = store.upsert_vmaf(other.id, &sample(20.0, 95.0)).await.unwrap();
        store.choose_vmaf(other.id, v.id).await.unwrap();

        let samples = store.sibling_samples(&target).await.unwrap();
        assert_eq!(samples, vec![(25.0, 95.5)]);

        // A movie outside a season folder gets no siblings.
        let movie = seed_video(&store, "/movies/Title (2004)/a.mkv").await;
        store.update_media_attributes(movie.id, &attrs_1080).await.unwrap();
        let movie = store.video(movie.id).await.unwrap().unwrap();
        assert!(store.sibling_samples(&movie).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn encode_candidates_order_by_savings() {
        let store = Store::in_memory().await.unwrap();

        let small = seed_video(&store, "/tv/small.mkv").await;
        let big = seed_video(&store, "/tv/big.mkv").await;
        for video in [&small, &big] {
            store
                .update_video_state(video.id, VideoState::Analyzed)
                .await
                .unwrap();
            store
                .update_video_state(video.id, VideoState::CrfSearching)
                .await
                .unwrap();
            store
                .update_video_state(video.id, VideoState::CrfSearched)
                .await
                .unwrap();
        }

        let v_small = store
            .upsert_vmaf(
                small.id,
                &NewVmaf {
                    crf: 24.0,
                    score: 95.0,
                    percent: 80.0,
                    savings: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let v_big = store
            .upsert_vmaf(
                big.id,
                &NewVmaf {
                    crf: 24.0,
                    score: 95.0,
                    percent: 20.0,
                    savings: Some(900),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.choose_vmaf(small.id, v_small.id).await.unwrap();
        store.choose_vmaf(big.id, v_big.id).await.unwrap();

        let queue = store.encode_candidates(10).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].video.id, big.id);
        assert_eq!(queue[1].video.id, small.id);
    }

    #[test]
    fn season_dir_patterns() {
        for dir in ["Season 01", "season 1", "S01", "s2", "Season01", "Season  3"] {
            assert!(season_dir_re().is_match(dir), "{}", dir);
        }
        for dir in ["Specials", "Extras", "Show Name", "Season"] {
            assert!(!season_dir_re().is_match(dir), "{}", dir);
        }
    }
}
