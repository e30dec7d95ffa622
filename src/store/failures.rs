use super::Store;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::warn;

/// Pipeline stage a failure was observed in.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureStage {
    Analysis,
    CrfSearch,
    Encoding,
    PostProcess,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Analysis => "analysis",
            FailureStage::CrfSearch => "crf_search",
            FailureStage::Encoding => "encoding",
            FailureStage::PostProcess => "post_process",
        };
        write!(f, "{}", s)
    }
}

/// What kind of thing went wrong.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureCategory {
    FileAccess,
    MediainfoParsing,
    Validation,
    VmafCalculation,
    CrfOptimization,
    SizeLimits,
    PresetRetry,
    ProcessFailure,
    ResourceExhaustion,
    Timeout,
    CodecIssues,
    Configuration,
    SystemEnvironment,
    FileOperations,
    SyncIntegration,
    Cleanup,
    Unknown,
}

impl FailureCategory {
    /// Categories that indicate a broken environment rather than a broken
    /// file; a video failing this way stays failed instead of being rolled
    /// back for another attempt.
    pub fn is_systemic(self) -> bool {
        matches!(
            self,
            FailureCategory::Configuration
                | FailureCategory::SizeLimits
                | FailureCategory::SystemEnvironment
                | FailureCategory::ResourceExhaustion
        )
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::FileAccess => "file_access",
            FailureCategory::MediainfoParsing => "mediainfo_parsing",
            FailureCategory::Validation => "validation",
            FailureCategory::VmafCalculation => "vmaf_calculation",
            FailureCategory::CrfOptimization => "crf_optimization",
            FailureCategory::SizeLimits => "size_limits",
            FailureCategory::PresetRetry => "preset_retry",
            FailureCategory::ProcessFailure => "process_failure",
            FailureCategory::ResourceExhaustion => "resource_exhaustion",
            FailureCategory::Timeout => "timeout",
            FailureCategory::CodecIssues => "codec_issues",
            FailureCategory::Configuration => "configuration",
            FailureCategory::SystemEnvironment => "system_environment",
            FailureCategory::FileOperations => "file_operations",
            FailureCategory::SyncIntegration => "sync_integration",
            FailureCategory::Cleanup => "cleanup",
            FailureCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Append-only audit record of one failure.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VideoFailure {
    pub id: i64,
    pub video_id: i64,
    pub stage: FailureStage,
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
    pub retry_count: i64,
    #[sqlx(json)]
    pub system_context: serde_json::Value,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFailure {
    pub video_id: i64,
    pub stage: FailureStage,
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
    pub system_context: serde_json::Value,
}

impl Store {
    /// Record a failure and move the video to `failed` in the same
    /// transaction. The transaction is retried once; a video that no
    /// longer exists still gets its audit row.
    pub async fn record_failure(&self, failure: &NewFailure) -> Result<VideoFailure> {
        match self.record_failure_once(failure).await {
            Ok(row) => Ok(row),
            Err(e) => {
                warn!(
                    "Failure record for video {} failed ({}), retrying once",
                    failure.video_id, e
                );
                self.record_failure_once(failure).await
            }
        }
    }

    async fn record_failure_once(&self, failure: &NewFailure) -> Result<VideoFailure> {
        let mut tx = self.pool.begin().await?;

        let (retry_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM video_failures WHERE video_id = ? AND stage = ?",
        )
        .bind(failure.video_id)
        .bind(failure.stage)
        .fetch_one(&mut *tx)
        .await?;

        let id: (i64,) = sqlx::query_as(
            "INSERT INTO video_failures
               (video_id, stage, category, code, message, retry_count, system_context)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(failure.video_id)
        .bind(failure.stage)
        .bind(failure.category)
        .bind(&failure.code)
        .bind(&failure.message)
        .bind(retry_count)
        .bind(Json(&failure.system_context))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE videos SET state = 'failed', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(failure.video_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let row = sqlx::query_as::<_, VideoFailure>("SELECT * FROM video_failures WHERE id = ?")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn failures_for_video(&self, video_id: i64) -> Result<Vec<VideoFailure>> {
        let failures = sqlx::query_as::<_, VideoFailure>(
            "SELECT * FROM video_failures WHERE video_id = ? ORDER BY inserted_at DESC",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(failures)
    }

    pub async fn unresolved_failure_count(
        &self,
        video_id: i64,
        stage: FailureStage,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM video_failures
             WHERE video_id = ? AND stage = ? AND resolved = 0",
        )
        .bind(video_id)
        .bind(stage)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn resolve_failures_for_video(&self, video_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE video_failures
             SET resolved = 1, resolved_at = CURRENT_TIMESTAMP
             WHERE video_id = ? AND resolved = 0",
        )
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VideoState;
    use crate::store::ServiceType;

    #[tokio::test]
    async fn recording_a_failure_fails_the_video() {
        let store = Store::in_memory().await.unwrap();
        let video = store
            .upsert_video("/tv/a.mkv", 1, ServiceType::Sonarr, "1", None)
            .await
            .unwrap();

        let failure = store
            .record_failure(&NewFailure {
                video_id: video.id,
                stage: FailureStage::Encoding,
                category: FailureCategory::ResourceExhaustion,
                code: "EXIT_137".into(),
                message: "Process killed by system (OOM)".into(),
                system_context: serde_json::json!({"action": "pause"}),
            })
            .await
            .unwrap();

        assert_eq!(failure.retry_count, 0);
        assert_eq!(failure.category, FailureCategory::ResourceExhaustion);

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::Failed);
    }

    #[tokio::test]
    async fn retry_count_tracks_per_stage_history() {
        let store = Store::in_memory().await.unwrap();
        let video = store
            .upsert_video("/tv/a.mkv", 1, ServiceType::Sonarr, "1", None)
            .await
            .unwrap();

        let base = NewFailure {
            video_id: video.id,
            stage: FailureStage::CrfSearch,
            category: FailureCategory::CrfOptimization,
            code: "NO_SAMPLES".into(),
            message: "search produced no samples".into(),
            system_context: serde_json::Value::Null,
        };
        let first = store.record_failure(&base).await.unwrap();
        let second = store.record_failure(&base).await.unwrap();
        assert_eq!(first.retry_count, 0);
        assert_eq!(second.retry_count, 1);

        assert_eq!(
            store
                .unresolved_failure_count(video.id, FailureStage::CrfSearch)
                .await
                .unwrap(),
            2
        );

        store.resolve_failures_for_video(video.id).await.unwrap();
        assert_eq!(
            store
                .unresolved_failure_count(video.id, FailureStage::CrfSearch)
                .await
                .unwrap(),
            0
        );
    }
}
