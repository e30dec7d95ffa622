//! Persistent state for videos, VMAF samples, libraries and failures.
//!
//! The store is the single writer for all durable state; pipelines hold
//! only transient snapshots of its rows. Every mutation runs in a
//! transaction.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

mod failures;
mod libraries;
mod maintenance;
mod videos;
mod vmafs;

pub use failures::{FailureCategory, FailureStage, NewFailure, VideoFailure};
pub use libraries::{Library, LibraryIndex};
pub use videos::{MediaAttributes, ServiceType, Video};
pub use vmafs::{EncodeCandidate, NewVmaf, Vmaf};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool };
        store.init().await?;
        store.reset_interrupted().await?;

        Ok(store)
    }

    /// Single-connection in-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL DEFAULT 0,
                duration REAL,
                width INTEGER,
                height INTEGER,
                frame_rate REAL,
                bitrate INTEGER NOT NULL DEFAULT 0,
                video_codecs TEXT NOT NULL DEFAULT '[]',
                audio_codecs TEXT NOT NULL DEFAULT '[]',
                max_audio_channels INTEGER,
                atmos INTEGER NOT NULL DEFAULT 0,
                hdr TEXT,
                content_year INTEGER,
                state TEXT NOT NULL DEFAULT 'needs_analysis',
                library_id INTEGER,
                service_type TEXT NOT NULL,
                service_id TEXT NOT NULL,
                chosen_vmaf_id INTEGER,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(library_id) REFERENCES libraries(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vmafs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                crf REAL NOT NULL,
                score REAL NOT NULL,
                percent REAL NOT NULL,
                size INTEGER,
                time INTEGER,
                savings INTEGER,
                chosen INTEGER NOT NULL DEFAULT 0,
                params TEXT NOT NULL DEFAULT '[]',
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(video_id) REFERENCES videos(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS libraries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS video_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                category TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                system_context TEXT NOT NULL DEFAULT '{}',
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at DATETIME,
                inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(video_id) REFERENCES videos(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_state ON videos(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_videos_state_updated ON videos(state, updated_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_vmafs_video_crf ON vmafs(video_id, crf)",
        )
        .execute(&self.pool)
        .await?;
        // Guarantees at most one chosen sample per video at the engine level.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_vmafs_chosen ON vmafs(video_id) WHERE chosen = 1",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failures_video ON video_failures(video_id, resolved)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Roll videos stranded mid-stage by a crash back to their stable
    /// predecessor so the pipelines pick them up again.
    async fn reset_interrupted(&self) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET state = 'analyzed', updated_at = CURRENT_TIMESTAMP
             WHERE state = 'crf_searching'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "UPDATE videos SET state = 'crf_searched', updated_at = CURRENT_TIMESTAMP
             WHERE state = 'encoding'",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
