use super::Store;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A filesystem prefix grouping videos managed by one external media
/// library instance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Library {
    pub id: i64,
    pub path: String,
    pub inserted_at: DateTime<Utc>,
}

/// Prefix matcher over all libraries, loaded once per batch. Entries are
/// sorted longest-first so the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct LibraryIndex {
    entries: Vec<(String, i64)>,
}

impl LibraryIndex {
    pub fn new(libraries: Vec<Library>) -> Self {
        let mut entries: Vec<(String, i64)> = libraries
            .into_iter()
            .map(|lib| (lib.path, lib.id))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    pub fn match_path(&self, path: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, id)| *id)
    }
}

impl Store {
    pub async fn insert_library(&self, path: &str) -> Result<Library> {
        sqlx::query(
            "INSERT INTO libraries (path) VALUES (?)
             ON CONFLICT(path) DO NOTHING",
        )
        .bind(path)
        .execute(&self.pool)
        .await?;

        let library = sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(library)
    }

    pub async fn libraries(&self) -> Result<Vec<Library>> {
        let libraries = sqlx::query_as::<_, Library>("SELECT * FROM libraries ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(libraries)
    }

    pub async fn library_index(&self) -> Result<LibraryIndex> {
        Ok(LibraryIndex::new(self.libraries().await?))
    }
}
