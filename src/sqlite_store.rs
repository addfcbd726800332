//! SQLite-backed checkpoint store.
//!
//! One row per checkpoint name in `sync_checkpoints`. The state column holds
//! the same pretty JSON the file store writes, so `sqlite3 state.db
//! 'select state_json from sync_checkpoints'` is enough to inspect a run.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::SyncError;

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::Checkpoint(format!("sqlite: {}", e))
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    name: String,
    location: String,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database at `path` and ensure the table exists.
    ///
    /// The store reads and writes the `repairshopr` row until [`with_name`](Self::with_name).
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Checkpoint(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            name: "repairshopr".to_string(),
            location: path.display().to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Use a different row, so several pipelines can share one database.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn migrate(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                name TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM sync_checkpoints WHERE name = ?")
                .bind(&self.name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(|json| Checkpoint::from_json(&json, &self.describe()))
            .transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let json = checkpoint.to_json()?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (name, state_json, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.name)
        .bind(json)
        .bind(checkpoint.updated_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn clear(&self) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_checkpoints WHERE name = ?")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.location, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{PageCursor, RunMode, SyncPhase};
    use crate::error::FailureKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("state.db"))
            .await
            .unwrap();
        assert!(store.load().await.unwrap().is_none());

        let mut cp = Checkpoint::begin(RunMode::Full, SyncPhase::Tickets, None);
        cp.advance(SyncPhase::Tickets, PageCursor::new(4, 10)).unwrap();
        cp.record_failure(FailureKind::Exhausted, "rs_ticket_9: timeout".into());
        store.save(&cp).await.unwrap();
        store.save(&cp).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cp));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn names_are_isolated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = SqliteCheckpointStore::open(&path).await.unwrap();
        let b = SqliteCheckpointStore::open(&path)
            .await
            .unwrap()
            .with_name("other");

        let cp = Checkpoint::begin(RunMode::Full, SyncPhase::Customers, None);
        a.save(&cp).await.unwrap();
        assert!(b.load().await.unwrap().is_none());
        assert!(a.describe().ends_with("(repairshopr)"));
    }
}
