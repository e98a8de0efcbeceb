use anyhow::{Context, Result};
use sqlx::{
    Connection, SqliteConnection,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::{fs, path::Path};

static CATALOG_MIGRATOR: Migrator = sqlx::migrate!("migrations/catalog");

/// Opens (creating if needed) the catalog file at `path` and brings its
/// schema up to date.
pub(crate) async fn open_catalog_on_disk(path: &Path) -> Result<SqliteConnection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create catalog dir {}", parent.display()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .with_context(|| format!("failed to open catalog {}", path.display()))?;
    CATALOG_MIGRATOR
        .run(&mut conn)
        .await
        .with_context(|| format!("failed to migrate catalog {}", path.display()))?;
    Ok(conn)
}

pub(crate) async fn open_catalog_in_memory() -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::connect("sqlite::memory:")
        .await
        .context("failed to open in-memory catalog")?;
    CATALOG_MIGRATOR
        .run(&mut conn)
        .await
        .context("failed to migrate in-memory catalog")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn count_rows(conn: &mut SqliteConnection, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(conn)
            .await
            .unwrap();
        row.0
    }

    // Ensures a fresh catalog carries the two sentinel containers.
    #[tokio::test]
    async fn in_memory_catalog_has_sentinels() {
        let mut conn = open_catalog_in_memory().await.unwrap();
        let titles: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, title FROM objects ORDER BY id")
                .fetch_all(&mut conn)
                .await
                .unwrap();
        assert_eq!(
            titles,
            vec![(0, "Root".to_string()), (1, "PC Directory".to_string())]
        );
        assert_eq!(count_rows(&mut conn, "autoscan").await, 0);
    }

    // Ensures reopening an on-disk catalog does not re-run migrations.
    #[tokio::test]
    async fn reopening_disk_catalog_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("catalog.db");
        {
            let conn = open_catalog_on_disk(&path).await.unwrap();
            conn.close().await.unwrap();
        }
        let mut conn = open_catalog_on_disk(&path).await.unwrap();
        assert_eq!(count_rows(&mut conn, "objects").await, 2);
    }
}
