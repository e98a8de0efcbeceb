use std::path::{Path, PathBuf};

use sqlx::{Row, SqliteConnection};

use crate::content::autoscan::{ScanLevel, ScanMode};
use crate::db::AutoscanRecord;
use crate::db::objects::location_key;
use crate::error::{IngestError, IngestResult};

pub(crate) async fn get_autoscans(conn: &mut SqliteConnection) -> IngestResult<Vec<AutoscanRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT location, scan_mode, scan_level, recursive, hidden, interval_secs,
               object_id, last_modified
        FROM autoscan
        ORDER BY id
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "failed to read autoscan directories");
        IngestError::internal("Failed to load autoscan directories")
    })?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let read_err = |err: sqlx::Error| {
            tracing::error!(error = %err, "failed to read autoscan row");
            IngestError::internal("Failed to load autoscan directories")
        };
        let location: String = row.try_get("location").map_err(read_err)?;
        let scan_mode: String = row.try_get("scan_mode").map_err(read_err)?;
        let scan_level: String = row.try_get("scan_level").map_err(read_err)?;
        let (Some(scan_mode), Some(scan_level)) =
            (ScanMode::parse(&scan_mode), ScanLevel::parse(&scan_level))
        else {
            tracing::warn!(
                location = %location,
                scan_mode = %scan_mode,
                scan_level = %scan_level,
                "skipping autoscan row with unknown mode or level"
            );
            continue;
        };
        let interval_secs: i64 = row.try_get("interval_secs").map_err(read_err)?;
        records.push(AutoscanRecord {
            location: PathBuf::from(location),
            scan_mode,
            scan_level,
            recursive: row.try_get("recursive").map_err(read_err)?,
            hidden: row.try_get("hidden").map_err(read_err)?,
            interval_secs: interval_secs.max(0) as u64,
            object_id: row.try_get("object_id").map_err(read_err)?,
            last_modified: row.try_get("last_modified").map_err(read_err)?,
        });
    }
    Ok(records)
}

pub(crate) async fn upsert_autoscan(
    conn: &mut SqliteConnection,
    record: &AutoscanRecord,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO autoscan (
            location, scan_mode, scan_level, recursive, hidden, interval_secs,
            object_id, last_modified
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(location) DO UPDATE SET
            scan_mode = excluded.scan_mode,
            scan_level = excluded.scan_level,
            recursive = excluded.recursive,
            hidden = excluded.hidden,
            interval_secs = excluded.interval_secs,
            object_id = excluded.object_id,
            last_modified = excluded.last_modified
        "#,
    )
    .bind(location_key(&record.location))
    .bind(record.scan_mode.as_str())
    .bind(record.scan_level.as_str())
    .bind(record.recursive)
    .bind(record.hidden)
    .bind(record.interval_secs as i64)
    .bind(record.object_id)
    .bind(record.last_modified)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, path = %record.location.display(), "failed to save autoscan directory");
        IngestError::internal("Failed to save autoscan directory")
    })?;
    Ok(())
}

pub(crate) async fn delete_autoscan(conn: &mut SqliteConnection, location: &Path) -> IngestResult<()> {
    sqlx::query("DELETE FROM autoscan WHERE location = ?")
        .bind(location_key(location))
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, path = %location.display(), "failed to delete autoscan directory");
            IngestError::internal("Failed to delete autoscan directory")
        })?;
    Ok(())
}
