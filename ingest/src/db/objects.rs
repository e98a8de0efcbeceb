use std::path::{Path, PathBuf};

use sqlx::{Row, SqliteConnection, sqlite::SqliteRow};

use crate::db::{CatalogObject, Metadata, NewObject, ObjectKind, RemovedObject, Resource};
use crate::error::{IngestError, IngestResult};

const OBJECT_COLUMNS: &str = r#"
    id, parent_id, ref_id, kind, upnp_class, title, location, is_virtual,
    mime_type, metadata, resources, last_modified, update_id
"#;

pub(crate) fn location_key(location: &Path) -> String {
    location.to_string_lossy().to_string()
}

fn encode_metadata(metadata: &Metadata) -> IngestResult<String> {
    serde_json::to_string(metadata).map_err(|err| {
        tracing::error!(error = %err, "failed to encode object metadata");
        IngestError::internal("Failed to encode object metadata")
    })
}

fn encode_resources(resources: &[Resource]) -> IngestResult<String> {
    serde_json::to_string(resources).map_err(|err| {
        tracing::error!(error = %err, "failed to encode object resources");
        IngestError::internal("Failed to encode object resources")
    })
}

fn object_from_row(row: &SqliteRow) -> IngestResult<CatalogObject> {
    let read_err = |err: sqlx::Error| {
        tracing::error!(error = %err, "failed to read object row");
        IngestError::internal("Failed to read object")
    };
    let kind: i64 = row.try_get("kind").map_err(read_err)?;
    let kind = ObjectKind::from_i64(kind).ok_or_else(|| {
        tracing::error!(kind, "unknown object kind in catalog");
        IngestError::internal("Failed to read object")
    })?;
    let location: Option<String> = row.try_get("location").map_err(read_err)?;
    let metadata: String = row.try_get("metadata").map_err(read_err)?;
    let resources: String = row.try_get("resources").map_err(read_err)?;
    let metadata: Metadata = serde_json::from_str(&metadata).map_err(|err| {
        tracing::error!(error = %err, "failed to decode object metadata");
        IngestError::internal("Failed to read object")
    })?;
    let resources: Vec<Resource> = serde_json::from_str(&resources).map_err(|err| {
        tracing::error!(error = %err, "failed to decode object resources");
        IngestError::internal("Failed to read object")
    })?;
    let is_virtual: i64 = row.try_get("is_virtual").map_err(read_err)?;

    Ok(CatalogObject {
        id: row.try_get("id").map_err(read_err)?,
        parent_id: row.try_get("parent_id").map_err(read_err)?,
        ref_id: row.try_get("ref_id").map_err(read_err)?,
        kind,
        upnp_class: row.try_get("upnp_class").map_err(read_err)?,
        title: row.try_get("title").map_err(read_err)?,
        location: location.map(PathBuf::from),
        is_virtual: is_virtual != 0,
        mime_type: row.try_get("mime_type").map_err(read_err)?,
        metadata,
        resources,
        last_modified: row.try_get("last_modified").map_err(read_err)?,
        update_id: row.try_get("update_id").map_err(read_err)?,
    })
}

pub(crate) async fn insert_object(
    conn: &mut SqliteConnection,
    object: &NewObject,
) -> IngestResult<i64> {
    let metadata = encode_metadata(&object.metadata)?;
    let resources = encode_resources(&object.resources)?;
    let result = sqlx::query(
        r#"
        INSERT INTO objects (
            parent_id, ref_id, kind, upnp_class, title, location, is_virtual,
            mime_type, metadata, resources, last_modified
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(object.parent_id)
    .bind(object.ref_id)
    .bind(object.kind.as_i64())
    .bind(&object.upnp_class)
    .bind(&object.title)
    .bind(object.location.as_deref().map(location_key))
    .bind(object.is_virtual)
    .bind(object.mime_type.as_deref())
    .bind(metadata)
    .bind(resources)
    .bind(object.last_modified)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, title = %object.title, "failed to insert object");
        IngestError::internal("Failed to create object")
    })?;
    Ok(result.last_insert_rowid())
}

pub(crate) async fn update_object(
    conn: &mut SqliteConnection,
    object: &CatalogObject,
) -> IngestResult<()> {
    let metadata = encode_metadata(&object.metadata)?;
    let resources = encode_resources(&object.resources)?;
    let result = sqlx::query(
        r#"
        UPDATE objects
        SET kind = ?, upnp_class = ?, title = ?, mime_type = ?, metadata = ?, resources = ?,
            last_modified = ?, update_id = update_id + 1
        WHERE id = ?
        "#,
    )
    .bind(object.kind.as_i64())
    .bind(&object.upnp_class)
    .bind(&object.title)
    .bind(object.mime_type.as_deref())
    .bind(metadata)
    .bind(resources)
    .bind(object.last_modified)
    .bind(object.id)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, id = object.id, "failed to update object");
        IngestError::internal("Failed to update object")
    })?;
    if result.rows_affected() == 0 {
        return Err(IngestError::not_found(format!("Object {} not found", object.id)));
    }
    Ok(())
}

pub(crate) async fn get_object(
    conn: &mut SqliteConnection,
    id: i64,
) -> IngestResult<Option<CatalogObject>> {
    let row = sqlx::query(&format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, id, "failed to load object");
            IngestError::internal("Failed to load object")
        })?;
    row.as_ref().map(object_from_row).transpose()
}

pub(crate) async fn get_object_by_location(
    conn: &mut SqliteConnection,
    location: &Path,
) -> IngestResult<Option<CatalogObject>> {
    let row = sqlx::query(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects WHERE location = ? AND is_virtual = 0"
    ))
    .bind(location_key(location))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, path = %location.display(), "failed to find object by location");
        IngestError::internal("Failed to find object")
    })?;
    row.as_ref().map(object_from_row).transpose()
}

pub(crate) async fn get_child_container(
    conn: &mut SqliteConnection,
    parent_id: i64,
    title: &str,
) -> IngestResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM objects
        WHERE parent_id = ? AND title = ? AND kind = 0
        ORDER BY id
        LIMIT 1
        "#,
    )
    .bind(parent_id)
    .bind(title)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, parent_id, title, "failed to find child container");
        IngestError::internal("Failed to find container")
    })?;
    Ok(row.map(|row| row.0))
}

pub(crate) async fn get_children(
    conn: &mut SqliteConnection,
    container_id: i64,
) -> IngestResult<Vec<CatalogObject>> {
    let rows = sqlx::query(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects WHERE parent_id = ? ORDER BY id"
    ))
    .bind(container_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, container_id, "failed to list children");
        IngestError::internal("Failed to list children")
    })?;
    rows.iter().map(object_from_row).collect()
}

pub(crate) async fn get_references(
    conn: &mut SqliteConnection,
    real_id: i64,
) -> IngestResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM objects WHERE ref_id = ? ORDER BY id")
        .bind(real_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, real_id, "failed to list references");
            IngestError::internal("Failed to list references")
        })?;
    Ok(rows.into_iter().map(|row| row.0).collect())
}

pub(crate) async fn count_items(conn: &mut SqliteConnection) -> IngestResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects WHERE kind = 1 AND is_virtual = 0")
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to count items");
            IngestError::internal("Failed to count items")
        })?;
    Ok(row.0)
}

struct SubtreeRow {
    id: i64,
    parent_id: i64,
    location: Option<String>,
    real_item: bool,
}

/// Deletes `id`, its subtree when `recursive`, and every reference to a
/// deleted real item. Runs inside one transaction.
pub(crate) async fn delete_object(
    conn: &mut SqliteConnection,
    id: i64,
    recursive: bool,
) -> IngestResult<Vec<RemovedObject>> {
    let begin_err = |err: sqlx::Error| {
        tracing::error!(error = %err, id, "failed to begin object removal");
        IngestError::internal("Failed to remove object")
    };
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(begin_err)?;
    match delete_object_inner(conn, id, recursive).await {
        Ok(removed) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, id, "failed to commit object removal");
                    IngestError::internal("Failed to remove object")
                })?;
            Ok(removed)
        }
        Err(err) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

async fn delete_object_inner(
    conn: &mut SqliteConnection,
    id: i64,
    recursive: bool,
) -> IngestResult<Vec<RemovedObject>> {
    let rows = sqlx::query(
        r#"
        WITH RECURSIVE subtree(id) AS (
            SELECT id FROM objects WHERE id = ?1
            UNION
            SELECT o.id FROM objects o JOIN subtree s ON o.parent_id = s.id
        )
        SELECT o.id, o.parent_id, o.location, o.kind, o.is_virtual
        FROM objects o
        JOIN subtree s ON o.id = s.id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, id, "failed to collect object subtree");
        IngestError::internal("Failed to remove object")
    })?;

    if rows.is_empty() {
        return Err(IngestError::not_found(format!("Object {id} not found")));
    }
    if rows.len() > 1 && !recursive {
        return Err(IngestError::invalid(format!(
            "Container {id} is not empty"
        )));
    }

    let mut subtree = Vec::with_capacity(rows.len());
    for row in &rows {
        let read_err = |err: sqlx::Error| {
            tracing::error!(error = %err, "failed to read subtree row");
            IngestError::internal("Failed to remove object")
        };
        let kind: i64 = row.try_get("kind").map_err(read_err)?;
        let is_virtual: i64 = row.try_get("is_virtual").map_err(read_err)?;
        subtree.push(SubtreeRow {
            id: row.try_get("id").map_err(read_err)?,
            parent_id: row.try_get("parent_id").map_err(read_err)?,
            location: row.try_get("location").map_err(read_err)?,
            real_item: kind == ObjectKind::Item.as_i64() && is_virtual == 0,
        });
    }

    let mut removed = Vec::with_capacity(subtree.len());
    let mut seen = std::collections::HashSet::new();
    for entry in &subtree {
        seen.insert(entry.id);
    }

    for entry in &subtree {
        if !entry.real_item {
            continue;
        }
        let refs: Vec<(i64, i64)> =
            sqlx::query_as("SELECT id, parent_id FROM objects WHERE ref_id = ?")
                .bind(entry.id)
                .fetch_all(&mut *conn)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, id = entry.id, "failed to collect references");
                    IngestError::internal("Failed to remove object")
                })?;
        for (ref_id, parent_id) in refs {
            if seen.insert(ref_id) {
                removed.push(RemovedObject {
                    id: ref_id,
                    parent_id,
                    location: None,
                });
            }
        }
    }

    for entry in subtree {
        removed.push(RemovedObject {
            id: entry.id,
            parent_id: entry.parent_id,
            location: entry.location.map(PathBuf::from),
        });
    }

    for entry in &removed {
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(entry.id)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, id = entry.id, "failed to delete object");
                IngestError::internal("Failed to remove object")
            })?;
    }

    Ok(removed)
}
