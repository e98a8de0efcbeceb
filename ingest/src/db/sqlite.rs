use std::path::Path;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tokio::sync::Mutex;

use crate::db::{
    AutoscanRecord, CatalogObject, Database, NewObject, RemovedObject, autoscan, migrations,
    objects,
};
use crate::error::IngestResult;

/// SQLite-backed catalog over a single serialized connection.
pub(crate) struct SqliteCatalog {
    conn: Mutex<SqliteConnection>,
}

impl SqliteCatalog {
    pub(crate) async fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = migrations::open_catalog_on_disk(path).await?;
        tracing::info!(path = %path.display(), "catalog opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn in_memory() -> anyhow::Result<Self> {
        let conn = migrations::open_catalog_in_memory().await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Database for SqliteCatalog {
    async fn create_object(&self, object: &NewObject) -> IngestResult<i64> {
        let mut conn = self.conn.lock().await;
        objects::insert_object(&mut conn, object).await
    }

    async fn update_object(&self, object: &CatalogObject) -> IngestResult<()> {
        let mut conn = self.conn.lock().await;
        objects::update_object(&mut conn, object).await
    }

    async fn load_object(&self, id: i64) -> IngestResult<Option<CatalogObject>> {
        let mut conn = self.conn.lock().await;
        objects::get_object(&mut conn, id).await
    }

    async fn remove_object(&self, id: i64, recursive: bool) -> IngestResult<Vec<RemovedObject>> {
        let mut conn = self.conn.lock().await;
        objects::delete_object(&mut conn, id, recursive).await
    }

    async fn find_object_by_location(
        &self,
        location: &Path,
    ) -> IngestResult<Option<CatalogObject>> {
        let mut conn = self.conn.lock().await;
        objects::get_object_by_location(&mut conn, location).await
    }

    async fn find_child_container(&self, parent_id: i64, title: &str) -> IngestResult<Option<i64>> {
        let mut conn = self.conn.lock().await;
        objects::get_child_container(&mut conn, parent_id, title).await
    }

    async fn get_children(&self, container_id: i64) -> IngestResult<Vec<CatalogObject>> {
        let mut conn = self.conn.lock().await;
        objects::get_children(&mut conn, container_id).await
    }

    async fn find_references(&self, real_id: i64) -> IngestResult<Vec<i64>> {
        let mut conn = self.conn.lock().await;
        objects::get_references(&mut conn, real_id).await
    }

    async fn count_items(&self) -> IngestResult<i64> {
        let mut conn = self.conn.lock().await;
        objects::count_items(&mut conn).await
    }

    async fn load_autoscans(&self) -> IngestResult<Vec<AutoscanRecord>> {
        let mut conn = self.conn.lock().await;
        autoscan::get_autoscans(&mut conn).await
    }

    async fn save_autoscan(&self, record: &AutoscanRecord) -> IngestResult<()> {
        let mut conn = self.conn.lock().await;
        autoscan::upsert_autoscan(&mut conn, record).await
    }

    async fn delete_autoscan(&self, location: &Path) -> IngestResult<()> {
        let mut conn = self.conn.lock().await;
        autoscan::delete_autoscan(&mut conn, location).await
    }
}
