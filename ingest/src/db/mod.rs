pub(crate) mod migrations;
mod autoscan;
mod objects;
mod sqlite;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::content::autoscan::{ScanLevel, ScanMode};
use crate::error::IngestResult;

pub(crate) use sqlite::SqliteCatalog;

/// Id returned by lookups that found nothing.
pub const INVALID_OBJECT_ID: i64 = -1;
/// Root of the whole content tree.
pub const ROOT_ID: i64 = 0;
/// "PC Directory", the anchor of every filesystem-mirrored container.
pub const FS_ROOT_ID: i64 = 1;

pub const CLASS_CONTAINER: &str = "object.container";
pub const CLASS_ITEM: &str = "object.item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Container,
    Item,
}

impl ObjectKind {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ObjectKind::Container => 0,
            ObjectKind::Item => 1,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ObjectKind::Container),
            1 => Some(ObjectKind::Item),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub protocol_info: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// An object that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObject {
    pub parent_id: i64,
    pub ref_id: Option<i64>,
    pub kind: ObjectKind,
    pub upnp_class: String,
    pub title: String,
    pub location: Option<PathBuf>,
    pub is_virtual: bool,
    pub mime_type: Option<String>,
    pub metadata: Metadata,
    pub resources: Vec<Resource>,
    pub last_modified: Option<i64>,
}

impl NewObject {
    pub fn container(parent_id: i64, title: impl Into<String>, upnp_class: impl Into<String>) -> Self {
        Self {
            parent_id,
            ref_id: None,
            kind: ObjectKind::Container,
            upnp_class: upnp_class.into(),
            title: title.into(),
            location: None,
            is_virtual: true,
            mime_type: None,
            metadata: Metadata::new(),
            resources: Vec::new(),
            last_modified: None,
        }
    }

    pub fn item(parent_id: i64, title: impl Into<String>, upnp_class: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Item,
            ..Self::container(parent_id, title, upnp_class)
        }
    }

    /// A virtual reference to `target`, placed under `parent_id`.
    pub fn reference_to(target_id: i64, target: &NewObject, parent_id: i64) -> Self {
        Self {
            parent_id,
            ref_id: Some(target_id),
            location: None,
            is_virtual: true,
            ..target.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogObject {
    pub id: i64,
    pub parent_id: i64,
    pub ref_id: Option<i64>,
    pub kind: ObjectKind,
    pub upnp_class: String,
    pub title: String,
    pub location: Option<PathBuf>,
    pub is_virtual: bool,
    pub mime_type: Option<String>,
    pub metadata: Metadata,
    pub resources: Vec<Resource>,
    pub last_modified: Option<i64>,
    pub update_id: i64,
}

impl CatalogObject {
    pub fn is_container(&self) -> bool {
        self.kind == ObjectKind::Container
    }

    pub fn is_reference(&self) -> bool {
        self.ref_id.is_some()
    }
}

/// One row deleted by [`Database::remove_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedObject {
    pub id: i64,
    pub parent_id: i64,
    pub location: Option<PathBuf>,
}

/// Persisted form of an autoscan directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoscanRecord {
    pub location: PathBuf,
    pub scan_mode: ScanMode,
    pub scan_level: ScanLevel,
    pub recursive: bool,
    pub hidden: bool,
    pub interval_secs: u64,
    pub object_id: i64,
    pub last_modified: Option<i64>,
}

/// Storage seam for the content catalog.
///
/// Every method is a single logical operation; implementations are free to
/// serialize access internally.
#[async_trait]
pub trait Database: Send + Sync {
    async fn create_object(&self, object: &NewObject) -> IngestResult<i64>;

    /// Writes every mutable field of `object` and bumps its update id.
    async fn update_object(&self, object: &CatalogObject) -> IngestResult<()>;

    async fn load_object(&self, id: i64) -> IngestResult<Option<CatalogObject>>;

    /// Deletes `id` and, when `recursive`, its whole subtree. References to any
    /// removed non-virtual item are deleted as well. Removing a non-empty
    /// container without `recursive` is rejected.
    async fn remove_object(&self, id: i64, recursive: bool) -> IngestResult<Vec<RemovedObject>>;

    async fn find_object_by_location(&self, location: &Path)
    -> IngestResult<Option<CatalogObject>>;

    async fn find_child_container(&self, parent_id: i64, title: &str) -> IngestResult<Option<i64>>;

    async fn get_children(&self, container_id: i64) -> IngestResult<Vec<CatalogObject>>;

    async fn find_references(&self, real_id: i64) -> IngestResult<Vec<i64>>;

    /// Number of non-virtual items in the catalog.
    async fn count_items(&self) -> IngestResult<i64>;

    async fn load_autoscans(&self) -> IngestResult<Vec<AutoscanRecord>>;

    /// Inserts or replaces the record stored for `record.location`.
    async fn save_autoscan(&self, record: &AutoscanRecord) -> IngestResult<()>;

    async fn delete_autoscan(&self, location: &Path) -> IngestResult<()>;
}
