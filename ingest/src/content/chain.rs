use std::path::{Component, Path, PathBuf};

use crate::content::events::EventBus;
use crate::db::{CLASS_CONTAINER, Database, FS_ROOT_ID, NewObject, ROOT_ID};
use crate::error::{IngestError, IngestResult};

/// Splits a container chain such as `/Audio/Artists/AC\/DC` into its titles.
///
/// `\/` stands for a literal slash and `\\` for a literal backslash inside a
/// title. The chain must start at the root and must not contain empty titles.
pub fn parse_chain(chain: &str) -> IngestResult<Vec<String>> {
    let Some(rest) = chain.strip_prefix('/') else {
        return Err(IngestError::invalid(format!(
            "Container chain '{chain}' must start with '/'"
        )));
    };

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => {
                    return Err(IngestError::invalid(format!(
                        "Container chain '{chain}' ends with a dangling escape"
                    )));
                }
            },
            '/' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);

    if segments.iter().any(String::is_empty) {
        return Err(IngestError::invalid(format!(
            "Container chain '{chain}' contains an empty title"
        )));
    }
    Ok(segments)
}

/// Finds or creates containers, both virtual chains under the root and the
/// filesystem mirror under "PC Directory".
pub(crate) struct ChainBuilder<'a> {
    db: &'a dyn Database,
    events: &'a EventBus,
}

impl<'a> ChainBuilder<'a> {
    pub(crate) fn new(db: &'a dyn Database, events: &'a EventBus) -> Self {
        Self { db, events }
    }

    async fn create(&self, object: NewObject) -> IngestResult<i64> {
        let parent_id = object.parent_id;
        let id = self.db.create_object(&object).await?;
        tracing::debug!(id, parent_id, title = %object.title, "container created");
        self.events.object_added(id, parent_id);
        Ok(id)
    }

    pub(crate) async fn add_container(
        &self,
        parent_id: i64,
        title: &str,
        upnp_class: &str,
    ) -> IngestResult<i64> {
        if title.is_empty() {
            return Err(IngestError::invalid("Container title must not be empty"));
        }
        let parent = self
            .db
            .load_object(parent_id)
            .await?
            .ok_or_else(|| IngestError::not_found(format!("Parent {parent_id} not found")))?;
        if !parent.is_container() {
            return Err(IngestError::invalid(format!(
                "Parent {parent_id} is not a container"
            )));
        }
        self.create(NewObject::container(parent_id, title, upnp_class))
            .await
    }

    /// Returns the id of the last container of `segments`, creating any that
    /// are missing. Existing containers keep their class.
    pub(crate) async fn ensure_chain(
        &self,
        segments: &[String],
        leaf_class: Option<&str>,
    ) -> IngestResult<i64> {
        if segments.is_empty() {
            return Err(IngestError::invalid("Container chain must not be empty"));
        }
        let mut parent_id = ROOT_ID;
        for (idx, title) in segments.iter().enumerate() {
            if title.is_empty() {
                return Err(IngestError::invalid("Container chain contains an empty title"));
            }
            parent_id = match self.db.find_child_container(parent_id, title).await? {
                Some(id) => id,
                None => {
                    let class = if idx + 1 == segments.len() {
                        leaf_class.unwrap_or(CLASS_CONTAINER)
                    } else {
                        CLASS_CONTAINER
                    };
                    self.create(NewObject::container(parent_id, title.as_str(), class))
                        .await?
                }
            };
        }
        Ok(parent_id)
    }

    /// Returns the filesystem container mirroring `path`, creating every
    /// missing ancestor below "PC Directory".
    pub(crate) async fn ensure_path_existence(&self, path: &Path) -> IngestResult<i64> {
        if !path.is_absolute() {
            return Err(IngestError::invalid(format!(
                "Path {} must be absolute",
                path.display()
            )));
        }
        if let Some(id) = self.existing_folder(path).await? {
            return Ok(id);
        }

        let mut parent_id = FS_ROOT_ID;
        let mut current = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    current.push(component.as_os_str());
                }
                Component::Normal(_) => {
                    current.push(component.as_os_str());
                    parent_id = self.ensure_folder(parent_id, &current).await?;
                }
                Component::CurDir | Component::ParentDir => {
                    return Err(IngestError::invalid(format!(
                        "Path {} must be normalized",
                        path.display()
                    )));
                }
            }
        }
        Ok(parent_id)
    }

    /// Returns the filesystem container for `path`, creating it under
    /// `parent_id` when the catalog has none.
    pub(crate) async fn ensure_folder(&self, parent_id: i64, path: &Path) -> IngestResult<i64> {
        if let Some(id) = self.existing_folder(path).await? {
            return Ok(id);
        }
        let title = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let mut folder = NewObject::container(parent_id, title, CLASS_CONTAINER);
        folder.location = Some(path.to_path_buf());
        folder.is_virtual = false;
        self.create(folder).await
    }

    async fn existing_folder(&self, path: &Path) -> IngestResult<Option<i64>> {
        match self.db.find_object_by_location(path).await? {
            Some(object) if object.is_container() => Ok(Some(object.id)),
            Some(object) => Err(IngestError::invalid(format!(
                "{} is cataloged as item {}, not a directory",
                path.display(),
                object.id
            ))),
            None if path.parent().is_none() => Ok(Some(FS_ROOT_ID)),
            None => Ok(None),
        }
    }
}
