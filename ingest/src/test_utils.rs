use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::content::manager::{ContentManager, ContentOptions};
use crate::content::metadata::{MediaInfo, MetadataHandler};
use crate::content::triggers::WatcherOptions;
use crate::db::{CatalogObject, Database, SqliteCatalog};

pub(crate) async fn setup_test_catalog() -> Arc<dyn Database> {
    Arc::new(SqliteCatalog::in_memory().await.unwrap())
}

/// Reads tags from the file body, one `key=value` per line.
pub(crate) struct BodyTagHandler;

impl MetadataHandler for BodyTagHandler {
    fn handles(&self, mime_type: &str) -> bool {
        mime_type.starts_with("audio/")
    }

    fn extract(&self, path: &Path, _mime_type: &str) -> Result<MediaInfo, String> {
        let body = fs::read_to_string(path).map_err(|err| err.to_string())?;
        let mut info = MediaInfo::default();
        for line in body.lines() {
            if let Some((key, value)) = line.split_once('=') {
                info.fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(info)
    }
}

pub(crate) fn test_options() -> ContentOptions {
    ContentOptions {
        handlers: vec![Arc::new(BodyTagHandler)],
        watcher: WatcherOptions {
            enabled: false,
            poll_interval_secs: None,
        },
        ..ContentOptions::default()
    }
}

pub(crate) async fn start_manager(options: ContentOptions) -> ContentManager {
    ContentManager::start(setup_test_catalog().await, options).await.unwrap()
}

pub(crate) fn write_file(root: &Path, relative: &str, body: &str) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    path
}

/// Waits until nothing is queued or running.
pub(crate) async fn wait_for_idle(manager: &ContentManager) {
    for _ in 0..500 {
        let queued = manager.task_list().await.unwrap();
        let running = manager.current_task().await.unwrap();
        if queued.is_empty() && running.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task queue did not drain");
}

pub(crate) async fn child_titles(db: &dyn Database, container_id: i64) -> Vec<String> {
    let mut titles: Vec<String> = db
        .get_children(container_id)
        .await
        .unwrap()
        .into_iter()
        .map(|child| child.title)
        .collect();
    titles.sort();
    titles
}

pub(crate) async fn child_named(db: &dyn Database, container_id: i64, title: &str) -> CatalogObject {
    db.get_children(container_id)
        .await
        .unwrap()
        .into_iter()
        .find(|child| child.title == title)
        .unwrap_or_else(|| panic!("no child named {title} under {container_id}"))
}
