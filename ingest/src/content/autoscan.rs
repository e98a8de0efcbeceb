use std::{
    collections::BTreeMap,
    env,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::db::{AutoscanRecord, INVALID_OBJECT_ID};
use crate::error::{IngestError, IngestResult};

pub const INVALID_SCAN_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Timed,
    Monitored,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Timed => "timed",
            ScanMode::Monitored => "monitored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "timed" => Some(ScanMode::Timed),
            "monitored" | "inotify" => Some(ScanMode::Monitored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanLevel {
    /// Only notice added and removed entries.
    #[default]
    Basic,
    /// Also re-extract metadata of entries already in the catalog.
    Full,
}

impl ScanLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanLevel::Basic => "basic",
            ScanLevel::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(ScanLevel::Basic),
            "full" => Some(ScanLevel::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoscanDirectory {
    pub location: PathBuf,
    pub scan_mode: ScanMode,
    pub scan_level: ScanLevel,
    pub recursive: bool,
    pub hidden: bool,
    pub interval_secs: u64,
    /// Container mirroring `location`, assigned on the first rescan.
    pub object_id: i64,
    pub scan_id: u32,
    pub last_modified: Option<i64>,
}

impl AutoscanDirectory {
    pub fn new(location: impl Into<PathBuf>, scan_mode: ScanMode) -> Self {
        Self {
            location: location.into(),
            scan_mode,
            scan_level: ScanLevel::Basic,
            recursive: true,
            hidden: false,
            interval_secs: 0,
            object_id: INVALID_OBJECT_ID,
            scan_id: INVALID_SCAN_ID,
            last_modified: None,
        }
    }

    pub(crate) fn from_record(record: AutoscanRecord) -> Self {
        Self {
            location: record.location,
            scan_mode: record.scan_mode,
            scan_level: record.scan_level,
            recursive: record.recursive,
            hidden: record.hidden,
            interval_secs: record.interval_secs,
            object_id: record.object_id,
            scan_id: INVALID_SCAN_ID,
            last_modified: record.last_modified,
        }
    }

    pub(crate) fn to_record(&self) -> AutoscanRecord {
        AutoscanRecord {
            location: self.location.clone(),
            scan_mode: self.scan_mode,
            scan_level: self.scan_level,
            recursive: self.recursive,
            hidden: self.hidden,
            interval_secs: self.interval_secs,
            object_id: self.object_id,
            last_modified: self.last_modified,
        }
    }

    pub(crate) fn validate(&self) -> IngestResult<()> {
        if !self.location.is_absolute() {
            return Err(IngestError::invalid(format!(
                "Autoscan location {} must be absolute",
                self.location.display()
            )));
        }
        if self.scan_mode == ScanMode::Timed && self.interval_secs == 0 {
            return Err(IngestError::invalid(format!(
                "Timed autoscan {} needs a positive interval",
                self.location.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AutoscanKey<'a> {
    ScanId(u32, ScanMode),
    Location(&'a Path),
    ObjectId(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SetOutcome {
    Added(AutoscanDirectory),
    Updated {
        previous: AutoscanDirectory,
        current: AutoscanDirectory,
    },
}

impl SetOutcome {
    pub(crate) fn current(&self) -> &AutoscanDirectory {
        match self {
            SetOutcome::Added(current) | SetOutcome::Updated { current, .. } => current,
        }
    }
}

/// Registered autoscan directories, one list per scan mode.
///
/// Every entry is reachable by scan id, by location and (once assigned) by
/// object id; removal through any key removes the entry for all of them.
#[derive(Debug, Default)]
pub(crate) struct AutoscanRegistry {
    timed: BTreeMap<u32, AutoscanDirectory>,
    monitored: BTreeMap<u32, AutoscanDirectory>,
    next_scan_id: u32,
}

impl AutoscanRegistry {
    fn list_for(&self, mode: ScanMode) -> &BTreeMap<u32, AutoscanDirectory> {
        match mode {
            ScanMode::Timed => &self.timed,
            ScanMode::Monitored => &self.monitored,
        }
    }

    fn list_for_mut(&mut self, mode: ScanMode) -> &mut BTreeMap<u32, AutoscanDirectory> {
        match mode {
            ScanMode::Timed => &mut self.timed,
            ScanMode::Monitored => &mut self.monitored,
        }
    }

    fn find_key(&self, key: AutoscanKey<'_>) -> Option<(ScanMode, u32)> {
        match key {
            AutoscanKey::ScanId(scan_id, mode) => self
                .list_for(mode)
                .contains_key(&scan_id)
                .then_some((mode, scan_id)),
            AutoscanKey::Location(location) => self.iter().find_map(|dir| {
                (dir.location == location).then_some((dir.scan_mode, dir.scan_id))
            }),
            AutoscanKey::ObjectId(object_id) => {
                if object_id == INVALID_OBJECT_ID {
                    return None;
                }
                self.iter().find_map(|dir| {
                    (dir.object_id == object_id).then_some((dir.scan_mode, dir.scan_id))
                })
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &AutoscanDirectory> {
        self.timed.values().chain(self.monitored.values())
    }

    pub(crate) fn get(&self, key: AutoscanKey<'_>) -> Option<&AutoscanDirectory> {
        let (mode, scan_id) = self.find_key(key)?;
        self.list_for(mode).get(&scan_id)
    }

    pub(crate) fn list(&self) -> Vec<AutoscanDirectory> {
        self.iter().cloned().collect()
    }

    /// Inserts `dir`, or updates the entry already registered for its
    /// location. An update keeps the assigned object id and, when the mode is
    /// unchanged, the scan id.
    pub(crate) fn set(&mut self, mut dir: AutoscanDirectory) -> SetOutcome {
        match self.find_key(AutoscanKey::Location(&dir.location)) {
            Some((mode, scan_id)) => {
                let previous = match self.list_for_mut(mode).remove(&scan_id) {
                    Some(previous) => previous,
                    None => return SetOutcome::Added(self.insert_new(dir)),
                };
                if previous.object_id != INVALID_OBJECT_ID {
                    dir.object_id = previous.object_id;
                }
                if dir.last_modified.is_none() {
                    dir.last_modified = previous.last_modified;
                }
                dir.scan_id = if mode == dir.scan_mode {
                    scan_id
                } else {
                    self.allocate_scan_id()
                };
                self.list_for_mut(dir.scan_mode).insert(dir.scan_id, dir.clone());
                SetOutcome::Updated {
                    previous,
                    current: dir,
                }
            }
            None => SetOutcome::Added(self.insert_new(dir)),
        }
    }

    fn insert_new(&mut self, mut dir: AutoscanDirectory) -> AutoscanDirectory {
        dir.scan_id = self.allocate_scan_id();
        self.list_for_mut(dir.scan_mode).insert(dir.scan_id, dir.clone());
        dir
    }

    fn allocate_scan_id(&mut self) -> u32 {
        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;
        scan_id
    }

    pub(crate) fn remove(&mut self, key: AutoscanKey<'_>) -> Option<AutoscanDirectory> {
        let (mode, scan_id) = self.find_key(key)?;
        self.list_for_mut(mode).remove(&scan_id)
    }

    /// Records the container for an entry whose object id is still unset.
    pub(crate) fn assign_object_id(
        &mut self,
        scan_id: u32,
        mode: ScanMode,
        object_id: i64,
    ) -> Option<AutoscanDirectory> {
        let dir = self.list_for_mut(mode).get_mut(&scan_id)?;
        if dir.object_id != INVALID_OBJECT_ID {
            return None;
        }
        dir.object_id = object_id;
        Some(dir.clone())
    }

    /// Unsets the container of the entry scanning `object_id` so its next
    /// scan recreates it.
    pub(crate) fn detach_object(&mut self, object_id: i64) -> Option<AutoscanDirectory> {
        let (mode, scan_id) = self.find_key(AutoscanKey::ObjectId(object_id))?;
        let dir = self.list_for_mut(mode).get_mut(&scan_id)?;
        dir.object_id = INVALID_OBJECT_ID;
        dir.last_modified = None;
        Some(dir.clone())
    }

    pub(crate) fn set_last_modified(
        &mut self,
        scan_id: u32,
        mode: ScanMode,
        last_modified: i64,
    ) -> Option<AutoscanDirectory> {
        let dir = self.list_for_mut(mode).get_mut(&scan_id)?;
        if dir.last_modified.is_some_and(|current| current >= last_modified) {
            return None;
        }
        dir.last_modified = Some(last_modified);
        Some(dir.clone())
    }

    /// The registered entry of `mode` with the longest location that is a
    /// prefix of `path`.
    pub(crate) fn innermost_containing(
        &self,
        path: &Path,
        mode: ScanMode,
    ) -> Option<&AutoscanDirectory> {
        self.list_for(mode)
            .values()
            .filter(|dir| path == dir.location || (dir.recursive && path.starts_with(&dir.location)))
            .max_by_key(|dir| dir.location.components().count())
    }
}

/// Makes `path` absolute and lexically resolves `.` and `..`.
pub(crate) fn normalize_location(path: &Path) -> PathBuf {
    let mut buf = path.to_path_buf();
    if !buf.is_absolute() {
        if let Ok(cwd) = env::current_dir() {
            buf = cwd.join(buf);
        }
    }

    let mut normalized = PathBuf::new();
    for component in buf.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = normalized.pop();
            }
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed(location: &str) -> AutoscanDirectory {
        AutoscanDirectory {
            interval_secs: 60,
            ..AutoscanDirectory::new(location, ScanMode::Timed)
        }
    }

    // Ensures an entry is visible through all three keys and gone from all after removal.
    #[test]
    fn removal_by_any_key_is_consistent() {
        let mut registry = AutoscanRegistry::default();
        let added = registry.set(timed("/media/music")).current().clone();
        registry.assign_object_id(added.scan_id, ScanMode::Timed, 17);

        let location = Path::new("/media/music");
        assert!(registry.get(AutoscanKey::ScanId(added.scan_id, ScanMode::Timed)).is_some());
        assert!(registry.get(AutoscanKey::Location(location)).is_some());
        assert!(registry.get(AutoscanKey::ObjectId(17)).is_some());
        assert!(registry.get(AutoscanKey::ScanId(added.scan_id, ScanMode::Monitored)).is_none());

        let removed = registry.remove(AutoscanKey::ObjectId(17)).unwrap();
        assert_eq!(removed.location, location);
        assert!(registry.get(AutoscanKey::ScanId(added.scan_id, ScanMode::Timed)).is_none());
        assert!(registry.get(AutoscanKey::Location(location)).is_none());
        assert!(registry.get(AutoscanKey::ObjectId(17)).is_none());
        assert!(registry.remove(AutoscanKey::Location(location)).is_none());
    }

    // Ensures updating an entry keeps its container and scan id.
    #[test]
    fn update_keeps_object_and_scan_ids() {
        let mut registry = AutoscanRegistry::default();
        let added = registry.set(timed("/media/music")).current().clone();
        registry.assign_object_id(added.scan_id, ScanMode::Timed, 5);

        let outcome = registry.set(AutoscanDirectory {
            scan_level: ScanLevel::Full,
            ..timed("/media/music")
        });
        let SetOutcome::Updated { previous, current } = outcome else {
            panic!("expected update");
        };
        assert_eq!(previous.scan_level, ScanLevel::Basic);
        assert_eq!(current.scan_level, ScanLevel::Full);
        assert_eq!(current.scan_id, added.scan_id);
        assert_eq!(current.object_id, 5);
        assert_eq!(registry.list().len(), 1);

        let moved = registry
            .set(AutoscanDirectory::new("/media/music", ScanMode::Monitored))
            .current()
            .clone();
        assert_ne!(moved.scan_id, added.scan_id);
        assert_eq!(moved.object_id, 5);
        assert!(registry.get(AutoscanKey::ScanId(added.scan_id, ScanMode::Timed)).is_none());
    }

    // Ensures the object id is assigned once and never reassigned.
    #[test]
    fn object_id_is_assigned_once() {
        let mut registry = AutoscanRegistry::default();
        let added = registry.set(timed("/media/music")).current().clone();
        assert!(registry.assign_object_id(added.scan_id, ScanMode::Timed, 3).is_some());
        assert!(registry.assign_object_id(added.scan_id, ScanMode::Timed, 4).is_none());
        assert_eq!(registry.get(AutoscanKey::ObjectId(3)).unwrap().scan_id, added.scan_id);
    }

    // Ensures a detached entry can take a new container.
    #[test]
    fn detached_entry_is_reassigned() {
        let mut registry = AutoscanRegistry::default();
        let added = registry.set(timed("/media/music")).current().clone();
        registry.assign_object_id(added.scan_id, ScanMode::Timed, 3);
        registry.set_last_modified(added.scan_id, ScanMode::Timed, 100);

        let detached = registry.detach_object(3).unwrap();
        assert_eq!(detached.object_id, INVALID_OBJECT_ID);
        assert_eq!(detached.last_modified, None);
        assert!(registry.get(AutoscanKey::ObjectId(3)).is_none());
        assert!(registry.detach_object(3).is_none());
        assert!(registry.assign_object_id(added.scan_id, ScanMode::Timed, 9).is_some());
        assert_eq!(registry.get(AutoscanKey::ObjectId(9)).unwrap().scan_id, added.scan_id);
    }

    // Ensures nested monitored roots resolve to the innermost entry.
    #[test]
    fn innermost_entry_wins() {
        let mut registry = AutoscanRegistry::default();
        registry.set(AutoscanDirectory::new("/media", ScanMode::Monitored));
        registry.set(AutoscanDirectory::new("/media/music", ScanMode::Monitored));

        let found = registry
            .innermost_containing(Path::new("/media/music/album"), ScanMode::Monitored)
            .unwrap();
        assert_eq!(found.location, Path::new("/media/music"));
        let found = registry
            .innermost_containing(Path::new("/media/video"), ScanMode::Monitored)
            .unwrap();
        assert_eq!(found.location, Path::new("/media"));
        assert!(
            registry
                .innermost_containing(Path::new("/other"), ScanMode::Monitored)
                .is_none()
        );
    }

    #[test]
    fn normalize_resolves_dot_segments() {
        assert_eq!(
            normalize_location(Path::new("/media/./music/../video/")),
            PathBuf::from("/media/video")
        );
    }

    #[test]
    fn timed_entries_need_an_interval() {
        assert!(AutoscanDirectory::new("/media", ScanMode::Timed).validate().is_err());
        assert!(timed("/media").validate().is_ok());
        assert!(timed("relative/path").validate().is_err());
        assert!(AutoscanDirectory::new("/media", ScanMode::Monitored).validate().is_ok());
    }
}
