use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    env,
    path::PathBuf,
    sync::Arc,
};

use crate::content::autoscan::{AutoscanDirectory, ScanLevel, ScanMode};
use crate::content::manager::ContentOptions;
use crate::content::metadata::builtin_handlers;
use crate::content::transform::{LayoutTransform, ObjectTransform};
use crate::content::triggers::WatcherOptions;

pub const CONFIG_PATH_ENV: &str = "INGEST_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub autoscan: AutoscanConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    #[default]
    None,
    Builtin,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImportConfig {
    #[serde(default)]
    pub hidden_files: bool,
    #[serde(default)]
    pub ignore_unknown_extensions: bool,
    #[serde(default)]
    pub extension_mimetype: HashMap<String, String>,
    #[serde(default)]
    pub mimetype_upnpclass: HashMap<String, String>,
    #[serde(default)]
    pub layout: LayoutKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscanEntryConfig {
    pub location: PathBuf,
    #[serde(default)]
    pub level: ScanLevel,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscanConfig {
    #[serde(default)]
    pub timed: Vec<AutoscanEntryConfig>,
    #[serde(default)]
    pub monitored: Vec<AutoscanEntryConfig>,
    #[serde(default = "default_true")]
    pub watcher: bool,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl Default for AutoscanConfig {
    fn default() -> Self {
        Self {
            timed: Vec::new(),
            monitored: Vec::new(),
            watcher: true,
            poll_interval_secs: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl AutoscanEntryConfig {
    fn to_directory(&self, scan_mode: ScanMode) -> AutoscanDirectory {
        let mut dir = AutoscanDirectory::new(self.location.clone(), scan_mode);
        dir.scan_level = self.level;
        dir.recursive = self.recursive;
        dir.hidden = self.hidden;
        dir.interval_secs = self.interval_secs;
        dir
    }
}

impl Settings {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let builder = config::Config::builder()
            .set_default("database.path", "data/catalog.db")?
            .set_default("import.hidden_files", false)?
            .set_default("import.ignore_unknown_extensions", false)?
            .set_default("import.layout", "none")?
            .set_default("autoscan.watcher", true)?
            .add_source(config::File::from(config_path).required(false))
            .add_source(config::Environment::with_prefix("INGEST").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        if self.autoscan.poll_interval_secs == Some(0) {
            anyhow::bail!("autoscan.poll_interval_secs must be > 0");
        }
        let mut seen = HashSet::new();
        for (section, entries) in [
            ("timed", &self.autoscan.timed),
            ("monitored", &self.autoscan.monitored),
        ] {
            for (idx, entry) in entries.iter().enumerate() {
                if !entry.location.is_absolute() {
                    anyhow::bail!(
                        "autoscan.{}[{}] location '{}' must be absolute",
                        section,
                        idx,
                        entry.location.display()
                    );
                }
                if section == "timed" && entry.interval_secs == 0 {
                    anyhow::bail!("autoscan.timed[{}] interval_secs must be > 0", idx);
                }
                if !seen.insert(entry.location.clone()) {
                    anyhow::bail!(
                        "autoscan location '{}' is listed more than once",
                        entry.location.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// Autoscan entries from the file, timed first.
    pub fn autoscan_directories(&self) -> Vec<AutoscanDirectory> {
        let timed = self
            .autoscan
            .timed
            .iter()
            .map(|entry| entry.to_directory(ScanMode::Timed));
        let monitored = self
            .autoscan
            .monitored
            .iter()
            .map(|entry| entry.to_directory(ScanMode::Monitored));
        timed.chain(monitored).collect()
    }

    pub fn content_options(&self) -> ContentOptions {
        let transform: Option<Arc<dyn ObjectTransform>> = match self.import.layout {
            LayoutKind::None => None,
            LayoutKind::Builtin => Some(Arc::new(LayoutTransform)),
        };
        ContentOptions {
            hidden_files: self.import.hidden_files,
            ignore_unknown_extensions: self.import.ignore_unknown_extensions,
            extension_mimetype: self.import.extension_mimetype.clone(),
            mimetype_upnpclass: self.import.mimetype_upnpclass.clone(),
            handlers: builtin_handlers(),
            transform,
            watcher: WatcherOptions {
                enabled: self.autoscan.watcher,
                poll_interval_secs: self.autoscan.poll_interval_secs,
            },
        }
    }

    /// Effective settings as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize settings")
    }
}

fn default_config_path() -> Result<PathBuf> {
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    Ok(cwd.join("config").join("ingest.toml"))
}
