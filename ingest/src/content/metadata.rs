use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::Path,
    process::Command,
    sync::Arc,
};

use mime_guess::MimeGuess;
use serde::Deserialize;

use crate::db::{CLASS_ITEM, INVALID_OBJECT_ID, Metadata, NewObject, Resource};
use crate::error::IngestResult;

pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// What a handler learned about one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Descriptive fields such as `title`, `artist`, `album`.
    pub fields: Metadata,
    /// Attributes of the primary resource such as `duration`, `resolution`.
    pub resource: BTreeMap<String, String>,
}

impl MediaInfo {
    fn merge(&mut self, other: MediaInfo) {
        for (key, value) in other.fields {
            self.fields.entry(key).or_insert(value);
        }
        for (key, value) in other.resource {
            self.resource.entry(key).or_insert(value);
        }
    }
}

/// Per-format metadata extraction. Handlers run on the blocking pool.
pub trait MetadataHandler: Send + Sync {
    fn handles(&self, mime_type: &str) -> bool;
    fn extract(&self, path: &Path, mime_type: &str) -> Result<MediaInfo, String>;
}

pub(crate) fn default_mimetype_upnpclass() -> HashMap<String, String> {
    [
        ("audio/*", "object.item.audioItem.musicTrack"),
        ("video/*", "object.item.videoItem"),
        ("image/*", "object.item.imageItem"),
        ("application/ogg", "object.item.audioItem.musicTrack"),
    ]
    .into_iter()
    .map(|(mime, class)| (mime.to_string(), class.to_string()))
    .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct MimeMapper {
    extension_mimetype: HashMap<String, String>,
    mimetype_upnpclass: HashMap<String, String>,
    ignore_unknown_extensions: bool,
}

impl MimeMapper {
    pub(crate) fn new(
        extension_mimetype: HashMap<String, String>,
        mimetype_upnpclass: HashMap<String, String>,
        ignore_unknown_extensions: bool,
    ) -> Self {
        let extension_mimetype = extension_mimetype
            .into_iter()
            .map(|(ext, mime)| (ext.trim_start_matches('.').to_ascii_lowercase(), mime))
            .collect();
        let mut classes = default_mimetype_upnpclass();
        classes.extend(mimetype_upnpclass);
        Self {
            extension_mimetype,
            mimetype_upnpclass: classes,
            ignore_unknown_extensions,
        }
    }

    /// Configured extension overrides first, then the guess from the name.
    pub(crate) fn mime_for(&self, path: &Path) -> Option<String> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        if let Some(mime) = ext.as_deref().and_then(|ext| self.extension_mimetype.get(ext)) {
            return Some(mime.clone());
        }
        MimeGuess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string())
    }

    pub(crate) fn class_for(&self, mime_type: &str) -> String {
        if let Some(class) = self.mimetype_upnpclass.get(mime_type) {
            return class.clone();
        }
        let wildcard = mime_type
            .split_once('/')
            .map(|(major, _)| format!("{major}/*"));
        wildcard
            .and_then(|key| self.mimetype_upnpclass.get(&key).cloned())
            .unwrap_or_else(|| CLASS_ITEM.to_string())
    }

    pub(crate) fn ignore_unknown_extensions(&self) -> bool {
        self.ignore_unknown_extensions
    }
}

/// Turns files into catalog objects.
pub(crate) struct Importer {
    mime: MimeMapper,
    handlers: Vec<Arc<dyn MetadataHandler>>,
}

impl Importer {
    pub(crate) fn new(mime: MimeMapper, handlers: Vec<Arc<dyn MetadataHandler>>) -> Self {
        Self { mime, handlers }
    }

    /// Builds the object for the file at `path`, or `None` when the file is
    /// gone or its type is unknown and unknown types are ignored. The parent
    /// is left unset.
    pub(crate) async fn create_object_from_file(
        &self,
        path: &Path,
    ) -> IngestResult<Option<NewObject>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "file vanished before import");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to stat file, skipping");
                return Ok(None);
            }
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let mime_type = match self.mime.mime_for(path) {
            Some(mime) => mime,
            None if self.mime.ignore_unknown_extensions() => {
                tracing::debug!(path = %path.display(), "skipping file of unknown type");
                return Ok(None);
            }
            None => FALLBACK_MIME_TYPE.to_string(),
        };
        let upnp_class = self.mime.class_for(&mime_type);
        let info = self.extract(path, &mime_type).await;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let title = info
            .fields
            .get("title")
            .filter(|title| !title.trim().is_empty())
            .cloned()
            .unwrap_or(file_name);

        let mut attributes = info.resource;
        attributes.insert("size".to_string(), metadata.len().to_string());
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64);

        let mut object = NewObject::item(INVALID_OBJECT_ID, title, upnp_class);
        object.location = Some(path.to_path_buf());
        object.is_virtual = false;
        object.resources = vec![Resource {
            protocol_info: format!("http-get:*:{mime_type}:*"),
            attributes,
        }];
        object.mime_type = Some(mime_type);
        object.metadata = info.fields;
        object.last_modified = last_modified;
        Ok(Some(object))
    }

    /// Runs every handler that claims `mime_type`. A failing handler
    /// contributes nothing.
    async fn extract(&self, path: &Path, mime_type: &str) -> MediaInfo {
        let handlers: Vec<_> = self
            .handlers
            .iter()
            .filter(|handler| handler.handles(mime_type))
            .cloned()
            .collect();
        if handlers.is_empty() {
            return MediaInfo::default();
        }
        let path_buf = path.to_path_buf();
        let mime = mime_type.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            let mut info = MediaInfo::default();
            for handler in handlers {
                match handler.extract(&path_buf, &mime) {
                    Ok(extracted) => info.merge(extracted),
                    Err(err) => {
                        tracing::warn!(error = %err, path = %path_buf.display(), "metadata extraction failed");
                    }
                }
            }
            info
        })
        .await;
        match joined {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "metadata worker failed");
                MediaInfo::default()
            }
        }
    }
}

/// Formats seconds as `H:MM:SS.mmm`.
pub(crate) fn format_duration(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    sample_rate: Option<String>,
    channels: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

const FFPROBE_TAGS: [&str; 6] = ["title", "artist", "album", "genre", "date", "track"];

/// Audio and video properties via an external `ffprobe`.
pub struct FfprobeHandler;

impl FfprobeHandler {
    fn parse(stdout: &[u8]) -> Result<MediaInfo, String> {
        let data: FfprobeOutput = serde_json::from_slice(stdout).map_err(|err| err.to_string())?;
        let mut info = MediaInfo::default();
        let format = data.format.unwrap_or_default();

        if let Some(duration) = format.duration.as_deref().and_then(|value| value.parse::<f64>().ok()) {
            info.resource
                .insert("duration".to_string(), format_duration(duration));
        }
        if let Some(bit_rate) = format.bit_rate.as_deref().and_then(|value| value.parse::<u64>().ok()) {
            info.resource
                .insert("bitrate".to_string(), (bit_rate / 8).to_string());
        }
        for (key, value) in format.tags {
            let key = key.to_ascii_lowercase();
            if FFPROBE_TAGS.contains(&key.as_str()) && !value.trim().is_empty() {
                info.fields.entry(key).or_insert_with(|| value.trim().to_string());
            }
        }

        for stream in data.streams {
            match stream.codec_type.as_deref() {
                Some("video") => {
                    if let (Some(width), Some(height)) = (stream.width, stream.height) {
                        info.resource
                            .entry("resolution".to_string())
                            .or_insert_with(|| format!("{width}x{height}"));
                    }
                    if let Some(codec) = stream.codec_name {
                        info.resource.entry("video_codec".to_string()).or_insert(codec);
                    }
                }
                Some("audio") => {
                    if let Some(rate) = stream.sample_rate {
                        info.resource.entry("sample_frequency".to_string()).or_insert(rate);
                    }
                    if let Some(channels) = stream.channels {
                        info.resource
                            .entry("nr_audio_channels".to_string())
                            .or_insert_with(|| channels.to_string());
                    }
                    if let Some(codec) = stream.codec_name {
                        info.resource.entry("audio_codec".to_string()).or_insert(codec);
                    }
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

impl MetadataHandler for FfprobeHandler {
    fn handles(&self, mime_type: &str) -> bool {
        mime_type.starts_with("audio/") || mime_type.starts_with("video/") || mime_type == "application/ogg"
    }

    fn extract(&self, path: &Path, _mime_type: &str) -> Result<MediaInfo, String> {
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("stream=codec_type,codec_name,width,height,sample_rate,channels:format=duration,bit_rate:format_tags")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .map_err(|err| err.to_string())?;
        if !output.status.success() {
            return Err("ffprobe failed".to_string());
        }
        Self::parse(&output.stdout)
    }
}

/// Image dimensions via the `image` crate.
pub struct ImageHandler;

impl MetadataHandler for ImageHandler {
    fn handles(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/")
    }

    fn extract(&self, path: &Path, _mime_type: &str) -> Result<MediaInfo, String> {
        let (width, height) = image::image_dimensions(path).map_err(|err| err.to_string())?;
        let mut info = MediaInfo::default();
        info.resource
            .insert("resolution".to_string(), format!("{width}x{height}"));
        Ok(info)
    }
}

pub fn builtin_handlers() -> Vec<Arc<dyn MetadataHandler>> {
    vec![Arc::new(FfprobeHandler), Arc::new(ImageHandler)]
}
