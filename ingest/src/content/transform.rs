use crate::db::{CLASS_CONTAINER, NewObject};

pub const CLASS_MUSIC_ALBUM: &str = "object.container.album.musicAlbum";

/// A virtual container chain that should receive a reference to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPlacement {
    pub chain: Vec<String>,
    pub leaf_class: String,
}

impl VirtualPlacement {
    pub fn new(chain: &[&str], leaf_class: &str) -> Self {
        Self {
            chain: chain.iter().map(|segment| segment.to_string()).collect(),
            leaf_class: leaf_class.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Store the (possibly rewritten) object as is.
    Keep(NewObject),
    /// Do not store the object at all.
    Veto,
    /// Store the object and add references to it under each placement.
    Place {
        object: NewObject,
        references: Vec<VirtualPlacement>,
    },
}

/// Import-time hook that may rewrite, reject or place new file objects.
pub trait ObjectTransform: Send + Sync {
    fn transform(&self, object: NewObject) -> TransformOutcome;
}

/// Sorts imported media into a browsable virtual layout.
pub struct LayoutTransform;

fn field<'a>(object: &'a NewObject, key: &str) -> &'a str {
    object
        .metadata
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or("Unknown")
}

impl ObjectTransform for LayoutTransform {
    fn transform(&self, object: NewObject) -> TransformOutcome {
        let class = object.upnp_class.as_str();
        let references = if class.starts_with("object.item.audioItem") {
            let artist = field(&object, "artist");
            let album = field(&object, "album");
            vec![
                VirtualPlacement::new(&["Audio", "All Audio"], CLASS_CONTAINER),
                VirtualPlacement::new(&["Audio", "Artists", artist, album], CLASS_MUSIC_ALBUM),
            ]
        } else if class.starts_with("object.item.videoItem") {
            vec![VirtualPlacement::new(
                &["Video", "All Video"],
                CLASS_CONTAINER,
            )]
        } else if class.starts_with("object.item.imageItem") {
            vec![VirtualPlacement::new(
                &["Photos", "All Photos"],
                CLASS_CONTAINER,
            )]
        } else {
            Vec::new()
        };

        if references.is_empty() {
            TransformOutcome::Keep(object)
        } else {
            TransformOutcome::Place { object, references }
        }
    }
}
