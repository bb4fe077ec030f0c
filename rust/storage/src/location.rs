//! Addressing of content on disk and in the object store. Both are pure
//! functions of the content id.
//!
//! On disk, the id is rendered as eight lowercase hex digits and split into
//! three directory levels of two digits each, so no directory fans out to
//! more than 256 entries:
//!
//! ```text
//! 0x12345678 -> 12/34/56/12345678
//! ```
//!
//! Ids above [`MAX_DISK_CONTENT_ID`] do not fit this layout and are never
//! stored on disk.
//!
//! In the object store, content lives in containers of
//! [`CONTAINER_SIZE`] consecutive ids, named by decimal id.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

pub type ContentId = i64;

pub const CONTAINER_PREFIX: &str = "librarian_";
pub const CONTAINER_SIZE: ContentId = 1_000_000;
/// The largest id with an eight digit path.
pub const MAX_DISK_CONTENT_ID: ContentId = 0xffff_ffff;

static HEX_DIRECTORY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{2}$").expect("Failed to compile regex"));
static HEX_FILENAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{8}$").expect("Failed to compile regex"));
static OBJECT_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:/\d+)?$").expect("Failed to compile regex"));
static CONTAINER_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{CONTAINER_PREFIX}(\d+)$")).expect("Failed to compile regex")
});

/// Path of a content id relative to the storage root. Only meaningful up
/// to [`MAX_DISK_CONTENT_ID`].
pub fn relative_path_for(content_id: ContentId) -> PathBuf {
    let hex = format!("{content_id:08x}");
    [&hex[0..2], &hex[2..4], &hex[4..6], hex.as_str()]
        .iter()
        .collect()
}

/// Whether `name` is a valid name for one of the three directory levels.
pub fn is_storage_directory_name(name: &str) -> bool {
    HEX_DIRECTORY_REGEX.is_match(name)
}

/// Recovers the content id from a path relative to the storage root, or
/// `None` when the path is not laid out the way [`relative_path_for`] lays
/// it out.
pub fn content_id_from_relative_path(path: &Path) -> Option<ContentId> {
    let parts: Vec<&str> = path
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    let [a, b, c, filename] = parts.as_slice() else {
        return None;
    };
    if ![a, b, c].iter().all(|dir| is_storage_directory_name(dir))
        || !HEX_FILENAME_REGEX.is_match(filename)
        || filename[0..6] != format!("{a}{b}{c}")
    {
        return None;
    }
    ContentId::from_str_radix(filename, 16).ok()
}

/// The (container, object name) pair a content id is stored under.
pub fn location_for(content_id: ContentId) -> (String, String) {
    (
        container_name(content_id / CONTAINER_SIZE),
        content_id.to_string(),
    )
}

pub fn container_name(index: ContentId) -> String {
    format!("{CONTAINER_PREFIX}{index}")
}

/// The index of a container, `librarian_<index>`.
pub fn container_index(name: &str) -> Option<ContentId> {
    CONTAINER_NAME_REGEX
        .captures(name)
        .and_then(|groups| groups.get(1))
        .and_then(|index| index.as_str().parse().ok())
}

/// The content id an object belongs to. Segments of large objects are
/// stored as `<id>/<segment>` and belong to `<id>`.
pub fn content_id_from_object_name(name: &str) -> Option<ContentId> {
    OBJECT_NAME_REGEX
        .captures(name)
        .and_then(|groups| groups.get(1))
        .and_then(|id| id.as_str().parse().ok())
}
