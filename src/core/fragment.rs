//! Fragment model
//!
//! A container is decomposed into an ordered list of fragments, each backed by
//! one real file in the working directory:
//! - [`FragmentReference`] is what a module emits while parsing (byte range + name)
//! - [`Fragment`] is the live entry the engine keeps afterwards
//! - [`Metadata`] is the per-module annotation the engine carries but never reads

use crate::formats::gif::GifField;
use crate::formats::icon::IconField;
use crate::formats::iso_media::BoxField;
use crate::formats::network_graphics::ChunkField;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How well a fragment conforms to its format
///
/// Ordered by severity for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Validity {
    /// Never validated
    #[default]
    Unchecked,
    Valid,
    /// Violates the format but most readers tolerate it
    SoftInvalid,
    /// Violates the format, container likely unusable
    HardInvalid,
    /// Module cannot currently tell
    Unknown,
    /// Nested blob the module declines to validate
    OutOfScope,
    /// Can never become invalid again
    Irrelevant,
    /// The check itself failed; retried on the next pass
    Error,
}

impl Validity {
    /// States that allow a `ValidOnly` auto-save
    pub fn is_acceptable(self) -> bool {
        matches!(self, Validity::Valid | Validity::Unknown)
    }

    /// Whether a later pass should look at this fragment again
    pub fn needs_check(self) -> bool {
        !matches!(self, Validity::Irrelevant)
    }

    pub fn from_bool(ok: bool, otherwise: Validity) -> Validity {
        if ok {
            Validity::Valid
        } else {
            otherwise
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Validity::Unchecked => "unchecked",
            Validity::Valid => "valid",
            Validity::SoftInvalid => "soft-invalid",
            Validity::HardInvalid => "hard-invalid",
            Validity::Unknown => "unknown",
            Validity::OutOfScope => "out-of-scope",
            Validity::Irrelevant => "irrelevant",
            Validity::Error => "error",
        };
        f.write_str(label)
    }
}

/// Typed per-fragment annotations, one schema per built-in module
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "module", content = "field")]
pub enum Metadata {
    #[default]
    None,
    Icon(IconField),
    Chunk(ChunkField),
    Gif(GifField),
    Box(BoxField),
    /// Free-form annotations for modules outside this crate
    Tags(BTreeMap<String, String>),
}

impl Metadata {
    pub fn is_none(&self) -> bool {
        matches!(self, Metadata::None)
    }
}

/// Size and modification time of a fragment file, as last seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(FileStamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// One live piece of the virtual file
#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    /// Absolute location of the backing file
    pub path: PathBuf,
    /// Location relative to the working directory; modules derive structure from it
    pub relative: PathBuf,
    pub description: String,
    pub validity: Validity,
    pub metadata: Metadata,
    #[serde(skip)]
    pub(crate) stamp: Option<FileStamp>,
}

impl Fragment {
    /// Bare, unchecked fragment for `path` under `root`
    pub fn new(root: &Path, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        Fragment {
            path,
            relative,
            description: String::new(),
            validity: Validity::Unchecked,
            metadata: Metadata::None,
            stamp: None,
        }
    }

    /// Fragment created from a parsed reference after it was written to `path`
    pub fn from_reference(root: &Path, path: PathBuf, reference: FragmentReference) -> Self {
        let mut fragment = Fragment::new(root, path);
        fragment.description = reference.description;
        fragment.validity = reference.validity;
        fragment.metadata = reference.metadata;
        fragment
    }

    /// Current contents of the backing file
    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Overwrite the backing file
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        fs::write(&self.path, bytes)
    }

    /// Size of the backing file in bytes
    pub fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Relative path components as strings
    pub fn segments(&self) -> Vec<String> {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect()
    }

    /// Relative directory holding this fragment (empty at the root)
    pub fn group(&self) -> &Path {
        self.relative.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Set validity and description together
    pub fn mark(&mut self, validity: Validity, description: impl Into<String>) {
        self.validity = validity;
        self.description = description.into();
    }

    pub(crate) fn refresh_stamp(&mut self) {
        self.stamp = FileStamp::of(&self.path);
    }

    /// Whether the file on disk differs from the last recorded stamp
    pub(crate) fn changed_on_disk(&self) -> bool {
        match self.stamp {
            Some(stamp) => FileStamp::of(&self.path) != Some(stamp),
            None => true,
        }
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Fragment {}

/// Byte range a module wants exported as one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentReference {
    /// Offset into the source container
    pub offset: u64,
    pub length: u64,
    /// Hierarchical name, e.g. `["Chunk 1", "Data"]`
    pub name: Vec<String>,
    pub validity: Validity,
    pub description: String,
    pub metadata: Metadata,
}

impl FragmentReference {
    pub fn new<S: AsRef<str>>(offset: u64, length: u64, name: &[S]) -> Self {
        FragmentReference {
            offset,
            length,
            name: name.iter().map(|s| s.as_ref().to_string()).collect(),
            validity: Validity::Unchecked,
            description: String::new(),
            metadata: Metadata::None,
        }
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// End offset (exclusive)
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Checks that `references`, taken in order, tile `[0, total)` exactly
pub fn covers_contiguously(references: &[FragmentReference], total: u64) -> bool {
    let mut cursor = 0u64;
    for reference in references {
        if reference.offset != cursor {
            return false;
        }
        cursor = reference.end();
    }
    cursor == total
}
