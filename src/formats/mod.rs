//! Built-in format modules
//!
//! - [`icon`]: Microsoft icon and cursor files
//! - [`network_graphics`]: PNG, APNG, MNG and JNG chunk streams
//! - [`gif`]: GIF87a/GIF89a section streams
//! - [`iso_media`]: ISO base media (MP4, QuickTime, 3GP) box trees
//!
//! Modules annotate fragments from the names they gave them at parse time.
//! Those names survive numbering as `"<index> - <name>"`, so a module can
//! recover its own labels from any working directory, including one loaded
//! without a container.

pub mod gif;
pub mod icon;
pub mod iso_media;
pub mod network_graphics;

use crate::core::fragment::{Fragment, FragmentReference, Metadata};
use crate::error::Result;
use std::path::Path;

/// Segment with its numbering prefix removed
pub(crate) fn plain_segment(segment: &str) -> &str {
    match segment.split_once(" - ") {
        Some((index, rest)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => rest,
        _ => segment,
    }
}

/// Leaf name as the module emitted it, without prefix or extension
pub(crate) fn leaf_name(fragment: &Fragment) -> String {
    let file = fragment
        .relative
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let plain = plain_segment(&file);
    Path::new(plain)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| plain.to_string())
}

/// Directory names above the leaf, without prefixes
pub(crate) fn group_names(fragment: &Fragment) -> Vec<String> {
    fragment
        .group()
        .components()
        .map(|c| plain_segment(&c.as_os_str().to_string_lossy()).to_string())
        .collect()
}

/// `n` from `"<prefix> n"`
pub(crate) fn numbered(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.trim().parse().ok()
}

/// Re-derive every fragment's metadata with `label`
///
/// Labels only depend on names, so one call covers the whole list whatever the
/// cursor; the cursor is moved to the end.
pub(crate) fn relabel(
    fragments: &mut [Fragment],
    cursor: &mut usize,
    changed: &mut Vec<usize>,
    label: impl Fn(&Fragment) -> Metadata,
) {
    for (i, fragment) in fragments.iter_mut().enumerate() {
        let metadata = label(fragment);
        if fragment.metadata != metadata {
            fragment.metadata = metadata;
            changed.push(i);
        }
    }
    *cursor = fragments.len();
}

/// Read access shared by parse-time and edit-time checks
///
/// Parsing judges references against the source bytes, later edits judge the
/// live fragment files; both go through the same classification code.
pub(crate) trait Fields {
    fn count(&self) -> usize;
    fn metadata(&self, index: usize) -> &Metadata;
    fn bytes(&self, index: usize) -> Result<Vec<u8>>;
    fn size(&self, index: usize) -> Result<u64>;
}

/// References over the container they were parsed from
pub(crate) struct Parsed<'a> {
    pub source: &'a [u8],
    pub references: &'a [FragmentReference],
}

impl Fields for Parsed<'_> {
    fn count(&self) -> usize {
        self.references.len()
    }

    fn metadata(&self, index: usize) -> &Metadata {
        &self.references[index].metadata
    }

    fn bytes(&self, index: usize) -> Result<Vec<u8>> {
        let r = &self.references[index];
        Ok(self.source[r.offset as usize..r.end() as usize].to_vec())
    }

    fn size(&self, index: usize) -> Result<u64> {
        Ok(self.references[index].length)
    }
}

/// Fragments backed by files in the working directory
pub(crate) struct Live<'a>(pub &'a [Fragment]);

impl Fields for Live<'_> {
    fn count(&self) -> usize {
        self.0.len()
    }

    fn metadata(&self, index: usize) -> &Metadata {
        &self.0[index].metadata
    }

    fn bytes(&self, index: usize) -> Result<Vec<u8>> {
        Ok(self.0[index].read()?)
    }

    fn size(&self, index: usize) -> Result<u64> {
        Ok(self.0[index].size()?)
    }
}

/// Write `references` out of `bytes` under `root` the way a load does
#[cfg(test)]
pub(crate) fn materialize(
    root: &Path,
    bytes: &[u8],
    references: Vec<FragmentReference>,
) -> Vec<Fragment> {
    use crate::core::numbering::{number, ExtensionPolicy};

    let paths = number(root, &references, &ExtensionPolicy::default()).unwrap();
    references
        .into_iter()
        .zip(paths)
        .map(|(reference, path)| {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let start = reference.offset as usize;
            let end = start + reference.length as usize;
            std::fs::write(&path, &bytes[start..end]).unwrap();
            Fragment::from_reference(root, path, reference)
        })
        .collect()
}
