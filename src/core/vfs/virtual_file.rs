use crate::core::fragment::{Fragment, Validity};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Path-ordered fragment map rooted at a working directory
#[derive(Debug, Clone, Default)]
pub struct VirtualFile {
    root: PathBuf,
    fragments: Vec<Fragment>,
}

impl VirtualFile {
    /// Empty map for `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        VirtualFile {
            root: root.into(),
            fragments: Vec::new(),
        }
    }

    /// Build from arbitrary fragments; sorts them and drops duplicate paths
    pub fn from_fragments(root: impl Into<PathBuf>, mut fragments: Vec<Fragment>) -> Self {
        fragments.sort_by(|a, b| a.path.cmp(&b.path));
        fragments.dedup_by(|a, b| a.path == b.path);
        VirtualFile {
            root: root.into(),
            fragments,
        }
    }

    /// Every regular file under `root`, sorted, as bare fragments
    pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                crate::error::PhoenixError::unavailable(path, io)
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragments_mut(&mut self) -> &mut [Fragment] {
        &mut self.fragments
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Fragment> {
        self.fragments.get(index)
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.fragments
            .binary_search_by(|f| f.path.as_path().cmp(path))
            .ok()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index_of(path).is_some()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&Fragment> {
        self.index_of(path).map(|i| &self.fragments[i])
    }

    pub fn get_by_path_mut(&mut self, path: &Path) -> Option<&mut Fragment> {
        self.index_of(path).map(move |i| &mut self.fragments[i])
    }

    /// Insert in path order, replacing an entry with the same path
    ///
    /// Returns the index the fragment landed at.
    pub fn insert(&mut self, fragment: Fragment) -> usize {
        match self
            .fragments
            .binary_search_by(|f| f.path.cmp(&fragment.path))
        {
            Ok(i) => {
                self.fragments[i] = fragment;
                i
            }
            Err(i) => {
                self.fragments.insert(i, fragment);
                i
            }
        }
    }

    /// Insert a bare, unchecked fragment for `path`
    pub fn insert_path(&mut self, path: PathBuf) -> usize {
        let fragment = Fragment::new(&self.root, path);
        self.insert(fragment)
    }

    pub fn remove(&mut self, path: &Path) -> Option<Fragment> {
        self.index_of(path).map(|i| self.fragments.remove(i))
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.fragments.iter().map(|f| f.path.clone()).collect()
    }

    /// Tracked fragment paths at or below `dir`
    pub fn tracked_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.fragments
            .iter()
            .filter(|f| f.path.starts_with(dir) && f.path != dir)
            .map(|f| f.path.clone())
            .collect()
    }

    /// Indexes that are new or moved relative to `before`
    pub fn shifted_since(&self, before: &[PathBuf]) -> Vec<usize> {
        self.fragments
            .iter()
            .enumerate()
            .filter(|(i, f)| before.get(*i) != Some(&f.path))
            .map(|(i, _)| i)
            .collect()
    }

    /// Move every fragment to `new_root`, keeping relative paths
    pub fn rebase(&mut self, new_root: impl Into<PathBuf>) {
        self.root = new_root.into();
        for fragment in &mut self.fragments {
            fragment.path = self.root.join(&fragment.relative);
        }
    }

    pub(crate) fn refresh_stamps(&mut self) {
        for fragment in &mut self.fragments {
            fragment.refresh_stamp();
        }
    }

    /// Whether every fragment is `Valid` or `Unknown`
    pub fn all_acceptable(&self) -> bool {
        self.fragments.iter().all(|f| f.validity.is_acceptable())
    }

    /// Fragment count per validity label
    pub fn validity_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for fragment in &self.fragments {
            *counts.entry(fragment.validity.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, validity: Validity) -> usize {
        self.fragments.iter().filter(|f| f.validity == validity).count()
    }
}
