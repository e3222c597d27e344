//! Pending working directory changes
//!
//! Raw notifications are normalized to [`FsEvent`] and coalesced per path in a
//! [`ChangeQueue`]. Only three kinds ever reach reconciliation: renames are
//! split into a delete of the old path and a create of the new one before they
//! are queued.

use std::path::{Path, PathBuf};

/// One filesystem notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl FsEvent {
    /// Path that blacklist checks apply to
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Changed(p) | FsEvent::Deleted(p) => p,
            FsEvent::Renamed { to, .. } => to,
        }
    }
}

/// Kind of a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
}

/// Path-keyed queue that keeps first-arrival order
///
/// A later change for a queued path overwrites the earlier kind in place.
#[derive(Debug, Default, Clone)]
pub struct ChangeQueue {
    entries: Vec<(PathBuf, ChangeKind)>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        ChangeQueue::default()
    }

    pub fn push(&mut self, path: PathBuf, kind: ChangeKind) {
        match self.entries.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = kind,
            None => self.entries.push((path, kind)),
        }
    }

    /// Drop a queued change; returns whether one was queued
    pub fn remove(&mut self, path: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(p, _)| p != path);
        before != self.entries.len()
    }

    /// Drop every queued change at or below `dir`
    pub fn remove_under(&mut self, dir: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(p, _)| !p.starts_with(dir));
        before - self.entries.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|(p, _)| p == path)
    }

    pub fn kind_of(&self, path: &Path) -> Option<ChangeKind> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, k)| *k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PathBuf, ChangeKind)> {
        self.entries.iter()
    }

    /// Take every queued change in arrival order
    pub fn drain(&mut self) -> Vec<(PathBuf, ChangeKind)> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Re-point queued paths after the working directory moved
    pub fn rebase(&mut self, old_root: &Path, new_root: &Path) {
        for (path, _) in &mut self.entries {
            if let Ok(rest) = path.strip_prefix(old_root) {
                *path = new_root.join(rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_keeps_first_position() {
        let mut queue = ChangeQueue::new();
        queue.push("/w/a".into(), ChangeKind::Changed);
        queue.push("/w/b".into(), ChangeKind::Created);
        queue.push("/w/a".into(), ChangeKind::Deleted);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                (PathBuf::from("/w/a"), ChangeKind::Deleted),
                (PathBuf::from("/w/b"), ChangeKind::Created),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_and_remove_under() {
        let mut queue = ChangeQueue::new();
        queue.push("/w/d/x".into(), ChangeKind::Created);
        queue.push("/w/d/y".into(), ChangeKind::Created);
        queue.push("/w/e".into(), ChangeKind::Changed);

        assert!(queue.remove(Path::new("/w/e")));
        assert!(!queue.remove(Path::new("/w/e")));
        assert_eq!(queue.remove_under(Path::new("/w/d")), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rebase() {
        let mut queue = ChangeQueue::new();
        queue.push("/old/a".into(), ChangeKind::Changed);
        queue.rebase(Path::new("/old"), Path::new("/new"));
        assert_eq!(queue.kind_of(Path::new("/new/a")), Some(ChangeKind::Changed));
    }

    #[test]
    fn test_event_path() {
        let ev = FsEvent::Renamed {
            from: "/w/a".into(),
            to: "/w/b".into(),
        };
        assert_eq!(ev.path(), Path::new("/w/b"));
    }
}
