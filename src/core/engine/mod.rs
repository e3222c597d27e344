//! Fragment session engine
//!
//! A [`Session`] owns one working directory and keeps it in sync with a
//! [`VirtualFile`]:
//!
//! - **Load**: decompose a container through its module, or adopt an existing
//!   directory as already decomposed
//! - **Reconcile**: watch the directory, coalesce notifications into a
//!   [`ChangeQueue`], and after a quiet period re-run the variable and
//!   validity passes over the fragments that changed or shifted
//! - **Save**: concatenate fragments in order and let the module finalize
//!
//! All mutable state sits behind one mutex; the watcher thread and API callers
//! take turns on it. Tests drive reconciliation without the OS watcher through
//! [`Session::handle_event`] and [`Session::flush_changes`].

pub mod changes;
pub mod config;
pub mod progress;
pub mod report;
mod save;
mod watcher;

#[cfg(test)]
mod tests;

pub use changes::{ChangeKind, ChangeQueue, FsEvent};
pub use config::{AutoSaveMode, FileNamingMode, RetryPolicy, SessionConfig, ValidationMode};
pub use progress::{ProgressInfo, ProgressSink};
pub use report::{FragmentStatus, SessionReport};
pub use save::{bump_iteration, next_free_name};

use crate::core::fragment::{Fragment, Validity};
use crate::core::module::FormatModule;
use crate::core::numbering::{self, ExtensionPolicy};
use crate::core::registry::Registry;
use crate::core::vfs::VirtualFile;
use crate::error::{PhoenixError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use progress::Progress;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::TempPath;
use tracing::{debug, info, warn};
use watcher::{DirectoryWatcher, WatchControl};

/// Notifications for session observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A load, refresh or reconciliation finished
    VirtualFileUpdated,
    /// The container was written to this path
    Saved(PathBuf),
    /// The session stopped, e.g. because its working directory vanished
    Disabled,
}

/// Asked before a non-empty working directory is cleared for a load
pub type ConfirmClear = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

struct State {
    config: SessionConfig,
    module: Option<Box<dyn FormatModule>>,
    /// Bumped whenever a different module instance is installed
    generation: u64,
    vfile: VirtualFile,
    queue: ChangeQueue,
    enabled: bool,
    last_generation: Option<u64>,
    last_opened_file: Option<PathBuf>,
    flatten_temp: Option<TempPath>,
}

impl State {
    fn module_name(&self) -> Option<&'static str> {
        self.module.as_ref().map(|m| m.display_name())
    }

    fn root(&self) -> Result<PathBuf> {
        self.config
            .working_directory
            .clone()
            .ok_or_else(|| PhoenixError::Configuration("no working directory set".into()))
    }

    fn require_module(&self) -> Result<()> {
        if self.module.is_none() {
            return Err(PhoenixError::Configuration("no module selected".into()));
        }
        Ok(())
    }

    fn mark_disabled(&mut self) {
        self.enabled = false;
        self.last_generation = Some(self.generation);
        self.last_opened_file = self.config.opened_file.clone();
        self.queue.clear();
    }

    /// Regular files under the working directory, minus blacklisted ones
    fn scan(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let files = VirtualFile::scan(root)?;
        Ok(files
            .into_iter()
            .filter(|p| !self.config.blacklist.is_blocked(p))
            .collect())
    }

    fn load_from_container(
        &mut self,
        source: &Path,
        confirm: &dyn Fn(&Path) -> bool,
        progress: &Progress,
    ) -> Result<()> {
        let root = self.root()?;
        self.require_module()?;
        let meta = fs::metadata(source).map_err(|e| PhoenixError::unavailable(source, e))?;
        if !meta.is_file() {
            return Err(PhoenixError::unavailable(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let needs_clear = has_entries(&root);
        if needs_clear && !confirm(&root) {
            return Err(PhoenixError::WorkingDirectoryNotEmpty(root));
        }

        let private = tempfile::Builder::new().prefix("phoenix-src-").tempfile()?;
        fs::copy(source, private.path()).map_err(|e| PhoenixError::unavailable(source, e))?;

        let policy = ExtensionPolicy::new(
            self.config.fragment_extension.clone(),
            self.config.force_extension,
        );
        let Some(module) = self.module.as_mut() else {
            return Err(PhoenixError::Configuration("no module selected".into()));
        };
        let name = module.display_name();
        info!("Loading {:?} into {:?} as '{}'", source, root, name);

        progress.report("Initializing from file...", "Parsing...", 0, 1);
        let references = module.parse(private.path()).map_err(|e| match e {
            e @ PhoenixError::ModuleParse { .. } => e,
            other => PhoenixError::parse(name, source, other),
        })?;

        progress.report("Initializing from file...", "Numbering...", 1, 1);
        let paths = numbering::number(&root, &references, &policy)?;

        // fragments are written next to the working directory and moved in
        // only once every one of them is complete
        fs::create_dir_all(&root)?;
        let parent = root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new().prefix(".phoenix-stage-").tempdir_in(parent)?;

        let mut reader = BufReader::new(File::open(private.path())?);
        let mut position = 0u64;
        let total = references.len();
        let mut fragments = Vec::with_capacity(total);
        for (i, (reference, path)) in references.into_iter().zip(paths).enumerate() {
            progress.report("Saving files to working directory...", path.display(), i + 1, total);
            let staged = match path.strip_prefix(&root) {
                Ok(relative) => staging.path().join(relative),
                Err(_) => {
                    return Err(PhoenixError::Configuration(format!(
                        "fragment path {path:?} is outside {root:?}"
                    )))
                }
            };
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)?;
            }
            if reference.offset != position {
                reader.seek(SeekFrom::Start(reference.offset))?;
                position = reference.offset;
            }
            let mut out = OpenOptions::new().write(true).create_new(true).open(&staged)?;
            let copied = io::copy(&mut (&mut reader).take(reference.length), &mut out)?;
            position += copied;
            if copied != reference.length {
                return Err(PhoenixError::parse(
                    name,
                    source,
                    format!("fragment {:?} runs past the end of the container", reference.name),
                ));
            }
            fragments.push(Fragment::from_reference(&root, path, reference));
        }

        let cleared = if needs_clear { clear_directory(&root) } else { Ok(()) };
        if let Err(e) = cleared.and_then(|()| adopt_staged(staging.path(), &root)) {
            warn!("Could not move fragments into {:?}: {}", root, e);
            if let Err(cleanup) = clear_directory(&root) {
                warn!("Could not clear {:?}: {}", root, cleanup);
            }
            self.vfile = VirtualFile::new(&root);
            self.queue.clear();
            return Err(e);
        }

        self.vfile = VirtualFile::from_fragments(root, fragments);
        self.queue.clear();
        debug!("Wrote {} fragments", self.vfile.len());

        if self.config.validation_mode == ValidationMode::AfterChanges {
            let unchecked: Vec<usize> = self
                .vfile
                .iter()
                .enumerate()
                .filter(|(_, f)| f.validity == Validity::Unchecked)
                .map(|(i, _)| i)
                .collect();
            if !unchecked.is_empty() {
                let indexes = self.update_variables(unchecked, progress);
                self.revalidate(&indexes, progress);
            }
        }
        self.vfile.refresh_stamps();
        Ok(())
    }

    fn load_from_directory(&mut self, progress: &Progress) -> Result<()> {
        let root = self.root()?;
        self.require_module()?;
        info!("Loading working directory {:?}", root);

        fs::create_dir_all(&root)?;
        let files = self.scan(&root)?;
        let total = files.len();
        let mut vfile = VirtualFile::new(&root);
        for (i, path) in files.into_iter().enumerate() {
            progress.report("Initializing from directory...", path.display(), i + 1, total);
            vfile.insert_path(path);
        }
        self.vfile = vfile;
        self.queue.clear();

        let all: Vec<usize> = (0..self.vfile.len()).collect();
        let indexes = self.update_variables(all, progress);
        if self.config.validation_mode != ValidationMode::Never {
            self.revalidate(&indexes, progress);
        }
        self.vfile.refresh_stamps();
        Ok(())
    }

    /// Rebuild the map from the directory, keeping what is still known
    fn refresh(&mut self, progress: &Progress) -> Result<()> {
        let root = self.root()?;
        self.require_module()?;
        info!("Refreshing {:?}", root);

        let files = self.scan(&root)?;
        let before = self.vfile.paths();
        let total = files.len();
        let mut next = VirtualFile::new(&root);
        let mut differences = Vec::new();
        for (i, path) in files.into_iter().enumerate() {
            progress.report("Refreshing the working directory...", path.display(), i + 1, total);
            match self.vfile.get_by_path(&path) {
                Some(known) => {
                    let mut fragment = known.clone();
                    let edited = fragment.changed_on_disk();
                    if edited {
                        fragment.validity = Validity::Unchecked;
                    }
                    if edited || before.get(i) != Some(&path) {
                        differences.push(i);
                    }
                    next.insert(fragment);
                }
                None => {
                    next.insert_path(path);
                    differences.push(i);
                }
            }
        }
        self.vfile = next;
        self.queue.clear();

        let indexes = self.update_variables(differences, progress);
        if self.config.validation_mode != ValidationMode::Never {
            self.revalidate(&indexes, progress);
        } else {
            self.invalidate(&indexes, progress);
        }
        self.vfile.refresh_stamps();
        Ok(())
    }

    /// Let the module re-annotate from each index; returns the grown index set
    fn update_variables(&mut self, mut indexes: Vec<usize>, progress: &Progress) -> Vec<usize> {
        indexes.sort_unstable();
        indexes.dedup();
        let Some(module) = self.module.as_mut() else {
            return indexes;
        };
        if !module.uses_variables() {
            return indexes;
        }

        let fragments = self.vfile.fragments_mut();
        let len = fragments.len();
        let mut result: BTreeSet<usize> = indexes.iter().copied().filter(|&i| i < len).collect();
        let mut frontier = 0usize;

        for (n, &start) in indexes.iter().enumerate() {
            if start < frontier || start >= len {
                continue;
            }
            progress.report(
                "Updating Variables...",
                fragments[start].relative.display(),
                n + 1,
                indexes.len(),
            );

            let mut cursor = start;
            let mut changed = Vec::new();
            let mut rounds = 0usize;
            loop {
                match module.update_variables(fragments, &mut cursor, &mut changed) {
                    Ok(true) => {
                        rounds += 1;
                        if rounds > len + 1 {
                            warn!("Variable update from {} did not settle", start);
                            break;
                        }
                    }
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Variable update at {} failed: {}", cursor, e);
                        break;
                    }
                }
            }
            result.extend(changed.into_iter().filter(|&i| i < len));
            frontier = cursor.max(start + 1);
        }
        result.into_iter().collect()
    }

    /// Run the validity check for each index, ascending; failures are isolated
    fn revalidate(&mut self, indexes: &[usize], progress: &Progress) {
        let Some(module) = self.module.as_mut() else {
            return;
        };
        let fragments = self.vfile.fragments_mut();
        for (n, &i) in indexes.iter().enumerate() {
            let Some(fragment) = fragments.get(i) else {
                continue;
            };
            if !fragment.validity.needs_check() {
                continue;
            }
            progress.report("Re-Validating...", fragment.relative.display(), n + 1, indexes.len());
            if let Err(e) = module.update_validity(fragments, i) {
                let fault = PhoenixError::ValidationFault {
                    path: fragments[i].path.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", fault);
                fragments[i].mark(Validity::Error, e.to_string());
            }
        }
    }

    fn invalidate(&mut self, indexes: &[usize], progress: &Progress) {
        let fragments = self.vfile.fragments_mut();
        for (n, &i) in indexes.iter().enumerate() {
            if let Some(fragment) = fragments.get_mut(i) {
                progress.report("Invalidating...", fragment.relative.display(), n + 1, indexes.len());
                fragment.validity = Validity::Unchecked;
            }
        }
    }

    fn ingest(&mut self, event: FsEvent) -> WatchControl {
        if !self.enabled {
            return WatchControl::Ignored;
        }
        let Some(root) = self.config.working_directory.clone() else {
            return WatchControl::Ignored;
        };
        if self.config.blacklist.is_blocked(event.path()) {
            debug!("Blacklisted: {:?}", event.path());
            return WatchControl::Ignored;
        }

        match event {
            FsEvent::Deleted(path) if path == root => {
                warn!("Working directory {:?} was deleted, disabling", root);
                self.mark_disabled();
                WatchControl::Stop
            }
            FsEvent::Renamed { from, to } if from == root => {
                info!("Working directory moved {:?} -> {:?}", from, to);
                self.vfile.rebase(&to);
                self.queue.rebase(&from, &to);
                self.config.working_directory = Some(to.clone());
                WatchControl::Moved(to)
            }
            FsEvent::Created(path) => self.queue_created(&root, path),
            FsEvent::Changed(path) => match self.vfile.get_by_path(&path) {
                Some(fragment) if fragment.changed_on_disk() => {
                    self.queue.push(path, ChangeKind::Changed);
                    WatchControl::Accepted
                }
                _ => WatchControl::Ignored,
            },
            FsEvent::Deleted(path) => self.queue_deleted(path),
            FsEvent::Renamed { from, to } => {
                let old = self.queue_deleted(from);
                let new = self.queue_created(&root, to);
                if old == WatchControl::Accepted || new == WatchControl::Accepted {
                    WatchControl::Accepted
                } else {
                    WatchControl::Ignored
                }
            }
        }
    }

    fn queue_created(&mut self, root: &Path, path: PathBuf) -> WatchControl {
        if !path.starts_with(root) || path == root {
            return WatchControl::Ignored;
        }
        if path.is_dir() {
            let files = self.scan(&path).unwrap_or_default();
            if files.is_empty() {
                return WatchControl::Ignored;
            }
            for file in files {
                self.queue.push(file, ChangeKind::Created);
            }
        } else {
            self.queue.push(path, ChangeKind::Created);
        }
        WatchControl::Accepted
    }

    fn queue_deleted(&mut self, path: PathBuf) -> WatchControl {
        if self.vfile.contains(&path) {
            self.queue.push(path, ChangeKind::Deleted);
            return WatchControl::Accepted;
        }
        let dropped = self.queue.remove_under(&path);
        let tracked = self.vfile.tracked_under(&path);
        let any = dropped > 0 || !tracked.is_empty();
        for fragment in tracked {
            self.queue.push(fragment, ChangeKind::Deleted);
        }
        if any {
            WatchControl::Accepted
        } else {
            WatchControl::Ignored
        }
    }

    /// Apply queued changes and re-run the passes; false when nothing ran
    fn reconcile(&mut self, progress: &Progress) -> bool {
        if !self.enabled || self.queue.is_empty() {
            return false;
        }

        let before = self.vfile.paths();
        let changes = self.queue.drain();
        let total = changes.len();
        let mut touched = Vec::new();
        for (n, (path, kind)) in changes.into_iter().enumerate() {
            progress.report(
                "Updating Virtual File...",
                format!("{} {:?}", path.display(), kind),
                n + 1,
                total,
            );
            match kind {
                ChangeKind::Changed | ChangeKind::Created if self.vfile.contains(&path) => {
                    if let Some(fragment) = self.vfile.get_by_path_mut(&path) {
                        fragment.validity = Validity::Unchecked;
                    }
                    touched.push(path);
                }
                ChangeKind::Created => {
                    if path.is_file() {
                        self.vfile.insert_path(path);
                    }
                }
                ChangeKind::Changed => {}
                ChangeKind::Deleted => {
                    self.vfile.remove(&path);
                }
            }
        }

        let mut indexes = self.vfile.shifted_since(&before);
        indexes.extend(touched.iter().filter_map(|p| self.vfile.index_of(p)));
        let indexes = self.update_variables(indexes, progress);
        if self.config.validation_mode == ValidationMode::AfterChanges {
            self.revalidate(&indexes, progress);
        } else {
            self.invalidate(&indexes, progress);
        }
        self.vfile.refresh_stamps();
        info!("Reconciled {} changes, {} fragments re-checked", total, indexes.len());
        true
    }

    fn auto_save(&mut self, progress: &Progress) -> Result<Option<PathBuf>> {
        let wanted = match self.config.auto_save {
            AutoSaveMode::Off => false,
            AutoSaveMode::ValidOnly => self.vfile.all_acceptable(),
            AutoSaveMode::On => true,
        };
        if !wanted {
            return Ok(None);
        }
        let Some(path) = self.config.auto_save_path.clone() else {
            debug!("Auto-save enabled without a path");
            return Ok(None);
        };
        let dest = match self.config.file_naming_mode {
            FileNamingMode::Iterate => {
                let dest = next_free_name(&path)?;
                self.config.auto_save_path = Some(dest.clone());
                dest
            }
            FileNamingMode::Overwrite => path,
        };
        self.save(&dest, progress).map(Some)
    }

    fn save(&mut self, dest: &Path, progress: &Progress) -> Result<PathBuf> {
        self.require_module()?;
        info!("Saving {} fragments to {:?}", self.vfile.len(), dest);

        if self.config.validation_mode == ValidationMode::OnSave {
            let all: Vec<usize> = (0..self.vfile.len()).collect();
            self.revalidate(&all, progress);
            self.vfile.refresh_stamps();
        }
        if let Some(root) = &self.config.working_directory {
            if dest.starts_with(root) {
                warn!("Saving into the working directory; {:?} will become a fragment", dest);
            }
        }

        let mut assembled = tempfile::Builder::new().prefix("phoenix-out-").tempfile()?;
        let label = dest.display().to_string();
        let written = save::assemble(
            self.vfile.fragments(),
            assembled.as_file_mut(),
            &self.config.save_retry,
            progress,
            &label,
        )?;
        let assembled = assembled.into_temp_path();
        if let Some(module) = self.module.as_mut() {
            module.finalize(&assembled)?;
        }
        let kept = assembled.keep().map_err(|e| PhoenixError::Io(e.error))?;
        if let Err(e) = save::move_file(&kept, dest) {
            let _ = fs::remove_file(&kept);
            return Err(e);
        }
        debug!("Saved {} bytes", written);
        Ok(dest.to_path_buf())
    }
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Move every entry of `staging` into `root`
fn adopt_staged(staging: &Path, root: &Path) -> Result<()> {
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        fs::rename(entry.path(), root.join(entry.file_name()))?;
    }
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

struct Shared {
    state: Mutex<State>,
    observers: Mutex<Vec<Sender<SessionEvent>>>,
    progress: Progress,
    confirm_clear: Option<ConfirmClear>,
    registry: Registry,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        self.observers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn confirm(&self, root: &Path) -> bool {
        match &self.confirm_clear {
            Some(hook) => hook(root),
            None => false,
        }
    }

    /// Load from the container when one is configured, else from the directory
    fn auto_init(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.enabled {
            return Ok(());
        }
        st.require_module()?;
        st.root()?;
        match st.config.opened_file.clone() {
            Some(source) if st.config.can_load_file() => {
                st.load_from_container(&source, &|root| self.confirm(root), &self.progress)
            }
            _ => st.load_from_directory(&self.progress),
        }
    }

    fn ingest(&self, event: FsEvent) -> WatchControl {
        let control = self.state.lock().ingest(event);
        if control == WatchControl::Stop {
            self.emit(SessionEvent::Disabled);
        }
        control
    }

    fn flush(&self) -> Result<()> {
        let saved = {
            let mut st = self.state.lock();
            if !st.reconcile(&self.progress) {
                return Ok(());
            }
            self.emit(SessionEvent::VirtualFileUpdated);
            st.auto_save(&self.progress)
        };
        if let Some(path) = saved? {
            self.emit(SessionEvent::Saved(path));
        }
        Ok(())
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            warn!("Reconciliation failed: {}", e);
        }
    }

    fn save(&self, dest: &Path) -> Result<PathBuf> {
        let path = self.state.lock().save(dest, &self.progress)?;
        self.emit(SessionEvent::Saved(path.clone()));
        Ok(path)
    }
}

/// Live link between a working directory and its container
pub struct Session {
    shared: Arc<Shared>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    watch: bool,
}

impl Session {
    /// Session with the built-in registry, no progress sink and the OS watcher
    pub fn new(config: SessionConfig) -> Result<Self> {
        SessionBuilder::new(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> SessionConfig {
        self.shared.state.lock().config.clone()
    }

    /// Adjust non-structural settings (validation, auto-save, blacklist, delay)
    ///
    /// Module, opened file and working directory go through their setters so
    /// the session can re-initialise.
    pub fn configure(&self, f: impl FnOnce(&mut SessionConfig)) {
        let mut st = self.shared.state.lock();
        let module = st.config.module.clone();
        let opened = st.config.opened_file.clone();
        let root = st.config.working_directory.clone();
        f(&mut st.config);
        st.config.module = module;
        st.config.opened_file = opened;
        st.config.working_directory = root;
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    pub fn module_name(&self) -> Option<&'static str> {
        self.shared.state.lock().module_name()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Enable or disable live syncing
    ///
    /// Enabling without a module or working directory is a silent no-op. When
    /// the module or opened file changed since the last disable the session
    /// re-initialises, otherwise it refreshes from the directory.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if !enabled {
            self.disable();
            return Ok(());
        }

        let reinit = {
            let mut st = self.shared.state.lock();
            if st.enabled {
                return Ok(());
            }
            if st.module.is_none() || st.config.working_directory.is_none() {
                debug!("Not enabling: module or working directory missing");
                return Ok(());
            }
            st.enabled = true;
            st.last_generation != Some(st.generation) || st.last_opened_file != st.config.opened_file
        };
        info!("Session enabled ({})", if reinit { "initialising" } else { "refreshing" });

        let result = if reinit {
            self.shared.auto_init()
        } else {
            let mut st = self.shared.state.lock();
            st.refresh(&self.shared.progress)
        };
        match result {
            Ok(()) => {
                self.shared.emit(SessionEvent::VirtualFileUpdated);
                self.start_watcher()
            }
            Err(e) => {
                self.shared.state.lock().enabled = false;
                Err(e)
            }
        }
    }

    pub fn enable(&self) -> Result<()> {
        self.set_enabled(true)
    }

    /// Stop watching and drop queued changes; disabling never fails
    pub fn disable(&self) {
        let was_enabled = {
            let mut st = self.shared.state.lock();
            let was = st.enabled;
            if was {
                st.mark_disabled();
            }
            was
        };
        if was_enabled {
            self.stop_watcher();
            info!("Session disabled");
            self.shared.emit(SessionEvent::Disabled);
        }
    }

    /// Select a registry module by display name
    pub fn set_module(&self, name: &str) -> Result<()> {
        let options = self.shared.state.lock().config.module_options;
        let module = self.shared.registry.create(name, &options)?;
        self.set_module_instance(module)
    }

    /// Install an explicitly constructed module
    pub fn set_module_instance(&self, module: Box<dyn FormatModule>) -> Result<()> {
        let enabled = {
            let mut st = self.shared.state.lock();
            st.config.module = Some(module.display_name().to_string());
            st.module = Some(module);
            st.generation += 1;
            st.enabled
        };
        if enabled {
            self.reinitialize()
        } else {
            Ok(())
        }
    }

    /// Change module options; re-creates a registry module with them
    pub fn set_module_options(&self, options: crate::core::module::ModuleOptions) -> Result<()> {
        let name = {
            let mut st = self.shared.state.lock();
            st.config.module_options = options;
            st.config.module.clone()
        };
        match name {
            Some(name) if self.shared.registry.contains(&name) => self.set_module(&name),
            _ => Ok(()),
        }
    }

    /// Set the container to decompose; `None` switches to directory mode
    pub fn set_opened_file(&self, path: Option<PathBuf>) -> Result<()> {
        if let Some(p) = &path {
            fs::metadata(p).map_err(|e| PhoenixError::unavailable(p, e))?;
        }
        let enabled = {
            let mut st = self.shared.state.lock();
            if st.config.opened_file == path {
                return Ok(());
            }
            st.config.opened_file = path;
            st.enabled
        };
        if enabled {
            self.reinitialize()
        } else {
            Ok(())
        }
    }

    pub fn set_working_directory(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            debug!("Ignoring empty working directory");
            return Ok(());
        }
        let enabled = {
            let mut st = self.shared.state.lock();
            if st.config.working_directory.as_deref() == Some(path.as_path()) {
                return Ok(());
            }
            st.config.working_directory = Some(path);
            st.enabled
        };
        if enabled {
            self.reinitialize()
        } else {
            Ok(())
        }
    }

    fn reinitialize(&self) -> Result<()> {
        self.stop_watcher();
        let result = self.shared.auto_init();
        let restarted = self.start_watcher();
        match result {
            Ok(()) => {
                self.shared.emit(SessionEvent::VirtualFileUpdated);
                restarted
            }
            Err(e) if e.is_configuration() => {
                debug!("Re-initialisation skipped: {}", e);
                restarted
            }
            Err(e) => Err(e),
        }
    }

    /// Decompose `source` into the working directory right away
    ///
    /// Unlike enabling, this reports configuration problems as errors.
    pub fn load_from_container(&self, source: &Path) -> Result<()> {
        self.stop_watcher();
        let result = {
            let mut st = self.shared.state.lock();
            st.load_from_container(source, &|root| self.shared.confirm(root), &self.shared.progress)
        };
        self.after_load(result)
    }

    /// Adopt the working directory as an already decomposed container
    pub fn load_from_directory(&self) -> Result<()> {
        self.stop_watcher();
        let result = self.shared.state.lock().load_from_directory(&self.shared.progress);
        self.after_load(result)
    }

    /// Resync the map with the directory listing
    pub fn refresh(&self) -> Result<()> {
        self.stop_watcher();
        let result = self.shared.state.lock().refresh(&self.shared.progress);
        self.after_load(result)
    }

    fn after_load(&self, result: Result<()>) -> Result<()> {
        if result.is_ok() {
            self.shared.emit(SessionEvent::VirtualFileUpdated);
        }
        self.start_watcher()?;
        result
    }

    /// Full variable and validity pass over every fragment
    pub fn revalidate_all(&self) {
        let mut st = self.shared.state.lock();
        let all: Vec<usize> = (0..st.vfile.len()).collect();
        let indexes = st.update_variables(all, &self.shared.progress);
        st.revalidate(&indexes, &self.shared.progress);
        st.vfile.refresh_stamps();
        drop(st);
        self.shared.emit(SessionEvent::VirtualFileUpdated);
    }

    /// Feed one filesystem notification; returns whether it was queued
    pub fn handle_event(&self, event: FsEvent) -> bool {
        match self.shared.ingest(event) {
            WatchControl::Ignored => false,
            WatchControl::Accepted => true,
            WatchControl::Moved(_) => {
                if let Err(e) = self.start_watcher() {
                    warn!("Cannot watch moved working directory: {}", e);
                }
                true
            }
            WatchControl::Stop => {
                self.stop_watcher();
                true
            }
        }
    }

    /// Reconcile queued changes now instead of waiting for the debounce
    pub fn flush_changes(&self) -> Result<()> {
        self.shared.flush()
    }

    pub fn pending_changes(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Reassemble the container at `dest`
    pub fn save(&self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        self.shared.save(dest.as_ref())
    }

    /// Reassemble on a background thread
    pub fn spawn_save(&self, dest: impl Into<PathBuf>) -> JoinHandle<Result<PathBuf>> {
        let shared = Arc::clone(&self.shared);
        let dest = dest.into();
        thread::spawn(move || shared.save(&dest))
    }

    /// Save to a private temp file and open it as the new container
    pub fn flatten_and_reload(&self) -> Result<()> {
        info!("Flattening and reloading");
        self.stop_watcher();
        let result = (|| -> Result<()> {
            let mut st = self.shared.state.lock();
            st.flatten_temp = None;
            let suffix = st
                .config
                .opened_file
                .as_ref()
                .and_then(|p| p.extension())
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let temp = tempfile::Builder::new()
                .prefix("phoenix-flat-")
                .suffix(&suffix)
                .tempfile()?
                .into_temp_path();
            st.save(&temp, &self.shared.progress)?;
            let path = temp.to_path_buf();
            st.config.opened_file = Some(path.clone());
            st.flatten_temp = Some(temp);
            if st.enabled {
                st.load_from_container(&path, &|_| true, &self.shared.progress)?;
            }
            Ok(())
        })();
        self.after_load(result)
    }

    /// Snapshot of every fragment
    pub fn fragments(&self) -> Vec<Fragment> {
        self.shared.state.lock().vfile.fragments().to_vec()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().vfile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the live map while holding the session lock
    pub fn with_virtual_file<R>(&self, f: impl FnOnce(&VirtualFile) -> R) -> R {
        f(&self.shared.state.lock().vfile)
    }

    /// Receive session events from now on
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel::unbounded();
        self.shared.observers.lock().push(tx);
        rx
    }

    pub fn report(&self) -> SessionReport {
        let st = self.shared.state.lock();
        SessionReport::build(
            &st.vfile,
            st.module_name(),
            st.config.working_directory.clone(),
            st.enabled,
        )
    }

    pub fn report_json(&self) -> Result<String> {
        self.report().to_json()
    }

    fn start_watcher(&self) -> Result<()> {
        if !self.watch {
            return Ok(());
        }
        let (root, delay) = {
            let st = self.shared.state.lock();
            if !st.enabled {
                return Ok(());
            }
            match st.config.working_directory.clone() {
                Some(root) => (root, st.config.update_delay()),
                None => return Ok(()),
            }
        };

        let mut slot = self.watcher.lock();
        if let Some(mut old) = slot.take() {
            old.stop();
        }
        let events = Arc::clone(&self.shared);
        let settle = Arc::clone(&self.shared);
        let watcher = DirectoryWatcher::start(
            root,
            delay,
            move |event| events.ingest(event),
            move || settle.flush_logged(),
        )?;
        *slot = Some(watcher);
        Ok(())
    }

    fn stop_watcher(&self) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    module: Option<Box<dyn FormatModule>>,
    registry: Registry,
    progress: Option<ProgressSink>,
    confirm_clear: Option<ConfirmClear>,
    watch: bool,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        SessionBuilder {
            config,
            module: None,
            registry: Registry::builtin(),
            progress: None,
            confirm_clear: None,
            watch: true,
        }
    }

    /// Use this module instead of looking `config.module` up
    pub fn module(mut self, module: Box<dyn FormatModule>) -> Self {
        self.module = Some(module);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(ProgressInfo) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }

    pub fn confirm_clear<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.confirm_clear = Some(Arc::new(hook));
        self
    }

    /// Clear non-empty working directories without asking
    pub fn always_clear(self) -> Self {
        self.confirm_clear(|_| true)
    }

    /// Only reconcile events passed to [`Session::handle_event`]
    pub fn without_watcher(mut self) -> Self {
        self.watch = false;
        self
    }

    pub fn build(self) -> Result<Session> {
        let mut config = self.config;
        let module = match self.module {
            Some(module) => {
                config.module = Some(module.display_name().to_string());
                Some(module)
            }
            None => match &config.module {
                Some(name) => Some(self.registry.create(name, &config.module_options)?),
                None => None,
            },
        };
        let root = config.working_directory.clone().unwrap_or_default();

        Ok(Session {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    module,
                    generation: 0,
                    vfile: VirtualFile::new(root),
                    queue: ChangeQueue::new(),
                    enabled: false,
                    last_generation: None,
                    last_opened_file: None,
                    flatten_temp: None,
                }),
                observers: Mutex::new(Vec::new()),
                progress: Progress::new(self.progress),
                confirm_clear: self.confirm_clear,
                registry: self.registry,
            }),
            watcher: Mutex::new(None),
            watch: self.watch,
        })
    }
}
