//! Working directory watcher with debounce
//!
//! The OS callback only forwards raw events into a channel. A worker thread
//! translates them to [`FsEvent`]s, hands them to the session, and fires the
//! settle callback once no accepted event arrived for the configured delay.

use super::changes::FsEvent;
use crate::error::Result;
use crossbeam::channel::{self, RecvTimeoutError};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What the worker should do after an event was handed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchControl {
    /// Filtered out; does not reset the debounce timer
    Ignored,
    /// Queued; (re)start the debounce timer
    Accepted,
    /// Working directory moved; watch the new location
    Moved(PathBuf),
    /// Session disabled itself
    Stop,
}

const MAX_TICK: Duration = Duration::from_millis(50);

/// Background watcher for one working directory
pub(crate) struct DirectoryWatcher {
    worker: Option<JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
}

impl DirectoryWatcher {
    /// Watch `root` recursively until stopped
    ///
    /// `on_event` runs for every translated event, `on_settle` once activity
    /// has been quiet for `delay`.
    pub(crate) fn start<E, S>(
        root: PathBuf,
        delay: Duration,
        on_event: E,
        on_settle: S,
    ) -> Result<Self>
    where
        E: Fn(FsEvent) -> WatchControl + Send + 'static,
        S: Fn() + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        debug!("Watching {:?} (delay {:?})", root, delay);

        let running = Arc::new(Mutex::new(true));
        let flag = Arc::clone(&running);
        let tick = delay.clamp(Duration::from_millis(1), MAX_TICK);

        let worker = thread::spawn(move || {
            let mut watcher = watcher;
            let mut root = root;
            let mut pending_since: Option<Instant> = None;

            while *flag.lock() {
                match rx.recv_timeout(tick) {
                    Ok(Ok(event)) => {
                        for fs_event in translate(event) {
                            match on_event(fs_event) {
                                WatchControl::Ignored => {}
                                WatchControl::Accepted => pending_since = Some(Instant::now()),
                                WatchControl::Moved(new_root) => {
                                    let _ = watcher.unwatch(&root);
                                    if let Err(e) = watcher.watch(&new_root, RecursiveMode::Recursive) {
                                        warn!("Cannot follow working directory to {:?}: {}", new_root, e);
                                    }
                                    root = new_root;
                                }
                                WatchControl::Stop => {
                                    *flag.lock() = false;
                                    pending_since = None;
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => warn!("Watcher error: {}", e),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if pending_since.is_some_and(|since| since.elapsed() >= delay) {
                    pending_since = None;
                    on_settle();
                }
            }
            debug!("Watcher for {:?} stopped", root);
        });

        Ok(DirectoryWatcher {
            worker: Some(worker),
            running,
        })
    }

    /// Stop the worker and wait for it
    pub(crate) fn stop(&mut self) {
        *self.running.lock() = false;

        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a raw notification to create/change/delete/rename events
pub(crate) fn translate(event: Event) -> Vec<FsEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FsEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![FsEvent::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FsEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FsEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|p| {
                if p.exists() {
                    FsEvent::Created(p)
                } else {
                    FsEvent::Deleted(p)
                }
            })
            .collect(),
        EventKind::Modify(_) | EventKind::Any => paths.into_iter().map(FsEvent::Changed).collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}
