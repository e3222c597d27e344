use super::*;
use crate::core::fragment::FragmentReference;
use crate::core::pattern::Blacklist;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const RECORD: usize = 4;

/// Fixed-width record format: every 4 bytes is one fragment
struct Records {
    checks: Arc<AtomicUsize>,
}

impl FormatModule for Records {
    fn display_name(&self) -> &'static str {
        "Records"
    }

    fn save_filters(&self) -> Vec<String> {
        vec!["Records (*.rec)|*.rec".to_string()]
    }

    fn parse(&mut self, path: &Path) -> Result<Vec<FragmentReference>> {
        let bytes = fs::read(path)?;
        if bytes.first() == Some(&b'!') {
            return Err(PhoenixError::parse("Records", path, "bad marker"));
        }
        let mut references: Vec<FragmentReference> = bytes
            .chunks(RECORD)
            .enumerate()
            .map(|(i, chunk)| {
                FragmentReference::new((i * RECORD) as u64, chunk.len() as u64, &[format!("Record {i}")])
            })
            .collect();
        // `#` claims one more record than the file holds
        if bytes.first() == Some(&b'#') {
            references.push(FragmentReference::new(bytes.len() as u64, RECORD as u64, &["Record overrun"]));
        }
        Ok(references)
    }

    fn update_validity(&mut self, fragments: &mut [Fragment], index: usize) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let size = fragments[index].size()?;
        let validity = Validity::from_bool(size == RECORD as u64, Validity::HardInvalid);
        fragments[index].mark(validity, format!("{size} bytes"));
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    source: PathBuf,
    root: PathBuf,
    out: PathBuf,
    checks: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(contents: &[u8]) -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("input.rec");
        fs::write(&source, contents).unwrap();
        Fixture {
            source,
            root: dir.path().join("work"),
            out: dir.path().join("out.rec"),
            checks: Arc::new(AtomicUsize::new(0)),
            _dir: dir,
        }
    }

    fn config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_opened_file(&self.source)
            .with_working_directory(&self.root)
            .with_blacklist(Blacklist::new(["*/Thumbs.db"]))
    }

    fn session(&self, config: SessionConfig) -> Session {
        Session::builder(config)
            .module(Box::new(Records {
                checks: Arc::clone(&self.checks),
            }))
            .without_watcher()
            .build()
            .unwrap()
    }

    fn enabled(&self) -> Session {
        let session = self.session(self.config());
        session.enable().unwrap();
        session
    }
}

#[test]
fn test_enable_loads_container() {
    let fx = Fixture::new(b"aaaabbbbcccc");
    let session = fx.enabled();

    assert!(session.is_enabled());
    assert_eq!(session.len(), 3);
    let fragments = session.fragments();
    assert!(fragments.iter().all(|f| f.validity == Validity::Valid));
    assert_eq!(fs::read(&fragments[1].path).unwrap(), b"bbbb");
    assert!(fragments[0].relative.to_string_lossy().ends_with("Record 0.bin"));
}

#[test]
fn test_save_reassembles() {
    let fx = Fixture::new(b"aaaabbbbcc");
    let session = fx.enabled();
    let events = session.subscribe();

    let saved = session.save(&fx.out).unwrap();
    assert_eq!(saved, fx.out);
    assert_eq!(fs::read(&fx.out).unwrap(), b"aaaabbbbcc");
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Saved(fx.out.clone()));
}

#[test]
fn test_spawn_save() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    let path = session.spawn_save(fx.out.clone()).join().unwrap().unwrap();
    assert_eq!(fs::read(path).unwrap(), b"aaaabbbb");
}

#[test]
fn test_refuses_to_clear_without_confirmation() {
    let fx = Fixture::new(b"aaaa");
    fs::create_dir_all(&fx.root).unwrap();
    fs::write(fx.root.join("keep.txt"), b"mine").unwrap();

    let session = fx.session(fx.config());
    let err = session.enable().unwrap_err();
    assert!(matches!(err, PhoenixError::WorkingDirectoryNotEmpty(_)));
    assert!(!session.is_enabled());
    assert_eq!(fs::read(fx.root.join("keep.txt")).unwrap(), b"mine");
}

#[test]
fn test_confirmed_clear_replaces_contents() {
    let fx = Fixture::new(b"aaaa");
    fs::create_dir_all(fx.root.join("old")).unwrap();
    fs::write(fx.root.join("old/stale.bin"), b"x").unwrap();

    let session = Session::builder(fx.config())
        .module(Box::new(Records {
            checks: Arc::clone(&fx.checks),
        }))
        .always_clear()
        .without_watcher()
        .build()
        .unwrap();
    session.enable().unwrap();
    assert!(!fx.root.join("old").exists());
    assert_eq!(session.len(), 1);
}

#[test]
fn test_parse_failure_leaves_directory() {
    let fx = Fixture::new(b"!bad");
    fs::create_dir_all(&fx.root).unwrap();
    fs::write(fx.root.join("keep.txt"), b"mine").unwrap();

    let session = Session::builder(fx.config())
        .module(Box::new(Records {
            checks: Arc::clone(&fx.checks),
        }))
        .always_clear()
        .without_watcher()
        .build()
        .unwrap();
    let err = session.load_from_container(&fx.source).unwrap_err();
    assert!(matches!(err, PhoenixError::ModuleParse { .. }));
    assert!(fx.root.join("keep.txt").exists());
}

#[test]
fn test_short_container_keeps_previous_fragments() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = Session::builder(fx.config())
        .module(Box::new(Records {
            checks: Arc::clone(&fx.checks),
        }))
        .always_clear()
        .without_watcher()
        .build()
        .unwrap();
    session.enable().unwrap();
    let before = session.fragments();

    let short = fx.root.parent().unwrap().join("short.rec");
    fs::write(&short, b"#aaabbbb").unwrap();
    let err = session.load_from_container(&short).unwrap_err();
    assert!(matches!(err, PhoenixError::ModuleParse { .. }), "{err:?}");

    let paths: Vec<PathBuf> = before.iter().map(|f| f.path.clone()).collect();
    let after: Vec<PathBuf> = session.fragments().iter().map(|f| f.path.clone()).collect();
    assert_eq!(after, paths);
    assert_eq!(VirtualFile::scan(&fx.root).unwrap(), paths);
    assert_eq!(fs::read(&before[1].path).unwrap(), b"bbbb");
    let leftovers: Vec<_> = fs::read_dir(fx.root.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".phoenix-stage-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_short_container_into_empty_directory_writes_nothing() {
    let fx = Fixture::new(b"#aaabbbb");
    let session = fx.session(fx.config());
    let err = session.load_from_container(&fx.source).unwrap_err();
    assert!(matches!(err, PhoenixError::ModuleParse { .. }), "{err:?}");
    assert!(session.is_empty());
    assert!(VirtualFile::scan(&fx.root).unwrap().is_empty());
}

#[test]
fn test_disable_is_idempotent() {
    let fx = Fixture::new(b"aaaa");
    let session = fx.enabled();
    let events = session.subscribe();

    session.disable();
    session.disable();
    session.set_enabled(false).unwrap();
    assert!(!session.is_enabled());
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Disabled);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_missing_source() {
    let fx = Fixture::new(b"aaaa");
    let session = fx.session(fx.config());
    let err = session.load_from_container(&fx.root.join("nope.rec")).unwrap_err();
    assert!(matches!(err, PhoenixError::SourceUnavailable { .. }));
}

#[test]
fn test_enable_without_module_is_noop() {
    let fx = Fixture::new(b"aaaa");
    let session = Session::builder(fx.config()).without_watcher().build().unwrap();
    session.enable().unwrap();
    assert!(!session.is_enabled());
    assert!(session.is_empty());
}

#[test]
fn test_changed_fragment_is_revalidated() {
    let fx = Fixture::new(b"aaaabbbbcccc");
    let session = fx.enabled();
    let target = session.fragments()[1].path.clone();

    fs::write(&target, b"bb").unwrap();
    assert!(session.handle_event(FsEvent::Changed(target.clone())));
    assert_eq!(session.pending_changes(), 1);

    let before = fx.checks.load(Ordering::SeqCst);
    session.flush_changes().unwrap();
    assert_eq!(session.pending_changes(), 0);
    assert_eq!(fx.checks.load(Ordering::SeqCst), before + 1);

    let fragments = session.fragments();
    assert_eq!(fragments[1].validity, Validity::HardInvalid);
    assert_eq!(fragments[1].description, "2 bytes");
    assert_eq!(fragments[0].validity, Validity::Valid);
}

#[test]
fn test_unchanged_stamp_is_ignored() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    let target = session.fragments()[0].path.clone();
    assert!(!session.handle_event(FsEvent::Changed(target)));
    assert_eq!(session.pending_changes(), 0);
}

#[test]
fn test_deleted_fragment_shifts_the_rest() {
    let fx = Fixture::new(b"aaaabbbbcccc");
    let session = fx.enabled();
    let first = session.fragments()[0].path.clone();

    fs::remove_file(&first).unwrap();
    assert!(session.handle_event(FsEvent::Deleted(first)));
    session.flush_changes().unwrap();

    assert_eq!(session.len(), 2);
    session.save(&fx.out).unwrap();
    assert_eq!(fs::read(&fx.out).unwrap(), b"bbbbcccc");
}

#[test]
fn test_created_fragment_is_inserted_in_order() {
    let fx = Fixture::new(b"aaaacccc");
    let session = fx.enabled();
    let extra = fx.root.join("0 - Record 0z.bin");
    fs::write(&extra, b"bbbb").unwrap();

    assert!(session.handle_event(FsEvent::Created(extra.clone())));
    session.flush_changes().unwrap();

    let fragments = session.fragments();
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[1].path, extra);
    assert_eq!(fragments[1].validity, Validity::Valid);
    session.save(&fx.out).unwrap();
    assert_eq!(fs::read(&fx.out).unwrap(), b"aaaabbbbcccc");
}

#[test]
fn test_blacklisted_and_foreign_paths_are_ignored() {
    let fx = Fixture::new(b"aaaa");
    let session = fx.enabled();
    let junk = fx.root.join("Thumbs.db");
    fs::write(&junk, b"junk").unwrap();

    assert!(!session.handle_event(FsEvent::Created(junk)));
    assert!(!session.handle_event(FsEvent::Created(fx.out.clone())));
    assert_eq!(session.pending_changes(), 0);
}

#[test]
fn test_disable_clears_queue_and_ignores_events() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    let target = session.fragments()[0].path.clone();
    fs::write(&target, b"a").unwrap();
    assert!(session.handle_event(FsEvent::Changed(target.clone())));

    let events = session.subscribe();
    session.disable();
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Disabled);
    assert_eq!(session.pending_changes(), 0);
    assert!(!session.handle_event(FsEvent::Changed(target)));
}

#[test]
fn test_reenable_refreshes_out_of_band_edits() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    session.disable();

    let target = session.fragments()[1].path.clone();
    fs::write(&target, b"bbbbbb").unwrap();
    session.enable().unwrap();

    let fragments = session.fragments();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[1].validity, Validity::HardInvalid);
}

#[test]
fn test_deleted_root_disables() {
    let fx = Fixture::new(b"aaaa");
    let session = fx.enabled();
    let events = session.subscribe();

    assert!(session.handle_event(FsEvent::Deleted(fx.root.clone())));
    assert!(!session.is_enabled());
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Disabled);
}

#[test]
fn test_renamed_root_rebases() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    let moved = fx.root.with_file_name("moved");
    fs::rename(&fx.root, &moved).unwrap();

    assert!(session.handle_event(FsEvent::Renamed {
        from: fx.root.clone(),
        to: moved.clone(),
    }));
    assert_eq!(session.config().working_directory, Some(moved.clone()));
    assert!(session.fragments().iter().all(|f| f.path.starts_with(&moved)));
    session.save(&fx.out).unwrap();
    assert_eq!(fs::read(&fx.out).unwrap(), b"aaaabbbb");
}

#[test]
fn test_never_validation_resets_to_unchecked() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.session(fx.config().with_validation_mode(ValidationMode::Never));
    session.enable().unwrap();
    let target = session.fragments()[0].path.clone();

    fs::write(&target, b"a").unwrap();
    session.handle_event(FsEvent::Changed(target));
    session.flush_changes().unwrap();
    assert_eq!(session.fragments()[0].validity, Validity::Unchecked);
}

#[test]
fn test_auto_save_valid_only() {
    let fx = Fixture::new(b"aaaabbbb");
    let config = fx
        .config()
        .with_auto_save(AutoSaveMode::ValidOnly, &fx.out, FileNamingMode::Overwrite);
    let session = fx.session(config);
    session.enable().unwrap();
    let target = session.fragments()[0].path.clone();

    fs::write(&target, b"a").unwrap();
    session.handle_event(FsEvent::Changed(target.clone()));
    session.flush_changes().unwrap();
    assert!(!fx.out.exists());

    fs::write(&target, b"zzzz").unwrap();
    session.handle_event(FsEvent::Changed(target));
    session.flush_changes().unwrap();
    assert_eq!(fs::read(&fx.out).unwrap(), b"zzzzbbbb");
}

#[test]
fn test_auto_save_iterates_names() {
    let fx = Fixture::new(b"aaaa");
    fs::write(&fx.out, b"existing").unwrap();
    let config = fx
        .config()
        .with_auto_save(AutoSaveMode::On, &fx.out, FileNamingMode::Iterate);
    let session = fx.session(config);
    session.enable().unwrap();
    let target = session.fragments()[0].path.clone();

    fs::write(&target, b"bb").unwrap();
    session.handle_event(FsEvent::Changed(target));
    session.flush_changes().unwrap();

    assert_eq!(fs::read(&fx.out).unwrap(), b"existing");
    assert_eq!(fs::read(fx.out.with_file_name("out(1).rec")).unwrap(), b"bb");
}

#[test]
fn test_save_fails_fast_on_missing_fragment() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = fx.enabled();
    fs::remove_file(&session.fragments()[0].path).unwrap();

    let err = session.save(&fx.out).unwrap_err();
    assert!(matches!(err, PhoenixError::SourceUnavailable { .. }));
    assert!(!fx.out.exists());
}

#[test]
fn test_load_from_directory() {
    let fx = Fixture::new(b"");
    fs::create_dir_all(fx.root.join("b")).unwrap();
    fs::write(fx.root.join("a.bin"), b"aaaa").unwrap();
    fs::write(fx.root.join("b/c.bin"), b"cc").unwrap();

    let config = SessionConfig::default().with_working_directory(&fx.root);
    let session = fx.session(config);
    session.enable().unwrap();

    let fragments = session.fragments();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].validity, Validity::Valid);
    assert_eq!(fragments[1].validity, Validity::HardInvalid);
}

#[test]
fn test_flatten_and_reload() {
    let fx = Fixture::new(b"aaaabbbb");
    let session = Session::builder(fx.config())
        .module(Box::new(Records {
            checks: Arc::clone(&fx.checks),
        }))
        .always_clear()
        .without_watcher()
        .build()
        .unwrap();
    session.enable().unwrap();
    let extra = fx.root.join("2 - Record 2.bin");
    fs::write(&extra, b"cccc").unwrap();
    session.refresh().unwrap();
    assert_eq!(session.len(), 3);

    session.flatten_and_reload().unwrap();
    assert_eq!(session.len(), 3);
    let opened = session.config().opened_file.unwrap();
    assert_eq!(fs::read(opened).unwrap(), b"aaaabbbbcccc");
}

#[test]
fn test_progress_sink_receives_ticks() {
    let fx = Fixture::new(b"aaaabbbb");
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ticks);
    let session = Session::builder(fx.config())
        .module(Box::new(Records {
            checks: Arc::clone(&fx.checks),
        }))
        .progress(move |info| sink.lock().push(info))
        .without_watcher()
        .build()
        .unwrap();
    session.enable().unwrap();

    let ticks = ticks.lock();
    assert!(ticks.iter().any(|t| t.method == "Saving files to working directory..."));
    assert!(ticks.iter().all(|t| t.percent <= 100));
}

#[test]
fn test_report() {
    let fx = Fixture::new(b"aaaabb");
    let session = fx.enabled();
    let report = session.report();
    assert_eq!(report.module.as_deref(), Some("Records"));
    assert!(report.enabled);
    assert!(!report.is_acceptable());
    assert_eq!(report.counts.get("hard-invalid"), Some(&1));

    let json: serde_json::Value = serde_json::from_str(&session.report_json().unwrap()).unwrap();
    assert_eq!(json["fragments"].as_array().unwrap().len(), 2);
}
