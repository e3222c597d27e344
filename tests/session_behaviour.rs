//! Session behaviour outside the format modules: registry, config, save
//! retries and the live OS watcher

mod common;

use common::*;
use phoenix_rs::formats::icon::{EntryField, IconField};
use phoenix_rs::{
    FsEvent, Metadata, ModuleOptions, PhoenixError, Registry, RetryPolicy, Session, SessionConfig,
    SessionEvent, Validity,
};
use std::fs;
use std::time::{Duration, Instant};

#[test]
fn test_filter_indexes_map_back_to_modules() {
    let registry = Registry::builtin();
    let filters = registry.open_dialog_filters();
    assert!(filters.len() >= registry.names().len());

    let mut sorted = filters.clone();
    sorted.sort();
    assert_eq!(sorted, filters);

    for i in 0..filters.len() {
        let owner = registry.module_for_filter_index(i).unwrap();
        assert!(registry.contains(owner));
    }
    assert_eq!(registry.module_for_filter_index(filters.len()), None);
}

#[test]
fn test_unknown_module_is_rejected() {
    let registry = Registry::builtin();
    assert!(matches!(
        registry.create("Teletext", &ModuleOptions::default()),
        Err(PhoenixError::UnknownModule(name)) if name == "Teletext"
    ));
}

#[test]
fn test_config_survives_toml_file() {
    let ws = Workspace::new("min.png", &minimal_png());
    let config = ws
        .config(PNG)
        .with_update_delay(Duration::from_millis(75))
        .with_module_options(ModuleOptions::report_only());

    let path = ws.path("phoenix.toml");
    config.save(&path).unwrap();
    let loaded = SessionConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.update_delay(), Duration::from_millis(75));
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = SessionConfig::from_toml_str(
        r#"
        module = "Network Graphics"
        update_delay_ms = 10
        "#,
    )
    .unwrap();
    assert_eq!(config.module.as_deref(), Some(PNG));
    assert_eq!(config.update_delay_ms, 10);
    assert_eq!(config.fragment_extension, "bin");
    assert_eq!(config.save_retry, RetryPolicy::default());
}

#[test]
fn test_unreadable_fragment_times_out() {
    let ws = Workspace::new("min.png", &minimal_png());
    let config = ws.config(PNG).with_save_retry(RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    });
    let session = ws.session_with(config);

    // a directory in place of the file reads as an error other than NotFound
    let victim = session.fragments()[1].path.clone();
    fs::remove_file(&victim).unwrap();
    fs::create_dir(&victim).unwrap();

    let err = session.save(ws.path("out.png")).unwrap_err();
    assert!(
        matches!(&err, PhoenixError::LockTimeout { path, attempts: 3 } if *path == victim),
        "{err:?}"
    );
}

#[test]
fn test_blacklisted_junk_never_queues() {
    let ws = Workspace::new("min.png", &minimal_png());
    let session = ws.session(PNG, ModuleOptions::default());

    let junk = ws.root.join("1 - Chunk 1").join(".DS_Store");
    fs::write(&junk, b"junk").unwrap();
    assert!(!session.handle_event(FsEvent::Created(junk)));
    assert_eq!(session.pending_changes(), 0);

    session.refresh().unwrap();
    assert!(session
        .fragments()
        .iter()
        .all(|f| f.path.file_name().is_some_and(|n| n != ".DS_Store")));
}

#[test]
fn test_report_json_lists_every_fragment() {
    let ws = Workspace::new("two.ico", &icon(&[&[1; 4], &[2; 4]]));
    let session = ws.session(ICON, ModuleOptions::default());

    let json: serde_json::Value = serde_json::from_str(&session.report_json().unwrap()).unwrap();
    assert_eq!(json["module"], ICON);
    assert_eq!(json["fragments"].as_array().unwrap().len(), session.len());
    assert_eq!(json["enabled"], true);
}

#[test]
fn test_switching_module_options_resplits() {
    let ws = Workspace::new("min.png", &minimal_png());
    let session = ws.session(PNG, ModuleOptions::report_only());
    let before = session.fragments();

    session.set_module_options(ModuleOptions::default()).unwrap();
    assert_eq!(session.config().module_options, ModuleOptions::default());
    assert_eq!(session.fragments().len(), before.len());
    assert!(session
        .fragments()
        .iter()
        .all(|f| f.validity == Validity::Valid));
}

#[test]
fn test_live_watcher_reconciles_edits() {
    let ws = Workspace::new("two.ico", &icon(&[&[1; 8], &[2; 8]]));
    let config = ws.config(ICON).with_update_delay(Duration::from_millis(50));
    let session = Session::builder(config).always_clear().build().unwrap();
    session.enable().unwrap();
    let events = session.subscribe();

    let payload = fragment(&session, &Metadata::Icon(IconField::Payload { image: 1 }));
    fs::write(&payload.path, [1; 3]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut updated = false;
    while Instant::now() < deadline {
        if let Ok(SessionEvent::VirtualFileUpdated) =
            events.recv_timeout(Duration::from_millis(100))
        {
            updated = true;
            break;
        }
    }
    assert!(updated, "watcher never reconciled the edit");
    let length = fragment(
        &session,
        &Metadata::Icon(IconField::Entry {
            image: 1,
            field: EntryField::Length,
        }),
    );
    assert_eq!(length.validity, Validity::Valid, "{}", length.description);
    assert_eq!(fs::read(&length.path).unwrap(), 3u32.to_le_bytes());

    session.disable();
    assert!(!session.is_enabled());
}
