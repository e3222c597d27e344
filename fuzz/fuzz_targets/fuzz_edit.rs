#![no_main]
use libfuzzer_sys::fuzz_target;
use phoenix_rs::{FsEvent, ModuleOptions, Session, SessionConfig};

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    container: Vec<u8>,
    module: u8,
    target: u16,
    replacement: Vec<u8>,
    fixes: bool,
}

// Overwrite one fragment of a split container and reconcile
fuzz_target!(|input: Input| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let container = dir.path().join("in.bin");
    if std::fs::write(&container, &input.container).is_err() {
        return;
    }

    let names = phoenix_rs::Registry::builtin().names();
    let module = names[input.module as usize % names.len()];
    let options = if input.fixes {
        ModuleOptions::default()
    } else {
        ModuleOptions::report_only()
    };
    let config = SessionConfig::default()
        .with_module(module)
        .with_opened_file(&container)
        .with_working_directory(dir.path().join("work"))
        .with_module_options(options);

    let Ok(session) = Session::builder(config)
        .always_clear()
        .without_watcher()
        .build()
    else {
        return;
    };
    if session.enable().is_err() || session.is_empty() {
        return;
    }

    let fragments = session.fragments();
    let victim = &fragments[input.target as usize % fragments.len()];
    let mut bytes = input.replacement;
    // the stamp check needs a size change
    if bytes.len() as u64 == victim.size().unwrap_or(0) {
        bytes.push(0);
    }
    if std::fs::write(&victim.path, &bytes).is_err() {
        return;
    }
    session.handle_event(FsEvent::Changed(victim.path.clone()));
    let _ = session.flush_changes();
    let _ = session.save(dir.path().join("out.bin"));
});
