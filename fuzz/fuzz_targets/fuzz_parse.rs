#![no_main]
use libfuzzer_sys::fuzz_target;
use phoenix_rs::core::fragment::covers_contiguously;
use phoenix_rs::{ModuleOptions, Registry};

// Every module either rejects the input or tiles it exactly
fuzz_target!(|data: &[u8]| {
    let Ok(file) = tempfile::NamedTempFile::new() else {
        return;
    };
    if std::fs::write(file.path(), data).is_err() {
        return;
    }

    let registry = Registry::builtin();
    for name in registry.names() {
        let Ok(mut module) = registry.create(name, &ModuleOptions::default()) else {
            continue;
        };
        if let Ok(refs) = module.parse(file.path()) {
            assert!(covers_contiguously(&refs, data.len() as u64), "{name}");
        }
    }
});
