#![no_main]
use libfuzzer_sys::fuzz_target;
use phoenix_rs::core::numbering::{number, ExtensionPolicy};
use phoenix_rs::FragmentReference;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    names: Vec<Vec<String>>,
    extension: String,
    force: bool,
}

fuzz_target!(|input: Input| {
    let refs: Vec<_> = input
        .names
        .iter()
        .enumerate()
        .map(|(i, n)| FragmentReference::new(i as u64, 1, n))
        .collect();
    let policy = ExtensionPolicy::new(input.extension, input.force);

    if let Ok(paths) = number(Path::new("/w"), &refs, &policy) {
        assert_eq!(paths.len(), refs.len());
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
    }
});
