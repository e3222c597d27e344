//! Property-based tests for numbering, CRC and parser coverage

use phoenix_rs::core::crc;
use phoenix_rs::core::fragment::covers_contiguously;
use phoenix_rs::core::numbering::{number, ExtensionPolicy};
use phoenix_rs::{FragmentReference, ModuleOptions, Registry};
use proptest::prelude::*;
use std::collections::HashSet;
use std::path::Path;

fn names() -> impl Strategy<Value = Vec<Vec<String>>> {
    let segment = "[A-Za-z][A-Za-z0-9 ]{0,6}";
    prop::collection::vec(prop::collection::vec(segment, 1..4), 1..40)
}

/// Keep only names where no reference is the directory of another
fn leaf_only(names: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut out: Vec<Vec<String>> = Vec::new();
    for name in names {
        let clashes = out.iter().any(|other| {
            let n = name.len().min(other.len());
            name[..n] == other[..n]
        });
        if !clashes && seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

fn references(names: &[Vec<String>]) -> Vec<FragmentReference> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| FragmentReference::new(i as u64, 1, n))
        .collect()
}

proptest! {
    #[test]
    fn prop_numbering_is_deterministic(raw in names()) {
        let refs = references(&leaf_only(raw));
        let policy = ExtensionPolicy::default();
        let first = number(Path::new("/w"), &refs, &policy).unwrap();
        let second = number(Path::new("/w"), &refs, &policy).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_numbered_paths_are_distinct(raw in names()) {
        let refs = references(&leaf_only(raw));
        let paths = number(Path::new("/w"), &refs, &ExtensionPolicy::default()).unwrap();
        prop_assert_eq!(paths.len(), refs.len());
        let unique: HashSet<_> = paths.iter().collect();
        prop_assert_eq!(unique.len(), paths.len());
        for path in &paths {
            prop_assert!(path.starts_with("/w"));
        }
    }

    #[test]
    fn prop_numbering_keeps_sort_order(count in 1usize..120) {
        let names: Vec<Vec<String>> = (0..count).map(|i| vec![format!("Item {}", count - i)]).collect();
        let paths = number(Path::new("/w"), &references(&names), &ExtensionPolicy::default()).unwrap();
        let mut sorted = paths.clone();
        sorted.sort();
        prop_assert_eq!(sorted, paths);
    }

    #[test]
    fn prop_colliding_names_are_rejected(name in "[a-z]{1,8}", copies in 2usize..5) {
        let names: Vec<Vec<String>> = (0..copies).map(|_| vec![name.clone()]).collect();
        prop_assert!(number(Path::new("/w"), &references(&names), &ExtensionPolicy::default()).is_err());
    }

    #[test]
    fn prop_crc_matches_crc32fast(data in prop::collection::vec(any::<u8>(), 0..2048), split in 0usize..2048) {
        let split = split.min(data.len());
        let ours = crc::checksum(&[&data[..split], &data[split..]]);
        prop_assert_eq!(ours, crc32fast::hash(&data));
    }

    #[test]
    fn prop_parsers_cover_input(data in prop::collection::vec(any::<u8>(), 1..512)) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, &data).unwrap();

        let registry = Registry::builtin();
        for name in registry.names() {
            let mut module = registry.create(name, &ModuleOptions::default()).unwrap();
            if let Ok(refs) = module.parse(&path) {
                prop_assert!(
                    covers_contiguously(&refs, data.len() as u64),
                    "{} left gaps or overlaps", name
                );
            }
        }
    }
}
