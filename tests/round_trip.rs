//! Load-then-save reproduces every container byte for byte

mod common;

use common::*;
use phoenix_rs::{ModuleOptions, Phoenix, Validity};
use std::fs;

fn round_trip(file_name: &str, module: &str, bytes: &[u8]) {
    let ws = Workspace::new(file_name, bytes);
    let session = ws.session(module, ModuleOptions::default());
    assert!(!session.is_empty());

    let out = ws.path(&format!("out-{file_name}"));
    session.save(&out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), bytes, "{module} round trip");
}

#[test]
fn test_icon_round_trip() {
    round_trip("a.ico", ICON, &icon(&[&[1; 8], &[2; 3], &[3; 5]]));
}

#[test]
fn test_icon_with_png_payload_round_trip() {
    round_trip("p.ico", ICON, &icon(&[&minimal_png()]));
}

#[test]
fn test_png_round_trip() {
    let bytes = png(&[
        chunk(b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 2, 0, 0, 0]),
        chunk(b"IDAT", &[0x78, 0x9C, 0x63, 0x00, 0x00]),
        chunk(b"IEND", &[]),
    ]);
    round_trip("a.png", PNG, &bytes);
}

#[test]
fn test_truncated_png_round_trip() {
    let mut bytes = png(&[chunk(b"IHDR", &[1; 13]), chunk(b"IEND", &[])]);
    bytes.truncate(bytes.len() - 3);
    round_trip("cut.png", PNG, &bytes);
}

#[test]
fn test_gif_round_trip() {
    round_trip("a.gif", GIF, &gif());
}

#[test]
fn test_gif_with_trailing_data_round_trip() {
    let mut bytes = gif();
    bytes.extend_from_slice(&[0, 1, 2, b';']);
    round_trip("tail.gif", GIF, &bytes);
}

#[test]
fn test_iso_round_trip() {
    round_trip("a.mp4", ISO, &mp4());
}

#[test]
fn test_iso_extended_length_round_trip() {
    let mut bytes = boxed(b"ftyp", b"isom");
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(b"mdat");
    bytes.extend_from_slice(&(16u64 + 5).to_be_bytes());
    bytes.extend_from_slice(&[9; 5]);
    round_trip("big.mp4", ISO, &bytes);
}

#[test]
fn test_validity_is_idempotent() {
    for (name, module, bytes) in [
        ("i.ico", ICON, icon(&[&[1; 4], &[2; 4]])),
        ("p.png", PNG, minimal_png()),
        ("g.gif", GIF, gif()),
        ("m.mp4", ISO, mp4()),
    ] {
        let ws = Workspace::new(name, &bytes);
        let session = ws.session(module, ModuleOptions::default());
        let snapshot = |s: &phoenix_rs::Session| -> Vec<(Validity, String)> {
            s.fragments()
                .into_iter()
                .map(|f| (f.validity, f.description))
                .collect()
        };

        session.revalidate_all();
        let first = snapshot(&session);
        session.revalidate_all();
        assert_eq!(first, snapshot(&session), "{module}");
    }
}

#[test]
fn test_directory_reload_matches_split() {
    for (name, module, bytes) in [
        ("i.ico", ICON, icon(&[&[1; 4], &[2; 4]])),
        ("p.png", PNG, minimal_png()),
        ("g.gif", GIF, gif()),
        ("m.mp4", ISO, mp4()),
    ] {
        let ws = Workspace::new(name, &bytes);
        let split = Phoenix::split(&ws.container, &ws.root, module).unwrap();
        let parsed: Vec<_> = split
            .fragments()
            .into_iter()
            .map(|f| (f.relative, f.metadata))
            .collect();
        drop(split);

        let adopted = Phoenix::open_directory(&ws.root, module).unwrap();
        let loaded: Vec<_> = adopted
            .fragments()
            .into_iter()
            .map(|f| (f.relative, f.metadata))
            .collect();
        assert_eq!(parsed, loaded, "{module}");
        assert_eq!(adopted.session().with_virtual_file(|v| v.count(Validity::HardInvalid)), 0);

        let out = ws.path("joined");
        adopted.join(&out).unwrap();
        assert_eq!(fs::read(out).unwrap(), bytes);
    }
}

#[test]
fn test_forced_extension_round_trip() {
    let ws = Workspace::new("p.ico", &icon(&[&minimal_png()]));
    let config = ws.config(ICON).with_fragment_extension("frag", true);
    let session = ws.session_with(config);
    assert!(session
        .fragments()
        .iter()
        .all(|f| f.path.extension().is_some_and(|e| e == "frag")));

    let out = ws.path("out.ico");
    session.save(&out).unwrap();
    assert_eq!(fs::read(out).unwrap(), icon(&[&minimal_png()]));
}
