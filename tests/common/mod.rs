//! Shared container builders and session fixtures

#![allow(dead_code)]

use phoenix_rs::{
    Blacklist, Fragment, FsEvent, Metadata, ModuleOptions, Session, SessionConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const ICON: &str = "Microsoft Icon/Cursor Files";
pub const PNG: &str = "Network Graphics";
pub const GIF: &str = "Graphics Interchange Format";
pub const ISO: &str = "ISO Base Media Format/Quicktime";

pub const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
    out
}

/// PNG magic followed by `chunks`
pub fn png(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut out = PNG_MAGIC.to_vec();
    for c in chunks {
        out.extend_from_slice(c);
    }
    out
}

/// Magic + one IHDR chunk with 4 data bytes
pub fn minimal_png() -> Vec<u8> {
    png(&[chunk(b"IHDR", &[0, 0, 0, 1])])
}

/// Icon with one raw payload per entry, laid out back to back
pub fn icon(payloads: &[&[u8]]) -> Vec<u8> {
    let count = payloads.len() as u16;
    let mut out = vec![0, 0, 1, 0];
    out.extend_from_slice(&count.to_le_bytes());
    let mut offset = 6 + 16 * payloads.len() as u32;
    for payload in payloads {
        out.extend_from_slice(&[16, 16, 0, 0]);
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        offset += payload.len() as u32;
    }
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    out
}

/// 4x2 GIF89a: global color table, graphics control, comment, one image
pub fn gif() -> Vec<u8> {
    let mut b = b"GIF89a".to_vec();
    b.extend_from_slice(&[4, 0, 2, 0, 0x80, 0, 0]);
    b.extend_from_slice(&[0, 0, 0, 255, 255, 255]);
    b.extend_from_slice(&[b'!', 0xF9, 4, 0x04, 10, 0, 1, 0]);
    b.extend_from_slice(&[b'!', 0xFE, 3, b'h', b'e', b'y', 0]);
    b.extend_from_slice(&[b',', 0, 0, 0, 0, 4, 0, 2, 0, 0]);
    b.extend_from_slice(&[2, 2, 0x4C, 0x01, 0]);
    b.push(b';');
    b
}

pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// ftyp + moov(mvhd, trak(tkhd)) + mdat
pub fn mp4() -> Vec<u8> {
    let trak = boxed(b"trak", &boxed(b"tkhd", &[7; 6]));
    let moov = boxed(b"moov", &[boxed(b"mvhd", &[1; 4]), trak].concat());
    [boxed(b"ftyp", b"isom"), moov, boxed(b"mdat", &[0xEE; 16])].concat()
}

/// Temp directory with a container written into it and a session over `work/`
pub struct Workspace {
    pub dir: TempDir,
    pub container: PathBuf,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(file_name: &str, bytes: &[u8]) -> Self {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join(file_name);
        fs::write(&container, bytes).unwrap();
        let root = dir.path().join("work");
        Workspace {
            dir,
            container,
            root,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self, module: &str) -> SessionConfig {
        SessionConfig::default()
            .with_module(module)
            .with_opened_file(&self.container)
            .with_working_directory(&self.root)
            .with_blacklist(Blacklist::new(["*/Thumbs.db", "*/.DS_Store"]))
    }

    /// Enabled session without the OS watcher
    pub fn session(&self, module: &str, options: ModuleOptions) -> Session {
        self.session_with(self.config(module).with_module_options(options))
    }

    pub fn session_with(&self, config: SessionConfig) -> Session {
        let session = Session::builder(config)
            .always_clear()
            .without_watcher()
            .build()
            .unwrap();
        session.enable().unwrap();
        session
    }
}

/// Index of the fragment carrying `metadata`
pub fn find(session: &Session, metadata: &Metadata) -> usize {
    session
        .fragments()
        .iter()
        .position(|f| &f.metadata == metadata)
        .unwrap_or_else(|| panic!("no fragment with {metadata:?}"))
}

pub fn fragment(session: &Session, metadata: &Metadata) -> Fragment {
    session.fragments()[find(session, metadata)].clone()
}

/// Write `bytes` to a fragment and reconcile the change right away
pub fn edit(session: &Session, path: &Path, bytes: &[u8]) {
    fs::write(path, bytes).unwrap();
    assert!(session.handle_event(FsEvent::Changed(path.to_path_buf())));
    session.flush_changes().unwrap();
}
