//! PNG-family chunk streams (PNG, APNG, MNG, JNG)
//!
//! An 8-byte magic header followed by `(length, type, data, crc)` chunks. The
//! length is big-endian and counts only the data; the CRC covers type and data.

use super::{group_names, leaf_name, numbered, relabel};
use crate::core::binary::{self, BigEndian};
use crate::core::crc;
use crate::core::fragment::{Fragment, FragmentReference, Metadata, Validity};
use crate::core::module::{FormatModule, ModuleOptions, ScanMode};
use crate::error::{PhoenixError, Result};
use byteorder::ByteOrder;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

pub const NAME: &str = "Network Graphics";

const MAGIC_LEN: usize = 8;

const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const MNG_MAGIC: [u8; 8] = [0x8A, 0x4D, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JNG_MAGIC: [u8; 8] = [0x8B, 0x4A, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

const PNG_CHUNKS: &[&[u8; 4]] = &[
    // critical
    b"IHDR", b"PLTE", b"IDAT", b"IEND",
    // ancillary
    b"tRNS", b"gAMA", b"cHRM", b"sRGB", b"iCCP", b"iTXt", b"tEXt", b"zTXt", b"bKGD",
    b"pHYs", b"sBIT", b"sPLT", b"hIST", b"tIME", b"sCAL", b"oFFs", b"pCAL", b"fRAc",
    // animation
    b"acTL", b"fcTL", b"fdAT",
];

const MNG_CHUNKS: &[&[u8; 4]] = &[
    b"MHDR", b"IHDR", b"PLTE", b"IDAT", b"LOOP", b"ENDL", b"MEND", b"JHDR", b"TERM",
    b"BACK", b"SAVE", b"SEEK", b"DEFI", b"JDAT", b"JDAA", b"JSEP",
    b"tRNS", b"eXPI", b"pHYg", b"gAMA", b"cHRM", b"sRGB", b"iCCP", b"iTXt", b"tEXt",
    b"zTXt", b"bKGD", b"pHYs", b"sBIT", b"tIME",
];

const JNG_CHUNKS: &[&[u8; 4]] = &[
    b"JHDR", b"IDAT", b"JDAT", b"JDAA", b"JSEP", b"IEND",
    b"gAMA", b"cHRM", b"sRGB", b"iCCP", b"iTXt", b"tEXt", b"zTXt", b"bKGD", b"pHYs",
    b"tIME", b"sCAL", b"oFFs", b"pCAL",
];

/// Container variant, detected from the magic header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Variant {
    Other,
    Portable,
    Multiple,
    Jpeg,
}

impl Variant {
    pub fn detect(magic: &[u8]) -> Self {
        match magic {
            m if m == PNG_MAGIC => Variant::Portable,
            m if m == MNG_MAGIC => Variant::Multiple,
            m if m == JNG_MAGIC => Variant::Jpeg,
            _ => Variant::Other,
        }
    }

    /// Whether `kind` is a chunk type this variant defines
    pub fn allows(self, kind: &[u8]) -> bool {
        let list = match self {
            // unknown headers fall back to the PNG list
            Variant::Other | Variant::Portable => PNG_CHUNKS,
            Variant::Multiple => MNG_CHUNKS,
            Variant::Jpeg => JNG_CHUNKS,
        };
        kind.len() == 4 && list.iter().any(|t| t.as_slice() == kind)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::Other => "Other",
            Variant::Portable => "Portable",
            Variant::Multiple => "Multiple",
            Variant::Jpeg => "JPEG",
        })
    }
}

/// Role of a fragment in a chunk stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkField {
    Header,
    Length { chunk: u32 },
    Type { chunk: u32 },
    Data { chunk: u32 },
    Crc { chunk: u32 },
}

/// Module for PNG, APNG, MNG and JNG files
#[derive(Debug, Clone)]
pub struct NetworkGraphics {
    options: ModuleOptions,
}

impl NetworkGraphics {
    pub fn new(options: ModuleOptions) -> Self {
        NetworkGraphics { options }
    }

    /// Recompute the CRC of `chunk`, fixing it when allowed
    fn check_crc(&self, fragments: &mut [Fragment], index: usize, chunk: u32) -> Result<()> {
        let (Some(t), Some(d), Some(c)) = (
            sibling(fragments, index, ChunkField::Type { chunk }),
            sibling(fragments, index, ChunkField::Data { chunk }),
            sibling(fragments, index, ChunkField::Crc { chunk }),
        ) else {
            return Ok(());
        };
        let expected = crc::checksum(&[&fragments[t].read()?, &fragments[d].read()?]);
        let mut current = fragments[c].read()?;
        let mut validity = Validity::Valid;
        if current != expected.to_be_bytes() {
            if self.options.fix_crc {
                binary::write_u32::<BigEndian>(&fragments[c], expected)?;
                current = expected.to_be_bytes().to_vec();
            } else {
                validity = Validity::HardInvalid;
            }
        }
        fragments[c].mark(validity, crc_description(chunk, &current));
        Ok(())
    }

    fn check_data(&self, fragments: &mut [Fragment], index: usize, chunk: u32) -> Result<()> {
        let size = fragments[index].size()?;
        if size > i32::MAX as u64 {
            fragments[index].mark(
                Validity::HardInvalid,
                format!("Chunk {chunk} Data length = {size}, too large for a chunk"),
            );
            return self.check_crc(fragments, index, chunk);
        }

        let length_at = sibling(fragments, index, ChunkField::Length { chunk });
        let declared = match length_at {
            Some(i) => binary::read_u32::<BigEndian>(&fragments[i])?,
            None => None,
        };
        let mut fixed = false;
        if let Some(i) = length_at {
            if self.options.fix_length && declared != Some(size as u32) {
                binary::write_u32::<BigEndian>(&fragments[i], size as u32)?;
                fixed = true;
            }
            let width = fragments[i].size()?;
            let value = if fixed { Some(size as u32) } else { declared };
            let (v, d) = classify_length(chunk, width, value, size);
            fragments[i].mark(v, d);
        }

        let matches = fixed || declared == Some(size as u32);
        fragments[index].mark(
            Validity::from_bool(matches, Validity::HardInvalid),
            format!("Chunk {chunk} Data length = {size}"),
        );
        self.check_crc(fragments, index, chunk)
    }
}

impl FormatModule for NetworkGraphics {
    fn display_name(&self) -> &'static str {
        NAME
    }

    fn save_filters(&self) -> Vec<String> {
        vec![
            "Portable Network Graphics (*.png)|*.png".to_string(),
            "Animated Portable Network Graphics (*.apng)|*.apng".to_string(),
            "Multiple Network Graphics (*.mng)|*.mng".to_string(),
            "JPEG Network Graphics (*.jng)|*.jng".to_string(),
        ]
    }

    fn open_filters(&self) -> Vec<String> {
        let mut filters = vec![
            "Network Graphics Files (*.png;*.apng;*.mng;*.jng)|*.png;*.apng;*.mng;*.jng".to_string(),
        ];
        filters.extend(self.save_filters());
        filters
    }

    fn uses_variables(&self) -> bool {
        true
    }

    fn parse(&mut self, path: &Path) -> Result<Vec<FragmentReference>> {
        let bytes = fs::read(path).map_err(|e| PhoenixError::unavailable(path, e))?;
        if bytes.is_empty() {
            return Err(PhoenixError::parse(NAME, path, "file is empty"));
        }
        Ok(decompose(&bytes, self.options.scan_mode))
    }

    fn update_variables(
        &mut self,
        fragments: &mut [Fragment],
        cursor: &mut usize,
        changed: &mut Vec<usize>,
    ) -> Result<bool> {
        relabel(fragments, cursor, changed, label);
        Ok(false)
    }

    fn update_validity(&mut self, fragments: &mut [Fragment], index: usize) -> Result<()> {
        let Metadata::Chunk(field) = fragments[index].metadata else {
            fragments[index].mark(Validity::Unknown, "Not part of the chunk stream");
            return Ok(());
        };

        match field {
            ChunkField::Header => {
                let (v, d) = classify_header(&fragments[index].read()?);
                fragments[index].mark(v, d);
            }
            ChunkField::Length { chunk } => {
                let width = fragments[index].size()?;
                let value = binary::read_u32::<BigEndian>(&fragments[index])?;
                let data_size = match sibling(fragments, index, ChunkField::Data { chunk }) {
                    Some(i) => fragments[i].size()?,
                    None => 0,
                };
                let (v, d) = classify_length(chunk, width, value, data_size);
                fragments[index].mark(v, d);
            }
            ChunkField::Type { chunk } => {
                let variant = variant_of(fragments)?;
                let (v, d) = classify_type(chunk, variant, &fragments[index].read()?);
                fragments[index].mark(v, d);
                self.check_crc(fragments, index, chunk)?;
            }
            ChunkField::Data { chunk } => self.check_data(fragments, index, chunk)?,
            ChunkField::Crc { chunk } => self.check_crc(fragments, index, chunk)?,
        }
        Ok(())
    }
}

/// Split a chunk stream into references; never fails, truncated fields are clamped
fn decompose(bytes: &[u8], scan_mode: ScanMode) -> Vec<FragmentReference> {
    let total = bytes.len();
    let header_len = total.min(MAGIC_LEN);
    let variant = Variant::detect(&bytes[..header_len]);

    let (v, d) = classify_header(&bytes[..header_len]);
    let mut references = vec![FragmentReference::new(0, header_len as u64, &["header"])
        .with_validity(v)
        .with_description(d)
        .with_metadata(Metadata::Chunk(ChunkField::Header))];

    let span = |from: usize, len: usize| -> (usize, usize) {
        let start = from.min(total);
        (start, len.min(total - start))
    };

    let mut pos = header_len;
    let mut chunk = 0u32;
    while pos < total {
        chunk += 1;
        let length = span(pos, 4);
        let kind = span(length.0 + length.1, 4);
        let data_start = kind.0 + kind.1;
        let declared = (length.1 == 4).then(|| BigEndian::read_u32(&bytes[length.0..length.0 + 4]));

        let static_len = declared.map(|n| n as usize).unwrap_or(0);
        let data_len = match scan_mode {
            ScanMode::Static => static_len,
            ScanMode::Dynamic => next_chunk_distance(bytes, data_start, variant).unwrap_or(static_len),
        };
        let data = span(data_start, data_len);
        let crc_field = span(data.0 + data.1, 4);

        let type_bytes = &bytes[kind.0..kind.0 + kind.1];
        let data_bytes = &bytes[data.0..data.0 + data.1];
        let crc_bytes = &bytes[crc_field.0..crc_field.0 + crc_field.1];
        let group = format!("Chunk {chunk}");

        let field = |(start, len): (usize, usize), leaf: &str, f: ChunkField, (v, d): (Validity, String)| {
            FragmentReference::new(start as u64, len as u64, &[group.as_str(), leaf])
                .with_validity(v)
                .with_description(d)
                .with_metadata(Metadata::Chunk(f))
        };

        let length_verdict = classify_length(chunk, length.1 as u64, declared, data.1 as u64);
        let data_verdict = (
            Validity::from_bool(declared == Some(data.1 as u32), Validity::HardInvalid),
            format!("Chunk {chunk} Data length = {}", data.1),
        );
        let expected = crc::checksum(&[type_bytes, data_bytes]);
        let crc_verdict = (
            Validity::from_bool(crc_bytes == expected.to_be_bytes(), Validity::HardInvalid),
            crc_description(chunk, crc_bytes),
        );

        references.push(field(length, "Length", ChunkField::Length { chunk }, length_verdict));
        references.push(field(kind, "Type", ChunkField::Type { chunk }, classify_type(chunk, variant, type_bytes)));
        references.push(field(data, "Data", ChunkField::Data { chunk }, data_verdict));
        references.push(field(crc_field, "CRC", ChunkField::Crc { chunk }, crc_verdict));

        pos = crc_field.0 + crc_field.1;
    }
    references
}

/// Distance from `data_start` to the data end of a chunk followed by a
/// whitelisted chunk type
fn next_chunk_distance(bytes: &[u8], data_start: usize, variant: Variant) -> Option<usize> {
    // data end + crc(4) + next length(4) puts the next type 8 bytes later
    let first_type = data_start.checked_add(8)?;
    (first_type..bytes.len().saturating_sub(3))
        .find(|&at| variant.allows(&bytes[at..at + 4]))
        .map(|at| at - first_type)
}

fn label(fragment: &Fragment) -> Metadata {
    let leaf = leaf_name(fragment);
    let groups = group_names(fragment);
    let field = match groups.as_slice() {
        [] if leaf == "header" => Some(ChunkField::Header),
        [group] => numbered(group, "Chunk").and_then(|chunk| match leaf.as_str() {
            "Length" => Some(ChunkField::Length { chunk }),
            "Type" => Some(ChunkField::Type { chunk }),
            "Data" => Some(ChunkField::Data { chunk }),
            "CRC" => Some(ChunkField::Crc { chunk }),
            _ => None,
        }),
        _ => None,
    };
    field.map(Metadata::Chunk).unwrap_or_default()
}

/// Fragment holding `field`, searched next to `index` first
fn sibling(fragments: &[Fragment], index: usize, field: ChunkField) -> Option<usize> {
    let is = |f: &Fragment| f.metadata == Metadata::Chunk(field);
    (index.saturating_sub(3)..(index + 4).min(fragments.len()))
        .find(|&i| is(&fragments[i]))
        .or_else(|| fragments.iter().position(is))
}

fn variant_of(fragments: &[Fragment]) -> Result<Variant> {
    match fragments.iter().position(|f| f.metadata == Metadata::Chunk(ChunkField::Header)) {
        Some(i) => Ok(Variant::detect(&fragments[i].read()?)),
        None => Ok(Variant::Other),
    }
}

fn classify_header(magic: &[u8]) -> (Validity, String) {
    let variant = Variant::detect(magic);
    (
        Validity::from_bool(variant != Variant::Other, Validity::HardInvalid),
        format!("File type = {variant} Network Graphics"),
    )
}

fn classify_length(chunk: u32, width: u64, value: Option<u32>, data_size: u64) -> (Validity, String) {
    match value {
        Some(value) if width == 4 => (
            Validity::from_bool(u64::from(value) == data_size, Validity::HardInvalid),
            format!("Chunk {chunk} Length = {value}"),
        ),
        _ => {
            let validity = if width < 4 { Validity::HardInvalid } else { Validity::Unknown };
            (validity, format!("Chunk {chunk} Length = <unknown>"))
        }
    }
}

fn classify_type(chunk: u32, variant: Variant, kind: &[u8]) -> (Validity, String) {
    (
        Validity::from_bool(variant.allows(kind), Validity::HardInvalid),
        format!("Chunk {chunk} Type = {}", binary::ascii_lossy(kind)),
    )
}

fn crc_description(chunk: u32, crc: &[u8]) -> String {
    match <[u8; 4]>::try_from(crc) {
        Ok(bytes) => format!("Chunk {chunk} CRC (Big Endian) = {}", u32::from_be_bytes(bytes)),
        Err(_) => format!("Chunk {chunk} CRC (Big Endian) = <unknown>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fragment::covers_contiguously;
    use crate::formats::materialize;
    use tempfile::TempDir;

    fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        out.extend_from_slice(&crc::checksum(&[kind, data]).to_be_bytes());
        out
    }

    fn png(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = PNG_MAGIC.to_vec();
        for c in chunks {
            out.extend_from_slice(c);
        }
        out
    }

    #[test]
    fn test_minimal_png_is_valid() {
        let bytes = png(&[chunk(b"IHDR", &[1, 2, 3, 4])]);
        let refs = decompose(&bytes, ScanMode::Static);
        assert_eq!(refs.len(), 5);
        assert!(covers_contiguously(&refs, bytes.len() as u64));
        assert!(refs.iter().all(|r| r.validity == Validity::Valid), "{refs:#?}");
        assert_eq!(refs[2].description, "Chunk 1 Type = IHDR");
    }

    #[test]
    fn test_truncated_chunk_is_clamped() {
        let mut bytes = png(&[chunk(b"IHDR", &[1, 2, 3, 4])]);
        bytes.truncate(bytes.len() - 6);
        let refs = decompose(&bytes, ScanMode::Static);
        assert!(covers_contiguously(&refs, bytes.len() as u64));
        assert_eq!(refs[3].length, 2);
        assert_eq!(refs[4].length, 0);
        assert_eq!(refs[3].validity, Validity::HardInvalid);
    }

    #[test]
    fn test_dynamic_scan_ignores_bad_length() {
        let mut first = chunk(b"IHDR", &[1, 2, 3, 4]);
        first[3] = 200;
        let bytes = png(&[first, chunk(b"IEND", &[])]);
        let refs = decompose(&bytes, ScanMode::Dynamic);
        assert_eq!(refs.len(), 9);
        assert_eq!(refs[3].length, 4);
        assert_eq!(refs[1].validity, Validity::HardInvalid);
        assert_eq!(refs[6].description, "Chunk 2 Type = IEND");
        assert_eq!(refs[6].validity, Validity::Valid);
    }

    #[test]
    fn test_variant_whitelists() {
        assert!(Variant::Portable.allows(b"fcTL"));
        assert!(!Variant::Portable.allows(b"MHDR"));
        assert!(Variant::Multiple.allows(b"MHDR"));
        assert!(Variant::Jpeg.allows(b"JDAT"));
        assert!(!Variant::Jpeg.allows(b"PLTE"));
        assert!(Variant::Other.allows(b"IHDR"));
        assert!(!Variant::Portable.allows(b"IHD"));
    }

    #[test]
    fn test_data_edit_fixes_length_and_crc() {
        let dir = TempDir::new().unwrap();
        let bytes = png(&[chunk(b"IHDR", &[1, 2, 3, 4])]);
        let mut fragments = materialize(dir.path(), &bytes, decompose(&bytes, ScanMode::Static));
        fs::write(&fragments[3].path, [1, 2, 3, 4, 5]).unwrap();

        let mut module = NetworkGraphics::new(ModuleOptions::default());
        module.update_validity(&mut fragments, 3).unwrap();

        assert_eq!(binary::read_u32::<BigEndian>(&fragments[1]).unwrap(), Some(5));
        let expected = crc::checksum(&[b"IHDR", &[1, 2, 3, 4, 5]]);
        assert_eq!(binary::read_u32::<BigEndian>(&fragments[4]).unwrap(), Some(expected));
        for i in 1..5 {
            assert_eq!(fragments[i].validity, Validity::Valid, "{i}");
        }
    }

    #[test]
    fn test_data_edit_without_fixes_reports() {
        let dir = TempDir::new().unwrap();
        let bytes = png(&[chunk(b"IHDR", &[1, 2, 3, 4])]);
        let mut fragments = materialize(dir.path(), &bytes, decompose(&bytes, ScanMode::Static));
        fs::write(&fragments[3].path, [1, 2, 3, 4, 5]).unwrap();

        let mut module = NetworkGraphics::new(ModuleOptions::report_only());
        module.update_validity(&mut fragments, 3).unwrap();
        assert_eq!(fragments[1].validity, Validity::HardInvalid);
        assert_eq!(fragments[3].validity, Validity::HardInvalid);
        assert_eq!(fragments[4].validity, Validity::HardInvalid);
        assert_eq!(binary::read_u32::<BigEndian>(&fragments[1]).unwrap(), Some(4));
    }

    #[test]
    fn test_length_width_classification() {
        assert_eq!(classify_length(1, 3, None, 0).0, Validity::HardInvalid);
        assert_eq!(classify_length(1, 5, None, 0).0, Validity::Unknown);
        assert_eq!(classify_length(1, 4, Some(2), 2).0, Validity::Valid);
    }

    #[test]
    fn test_labels_match_parse() {
        let dir = TempDir::new().unwrap();
        let bytes = png(&[chunk(b"IHDR", &[0; 13]), chunk(b"IDAT", &[9; 3]), chunk(b"IEND", &[])]);
        let fragments = materialize(dir.path(), &bytes, decompose(&bytes, ScanMode::Static));
        for fragment in &fragments {
            assert_eq!(label(fragment), fragment.metadata);
        }
    }
}
