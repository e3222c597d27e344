//! Microsoft icon and cursor files
//!
//! Layout: a 6-byte header, one 16-byte directory entry per image, then the
//! image payloads. Each entry stores its payload's length and absolute offset,
//! so resizing one payload moves every payload after it.

use super::{group_names, leaf_name, numbered, relabel};
use crate::core::binary::{self, LittleEndian};
use crate::core::fragment::{Fragment, FragmentReference, Metadata, Validity};
use crate::core::module::{FormatModule, ModuleOptions};
use crate::error::{PhoenixError, Result};
use byteorder::ByteOrder;
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::path::Path;

pub const NAME: &str = "Microsoft Icon/Cursor Files";

const HEADER_LEN: u64 = 6;
const ENTRY_LEN: u64 = 16;
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// File type from the header's type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IconKind {
    Unknown,
    Icon,
    Cursor,
}

impl IconKind {
    fn from_value(value: Option<u16>) -> Self {
        match value {
            Some(1) => IconKind::Icon,
            Some(2) => IconKind::Cursor,
            _ => IconKind::Unknown,
        }
    }
}

/// Field of a 16-byte directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryField {
    Width,
    Height,
    ColorPalette,
    Reserved,
    /// Color planes (icon) or hotspot X (cursor)
    Variable1,
    /// Bits per pixel (icon) or hotspot Y (cursor)
    Variable2,
    Length,
    Offset,
}

impl EntryField {
    fn name(self, kind: IconKind) -> &'static str {
        match (self, kind) {
            (EntryField::Width, _) => "Width",
            (EntryField::Height, _) => "Height",
            (EntryField::ColorPalette, _) => "Color Palette",
            (EntryField::Reserved, _) => "Reserved",
            (EntryField::Variable1, IconKind::Icon) => "Color Planes",
            (EntryField::Variable1, IconKind::Cursor) => "Hotspot X Offset",
            (EntryField::Variable1, IconKind::Unknown) => "Variable 1",
            (EntryField::Variable2, IconKind::Icon) => "Bits Per Pixel",
            (EntryField::Variable2, IconKind::Cursor) => "Hotspot Y Offset",
            (EntryField::Variable2, IconKind::Unknown) => "Variable 2",
            (EntryField::Length, _) => "Image Length",
            (EntryField::Offset, _) => "Image Offset",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Width" => EntryField::Width,
            "Height" => EntryField::Height,
            "Color Palette" => EntryField::ColorPalette,
            "Reserved" => EntryField::Reserved,
            "Color Planes" | "Hotspot X Offset" | "Variable 1" => EntryField::Variable1,
            "Bits Per Pixel" | "Hotspot Y Offset" | "Variable 2" => EntryField::Variable2,
            "Image Length" => EntryField::Length,
            "Image Offset" => EntryField::Offset,
            _ => return None,
        })
    }
}

/// Role of a fragment within an icon file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IconField {
    Reserved,
    Type,
    ImageCount,
    Entry { image: u16, field: EntryField },
    Payload { image: u16 },
    /// Bytes no directory entry points at
    Padding,
}

/// Module for `.ico` and `.cur` files
#[derive(Debug, Clone)]
pub struct IconCursor {
    options: ModuleOptions,
}

impl IconCursor {
    pub fn new(options: ModuleOptions) -> Self {
        IconCursor { options }
    }

    fn check_entry(
        &self,
        fragments: &mut [Fragment],
        index: usize,
        image: u16,
        field: EntryField,
    ) -> Result<()> {
        let (validity, description) = match field {
            EntryField::Width
            | EntryField::Height
            | EntryField::ColorPalette
            | EntryField::Reserved => {
                classify_entry_byte(image, field, binary::read_u8(&fragments[index])?)
            }
            EntryField::Variable1 | EntryField::Variable2 => {
                let kind = file_kind(fragments)?;
                let value = binary::read_u16::<LittleEndian>(&fragments[index])?;
                classify_variable(image, field, kind, value)
            }
            EntryField::Length => {
                let length = binary::read_u32::<LittleEndian>(&fragments[index])?;
                let offset = match find(fragments, &IconField::Entry { image, field: EntryField::Offset }) {
                    Some(i) => binary::read_u32::<LittleEndian>(&fragments[i])?,
                    None => None,
                };
                let total = binary::total_size(fragments)?;
                classify_length(image, length, offset, total)
            }
            EntryField::Offset => {
                let offset = binary::read_u32::<LittleEndian>(&fragments[index])?;
                classify_offset(image, offset, declared_count(fragments)?)
            }
        };
        fragments[index].mark(validity, description);
        Ok(())
    }

    /// Fix and check the directory entry of the payload at `index`
    fn check_payload(&self, fragments: &mut [Fragment], index: usize, image: u16) -> Result<()> {
        let length_at = find(fragments, &IconField::Entry { image, field: EntryField::Length });
        let offset_at = find(fragments, &IconField::Entry { image, field: EntryField::Offset });
        let (Some(length_at), Some(offset_at)) = (length_at, offset_at) else {
            fragments[index].mark(Validity::Unknown, format!("Image {image} has no directory entry"));
            return Ok(());
        };

        let size = fragments[index].size()?;
        let mut preceding = 0u64;
        for fragment in &fragments[..index] {
            preceding += fragment.size()?;
        }

        let mut payload = (Validity::OutOfScope, format!("Image {image} data, {size} bytes"));
        match u32::try_from(size) {
            Ok(actual) => {
                let current = sync_u32(&fragments[length_at], actual, self.options.fix_length)?;
                fragments[length_at].mark(
                    Validity::from_bool(current == Some(actual), Validity::HardInvalid),
                    format!("Image {image} Length = {}", shown(current)),
                );
            }
            Err(_) => payload = (Validity::HardInvalid, format!("Image {image} is too large for a 32-bit length")),
        }
        match u32::try_from(preceding) {
            Ok(actual) => {
                let current = sync_u32(&fragments[offset_at], actual, self.options.fix_offset)?;
                fragments[offset_at].mark(
                    Validity::from_bool(current == Some(actual), Validity::HardInvalid),
                    format!("Image {image} Offset = {}", shown(current)),
                );
            }
            Err(_) => payload = (Validity::HardInvalid, format!("Image {image} starts past a 32-bit offset")),
        }
        fragments[index].mark(payload.0, payload.1);
        Ok(())
    }
}

impl FormatModule for IconCursor {
    fn display_name(&self) -> &'static str {
        NAME
    }

    fn save_filters(&self) -> Vec<String> {
        vec![
            "Microsoft Icon File (*.ico)|*.ico".to_string(),
            "Microsoft Cursor File (*.cur)|*.cur".to_string(),
        ]
    }

    fn open_filters(&self) -> Vec<String> {
        let mut filters = vec!["Microsoft Icon/Cursor Files (*.cur;*.ico)|*.cur;*.ico".to_string()];
        filters.extend(self.save_filters());
        filters
    }

    fn uses_variables(&self) -> bool {
        true
    }

    fn parse(&mut self, path: &Path) -> Result<Vec<FragmentReference>> {
        let bytes = fs::read(path).map_err(|e| PhoenixError::unavailable(path, e))?;
        decompose(&bytes).map_err(|reason| PhoenixError::parse(NAME, path, reason))
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
        let Metadata::Icon(field) = fragments[index].metadata.clone() else {
            fragments[index].mark(Validity::Unknown, "Not part of the icon layout");
            return Ok(());
        };

        match field {
            IconField::Reserved => {
                let (v, d) = classify_header_reserved(binary::read_u16::<LittleEndian>(&fragments[index])?);
                fragments[index].mark(v, d);
            }
            IconField::Type => {
                let (v, d) = classify_type(binary::read_u16::<LittleEndian>(&fragments[index])?);
                fragments[index].mark(v, d);
                // entry field meanings depend on the type
                for i in 0..fragments.len() {
                    if let Metadata::Icon(IconField::Entry { image, field }) = fragments[i].metadata.clone() {
                        if matches!(field, EntryField::Variable1 | EntryField::Variable2) {
                            self.check_entry(fragments, i, image, field)?;
                        }
                    }
                }
            }
            IconField::ImageCount => {
                let (v, d) = classify_count(binary::read_u16::<LittleEndian>(&fragments[index])?);
                fragments[index].mark(v, d);
                for i in 0..fragments.len() {
                    if let Metadata::Icon(IconField::Entry { image, field: EntryField::Offset }) =
                        fragments[i].metadata.clone()
                    {
                        self.check_entry(fragments, i, image, EntryField::Offset)?;
                    }
                }
            }
            IconField::Entry { image, field } => self.check_entry(fragments, index, image, field)?,
            IconField::Payload { .. } => {
                for i in index..fragments.len() {
                    if let Metadata::Icon(IconField::Payload { image }) = fragments[i].metadata.clone() {
                        self.check_payload(fragments, i, image)?;
                    }
                }
            }
            IconField::Padding => {
                let size = fragments[index].size()?;
                fragments[index].mark(
                    Validity::SoftInvalid,
                    format!("{size} bytes not referenced by any directory entry"),
                );
            }
        }
        Ok(())
    }
}

/// Split an icon file into header, directory entries and payloads
fn decompose(bytes: &[u8]) -> std::result::Result<Vec<FragmentReference>, String> {
    let total = bytes.len() as u64;
    if total < HEADER_LEN {
        return Err(format!("{total} bytes is too short for an icon header"));
    }
    let reserved = LittleEndian::read_u16(&bytes[0..2]);
    let type_value = LittleEndian::read_u16(&bytes[2..4]);
    let count = LittleEndian::read_u16(&bytes[4..6]);
    let kind = IconKind::from_value(Some(type_value));
    let directory_end = HEADER_LEN + ENTRY_LEN * u64::from(count);
    if directory_end > total {
        return Err(format!("directory of {count} images runs past the end ({total} bytes)"));
    }

    let field = |offset: u64, length: u64, name: &[&str], f: IconField, (v, d): (Validity, String)| {
        FragmentReference::new(offset, length, name)
            .with_validity(v)
            .with_description(d)
            .with_metadata(Metadata::Icon(f))
    };

    let mut references = vec![
        field(0, 2, &["Header", "Reserved"], IconField::Reserved, classify_header_reserved(Some(reserved))),
        field(2, 2, &["Header", "Type"], IconField::Type, classify_type(Some(type_value))),
        field(4, 2, &["Header", "Image Count"], IconField::ImageCount, classify_count(Some(count))),
    ];

    let mut payloads = Vec::with_capacity(usize::from(count));
    for i in 0..count {
        let image = i + 1;
        let base = HEADER_LEN + ENTRY_LEN * u64::from(i);
        let entry = &bytes[base as usize..(base + ENTRY_LEN) as usize];
        let folder = format!("Image {image}");
        let length = LittleEndian::read_u32(&entry[8..12]);
        let offset = LittleEndian::read_u32(&entry[12..16]);

        let layout = [
            (EntryField::Width, 0u64, 1u64),
            (EntryField::Height, 1, 1),
            (EntryField::ColorPalette, 2, 1),
            (EntryField::Reserved, 3, 1),
            (EntryField::Variable1, 4, 2),
            (EntryField::Variable2, 6, 2),
            (EntryField::Length, 8, 4),
            (EntryField::Offset, 12, 4),
        ];
        for (entry_field, at, width) in layout {
            let raw = &entry[at as usize..(at + width) as usize];
            let verdict = match entry_field {
                EntryField::Width | EntryField::Height | EntryField::ColorPalette | EntryField::Reserved => {
                    classify_entry_byte(image, entry_field, Some(raw[0]))
                }
                EntryField::Variable1 | EntryField::Variable2 => {
                    classify_variable(image, entry_field, kind, Some(LittleEndian::read_u16(raw)))
                }
                EntryField::Length => classify_length(image, Some(length), Some(offset), total),
                EntryField::Offset => classify_offset(image, Some(offset), Some(count)),
            };
            references.push(field(
                base + at,
                width,
                &[folder.as_str(), entry_field.name(kind)],
                IconField::Entry { image, field: entry_field },
                verdict,
            ));
        }

        let (start, len) = (u64::from(offset), u64::from(length));
        if start + len > total {
            return Err(format!("image {image} runs past the end of the file"));
        }
        if start < directory_end && len > 0 {
            return Err(format!("image {image} overlaps the directory"));
        }
        payloads.push((start, len, image));
    }

    payloads.sort_by_key(|&(start, _, _)| start);
    let mut cursor = directory_end;
    let mut padding = 0u32;
    for (start, len, image) in payloads {
        if len == 0 {
            continue;
        }
        if start < cursor {
            return Err(format!("image {image} overlaps the data before it"));
        }
        if start > cursor {
            padding += 1;
            references.push(padding_reference(cursor, start - cursor, padding));
        }
        let extension = if bytes[start as usize..].starts_with(&PNG_MAGIC) { "png" } else { "raw" };
        references.push(
            FragmentReference::new(start, len, &[format!("Image {image}.{extension}")])
                .with_validity(Validity::OutOfScope)
                .with_description(format!("Image {image} data, {len} bytes"))
                .with_metadata(Metadata::Icon(IconField::Payload { image })),
        );
        cursor = start + len;
    }
    if cursor < total {
        padding += 1;
        references.push(padding_reference(cursor, total - cursor, padding));
    }
    Ok(references)
}

fn padding_reference(offset: u64, length: u64, n: u32) -> FragmentReference {
    FragmentReference::new(offset, length, &[format!("Padding {n}")])
        .with_validity(Validity::SoftInvalid)
        .with_description(format!("{length} bytes not referenced by any directory entry"))
        .with_metadata(Metadata::Icon(IconField::Padding))
}

fn label(fragment: &Fragment) -> Metadata {
    let leaf = leaf_name(fragment);
    let groups = group_names(fragment);
    let field = match groups.as_slice() {
        [group] if group == "Header" => match leaf.as_str() {
            "Reserved" => Some(IconField::Reserved),
            "Type" => Some(IconField::Type),
            "Image Count" => Some(IconField::ImageCount),
            _ => None,
        },
        [group] => numbered(group, "Image")
            .and_then(|n| u16::try_from(n).ok())
            .zip(EntryField::from_name(&leaf))
            .map(|(image, field)| IconField::Entry { image, field }),
        [] if leaf.starts_with("Padding") => Some(IconField::Padding),
        [] => numbered(&leaf, "Image")
            .and_then(|n| u16::try_from(n).ok())
            .map(|image| IconField::Payload { image }),
        _ => None,
    };
    field.map(Metadata::Icon).unwrap_or_default()
}

fn find(fragments: &[Fragment], field: &IconField) -> Option<usize> {
    fragments
        .iter()
        .position(|f| matches!(&f.metadata, Metadata::Icon(x) if x == field))
}

fn file_kind(fragments: &[Fragment]) -> Result<IconKind> {
    match find(fragments, &IconField::Type) {
        Some(i) => Ok(IconKind::from_value(binary::read_u16::<LittleEndian>(&fragments[i])?)),
        None => Ok(IconKind::Unknown),
    }
}

fn declared_count(fragments: &[Fragment]) -> Result<Option<u16>> {
    match find(fragments, &IconField::ImageCount) {
        Some(i) => binary::read_u16::<LittleEndian>(&fragments[i]),
        None => Ok(None),
    }
}

/// Rewrite a 4-byte field to `actual` when allowed; returns the value now stored
fn sync_u32(fragment: &Fragment, actual: u32, fix: bool) -> Result<Option<u32>> {
    let current = binary::read_u32::<LittleEndian>(fragment)?;
    if fix && current != Some(actual) {
        binary::write_u32::<LittleEndian>(fragment, actual)?;
        return Ok(Some(actual));
    }
    Ok(current)
}

fn shown<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "<unreadable>".to_string())
}

fn classify_header_reserved(value: Option<u16>) -> (Validity, String) {
    match value {
        Some(0) => (Validity::Valid, "Reserved = 0".to_string()),
        Some(v) => (Validity::HardInvalid, format!("Reserved = {v}, must be 0")),
        None => (Validity::HardInvalid, "Reserved must be 2 bytes".to_string()),
    }
}

fn classify_type(value: Option<u16>) -> (Validity, String) {
    match IconKind::from_value(value) {
        IconKind::Unknown => (Validity::HardInvalid, format!("File type = Unknown ({})", shown(value))),
        kind => (Validity::Valid, format!("File type = {kind:?}")),
    }
}

fn classify_count(value: Option<u16>) -> (Validity, String) {
    match value {
        Some(n) => (Validity::Valid, format!("Image count = {n}")),
        None => (Validity::HardInvalid, "Image count must be 2 bytes".to_string()),
    }
}

fn classify_entry_byte(image: u16, field: EntryField, value: Option<u8>) -> (Validity, String) {
    let name = field.name(IconKind::Unknown);
    let Some(value) = value else {
        return (Validity::HardInvalid, format!("Image {image} {name} must be 1 byte"));
    };
    match field {
        EntryField::Reserved if value != 0 => {
            (Validity::SoftInvalid, format!("Image {image} Reserved = {value}, should be 0"))
        }
        EntryField::Width | EntryField::Height if value == 0 => {
            (Validity::Valid, format!("Image {image} {name} = 256"))
        }
        EntryField::ColorPalette if value == 0 => {
            (Validity::Valid, format!("Image {image} {name} = N/A"))
        }
        _ => (Validity::Valid, format!("Image {image} {name} = {value}")),
    }
}

fn classify_variable(image: u16, field: EntryField, kind: IconKind, value: Option<u16>) -> (Validity, String) {
    let name = field.name(kind);
    let Some(value) = value else {
        return (Validity::HardInvalid, format!("Image {image} {name} must be 2 bytes"));
    };
    let validity = match (kind, field) {
        (IconKind::Icon, EntryField::Variable1) => Validity::from_bool(value <= 1, Validity::HardInvalid),
        (IconKind::Unknown, _) => Validity::Unknown,
        _ => Validity::Valid,
    };
    (validity, format!("Image {image} {name} = {value}"))
}

fn classify_length(image: u16, length: Option<u32>, offset: Option<u32>, total: u64) -> (Validity, String) {
    match (length, offset) {
        (Some(length), Some(offset)) => {
            let fits = u64::from(offset) + u64::from(length) <= total;
            let description = if fits {
                format!("Image {image} Length = {length}")
            } else {
                format!("Image {image} Length = {length}, runs past the end of the file")
            };
            (Validity::from_bool(fits, Validity::HardInvalid), description)
        }
        (Some(length), None) => (
            Validity::Unknown,
            format!("Image {image} Length = {length}, offset unreadable"),
        ),
        (None, _) => (Validity::HardInvalid, format!("Image {image} Length must be 4 bytes")),
    }
}

fn classify_offset(image: u16, offset: Option<u32>, count: Option<u16>) -> (Validity, String) {
    let Some(offset) = offset else {
        return (Validity::HardInvalid, format!("Image {image} Offset must be 4 bytes"));
    };
    let directory_end = HEADER_LEN + ENTRY_LEN * u64::from(count.unwrap_or(0));
    if u64::from(offset) >= directory_end {
        (Validity::Valid, format!("Image {image} Offset = {offset}"))
    } else {
        (
            Validity::HardInvalid,
            format!("Image {image} Offset = {offset}, inside the directory"),
        )
    }
}
