//! ISO base media box trees (MP4, QuickTime, 3GP, JPEG 2000, ...)
//!
//! Every box is `length(u32 BE) type(4) [extended length(u64 BE)] [extended
//! type(16)] data`. A length of 1 means the extended length holds the real
//! size, a length of 0 means the box runs to the end of the file, and the
//! `uuid` type is followed by a 16-byte extended type. Known container boxes
//! are split into their children when those tile the payload exactly.

use super::{group_names, leaf_name, numbered, relabel, Fields, Live, Parsed};
use crate::core::binary::{self, BigEndian};
use crate::core::fragment::{Fragment, FragmentReference, Metadata, Validity};
use crate::core::module::{FormatModule, ModuleOptions};
use crate::error::{PhoenixError, Result};
use byteorder::ByteOrder;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const NAME: &str = "ISO Base Media Format/Quicktime";

/// Nesting limit for container boxes
const MAX_DEPTH: usize = 16;

const CONTAINERS: &[&[u8; 4]] = &[
    b"moov", b"trak", b"tref", b"edts", b"mdia", b"minf", b"dinf", b"stbl", b"mvex", b"moof",
    b"traf", b"mfra", b"udta", b"sinf", b"schi",
];

/// Header field or payload of a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BoxPart {
    Length,
    Type,
    ExtendedLength,
    ExtendedType,
    Data,
}

impl BoxPart {
    fn name(self) -> &'static str {
        match self {
            BoxPart::Length => "Length",
            BoxPart::Type => "Type",
            BoxPart::ExtendedLength => "Extended Length",
            BoxPart::ExtendedType => "Extended Type",
            BoxPart::Data => "Data",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Length" => BoxPart::Length,
            "Type" => BoxPart::Type,
            "Extended Length" => BoxPart::ExtendedLength,
            "Extended Type" => BoxPart::ExtendedType,
            "Data" => BoxPart::Data,
            _ => return None,
        })
    }
}

/// Part of the box at `path`, 1-based box numbers from the top level down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoxField {
    pub part: BoxPart,
    pub path: Vec<u32>,
}

/// Module for ISO base media and QuickTime files
#[derive(Debug, Clone)]
pub struct IsoBaseMedia {
    options: ModuleOptions,
    tree: Tree,
}

impl IsoBaseMedia {
    pub fn new(options: ModuleOptions) -> Self {
        IsoBaseMedia {
            options,
            tree: Tree::default(),
        }
    }

    /// Make the length field of `path` match the bytes under it
    fn fix_length(&mut self, fragments: &mut [Fragment], path: &[u32]) -> Result<()> {
        let size = self.tree.total(path);
        let written = match (self.tree.find(path, BoxPart::ExtendedLength), self.tree.find(path, BoxPart::Length)) {
            (Some(i), _) => {
                let stale = binary::read_u64::<BigEndian>(&fragments[i])? != Some(size);
                if stale {
                    binary::write_u64::<BigEndian>(&fragments[i], size)?;
                }
                stale.then_some(i)
            }
            (None, Some(i)) => {
                let current = binary::read_u32::<BigEndian>(&fragments[i])?;
                let to_end = current == Some(0) && self.tree.is_last_top_level(path);
                match u32::try_from(size) {
                    Ok(size) if !to_end && current != Some(size) => {
                        binary::write_u32::<BigEndian>(&fragments[i], size)?;
                        Some(i)
                    }
                    _ => None,
                }
            }
            (None, None) => None,
        };
        if let Some(i) = written {
            self.tree.resize(&Live(fragments), i)?;
        }
        Ok(())
    }

    fn rejudge(&self, fragments: &mut [Fragment], index: usize) -> Result<()> {
        let (validity, description) = judge(&Live(fragments), &self.tree, index)?;
        fragments[index].mark(validity, description);
        Ok(())
    }
}

impl FormatModule for IsoBaseMedia {
    fn display_name(&self) -> &'static str {
        NAME
    }

    fn save_filters(&self) -> Vec<String> {
        [
            "3rd Generation Partnership Program (*.3g2;*.3gp;*.3gpp)|*.3g2;*.3gp;*.3gpp",
            "Digital Video Broadcasting (*.dvb)|*.dvb",
            "Adobe Flash Protected Audio/Video (*.f4a;*.f4b;*.f4p;*.f4v)|*.f4a;*.f4b;*.f4p;*.f4v",
            "JPEG 2000 (*.jp2;*.jpm;*.jpx)|*.jp2;*.jpm;*.jpx",
            "MPEG-4 Audio (*.m4a;*.m4b;*.m4p)|*.m4a;*.m4b;*.m4p",
            "Apple DRM Protected Video (*.m4v)|*.m4v",
            "Motion JPEG 2000 (*.mj2;*.mjp2)|*.mj2;*.mjp2",
            "Apple Quicktime (*.mov;*.qt)|*.mov;*.qt",
            "MPEG-4 Video (*.mp4)|*.mp4",
            "Sony Movie Format (*.mqv)|*.mqv",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn open_filters(&self) -> Vec<String> {
        let mut filters = vec![
            "ISO Base Media File Format Based (*.3gp;*.m4a;*.m4v;*.mov;*.mp4...)|*.3g2;*.3gp;*.3gpp;*.dvb;\
             *.f4a;*.f4b;*.f4p;*.f4v;*.jp2;*.jpm;*.jpx;*.m4a;*.m4b;*.m4p;*.m4v;*.mj2;*.mjp2;*.mov;*.qt;\
             *.mp4;*.mqv"
                .to_string(),
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
        decompose(&bytes)
    }

    fn update_variables(
        &mut self,
        fragments: &mut [Fragment],
        cursor: &mut usize,
        changed: &mut Vec<usize>,
    ) -> Result<bool> {
        relabel(fragments, cursor, changed, label);
        self.tree = Tree::build(&Live(fragments))?;
        Ok(false)
    }

    fn update_validity(&mut self, fragments: &mut [Fragment], index: usize) -> Result<()> {
        let Metadata::Box(field) = fragments[index].metadata.clone() else {
            fragments[index].mark(Validity::Unknown, "Not part of the box tree");
            return Ok(());
        };
        if self.tree.count != fragments.len() {
            self.tree = Tree::build(&Live(fragments))?;
        } else {
            self.tree.resize(&Live(fragments), index)?;
        }

        // boxes whose length fields may have to change, innermost first
        let chain: Vec<&[u32]> = match field.part {
            BoxPart::Data => (1..=field.path.len()).rev().map(|n| &field.path[..n]).collect(),
            _ => vec![field.path.as_slice()],
        };
        if field.part == BoxPart::Data && self.options.fix_length {
            for path in &chain {
                self.fix_length(fragments, path)?;
            }
        }

        self.rejudge(fragments, index)?;
        let mut dependents = Vec::new();
        for path in &chain {
            for part in [BoxPart::Length, BoxPart::ExtendedLength, BoxPart::Data] {
                if let Some(i) = self.tree.find(path, part) {
                    if i != index {
                        dependents.push(i);
                    }
                }
            }
        }
        for i in dependents {
            self.rejudge(fragments, i)?;
        }
        Ok(())
    }
}

type Span = (usize, usize);

/// Header layout of one box, clamped to its enclosing range
#[derive(Debug, Clone)]
struct BoxHeader {
    length: Span,
    kind: Span,
    extended_length: Option<Span>,
    extended_type: Option<Span>,
    data: Span,
    declared: Option<u32>,
    /// Every field is complete and the declared size fits the range
    exact: bool,
}

impl BoxHeader {
    fn read(bytes: &[u8], pos: usize, end: usize) -> Self {
        let clamp = |from: usize, len: usize| -> Span {
            let start = from.min(end);
            (start, len.min(end - start))
        };
        let length = clamp(pos, 4);
        let declared = (length.1 == 4).then(|| BigEndian::read_u32(&bytes[length.0..length.0 + 4]));
        let kind = clamp(length.0 + length.1, 4);
        let mut cursor = kind.0 + kind.1;

        let extended_length = (declared == Some(1)).then(|| clamp(cursor, 8));
        if let Some(s) = extended_length {
            cursor = s.0 + s.1;
        }
        let extended_type = (&bytes[kind.0..kind.0 + kind.1] == b"uuid").then(|| clamp(cursor, 16));
        if let Some(s) = extended_type {
            cursor = s.0 + s.1;
        }

        let header_len = (cursor - pos) as u64;
        let box_size = match declared {
            Some(1) => extended_length
                .filter(|s| s.1 == 8)
                .map(|s| BigEndian::read_u64(&bytes[s.0..s.0 + 8])),
            Some(0) => Some((end - pos) as u64),
            Some(n) => Some(u64::from(n)),
            None => None,
        };
        let wanted = box_size.map_or(0, |s| s.saturating_sub(header_len));
        let data = clamp(cursor, usize::try_from(wanted).unwrap_or(usize::MAX));

        let complete = length.1 == 4
            && kind.1 == 4
            && extended_length.map_or(true, |s| s.1 == 8)
            && extended_type.map_or(true, |s| s.1 == 16);
        let exact = complete
            && box_size.is_some_and(|s| s >= header_len && (pos as u64).saturating_add(s) <= end as u64);

        BoxHeader {
            length,
            kind,
            extended_length,
            extended_type,
            data,
            declared,
            exact,
        }
    }

    fn end(&self) -> usize {
        self.data.0 + self.data.1
    }

    fn is_container(&self, bytes: &[u8]) -> bool {
        let kind = &bytes[self.kind.0..self.kind.0 + self.kind.1];
        CONTAINERS.iter().any(|c| c.as_slice() == kind)
    }
}

/// Headers of boxes tiling `[start, end)` exactly, if they do
fn children(bytes: &[u8], start: usize, end: usize) -> Option<Vec<BoxHeader>> {
    let mut pos = start;
    let mut out = Vec::new();
    while pos < end {
        let header = BoxHeader::read(bytes, pos, end);
        if !header.exact || header.declared == Some(0) {
            return None;
        }
        pos = header.end();
        out.push(header);
    }
    (pos == end).then_some(out)
}

fn emit(bytes: &[u8], header: &BoxHeader, path: &[u32], references: &mut Vec<FragmentReference>) {
    let mut push = |span: Span, part: BoxPart| {
        let mut name: Vec<String> = path.iter().map(|n| format!("Box {n}")).collect();
        name.push(part.name().to_string());
        references.push(
            FragmentReference::new(span.0 as u64, span.1 as u64, &name).with_metadata(Metadata::Box(BoxField {
                part,
                path: path.to_vec(),
            })),
        );
    };
    push(header.length, BoxPart::Length);
    push(header.kind, BoxPart::Type);
    if let Some(span) = header.extended_length {
        push(span, BoxPart::ExtendedLength);
    }
    if let Some(span) = header.extended_type {
        push(span, BoxPart::ExtendedType);
    }

    let nested = (header.is_container(bytes) && path.len() < MAX_DEPTH && header.data.1 > 0)
        .then(|| children(bytes, header.data.0, header.end()))
        .flatten();
    match nested {
        Some(boxes) => {
            for (i, child) in boxes.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(i as u32 + 1);
                emit(bytes, child, &child_path, references);
            }
        }
        None => push(header.data, BoxPart::Data),
    }
}

/// Split a file into boxes and judge every field
fn decompose(bytes: &[u8]) -> Result<Vec<FragmentReference>> {
    let mut references = Vec::new();
    let mut pos = 0;
    let mut number = 0u32;
    while pos < bytes.len() {
        number += 1;
        let header = BoxHeader::read(bytes, pos, bytes.len());
        emit(bytes, &header, &[number], &mut references);
        pos = header.end();
    }

    let verdicts = {
        let parsed = Parsed { source: bytes, references: &references };
        let tree = Tree::build(&parsed)?;
        (0..references.len())
            .map(|i| judge(&parsed, &tree, i))
            .collect::<Result<Vec<_>>>()?
    };
    for (reference, (validity, description)) in references.iter_mut().zip(verdicts) {
        reference.validity = validity;
        reference.description = description;
    }
    Ok(references)
}

fn box_field<F: Fields>(fields: &F, index: usize) -> Option<&BoxField> {
    match fields.metadata(index) {
        Metadata::Box(field) => Some(field),
        _ => None,
    }
}

/// Where every box part sits and how many bytes each box spans
#[derive(Debug, Clone, Default)]
struct Tree {
    count: usize,
    parts: HashMap<(Vec<u32>, BoxPart), usize>,
    sizes: Vec<u64>,
    /// Bytes in each box, headers and nested boxes included
    totals: HashMap<Vec<u32>, u64>,
    last_top: Option<u32>,
}

impl Tree {
    fn build<F: Fields>(fields: &F) -> Result<Self> {
        let mut tree = Tree {
            count: fields.count(),
            sizes: vec![0; fields.count()],
            ..Tree::default()
        };
        for i in 0..fields.count() {
            let Some(field) = box_field(fields, i) else {
                continue;
            };
            let size = fields.size(i)?;
            tree.sizes[i] = size;
            tree.parts.entry((field.path.clone(), field.part)).or_insert(i);
            for depth in 1..=field.path.len() {
                *tree.totals.entry(field.path[..depth].to_vec()).or_default() += size;
            }
            tree.last_top = tree.last_top.max(field.path.first().copied());
        }
        Ok(tree)
    }

    /// Pick up a new size for fragment `index` and carry it to every enclosing box
    fn resize<F: Fields>(&mut self, fields: &F, index: usize) -> Result<()> {
        let Some(field) = box_field(fields, index) else {
            return Ok(());
        };
        let size = fields.size(index)?;
        let old = std::mem::replace(&mut self.sizes[index], size);
        if old != size {
            for depth in 1..=field.path.len() {
                let total = self.totals.entry(field.path[..depth].to_vec()).or_default();
                *total = (*total + size).saturating_sub(old);
            }
        }
        Ok(())
    }

    fn find(&self, path: &[u32], part: BoxPart) -> Option<usize> {
        self.parts.get(&(path.to_vec(), part)).copied()
    }

    fn total(&self, path: &[u32]) -> u64 {
        self.totals.get(path).copied().unwrap_or(0)
    }

    /// Whether `path` is the final top-level box, the only one allowed a zero length
    fn is_last_top_level(&self, path: &[u32]) -> bool {
        matches!(path, [top] if self.last_top == Some(*top))
    }
}

fn box_label(path: &[u32]) -> String {
    let numbers: Vec<String> = path.iter().map(u32::to_string).collect();
    format!("Box {}", numbers.join("."))
}

/// Printable four-character code, optionally `©`-prefixed
fn is_valid_type(kind: &[u8]) -> bool {
    let printable = |b: &u8| (0x20..=0x7E).contains(b);
    match kind {
        [0xA9, rest @ ..] if rest.len() == 3 => rest.iter().all(printable),
        _ => kind.len() == 4 && kind.iter().all(printable),
    }
}

fn judge<F: Fields>(fields: &F, tree: &Tree, index: usize) -> Result<(Validity, String)> {
    let Some(field) = box_field(fields, index) else {
        return Ok((Validity::Unknown, "Not part of the box tree".to_string()));
    };
    let path = field.path.as_slice();
    let name = box_label(path);
    // payloads are judged from sizes, only header fields are read
    let header = || fields.bytes(index);

    let verdict = match field.part {
        BoxPart::Length => {
            let bytes = header()?;
            match <[u8; 4]>::try_from(bytes.as_slice()) {
                Err(_) => {
                    let validity = if bytes.len() < 4 { Validity::HardInvalid } else { Validity::Unknown };
                    (validity, format!("{name} Length = <unknown>"))
                }
                Ok(raw) => {
                    let value = u32::from_be_bytes(raw);
                    if tree.find(path, BoxPart::ExtendedLength).is_some() {
                        (
                            Validity::from_bool(value == 1, Validity::HardInvalid),
                            format!("{name} Length = {value}, size in extended length"),
                        )
                    } else if value == 0 && tree.is_last_top_level(path) {
                        (Validity::Valid, format!("{name} Length = 0, extends to the end of the file"))
                    } else {
                        let size = tree.total(path);
                        (
                            Validity::from_bool(u64::from(value) == size, Validity::HardInvalid),
                            format!("{name} Length = {value}"),
                        )
                    }
                }
            }
        }
        BoxPart::ExtendedLength => match <[u8; 8]>::try_from(header()?.as_slice()) {
            Err(_) => (Validity::HardInvalid, format!("{name} Extended Length must be 8 bytes")),
            Ok(raw) => {
                let value = u64::from_be_bytes(raw);
                let size = tree.total(path);
                (
                    Validity::from_bool(value == size, Validity::HardInvalid),
                    format!("{name} Extended Length = {value}"),
                )
            }
        },
        BoxPart::Type => {
            let bytes = header()?;
            (
                Validity::from_bool(is_valid_type(&bytes), Validity::HardInvalid),
                format!("{name} Type = {}", binary::ascii_lossy(&bytes)),
            )
        }
        BoxPart::ExtendedType => {
            let bytes = header()?;
            if bytes.len() == 16 {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                (Validity::Unknown, format!("{name} Extended Type = {hex}, not yet validated"))
            } else {
                (Validity::HardInvalid, format!("{name} Extended Type must be 16 bytes"))
            }
        }
        BoxPart::Data => {
            let size = tree.total(path);
            let declared = match (tree.find(path, BoxPart::ExtendedLength), tree.find(path, BoxPart::Length)) {
                (Some(i), _) => fields.bytes(i)?.try_into().ok().map(u64::from_be_bytes),
                (None, Some(i)) => fields.bytes(i)?.try_into().ok().map(u32::from_be_bytes).map(u64::from),
                (None, None) => None,
            };
            let to_end = declared == Some(0) && tree.is_last_top_level(path);
            (
                Validity::from_bool(to_end || declared == Some(size), Validity::HardInvalid),
                format!("{name} Data length = {}", fields.size(index)?),
            )
        }
    };
    Ok(verdict)
}

fn label(fragment: &Fragment) -> Metadata {
    let part = BoxPart::from_name(&leaf_name(fragment));
    let path: Option<Vec<u32>> = group_names(fragment)
        .iter()
        .map(|group| numbered(group, "Box"))
        .collect();
    match (part, path) {
        (Some(part), Some(path)) if !path.is_empty() => Metadata::Box(BoxField { part, path }),
        _ => Metadata::None,
    }
}
