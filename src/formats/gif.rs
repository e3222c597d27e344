//! GIF87a/GIF89a section streams
//!
//! After the 13-byte header and an optional global color table a GIF is a run
//! of sections, each opened by a sentinel byte:
//! - `,` image descriptor, optional local color table, LZW sub-blocks
//! - `!` extension (plain text, graphics control, comment, application, other)
//! - `;` end of file marker
//!
//! Readers stop at the first end of file marker, so anything after it is kept
//! but reported as dead data.

use super::{group_names, leaf_name, numbered, relabel, Fields, Live, Parsed};
use crate::core::binary;
use crate::core::fragment::{Fragment, FragmentReference, Metadata, Validity};
use crate::core::module::{FormatModule, ModuleOptions};
use crate::error::{PhoenixError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const NAME: &str = "Graphics Interchange Format";

const SIGNATURES: [&[u8; 6]; 3] = [b"GIF87a", b"GIF89a", b"JIF99a"];

const IMAGE: u8 = b',';
const EXTENSION: u8 = b'!';
const TRAILER: u8 = b';';

const PLAIN_TEXT: u8 = 0x01;
const GRAPHICS_CONTROL: u8 = 0xF9;
const COMMENT: u8 = 0xFE;
const APPLICATION: u8 = 0xFF;

/// What a fragment holds within its section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GifKind {
    Signature,
    ScreenWidth,
    ScreenHeight,
    GlobalPacked,
    BackgroundColorIndex,
    PixelAspectRatio,
    GlobalColorTable,
    Sentinel { expected: u8 },
    XOffset,
    YOffset,
    Width,
    Height,
    LocalPacked,
    LocalColorTable,
    MinimumCodeSize,
    ExtensionType,
    BlockSize { expected: u8 },
    CellWidth,
    CellHeight,
    ColorIndex,
    GraphicsPacked,
    DelayTime,
    ApplicationIdentifier,
    AuthenticationCode,
    SubBlockLength { block: u32 },
    SubBlockData { block: u32, text: bool },
    Terminator,
    EndOfFile,
    UnknownSection,
}

/// Section number (0 for the header) and role of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GifField {
    pub section: u32,
    pub kind: GifKind,
}

impl GifField {
    fn new(section: u32, kind: GifKind) -> Self {
        GifField { section, kind }
    }
}

/// Module for `.gif` and `.jif` files
#[derive(Debug, Clone)]
pub struct GraphicsInterchange {
    options: ModuleOptions,
    /// Section of the first intact end of file marker
    terminator: Option<u32>,
    layout: Layout,
}

impl GraphicsInterchange {
    pub fn new(options: ModuleOptions) -> Self {
        GraphicsInterchange {
            options,
            terminator: None,
            layout: Layout::default(),
        }
    }

    /// Section number of the end of file marker readers will stop at
    pub fn first_terminator(&self) -> Option<u32> {
        self.terminator
    }

    fn rejudge(&self, fragments: &mut [Fragment], index: usize, pass: &Pass) -> Result<()> {
        let (validity, description) = judge(&Live(fragments), &self.layout, pass, index)?;
        fragments[index].mark(validity, description);
        Ok(())
    }

    /// Rewrite the length byte in front of an edited sub-block
    fn fix_sub_block(&self, fragments: &mut [Fragment], index: usize, section: u32, block: u32) -> Result<()> {
        if !self.options.fix_length {
            return Ok(());
        }
        let size = fragments[index].size()?;
        let Some(length_at) = self.layout.first(section, GifKind::SubBlockLength { block }) else {
            return Ok(());
        };
        if (1..=255).contains(&size) && binary::read_u8(&fragments[length_at])? != Some(size as u8) {
            fragments[length_at].write(&[size as u8])?;
        }
        Ok(())
    }

    /// Fields whose verdict depends on the one at `field`
    fn dependents(&self, field: GifField) -> Vec<usize> {
        let layout = &self.layout;
        let same = |kind: GifKind| layout.at(field.section, kind).to_vec();
        match field.kind {
            GifKind::XOffset => same(GifKind::Width),
            GifKind::Width => same(GifKind::XOffset),
            GifKind::YOffset => same(GifKind::Height),
            GifKind::Height => same(GifKind::YOffset),
            GifKind::ScreenWidth => layout.all_of(&[GifKind::XOffset, GifKind::Width]),
            GifKind::ScreenHeight => layout.all_of(&[GifKind::YOffset, GifKind::Height]),
            GifKind::GlobalPacked => layout.all_of(&[
                GifKind::GlobalColorTable,
                GifKind::BackgroundColorIndex,
                GifKind::ColorIndex,
            ]),
            GifKind::LocalPacked => same(GifKind::LocalColorTable),
            GifKind::SubBlockData { block, .. } => same(GifKind::SubBlockLength { block }),
            GifKind::SubBlockLength { block } => layout.sub_block_data(field.section, block).into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

impl FormatModule for GraphicsInterchange {
    fn display_name(&self) -> &'static str {
        NAME
    }

    fn save_filters(&self) -> Vec<String> {
        vec![
            "Graphics Interchange Format (*.gif)|*.gif".to_string(),
            "Jeff's Image Format (*.jif)|*.jif".to_string(),
        ]
    }

    fn open_filters(&self) -> Vec<String> {
        let mut filters = vec!["Graphics Interchange Format Based (*.gif;*.jif)|*.gif;*.jif".to_string()];
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
        let references = decompose(&bytes)?;
        let parsed = Parsed { source: &bytes, references: &references };
        self.layout = Layout::build(&parsed);
        self.terminator = first_valid_eof(&parsed, &self.layout)?
            .and_then(|i| parsed.field(i))
            .map(|f| f.section);
        Ok(references)
    }

    fn update_variables(
        &mut self,
        fragments: &mut [Fragment],
        cursor: &mut usize,
        changed: &mut Vec<usize>,
    ) -> Result<bool> {
        relabel(fragments, cursor, changed, label);
        let live = Live(fragments);
        self.layout = Layout::build(&live);
        if self.terminator.is_none() {
            self.terminator = first_valid_eof(&live, &self.layout)?
                .and_then(|i| live.field(i))
                .map(|f| f.section);
        }
        Ok(false)
    }

    fn update_validity(&mut self, fragments: &mut [Fragment], index: usize) -> Result<()> {
        if self.layout.count != fragments.len() {
            self.layout = Layout::build(&Live(fragments));
        }
        let Some(field) = Live(fragments).field(index) else {
            fragments[index].mark(Validity::Unknown, "Not part of the GIF layout");
            return Ok(());
        };

        if let GifKind::SubBlockData { block, .. } = field.kind {
            self.fix_sub_block(fragments, index, field.section, block)?;
        }

        let old = self.terminator.and_then(|section| self.layout.first(section, GifKind::EndOfFile));
        let pass = {
            let live = Live(fragments);
            let new = first_valid_eof(&live, &self.layout)?;
            self.terminator = new.and_then(|i| live.field(i)).map(|f| f.section);
            Pass::new(&live, new)?
        };
        let new = pass.terminator;

        self.rejudge(fragments, index, &pass)?;
        for i in self.dependents(field) {
            self.rejudge(fragments, i, &pass)?;
        }

        if old != new {
            debug!("First end of file marker moved from {:?} to {:?}", old, new);
            let last = fragments.len().saturating_sub(1);
            let (lo, hi) = match (old, new) {
                (Some(a), Some(b)) => (a.min(b), a.max(b)),
                (Some(a), None) | (None, Some(a)) => (a, last),
                (None, None) => (last, last),
            };
            for i in (lo + 1)..=hi.min(last) {
                if i != index {
                    self.rejudge(fragments, i, &pass)?;
                }
            }
        }
        // dead data decides whether the marker ends the file
        if let Some(t) = new {
            if index > t {
                self.rejudge(fragments, t, &pass)?;
            }
        }
        Ok(())
    }
}

/// GIF view over shared field access
trait GifFields: Fields {
    fn field(&self, index: usize) -> Option<GifField> {
        match self.metadata(index) {
            Metadata::Gif(field) => Some(*field),
            _ => None,
        }
    }
}

impl<T: Fields> GifFields for T {}

/// Positions of every labelled field, rebuilt whenever labels may change
#[derive(Debug, Clone, Default)]
struct Layout {
    count: usize,
    fields: HashMap<GifField, Vec<usize>>,
    kinds: HashMap<GifKind, Vec<usize>>,
}

impl Layout {
    fn build<F: Fields>(fields: &F) -> Self {
        let mut layout = Layout {
            count: fields.count(),
            ..Layout::default()
        };
        for i in 0..fields.count() {
            if let Some(field) = fields.field(i) {
                layout.fields.entry(field).or_default().push(i);
                layout.kinds.entry(field.kind).or_default().push(i);
            }
        }
        layout
    }

    fn at(&self, section: u32, kind: GifKind) -> &[usize] {
        self.fields
            .get(&GifField::new(section, kind))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn first(&self, section: u32, kind: GifKind) -> Option<usize> {
        self.at(section, kind).first().copied()
    }

    fn all(&self, kind: GifKind) -> &[usize] {
        self.kinds.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every field of any of `kinds`, ascending
    fn all_of(&self, kinds: &[GifKind]) -> Vec<usize> {
        let mut found: Vec<usize> = kinds.iter().flat_map(|&k| self.all(k)).copied().collect();
        found.sort_unstable();
        found
    }

    fn sub_block_data(&self, section: u32, block: u32) -> Option<usize> {
        [true, false]
            .into_iter()
            .filter_map(|text| self.first(section, GifKind::SubBlockData { block, text }))
            .min()
    }
}

/// Marker position and dead data size shared by every verdict of one pass
#[derive(Debug, Clone, Copy)]
struct Pass {
    terminator: Option<usize>,
    trailing: u64,
}

impl Pass {
    fn new<F: Fields>(fields: &F, terminator: Option<usize>) -> Result<Self> {
        let mut trailing = 0u64;
        if let Some(t) = terminator {
            for i in (t + 1)..fields.count() {
                trailing += fields.size(i)?;
            }
        }
        Ok(Pass { terminator, trailing })
    }
}

/// Clamped forward reader that records one reference per field
struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    references: Vec<FragmentReference>,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Scanner { bytes, pos: 0, references: Vec::new() }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Take up to `len` bytes as one field; returns what was taken
    fn take<S: AsRef<str>>(&mut self, len: usize, name: &[S], field: GifField) -> &'a [u8] {
        let start = self.pos.min(self.bytes.len());
        let end = start.saturating_add(len).min(self.bytes.len());
        self.references.push(
            FragmentReference::new(start as u64, (end - start) as u64, name)
                .with_metadata(Metadata::Gif(field)),
        );
        self.pos = end;
        &self.bytes[start..end]
    }

    /// Length-prefixed sub-blocks up to and including the zero terminator
    fn sub_blocks(&mut self, group: &str, section: u32, prefix: &str, text: bool) {
        let extension = if text { "txt" } else { "raw" };
        let mut block = 0u32;
        while let Some(length) = self.peek().filter(|&b| b != 0) {
            block += 1;
            self.take(1, &[group.to_string(), format!("{prefix} {block} Length")],
                GifField::new(section, GifKind::SubBlockLength { block }));
            self.take(usize::from(length), &[group.to_string(), format!("{prefix} {block} Data.{extension}")],
                GifField::new(section, GifKind::SubBlockData { block, text }));
        }
        self.take(1, &[group, "Block Terminator"], GifField::new(section, GifKind::Terminator));
    }

    fn extent(&mut self, group: &str, section: u32) {
        for (leaf, kind) in [
            ("X Offset", GifKind::XOffset),
            ("Y Offset", GifKind::YOffset),
            ("Width", GifKind::Width),
            ("Height", GifKind::Height),
        ] {
            self.take(2, &[group, leaf], GifField::new(section, kind));
        }
    }

    fn image(&mut self, section: u32) {
        let group = format!("Image {section}");
        let g = group.as_str();
        self.take(1, &[g, "Sentinel"], GifField::new(section, GifKind::Sentinel { expected: IMAGE }));
        self.extent(g, section);
        let packed = self.take(1, &[g, "Packed Byte"], GifField::new(section, GifKind::LocalPacked));
        if let Some(entries) = packed.first().and_then(|&p| table_entries(p)) {
            self.take(3 * entries as usize, &[g, "Local Color Table"],
                GifField::new(section, GifKind::LocalColorTable));
        }
        self.take(1, &[g, "Minimum Code Size"], GifField::new(section, GifKind::MinimumCodeSize));
        self.sub_blocks(g, section, "Image Data", false);
    }

    fn extension(&mut self, section: u32) {
        let group = format!("Extension {section}");
        let g = group.as_str();
        let field = |kind| GifField::new(section, kind);
        self.take(1, &[g, "Sentinel"], field(GifKind::Sentinel { expected: EXTENSION }));
        let label = self.take(1, &[g, "Type"], field(GifKind::ExtensionType)).first().copied();

        match label {
            Some(PLAIN_TEXT) => {
                self.take(1, &[g, "Plain Text Block Size"], field(GifKind::BlockSize { expected: 12 }));
                self.extent(g, section);
                self.take(1, &[g, "Character Cell Width"], field(GifKind::CellWidth));
                self.take(1, &[g, "Character Cell Height"], field(GifKind::CellHeight));
                self.take(1, &[g, "Text Color Index"], field(GifKind::ColorIndex));
                self.take(1, &[g, "Text Background Color Index"], field(GifKind::ColorIndex));
                self.sub_blocks(g, section, "Plain Text", true);
            }
            Some(GRAPHICS_CONTROL) => {
                self.take(1, &[g, "Graphics Control Block Size"], field(GifKind::BlockSize { expected: 4 }));
                self.take(1, &[g, "Packed Byte"], field(GifKind::GraphicsPacked));
                self.take(2, &[g, "Delay Time"], field(GifKind::DelayTime));
                self.take(1, &[g, "Transparent Color Index"], field(GifKind::ColorIndex));
                self.take(1, &[g, "Block Terminator"], field(GifKind::Terminator));
            }
            Some(COMMENT) => self.sub_blocks(g, section, "Comment", true),
            Some(APPLICATION) => {
                self.take(1, &[g, "Application Block Size"], field(GifKind::BlockSize { expected: 11 }));
                self.take(8, &[g, "Application Identifier"], field(GifKind::ApplicationIdentifier));
                self.take(3, &[g, "Authentication Code"], field(GifKind::AuthenticationCode));
                self.sub_blocks(g, section, "Application", false);
            }
            _ => self.sub_blocks(g, section, "Unknown Data", false),
        }
    }

    fn unknown(&mut self, section: u32) {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .skip(1)
            .position(|b| matches!(*b, IMAGE | EXTENSION | TRAILER))
            .map_or(rest.len(), |p| p + 1);
        self.take(len, &[format!("Unknown Section {section}")],
            GifField::new(section, GifKind::UnknownSection));
    }
}

/// Split a GIF into references and judge every field
fn decompose(bytes: &[u8]) -> Result<Vec<FragmentReference>> {
    let mut scanner = Scanner::new(bytes);
    let header = |kind| GifField::new(0, kind);
    scanner.take(6, &["Header", "Signature"], header(GifKind::Signature));
    scanner.take(2, &["Header", "Logical Screen Descriptor", "Width"], header(GifKind::ScreenWidth));
    scanner.take(2, &["Header", "Logical Screen Descriptor", "Height"], header(GifKind::ScreenHeight));
    let packed = scanner.take(1, &["Header", "Packed Byte"], header(GifKind::GlobalPacked));
    let entries = packed.first().and_then(|&p| table_entries(p));
    scanner.take(1, &["Header", "Background Color Index"], header(GifKind::BackgroundColorIndex));
    scanner.take(1, &["Header", "Pixel Aspect Ratio"], header(GifKind::PixelAspectRatio));
    if let Some(entries) = entries {
        scanner.take(3 * entries as usize, &["Header", "Global Color Table"], header(GifKind::GlobalColorTable));
    }

    let mut section = 0u32;
    while !scanner.at_end() {
        section += 1;
        match scanner.peek() {
            Some(IMAGE) => scanner.image(section),
            Some(EXTENSION) => scanner.extension(section),
            Some(TRAILER) => {
                scanner.take(1, &[format!("End Of File Marker {section}")],
                    GifField::new(section, GifKind::EndOfFile));
            }
            _ => scanner.unknown(section),
        }
    }

    let mut references = scanner.references;
    let verdicts = {
        let parsed = Parsed { source: bytes, references: &references };
        let layout = Layout::build(&parsed);
        let pass = Pass::new(&parsed, first_valid_eof(&parsed, &layout)?)?;
        (0..references.len())
            .map(|i| judge(&parsed, &layout, &pass, i))
            .collect::<Result<Vec<_>>>()?
    };
    for (reference, (validity, description)) in references.iter_mut().zip(verdicts) {
        reference.validity = validity;
        reference.description = description;
    }
    Ok(references)
}

/// Color table entries from a packed byte, `None` when the table is absent
fn table_entries(packed: u8) -> Option<u32> {
    (packed & 0x80 != 0).then(|| 1u32 << ((packed & 0x07) + 1))
}

fn first_valid_eof<F: Fields>(fields: &F, layout: &Layout) -> Result<Option<usize>> {
    for &i in layout.all(GifKind::EndOfFile) {
        if fields.bytes(i)? == [TRAILER] {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn u16_le(bytes: &[u8]) -> Option<u16> {
    <[u8; 2]>::try_from(bytes).ok().map(u16::from_le_bytes)
}

fn u8_of(bytes: &[u8]) -> Option<u8> {
    match bytes {
        [b] => Some(*b),
        _ => None,
    }
}

fn value_of<F: Fields>(fields: &F, at: Option<usize>) -> Result<Option<Vec<u8>>> {
    match at {
        Some(i) => Ok(Some(fields.bytes(i)?)),
        None => Ok(None),
    }
}

fn global_entries<F: Fields>(fields: &F, layout: &Layout) -> Result<Option<u32>> {
    let packed = value_of(fields, layout.first(0, GifKind::GlobalPacked))?;
    Ok(packed.as_deref().and_then(u8_of).and_then(table_entries))
}

fn screen<F: Fields>(fields: &F, layout: &Layout, kind: GifKind) -> Result<Option<u16>> {
    Ok(value_of(fields, layout.first(0, kind))?.as_deref().and_then(u16_le))
}

/// Verdict for fragment `index` given the first live end of file marker
fn judge<F: Fields>(fields: &F, layout: &Layout, pass: &Pass, index: usize) -> Result<(Validity, String)> {
    let Some(GifField { section, kind }) = fields.field(index) else {
        return Ok((Validity::Unknown, "Not part of the GIF layout".to_string()));
    };
    if pass.terminator.is_some_and(|t| index > t) {
        return Ok((Validity::SoftInvalid, "Ignored, follows the end of file marker".to_string()));
    }
    let bytes = fields.bytes(index)?;

    let verdict = match kind {
        GifKind::Signature => {
            let text = binary::ascii_lossy(&bytes);
            let known = SIGNATURES.iter().any(|s| s.as_slice() == bytes.as_slice());
            (Validity::from_bool(known, Validity::HardInvalid), format!("File header = {text}"))
        }
        GifKind::ScreenWidth | GifKind::ScreenHeight => {
            let name = if kind == GifKind::ScreenWidth { "Width" } else { "Height" };
            match u16_le(&bytes) {
                Some(v) => (Validity::Valid, format!("Screen {name} = {v}")),
                None => (Validity::HardInvalid, format!("Screen {name} must be 2 bytes")),
            }
        }
        GifKind::GlobalPacked => match u8_of(&bytes) {
            Some(p) => (
                Validity::Valid,
                format!(
                    "Global color table: exists = {}, color resolution = {}, sorted = {}, entries = {}",
                    p & 0x80 != 0,
                    ((p >> 4) & 0x07) + 1,
                    p & 0x08 != 0,
                    1u32 << ((p & 0x07) + 1)
                ),
            ),
            None => (Validity::HardInvalid, "Packed byte must be 1 byte".to_string()),
        },
        GifKind::BackgroundColorIndex | GifKind::ColorIndex => {
            color_index(u8_of(&bytes), global_entries(fields, layout)?)
        }
        GifKind::PixelAspectRatio => match u8_of(&bytes) {
            Some(0) => (Validity::Valid, "Pixel aspect ratio not given".to_string()),
            Some(n) => (Validity::Valid, format!("Pixel aspect ratio = {}/64", u32::from(n) + 15)),
            None => (Validity::HardInvalid, "Pixel aspect ratio must be 1 byte".to_string()),
        },
        GifKind::GlobalColorTable => color_table("Global", bytes.len(), global_entries(fields, layout)?),
        GifKind::LocalColorTable => {
            let packed = value_of(fields, layout.first(section, GifKind::LocalPacked))?;
            let entries = packed.as_deref().and_then(u8_of).and_then(table_entries);
            color_table("Local", bytes.len(), entries)
        }
        GifKind::Sentinel { expected } => (
            Validity::from_bool(bytes == [expected], Validity::HardInvalid),
            format!("Sentinel = {}", binary::ascii_lossy(&bytes)),
        ),
        GifKind::XOffset | GifKind::Width | GifKind::YOffset | GifKind::Height => {
            let horizontal = matches!(kind, GifKind::XOffset | GifKind::Width);
            let is_offset = matches!(kind, GifKind::XOffset | GifKind::YOffset);
            let partner = match kind {
                GifKind::XOffset => GifKind::Width,
                GifKind::Width => GifKind::XOffset,
                GifKind::YOffset => GifKind::Height,
                _ => GifKind::YOffset,
            };
            let other = value_of(fields, layout.first(section, partner))?.as_deref().and_then(u16_le);
            let limit = screen(fields, layout, if horizontal { GifKind::ScreenWidth } else { GifKind::ScreenHeight })?;
            let name = match kind {
                GifKind::XOffset => "X Offset",
                GifKind::Width => "Width",
                GifKind::YOffset => "Y Offset",
                _ => "Height",
            };
            match (u16_le(&bytes), other, limit) {
                (None, ..) => (Validity::HardInvalid, format!("{name} must be 2 bytes")),
                (Some(v), Some(o), Some(max)) => {
                    let fits = u32::from(v) + u32::from(o) <= u32::from(max);
                    let description = if fits {
                        format!("{name} = {v}")
                    } else {
                        let axis = if horizontal { "width" } else { "height" };
                        let (offset, size) = if is_offset { (v, o) } else { (o, v) };
                        format!("{name} = {v}, {offset} + {size} exceeds the screen {axis} {max}")
                    };
                    (Validity::from_bool(fits, Validity::HardInvalid), description)
                }
                (Some(v), ..) => (Validity::Unknown, format!("{name} = {v}")),
            }
        }
        GifKind::LocalPacked => match u8_of(&bytes) {
            Some(p) => (
                Validity::Valid,
                format!(
                    "Local color table: exists = {}, interlaced = {}, sorted = {}, entries = {}",
                    p & 0x80 != 0,
                    p & 0x40 != 0,
                    p & 0x20 != 0,
                    1u32 << ((p & 0x07) + 1)
                ),
            ),
            None => (Validity::HardInvalid, "Packed byte must be 1 byte".to_string()),
        },
        GifKind::MinimumCodeSize => match u8_of(&bytes) {
            Some(n) if (2..=8).contains(&n) => (Validity::Valid, format!("LZW minimum code size = {n}")),
            Some(n) => (Validity::HardInvalid, format!("LZW minimum code size = {n}, must be 2 to 8")),
            None => (Validity::HardInvalid, "LZW minimum code size must be 1 byte".to_string()),
        },
        GifKind::ExtensionType => match u8_of(&bytes) {
            Some(t @ (PLAIN_TEXT | GRAPHICS_CONTROL | COMMENT | APPLICATION)) => {
                (Validity::Valid, format!("Extension type = {}", extension_name(t)))
            }
            Some(t) => (Validity::Unknown, format!("Extension type = 0x{t:02X}, not recognized")),
            None => (Validity::HardInvalid, "Extension type must be 1 byte".to_string()),
        },
        GifKind::BlockSize { expected } => match u8_of(&bytes) {
            Some(n) => (
                Validity::from_bool(n == expected, Validity::HardInvalid),
                format!("Block size = {n}, expected {expected}"),
            ),
            None => (Validity::HardInvalid, "Block size must be 1 byte".to_string()),
        },
        GifKind::CellWidth | GifKind::CellHeight => {
            let name = if kind == GifKind::CellWidth { "width" } else { "height" };
            match u8_of(&bytes) {
                Some(n) => (Validity::Valid, format!("Character cell {name} = {n}")),
                None => (Validity::HardInvalid, format!("Character cell {name} must be 1 byte")),
            }
        }
        GifKind::GraphicsPacked => match u8_of(&bytes) {
            Some(p) => {
                let disposal = (p >> 2) & 0x07;
                let method = match disposal {
                    0 => "Unspecified",
                    1 => "Do Not Dispose",
                    2 => "Restore To Background Color",
                    3 => "Restore To Previous",
                    _ => "Undefined",
                };
                (
                    Validity::from_bool(disposal <= 3 && p >> 5 == 0, Validity::SoftInvalid),
                    format!(
                        "Disposal method = {method}, user input = {}, transparent color = {}",
                        p & 0x02 != 0,
                        p & 0x01 != 0
                    ),
                )
            }
            None => (Validity::HardInvalid, "Packed byte must be 1 byte".to_string()),
        },
        GifKind::DelayTime => match u16_le(&bytes) {
            Some(n) => (Validity::Valid, format!("Delay time = {n} centiseconds")),
            None => (Validity::HardInvalid, "Delay time must be 2 bytes".to_string()),
        },
        GifKind::ApplicationIdentifier => (
            Validity::from_bool(bytes.len() == 8, Validity::HardInvalid),
            format!("Application identifier = {}", binary::ascii_lossy(&bytes)),
        ),
        GifKind::AuthenticationCode => (
            Validity::from_bool(bytes.len() == 3, Validity::HardInvalid),
            format!("Authentication code = {}", binary::ascii_lossy(&bytes)),
        ),
        GifKind::SubBlockLength { block } => {
            let data_size = match layout.sub_block_data(section, block) {
                Some(i) => Some(fields.size(i)?),
                None => None,
            };
            match (u8_of(&bytes), data_size) {
                (None, _) => (Validity::HardInvalid, format!("Sub-block {block} length must be 1 byte")),
                (Some(0), _) => (
                    Validity::HardInvalid,
                    format!("Sub-block {block} length = 0, ends the block early"),
                ),
                (Some(n), Some(size)) => (
                    Validity::from_bool(u64::from(n) == size, Validity::HardInvalid),
                    format!("Sub-block {block} length = {n}"),
                ),
                (Some(n), None) => (Validity::Unknown, format!("Sub-block {block} length = {n}")),
            }
        }
        GifKind::SubBlockData { block, text } => {
            let length = value_of(fields, layout.first(section, GifKind::SubBlockLength { block }))?;
            let declared = length.as_deref().and_then(u8_of);
            let size = bytes.len() as u64;
            let description = if text {
                String::from_utf8_lossy(&bytes).into_owned()
            } else {
                format!("Sub-block {block}, {size} bytes")
            };
            if size == 0 || size > 255 {
                (
                    Validity::HardInvalid,
                    format!("Sub-block {block} must hold 1 to 255 bytes, has {size}"),
                )
            } else {
                (
                    Validity::from_bool(declared.map(u64::from) == Some(size), Validity::HardInvalid),
                    description,
                )
            }
        }
        GifKind::Terminator => match u8_of(&bytes) {
            Some(0) => (Validity::Valid, "Block terminator".to_string()),
            Some(n) => (Validity::SoftInvalid, format!("Block terminator = {n}, should be 0")),
            None => (Validity::HardInvalid, "Block terminator must be 1 byte".to_string()),
        },
        GifKind::EndOfFile => {
            if bytes != [TRAILER] {
                (
                    Validity::Unknown,
                    "End of file marker removed or changed, using the next one".to_string(),
                )
            } else {
                let trailing = pass.trailing;
                if trailing == 0 {
                    (Validity::Valid, "End of file".to_string())
                } else {
                    (
                        Validity::SoftInvalid,
                        format!("End of file, {trailing} bytes follow and will be ignored"),
                    )
                }
            }
        }
        GifKind::UnknownSection => (
            Validity::HardInvalid,
            format!("Unrecognized section, {} bytes", bytes.len()),
        ),
    };
    Ok(verdict)
}

fn color_index(value: Option<u8>, entries: Option<u32>) -> (Validity, String) {
    match (value, entries) {
        (None, _) => (Validity::HardInvalid, "Color index must be 1 byte".to_string()),
        (Some(v), Some(n)) => (
            Validity::from_bool(u32::from(v) < n, Validity::HardInvalid),
            format!("Color index = {v} of {n}"),
        ),
        (Some(v), None) => (Validity::Unknown, format!("Color index = {v}, no global color table")),
    }
}

fn color_table(scope: &str, size: usize, entries: Option<u32>) -> (Validity, String) {
    match entries {
        Some(n) if size == 3 * n as usize => (Validity::Valid, format!("{scope} color table, {n} entries")),
        Some(n) => (
            Validity::HardInvalid,
            format!("{scope} color table is {size} bytes, packed byte says {}", 3 * n),
        ),
        None => (
            Validity::HardInvalid,
            format!("{scope} color table present but the packed byte says there is none"),
        ),
    }
}

fn extension_name(label: u8) -> &'static str {
    match label {
        PLAIN_TEXT => "Plain Text",
        GRAPHICS_CONTROL => "Graphics Control",
        COMMENT => "Comment",
        APPLICATION => "Application",
        _ => "Unknown",
    }
}

fn label(fragment: &Fragment) -> Metadata {
    let leaf = leaf_name(fragment);
    let groups = group_names(fragment);
    let field = match groups.as_slice() {
        [] => numbered(&leaf, "End Of File Marker")
            .map(|s| GifField::new(s, GifKind::EndOfFile))
            .or_else(|| numbered(&leaf, "Unknown Section").map(|s| GifField::new(s, GifKind::UnknownSection))),
        [header] if header == "Header" => {
            let kind = match leaf.as_str() {
                "Signature" => Some(GifKind::Signature),
                "Packed Byte" => Some(GifKind::GlobalPacked),
                "Background Color Index" => Some(GifKind::BackgroundColorIndex),
                "Pixel Aspect Ratio" => Some(GifKind::PixelAspectRatio),
                "Global Color Table" => Some(GifKind::GlobalColorTable),
                _ => None,
            };
            kind.map(|kind| GifField::new(0, kind))
        }
        [header, descriptor] if header == "Header" && descriptor == "Logical Screen Descriptor" => {
            let kind = match leaf.as_str() {
                "Width" => Some(GifKind::ScreenWidth),
                "Height" => Some(GifKind::ScreenHeight),
                _ => None,
            };
            kind.map(|kind| GifField::new(0, kind))
        }
        [group] => {
            let (section, image) = match numbered(group, "Image") {
                Some(s) => (Some(s), true),
                None => (numbered(group, "Extension"), false),
            };
            section.and_then(|s| section_kind(&leaf, image).map(|kind| GifField::new(s, kind)))
        }
        _ => None,
    };
    field.map(Metadata::Gif).unwrap_or_default()
}

fn section_kind(leaf: &str, image: bool) -> Option<GifKind> {
    let kind = match leaf {
        "Sentinel" => GifKind::Sentinel { expected: if image { IMAGE } else { EXTENSION } },
        "X Offset" => GifKind::XOffset,
        "Y Offset" => GifKind::YOffset,
        "Width" => GifKind::Width,
        "Height" => GifKind::Height,
        "Packed Byte" if image => GifKind::LocalPacked,
        "Packed Byte" => GifKind::GraphicsPacked,
        "Local Color Table" => GifKind::LocalColorTable,
        "Minimum Code Size" => GifKind::MinimumCodeSize,
        "Type" => GifKind::ExtensionType,
        "Plain Text Block Size" => GifKind::BlockSize { expected: 12 },
        "Graphics Control Block Size" => GifKind::BlockSize { expected: 4 },
        "Application Block Size" => GifKind::BlockSize { expected: 11 },
        "Character Cell Width" => GifKind::CellWidth,
        "Character Cell Height" => GifKind::CellHeight,
        "Text Color Index" | "Text Background Color Index" | "Transparent Color Index" => GifKind::ColorIndex,
        "Delay Time" => GifKind::DelayTime,
        "Application Identifier" => GifKind::ApplicationIdentifier,
        "Authentication Code" => GifKind::AuthenticationCode,
        "Block Terminator" => GifKind::Terminator,
        _ => return sub_block_kind(leaf),
    };
    Some(kind)
}

/// `"<prefix> n Length"` or `"<prefix> n Data"`
fn sub_block_kind(leaf: &str) -> Option<GifKind> {
    let (rest, is_length) = match leaf.strip_suffix(" Length") {
        Some(rest) => (rest, true),
        None => (leaf.strip_suffix(" Data")?, false),
    };
    let (prefix, number) = rest.rsplit_once(' ')?;
    let block = number.parse().ok()?;
    Some(if is_length {
        GifKind::SubBlockLength { block }
    } else {
        GifKind::SubBlockData { block, text: matches!(prefix, "Plain Text" | "Comment") }
    })
}
