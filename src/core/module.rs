//! Format module contract
//!
//! Every container format implements [`FormatModule`]. The engine calls the
//! stages separately so a localized edit only re-runs the minimum:
//! - `parse` once per load (pure, emits references in byte order)
//! - `update_variables` repeatedly, cursor driven, to (re)annotate metadata
//! - `update_validity` per fragment, writing verdicts and auto-fixes
//! - `finalize` once on the reassembled file

use crate::core::fragment::{Fragment, FragmentReference};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How chunked formats find chunk boundaries while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    /// Trust the declared chunk lengths
    #[default]
    Static,
    /// Search forward for the next recognisable chunk type
    Dynamic,
}

/// Knobs shared by the built-in modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleOptions {
    /// Rewrite length fields to match edited data
    pub fix_length: bool,
    /// Rewrite offset fields to match edited layouts
    pub fix_offset: bool,
    /// Rewrite checksums to match edited data
    pub fix_crc: bool,
    pub scan_mode: ScanMode,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        ModuleOptions {
            fix_length: true,
            fix_offset: true,
            fix_crc: true,
            scan_mode: ScanMode::Static,
        }
    }
}

impl ModuleOptions {
    /// All auto-fixes disabled
    pub fn report_only() -> Self {
        ModuleOptions {
            fix_length: false,
            fix_offset: false,
            fix_crc: false,
            ..Default::default()
        }
    }
}

/// A container format that can be decomposed, annotated, validated and rebuilt
pub trait FormatModule: Send {
    /// Name shown to users and used as the registry key
    fn display_name(&self) -> &'static str;

    /// Save dialog filters, `"Description (*.ext)|*.ext"`
    fn save_filters(&self) -> Vec<String>;

    /// Open dialog filters; defaults to the save filters
    fn open_filters(&self) -> Vec<String> {
        self.save_filters()
    }

    /// Whether the module keeps metadata at all; when false the engine skips
    /// every variable pass
    fn uses_variables(&self) -> bool {
        false
    }

    /// Decompose `path` into byte-ordered references
    ///
    /// # Errors
    ///
    /// Returns [`crate::PhoenixError::ModuleParse`] when the input cannot be read as
    /// this format at all.
    fn parse(&mut self, path: &Path) -> Result<Vec<FragmentReference>>;

    /// Annotate fragments starting at `cursor`
    ///
    /// Pushes every index whose metadata changed into `changed` and moves `cursor`
    /// past the fragments it handled. Returns `true` when the engine should call
    /// again with the new cursor.
    fn update_variables(
        &mut self,
        _fragments: &mut [Fragment],
        _cursor: &mut usize,
        _changed: &mut Vec<usize>,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Classify fragment `index` and anything its correctness entails
    fn update_validity(&mut self, fragments: &mut [Fragment], index: usize) -> Result<()>;

    /// Last fix-up on the reassembled file
    fn finalize(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
