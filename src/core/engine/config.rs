//! Session configuration
//!
//! Everything a front-end can set on a session, loadable from TOML:
//!
//! ```toml
//! module = "Network Graphics"
//! working_directory = "/tmp/work"
//! fragment_extension = "bin"
//! auto_save = "ValidOnly"
//! auto_save_path = "/tmp/out.png"
//! update_delay_ms = 500
//!
//! [module_options]
//! fix_crc = false
//! ```

use crate::core::module::ModuleOptions;
use crate::core::pattern::Blacklist;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// When validity passes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValidationMode {
    /// Never; touched fragments are reset to `Unchecked`
    Never,
    /// After every reconciliation
    #[default]
    AfterChanges,
    /// Full pass right before reassembly
    OnSave,
}

/// When reconciliation triggers a save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoSaveMode {
    #[default]
    Off,
    /// Only when every fragment is `Valid` or `Unknown`
    ValidOnly,
    On,
}

/// How auto-save picks its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileNamingMode {
    /// Append or bump a `(n)` suffix until the name is free
    #[default]
    Iterate,
    Overwrite,
}

/// Bounded retry for fragments locked during reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 64,
            initial_backoff_ms: 1,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Settings for one fragment session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name of the selected format module
    pub module: Option<String>,
    /// Container to decompose; `None` means load from the working directory
    pub opened_file: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
    /// Extension for fragment files; empty disables container loading
    pub fragment_extension: String,
    /// Apply `fragment_extension` even where the module chose one
    pub force_extension: bool,
    pub validation_mode: ValidationMode,
    pub auto_save: AutoSaveMode,
    pub auto_save_path: Option<PathBuf>,
    pub file_naming_mode: FileNamingMode,
    /// Quiet period before queued changes are reconciled
    pub update_delay_ms: u64,
    pub blacklist: Blacklist,
    pub save_retry: RetryPolicy,
    pub module_options: ModuleOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            module: None,
            opened_file: None,
            working_directory: None,
            fragment_extension: "bin".to_string(),
            force_extension: false,
            validation_mode: ValidationMode::default(),
            auto_save: AutoSaveMode::default(),
            auto_save_path: None,
            file_naming_mode: FileNamingMode::default(),
            update_delay_ms: 1000,
            blacklist: Blacklist::os_default(),
            save_retry: RetryPolicy::default(),
            module_options: ModuleOptions::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| crate::error::PhoenixError::unavailable(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn with_module(mut self, name: impl Into<String>) -> Self {
        self.module = Some(name.into());
        self
    }

    pub fn with_opened_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.opened_file = Some(path.into());
        self
    }

    pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn with_fragment_extension(mut self, extension: impl Into<String>, force: bool) -> Self {
        self.fragment_extension = extension.into();
        self.force_extension = force;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    pub fn with_auto_save(
        mut self,
        mode: AutoSaveMode,
        path: impl Into<PathBuf>,
        naming: FileNamingMode,
    ) -> Self {
        self.auto_save = mode;
        self.auto_save_path = Some(path.into());
        self.file_naming_mode = naming;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_save_retry(mut self, retry: RetryPolicy) -> Self {
        self.save_retry = retry;
        self
    }

    pub fn with_module_options(mut self, options: ModuleOptions) -> Self {
        self.module_options = options;
        self
    }

    pub fn update_delay(&self) -> Duration {
        Duration::from_millis(self.update_delay_ms)
    }

    /// Whether a container load is possible (opened file and extension set)
    pub fn can_load_file(&self) -> bool {
        self.opened_file.is_some() && !self.fragment_extension.trim().is_empty()
    }
}
