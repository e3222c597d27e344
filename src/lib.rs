//! # Phoenix - Live Fragment Trees for Binary Containers
//!
//! `phoenix-rs` decomposes a binary container (PNG, GIF, ICO, MP4, ...) into a
//! directory of small fragment files, one per header field, chunk or payload.
//! The directory stays linked to the container:
//!
//! - **Numbered fragments**: every file name starts with its position, so the
//!   directory listing is the byte order
//! - **Live validation**: editing, adding or deleting a fragment re-checks it and
//!   everything that depends on it, fixing lengths, offsets and CRCs on the way
//! - **Reassembly**: concatenating the fragments in order gives the container back
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use phoenix_rs::{Phoenix, Result};
//!
//! # fn main() -> Result<()> {
//! // Split a PNG into ./work
//! let phoenix = Phoenix::split("image.png", "work", "Network Graphics")?;
//! println!("{}", phoenix.report());
//!
//! // ... edit files under ./work ...
//!
//! phoenix.join("image-edited.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Live Sessions
//!
//! ```rust,no_run
//! use phoenix_rs::{PhoenixBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let phoenix = PhoenixBuilder::new()
//!     .module("Graphics Interchange Format")
//!     .container("anim.gif")
//!     .working_directory("/tmp/anim")
//!     .always_clear()
//!     .watch()
//!     .build()?;
//!
//! for event in phoenix.session().subscribe() {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod formats;

pub use crate::core::engine::{
    AutoSaveMode, FileNamingMode, FsEvent, ProgressInfo, RetryPolicy, Session, SessionBuilder,
    SessionConfig, SessionEvent, SessionReport, ValidationMode,
};
pub use crate::core::fragment::{Fragment, FragmentReference, Metadata, Validity};
pub use crate::core::module::{FormatModule, ModuleOptions, ScanMode};
pub use crate::core::pattern::Blacklist;
pub use crate::core::registry::Registry;
pub use crate::error::{PhoenixError, Result};

use std::path::{Path, PathBuf};
use tracing::info;

/// High-level fragment session API
///
/// A thin wrapper around [`Session`] for the common one-shot flows: split a
/// container, check a directory, join it back.
///
/// # Examples
///
/// ```rust,no_run
/// use phoenix_rs::{Phoenix, Result};
///
/// # fn main() -> Result<()> {
/// let phoenix = Phoenix::open_directory("work", "Microsoft Icon/Cursor Files")?;
/// if phoenix.report().is_acceptable() {
///     phoenix.join("fixed.ico")?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Phoenix {
    session: Session,
}

impl Phoenix {
    /// Decompose `container` into `working_directory` with the named module
    ///
    /// Fails with [`PhoenixError::WorkingDirectoryNotEmpty`] rather than
    /// clearing an existing directory; use [`PhoenixBuilder::always_clear`] for that.
    pub fn split<P: AsRef<Path>, Q: AsRef<Path>>(
        container: P,
        working_directory: Q,
        module: &str,
    ) -> Result<Self> {
        PhoenixBuilder::new()
            .module(module)
            .container(container.as_ref())
            .working_directory(working_directory.as_ref())
            .build()
    }

    /// Adopt an existing fragment directory
    pub fn open_directory<P: AsRef<Path>>(working_directory: P, module: &str) -> Result<Self> {
        PhoenixBuilder::new()
            .module(module)
            .working_directory(working_directory.as_ref())
            .build()
    }

    /// Reassemble the fragments into `dest`
    pub fn join<P: AsRef<Path>>(&self, dest: P) -> Result<PathBuf> {
        self.session.save(dest)
    }

    /// Status of every fragment
    pub fn report(&self) -> SessionReport {
        self.session.report()
    }

    /// Snapshot of every fragment
    pub fn fragments(&self) -> Vec<Fragment> {
        self.session.fragments()
    }

    /// Re-run every variable and validity check
    pub fn revalidate(&self) -> &Self {
        self.session.revalidate_all();
        self
    }

    /// Resync with the working directory after out-of-band edits
    pub fn refresh(&self) -> Result<()> {
        self.session.refresh()
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }
}

/// Builder for [`Phoenix`]
///
/// Without [`watch`](PhoenixBuilder::watch) the session is loaded once and only
/// changes passed to [`Session::handle_event`] are reconciled.
pub struct PhoenixBuilder {
    config: SessionConfig,
    module: Option<Box<dyn FormatModule>>,
    clear: bool,
    watch: bool,
}

impl PhoenixBuilder {
    pub fn new() -> Self {
        Self::from_config(SessionConfig::default())
    }

    /// Start from a loaded configuration
    pub fn from_config(config: SessionConfig) -> Self {
        PhoenixBuilder {
            config,
            module: None,
            clear: false,
            watch: false,
        }
    }

    /// Select a built-in module by display name
    pub fn module<S: Into<String>>(mut self, name: S) -> Self {
        self.config.module = Some(name.into());
        self
    }

    /// Use a module instance instead of the registry
    pub fn module_instance(mut self, module: Box<dyn FormatModule>) -> Self {
        self.module = Some(module);
        self
    }

    pub fn module_options(mut self, options: ModuleOptions) -> Self {
        self.config.module_options = options;
        self
    }

    /// Container to decompose; without one the directory is adopted as is
    pub fn container<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.opened_file = Some(path.into());
        self
    }

    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.working_directory = Some(path.into());
        self
    }

    /// Fragment file extension; `force` applies it even where a module chose one
    pub fn extension<S: Into<String>>(mut self, extension: S, force: bool) -> Self {
        self.config.fragment_extension = extension.into();
        self.config.force_extension = force;
        self
    }

    /// Clear a non-empty working directory without asking
    pub fn always_clear(mut self) -> Self {
        self.clear = true;
        self
    }

    /// Follow the working directory with the OS watcher
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }

    /// Build and load the session
    pub fn build(self) -> Result<Phoenix> {
        if self.module.is_none() && self.config.module.is_none() {
            return Err(PhoenixError::Configuration("no module selected".into()));
        }
        if self.config.working_directory.is_none() {
            return Err(PhoenixError::Configuration("no working directory set".into()));
        }

        let mut builder = Session::builder(self.config);
        if let Some(module) = self.module {
            builder = builder.module(module);
        }
        if self.clear {
            builder = builder.always_clear();
        }
        if !self.watch {
            builder = builder.without_watcher();
        }
        let session = builder.build()?;
        session.enable()?;
        info!(
            "Loaded {} fragments with '{}'",
            session.len(),
            session.module_name().unwrap_or_default()
        );
        Ok(Phoenix { session })
    }
}

impl Default for PhoenixBuilder {
    fn default() -> Self {
        Self::new()
    }
}
