//! Static registry of format modules
//!
//! Modules are listed by constructor. The registry sorts them by display name
//! and merges every module's open-dialog filters into one list sorted by filter
//! string, so a dialog's selected filter index maps back to its module.

use crate::core::module::{FormatModule, ModuleOptions};
use crate::error::{PhoenixError, Result};
use crate::formats::{
    gif::GraphicsInterchange, icon::IconCursor, iso_media::IsoBaseMedia,
    network_graphics::NetworkGraphics,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Builds a module with the given options
pub type ModuleConstructor = fn(&ModuleOptions) -> Box<dyn FormatModule>;

fn icon(options: &ModuleOptions) -> Box<dyn FormatModule> {
    Box::new(IconCursor::new(*options))
}

fn network_graphics(options: &ModuleOptions) -> Box<dyn FormatModule> {
    Box::new(NetworkGraphics::new(*options))
}

fn gif(options: &ModuleOptions) -> Box<dyn FormatModule> {
    Box::new(GraphicsInterchange::new(*options))
}

fn iso_media(options: &ModuleOptions) -> Box<dyn FormatModule> {
    Box::new(IsoBaseMedia::new(*options))
}

/// Constructors for every module shipped with the crate
pub const BUILTIN: &[ModuleConstructor] = &[icon, network_graphics, gif, iso_media];

/// Module lookup by display name and by open-dialog filter index
#[derive(Clone)]
pub struct Registry {
    modules: Vec<(&'static str, ModuleConstructor)>,
    filters: Vec<(String, &'static str)>,
}

impl Registry {
    /// Registry of the built-in modules
    pub fn builtin() -> Self {
        Registry::with_constructors(BUILTIN)
    }

    /// Registry of explicitly supplied modules
    pub fn with_constructors(constructors: &[ModuleConstructor]) -> Self {
        let defaults = ModuleOptions::default();
        let mut modules: Vec<(&'static str, ModuleConstructor)> = Vec::new();
        let mut filters: BTreeMap<String, &'static str> = BTreeMap::new();

        for constructor in constructors {
            let module = constructor(&defaults);
            let name = module.display_name();
            if modules.iter().any(|(existing, _)| *existing == name) {
                warn!("Module '{}' registered twice, keeping the first", name);
                continue;
            }
            for filter in module.open_filters() {
                if let Some(owner) = filters.get(&filter) {
                    warn!("Filter '{}' of '{}' already owned by '{}'", filter, name, owner);
                    continue;
                }
                filters.insert(filter, name);
            }
            modules.push((name, *constructor));
        }
        modules.sort_by(|a, b| a.0.cmp(b.0));

        Registry {
            modules,
            filters: filters.into_iter().collect(),
        }
    }

    /// Display names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|(name, _)| *name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.iter().any(|(n, _)| *n == name)
    }

    /// Instantiate the module called `name`
    pub fn create(&self, name: &str, options: &ModuleOptions) -> Result<Box<dyn FormatModule>> {
        self.modules
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, constructor)| constructor(options))
            .ok_or_else(|| PhoenixError::UnknownModule(name.to_string()))
    }

    /// Every module's open filters, sorted by filter string
    pub fn open_dialog_filters(&self) -> Vec<&str> {
        self.filters.iter().map(|(f, _)| f.as_str()).collect()
    }

    /// All filters joined the way file dialogs expect them
    pub fn open_dialog_filter_string(&self) -> String {
        self.open_dialog_filters().join("|")
    }

    /// Module that contributed the filter at `index` (0-based)
    pub fn module_for_filter_index(&self, index: usize) -> Option<&'static str> {
        self.filters.get(index).map(|(_, name)| *name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::builtin()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.names())
            .field("filters", &self.filters.len())
            .finish()
    }
}
