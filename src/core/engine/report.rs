//! Serializable snapshot of a session

use crate::core::fragment::Validity;
use crate::core::vfs::VirtualFile;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One fragment as shown in a report
#[derive(Debug, Clone, Serialize)]
pub struct FragmentStatus {
    pub path: PathBuf,
    pub validity: Validity,
    pub description: String,
    /// `None` when the backing file is gone
    pub size: Option<u64>,
}

/// Session state at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub generated_at: String,
    pub module: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub enabled: bool,
    pub fragments: Vec<FragmentStatus>,
    pub counts: BTreeMap<String, usize>,
}

impl SessionReport {
    pub(crate) fn build(
        vfile: &VirtualFile,
        module: Option<&str>,
        working_directory: Option<PathBuf>,
        enabled: bool,
    ) -> Self {
        let fragments = vfile
            .iter()
            .map(|f| FragmentStatus {
                path: f.relative.clone(),
                validity: f.validity,
                description: f.description.clone(),
                size: f.size().ok(),
            })
            .collect();

        SessionReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            module: module.map(str::to_string),
            working_directory,
            enabled,
            fragments,
            counts: vfile.validity_counts(),
        }
    }

    /// Whether every fragment is `Valid` or `Unknown`
    pub fn is_acceptable(&self) -> bool {
        self.fragments.iter().all(|f| f.validity.is_acceptable())
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.fragments {
            let size = fragment
                .size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<14} {:>10}  {}  {}",
                fragment.validity.to_string(),
                size,
                fragment.path.display(),
                fragment.description
            )?;
        }
        let summary: Vec<String> = self.counts.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        write!(f, "{} fragments ({})", self.fragments.len(), summary.join(", "))
    }
}
