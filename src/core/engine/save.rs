//! Reassembly of fragments into one container file

use super::config::RetryPolicy;
use super::progress::Progress;
use crate::core::fragment::Fragment;
use crate::error::{PhoenixError, Result};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, warn};

/// Trailing `(n)` counter on a file stem
const ITERATION_PATTERN: &str = r"\((\d+)\)$";

/// Concatenate `fragments` into `out`, in order
///
/// Each fragment is streamed, never held whole. A fragment that cannot be
/// opened or read is retried per `retry`; a missing fragment fails immediately.
pub(crate) fn assemble<W: Write>(
    fragments: &[Fragment],
    out: &mut W,
    retry: &RetryPolicy,
    progress: &Progress,
    label: &str,
) -> Result<u64> {
    let mut written = 0u64;
    for (i, fragment) in fragments.iter().enumerate() {
        progress.report("Saving...", label, i + 1, fragments.len());
        written += copy_with_retry(&fragment.path, out, retry)?;
    }
    out.flush()?;
    Ok(written)
}

/// Writer that counts what passes through it
struct Tally<'a, W> {
    inner: &'a mut W,
    bytes: u64,
}

impl<W: Write> Write for Tally<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream a fragment file into `out`, backing off while another process holds it
///
/// Once part of the fragment has reached `out` a failure is final, since a
/// retry would duplicate those bytes.
pub(crate) fn copy_with_retry<W: Write>(path: &Path, out: &mut W, retry: &RetryPolicy) -> Result<u64> {
    let mut attempt = 0u32;
    loop {
        let mut tally = Tally { inner: &mut *out, bytes: 0 };
        let e = match File::open(path).and_then(|mut file| io::copy(&mut file, &mut tally)) {
            Ok(copied) => return Ok(copied),
            Err(e) => e,
        };
        if e.kind() == io::ErrorKind::NotFound {
            return Err(PhoenixError::unavailable(path, e));
        }
        if tally.bytes > 0 {
            warn!("Fragment {:?} failed after {} bytes: {}", path, tally.bytes, e);
            return Err(e.into());
        }
        attempt += 1;
        if attempt >= retry.max_attempts {
            warn!("Giving up on {:?} after {} attempts: {}", path, attempt, e);
            return Err(PhoenixError::LockTimeout {
                path: path.to_path_buf(),
                attempts: attempt,
            });
        }
        debug!("Fragment {:?} busy ({}), retry {}", path, e, attempt);
        thread::sleep(retry.backoff(attempt - 1));
    }
}

/// Move `from` to `to`, copying when a rename crosses filesystems
pub(crate) fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename {:?} -> {:?} failed ({}), copying", from, to, e);
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
    }
}

/// `path` with its `(n)` stem counter bumped, or `(1)` appended
pub fn bump_iteration(path: &Path) -> Result<PathBuf> {
    let re = Regex::new(ITERATION_PATTERN)
        .map_err(|e| PhoenixError::Configuration(e.to_string()))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let next_stem = match re.captures(&stem) {
        Some(caps) => {
            let n: u64 = caps[1].parse().unwrap_or(0);
            re.replace(&stem, format!("({})", n.saturating_add(1)).as_str())
                .into_owned()
        }
        None => format!("{stem}(1)"),
    };

    let file_name = match path.extension() {
        Some(ext) => format!("{next_stem}.{}", ext.to_string_lossy()),
        None => next_stem,
    };
    Ok(path.with_file_name(file_name))
}

/// First name derived from `path` that does not exist yet
pub fn next_free_name(path: &Path) -> Result<PathBuf> {
    let mut candidate = path.to_path_buf();
    while candidate.exists() {
        candidate = bump_iteration(&candidate)?;
    }
    Ok(candidate)
}
