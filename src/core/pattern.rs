//! Path blacklist for working directory events
//!
//! Supports wildcards:
//! - `*` - Matches within a single segment (e.g., `*.tmp`, `~$*`)
//! - `**` - Matches any number of segments (e.g., `/cache/**`)
//!
//! Patterns starting with `/` are anchored at the filesystem root; any other
//! pattern is matched against the trailing segments of a path, so
//! `*/.DS_Store` catches that file in every directory. Both `/` and `\` are
//! accepted as separators.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Segment glob matcher
pub struct PatternMatcher;

impl PatternMatcher {
    /// Check if `path` matches `pattern`
    ///
    /// # Examples
    /// ```
    /// use phoenix_rs::core::pattern::PatternMatcher;
    ///
    /// assert!(PatternMatcher::matches("*/Thumbs.db", "/work/1 - Image/Thumbs.db"));
    /// assert!(PatternMatcher::matches("/work/**", "/work/a/b"));
    /// assert!(!PatternMatcher::matches("/work/*", "/other/a"));
    /// ```
    pub fn matches(pattern: &str, path: &str) -> bool {
        let anchored = pattern.starts_with('/') || pattern.starts_with('\\');
        let pattern = Self::segments(pattern);
        let path = Self::segments(path);

        if anchored {
            return Self::match_parts(&pattern, &path, 0, 0);
        }
        (0..=path.len()).any(|start| Self::match_parts(&pattern, &path[start..], 0, 0))
    }

    /// Split into segments, resolving `.` and `..`
    fn segments(path: &str) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::new();
        for part in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
            match part {
                "." => continue,
                ".." => {
                    resolved.pop();
                }
                _ => resolved.push(part.to_string()),
            }
        }
        resolved
    }

    fn match_parts(pattern: &[String], path: &[String], pat_idx: usize, path_idx: usize) -> bool {
        if pat_idx >= pattern.len() && path_idx >= path.len() {
            return true;
        }

        if pat_idx >= pattern.len() {
            return false;
        }

        if path_idx >= path.len() {
            return pattern[pat_idx..].iter().all(|p| p == "**");
        }

        let pat_part = pattern[pat_idx].as_str();
        let path_part = path[path_idx].as_str();

        match pat_part {
            "**" => (0..=(path.len() - path_idx))
                .any(|skip| Self::match_parts(pattern, path, pat_idx + 1, path_idx + skip)),
            "*" => Self::match_parts(pattern, path, pat_idx + 1, path_idx + 1),
            _ if pat_part.contains('*') => {
                Self::match_glob_segment(pat_part, path_part)
                    && Self::match_parts(pattern, path, pat_idx + 1, path_idx + 1)
            }
            _ => {
                pat_part == path_part && Self::match_parts(pattern, path, pat_idx + 1, path_idx + 1)
            }
        }
    }

    /// Match `*` wildcards inside one segment
    fn match_glob_segment(pattern: &str, segment: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        let last = parts.len() - 1;
        let mut pos = 0;

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                if !segment.starts_with(part) {
                    return false;
                }
                pos = part.len();
            } else if i == last {
                return segment.len() >= pos + part.len() && segment.ends_with(part);
            } else {
                match segment[pos..].find(part) {
                    Some(found) => pos += found + part.len(),
                    None => return false,
                }
            }
        }
        true
    }
}

/// Glob patterns whose matching paths never reach the change queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blacklist {
    pub patterns: Vec<String>,
    pub ignore_case: bool,
}

impl Blacklist {
    pub fn new<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Blacklist {
            patterns: patterns.into_iter().map(Into::into).collect(),
            ignore_case: false,
        }
    }

    pub fn empty() -> Self {
        Blacklist::new(Vec::<String>::new())
    }

    pub fn ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    /// OS junk files: thumbnail caches and folder settings
    pub fn os_default() -> Self {
        if cfg!(windows) {
            Blacklist::new(["*\\Thumbs.db", "*\\Desktop.ini"]).ignore_case(true)
        } else if cfg!(target_os = "macos") {
            Blacklist::new(["*/.DS_Store"]).ignore_case(true)
        } else {
            Blacklist::empty()
        }
    }

    pub fn is_blocked(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        if self.ignore_case {
            let path = path.to_lowercase();
            self.patterns
                .iter()
                .any(|p| PatternMatcher::matches(&p.to_lowercase(), &path))
        } else {
            self.patterns.iter().any(|p| PatternMatcher::matches(p, &path))
        }
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Blacklist::os_default()
    }
}
