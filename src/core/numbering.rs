//! Naming/Numbering manager
//!
//! Turns the hierarchical names a module emits into concrete, collision-free
//! paths under the working directory. Every sibling group is prefixed with a
//! zero-padded index whose width is the digit count of that group's size, so
//! a plain lexical sort of the output reproduces emission order.
//!
//! ```text
//! ["header"]                  0 - header.bin
//! ["Chunk 1", "Length"]  ->   1 - Chunk 1/0 - Length.bin
//! ["Chunk 1", "Type"]         1 - Chunk 1/1 - Type.bin
//! ```

use crate::core::fragment::FragmentReference;
use crate::error::{PhoenixError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Extension policy applied to the last name segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPolicy {
    /// Extension without the leading dot; empty leaves names untouched
    pub extension: String,
    /// Replace module-supplied extensions too
    pub force: bool,
}

impl ExtensionPolicy {
    pub fn new(extension: impl Into<String>, force: bool) -> Self {
        ExtensionPolicy {
            extension: extension.into().trim_start_matches('.').to_string(),
            force,
        }
    }

    /// Final file name for a leaf segment
    pub fn apply(&self, name: &str) -> String {
        if self.extension.is_empty() {
            return name.to_string();
        }
        let has_extension = Path::new(name)
            .extension()
            .map(|ext| !ext.is_empty())
            .unwrap_or(false);
        if has_extension && !self.force {
            return name.to_string();
        }
        let mut path = PathBuf::from(name);
        path.set_extension(&self.extension);
        path.to_string_lossy().into_owned()
    }
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        ExtensionPolicy::new("bin", false)
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    children: Vec<usize>,
    /// References ending at this node
    references: Vec<usize>,
}

/// Arena-backed tree of name segments
#[derive(Debug)]
struct NameTree {
    nodes: Vec<Node>,
    lookup: HashMap<(usize, String), usize>,
}

impl NameTree {
    const ROOT: usize = 0;

    fn new() -> Self {
        NameTree {
            nodes: vec![Node {
                name: String::new(),
                children: Vec::new(),
                references: Vec::new(),
            }],
            lookup: HashMap::new(),
        }
    }

    fn insert(&mut self, segments: &[String], reference: usize) {
        let mut current = Self::ROOT;
        for segment in segments {
            let key = (current, segment.clone());
            current = match self.lookup.get(&key) {
                Some(&existing) => existing,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(Node {
                        name: segment.clone(),
                        children: Vec::new(),
                        references: Vec::new(),
                    });
                    self.nodes[current].children.push(id);
                    self.lookup.insert(key, id);
                    id
                }
            };
        }
        self.nodes[current].references.push(reference);
    }

    /// Prefix every sibling group with its padded index
    fn number(&mut self) {
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            let children = self.nodes[id].children.clone();
            let width = children.len().to_string().len();
            for (i, child) in children.iter().enumerate() {
                let node = &mut self.nodes[*child];
                node.name = format!("{i:0width$} - {}", node.name);
                stack.push(*child);
            }
        }
    }

    fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .skip(1)
            .filter(|n| n.children.is_empty())
            .count()
    }

    /// Absolute path for every reference, in reference order
    fn paths(&self, root: &Path, count: usize) -> Vec<Option<PathBuf>> {
        let mut out = vec![None; count];
        let mut stack = vec![(Self::ROOT, root.to_path_buf())];
        while let Some((id, path)) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                for &reference in &node.references {
                    out[reference] = Some(path.clone());
                }
            }
            for &child in &node.children {
                stack.push((child, path.join(&self.nodes[child].name)));
            }
        }
        out
    }
}

/// Numbers `references` under `root`
///
/// Pure function of its inputs. Fails with
/// [`PhoenixError::NumberingInconsistency`] when two references share a final
/// path, one reference names a directory of another, or a name is empty.
pub fn number(
    root: &Path,
    references: &[FragmentReference],
    policy: &ExtensionPolicy,
) -> Result<Vec<PathBuf>> {
    let mut tree = NameTree::new();
    for (i, reference) in references.iter().enumerate() {
        let mut segments = reference.name.clone();
        if let Some(last) = segments.last_mut() {
            *last = policy.apply(last);
        }
        tree.insert(&segments, i);
    }

    let leaves = tree.leaf_count();
    if leaves != references.len() {
        return Err(PhoenixError::NumberingInconsistency {
            references: references.len(),
            paths: leaves,
        });
    }

    tree.number();
    let paths = tree.paths(root, references.len());
    let resolved: Vec<PathBuf> = paths.into_iter().flatten().collect();
    if resolved.len() != references.len() {
        return Err(PhoenixError::NumberingInconsistency {
            references: references.len(),
            paths: resolved.len(),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&[&str]]) -> Vec<FragmentReference> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| FragmentReference::new(i as u64, 1, n))
            .collect()
    }

    #[test]
    fn test_basic_numbering() {
        let root = Path::new("/w");
        let paths = number(
            root,
            &refs(&[&["header"], &["Chunk 1", "Length"], &["Chunk 1", "Type"]]),
            &ExtensionPolicy::default(),
        )
        .unwrap();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/w/0 - header.bin"),
                PathBuf::from("/w/1 - Chunk 1/0 - Length.bin"),
                PathBuf::from("/w/1 - Chunk 1/1 - Type.bin"),
            ]
        );
    }

    #[test]
    fn test_padding_is_per_group() {
        let mut names: Vec<Vec<String>> = (0..10).map(|i| vec![format!("f{i}")]).collect();
        names.push(vec!["dir".into(), "only".into()]);
        let references: Vec<_> = names
            .iter()
            .map(|n| FragmentReference::new(0, 0, n))
            .collect();

        let paths = number(Path::new("/w"), &references, &ExtensionPolicy::default()).unwrap();
        assert_eq!(paths[0], PathBuf::from("/w/00 - f0.bin"));
        assert_eq!(paths[9], PathBuf::from("/w/09 - f9.bin"));
        // single child keeps a one digit prefix
        assert_eq!(paths[10], PathBuf::from("/w/10 - dir/0 - only.bin"));
    }

    #[test]
    fn test_extension_policy() {
        let keep = ExtensionPolicy::new("bin", false);
        assert_eq!(keep.apply("Image 1.png"), "Image 1.png");
        assert_eq!(keep.apply("Length"), "Length.bin");

        let force = ExtensionPolicy::new(".dat", true);
        assert_eq!(force.apply("Image 1.png"), "Image 1.dat");

        let none = ExtensionPolicy::new("", true);
        assert_eq!(none.apply("Image 1.png"), "Image 1.png");
    }

    #[test]
    fn test_reference_order_kept_for_interleaved_groups() {
        let paths = number(
            Path::new("/w"),
            &refs(&[&["A", "x"], &["B", "y"], &["A", "z"]]),
            &ExtensionPolicy::default(),
        )
        .unwrap();
        assert_eq!(paths[0], PathBuf::from("/w/0 - A/0 - x.bin"));
        assert_eq!(paths[1], PathBuf::from("/w/1 - B/0 - y.bin"));
        assert_eq!(paths[2], PathBuf::from("/w/0 - A/1 - z.bin"));
    }

    #[test]
    fn test_duplicate_names_fail() {
        let err = number(
            Path::new("/w"),
            &refs(&[&["Data"], &["Data"]]),
            &ExtensionPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PhoenixError::NumberingInconsistency { references: 2, paths: 1 }
        ));
    }

    #[test]
    fn test_collision_after_extension_forcing_fails() {
        let result = number(
            Path::new("/w"),
            &refs(&[&["Image.png"], &["Image.raw"]]),
            &ExtensionPolicy::new("bin", true),
        );
        assert!(matches!(
            result,
            Err(PhoenixError::NumberingInconsistency { .. })
        ));
    }

    #[test]
    fn test_leaf_that_is_also_directory_fails() {
        let result = number(
            Path::new("/w"),
            &refs(&[&["Box 1.bin"], &["Box 1.bin", "Type"]]),
            &ExtensionPolicy::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_input() {
        let paths = number(Path::new("/w"), &[], &ExtensionPolicy::default()).unwrap();
        assert!(paths.is_empty());
    }
}
