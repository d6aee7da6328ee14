//! Path resolution: walks an absolute POSIX path against the in-memory
//! tree, triggering lazy loads as needed.

use crate::device::Device;
use crate::disk_format::FileTypeRecord;
use crate::error::FsResult;
use crate::layout::Geometry;
use crate::tree::Tree;

/// The outcome of resolving a path.
pub struct Resolved {
    /// Arena index of the dentry reached.
    pub dentry: usize,
    /// Whether the full path resolved to an existing entry. When `false`,
    /// `dentry` names the last dentry reached before resolution gave up:
    /// the parent, for a not-yet-existing leaf; the directory where a name
    /// lookup missed; or the regular file that blocked further descent.
    pub found: bool,
    /// Whether the resolved dentry is the root.
    pub is_root: bool,
}

/// Resolves `path` against `tree`, starting at the root.
///
/// `path` must be absolute (start with `/`). `"/"` itself resolves to the
/// root. Other paths are split on `/` and walked component by component;
/// at each step the current dentry's inode is lazily loaded if needed, a
/// regular file with remaining components yields "not a directory"
/// (`found=false` at the file itself), and a directory's children are
/// scanned for a full (non-prefix) name match.
pub fn resolve(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
) -> FsResult<Resolved> {
    if path == "/" {
        let root = tree.root;
        tree.resolve_inode(root, device, geometry)?;
        return Ok(Resolved {
            dentry: root,
            found: true,
            is_root: true,
        });
    }

    let mut current = tree.root;
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for (i, component) in components.iter().enumerate() {
        tree.resolve_inode(current, device, geometry)?;
        let is_last = i == components.len() - 1;

        if tree.dentries[current].file_type == FileTypeRecord::Regular {
            // Policy: "not a directory" — report the file itself, not its
            // parent, so callers can see what blocked descent.
            return Ok(Resolved {
                dentry: current,
                found: false,
                is_root: current == tree.root,
            });
        }

        let hit = tree.dentries[current]
            .children
            .iter()
            .copied()
            .find(|&child| Tree::names_match(&tree.dentries[child].name, component));

        match hit {
            Some(child) => {
                current = child;
                if is_last {
                    tree.resolve_inode(current, device, geometry)?;
                    return Ok(Resolved {
                        dentry: current,
                        found: true,
                        is_root: current == tree.root,
                    });
                }
            }
            None => {
                return Ok(Resolved {
                    dentry: current,
                    found: false,
                    is_root: current == tree.root,
                });
            }
        }
    }

    // Unreachable for a non-empty component list; an all-empty path (e.g.
    // "" or "///") falls through having done nothing, and resolves against
    // the root's own child list the same way a failed lookup would.
    Ok(Resolved {
        dentry: tree.root,
        found: false,
        is_root: true,
    })
}

/// Splits `path` into its parent path and final component name, e.g.
/// `"/a/b"` into `("/a", "b")`, and `"/a"` into `("/", "a")`.
pub fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::split_parent;

    #[test]
    fn split_parent_top_level() {
        assert_eq!(split_parent("/a"), ("/".to_string(), "a".to_string()));
    }

    #[test]
    fn split_parent_nested() {
        assert_eq!(
            split_parent("/a/b/c"),
            ("/a/b".to_string(), "c".to_string())
        );
    }
}
