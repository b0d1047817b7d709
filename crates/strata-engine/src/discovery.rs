use std::fs;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::error::DiscoveryError;

/// Recursively discover stack manifests (`*.lua`) under a stack directory,
/// skipping hidden directories such as `.strata`.
///
/// # Errors
///
/// Returns an error if `root` is invalid, directory walking fails, or a manifest
/// path cannot be canonicalized.
pub fn discover_manifests(root: &Path) -> std::result::Result<Vec<PathBuf>, DiscoveryError> {
    if !root.exists() {
        return Err(DiscoveryError::RootDoesNotExist {
            root: root.to_path_buf(),
        });
    }
    if !root.is_dir() {
        return Err(DiscoveryError::RootIsNotDirectory {
            root: root.to_path_buf(),
        });
    }

    let mut manifests = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        let entry = entry.map_err(|source| DiscoveryError::Walk { source })?;

        if !entry.file_type().is_file() {
            continue;
        }

        if entry.path().extension().is_none_or(|extension| extension != "lua") {
            continue;
        }

        let canonical =
            fs::canonicalize(entry.path()).map_err(|source| DiscoveryError::CanonicalizePath {
                path: entry.path().to_path_buf(),
                source,
            })?;
        manifests.push(canonical);
    }

    manifests.sort();
    Ok(manifests)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;

    use super::discover_manifests;

    #[test]
    fn finds_only_lua_manifests_in_sorted_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("network")).expect("mkdir");
        fs::create_dir_all(root.join("services/nested")).expect("mkdir");
        fs::create_dir_all(root.join(".strata/sandbox")).expect("mkdir");
        fs::write(root.join("services/nested/app.lua"), "").expect("write");
        fs::write(root.join("network/vpc.lua"), "").expect("write");
        fs::write(root.join("network/notes.txt"), "").expect("write");
        fs::write(root.join(".strata/sandbox/stale.lua"), "").expect("write");

        let manifests = discover_manifests(root).expect("discover");
        assert_eq!(manifests.len(), 2);
        assert!(manifests[0].ends_with("network/vpc.lua"));
        assert!(manifests[1].ends_with("services/nested/app.lua"));
    }

    #[test]
    fn rejects_missing_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = discover_manifests(&temp.path().join("absent")).expect_err("must fail");
        assert!(error.to_string().contains("does not exist"));
    }
}
