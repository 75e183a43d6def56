//! Filesystem steps of the pipeline: promoting scratch configs, rollback and
//! cleanup.

use std::fs;
use std::io;
use std::path::Path;

use super::worker::StageFailure;
use crate::config::ConfigFileSpec;
use crate::error::ErrorCode;
use crate::manifest::is_safe_bundle_name;

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Replace `live` with `scratch`: delete first, then move.
fn replace(scratch: &Path, live: &Path) -> io::Result<()> {
    remove_if_present(live)?;
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(scratch, live)
}

/// Move each fetched config from the scratch cache over its live copy.
///
/// If a required file cannot be promoted, every live config file is deleted
/// so the next launch starts over from the install package instead of
/// running with a mixed set.
pub(crate) fn promote_configs(
    root: &Path,
    cache_dir: &Path,
    files: &[ConfigFileSpec],
    fetched: &[String],
) -> Result<usize, StageFailure> {
    let mut promoted = 0;
    for spec in files.iter().filter(|s| fetched.contains(&s.name)) {
        let scratch = cache_dir.join(&spec.name);
        let live = root.join(&spec.name);

        match replace(&scratch, &live) {
            Ok(()) => promoted += 1,
            Err(e) if spec.required => {
                tracing::warn!(file = %spec.name, error = %e, "Failed to install config file, rolling back");
                discard_configs(root, files);
                return Err(StageFailure {
                    code: ErrorCode::WriteException,
                    message: format!("{}: {}", spec.name, e),
                });
            }
            Err(e) => {
                tracing::warn!(file = %spec.name, error = %e, "Failed to install optional config file");
            }
        }
    }
    Ok(promoted)
}

/// Delete every config file in `dir`. Errors are logged.
pub(crate) fn discard_configs(dir: &Path, files: &[ConfigFileSpec]) {
    for spec in files {
        let path = dir.join(&spec.name);
        if let Err(e) = remove_if_present(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard config file");
        }
    }
}

/// Delete obsolete bundle files, returning how many were removed.
pub(crate) fn delete_bundles<'a>(root: &Path, names: impl IntoIterator<Item = &'a String>) -> usize {
    let mut removed = 0;
    for name in names {
        if !is_safe_bundle_name(name) {
            tracing::warn!(bundle = %name, "Refusing to delete outside the root directory");
            continue;
        }
        let path = root.join(name);
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(bundle = %name, error = %e, "Failed to delete obsolete bundle");
            }
        }
    }
    removed
}

/// Remove the scratch cache directory and everything in it.
pub(crate) fn clear_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn specs() -> Vec<ConfigFileSpec> {
        vec![
            ConfigFileSpec::required("graph.bin"),
            ConfigFileSpec::required("res.json"),
            ConfigFileSpec::optional("extra.json"),
        ]
    }

    #[test]
    fn test_promote_replaces_live() {
        let root = TempDir::new().unwrap();
        let cache = root.path().join("Cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(root.path().join("graph.bin"), b"old").unwrap();
        fs::write(cache.join("graph.bin"), b"new").unwrap();
        fs::write(cache.join("res.json"), b"new").unwrap();

        let fetched = vec!["graph.bin".to_string(), "res.json".to_string()];
        let promoted = promote_configs(root.path(), &cache, &specs(), &fetched).unwrap();

        assert_eq!(promoted, 2);
        assert_eq!(fs::read(root.path().join("graph.bin")).unwrap(), b"new");
        assert!(!cache.join("graph.bin").exists());
        assert!(!root.path().join("extra.json").exists());
    }

    #[test]
    fn test_required_failure_rolls_back_everything() {
        let root = TempDir::new().unwrap();
        let cache = root.path().join("Cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("graph.bin"), b"new").unwrap();
        fs::write(root.path().join("extra.json"), b"live").unwrap();
        // res.json is reported as fetched but missing from the scratch cache.

        let fetched = vec!["graph.bin".to_string(), "res.json".to_string()];
        let failure = promote_configs(root.path(), &cache, &specs(), &fetched).unwrap_err();

        assert_eq!(failure.code, ErrorCode::WriteException);
        for name in ["graph.bin", "res.json", "extra.json"] {
            assert!(!root.path().join(name).exists(), "{} survived rollback", name);
        }
    }

    #[test]
    fn test_delete_bundles_counts_removed() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a"), b"x").unwrap();

        let names = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(delete_bundles(root.path(), &names), 1);
        assert!(!root.path().join("a").exists());
    }

    #[test]
    fn test_delete_bundles_stays_inside_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(temp.path().join("victim"), b"x").unwrap();

        let names = vec!["../victim".to_string()];
        assert_eq!(delete_bundles(&root, &names), 0);
        assert!(temp.path().join("victim").exists());
    }

    #[test]
    fn test_clear_dir_missing_ok() {
        let root = TempDir::new().unwrap();
        clear_dir(&root.path().join("Cache")).unwrap();
    }
}
