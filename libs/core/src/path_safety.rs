use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Resolves a stored media path against the media root and ensures the
/// result stays inside it. Resolution is lexical: the file may or may not
/// exist (callers stat afterwards), so symlink chasing is out of scope.
pub fn resolve_under_root(root: &Path, candidate: &str) -> Result<PathBuf> {
    if candidate.contains("..") {
        return Err(Error::invalid_input(format!(
            "suspicious media path: {candidate}"
        )));
    }

    let candidate = Path::new(candidate);
    if candidate.is_absolute() {
        return Err(Error::invalid_input(format!(
            "absolute media paths are not allowed: {}",
            candidate.display()
        )));
    }

    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid_input(format!(
                    "media path escapes root: {}",
                    candidate.display()
                )))
            }
        }
    }

    if !resolved.starts_with(root) {
        return Err(Error::invalid_input(format!(
            "media path escapes root: {}",
            candidate.display()
        )));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_relative_paths() {
        let out = resolve_under_root(Path::new("/var/media"), "org-1/file.jpg").unwrap();
        assert_eq!(out, PathBuf::from("/var/media/org-1/file.jpg"));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(resolve_under_root(Path::new("/var/media"), "../etc/passwd").is_err());
        assert!(resolve_under_root(Path::new("/var/media"), "a/../../etc").is_err());
    }

    #[test]
    fn rejects_absolute_candidates() {
        assert!(resolve_under_root(Path::new("/var/media"), "/etc/passwd").is_err());
    }
}
