//! On-disk build tree layout.
//!
//! All published artifacts live under `<root>/<fork>/<version>/<file>`.
//! Every path component is validated before it touches the filesystem;
//! the build tree is the only place this service writes outside its
//! databases.

use crate::name::valid_name;
use std::path::{Path, PathBuf};

/// Resolves paths inside the build tree.
#[derive(Clone, Debug)]
pub struct BuildDirectory {
    root: PathBuf,
}

impl BuildDirectory {
    /// Create a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<fork>`.
    pub fn fork_dir(&self, fork: &str) -> crate::Result<PathBuf> {
        check_component(fork)?;
        Ok(self.root.join(fork))
    }

    /// `<root>/<fork>/<version>`.
    pub fn version_dir(&self, fork: &str, version: &str) -> crate::Result<PathBuf> {
        check_component(version)?;
        Ok(self.fork_dir(fork)?.join(version))
    }

    /// `<root>/<fork>/<version>/<file>`.
    pub fn artifact_path(&self, fork: &str, version: &str, file: &str) -> crate::Result<PathBuf> {
        check_component(file)?;
        Ok(self.version_dir(fork, version)?.join(file))
    }
}

fn check_component(component: &str) -> crate::Result<()> {
    if valid_name(component) {
        Ok(())
    } else {
        Err(crate::Error::InvalidName(component.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_path() {
        let layout = BuildDirectory::new("/srv/builds");
        let path = layout.artifact_path("wizards", "1.0.0", "Client.zip").unwrap();
        assert_eq!(path, PathBuf::from("/srv/builds/wizards/1.0.0/Client.zip"));
    }

    #[test]
    fn rejects_traversal_components() {
        let layout = BuildDirectory::new("/srv/builds");
        for bad in ["..", ".", "a/b", "", "..evil"] {
            assert!(layout.artifact_path("fork", "1.0", bad).is_err(), "{bad:?}");
        }
        assert!(layout.version_dir("fork", "../other").is_err());
        assert!(layout.fork_dir(".git").is_err());
    }
}
