use crate::project_base;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A path relative to [`project_base()`].
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct LocalPath(PathBuf);

impl LocalPath {
    pub fn to_abs(&self) -> PathBuf {
        project_base().join(&self.0)
    }

    pub fn file_name(&self) -> &str {
        self.0.file_name().unwrap().to_str().unwrap()
    }

    pub fn parent(&self) -> LocalPath {
        LocalPath(self.0.parent().unwrap().to_owned())
    }

    pub fn relative_to(&self, other: &LocalPath) -> PathBuf {
        pathdiff::diff_paths(&self.0, &other.0).unwrap()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.components().count()
    }

    pub fn join(&self, component: &str) -> LocalPath {
        LocalPath(self.0.join(component))
    }

    pub fn exists(&self) -> bool {
        self.to_abs().exists()
    }

    /// A stable 64-bit id for this path, derived from its content-free
    /// identity (the canonical-or-joined absolute path string) rather than
    /// an incrementing counter. Two cooperating processes on the same
    /// repository always agree on the id for a given target without
    /// needing a shared allocation table, which is exactly the property
    /// [`crate::Lock`] and [`crate::File`] need it for.
    pub fn id(&self) -> u64 {
        let abs = self.to_abs();
        let bytes = abs.to_string_lossy();
        let hash = blake3::hash(bytes.as_bytes());
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
impl FromStr for LocalPath {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(LocalPath)
    }
}

impl From<&Path> for LocalPath {
    fn from(path: &Path) -> Self {
        let abs = std::env::current_dir().unwrap().join(path);
        let canonical = match abs.canonicalize() {
            Ok(x) => x,
            Err(_) => abs,
        };
        let local = pathdiff::diff_paths(canonical, project_base()).unwrap();
        LocalPath(local)
    }
}
impl From<PathBuf> for LocalPath {
    fn from(path: PathBuf) -> Self {
        Self::from(path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_and_path_sensitive() {
        crate::test_root();
        let a = LocalPath::from(Path::new("foo/bar.c"));
        let b = LocalPath::from(Path::new("foo/bar.c"));
        let c = LocalPath::from(Path::new("foo/baz.c"));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }
}
