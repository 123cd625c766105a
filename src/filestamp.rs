//! Content-addressed identity for a single file: a repo-relative path paired
//! with a blake3 hash of its bytes. The unit every freshness decision in
//! this crate is made in terms of — `state.rs` stamps a target with one at
//! the end of a successful build, `freshness.rs` compares one against a
//! recorded trace, and a tracefile's `source`/`generated`/`produced` lines
//! are each one of these rendered as text.

use crate::local_path::LocalPath;
use anyhow::{anyhow, Context};
use blake3::Hash;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct FileStamp {
    pub path: LocalPath,
    pub hash: Hash,
}

impl fmt::Display for FileStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use yansi::Paint;
        let hash = self.hash.to_hex();
        let hash = f.precision().map(|x| &hash[..x]).unwrap_or(&hash);
        if f.alternate() {
            match self.is_valid() {
                Ok(true) => write!(f, "{}@{}", self.path, hash.green()),
                Ok(false) => write!(f, "{}@{}", self.path, hash.red()),
                Err(_) => write!(f, "{}@{}", self.path.red(), hash),
            }
        } else {
            write!(f, "{}@{}", self.path, hash)
        }
    }
}

impl FromStr for FileStamp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, hash) = s.split_once('@').ok_or_else(|| anyhow!("No @ sign"))?;
        Ok(FileStamp {
            path: path.parse()?,
            hash: hash.parse()?,
        })
    }
}

impl PartialOrd for FileStamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileStamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.path, self.hash.as_bytes()).cmp(&(&other.path, other.hash.as_bytes()))
    }
}

impl FileStamp {
    pub fn new(path: LocalPath) -> anyhow::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher
            .update_mmap_rayon(path.to_abs())
            .context(path.to_string())?;
        let hash = hasher.finalize();
        Ok(FileStamp { path, hash })
    }

    pub fn abs_path(&self) -> PathBuf {
        self.path.to_abs()
    }

    pub fn is_valid(&self) -> anyhow::Result<bool> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_mmap_rayon(self.abs_path())?;
        let hash = hasher.finalize();
        Ok(hash == self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_of_unmodified_file_is_valid() {
        let dir = crate::test_root();
        std::fs::write(dir.join("filestamp_a.txt"), b"hello").unwrap();
        let stamp = FileStamp::new(LocalPath::from(std::path::Path::new("filestamp_a.txt"))).unwrap();
        assert!(stamp.is_valid().unwrap());
    }

    #[test]
    fn stamp_of_modified_file_is_invalid() {
        let dir = crate::test_root();
        std::fs::write(dir.join("filestamp_b.txt"), b"hello").unwrap();
        let stamp = FileStamp::new(LocalPath::from(std::path::Path::new("filestamp_b.txt"))).unwrap();
        std::fs::write(dir.join("filestamp_b.txt"), b"goodbye").unwrap();
        assert!(!stamp.is_valid().unwrap());
    }

    #[test]
    fn two_stamps_of_identical_content_hash_equal() {
        let dir = crate::test_root();
        std::fs::write(dir.join("filestamp_c1.txt"), b"same").unwrap();
        std::fs::write(dir.join("filestamp_c2.txt"), b"same").unwrap();
        let a = FileStamp::new(LocalPath::from(std::path::Path::new("filestamp_c1.txt"))).unwrap();
        let b = FileStamp::new(LocalPath::from(std::path::Path::new("filestamp_c2.txt"))).unwrap();
        assert_eq!(a.hash, b.hash);
    }
}
