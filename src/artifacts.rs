//! Content-addressed store of every file this tool has ever produced,
//! keyed by its blake3 hash. `DefaultShouldBuild` (`freshness.rs`) consults
//! it to restore a target byte-for-byte when a valid trace names content we
//! already have on disk somewhere, instead of redoing the work that
//! produced it; `redux clean` (`main.rs`) uses it as a safety net before
//! deleting a build product, so nothing is ever lost to a cache sweep.

use crate::{redux_dir, FileStamp};
use anyhow::Context;
use blake3::Hash;
use std::{collections::HashSet, path::PathBuf, sync::LazyLock};
use tracing::debug;

pub static ARTIFACTS_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    let path = redux_dir().join("artifacts");
    std::fs::create_dir_all(&path).unwrap();
    path
});

/// A cache of the contents of redux_dir/artifacts
pub struct Artifacts(HashSet<Hash>);

impl Artifacts {
    pub fn new() -> anyhow::Result<Artifacts> {
        std::fs::create_dir_all(&*ARTIFACTS_DIR)?;
        let mut xs = HashSet::default();
        for ent in std::fs::read_dir(&*ARTIFACTS_DIR)? {
            let path = ent?.path();
            let fname = path.file_name().unwrap();
            let fname = fname.to_str().unwrap();
            xs.insert(fname.parse().unwrap());
        }
        Ok(Artifacts(xs))
    }

    pub fn store_path(hash: Hash) -> PathBuf {
        ARTIFACTS_DIR.join(hash.to_string())
    }

    pub fn insert(&mut self, file: &FileStamp) -> anyhow::Result<()> {
        if self.0.contains(&file.hash) {
            debug!("{}: contents already in the store", file.path);
        } else {
            let to = Self::store_path(file.hash);
            std::fs::copy(file.path.to_abs(), to)?;
            debug!("{}: contents added to the store", file.path);
            self.0.insert(file.hash);
        }
        Ok(())
    }

    pub fn restore(&self, file: &FileStamp) -> anyhow::Result<()> {
        assert!(self.0.contains(&file.hash));
        let from = Self::store_path(file.hash);
        std::fs::copy(from, file.path.to_abs()).context("Copy artifact")?;
        debug!(
            "{}: Restored contents @{}",
            file.path,
            &file.hash.to_hex()[..8],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalPath;

    #[test]
    fn insert_then_restore_round_trips_content() {
        let dir = crate::test_root();
        std::fs::write(dir.join("artifact_src.txt"), b"payload").unwrap();
        let stamp = FileStamp::new(LocalPath::from(std::path::Path::new("artifact_src.txt"))).unwrap();
        let mut store = Artifacts::new().unwrap();
        store.insert(&stamp).unwrap();

        std::fs::remove_file(dir.join("artifact_src.txt")).unwrap();
        store.restore(&stamp).unwrap();
        assert_eq!(
            std::fs::read(dir.join("artifact_src.txt")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn reinserting_identical_content_is_a_no_op() {
        let dir = crate::test_root();
        std::fs::write(dir.join("artifact_dup_a.txt"), b"dup").unwrap();
        std::fs::write(dir.join("artifact_dup_b.txt"), b"dup").unwrap();
        let a = FileStamp::new(LocalPath::from(std::path::Path::new("artifact_dup_a.txt"))).unwrap();
        let b = FileStamp::new(LocalPath::from(std::path::Path::new("artifact_dup_b.txt"))).unwrap();
        let mut store = Artifacts::new().unwrap();
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        assert_eq!(Artifacts::store_path(a.hash), Artifacts::store_path(b.hash));
    }
}
