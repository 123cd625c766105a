//! Per-target build state: whether a target is a build product or a
//! human-authored source, whether its last build failed, and the content
//! stamp it was last `fin()`-ed with.
//!
//! One JSON record per target, named by the target's stable id, living
//! under `redux_dir()/state/`. This is new relative to the tool this crate
//! grew from (which kept no record at all beyond the tracefiles), but the
//! shape of the record and the operations on it are lifted straight from
//! `state.File` as `BuildJob` uses it: `check_externally_modified`,
//! `existing_not_generated`, `set_static`/`set_something_else`, `zap_deps1`/
//! `zap_deps2`, `fin`, `save`.

use crate::{redux_dir, DepGraph, FileStamp, LocalPath, RuleSet};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};
use tracing::debug;

fn state_dir() -> PathBuf {
    let path = redux_dir().join("state");
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn record_path(id: u64) -> PathBuf {
    state_dir().join(format!("{id:016x}.json"))
}

/// How a target was last classified, the first time someone asked whether
/// it's a build product or something this tool should leave alone.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum Classification {
    #[default]
    Unknown,
    /// A plain source file: never a build target, don't bother checking
    /// a do-file for it again.
    Static,
    /// Exists, isn't tracked as a source, and isn't one of our outputs
    /// either (e.g. a `.gitignore`d file someone keeps by hand). Treated
    /// like a source once classified.
    SomethingElse,
    /// We built this once, but something outside this tool's control
    /// touched it since; the user has been warned and the classification
    /// is sticky so we don't warn again every run.
    ExternallyModified,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct Record {
    path: String,
    classification: Classification,
    is_generated: bool,
    failed: bool,
    /// Hex-encoded content hash as of the last successful `fin()`.
    stamp: Option<String>,
}

/// Targets this process has opened by name, so a later re-open by id alone
/// (the scheduler's deferred-targets path, which only carries ids) can find
/// its way back to a path without re-deriving it.
static KNOWN_NAMES: LazyLock<Mutex<HashMap<u64, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// One target's persisted build state, plus the resolved path it's about.
pub struct File {
    pub id: u64,
    pub name: String,
    path: LocalPath,
    record: Record,
}

impl File {
    fn load_record(id: u64) -> anyhow::Result<Record> {
        match std::fs::read_to_string(record_path(id)) {
            Ok(txt) => Ok(serde_json::from_str(&txt).context("corrupt state record")?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Record::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn by_name(name: &str) -> anyhow::Result<File> {
        let path = LocalPath::from(std::path::Path::new(name));
        let id = path.id();
        KNOWN_NAMES
            .lock()
            .unwrap()
            .insert(id, path.to_string());
        let mut record = Self::load_record(id)?;
        record.path = path.to_string();
        Ok(File {
            id,
            name: name.to_owned(),
            path,
            record,
        })
    }

    /// Re-open a target by the id recorded earlier for it in this process.
    /// Used by the drain pass of the scheduler, which only carries ids for
    /// targets it deferred in the opportunistic pass.
    pub fn by_id(id: u64) -> anyhow::Result<File> {
        let name = KNOWN_NAMES
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no target has been opened under id {id:016x} yet"))?;
        Self::by_name(&name)
    }

    pub fn as_local_path(&self) -> &LocalPath {
        &self.path
    }

    /// Metadata of the target on disk, or `None` if it doesn't exist.
    pub fn try_stat(&self) -> Option<std::fs::Metadata> {
        std::fs::symlink_metadata(self.path.to_abs()).ok()
    }

    /// True if this was built by us before, and its contents on disk no
    /// longer match the stamp recorded at the end of that build.
    pub fn check_externally_modified(&self) -> bool {
        if !self.record.is_generated {
            return false;
        }
        let Some(want) = &self.record.stamp else {
            return false;
        };
        match FileStamp::new(self.path.clone()) {
            Ok(got) => got.hash.to_hex().as_str() != want,
            Err(_) => false,
        }
    }

    /// True if the target exists, wasn't generated by us, and (on first
    /// classification) isn't tracked as a build output either. Once
    /// classified as static/something-else/externally-modified it stays
    /// true without re-consulting git, so a later run that can't see a git
    /// index still gets the same answer.
    pub fn existing_not_generated(&self) -> bool {
        if self.record.is_generated || !self.path.exists() {
            return false;
        }
        match self.record.classification {
            Classification::Static
            | Classification::SomethingElse
            | Classification::ExternallyModified => true,
            Classification::Unknown => crate::git_tracks(self.path.as_path()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.record.failed
    }

    pub fn set_failed(&mut self) {
        self.record.failed = true;
    }

    pub fn set_static(&mut self) {
        self.record.classification = Classification::Static;
    }

    pub fn set_something_else(&mut self) {
        self.record.classification = Classification::SomethingElse;
    }

    pub fn set_externally_modified(&mut self) {
        self.record.classification = Classification::ExternallyModified;
    }

    pub fn is_generated(&self) -> bool {
        self.record.is_generated
    }

    pub fn set_generated(&mut self, generated: bool) {
        self.record.is_generated = generated;
    }

    /// Forget any recorded dependency trace for this target's job. Called
    /// both before a do-file runs (so a half-finished previous attempt
    /// can't leave stale sources behind) and after one fails (so the
    /// failure isn't mistaken for a valid, reproducible build later).
    pub fn zap_deps(&self, rules: &RuleSet) -> anyhow::Result<()> {
        let Some(job) = rules.job_for(self.path.clone()) else {
            return Ok(());
        };
        let mut graph = DepGraph::load_all()?;
        graph.drop_traces_for_job(&job)
    }

    /// Record a successful build: stamp the current contents and mark the
    /// target generated and no longer failed.
    pub fn fin(&mut self) -> anyhow::Result<()> {
        let stamp = FileStamp::new(self.path.clone())?;
        self.record.stamp = Some(stamp.hash.to_hex().to_string());
        self.record.is_generated = true;
        self.record.failed = false;
        Ok(())
    }

    /// Names for the two scratch files a recipe is run with: the first
    /// captures whatever it writes to stdout, the second is the `$3` path
    /// it may write its output to directly instead. Both live next to the
    /// real target so a successful build can `rename` either one into
    /// place atomically.
    pub fn get_tempfilenames(&self) -> (PathBuf, PathBuf) {
        let abs = self.path.to_abs();
        let dir = abs.parent().unwrap().to_owned();
        let name = self.path.file_name();
        (
            dir.join(format!(".{name}.redux.stdout.tmp")),
            dir.join(format!(".{name}.redux.out3.tmp")),
        )
    }

    /// Find the do-file that would build this target, along with the
    /// pieces of its name `$1`/`$2`/`$3` are built from.
    pub fn find_do_file(&self, rules: &RuleSet) -> Option<DoFile> {
        let job = rules.job_for(self.path.clone())?;
        let basedir = job.rule.parent();
        let basename = job.target_minus_extension();
        let ext = job.rule_extension().to_owned();
        Some(DoFile {
            dodir: job.rule_dir_abs(),
            dofile: job.dofile_name().to_owned(),
            basedir,
            basename,
            ext,
            job,
        })
    }

    /// Persist this target's state to disk. The flock-based
    /// [`crate::Lock`] already serializes access per target, so a plain
    /// write-then-rename is enough: no reader ever sees a half-written
    /// record.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = record_path(self.id);
        let tmp = path.with_extension("json.tmp");
        let txt = serde_json::to_string_pretty(&self.record)?;
        std::fs::write(&tmp, txt)?;
        std::fs::rename(&tmp, &path)?;
        debug!(target = self.name, "state saved");
        Ok(())
    }
}

/// The do-file chosen to build a target, and the pieces of its name the
/// recipe is invoked with.
pub struct DoFile {
    pub job: crate::trace::JobSpec,
    pub dodir: PathBuf,
    pub dofile: String,
    pub basedir: LocalPath,
    pub basename: PathBuf,
    pub ext: String,
}

/// Flush any state buffered in memory. Every [`File::save`] above writes
/// through immediately, so in this implementation there's nothing left to
/// flush; kept as an explicit call site so the build lifecycle reads the
/// same as the tool it's modelled on, and so a future write-behind cache
/// has somewhere to hook in.
pub fn commit() {}

/// True if the metadata directory this whole build is keyed off of is
/// still there. A concurrent `rm -rf` of it mid-build is the one failure
/// mode every in-flight lock and record is defenseless against; callers
/// treat `false` as fatal (exit code 205).
pub fn check_sane() -> bool {
    redux_dir().is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_target_is_not_generated_and_not_failed() {
        crate::test_root();
        let f = File::by_name("state_fresh.txt").unwrap();
        assert!(!f.is_generated());
        assert!(!f.is_failed());
    }

    #[test]
    fn fin_then_save_then_reload_round_trips() {
        let dir = crate::test_root();
        std::fs::write(dir.join("state_roundtrip.txt"), b"hello").unwrap();
        let mut f = File::by_name("state_roundtrip.txt").unwrap();
        f.fin().unwrap();
        f.save().unwrap();

        let reloaded = File::by_name("state_roundtrip.txt").unwrap();
        assert!(reloaded.is_generated());
        assert!(!reloaded.check_externally_modified());

        std::fs::write(dir.join("state_roundtrip.txt"), b"tampered").unwrap();
        let reloaded = File::by_name("state_roundtrip.txt").unwrap();
        assert!(reloaded.check_externally_modified());
    }

    #[test]
    fn set_failed_is_sticky_until_cleared_by_fin() {
        crate::test_root();
        let mut f = File::by_name("state_failed.txt").unwrap();
        f.set_failed();
        f.save().unwrap();
        let reloaded = File::by_name("state_failed.txt").unwrap();
        assert!(reloaded.is_failed());
    }

    #[test]
    fn by_id_resolves_a_previously_opened_name() {
        crate::test_root();
        let f = File::by_name("state_by_id.txt").unwrap();
        let id = f.id;
        let reopened = File::by_id(id).unwrap();
        assert_eq!(reopened.name, "state_by_id.txt");
    }

    #[test]
    fn by_id_fails_for_an_unknown_id() {
        crate::test_root();
        assert!(File::by_id(0xdead_beef_dead_beef).is_err());
    }

    #[test]
    fn existing_not_generated_consults_git_for_unknown_classification() {
        let dir = crate::test_root();
        let target = "state_git_tracked.txt";
        std::fs::write(dir.join(target), b"tracked").unwrap();
        let status = std::process::Command::new("git")
            .args(["add", target])
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success());

        let f = File::by_name(target).unwrap();
        assert!(f.existing_not_generated());
    }

    #[test]
    fn existing_not_generated_is_false_for_an_untracked_file() {
        let dir = crate::test_root();
        let target = "state_git_untracked.txt";
        std::fs::write(dir.join(target), b"untracked").unwrap();

        let f = File::by_name(target).unwrap();
        assert!(!f.existing_not_generated());
    }

    #[test]
    fn check_sane_is_true_while_redux_dir_exists() {
        crate::test_root();
        let _ = redux_dir();
        assert!(check_sane());
    }
}
