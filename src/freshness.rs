//! The pluggable "is this target still fresh?" capability `BuildJob`
//! consumes at the top of its lifecycle, plus the production implementation
//! of it: a walk over the persisted dependency graph.
//!
//! Grounded on this crate's earlier `try_restore`/`is_source` free
//! functions, recast as the injectable trait the build lifecycle needs
//! instead of a function baked into a top-level `build()`.

use crate::{Artifacts, DepGraph, FileStamp, LocalPath, RuleSet};
use tracing::debug;

/// What a [`ShouldBuild`] implementation decided about one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dirty {
    /// Nothing needs to happen; treat the build as already done.
    Clean,
    /// Run the do-file.
    Dirty,
    /// Some of the target's recorded dependencies look out of date, but
    /// they're themselves build products that might turn out unchanged
    /// after being rebuilt — hand this target to the out-of-band path
    /// instead of committing to a rebuild right away.
    Maybe(Vec<LocalPath>),
    /// Skip straight to finishing the target with this exit code, without
    /// running a do-file at all.
    ShortCircuit(i32),
}

/// The capability `BuildJob::start` consults to decide whether a target
/// needs rebuilding. Swappable so the scheduler's own tests don't need a
/// real dependency graph on disk.
pub trait ShouldBuild {
    fn check(&mut self, target: &str) -> anyhow::Result<Dirty>;
}

impl<F> ShouldBuild for F
where
    F: FnMut(&str) -> anyhow::Result<Dirty>,
{
    fn check(&mut self, target: &str) -> anyhow::Result<Dirty> {
        self(target)
    }
}

/// The freshness engine used by the real `build` command: consult the
/// persisted trace for the target's job, and trust it if every recorded
/// source still hashes the way it did when the trace was written.
pub struct DefaultShouldBuild {
    rules: RuleSet,
    graph: DepGraph,
    artifacts: Artifacts,
}

impl DefaultShouldBuild {
    pub fn load() -> anyhow::Result<Self> {
        let rules = RuleSet::scan_for_do_files()?;
        let graph = DepGraph::load(&rules)?;
        let artifacts = Artifacts::new()?;
        Ok(DefaultShouldBuild {
            rules,
            graph,
            artifacts,
        })
    }
}

impl ShouldBuild for DefaultShouldBuild {
    fn check(&mut self, target: &str) -> anyhow::Result<Dirty> {
        let path = LocalPath::from(std::path::Path::new(target));
        let Some(job) = self.rules.job_for(path.clone()) else {
            // No rule at all: a plain source file (or a typo). Either way
            // there's nothing for us to build; let the caller's existence
            // check decide whether that's an error.
            return Ok(Dirty::Dirty);
        };
        let Some(tree) = self.graph.valid_trace_for(&job) else {
            return self.suspects_or_dirty(target, &job);
        };
        let current = match FileStamp::new(path.clone()) {
            Ok(s) => s,
            Err(_) => {
                debug!(target, "no trace output missing on disk, dirty");
                return self.maybe_restore(&path, &tree);
            }
        };
        let output_matches = tree.outputs.iter().any(|o| o.hash == current.hash);
        if output_matches {
            debug!(target, "trace is valid and on-disk content matches");
            return Ok(Dirty::Clean);
        }
        self.maybe_restore(&path, &tree)
    }
}

impl DefaultShouldBuild {
    /// No trace of `job` validated outright. Look at which of its recorded
    /// sources are the ones that changed: if every one of them is itself a
    /// target this ruleset knows how to build, there's a chance rebuilding
    /// them turns out to be a no-op (unchanged content), so report `Maybe`
    /// and let the out-of-band path settle it instead of committing to a
    /// rebuild of `target` right away. A source that isn't anybody's build
    /// target can't be resolved that way, so it forces a straight rebuild.
    fn suspects_or_dirty(&self, target: &str, job: &crate::trace::JobSpec) -> anyhow::Result<Dirty> {
        let Some(invalid) = self.graph.invalid_sources(job) else {
            return Ok(Dirty::Dirty);
        };
        if invalid.is_empty() {
            return Ok(Dirty::Dirty);
        }
        let mut suspects = Vec::with_capacity(invalid.len());
        for source in invalid {
            if self.rules.job_for(source.clone()).is_some() {
                suspects.push(source);
            } else {
                debug!(target, %source, "invalid source has no rule, rebuilding directly");
                return Ok(Dirty::Dirty);
            }
        }
        debug!(target, ?suspects, "suspect sources have rules, deferring out-of-band");
        Ok(Dirty::Maybe(suspects))
    }

    /// A valid trace exists but the on-disk content doesn't match it (most
    /// often because the file is simply missing). If we happen to have the
    /// exact bytes the trace says it should contain, restore them instead
    /// of redoing the work — an enhancement layered on top of the build's
    /// required rename-based publication, never a substitute for it.
    fn maybe_restore(&self, path: &LocalPath, tree: &crate::depgraph::BuildTree) -> anyhow::Result<Dirty> {
        if path.exists() {
            return Ok(Dirty::Dirty);
        }
        let Some(wanted) = tree.outputs.iter().find(|o| &o.path == path) else {
            return Ok(Dirty::Dirty);
        };
        match self.artifacts.restore(wanted) {
            Ok(()) => {
                debug!(%path, "restored from the artifact store");
                Ok(Dirty::Clean)
            }
            Err(_) => Ok(Dirty::Dirty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_blanket_impl_is_usable_as_a_should_build() {
        let mut f = |t: &str| -> anyhow::Result<Dirty> {
            if t == "clean.txt" {
                Ok(Dirty::Clean)
            } else {
                Ok(Dirty::Dirty)
            }
        };
        assert_eq!(f.check("clean.txt").unwrap(), Dirty::Clean);
        assert_eq!(f.check("other.txt").unwrap(), Dirty::Dirty);
    }

    #[test]
    fn default_should_build_treats_ruleless_target_as_dirty() {
        crate::test_root();
        let mut sb = DefaultShouldBuild::load().unwrap();
        assert_eq!(
            sb.check("freshness_no_rule.txt").unwrap(),
            Dirty::Dirty
        );
    }

    #[test]
    fn default_should_build_reports_maybe_when_a_suspect_source_has_a_rule() {
        use crate::{TraceFile, TraceFileLine};

        let dir = crate::test_root();
        std::fs::write(dir.join("freshness_src.txt.do"), "echo src\n").unwrap();
        std::fs::write(dir.join("freshness_src.txt"), b"original").unwrap();
        std::fs::write(dir.join("freshness_out.txt.do"), "echo out\n").unwrap();
        std::fs::write(dir.join("freshness_out.txt"), b"built").unwrap();

        let rules = RuleSet::scan_for_do_files().unwrap();
        let source_path = LocalPath::from(std::path::Path::new("freshness_src.txt"));
        let output_path = LocalPath::from(std::path::Path::new("freshness_out.txt"));
        let job = rules.job_for(output_path.clone()).unwrap();

        let source_stamp = FileStamp::new(source_path.clone()).unwrap();
        let output_stamp = FileStamp::new(output_path.clone()).unwrap();
        let tf = TraceFile::create(job).unwrap().unwrap();
        TraceFile::append(Some(&tf), TraceFileLine::Source(source_stamp)).unwrap();
        tf.finish(output_stamp).unwrap();

        // The source changes after the trace was recorded, invalidating it.
        std::fs::write(dir.join("freshness_src.txt"), b"changed").unwrap();

        let mut sb = DefaultShouldBuild::load().unwrap();
        match sb.check("freshness_out.txt").unwrap() {
            Dirty::Maybe(suspects) => assert_eq!(suspects, vec![source_path]),
            other => panic!("expected Maybe, got {other:?}"),
        }
    }
}
