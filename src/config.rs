//! Scheduling/build flags, resolved from CLI arguments and `REDO_*`/
//! `REDUX_*` environment variables so that a recursive invocation (a
//! do-file shelling back out to this binary) inherits the top-level
//! invocation's behaviour, the way classic `redo`'s `REDO_*` variables
//! propagate across recursive `redo-ifchange` calls.

use std::path::PathBuf;

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| v != "0" && v != "")
}

/// Resolved configuration for one `run_targets` invocation.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Don't stop dispatching new targets after the first failure.
    pub keep_going: bool,
    /// Randomize target order in phase 1, to flush out order-dependent bugs.
    pub shuffle: bool,
    /// We are the re-entrant `redo-unlocked` helper: assume lock ownership
    /// instead of taking it.
    pub unlocked: bool,
    /// Skip the out-of-band path entirely; treat "maybe dirty" as dirty.
    pub no_oob: bool,
    /// Pass legacy `$1`/`$2` (basename/extension split) instead of the
    /// modern (full name/basename) convention.
    pub old_args: bool,
    pub verbose: bool,
    pub xtrace: bool,
    pub debug_locks: bool,
    pub debug: bool,
    /// Directory the top-level invocation started in; used to compute
    /// `REDO_PWD` for recipe children and to print user-relative paths.
    pub startdir: PathBuf,
    /// Nesting depth string (a multiple of two spaces), inherited from
    /// `REDO_DEPTH` and extended by two spaces for each recipe child.
    pub depth: String,
}

impl Config {
    /// CLI flags take priority; anything left unset falls back to the
    /// matching environment variable so it propagates to recursive
    /// invocations of this binary.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        keep_going: bool,
        shuffle: bool,
        unlocked: bool,
        no_oob: bool,
        old_args: bool,
        verbose: bool,
        xtrace: bool,
        debug_locks: bool,
        debug: bool,
    ) -> Config {
        let startdir = std::env::var_os("REDO_STARTDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        let depth = std::env::var("REDO_DEPTH").unwrap_or_default();
        Config {
            keep_going: keep_going || env_flag("REDUX_KEEP_GOING"),
            shuffle: shuffle || env_flag("REDUX_SHUFFLE"),
            unlocked: unlocked || env_flag("REDUX_UNLOCKED"),
            no_oob: no_oob || env_flag("REDUX_NO_OOB"),
            old_args: old_args || env_flag("REDUX_OLD_ARGS"),
            verbose: verbose || env_flag("REDUX_VERBOSE"),
            xtrace: xtrace || env_flag("REDUX_XTRACE"),
            debug_locks: debug_locks || env_flag("REDUX_DEBUG_LOCKS"),
            debug: debug || env_flag("REDUX_DEBUG"),
            startdir,
            depth,
        }
    }

    /// Environment to set (in addition to per-job variables) on any child
    /// process of this one that might itself be a `redux` invocation, so
    /// the flags above keep applying recursively.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![("REDO_STARTDIR", self.startdir.display().to_string())];
        if self.keep_going {
            env.push(("REDUX_KEEP_GOING", "1".into()));
        }
        if self.no_oob {
            env.push(("REDUX_NO_OOB", "1".into()));
        }
        if self.old_args {
            env.push(("REDUX_OLD_ARGS", "1".into()));
        }
        if self.verbose {
            env.push(("REDUX_VERBOSE", "1".into()));
        }
        if self.xtrace {
            env.push(("REDUX_XTRACE", "1".into()));
        }
        if self.debug_locks {
            env.push(("REDUX_DEBUG_LOCKS", "1".into()));
        }
        if self.debug {
            env.push(("REDUX_DEBUG", "1".into()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_absent_env() {
        let cfg = Config::resolve(true, false, false, false, false, false, false, false, false);
        assert!(cfg.keep_going);
        assert!(!cfg.shuffle);
    }

    #[test]
    fn child_env_only_lists_set_flags() {
        let cfg = Config::resolve(
            false, false, false, false, false, false, false, false, false,
        );
        assert!(cfg
            .child_env()
            .iter()
            .all(|(k, _)| *k == "REDO_STARTDIR"));
    }
}
