mod artifacts;
mod config;
mod depgraph;
mod filestamp;
mod freshness;
mod job;
mod local_path;
mod lock;
mod ruleset;
mod scheduler;
mod state;
mod tokens;
mod trace;

pub use crate::{
    artifacts::Artifacts,
    config::Config,
    depgraph::DepGraph,
    filestamp::FileStamp,
    freshness::{DefaultShouldBuild, Dirty, ShouldBuild},
    job::BuildJob,
    local_path::LocalPath,
    lock::Lock,
    ruleset::RuleSet,
    scheduler::run_targets,
    state::File,
    tokens::{jobserver_client, Tokens},
    trace::{EnvVar, TraceFile, TraceFileLine, TRACES_DIR},
};

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Either a discovered git repository, or a plain directory used as a
/// fallback project root when none was found. Classic `redo` doesn't
/// require git at all; the tool this crate grew from does, purely to get a
/// second opinion on "is this file a human-authored source". We keep that
/// integration where it's available, but don't make the whole tool depend
/// on it.
enum Repo {
    Git(gix::ThreadSafeRepository),
    Bare(PathBuf),
}

static REPO: LazyLock<Repo> = LazyLock::new(|| match gix::discover(".") {
    Ok(repo) => Repo::Git(repo.into_sync()),
    Err(e) => {
        warn!("no git repository found ({e}); treating the current directory as the project root");
        Repo::Bare(std::env::current_dir().expect("current directory"))
    }
});

pub fn project_base() -> &'static Path {
    static PROJECT_BASE: LazyLock<PathBuf> = LazyLock::new(|| {
        let path = match &*REPO {
            Repo::Git(repo) => repo
                .to_thread_local()
                .worktree()
                .expect("git repo has a worktree")
                .base()
                .to_owned(),
            Repo::Bare(dir) => dir.clone(),
        };
        let path = path.canonicalize().unwrap();
        debug!("project_base = {}", path.display());
        path
    });
    &PROJECT_BASE
}

/// True if `path` (repo-relative) is tracked in the git index. Always false
/// when there's no git repository to consult.
pub(crate) fn git_tracks(path: &Path) -> bool {
    let Repo::Git(repo) = &*REPO else {
        return false;
    };
    let Ok(index) = repo.to_thread_local().index_or_load_from_head() else {
        return false;
    };
    let Some(path) = path.as_os_str().to_str() else {
        return false;
    };
    index
        .entry_index_by_path(gix::bstr::BStr::new(path.as_bytes()))
        .is_ok()
}

pub fn redux_dir() -> &'static Path {
    static REDUX_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
        let base = match &*REPO {
            Repo::Git(repo) => repo.git_dir().to_owned(),
            Repo::Bare(dir) => dir.join(".redux-meta"),
        };
        let redux_dir = base.join("redux");
        std::fs::create_dir_all(&redux_dir).unwrap();
        debug!("redux dir = {}", redux_dir.display());
        redux_dir.canonicalize().unwrap()
    });
    &REDUX_DIR
}

pub const ENV_VAR_TRACEFILE: &str = "REDUX_TRACEFILE";
pub const ENV_VAR_BUILD_ID: &str = "REDUX_BUILD_ID";
pub const ENV_VAR_FORCE: &str = "REDUX_FORCE";

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Default, PartialOrd, Ord)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn new() -> Self {
        BuildId(Uuid::new_v4())
    }

    pub fn current() -> anyhow::Result<BuildId> {
        Ok(Self::current2()?.unwrap_or_else(Self::new))
    }

    pub fn is_current(self) -> bool {
        match Self::current2() {
            Ok(Some(x)) => x == self,
            _ => false,
        }
    }

    fn current2() -> anyhow::Result<Option<BuildId>> {
        match std::env::var(ENV_VAR_BUILD_ID) {
            Ok(x) => Ok(Some(BuildId(x.parse()?))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Test-only process-wide fixture: a single throwaway directory used as the
/// project root for every test that needs `redux_dir()`/`project_base()`.
/// Those are backed by process-global `LazyLock`s (mirroring the original
/// design), so every test in this binary necessarily shares one root; tests
/// that touch the filesystem pick distinct file names so they stay
/// independent of each other even when run concurrently.
#[cfg(test)]
pub(crate) fn test_root() -> &'static Path {
    static DIR: LazyLock<tempfile::TempDir> = LazyLock::new(|| {
        let dir = tempfile::tempdir().unwrap();
        // A real (if empty) repo, not just a bare directory fallback, so
        // tests exercising the git-backed parts of `state.rs` have an index
        // to stage files into.
        gix::init(dir.path()).expect("throwaway git repo for tests");
        std::env::set_current_dir(dir.path()).unwrap();
        dir
    });
    DIR.path()
}
