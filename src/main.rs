use anyhow::anyhow;
use bpaf::{Bpaf, Parser};
use redux::{
    jobserver_client, run_targets, Artifacts, BuildId, Config, DefaultShouldBuild, DepGraph,
    Dirty, EnvVar, FileStamp, LocalPath, RuleSet, ShouldBuild, Tokens, TraceFile, TraceFileLine,
    ENV_VAR_FORCE,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Make sure the given files are up-to-date.
///
/// If possible, redux will restore pre-built copies of the requested files.
/// If not, the files will be built based on their dofiles.
#[derive(Bpaf)]
struct Opts {
    #[bpaf(external)]
    command: Command,
}

#[derive(Bpaf, Clone)]
enum Command {
    /// Make sure the given files are up-to-date
    // NOTE: No #[bpaf(command)] on this one - it's the default
    Build {
        /// Rebuild everything, ignoring any recorded trace
        #[bpaf(short, long)]
        force: bool,
        /// Don't stop after the first target that fails to build
        #[bpaf(short('k'), long("keep-going"))]
        keep_going: bool,
        /// Randomize target order, to flush out order-dependent do-files
        #[bpaf(long)]
        shuffle: bool,
        /// Treat "maybe dirty" targets as dirty instead of rebuilding their
        /// suspect dependencies out-of-band first
        #[bpaf(long("no-oob"))]
        no_oob: bool,
        /// Pass legacy $1/$2 arguments (basename/extension) to do-files
        #[bpaf(long("old-args"))]
        old_args: bool,
        /// Run do-files with `sh -v`
        #[bpaf(short, long)]
        verbose: bool,
        /// Run do-files with `sh -x`
        #[bpaf(short('x'), long)]
        xtrace: bool,
        /// Log lock acquisition/release
        #[bpaf(long("debug-locks"))]
        debug_locks: bool,
        #[bpaf(long)]
        debug: bool,
        /// Limit parallelism to this many jobs (uses all cores by default)
        #[bpaf(
            short,
            long,
            argument("NUM"),
            fallback(jobs_fallback()),
            display_fallback
        )]
        jobs: usize,
        #[bpaf(positional("PATH"), some("Need at least one target"))]
        targets: Vec<PathBuf>,
    },
    /// Out-of-band helper: rebuild `suspects`, then re-check `target`. Runs
    /// under the parent invocation's lock (`REDUX_UNLOCKED=1` in the
    /// environment); never invoked directly by a user.
    #[bpaf(command("redo-unlocked"))]
    Unlocked {
        #[bpaf(positional("TARGET"))]
        target: PathBuf,
        #[bpaf(positional("SUSPECT"))]
        suspects: Vec<PathBuf>,
    },
    /// Mark the given env var as contributing to the behaviour of the current job
    #[bpaf(command)]
    EnvVar {
        #[bpaf(positional("VAR"), some("Need at least one env var"))]
        vars: Vec<String>,
    },
    /// Mark some data as a dependency of the current job (reads from stdin)
    #[bpaf(command)]
    Stamp,
    /// Mark the currently-running job as volatile
    #[bpaf(command)]
    Volatile {
        cache_for: Option<humantime::Duration>,
    },
    /// Show the dofile which builds a given target (or list all dofiles)
    #[bpaf(command)]
    Whichdo {
        #[bpaf(positional("PATH"))]
        target: Option<PathBuf>,
    },
    /// Show the build tree which resulted in the given file
    #[bpaf(command)]
    Howdid {
        #[bpaf(positional("PATH"))]
        target: PathBuf,
    },
    #[bpaf(command)]
    Depgraph {
        all: bool,
        #[bpaf(positional("PATH"))]
        target: Option<PathBuf>,
    },
    /// List all files in the current tree which have been used as a source
    #[bpaf(command)]
    Sources { all: bool },
    /// List all files in the current tree which were generated by redux
    #[bpaf(command)]
    Outputs { all: bool },
    #[bpaf(command)]
    Clean,
}

fn jobs_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|x| x.into())
        .unwrap_or(1)
}

/// Used for `--force`: every target is treated as dirty, ignoring whatever
/// trace might say about it.
struct AlwaysDirty;

impl ShouldBuild for AlwaysDirty {
    fn check(&mut self, _target: &str) -> anyhow::Result<Dirty> {
        Ok(Dirty::Dirty)
    }
}

fn path_name(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

fn main() -> anyhow::Result<()> {
    let opts = opts().run();
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    match opts.command {
        Command::Build {
            targets,
            jobs,
            force,
            keep_going,
            shuffle,
            no_oob,
            old_args,
            verbose,
            xtrace,
            debug_locks,
            debug,
        } => {
            let force = force || std::env::var(ENV_VAR_FORCE).is_ok();
            let config = Config::resolve(
                keep_going,
                shuffle,
                false,
                no_oob,
                old_args,
                verbose,
                xtrace,
                debug_locks,
                debug,
            );
            let client = jobserver_client(jobs)?;
            let tokens = Tokens::new(client);
            let rules = RuleSet::scan_for_do_files()?;
            let mut should_build: Box<dyn ShouldBuild> = if force {
                Box::new(AlwaysDirty)
            } else {
                Box::new(DefaultShouldBuild::load()?)
            };
            let target_names = targets.iter().map(|p| path_name(p)).collect();
            let code = run_targets(target_names, &tokens, &rules, should_build.as_mut(), &config)?;
            std::process::exit(code);
        }
        Command::Unlocked { target, suspects } => {
            // Our parent already holds the real lock on `target`; we assume
            // ownership rather than taking it, for every target we touch.
            let config = Config::resolve(false, false, true, false, false, false, false, false, false);
            let client = jobserver_client(1)?;
            let tokens = Tokens::new(client);
            let rules = RuleSet::scan_for_do_files()?;
            let mut should_build = DefaultShouldBuild::load()?;
            let mut names: Vec<String> = suspects.iter().map(|p| path_name(p)).collect();
            names.push(path_name(&target));
            let code = run_targets(names, &tokens, &rules, &mut should_build, &config)?;
            std::process::exit(code);
        }
        Command::Whichdo { target } => which_do(target.as_deref())?,
        Command::Howdid { target } => how_did(&target)?,
        Command::Depgraph { target, all } => dep_graph(target.as_deref(), all)?,
        Command::Sources { all } => sources(all)?,
        Command::Outputs { all } => outputs(all)?,
        Command::Clean => clean_all()?,
        Command::EnvVar { vars } => record_env_vars(vars)?,
        Command::Stamp => record_stdin_stamp()?,
        Command::Volatile { cache_for } => record_volatile(cache_for)?,
    }
    Ok(())
}

/// Evict every target this tool has ever built into the artifact store, then
/// delete it from the working tree; a later build can restore it byte-for-
/// byte instead of redoing the work, as long as its trace is still valid.
fn clean_all() -> anyhow::Result<()> {
    let dep_graph = DepGraph::load_all()?;
    let outputs: BTreeSet<&LocalPath> = dep_graph.outputs().map(|x| &x.path).collect();
    let mut artifacts = Artifacts::new()?;
    for s in outputs {
        if let Ok(stamp) = FileStamp::new(s.clone()) {
            artifacts.insert(&stamp)?;
            std::fs::remove_file(s.to_abs())?;
            println!(
                "{}: Removed (available at {})",
                s,
                Artifacts::store_path(stamp.hash).display(),
            );
        }
    }
    Ok(())
}

fn record_env_vars(vars: Vec<String>) -> anyhow::Result<()> {
    let tracefile = TraceFile::current()?;
    for key in vars {
        let val = std::env::var(&key)?;
        TraceFile::append(
            tracefile.as_ref(),
            TraceFileLine::EnvVar(EnvVar { key, val }),
        )?;
    }
    Ok(())
}

fn record_stdin_stamp() -> anyhow::Result<()> {
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut std::io::stdin(), &mut hasher)?;
    let hash = hasher.finalize();
    let tracefile = TraceFile::current()?;
    TraceFile::append(tracefile.as_ref(), TraceFileLine::Data(hash))
}

fn record_volatile(cache_for: Option<humantime::Duration>) -> anyhow::Result<()> {
    let tracefile = TraceFile::current()?;
    if let Some(d) = cache_for {
        let t = humantime::Timestamp::from(SystemTime::now() + *d);
        TraceFile::append(tracefile.as_ref(), TraceFileLine::ValidUntil(t.into()))
    } else {
        let build_id = BuildId::current()?;
        TraceFile::append(tracefile.as_ref(), TraceFileLine::ValidFor(build_id))
    }
}

fn which_do(target: Option<&Path>) -> anyhow::Result<()> {
    let rules = RuleSet::scan_for_do_files()?;
    if let Some(target) = target {
        match rules.job_for(target.into()) {
            Some(job) => println!("{}: {}", target.display(), job.rule),
            None => {
                eprintln!("{}: No rule found", target.display());
                std::process::exit(1);
            }
        }
    } else {
        for (glob, do_file) in rules.iter() {
            println!("{}: {}", glob, do_file);
        }
    }
    Ok(())
}

fn how_did(target: &Path) -> anyhow::Result<()> {
    let stamp = FileStamp::new(target.into())?;
    let dep_graph = DepGraph::load_all()?;
    match dep_graph.some_tree_for(&stamp) {
        Some(tree) => println!("{tree}"),
        None => println!("{}: No build tree found", target.display()),
    }
    Ok(())
}

fn dep_graph(target: Option<&Path>, all: bool) -> anyhow::Result<()> {
    let mut dep_graph = DepGraph::load_all()?;
    let rules = RuleSet::scan_for_do_files()?;
    if !all {
        dep_graph.drop_superseded(&rules);
        dep_graph.drop_out_of_date();
    }
    if let Some(target) = target {
        let job = rules
            .job_for(target.into())
            .ok_or_else(|| anyhow!("No rule"))?;
        let tree = dep_graph
            .valid_trace_for(&job)
            .ok_or_else(|| anyhow!("No valid traces found"))?;
        println!("{tree}");
    } else {
        for (j, ts) in dep_graph.traces {
            for t in ts {
                println!("{}: {t}", j.fancy());
            }
        }
    }
    Ok(())
}

fn sources(all: bool) -> anyhow::Result<()> {
    let dep_graph = DepGraph::load_all()?;
    let sources: BTreeSet<&LocalPath> = dep_graph.sources().map(|x| &x.path).collect();
    for s in sources {
        if all || s.exists() {
            println!("{s}");
        }
    }
    Ok(())
}

fn outputs(all: bool) -> anyhow::Result<()> {
    let dep_graph = DepGraph::load_all()?;
    let outputs: BTreeSet<&LocalPath> = dep_graph.outputs().map(|x| &x.path).collect();
    for s in outputs {
        if all || s.exists() {
            println!("{s}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    fn test_root() -> &'static Path {
        static DIR: LazyLock<tempfile::TempDir> = LazyLock::new(|| {
            let dir = tempfile::tempdir().unwrap();
            std::env::set_current_dir(dir.path()).unwrap();
            dir
        });
        DIR.path()
    }

    // `record_env_vars`/`record_volatile` read REDUX_TRACEFILE from the
    // process environment, which every test in this binary shares.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn which_do_finds_the_rule_for_a_target() {
        let dir = test_root();
        std::fs::write(dir.join("main_whichdo.txt.do"), "echo hi\n").unwrap();
        which_do(Some(Path::new("main_whichdo.txt"))).unwrap();
    }

    #[test]
    fn which_do_with_no_target_lists_every_rule() {
        test_root();
        which_do(None).unwrap();
    }

    #[test]
    fn how_did_reports_no_tree_for_an_unbuilt_file() {
        let dir = test_root();
        std::fs::write(dir.join("main_howdid.txt"), b"plain").unwrap();
        how_did(Path::new("main_howdid.txt")).unwrap();
    }

    #[test]
    fn dep_graph_with_no_target_lists_every_trace() {
        test_root();
        dep_graph(None, true).unwrap();
    }

    #[test]
    fn sources_and_outputs_run_against_an_empty_graph() {
        test_root();
        sources(true).unwrap();
        outputs(true).unwrap();
    }

    #[test]
    fn clean_all_removes_a_recorded_output_and_stores_it_as_an_artifact() {
        let dir = test_root();
        std::fs::write(dir.join("main_clean_src.txt.do"), "echo hi\n").unwrap();
        std::fs::write(dir.join("main_clean_src.txt"), b"built content").unwrap();
        let rules = RuleSet::scan_for_do_files().unwrap();
        let output_path = LocalPath::from(Path::new("main_clean_src.txt"));
        let job = rules.job_for(output_path.clone()).unwrap();
        let stamp = FileStamp::new(output_path).unwrap();
        let tf = TraceFile::create(job).unwrap().unwrap();
        tf.finish(stamp.clone()).unwrap();

        clean_all().unwrap();

        assert!(!dir.join("main_clean_src.txt").exists());
        assert!(Artifacts::store_path(stamp.hash).exists());
    }

    #[test]
    fn record_env_vars_appends_to_the_current_tracefile() {
        let _g = ENV_GUARD.lock().unwrap();
        let dir = test_root();
        std::fs::write(dir.join("main_envvar_src.txt.do"), "echo hi\n").unwrap();
        let rules = RuleSet::scan_for_do_files().unwrap();
        let target = LocalPath::from(Path::new("main_envvar_src.txt"));
        let job = rules.job_for(target).unwrap();
        let tf = TraceFile::create(job).unwrap().unwrap();

        std::env::set_var("MAIN_TEST_ENV_VAR", "value");
        std::env::set_var(redux::ENV_VAR_TRACEFILE, &tf.path);
        record_env_vars(vec!["MAIN_TEST_ENV_VAR".into()]).unwrap();
        std::env::remove_var(redux::ENV_VAR_TRACEFILE);
        std::env::remove_var("MAIN_TEST_ENV_VAR");

        let contents = std::fs::read_to_string(&tf.path).unwrap();
        assert!(contents.contains("env_var MAIN_TEST_ENV_VAR=value"));
    }

    #[test]
    fn record_volatile_with_no_duration_records_the_current_build_id() {
        let _g = ENV_GUARD.lock().unwrap();
        let dir = test_root();
        std::fs::write(dir.join("main_volatile_src.txt.do"), "echo hi\n").unwrap();
        let rules = RuleSet::scan_for_do_files().unwrap();
        let target = LocalPath::from(Path::new("main_volatile_src.txt"));
        let job = rules.job_for(target).unwrap();
        let tf = TraceFile::create(job).unwrap().unwrap();

        std::env::set_var(redux::ENV_VAR_TRACEFILE, &tf.path);
        let build_id = BuildId::new();
        std::env::set_var(redux::ENV_VAR_BUILD_ID, build_id.0.to_string());
        record_volatile(None).unwrap();
        std::env::remove_var(redux::ENV_VAR_TRACEFILE);
        std::env::remove_var(redux::ENV_VAR_BUILD_ID);

        let contents = std::fs::read_to_string(&tf.path).unwrap();
        assert!(contents.contains(&format!("valid_for {}", build_id.0)));
    }
}
