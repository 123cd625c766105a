//! The lifecycle of building a single target: decide whether it's dirty,
//! resolve and run its do-file, and either publish the result or record a
//! failure.
//!
//! Grounded on `BuildJob` in the Python original this crate's build-core
//! was distilled from (`__init__`, `start`, `_start_do`, `_setup_argv`,
//! `_do_subproc`, `_after`/`_after1`, `_check_direct_modify`,
//! `_check_redundant_output`, `_nah`, `_yeah`, `_after2`), with the
//! subprocess body expressed via `std::process::Command` in the style of
//! `std::process::Command` rather than a literal `fork`+`exec`.

use crate::freshness::{Dirty, ShouldBuild};
use crate::state::DoFile;
use crate::{BuildId, Config, Lock, LocalPath, RuleSet, Tokens, ENV_VAR_BUILD_ID, ENV_VAR_TRACEFILE};
use crate::{File as StateFile, FileStamp, TraceFile, TraceFileLine};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{error, info, warn};

/// A single target's worth of work: owns everything needed to decide
/// whether it needs rebuilding, and, if so, to run and publish its
/// do-file. Consumed by `start`, which hands the heavy lifting off to a
/// background thread and keeps only the lock-release/completion-callback
/// step in the driver's own calling context.
pub struct BuildJob {
    target: String,
    state: StateFile,
    lock: Lock,
    tmp_stdout: PathBuf,
    tmp_out3: PathBuf,
    before: Option<Metadata>,
    config: Config,
}

impl BuildJob {
    pub fn new(target: String, state: StateFile, lock: Lock, config: Config) -> BuildJob {
        let (tmp_stdout, tmp_out3) = state.get_tempfilenames();
        let before = state.try_stat();
        BuildJob {
            target,
            state,
            lock,
            tmp_stdout,
            tmp_out3,
            before,
            config,
        }
    }

    /// Precondition: `self.lock.owned`.
    pub fn start(
        mut self,
        should_build: &mut dyn ShouldBuild,
        tokens: &Tokens,
        rules: &RuleSet,
        done: impl FnOnce(&str, i32) + Send + 'static,
    ) {
        assert!(self.lock.owned, "BuildJob::start without a held lock");
        let dirty = match should_build.check(&self.target) {
            Ok(d) => d,
            Err(e) => {
                error!(target = self.target, "shouldbuild failed: {e}");
                Dirty::ShortCircuit(1)
            }
        };
        match dirty {
            Dirty::Clean => self.after2(0, done),
            Dirty::ShortCircuit(rv) => self.after2(rv, done),
            Dirty::Dirty => self.start_do(tokens, rules, done),
            Dirty::Maybe(children) => {
                if self.config.no_oob {
                    self.start_do(tokens, rules, done)
                } else {
                    self.start_unlocked(children, tokens, done)
                }
            }
        }
    }

    fn start_do(
        mut self,
        tokens: &Tokens,
        rules: &RuleSet,
        done: impl FnOnce(&str, i32) + Send + 'static,
    ) {
        if self.state.check_externally_modified() {
            warn!(target = self.target, "modified outside this tool; leaving it alone");
            self.state.set_externally_modified();
            log_save_error(self.state.save());
            return self.after2(0, done);
        }

        if self.state.existing_not_generated() {
            self.state.set_something_else();
            log_save_error(self.state.save());
            return self.after2(0, done);
        }

        if let Err(e) = self.state.zap_deps(rules) {
            warn!(target = self.target, "could not clear old trace: {e}");
        }

        let Some(do_file) = self.state.find_do_file(rules) else {
            if self.state.as_local_path().exists() {
                self.state.set_something_else();
                log_save_error(self.state.save());
                return self.after2(0, done);
            }
            error!("no rule to make '{}'", self.target);
            return self.after2(1, done);
        };

        let (basename, ext) = argv_name_parts(&do_file);
        let argv = match setup_argv(&do_file, &basename, &ext, &self.config, &self.tmp_out3) {
            Ok(argv) => argv,
            Err(e) => {
                error!(target = self.target, "could not set up recipe: {e}");
                return self.after2(1, done);
            }
        };

        info!("{}", relative_to_startdir(&self.target, &self.config));
        self.state.set_generated(true);
        log_save_error(self.state.save());

        let do_file_name = do_file.dodir.join(&do_file.dofile);
        if let Ok(mut dof) = StateFile::by_name(&do_file_name.to_string_lossy()) {
            dof.set_static();
            log_save_error(dof.save());
        }
        crate::state::commit();

        let execution = Execution {
            state: self.state,
            target: self.target.clone(),
            tmp_stdout: self.tmp_stdout,
            tmp_out3: self.tmp_out3,
            before: self.before,
            argv,
            do_file,
            basename,
            ext,
            config: self.config,
        };
        let mut lock = self.lock;
        let target_name = self.target.clone();
        tokens.start_job(
            target_name,
            move || execution.run(),
            move |name, rv| {
                done(name, rv);
                lock.unlock();
            },
        );
    }

    /// Out-of-band path: some of the target's recorded dependencies look
    /// dirty but might turn out unchanged after their own rebuild, so hand
    /// off to a re-entrant `redo-unlocked` child that holds onto our lock
    /// while it sorts the suspects out.
    fn start_unlocked(
        self,
        suspects: Vec<LocalPath>,
        tokens: &Tokens,
        done: impl FnOnce(&str, i32) + Send + 'static,
    ) {
        info!("({})", relative_to_startdir(&self.target, &self.config));
        crate::state::commit();
        let exe = std::env::current_exe();
        let target = self.target.clone();
        let config = self.config.clone();
        let mut lock = self.lock;
        tokens.start_job(
            self.target.clone(),
            move || {
                let exe = match exe {
                    Ok(e) => e,
                    Err(e) => {
                        error!("{e}");
                        return 1;
                    }
                };
                let mut cmd = Command::new(exe);
                cmd.arg("redo-unlocked").arg(&target);
                cmd.args(suspects.iter().map(|p| p.to_string()));
                cmd.env("REDO_DEPTH", format!("{}  ", config.depth));
                cmd.env("REDUX_UNLOCKED", "1");
                for (k, v) in config.child_env() {
                    cmd.env(k, v);
                }
                match cmd.status() {
                    Ok(status) => status.code().unwrap_or(1),
                    Err(e) => {
                        error!("{e}");
                        1
                    }
                }
            },
            move |name, rv| {
                done(name, rv);
                lock.unlock();
            },
        );
    }

    fn after2(self, rv: i32, done: impl FnOnce(&str, i32)) {
        done(&self.target, rv);
        let mut lock = self.lock;
        lock.unlock();
    }
}

fn log_save_error(result: anyhow::Result<()>) {
    if let Err(e) = result {
        error!("could not save build state: {e}");
    }
}

fn relative_to_startdir(target: &str, config: &Config) -> String {
    match pathdiff::diff_paths(target, &config.startdir) {
        Some(p) => p.display().to_string(),
        None => target.to_owned(),
    }
}

fn argv_name_parts(do_file: &DoFile) -> (String, String) {
    (do_file.basename.to_string_lossy().into_owned(), do_file.ext.clone())
}

fn setup_argv(
    do_file: &DoFile,
    basename: &str,
    ext: &str,
    config: &Config,
    tmp_out3: &std::path::Path,
) -> anyhow::Result<Vec<String>> {
    let dofile_path = do_file.dodir.join(&do_file.dofile);
    let (arg1, arg2) = if config.old_args {
        (basename.to_owned(), ext.to_owned())
    } else {
        (format!("{basename}{ext}"), basename.to_owned())
    };

    let mut interpreter = vec!["sh".to_owned(), "-e".to_owned()];
    if config.verbose {
        interpreter[1].push('v');
    }
    if config.xtrace {
        interpreter[1].push('x');
    }

    let firstline = std::fs::read_to_string(&dofile_path)
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .to_owned();
    if firstline.starts_with("#!/") {
        interpreter = firstline[2..].split(' ').map(str::to_owned).collect();
    }

    let arg3 = match pathdiff::diff_paths(tmp_out3, &do_file.dodir) {
        Some(p) => p.display().to_string(),
        None => tmp_out3.display().to_string(),
    };

    let mut argv = interpreter;
    argv.push(do_file.dofile.clone());
    argv.push(arg1);
    argv.push(arg2);
    argv.push(arg3);
    Ok(argv)
}

/// Everything needed to actually run a recipe and publish its result,
/// handed wholesale to a background thread by `Tokens::start_job`.
struct Execution {
    state: StateFile,
    target: String,
    tmp_stdout: PathBuf,
    tmp_out3: PathBuf,
    before: Option<Metadata>,
    argv: Vec<String>,
    do_file: DoFile,
    basename: String,
    ext: String,
    config: Config,
}

impl Execution {
    fn run(mut self) -> i32 {
        let _ = std::fs::remove_file(&self.tmp_stdout);
        let _ = std::fs::remove_file(&self.tmp_out3);

        let stdout_file = match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&self.tmp_stdout)
        {
            Ok(f) => f,
            Err(e) => {
                error!(target = self.target, "could not create temp stdout file: {e}");
                self.nah(1);
                return 1;
            }
        };

        let tracefile = match TraceFile::create(self.do_file.job.clone()) {
            Ok(tf) => tf,
            Err(e) => {
                warn!(target = self.target, "could not start a tracefile: {e}");
                None
            }
        };

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.current_dir(&self.do_file.dodir);
        cmd.stdout(Stdio::from(stdout_file));
        cmd.env("REDO_PWD", realpath_relative_to_startdir(&self.do_file.dodir, &self.config));
        cmd.env("REDO_TARGET", format!("{}{}", self.basename, self.ext));
        cmd.env("REDO_DEPTH", format!("{}  ", self.config.depth));
        if let Some(tf) = &tracefile {
            cmd.env(ENV_VAR_TRACEFILE, &tf.path);
        }
        if let Ok(build_id) = BuildId::current() {
            cmd.env(ENV_VAR_BUILD_ID, build_id.0.to_string());
        }
        for (k, v) in self.config.child_env() {
            cmd.env(k, v);
        }

        let status = match cmd.status() {
            Ok(s) => s,
            Err(e) => {
                error!(target = self.target, "could not run recipe: {e}");
                self.nah(1);
                return 1;
            }
        };
        let rv = status.code().unwrap_or(1);
        if rv != 0 {
            error!("{}: exit code {rv}", self.target);
            self.nah(rv);
            return rv;
        }

        if let Err(rv) = self.check_direct_modify() {
            self.nah(rv);
            return rv;
        }

        let st1 = match std::fs::metadata(&self.tmp_stdout) {
            Ok(m) => m,
            Err(e) => {
                error!(target = self.target, "lost temp stdout file: {e}");
                self.nah(1);
                return 1;
            }
        };
        let st2 = std::fs::metadata(&self.tmp_out3).ok();

        if let Err(rv) = check_redundant_output(&self.target, &st1, st2.as_ref()) {
            self.nah(rv);
            return rv;
        }

        self.yeah(&st1, st2.as_ref());
        if let Err(e) = self.state.fin() {
            error!(target = self.target, "could not stamp finished build: {e}");
        }
        log_save_error(self.state.save());
        if let (Some(tf), Ok(stamp)) = (&tracefile, FileStamp::new(self.state.as_local_path().clone())) {
            if let Err(e) = tf.finish(stamp.clone()) {
                warn!(target = self.target, "could not record trace output: {e}");
            }
            let _ = TraceFile::append(Some(tf), TraceFileLine::Produced(stamp));
        }
        if self.config.verbose || self.config.xtrace || self.config.debug {
            info!("{} (done)", self.target);
        }
        0
    }

    fn check_direct_modify(&self) -> Result<(), i32> {
        let after = self.state.try_stat();
        let modified = match (&self.before, &after) {
            (_, None) => false,
            (None, Some(a)) => !is_dir(a),
            (Some(b), Some(a)) => b.ctime() != a.ctime() && !is_dir(a),
        };
        if modified {
            error!(
                "{}: modified directly! update $3 or stdout, not $1",
                self.target
            );
            return Err(206);
        }
        Ok(())
    }

    fn nah(&mut self, rv: i32) {
        let _ = std::fs::remove_file(&self.tmp_stdout);
        let _ = std::fs::remove_file(&self.tmp_out3);
        self.state.set_failed();
        // Discard any trace recorded for this half-finished attempt so a
        // later run can't mistake it for a valid, reproducible build.
        if let Ok(mut graph) = crate::DepGraph::load_all() {
            let _ = graph.drop_traces_for_job(&self.do_file.job);
        }
        log_save_error(self.state.save());
    }

    /// Publish the recipe's output: a `$3` write wins over stdout capture;
    /// stdout content wins over an empty result; no output at all means the
    /// target (and any stale leftovers) are simply removed.
    fn yeah(&self, st1: &Metadata, st2: Option<&Metadata>) {
        let target = self.state.as_local_path().to_abs();
        if st2.is_some() {
            if let Err(e) = std::fs::rename(&self.tmp_out3, &target) {
                error!(target = self.target, "could not publish $3: {e}");
            }
            let _ = std::fs::remove_file(&self.tmp_stdout);
        } else if st1.size() > 0 {
            match std::fs::rename(&self.tmp_stdout, &target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let _ = std::fs::remove_file(&target);
                }
                Err(e) => error!(target = self.target, "could not publish stdout: {e}"),
            }
        } else {
            let _ = std::fs::remove_file(&self.tmp_stdout);
            let _ = std::fs::remove_file(&target);
        }
    }
}

fn is_dir(m: &Metadata) -> bool {
    m.is_dir()
}

fn check_redundant_output(target: &str, st1: &Metadata, st2: Option<&Metadata>) -> Result<(), i32> {
    if st2.is_some() && st1.size() > 0 {
        error!(
            "{target}: wrote to stdout *and* created $3; write status messages to stderr instead"
        );
        return Err(207);
    }
    Ok(())
}

fn realpath_relative_to_startdir(dir: &std::path::Path, config: &Config) -> String {
    let real = dir.canonicalize().unwrap_or_else(|_| dir.to_owned());
    match pathdiff::diff_paths(&real, &config.startdir) {
        Some(p) => p.display().to_string(),
        None => real.display().to_string(),
    }
}
