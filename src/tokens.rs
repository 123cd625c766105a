//! Cross-process cooperative parallelism, GNU make style: every process in
//! a build tree starts with one "implicit" token for free (the privilege of
//! running at all) and must acquire an extra token from a shared pipe for
//! every *additional* job it wants running concurrently.
//!
//! Grounded on this crate's own pre-existing `jobserver::Client` usage
//! (`get_jobserver`/per-target `jobserver.acquire()`), generalized
//! into the broker the scheduler's two-phase loop needs: a token can be
//! acquired ahead of deciding what to do with it, and given back
//! (`release_mine`) without ever starting a job, which is exactly the move
//! the drain pass makes to stay deadlock-free while it blocks on a lock.

use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::debug;

enum Slot {
    /// The one token every process starts with; never round-trips through
    /// the jobserver pipe.
    Implicit,
    Pool(jobserver::Acquired),
}

struct RunningJob {
    name: String,
    slot: Slot,
    handle: JoinHandle<i32>,
    after: Box<dyn FnOnce(&str, i32) + Send>,
}

/// Obtain a jobserver client: inherit one from the environment if this
/// process was launched under `make`/another `redux`, otherwise spin up a
/// private pool sized to `jobs` and re-exec ourselves under it so the
/// `MAKEFLAGS`-style environment variable reaches our own children too.
pub fn jobserver_client(jobs: usize) -> anyhow::Result<jobserver::Client> {
    if let Some(client) = unsafe { jobserver::Client::from_env() } {
        return Ok(client);
    }
    let client = jobserver::Client::new(jobs)?;
    let exe = std::env::current_exe()?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let mut cmd = std::process::Command::new(exe);
    cmd.args(args);
    client.configure(&mut cmd);
    let status = cmd.spawn()?.wait()?;
    std::process::exit(status.code().unwrap_or(1));
}

/// The job-slot broker for one `run_targets` invocation.
pub struct Tokens {
    client: jobserver::Client,
    implicit_available: Mutex<bool>,
    /// A token this process currently holds but hasn't committed to a
    /// running job yet — acquired by `get_token`, either handed to
    /// `start_job` or given back via `release_mine`.
    spare: Mutex<Option<Slot>>,
    running: Mutex<Vec<RunningJob>>,
}

impl Tokens {
    pub fn new(client: jobserver::Client) -> Tokens {
        Tokens {
            client,
            implicit_available: Mutex::new(true),
            spare: Mutex::new(None),
            running: Mutex::new(Vec::new()),
        }
    }

    /// True if we're currently holding a token that hasn't been committed
    /// to a job.
    pub fn has_token(&self) -> bool {
        self.spare.lock().unwrap().is_some()
    }

    /// Acquire a token for `name`, blocking if none is free yet. A no-op if
    /// we already hold one. Never called while a lock is held, or two
    /// processes could each wait on the other's lock while holding the
    /// last token — the deadlock this whole broker exists to avoid.
    pub fn get_token(&self, name: &str) {
        if self.has_token() {
            return;
        }
        {
            let mut implicit = self.implicit_available.lock().unwrap();
            if *implicit {
                *implicit = false;
                *self.spare.lock().unwrap() = Some(Slot::Implicit);
                return;
            }
        }
        debug!(target = name, "waiting for a jobserver token");
        let acquired = self.client.acquire().expect("jobserver pipe closed");
        *self.spare.lock().unwrap() = Some(Slot::Pool(acquired));
    }

    /// Give back the token we're currently holding without using it.
    pub fn release_mine(&self) {
        if let Some(slot) = self.spare.lock().unwrap().take() {
            self.release_slot(slot);
        }
    }

    fn release_slot(&self, slot: Slot) {
        match slot {
            Slot::Implicit => *self.implicit_available.lock().unwrap() = true,
            Slot::Pool(acquired) => drop(acquired),
        }
    }

    /// Start a job on the token we're currently holding, running `body` on
    /// a background thread. `after` is invoked later, from driver context
    /// (inside `wait_all`), exactly once, after `body` has returned — never
    /// from the background thread itself.
    pub fn start_job(
        &self,
        name: String,
        body: impl FnOnce() -> i32 + Send + 'static,
        after: impl FnOnce(&str, i32) + Send + 'static,
    ) {
        let slot = self
            .spare
            .lock()
            .unwrap()
            .take()
            .expect("start_job called without a held token");
        let handle = std::thread::spawn(body);
        self.running.lock().unwrap().push(RunningJob {
            name,
            slot,
            handle,
            after: Box::new(after),
        });
    }

    /// True if any job started by `start_job` hasn't been reaped yet.
    pub fn running(&self) -> bool {
        !self.running.lock().unwrap().is_empty()
    }

    /// Block until every currently-running job has finished, invoking each
    /// one's completion callback and releasing its token as it's reaped.
    pub fn wait_all(&self) {
        let jobs = std::mem::take(&mut *self.running.lock().unwrap());
        for job in jobs {
            let rv = job.handle.join().unwrap_or(1);
            (job.after)(&job.name, rv);
            self.release_slot(job.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Tokens {
        Tokens::new(jobserver::Client::new(n).unwrap())
    }

    #[test]
    fn implicit_token_is_free_and_only_once() {
        let t = tokens(1);
        assert!(!t.has_token());
        t.get_token("a");
        assert!(t.has_token());
        t.release_mine();
        assert!(!t.has_token());
    }

    #[test]
    fn start_job_consumes_the_held_token() {
        let t = tokens(1);
        t.get_token("a");
        t.start_job("a".into(), || 0, |_, _| {});
        assert!(!t.has_token());
        assert!(t.running());
        t.wait_all();
        assert!(!t.running());
    }

    #[test]
    fn after_callback_runs_in_wait_all_not_on_the_background_thread() {
        let t = tokens(1);
        t.get_token("a");
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        t.start_job(
            "a".into(),
            || 7,
            move |name, rv| {
                assert_eq!(name, "a");
                assert_eq!(rv, 7);
                seen2.store(true, std::sync::atomic::Ordering::SeqCst);
            },
        );
        assert!(!seen.load(std::sync::atomic::Ordering::SeqCst));
        t.wait_all();
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn second_concurrent_job_needs_a_pool_token() {
        let t = tokens(1);
        t.get_token("a");
        t.start_job("a".into(), || 0, |_, _| {});
        // The implicit token is spent; a second job has to pull from the
        // pool, which has zero extra slots here, so get_token would block.
        // We only assert the bookkeeping, not the blocking behaviour.
        assert!(!t.has_token());
        t.wait_all();
        t.get_token("b");
        assert!(t.has_token());
    }
}
