//! Dispatching a set of targets to completion.
//!
//! Two passes, grounded on `main(targets, shouldbuildfunc)` in the Python
//! original this crate's build-core was distilled from. Phase 1 tries every
//! target once without blocking: a target whose lock is free gets built (or
//! at least handed to [`BuildJob::start`]); a target whose lock is already
//! held by another process is deferred. Phase 2 drains the deferred list one
//! target at a time, and is careful never to block on a lock while holding a
//! jobserver token — holding both at once is exactly the condition that lets
//! two processes deadlock on each other's lock/token pair.

use crate::freshness::ShouldBuild;
use crate::{BuildJob, Config, File as StateFile, Lock, RuleSet, Tokens};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// The exit code `run_targets` reports: 0 unless some target failed, in
/// which case the first nonzero code observed wins.
struct Outcome {
    code: i32,
}

impl Outcome {
    fn record(&mut self, rv: i32) {
        if rv != 0 && self.code == 0 {
            self.code = rv;
        }
    }
}

/// In-place Fisher-Yates, seeded from `RandomState`'s own ambient entropy
/// rather than pulling in a dedicated RNG crate for one shuffle used only to
/// flush out order-dependent bugs in do-files.
fn maybe_shuffle<T>(items: &mut [T], shuffle: bool) {
    if !shuffle || items.len() < 2 {
        return;
    }
    use std::hash::{BuildHasher, Hasher};
    let seed_source = std::collections::hash_map::RandomState::new();
    for i in (1..items.len()).rev() {
        let mut hasher = seed_source.build_hasher();
        hasher.write_usize(i);
        let j = (hasher.finish() as usize) % (i + 1);
        items.swap(i, j);
    }
}

/// Build every target in `targets`, returning the aggregate exit code.
///
/// `should_build` is consulted once per target, synchronously, before that
/// target's job is handed off — swappable so tests don't need a real
/// dependency graph on disk, the same way [`BuildJob::start`] takes it.
pub fn run_targets(
    mut targets: Vec<String>,
    tokens: &Tokens,
    rules: &RuleSet,
    should_build: &mut dyn ShouldBuild,
    config: &Config,
) -> anyhow::Result<i32> {
    let outcome = Arc::new(Mutex::new(Outcome { code: 0 }));
    maybe_shuffle(&mut targets, config.shuffle);

    // Ids of targets whose lock was already held by someone else in phase
    // 1. Carried by id, not name, because the drain pass reopens each one
    // through `File::by_id` (see `state.rs`).
    let mut deferred: Vec<u64> = Vec::new();
    // Targets already handed off in this loop. A caller passing the same
    // target twice (e.g. `redo a.o a.o`) must only be built once: `flock`
    // treats two fds opened by the same process as independent holders, so
    // without this check the second occurrence would just lose the trylock
    // race against our own first one and get deferred, risking the do-file
    // running (and publishing) twice.
    let mut seen: HashSet<String> = HashSet::new();

    for target in targets {
        if !config.keep_going && outcome.lock().unwrap().code != 0 {
            break;
        }
        if !seen.insert(target.clone()) {
            continue;
        }
        if !crate::state::check_sane() {
            return Ok(205);
        }
        if !tokens.has_token() {
            crate::state::commit();
        }
        tokens.get_token(&target);

        let state = match StateFile::by_name(&target) {
            Ok(s) => s,
            Err(e) => {
                error!(target, "could not open build state: {e}");
                tokens.release_mine();
                outcome.lock().unwrap().record(1);
                continue;
            }
        };
        let mut lock = Lock::new(state.id)?;
        if config.unlocked {
            lock.assume_owned();
        } else if !lock.trylock()? {
            warn!(target, "another process already has this locked, deferring");
            tokens.release_mine();
            deferred.push(state.id);
            continue;
        }

        let job = BuildJob::new(target, state, lock, config.clone());
        let outcome2 = outcome.clone();
        job.start(should_build, tokens, rules, move |_name, rv| {
            outcome2.lock().unwrap().record(rv);
        });
    }

    while !deferred.is_empty() || tokens.running() {
        crate::state::commit();
        tokens.wait_all();

        if !config.keep_going && outcome.lock().unwrap().code != 0 {
            break;
        }
        let Some(id) = deferred.pop() else {
            continue;
        };
        if !crate::state::check_sane() {
            return Ok(205);
        }

        let state = match StateFile::by_id(id) {
            Ok(s) => s,
            Err(e) => {
                error!("could not reopen deferred target {id:016x}: {e}");
                outcome.lock().unwrap().record(1);
                continue;
            }
        };
        if state.is_failed() {
            // Another job in this build already tried and failed to build
            // this target (or one it depends on); don't try again.
            outcome.lock().unwrap().record(2);
            continue;
        }
        let name = state.name.clone();

        tokens.get_token(&name);
        let mut lock = Lock::new(id)?;
        if config.unlocked {
            lock.assume_owned();
        } else {
            while !lock.trylock()? {
                // Give back the token before blocking on the lock: holding
                // both while we wait is how two processes deadlock on each
                // other's lock/token pair.
                tokens.release_mine();
                lock.waitlock()?;
                lock.unlock();
                tokens.get_token(&name);
            }
        }

        let job = BuildJob::new(name, state, lock, config.clone());
        let outcome2 = outcome.clone();
        job.start(should_build, tokens, rules, move |_name, rv| {
            outcome2.lock().unwrap().record(rv);
        });
    }

    tokens.wait_all();
    crate::state::commit();
    let code = outcome.lock().unwrap().code;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::Dirty;

    fn tokens(n: usize) -> Tokens {
        Tokens::new(jobserver::Client::new(n).unwrap())
    }

    fn config() -> Config {
        Config::resolve(false, false, false, false, false, false, false, false, false)
    }

    #[test]
    fn clean_targets_finish_with_zero() {
        let dir = crate::test_root();
        std::fs::write(dir.join("sched_clean_a.txt"), b"a").unwrap();
        std::fs::write(dir.join("sched_clean_b.txt"), b"b").unwrap();
        let t = tokens(2);
        let rules = RuleSet::scan_for_do_files().unwrap();
        let cfg = config();
        let rv = run_targets(
            vec!["sched_clean_a.txt".into(), "sched_clean_b.txt".into()],
            &t,
            &rules,
            &mut |_: &str| Ok(Dirty::Clean),
            &cfg,
        )
        .unwrap();
        assert_eq!(rv, 0);
    }

    #[test]
    fn missing_rule_reports_one() {
        let dir = crate::test_root();
        let _ = std::fs::remove_file(dir.join("sched_no_rule.txt"));
        let t = tokens(1);
        let rules = RuleSet::scan_for_do_files().unwrap();
        let cfg = config();
        let rv = run_targets(
            vec!["sched_no_rule.txt".into()],
            &t,
            &rules,
            &mut |_: &str| Ok(Dirty::Dirty),
            &cfg,
        )
        .unwrap();
        assert_eq!(rv, 1);
    }

    #[test]
    fn keep_going_still_builds_the_second_target_after_the_first_fails() {
        let dir = crate::test_root();
        let _ = std::fs::remove_file(dir.join("sched_kg_missing.txt"));
        std::fs::write(dir.join("sched_kg_clean.txt"), b"ok").unwrap();
        let t = tokens(2);
        let rules = RuleSet::scan_for_do_files().unwrap();
        let cfg = Config::resolve(true, false, false, false, false, false, false, false, false);
        let rv = run_targets(
            vec!["sched_kg_missing.txt".into(), "sched_kg_clean.txt".into()],
            &t,
            &rules,
            &mut |t: &str| {
                if t == "sched_kg_clean.txt" {
                    Ok(Dirty::Clean)
                } else {
                    Ok(Dirty::Dirty)
                }
            },
            &cfg,
        )
        .unwrap();
        assert_eq!(rv, 1);
    }

    #[test]
    fn contended_target_is_built_in_the_drain_pass_once_released() {
        let dir = crate::test_root();
        std::fs::write(dir.join("sched_contended.txt"), b"x").unwrap();
        let state = StateFile::by_name("sched_contended.txt").unwrap();
        let id = state.id;

        let mut holder = Lock::new(id).unwrap();
        assert!(holder.trylock().unwrap());
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let released2 = released.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(80));
            holder.unlock();
            released2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        let t = tokens(1);
        let rules = RuleSet::scan_for_do_files().unwrap();
        let cfg = config();
        let rv = run_targets(
            vec!["sched_contended.txt".into()],
            &t,
            &rules,
            &mut |_: &str| Ok(Dirty::Clean),
            &cfg,
        )
        .unwrap();
        handle.join().unwrap();
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(rv, 0);
    }

    #[test]
    fn deferred_target_already_marked_failed_reports_two_in_drain_pass() {
        let dir = crate::test_root();
        std::fs::write(dir.join("sched_prefailed.txt"), b"x").unwrap();
        let mut state = StateFile::by_name("sched_prefailed.txt").unwrap();
        state.set_failed();
        state.save().unwrap();
        let id = state.id;

        // Hold the lock for the whole call so phase 1 defers this target
        // without ever consulting `is_failed`; only the drain pass's
        // `by_id` re-open does.
        let mut holder = Lock::new(id).unwrap();
        assert!(holder.trylock().unwrap());

        let t = tokens(1);
        let rules = RuleSet::scan_for_do_files().unwrap();
        let cfg = config();
        let rv = run_targets(
            vec!["sched_prefailed.txt".into()],
            &t,
            &rules,
            &mut |_: &str| Ok(Dirty::Clean),
            &cfg,
        )
        .unwrap();
        holder.unlock();
        assert_eq!(rv, 2);
    }
}
