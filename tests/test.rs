/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

use anyhow::{anyhow, Result};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use warden::{check, status, stop, DaemonSpec, StopOptions, StopResult, WorkerCommand};

/// `warden::start` forks, so tests that call it are serialized: while one of
/// them holds this lock every other test thread is parked, which keeps the
/// forked children's view of the process consistent.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    });
}

fn start_daemon(spec: DaemonSpec) -> Result<()> {
    unsafe { warden::start(spec) }
}

/// The guardian and stop engine both poll at 100 ms, so a state change under
/// test shows up within one tick of it happening; the limit leaves generous
/// headroom over the longest grace period any test configures.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_LIMIT: Duration = Duration::from_secs(8);

/// Polls `condition` at `RETRY_INTERVAL` until it produces a value, failing
/// the test once `RETRY_LIMIT` passes without one.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + RETRY_LIMIT;
    loop {
        if let Some(result) = condition() {
            return Ok(result);
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("condition not reached within {RETRY_LIMIT:?}"));
        }
        sleep(RETRY_INTERVAL);
    }
}

fn wait_until_dead(pidfile: &Path) -> Result<()> {
    wait_until(|| match check(pidfile) {
        Ok(false) => Some(()),
        _ => None,
    })
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(error) => error.raw_os_error() == Some(libc::EPERM),
    }
}

struct Scratch {
    dir: TempDir,
}

impl Scratch {
    fn new() -> Result<Scratch> {
        init_tracing();
        Ok(Scratch {
            dir: TempDir::new()?,
        })
    }

    fn pidfile(&self) -> PathBuf {
        self.dir.path().join("daemon.pid")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn shell_spec(scratch: &Scratch, command: &str) -> DaemonSpec {
    DaemonSpec::new(WorkerCommand::shell(command), scratch.pidfile())
}

#[test]
fn start_check_stop_roundtrip() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    for _ in 0..2 {
        start_daemon(shell_spec(&scratch, "sleep 10"))?;
        assert!(check(scratch.pidfile())?);

        let live = status(scratch.pidfile())?.expect("daemon should be alive");
        assert_ne!(live.pid, live.guard_pid);
        assert!(process_exists(live.pid));
        assert!(process_exists(live.guard_pid));

        // A second start against the same pidfile must lose and leave the
        // first daemon untouched.
        let error = start_daemon(shell_spec(&scratch, "sleep 10")).unwrap_err();
        assert!(
            error.to_string().contains("daemon already started"),
            "{error}"
        );
        assert!(check(scratch.pidfile())?);

        assert_eq!(
            stop(scratch.pidfile(), &StopOptions::default())?,
            StopResult::Stopped
        );
        assert!(!check(scratch.pidfile())?);
        assert!(!scratch.pidfile().exists());
    }
    Ok(())
}

#[test]
fn worker_natural_exit_cleans_up() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    start_daemon(shell_spec(&scratch, "sleep 1"))?;
    assert!(check(scratch.pidfile())?);

    // The worker exits on its own; the guardian must remove the pidfile and
    // go away without anyone calling stop.
    wait_until_dead(&scratch.pidfile())?;
    wait_until(|| (!scratch.pidfile().exists()).then_some(()))?;
    Ok(())
}

#[test]
fn callback_daemon() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let mut spec = DaemonSpec::new(
        WorkerCommand::callback(|| {
            sleep(Duration::from_secs(2));
            0
        }),
        scratch.pidfile(),
    );
    spec.name = Some("callback-daemon".into());
    start_daemon(spec)?;
    assert!(check(scratch.pidfile())?);

    wait_until_dead(&scratch.pidfile())?;
    assert!(!scratch.pidfile().exists());
    Ok(())
}

#[test]
fn unwritable_stream_target_fails_synchronously() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let bad_log = scratch.path("no-such-dir/out.log");
    let mut spec = shell_spec(&scratch, "sleep 10");
    spec.stdout = Some(bad_log.clone());
    let error = start_daemon(spec).unwrap_err();
    assert!(
        format!("{error:#}").contains(&format!("Error: Can't write to '{}'", bad_log.display())),
        "{error:#}"
    );
    assert!(!scratch.pidfile().exists());
    assert!(!check(scratch.pidfile())?);
    Ok(())
}

#[test]
fn sigkilled_guardian_is_recovered_by_the_next_start() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    start_daemon(shell_spec(&scratch, "sleep 30"))?;
    let old = status(scratch.pidfile())?.expect("daemon should be alive");

    // Kill the guardian outright.  The kernel releases its lock, so the
    // check turns false, but the worker lives on as an orphan and the
    // pidfile stays behind.
    send_signal(old.guard_pid, libc::SIGKILL)?;
    let _ = unsafe { libc::waitpid(old.guard_pid, std::ptr::null_mut(), 0) };
    wait_until_dead(&scratch.pidfile())?;
    assert!(scratch.pidfile().exists());
    assert!(process_exists(old.pid));

    // A fresh start must reap the orphan and take over.
    start_daemon(shell_spec(&scratch, "sleep 30"))?;
    assert!(check(scratch.pidfile())?);
    assert!(!process_exists(old.pid));
    let new = status(scratch.pidfile())?.expect("daemon should be alive");
    assert_ne!(new.pid, old.pid);

    assert_eq!(
        stop(scratch.pidfile(), &StopOptions::default())?,
        StopResult::Stopped
    );
    Ok(())
}

#[test]
fn stop_times_out_against_a_term_ignoring_worker() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let mut spec = shell_spec(&scratch, "trap '' TERM; exec sleep 30");
    spec.term_timeout = Some(3u64.into());
    start_daemon(spec)?;
    // Give the shell a moment to install the trap before stopping.
    sleep(Duration::from_millis(300));

    let error = stop(
        scratch.pidfile(),
        &StopOptions {
            timeout: Some(2u64.into()),
        },
    )
    .unwrap_err();
    assert!(error.to_string().contains("failed to stop daemon"), "{error}");
    assert!(check(scratch.pidfile())?);

    // The guardian SIGKILLs the worker once its own grace expires, so a
    // retry with a larger budget succeeds.
    assert_eq!(
        stop(
            scratch.pidfile(),
            &StopOptions {
                timeout: Some(10u64.into()),
            },
        )?,
        StopResult::Stopped
    );
    assert!(!check(scratch.pidfile())?);
    Ok(())
}

#[test]
fn default_term_timeout_skips_sigterm() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let out = scratch.path("out.log");
    let mut spec = shell_spec(&scratch, "trap 'echo got-term' TERM; while :; do sleep 1; done");
    spec.stdout = Some(out.clone());
    start_daemon(spec)?;
    sleep(Duration::from_millis(300));

    assert_eq!(
        stop(scratch.pidfile(), &StopOptions::default())?,
        StopResult::Stopped
    );
    // SIGKILL went out first, so the TERM handler can never have run.
    let output = std::fs::read_to_string(&out)?;
    assert!(!output.contains("got-term"), "{output:?}");
    Ok(())
}

#[test]
fn slow_term_handler_is_cut_off_by_the_grace_period() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let out = scratch.path("out.log");
    let mut spec = shell_spec(
        &scratch,
        "trap 'sleep 4; echo survived' TERM; while :; do sleep 1; done",
    );
    spec.stdout = Some(out.clone());
    spec.term_timeout = Some(1u64.into());
    start_daemon(spec)?;
    sleep(Duration::from_millis(300));

    assert_eq!(
        stop(scratch.pidfile(), &StopOptions::default())?,
        StopResult::Stopped
    );
    let output = std::fs::read_to_string(&out)?;
    assert!(!output.contains("survived"), "{output:?}");
    Ok(())
}

#[test]
fn invalid_timeouts_fail_validation_first() -> Result<()> {
    let scratch = Scratch::new()?;

    let mut spec = shell_spec(&scratch, "sleep 10");
    spec.term_timeout = Some("abc".into());
    let error = start_daemon(spec).unwrap_err();
    assert!(
        error.to_string().contains("did not pass regex check"),
        "{error}"
    );
    assert!(!scratch.pidfile().exists());

    // Validation runs before the stop engine looks at the filesystem, so a
    // bad timeout beats even a missing pidfile.
    let error = stop(
        scratch.pidfile(),
        &StopOptions {
            timeout: Some("xyz".into()),
        },
    )
    .unwrap_err();
    assert!(
        error.to_string().contains("did not pass regex check"),
        "{error}"
    );
    Ok(())
}

#[test]
fn legacy_pidfile_still_checks_and_stops() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    start_daemon(shell_spec(&scratch, "sleep 10"))?;
    let live = status(scratch.pidfile())?.expect("daemon should be alive");

    // Clobber the pidfile with the old single-integer shape.  Liveness comes
    // from the lock, so the daemon must still read as alive, and stop must
    // still work with the one PID standing in for both.
    std::fs::write(scratch.pidfile(), format!("{}\n", live.guard_pid))?;
    assert!(check(scratch.pidfile())?);
    let legacy = status(scratch.pidfile())?.expect("daemon should be alive");
    assert_eq!(legacy.pid, live.guard_pid);
    assert_eq!(legacy.guard_pid, live.guard_pid);

    assert_eq!(
        stop(scratch.pidfile(), &StopOptions::default())?,
        StopResult::Stopped
    );
    assert!(!check(scratch.pidfile())?);
    assert!(!scratch.pidfile().exists());
    Ok(())
}

#[test]
fn stop_without_a_pidfile_is_benign() -> Result<()> {
    let scratch = Scratch::new()?;
    assert_eq!(
        stop(scratch.pidfile(), &StopOptions::default())?,
        StopResult::NotRunning
    );
    Ok(())
}

#[test]
fn stop_refuses_an_unreadable_pidfile() -> Result<()> {
    let scratch = Scratch::new()?;
    std::fs::write(scratch.pidfile(), "certainly not a pidfile\n")?;
    let error = stop(scratch.pidfile(), &StopOptions::default()).unwrap_err();
    assert!(error.to_string().contains("refusing to stop"), "{error}");
    // The file must be left alone for a human (or start) to deal with.
    assert!(scratch.pidfile().exists());
    Ok(())
}

#[test]
fn worker_gets_environment_and_working_dir() -> Result<()> {
    let _guard = fork_lock();
    let scratch = Scratch::new()?;

    let out = scratch.path("out.log");
    let mut spec = shell_spec(&scratch, "echo \"$WARDEN_TEST_VALUE\"; pwd");
    spec.stdout = Some(out.clone());
    spec.env = vec![("WARDEN_TEST_VALUE".into(), "squeamish-ossifrage".into())];
    spec.working_dir = Some(scratch.dir.path().to_path_buf());
    start_daemon(spec)?;

    wait_until_dead(&scratch.pidfile())?;
    let output = std::fs::read_to_string(&out)?;
    assert!(output.contains("squeamish-ossifrage"), "{output:?}");
    let expected_dir = scratch.dir.path().canonicalize()?;
    assert!(
        output.contains(&expected_dir.display().to_string()),
        "{output:?}"
    );
    Ok(())
}
