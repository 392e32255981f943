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

// Parts derived from lib/daemon-unix.c in Open vSwitch, with the following license:
/*
 * Copyright (c) 2008, 2009, 2010, 2011, 2012, 2013, 2015 Nicira, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at:
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Supervision of long-running background processes on a Unix host.
//!
//! Every daemon started through this crate is fronted by a **guardian**
//! process.  [`start`] forks twice: the first child becomes the guardian, the
//! grandchild becomes the **worker** that runs the caller's command (or
//! in-process callback).  The guardian owns two files derived from the
//! caller's pidfile path:
//!
//!   - the **pidfile** itself, a small atomically-published record naming the
//!     worker and guardian PIDs, and
//!
//!   - a sidecar **lock file** (`<pidfile>.lock`) on which the guardian holds
//!     an exclusive advisory lock for its whole lifetime.
//!
//! The lock is the liveness oracle.  [`check`] never consults the process
//! table: it reads the pidfile and probes the lock, because a PID can be
//! recycled but a lock cannot be held by a dead process.  When a guardian is
//! killed outright (`SIGKILL`), the kernel releases the lock, `check` turns
//! false, and the next [`start`] detects the leftover pidfile, SIGKILLs the
//! orphaned worker's process group, and takes over.
//!
//! [`stop`] sends SIGTERM to the guardian and polls the liveness check up to
//! a caller-supplied timeout.  The guardian, on receiving a stop request,
//! escalates against the worker: SIGTERM, a grace period of the spec's
//! `term_timeout` seconds, then SIGKILL (`term_timeout` of zero skips the
//! SIGTERM round entirely).  On any shutdown path the guardian removes the
//! pidfile before exiting.
//!
//! A successful `start` returns only after the guardian has published the
//! pidfile under the acquired lock, so `check` is guaranteed truthful
//! immediately:
//!
//! ```no_run
//! use warden::{DaemonSpec, StopOptions, WorkerCommand};
//!
//! let spec = DaemonSpec::new(WorkerCommand::shell("sleep 60"), "/run/app/app.pid");
//! unsafe { warden::start(spec) }?;
//! assert!(warden::check("/run/app/app.pid")?);
//! warden::stop("/run/app/app.pid", &StopOptions::default())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, bail, ensure, Context, Result};
use lazy_static::lazy_static;
use libc::{c_int, pid_t};
use regex::Regex;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use std::env::set_current_dir;
use std::ffi::OsString;
use std::fs::File;
use std::io::prelude::*;
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};
use std::process::{exit, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{event, Level};

mod lock;
mod pidfile;
mod proctitle;

use pidfile::PidfileState;

/// How often the guardian, the stop engine, and the orphan reaper re-examine
/// the world while waiting for a process to die.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stop grace applied when the caller does not supply one.
const DEFAULT_STOP_TIMEOUT: u64 = 30;

/// How long the orphan reaper waits for a SIGKILLed worker to vanish.
const ORPHAN_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker exit status when `exec` of the requested command fails.
const EXEC_FAILURE_STATUS: i32 = 127;

/// Byte the guardian writes on the status pipe once the pidfile is published.
/// Anything else on the pipe is an error message; EOF without bytes means the
/// guardian died without reporting.
const READY: u8 = 0;

/// Signals the guardian treats as a stop request.
const STOP_SIGNALS: [c_int; 4] = [SIGTERM, SIGINT, SIGHUP, SIGQUIT];

/// What the worker should run.
pub enum WorkerCommand {
    /// A command line executed via `/bin/sh -c`.
    Shell(String),
    /// An argv executed directly.
    Exec(Vec<String>),
    /// A callback invoked in the worker process after the forks; its return
    /// value becomes the worker's exit status.
    Callback(Box<dyn FnOnce() -> i32 + Send>),
}

impl WorkerCommand {
    pub fn shell<S: Into<String>>(command: S) -> WorkerCommand {
        WorkerCommand::Shell(command.into())
    }

    pub fn exec<I, S>(argv: I) -> WorkerCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WorkerCommand::Exec(argv.into_iter().map(Into::into).collect())
    }

    pub fn callback<F>(callback: F) -> WorkerCommand
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        WorkerCommand::Callback(Box::new(callback))
    }

    fn label(&self) -> String {
        match self {
            WorkerCommand::Shell(command) => command.clone(),
            WorkerCommand::Exec(argv) => argv.join(" "),
            WorkerCommand::Callback(_) => String::from("<callback>"),
        }
    }
}

/// A non-negative seconds value that may arrive as a number or as unparsed
/// text (from a config file or command line).  Text is validated against
/// `^\d+$` when the value is first used; text that fails produces a
/// validation error before the operation has any side effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seconds {
    Value(u64),
    Raw(String),
}

impl Seconds {
    fn resolve(&self, field: &str) -> Result<u64> {
        lazy_static! {
            static ref UNSIGNED_INT: Regex = Regex::new(r"^\d+$").unwrap();
        }
        match self {
            Seconds::Value(value) => Ok(*value),
            Seconds::Raw(text) => {
                if !UNSIGNED_INT.is_match(text) {
                    bail!("{field} value '{text}' did not pass regex check");
                }
                text.parse()
                    .with_context(|| format!("{field} value '{text}' is out of range"))
            }
        }
    }
}

impl From<u64> for Seconds {
    fn from(value: u64) -> Seconds {
        Seconds::Value(value)
    }
}

impl From<&str> for Seconds {
    fn from(text: &str) -> Seconds {
        Seconds::Raw(text.into())
    }
}

impl From<String> for Seconds {
    fn from(text: String) -> Seconds {
        Seconds::Raw(text)
    }
}

/// Everything [`start`] needs to know about one daemon.
///
/// `stdout` and `stderr` are the *worker's* stream targets, opened in append
/// mode before any fork; `guardian_log` receives the guardian's own
/// diagnostics.  All three default to `/dev/null`.  `term_timeout` is the
/// grace the guardian allows the worker between SIGTERM and SIGKILL; the
/// default of zero means the worker is SIGKILLed outright.
pub struct DaemonSpec {
    pub command: WorkerCommand,
    pub pidfile: PathBuf,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub guardian_log: Option<PathBuf>,
    /// Human label for the daemon, shown in the guardian's process title.
    /// Required when `command` is a callback, which has no text of its own.
    pub name: Option<String>,
    pub term_timeout: Option<Seconds>,
    /// Working directory for guardian and worker.  Default `/`.
    pub working_dir: Option<PathBuf>,
    /// If set, the worker (never the guardian) drops to this user after the
    /// forks, group first.
    pub user: Option<String>,
    pub group: Option<String>,
    /// Extra environment for the worker.
    pub env: Vec<(String, String)>,
}

impl DaemonSpec {
    pub fn new<P: Into<PathBuf>>(command: WorkerCommand, pidfile: P) -> DaemonSpec {
        DaemonSpec {
            command,
            pidfile: pidfile.into(),
            stdout: None,
            stderr: None,
            guardian_log: None,
            name: None,
            term_timeout: None,
            working_dir: None,
            user: None,
            group: None,
            env: Vec::new(),
        }
    }
}

/// Options for [`stop`].
#[derive(Clone, Debug, Default)]
pub struct StopOptions {
    /// How long to wait for the guardian to die.  Default 30 seconds.
    pub timeout: Option<Seconds>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopResult {
    Stopped,
    NotRunning,
}

/// PIDs of a live daemon, as recorded in its pidfile.  A legacy pidfile
/// yields the same integer for both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaemonStatus {
    pub pid: pid_t,
    pub guard_pid: pid_t,
}

/// Starts a daemon described by `spec` and returns once its guardian is
/// running with the pidfile published, so that [`check`] is immediately
/// truthful.  Fails without leaving a guardian behind if the spec is
/// invalid, a stream target is unwritable, or the daemon is already running.
///
/// # Safety
///
/// This function forks (twice).  Any other threads of the calling process do
/// not exist in the children, so locks they hold (including allocator locks)
/// are never released there.  Call it only from a process where forking is
/// safe — ideally single-threaded, or with all other threads known to be
/// quiescent.  A `Callback` command additionally runs caller code in the
/// forked worker under the same constraints.
pub unsafe fn start(spec: DaemonSpec) -> Result<()> {
    let term_timeout = match &spec.term_timeout {
        Some(value) => value.resolve("term_timeout")?,
        None => 0,
    };
    validate(&spec)?;

    // Opening the stream targets up front means a bad path is a synchronous
    // error for the caller instead of a dead-on-arrival worker.
    let stdout_file = open_sink(spec.stdout.as_deref())?;
    let stderr_file = open_sink(spec.stderr.as_deref())?;
    let guardian_log = match spec.guardian_log.as_deref() {
        Some(path) => Some(open_sink(Some(path))?),
        None => None,
    };

    match pidfile::read(&spec.pidfile)? {
        PidfileState::Absent | PidfileState::Unreadable => (),
        PidfileState::Legacy { pid } | PidfileState::Current(pidfile::Record { pid, .. }) => {
            if check(&spec.pidfile)? {
                bail!("daemon already started (pidfile {})", spec.pidfile.display());
            }
            // The previous guardian died without cleaning up.  If its worker
            // survived, it still owns the daemon's resources and must go
            // before we can hand them to a new worker.
            reap_orphan(pid)?;
        }
    }

    let (read_end, write_end) = sys::pipe().context("could not create status pipe")?;
    match sys::fork().context("fork failed")? {
        Some(guard_pid) => {
            drop(write_end);
            await_guardian(File::from(read_end), guard_pid)
        }
        None => {
            drop(read_end);
            guardian_bootstrap(
                spec,
                term_timeout,
                File::from(write_end),
                stdout_file,
                stderr_file,
                guardian_log,
            )
        }
    }
}

/// Stops the daemon whose pidfile is at `pidfile` by signalling its guardian
/// and waiting, up to `options.timeout` seconds, for the liveness check to
/// turn false.  Stopping a daemon that is not running is not an error.
pub fn stop<P: AsRef<Path>>(pidfile: P, options: &StopOptions) -> Result<StopResult> {
    let timeout = match &options.timeout {
        Some(value) => value.resolve("timeout")?,
        None => DEFAULT_STOP_TIMEOUT,
    };

    let pidfile = pidfile.as_ref();
    let guard_pid = match pidfile::read(pidfile)? {
        PidfileState::Absent => return Ok(StopResult::NotRunning),
        PidfileState::Unreadable => {
            bail!("{}: pidfile is unreadable, refusing to stop", pidfile.display())
        }
        PidfileState::Legacy { pid } => pid,
        PidfileState::Current(record) => record.guard_pid,
    };
    if status(pidfile)?.is_none() {
        // Stale pidfile: the lock is free, so the recorded PIDs may already
        // belong to someone else.  Never signal them; leave reclamation of
        // the file to the next start, where it cannot race a publication.
        return Ok(StopResult::NotRunning);
    }

    event!(Level::DEBUG, "sending SIGTERM to guardian {guard_pid}");
    if let Err(error) = sys::kill(guard_pid, SIGTERM) {
        if error.raw_os_error() != Some(libc::ESRCH) {
            return Err(error).with_context(|| format!("could not signal guardian {guard_pid}"));
        }
    }

    let lock_file = lock_path(pidfile);
    let deadline = Instant::now() + Duration::from_secs(timeout);
    loop {
        // The guardian removes the pidfile and then exits; wait for the lock
        // release too so a back-to-back start cannot lose the lock race to a
        // guardian that is one instruction from death.
        if status(pidfile)?.is_none() && lock::probe(&lock_file)? != lock::Probe::Held {
            let _ = sys::waitpid(guard_pid, libc::WNOHANG);
            return Ok(StopResult::Stopped);
        }
        if Instant::now() >= deadline {
            bail!("failed to stop daemon (guardian {guard_pid} survived {timeout}s)");
        }
        sleep(POLL_INTERVAL);
    }
}

/// Returns whether the daemon whose pidfile is at `pidfile` is alive right
/// now.  Never blocks.
pub fn check<P: AsRef<Path>>(pidfile: P) -> Result<bool> {
    Ok(status(pidfile)?.is_some())
}

/// Like [`check`], but reports the live daemon's PIDs.  The lock probe, not
/// the process table, decides: a pidfile whose lock nobody holds is a relic,
/// whatever its PIDs currently name.
pub fn status<P: AsRef<Path>>(pidfile: P) -> Result<Option<DaemonStatus>> {
    let pidfile = pidfile.as_ref();
    let (pid, guard_pid) = match pidfile::read(pidfile)? {
        PidfileState::Absent | PidfileState::Unreadable => return Ok(None),
        PidfileState::Legacy { pid } => (pid, pid),
        PidfileState::Current(record) => (record.pid, record.guard_pid),
    };
    match lock::probe(&lock_path(pidfile))? {
        lock::Probe::Absent | lock::Probe::Free => Ok(None),
        lock::Probe::Held => Ok(Some(DaemonStatus { pid, guard_pid })),
    }
}

fn lock_path(pidfile: &Path) -> PathBuf {
    let mut path = OsString::from(pidfile);
    path.push(".lock");
    path.into()
}

fn validate(spec: &DaemonSpec) -> Result<()> {
    ensure!(
        !spec.pidfile.as_os_str().is_empty(),
        "pidfile path must not be empty"
    );
    ensure!(
        spec.pidfile.is_absolute(),
        "pidfile path '{}' is not absolute",
        spec.pidfile.display()
    );
    match &spec.command {
        WorkerCommand::Callback(_) => {
            ensure!(spec.name.is_some(), "name is required for a callback daemon");
        }
        WorkerCommand::Exec(argv) => {
            ensure!(!argv.is_empty(), "command argv must not be empty");
        }
        WorkerCommand::Shell(_) => (),
    }
    Ok(())
}

fn open_sink(path: Option<&Path>) -> Result<File> {
    let path = path.unwrap_or_else(|| Path::new("/dev/null"));
    File::options()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Error: Can't write to '{}'", path.display()))
}

fn process_exists(pid: pid_t) -> bool {
    match sys::kill(pid, 0) {
        Ok(()) => true,
        // EPERM means the PID is taken, just not by anything we may signal.
        Err(error) => error.raw_os_error() == Some(libc::EPERM),
    }
}

/// Kills a worker left behind by a dead guardian and waits for it to vanish,
/// so that whatever it held (ports, its own locks) becomes acquirable again.
fn reap_orphan(pid: pid_t) -> Result<()> {
    if !process_exists(pid) {
        return Ok(());
    }
    event!(
        Level::WARN,
        "killing orphaned worker {pid} left behind by a dead guardian"
    );
    // The worker is normally its own process-group leader; fall back to the
    // bare PID for workers recorded by legacy pidfiles.
    if sys::kill(-pid, libc::SIGKILL).is_err() {
        let _ = sys::kill(pid, libc::SIGKILL);
    }
    let deadline = Instant::now() + ORPHAN_KILL_TIMEOUT;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(POLL_INTERVAL);
    }
    bail!("orphaned worker {pid} did not die after SIGKILL");
}

fn await_guardian(mut pipe: File, guard_pid: pid_t) -> Result<()> {
    let mut response = Vec::new();
    pipe.read_to_end(&mut response)
        .context("status pipe read failed")?;
    match response.first() {
        Some(&READY) => Ok(()),
        Some(_) => {
            // The guardian reported an error and exited; reap it and relay.
            let _ = sys::waitpid(guard_pid, 0);
            bail!("{}", String::from_utf8_lossy(&response).trim())
        }
        None => {
            let (_, status) = sys::waitpid(guard_pid, 0).context("waitpid on guardian failed")?;
            bail!("guardian died before signaling readiness ({status})")
        }
    }
}

/// Everything that runs in the first fork child.  Never returns: on success
/// it becomes the guardian loop, on failure it reports through the status
/// pipe and exits.
fn guardian_bootstrap(
    spec: DaemonSpec,
    term_timeout: u64,
    pipe: File,
    stdout_file: File,
    stderr_file: File,
    guardian_log: Option<File>,
) -> ! {
    match guardian_setup(spec, &pipe, stdout_file, stderr_file, guardian_log) {
        Ok((pidfile_path, worker_pid, stop_requested)) => {
            // Readiness must come after pidfile publication: a caller that
            // sees start() succeed may rely on check() immediately.
            let _ = (&pipe).write_all(&[READY]);
            drop(pipe);
            guardian_loop(&pidfile_path, worker_pid, term_timeout, &stop_requested)
        }
        Err(error) => {
            event!(Level::ERROR, "guardian startup failed ({error:#})");
            let _ = (&pipe).write_all(format!("{error:#}").as_bytes());
            exit(1);
        }
    }
}

fn guardian_setup(
    mut spec: DaemonSpec,
    pipe: &File,
    stdout_file: File,
    stderr_file: File,
    guardian_log: Option<File>,
) -> Result<(PathBuf, pid_t, Arc<AtomicBool>)> {
    sys::setsid().context("setsid failed")?;

    let stdin_null = File::open("/dev/null").context("could not open /dev/null")?;
    sys::dup2(stdin_null.as_raw_fd(), 0).context("could not redirect stdin")?;
    sys::dup2(stdout_file.as_raw_fd(), 1).context("could not redirect stdout")?;
    sys::dup2(stderr_file.as_raw_fd(), 2).context("could not redirect stderr")?;
    drop(stdin_null);
    drop(stdout_file);
    drop(stderr_file);

    let log_fd = guardian_log.as_ref().map(|file| file.as_raw_fd());
    let mut keep = vec![0, 1, 2, pipe.as_raw_fd()];
    keep.extend(log_fd);
    sys::close_inherited_fds(&keep);

    let working_dir = spec.working_dir.take().unwrap_or_else(|| PathBuf::from("/"));
    set_current_dir(&working_dir)
        .with_context(|| format!("could not chdir to {}", working_dir.display()))?;

    if let Some(log) = guardian_log {
        init_guardian_tracing(log);
    }

    let lock_file = lock_path(&spec.pidfile);
    let lock = lock::acquire(&lock_file)?.ok_or_else(|| {
        anyhow!("daemon already started (lock {} is busy)", lock_file.display())
    })?;

    let title = match &spec.name {
        Some(name) => name.clone(),
        None => spec.command.label(),
    };
    proctitle::set(&format!("guarding {title}"));

    // The handler must be in place before the wait loop starts, or a stop
    // request arriving in between is lost.  The worker resets these.
    let stop_requested = Arc::new(AtomicBool::new(false));
    for signal in STOP_SIGNALS {
        signal_hook::flag::register(signal, Arc::clone(&stop_requested))
            .context("could not install stop-request handler")?;
    }

    let pidfile_path = spec.pidfile.clone();
    let close_in_worker: Vec<RawFd> = [Some(pipe.as_raw_fd()), Some(lock.raw_fd()), log_fd]
        .into_iter()
        .flatten()
        .collect();
    let worker_pid = match unsafe { sys::fork() }.context("fork failed")? {
        Some(pid) => pid,
        None => worker_main(spec, &close_in_worker),
    };
    // The worker does this itself too; whichever runs first wins.
    let _ = sys::setpgid(worker_pid, worker_pid);

    // Only process termination may release the lock from here on.
    lock.leak();

    let record = pidfile::Record {
        pid: worker_pid,
        guard_pid: std::process::id() as pid_t,
        format: pidfile::FORMAT,
    };
    if let Err(error) = pidfile::write(&pidfile_path, &record) {
        // Failing to publish means failing to start; don't leave an
        // unfindable worker running behind the report.
        kill_worker(worker_pid, libc::SIGKILL);
        let _ = sys::waitpid(worker_pid, 0);
        return Err(error);
    }
    event!(
        Level::INFO,
        "guardian {} supervising worker {worker_pid} ({title})",
        std::process::id()
    );

    Ok((pidfile_path, worker_pid, stop_requested))
}

/// Everything that runs in the second fork child, between fork and
/// exec/callback.  Never returns.
fn worker_main(spec: DaemonSpec, close_fds: &[RawFd]) -> ! {
    // Own process group, so the guardian's escalation catches descendants.
    let _ = sys::setpgid(0, 0);
    // The guardian's lock and status pipe must die with the guardian, not
    // live on in the worker.
    for &fd in close_fds {
        sys::close_fd(fd);
    }
    sys::reset_signal_dispositions();

    for (key, value) in &spec.env {
        std::env::set_var(key, value);
    }
    if let Err(error) = drop_privileges(spec.user.as_deref(), spec.group.as_deref()) {
        eprintln!("worker setup failed: {error:#}");
        exit(1);
    }

    match spec.command {
        WorkerCommand::Callback(callback) => exit(callback()),
        WorkerCommand::Shell(command) => {
            let error = Command::new("/bin/sh").arg("-c").arg(&command).exec();
            eprintln!("exec of '/bin/sh -c {command}' failed ({error})");
            exit(EXEC_FAILURE_STATUS);
        }
        WorkerCommand::Exec(argv) => {
            let error = Command::new(&argv[0]).args(&argv[1..]).exec();
            eprintln!("exec of '{}' failed ({error})", argv[0]);
            exit(EXEC_FAILURE_STATUS);
        }
    }
}

/// Drops group, then user.  Runs in the worker only; the guardian keeps its
/// identity so it can still signal the worker and remove the pidfile.
fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(name) = group {
        let gid = sys::lookup_group(name)
            .with_context(|| format!("could not look up group '{name}'"))?
            .ok_or_else(|| anyhow!("unknown group '{name}'"))?;
        sys::setgid(gid).with_context(|| format!("setgid({gid}) failed"))?;
    }
    if let Some(name) = user {
        let (uid, primary_gid) = sys::lookup_user(name)
            .with_context(|| format!("could not look up user '{name}'"))?
            .ok_or_else(|| anyhow!("unknown user '{name}'"))?;
        if group.is_none() {
            sys::setgid(primary_gid).with_context(|| format!("setgid({primary_gid}) failed"))?;
        }
        sys::setuid(uid).with_context(|| format!("setuid({uid}) failed"))?;
    }
    Ok(())
}

fn init_guardian_tracing(log: File) {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::sync::Mutex::new(log))
        .with_ansi(false)
        .finish();
    // A subscriber inherited across the fork wins; keep it if one is set.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn guardian_loop(
    pidfile_path: &Path,
    worker_pid: pid_t,
    term_timeout: u64,
    stop_requested: &AtomicBool,
) -> ! {
    loop {
        if stop_requested.swap(false, Ordering::SeqCst) {
            shutdown_worker(pidfile_path, worker_pid, term_timeout);
        }
        match sys::waitpid(worker_pid, libc::WNOHANG) {
            Ok((0, _)) => sleep(POLL_INTERVAL),
            Ok((_, status)) => {
                event!(Level::INFO, "worker {worker_pid} exited on its own ({status})");
                remove_pidfile(pidfile_path);
                exit(exit_code(status));
            }
            Err(error) => {
                event!(Level::ERROR, "waitpid on worker {worker_pid} failed ({error})");
                remove_pidfile(pidfile_path);
                exit(1);
            }
        }
    }
}

/// The guardian's half of the stop protocol: SIGTERM with the spec's grace
/// if any, then SIGKILL.  Never returns.
fn shutdown_worker(pidfile_path: &Path, worker_pid: pid_t, term_timeout: u64) -> ! {
    if term_timeout > 0 {
        event!(
            Level::INFO,
            "stop requested, sending SIGTERM to worker group {worker_pid}"
        );
        kill_worker(worker_pid, SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(term_timeout);
        while Instant::now() < deadline {
            match sys::waitpid(worker_pid, libc::WNOHANG) {
                Ok((0, _)) => sleep(POLL_INTERVAL),
                _ => {
                    event!(Level::INFO, "worker {worker_pid} exited within the grace period");
                    remove_pidfile(pidfile_path);
                    exit(0);
                }
            }
        }
        event!(
            Level::WARN,
            "worker {worker_pid} survived {term_timeout}s of grace, sending SIGKILL"
        );
    } else {
        event!(
            Level::INFO,
            "stop requested, sending SIGKILL to worker group {worker_pid}"
        );
    }
    kill_worker(worker_pid, libc::SIGKILL);
    let _ = sys::waitpid(worker_pid, 0);
    remove_pidfile(pidfile_path);
    exit(0);
}

fn kill_worker(worker_pid: pid_t, signal: c_int) {
    // Group first; bare PID if the worker never became a group leader.
    if sys::kill(-worker_pid, signal).is_err() {
        let _ = sys::kill(worker_pid, signal);
    }
}

fn remove_pidfile(pidfile_path: &Path) {
    if let Err(error) = pidfile::remove(pidfile_path) {
        event!(Level::WARN, "{error:#}");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

mod sys {
    //! System call wrappers.  The fallible ones return `io::Error` and retry
    //! on `EINTR` where the call is restartable.

    use std::ffi::CString;
    use std::fs::{read_dir, File};
    use std::io::{Error, ErrorKind};
    use std::os::unix::prelude::*;
    use std::process::ExitStatus;

    use libc::{c_int, pid_t};

    pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
        let mut fds: [c_int; 2] = [0; 2];
        // O_CLOEXEC keeps the status pipe out of exec'd workers; the
        // guardian never execs, so its end survives.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
            OwnedFd::from_raw_fd(fds[1])
        }))
    }

    pub unsafe fn fork() -> Result<Option<pid_t>, Error> {
        let pid = libc::fork();
        if pid < 0 {
            Err(Error::last_os_error())
        } else if pid == 0 {
            Ok(None)
        } else {
            Ok(Some(pid))
        }
    }

    pub fn setsid() -> Result<(), Error> {
        if unsafe { libc::setsid() } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn setpgid(pid: pid_t, pgid: pid_t) -> Result<(), Error> {
        if unsafe { libc::setpgid(pid, pgid) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn dup2(from: RawFd, to: RawFd) -> Result<(), Error> {
        loop {
            if unsafe { libc::dup2(from, to) } >= 0 {
                return Ok(());
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn kill(pid: pid_t, signal: c_int) -> Result<(), Error> {
        if unsafe { libc::kill(pid, signal) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    pub fn waitpid(pid: pid_t, flags: c_int) -> Result<(pid_t, ExitStatus), Error> {
        loop {
            let mut status = 0;
            let retval = unsafe { libc::waitpid(pid, &mut status as *mut c_int, flags) };
            if retval != -1 {
                return Ok((retval, ExitStatus::from_raw(status)));
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Requests a non-blocking exclusive `flock`.  Returns `Ok(false)` on
    /// contention.
    pub fn flock_exclusive(file: &File) -> Result<bool, Error> {
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
                return Ok(true);
            }
            let err = Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Closes every open descriptor except those in `keep`.  Reads
    /// `/proc/self/fd` where available and falls back to sweeping the usual
    /// descriptor range.
    pub fn close_inherited_fds(keep: &[RawFd]) {
        let fds: Vec<RawFd> = match read_dir("/proc/self/fd") {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok()?.file_name().into_string().ok()?.parse().ok())
                .collect(),
            Err(_) => (3..1024).collect(),
        };
        for fd in fds {
            if !keep.contains(&fd) {
                close_fd(fd);
            }
        }
    }

    pub fn setgid(gid: libc::gid_t) -> Result<(), Error> {
        if unsafe { libc::setgid(gid) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn setuid(uid: libc::uid_t) -> Result<(), Error> {
        if unsafe { libc::setuid(uid) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Looks up a user by name with `getpwnam_r`.  Returns the uid and the
    /// user's primary gid, or `None` if there is no such user.
    pub fn lookup_user(name: &str) -> Result<Option<(libc::uid_t, libc::gid_t)>, Error> {
        let Ok(c_name) = CString::new(name) else {
            return Ok(None);
        };
        let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; 4096];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let ret = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut passwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if ret != 0 {
            Err(Error::from_raw_os_error(ret))
        } else if result.is_null() {
            Ok(None)
        } else {
            Ok(Some((passwd.pw_uid, passwd.pw_gid)))
        }
    }

    /// Looks up a group by name with `getgrnam_r`.
    pub fn lookup_group(name: &str) -> Result<Option<libc::gid_t>, Error> {
        let Ok(c_name) = CString::new(name) else {
            return Ok(None);
        };
        let mut group: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; 4096];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let ret = unsafe {
            libc::getgrnam_r(
                c_name.as_ptr(),
                &mut group,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if ret != 0 {
            Err(Error::from_raw_os_error(ret))
        } else if result.is_null() {
            Ok(None)
        } else {
            Ok(Some(group.gr_gid))
        }
    }

    /// Restores default dispositions and an empty mask, so the worker starts
    /// with a clean signal slate whatever the guardian installed.
    pub fn reset_signal_dispositions() {
        unsafe {
            for signal in [
                libc::SIGHUP,
                libc::SIGINT,
                libc::SIGQUIT,
                libc::SIGPIPE,
                libc::SIGTERM,
                libc::SIGCHLD,
            ] {
                libc::signal(signal, libc::SIG_DFL);
            }
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
        }
    }
}
