use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use warden::{DaemonSpec, StopOptions, StopResult, WorkerCommand};

/// Drive the warden library from the command line, for manual smoke runs.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start a guarded daemon running a shell command.
    Start {
        #[clap(long)]
        pidfile: PathBuf,
        #[clap(long)]
        stdout: Option<PathBuf>,
        #[clap(long)]
        stderr: Option<PathBuf>,
        #[clap(long)]
        guardian_log: Option<PathBuf>,
        /// Seconds of SIGTERM grace before the worker is SIGKILLed.
        #[clap(long)]
        term_timeout: Option<u64>,
        /// Shell command to supervise.
        command: String,
    },
    /// Stop the daemon owning a pidfile.
    Stop {
        #[clap(long)]
        pidfile: PathBuf,
        #[clap(long)]
        timeout: Option<u64>,
    },
    /// Report whether the daemon owning a pidfile is alive.
    Check {
        #[clap(long)]
        pidfile: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    match Args::parse().command {
        Cmd::Start {
            pidfile,
            stdout,
            stderr,
            guardian_log,
            term_timeout,
            command,
        } => {
            let mut spec = DaemonSpec::new(WorkerCommand::shell(command), pidfile);
            spec.stdout = stdout;
            spec.stderr = stderr;
            spec.guardian_log = guardian_log;
            spec.term_timeout = term_timeout.map(Into::into);
            unsafe { warden::start(spec) }?;
            println!("started");
        }
        Cmd::Stop { pidfile, timeout } => {
            let options = StopOptions {
                timeout: timeout.map(Into::into),
            };
            match warden::stop(&pidfile, &options)? {
                StopResult::Stopped => println!("stopped"),
                StopResult::NotRunning => println!("not running"),
            }
        }
        Cmd::Check { pidfile } => {
            println!(
                "{}",
                if warden::check(&pidfile)? {
                    "alive"
                } else {
                    "dead"
                }
            );
        }
    }
    Ok(())
}
