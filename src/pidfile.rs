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

//! The pidfile store.
//!
//! A pidfile records which worker a guardian supervises:
//!
//! ```text
//! pid <WORKER_PID>
//! guard_pid <GUARDIAN_PID>
//! format 2
//! ```
//!
//! Publication goes through a temporary file in the same directory followed by
//! a rename, so a reader can never observe a partial record.  Readers also
//! accept the legacy shape (a bare decimal integer, which then stands in for
//! both PIDs) but nothing here ever writes it.
//!
//! Whether the recorded daemon is *alive* is not this module's business; the
//! pidfile may outlive its guardian and the liveness check in the crate root
//! consults the lock file for the truth.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::fs::File;
use std::io::prelude::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Format marker written into every new pidfile.
pub const FORMAT: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub pid: libc::pid_t,
    pub guard_pid: libc::pid_t,
    pub format: u32,
}

/// What a pidfile path currently holds.
#[derive(Debug, PartialEq, Eq)]
pub enum PidfileState {
    Absent,
    /// The file exists but is not a pidfile in any shape we know.  Start may
    /// treat this like `Absent`; stop must refuse to act on it.
    Unreadable,
    /// Bare-integer pidfile left behind by a user or an earlier version.
    Legacy { pid: libc::pid_t },
    Current(Record),
}

/// Atomically publishes `record` at `path`.
pub fn write(path: &Path, record: &Record) -> Result<()> {
    let mut tmp = OsString::from(path);
    tmp.push(format!(".tmp{}", rand::random::<u32>()));
    let tmp: PathBuf = tmp.into();

    let mut file = File::options()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .with_context(|| format!("{}: create failed", tmp.display()))?;
    let contents = format!(
        "pid {}\nguard_pid {}\nformat {}\n",
        record.pid, record.guard_pid, record.format
    );
    file.write_all(contents.as_bytes())
        .with_context(|| format!("{}: write failed", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("{}: fsync failed", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Reads the pidfile at `path`.  Only real I/O trouble is an error; every
/// recognizable content shape maps onto a [`PidfileState`].
pub fn read(path: &Path) -> Result<PidfileState> {
    let contents = match fs::read_to_string(path) {
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(PidfileState::Absent),
        Err(error) => {
            return Err(error).with_context(|| format!("{}: read failed", path.display()))
        }
        Ok(contents) => contents,
    };
    Ok(parse(&contents))
}

fn parse(contents: &str) -> PidfileState {
    if let Ok(pid) = contents.trim().parse::<libc::pid_t>() {
        return if pid > 0 {
            PidfileState::Legacy { pid }
        } else {
            PidfileState::Unreadable
        };
    }

    let mut pid = None;
    let mut guard_pid = None;
    let mut format = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(' ') else {
            return PidfileState::Unreadable;
        };
        let value = value.trim();
        match key {
            "pid" => match value.parse() {
                Ok(value) => pid = Some(value),
                Err(_) => return PidfileState::Unreadable,
            },
            "guard_pid" => match value.parse() {
                Ok(value) => guard_pid = Some(value),
                Err(_) => return PidfileState::Unreadable,
            },
            "format" => match value.parse() {
                Ok(value) => format = Some(value),
                Err(_) => return PidfileState::Unreadable,
            },
            // Unknown keys belong to future formats.
            _ => (),
        }
    }
    match (pid, guard_pid, format) {
        (Some(pid), Some(guard_pid), Some(format)) if pid > 0 && guard_pid > 0 => {
            PidfileState::Current(Record {
                pid,
                guard_pid,
                format,
            })
        }
        _ => PidfileState::Unreadable,
    }
}

/// Removes the pidfile; a pidfile that is already gone is fine.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        other => other.with_context(|| format!("{}: remove failed", path.display())),
    }
}
