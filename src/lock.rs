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

//! The lock manager.
//!
//! A guardian's single-instance guarantee rests on an exclusive advisory
//! `flock` on a sidecar lock file.  The kernel releases the lock when the
//! holding process dies, by whatever means, which is what makes probing it a
//! sound liveness oracle: a PID can be recycled, a held lock cannot belong to
//! a dead process.
//!
//! `flock` rather than `fcntl` record locks on purpose: `fcntl` locks do not
//! conflict between descriptors of one process and evaporate when *any*
//! descriptor for the file is closed, so a probe from the holder's own
//! process would both lie and drop the lock.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::prelude::*;
use std::path::Path;

use crate::sys;

/// An acquired exclusive lock.  The lock lives exactly as long as the
/// descriptor inside, so the handle must be kept (or [leaked](Self::leak))
/// for as long as the lock should be held.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
}

impl LockHandle {
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Keeps the descriptor open for the remaining lifetime of the process,
    /// so that only process termination can release the lock.
    pub fn leak(self) {
        std::mem::forget(self.file);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    Free,
    Held,
    Absent,
}

/// Takes the exclusive lock on `path`, creating the file if needed.  Returns
/// `None` if another process holds it.  Never blocks.
pub fn acquire(path: &Path) -> Result<Option<LockHandle>> {
    let file = File::options()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("{}: open failed", path.display()))?;
    if sys::flock_exclusive(&file).with_context(|| format!("{}: flock failed", path.display()))? {
        Ok(Some(LockHandle { file }))
    } else {
        Ok(None)
    }
}

/// Asks whether anyone holds the lock on `path`, without ever blocking and
/// without creating the file.  A momentarily-won probe lock is released
/// immediately when the probe descriptor drops.
pub fn probe(path: &Path) -> Result<Probe> {
    let file = match File::open(path) {
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Probe::Absent),
        Err(error) => {
            return Err(error).with_context(|| format!("{}: open failed", path.display()))
        }
        Ok(file) => file,
    };
    if sys::flock_exclusive(&file).with_context(|| format!("{}: flock failed", path.display()))? {
        Ok(Probe::Free)
    } else {
        Ok(Probe::Held)
    }
}
