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

// Derived from lib/command-line.c in Open vSwitch, with the following license:
/*
 * Copyright (c) 2008, 2009, 2010, 2011, 2013, 2014 Nicira, Inc.
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

//! Renames the running process as shown by `ps`.
//!
//! A guardian is indistinguishable from its caller in the process table
//! unless it rewrites `argv[0]`, so this module lets it announce which daemon
//! it guards.  Linux/gnu only; a no-op everywhere else.

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod linux {
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_int};
    use std::sync::Mutex;

    // The contiguous argv region we are allowed to overwrite, captured before
    // main() runs.
    static ARGV_SPACE: Mutex<Option<&'static mut [u8]>> = Mutex::new(None);

    /// Overwrites the process name with `title`, ellipsizing it if the argv
    /// region is too small.
    pub fn set(title: &str) {
        if let Some(ref mut space) = *ARGV_SPACE.lock().unwrap() {
            let mut bytes = title.as_bytes().to_vec();
            if bytes.len() >= space.len() {
                bytes.truncate(space.len() - 4);
                bytes.extend_from_slice(b"...");
            }
            bytes.resize(space.len() - 1, 0);
            bytes.push(0);
            space.copy_from_slice(&bytes);
        }
    }

    /// `ps` shows whatever `argv[0]` points at.  Clone every argv string to
    /// fresh memory, repoint `argv[*]` at the clones, and keep the original
    /// region (contiguous on Linux, lowest address first) for overwriting.
    /// Returns `None` if there is no usable room.
    unsafe fn capture(argc: c_int, argv: *mut *mut u8) -> Option<&'static mut [u8]> {
        if argc == 0 || (*argv).is_null() {
            return None;
        }
        let start = *argv;
        let mut end = start;
        for i in 0..argc as isize {
            let arg = *argv.offset(i);
            let len = CStr::from_ptr(arg as *const c_char).to_bytes().len() + 1;
            // Stop extending the reusable region at the first gap.
            if arg == end {
                end = arg.add(len);
            }
            *argv.offset(i) = std::slice::from_raw_parts(arg, len)
                .to_vec()
                .leak()
                .as_mut_ptr();
        }
        let len = end.offset_from(start) as usize;
        if len >= 4 {
            Some(std::slice::from_raw_parts_mut(start, len))
        } else {
            None
        }
    }

    // Adapted from the Rust standard library's argv capture.
    #[used]
    #[link_section = ".init_array"]
    static CAPTURE_ARGV: extern "C" fn(c_int, *mut *mut u8, *const *const u8) = {
        extern "C" fn init(argc: c_int, argv: *mut *mut u8, _envp: *const *const u8) {
            *ARGV_SPACE.lock().unwrap() = unsafe { capture(argc, argv) };
        }
        init
    };
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use linux::set;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn set(_title: &str) {
    // Don't know how to set the process title on this operating system.
}
