// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The SOS root server.
//!
//! A single-threaded cooperative dispatcher demultiplexes client IPC,
//! VM faults and interrupt notifications on one endpoint. Handlers that
//! must wait for an asynchronous completion record their progress in
//! the owning process's continuation and return `Step::Pending`; the
//! completion enqueues the pid and the dispatcher re-enters the same
//! handler, which skips past finished phases. Exactly one process runs
//! at any moment, so shared state needs no locking — mutation only
//! happens between yields.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod console;
mod continuation;
mod elf;
mod iovec;
mod process;
mod server;
mod spawn;
mod syscall;
mod vm;

pub use console::Console;
pub use continuation::{Continuation, PendingOp, SavedLabel, SwapStatus};
pub use iovec::{cbuf_to_iov, IoDirection, IoSpan};
pub use process::{DeviceKind, OpenFile, OpenFilePool, Process, ProcessTable, WaitTarget};
pub use server::{ServerStats, SosConfig, SosServer};

use sos_os_common::error::SosError;

/// Outcome of one handler step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step<T = ()> {
    /// The step finished (and, for syscalls, any reply was sent).
    Done(T),
    /// The handler yielded; a completion will re-enter it with the
    /// continuation advanced.
    Pending,
}

/// Result of a resumable operation.
pub type Flow<T = ()> = Result<Step<T>, SosError>;

/// Unwraps `Step::Done` or propagates the yield to the caller.
macro_rules! ready {
    ($e:expr) => {
        match $e {
            $crate::Step::Done(v) => v,
            $crate::Step::Pending => return Ok($crate::Step::Pending),
        }
    };
}
pub(crate) use ready;

#[cfg(test)]
mod testing;
