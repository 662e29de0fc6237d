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

//! SOS shared support: capability tokens, the seams to the kernel and
//! the other primitive collaborators (file server, serial, clock), the
//! client virtual-memory layout, and the system-wide error type.
//!
//! The microkernel, the remote file server, the serial driver, and the
//! clock are delegated primitives. Each is reached through a trait so
//! the rest of the system is independent of (and testable without) the
//! real bindings.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod caps;
pub mod error;
pub mod files;
pub mod kernel;
pub mod mem;
pub mod serial;
pub mod timer;
pub mod untyped;
pub mod vmem_layout;

/// Process identifier. Pids are dense, start at 1, and recycle; anything
/// holding a pid across a suspension must also hold the owning process's
/// start-time token (see `CallbackToken`).
pub type Pid = usize;

/// A machine word as carried in IPC message registers.
pub type Word = usize;

/// Token attached to every asynchronous request (file RPC, timer). A
/// completion is acted on only while `start_time` still matches the
/// process table entry for `pid`; otherwise the pid was recycled and the
/// completion is dropped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallbackToken {
    pub pid: Pid,
    pub start_time: u64,
}
