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

//! Per-process continuation records.
//!
//! One flat record per process holds everything an in-flight syscall or
//! fault has accumulated across suspensions. It is zeroed before a new
//! request begins and cleared again when the reply goes out.

use crate::iovec::IoSpan;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use smallvec::SmallVec;
use sos_addrspace::PteId;
use sos_frame_table::FrameId;
use sos_interface::{FileMode, PathString, SyscallNumber};
use sos_os_common::caps::CPtr;
use sos_os_common::{Pid, Word};

/// Which kind of request the saved reply belongs to; ready-queue
/// resumption redispatches on this.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SavedLabel {
    #[default]
    None,
    Syscall,
    VmFault,
    /// Internal: the process is still being constructed.
    Spawn,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SwapStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
}

/// The asynchronous RPC this process is blocked on, used to route its
/// completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingOp {
    /// OPEN: lookup, possibly followed by create.
    OpenLookup,
    OpenCreate,
    FileRead,
    FileWrite,
    /// Demand load from the process's binary during a fault.
    BinaryRead,
    StatLookup,
    StatAttr,
    ReadDir,
    SwapFileCreate,
    SwapWrite,
    SwapRead,
    /// Spawn: binary lookup, then header page read.
    SpawnLookup,
    SpawnRead,
}

pub struct Continuation {
    pub reply_cap: Option<CPtr>,
    pub label: SavedLabel,
    pub syscall: Option<SyscallNumber>,
    // Times the dispatcher entered this request (first entry captures
    // arguments).
    pub loop_entries: u32,
    pub handler_initiated: bool,
    pub pending_op: Option<PendingOp>,

    // Fault arguments.
    pub fault_addr: usize,
    pub fault_write: bool,
    pub create_page_done: bool,
    pub binary_read_fired: bool,
    pub binary_eof: bool,

    // I/O arguments and progress.
    pub fd: usize,
    pub length_arg: usize,
    pub client_addr: usize,
    pub position_arg: usize,
    pub counter: usize,
    pub iov: VecDeque<IoSpan>,
    pub path: PathString,
    pub file_mode: FileMode,
    pub dirent_cookie: u64,
    // Extra reply words appended after MR0.
    pub reply_payload: SmallVec<[Word; 16]>,

    // Paging state.
    pub swap_status: SwapStatus,
    pub swap_write_fired: bool,
    pub swap_offset: usize,
    pub swap_count: usize,
    // Frame being written out (eviction) or filled (swap-in).
    pub swap_frame: Option<FrameId>,
    pub have_new_frame: bool,
    pub replacement_victim: Option<PteId>,
    // Client vaddr being swapped in; 0 when no read is in flight.
    pub replacement_request: usize,
    pub eviction_target: Option<Pid>,

    // Process-call arguments.
    pub pid_arg: isize,
    pub brk_arg: usize,
    pub delay_us: u64,
    pub stat_buf: Vec<u8>,
    pub stat_pos: usize,
    pub stat_records: usize,

    // Spawn bookkeeping (held by the process being constructed).
    pub spawn_parent: Option<Pid>,
    pub spawn_frame: Option<FrameId>,
}

impl Default for Continuation {
    fn default() -> Self {
        Continuation {
            reply_cap: Default::default(),
            label: Default::default(),
            syscall: Default::default(),
            loop_entries: Default::default(),
            handler_initiated: Default::default(),
            pending_op: Default::default(),
            fault_addr: Default::default(),
            fault_write: Default::default(),
            create_page_done: Default::default(),
            binary_read_fired: Default::default(),
            binary_eof: Default::default(),
            fd: Default::default(),
            length_arg: Default::default(),
            client_addr: Default::default(),
            position_arg: Default::default(),
            counter: Default::default(),
            iov: Default::default(),
            path: PathString::new(),
            file_mode: Default::default(),
            dirent_cookie: Default::default(),
            reply_payload: Default::default(),
            swap_status: Default::default(),
            swap_write_fired: Default::default(),
            swap_offset: Default::default(),
            swap_count: Default::default(),
            swap_frame: Default::default(),
            have_new_frame: Default::default(),
            replacement_victim: Default::default(),
            replacement_request: Default::default(),
            eviction_target: Default::default(),
            pid_arg: Default::default(),
            brk_arg: Default::default(),
            delay_us: Default::default(),
            stat_buf: Default::default(),
            stat_pos: Default::default(),
            stat_records: Default::default(),
            spawn_parent: Default::default(),
            spawn_frame: Default::default(),
        }
    }
}
