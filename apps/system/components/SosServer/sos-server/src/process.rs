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

//! Processes, the process table, and the open-file pool.

use crate::continuation::Continuation;
use alloc::boxed::Box;
use alloc::vec::Vec;
use hashbrown::HashMap;
use log::error;
use sos_addrspace::AddressSpace;
use sos_interface::{FileMode, PathString, FD_TABLE_SIZE, OPEN_FILE_POOL_SIZE};
use sos_os_common::caps::{CPtr, Paddr};
use sos_os_common::files::FileHandle;
use sos_os_common::{CallbackToken, Pid};

/// Pids are minted as endpoint badges; keep them under the badge space.
pub const MAX_PROCESSES: usize = 1024;

/// Which device an open file talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    Console,
    Remote,
}

/// One entry in the system-wide open-file pool.
#[derive(Debug)]
pub struct OpenFile {
    pub offset: u64,
    pub mode: FileMode,
    /// Remote handle; the console has none.
    pub handle: Option<FileHandle>,
    pub dev: DeviceKind,
}

pub type OfId = usize;

/// Bounded pool of open-file entries shared by all fd tables.
pub struct OpenFilePool {
    entries: Vec<Option<OpenFile>>,
}

impl OpenFilePool {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(OPEN_FILE_POOL_SIZE);
        entries.resize_with(OPEN_FILE_POOL_SIZE, || None);
        OpenFilePool { entries }
    }

    pub fn alloc(&mut self, of: OpenFile) -> Option<OfId> {
        let id = self.entries.iter().position(|e| e.is_none())?;
        self.entries[id] = Some(of);
        Some(id)
    }

    pub fn free(&mut self, id: OfId) -> Option<OpenFile> { self.entries[id].take() }

    pub fn get(&self, id: OfId) -> Option<&OpenFile> { self.entries[id].as_ref() }

    pub fn get_mut(&mut self, id: OfId) -> Option<&mut OpenFile> { self.entries[id].as_mut() }

    pub fn in_use(&self) -> usize { self.entries.iter().filter(|e| e.is_some()).count() }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WaitTarget {
    #[default]
    None,
    /// waitpid(-1): any process.
    Any,
    Pid(Pid),
}

pub struct Process {
    pub pid: Pid,
    /// Creation token; completions carrying an older value are stale.
    pub start_time: u64,
    pub addrspace: AddressSpace,
    pub tcb_cap: CPtr,
    pub tcb_paddr: Paddr,
    /// Badged endpoint minted into the client for syscalls and faults.
    pub ep_cap: CPtr,
    pub fd_table: Box<[Option<OfId>]>,
    pub cont: Continuation,
    pub waiting: WaitTarget,
    /// Pids blocked in waitpid on this process.
    pub waiters: Vec<Pid>,
    pub command: PathString,
    pub stime_ms: u32,
}

impl Process {
    pub fn token(&self) -> CallbackToken {
        CallbackToken {
            pid: self.pid,
            start_time: self.start_time,
        }
    }

    pub fn fd_lookup(&self, fd: usize) -> Option<OfId> {
        if fd >= FD_TABLE_SIZE {
            return None;
        }
        self.fd_table[fd]
    }

    /// Binds `of` to the lowest free fd.
    pub fn fd_alloc(&mut self, pool: &mut OpenFilePool, of: OpenFile) -> Option<usize> {
        let fd = self.fd_table.iter().position(|e| e.is_none())?;
        self.fd_table[fd] = Some(pool.alloc(of)?);
        Some(fd)
    }

    /// Binds `of` at a fixed fd (boot fds, the binary fd).
    pub fn fd_alloc_at(
        &mut self,
        pool: &mut OpenFilePool,
        fd: usize,
        of: OpenFile,
    ) -> Option<usize> {
        if fd >= FD_TABLE_SIZE || self.fd_table[fd].is_some() {
            error!("fd {} already bound", fd);
            return None;
        }
        self.fd_table[fd] = Some(pool.alloc(of)?);
        Some(fd)
    }

    pub fn fd_free(&mut self, pool: &mut OpenFilePool, fd: usize) -> Option<OpenFile> {
        let of_id = self.fd_table.get_mut(fd)?.take()?;
        pool.free(of_id)
    }
}

pub struct ProcessTable {
    procs: HashMap<Pid, Process>,
    next_pid: Pid,
    // Monotonic creation stamp; never repeats even when the clock is a
    // stub, so stale-callback detection stays sound.
    epoch: u64,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            procs: HashMap::new(),
            next_pid: 1,
            epoch: 0,
        }
    }

    /// Next free pid, recycling with a liveness scan.
    pub fn alloc_pid(&mut self) -> Option<Pid> {
        for _ in 0..MAX_PROCESSES {
            let pid = self.next_pid;
            self.next_pid = if self.next_pid + 1 >= MAX_PROCESSES {
                1
            } else {
                self.next_pid + 1
            };
            if !self.procs.contains_key(&pid) {
                return Some(pid);
            }
        }
        None
    }

    pub fn next_start_time(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn insert(&mut self, proc: Process) {
        let old = self.procs.insert(proc.pid, proc);
        debug_assert!(old.is_none());
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> { self.procs.remove(&pid) }

    pub fn get(&self, pid: Pid) -> Option<&Process> { self.procs.get(&pid) }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> { self.procs.get_mut(&pid) }

    pub fn contains(&self, pid: Pid) -> bool { self.procs.contains_key(&pid) }

    pub fn len(&self) -> usize { self.procs.len() }

    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.procs.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> { self.procs.values() }

    /// True while the token still names the same incarnation of the
    /// pid.
    pub fn token_valid(&self, token: CallbackToken) -> bool {
        self.procs
            .get(&token.pid)
            .map(|p| p.start_time == token.start_time)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bounds() {
        let mut pool = OpenFilePool::new();
        let id = pool
            .alloc(OpenFile {
                offset: 0,
                mode: FileMode::READ,
                handle: None,
                dev: DeviceKind::Console,
            })
            .unwrap();
        assert_eq!(pool.in_use(), 1);
        assert!(pool.free(id).is_some());
        assert_eq!(pool.in_use(), 0);
        // Freeing twice yields nothing.
        assert!(pool.free(id).is_none());
    }

    #[test]
    fn test_pid_recycling() {
        let mut table = ProcessTable::new();
        let a = table.alloc_pid().unwrap();
        let b = table.alloc_pid().unwrap();
        // No insertion happened, so pids advance but never collide with
        // live entries; zero is never handed out.
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_epoch_monotonic() {
        let mut table = ProcessTable::new();
        let t1 = table.next_start_time();
        let t2 = table.next_start_time();
        assert!(t2 > t1);
    }
}
