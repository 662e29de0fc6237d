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

//! The SOS client ABI: syscall numbers, file modes, the message-register
//! wire format, and the process-status record.
//!
//! Calls arrive with the syscall number in MR0 and per-call arguments in
//! the following registers; string arguments are packed big-endian four
//! bytes per word and NUL terminated within the register stream. Replies
//! carry the return value in MR0 (64-bit results split across MR0/MR1)
//! under a fault-free label, or a positive errno in MR0 under
//! UserException.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod msg;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallstr::SmallString;

pub const MAX_FILE_PATH_LENGTH: usize = 255;
pub const FD_TABLE_SIZE: usize = 1024;
pub const OPEN_FILE_POOL_SIZE: usize = 1024;
pub const COMMAND_NAME_LENGTH: usize = 32;

pub const STDOUT_FD: usize = 1;
pub const STDERR_FD: usize = 2;
/// Per-process fd holding the executable image for demand loading.
pub const BINARY_FD: usize = 3;

/// Name routed to the serial device at open time.
pub const CONSOLE_NAME: &str = "console";

// First message register of the string argument, per call.
pub const OPEN_MESSAGE_START: usize = 2;
pub const STAT_MESSAGE_START: usize = 2;
pub const PROC_CREATE_MESSAGE_START: usize = 1;

/// File path buffer, inline up to typical path lengths.
pub type PathString = SmallString<[u8; 64]>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    Brk = 3,
    Usleep = 4,
    Timestamp = 5,
    Open = 6,
    Read = 7,
    Write = 8,
    GetDirEnt = 9,
    Stat = 10,
    Close = 11,
    ProcCreate = 12,
    GetPid = 13,
    WaitPid = 14,
    ProcDelete = 15,
    ProcStatus = 16,
}

bitflags! {
    /// Open/access mode bits, POSIX-shaped.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

impl Default for FileMode {
    fn default() -> Self { FileMode::empty() }
}

/// File attributes as packed into a STAT reply (five little-endian
/// 32-bit fields).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    pub st_type: u32,
    pub st_fmode: u32,
    pub st_size: u32,
    pub st_ctime: u32,
    pub st_atime: u32,
}

impl FileStat {
    pub const PACKED_SIZE: usize = 20;

    pub fn pack(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.st_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.st_fmode.to_le_bytes());
        out[8..12].copy_from_slice(&self.st_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.st_ctime.to_le_bytes());
        out[16..20].copy_from_slice(&self.st_atime.to_le_bytes());
    }
}

/// Packed process-status record returned by PROC_STATUS.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcStatus {
    pub pid: u32,
    pub size_pages: u32,
    pub stime_ms: u32,
    pub command: [u8; COMMAND_NAME_LENGTH],
}

impl ProcStatus {
    pub const PACKED_SIZE: usize = 12 + COMMAND_NAME_LENGTH;

    pub fn new(pid: u32, size_pages: u32, stime_ms: u32, name: &str) -> Self {
        let mut command = [0u8; COMMAND_NAME_LENGTH];
        let n = name.len().min(COMMAND_NAME_LENGTH - 1);
        command[..n].copy_from_slice(&name.as_bytes()[..n]);
        ProcStatus {
            pid,
            size_pages,
            stime_ms,
            command,
        }
    }

    pub fn pack(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..8].copy_from_slice(&self.size_pages.to_le_bytes());
        out[8..12].copy_from_slice(&self.stime_ms.to_le_bytes());
        out[12..Self::PACKED_SIZE].copy_from_slice(&self.command);
    }

    pub fn unpack(bytes: &[u8]) -> Self {
        let mut command = [0u8; COMMAND_NAME_LENGTH];
        command.copy_from_slice(&bytes[12..Self::PACKED_SIZE]);
        ProcStatus {
            pid: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            size_pages: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            stime_ms: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            command,
        }
    }

    pub fn command_str(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_NAME_LENGTH);
        core::str::from_utf8(&self.command[..end]).unwrap_or("?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers() {
        assert_eq!(SyscallNumber::try_from(3), Ok(SyscallNumber::Brk));
        assert_eq!(SyscallNumber::try_from(16), Ok(SyscallNumber::ProcStatus));
        assert!(SyscallNumber::try_from(2).is_err());
        assert!(SyscallNumber::try_from(17).is_err());
        let n: usize = SyscallNumber::Open.into();
        assert_eq!(n, 6);
    }

    #[test]
    fn test_proc_status_roundtrip() {
        let status = ProcStatus::new(7, 42, 1234, "sosh");
        let mut buf = [0u8; ProcStatus::PACKED_SIZE];
        status.pack(&mut buf);
        let back = ProcStatus::unpack(&buf);
        assert_eq!(back, status);
        assert_eq!(back.command_str(), "sosh");
    }

    #[test]
    fn test_proc_status_name_truncates() {
        let long = "a-command-name-well-beyond-thirty-two-bytes";
        let status = ProcStatus::new(1, 0, 0, long);
        // NUL-terminated within the fixed field.
        assert_eq!(status.command[COMMAND_NAME_LENGTH - 1], 0);
        assert_eq!(status.command_str().len(), COMMAND_NAME_LENGTH - 1);
    }
}
