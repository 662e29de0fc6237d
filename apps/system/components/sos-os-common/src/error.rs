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

//! System-wide error kinds.
//!
//! Errors surfaced to a client travel as a positive errno in MR0 of a
//! UserException reply. Fatal kinds never reach a reply; the owning
//! process is deleted instead (see the server's dispatch policy).

use crate::Word;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SosError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    Busy,
    FaultOutsideRegion,
    SwapIoFailure,
    RemoteIoFailure,
    /// The process acted on no longer exists (recycled pid, or deleted
    /// mid-operation). Dispatchers treat this as "already handled": no
    /// reply is owed.
    ProcessGone,
}

impl SosError {
    /// POSIX errno for the UserException reply path.
    pub fn errno(&self) -> Word {
        match self {
            SosError::OutOfMemory => 12,       // ENOMEM
            SosError::InvalidArgument => 22,   // EINVAL
            SosError::PermissionDenied => 13,  // EACCES
            SosError::NotFound => 2,           // ENOENT
            SosError::Busy => 16,              // EBUSY
            SosError::FaultOutsideRegion => 14, // EFAULT
            SosError::SwapIoFailure => 5,      // EIO
            SosError::RemoteIoFailure => 5,    // EIO
            SosError::ProcessGone => 3,        // ESRCH
        }
    }
}
