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

//! Opaque kernel handles and access rights.

use bitflags::bitflags;

/// A capability slot token. Capabilities are owned by exactly one
/// structure at a time; the owner is responsible for revoke/delete on
/// its drop path.
pub type CPtr = usize;

/// The null capability.
pub const CAP_NULL: CPtr = 0;

/// A physical address handed out by the untyped-memory arena.
pub type Paddr = usize;

bitflags! {
    /// Access rights for regions and page mappings.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CapRights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl CapRights {
    pub const RW: CapRights = CapRights::READ.union(CapRights::WRITE);
}
