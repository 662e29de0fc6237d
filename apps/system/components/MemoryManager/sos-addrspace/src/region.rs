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

//! Memory regions: half-open virtual-address ranges with uniform
//! rights. ELF-backed regions carry the file offset their contents are
//! demand-loaded from.

use sos_os_common::caps::CapRights;

pub type RegionId = usize;

#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub start: usize,
    pub end: usize, // exclusive
    pub rights: CapRights,
    /// File offset of the backing ELF segment, if any. Heap, stack and
    /// the IPC buffer have none.
    pub elf_offset: Option<usize>,
}

impl Region {
    pub fn contains(&self, vaddr: usize) -> bool { vaddr >= self.start && vaddr < self.end }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end && self.start < end
    }
}
